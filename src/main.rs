use anyhow::{Context, Result};
use heliocharge::driver::{ChargeEngine, Collaborators, DriverCommand};
use heliocharge::{Config, StateStore};
use tokio::sync::mpsc;
use tracing::{error, info};

fn collaborators(config: &Config) -> Result<Collaborators> {
    #[allow(unused_mut)]
    let mut collaborators = Collaborators::dry_run(config);

    #[cfg(feature = "tibber")]
    if config.tibber.enabled {
        let provider = heliocharge::tibber::TibberPriceProvider::new(&config.tibber)
            .context("Failed to create Tibber price provider")?;
        collaborators.prices = std::sync::Arc::new(provider);
    }

    Ok(collaborators)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    heliocharge::logging::init_logging(&config.logging)
        .context("Failed to initialize logging")?;

    info!(
        "Heliocharge {} starting with {} car(s) and {} connector(s)",
        env!("APP_VERSION"),
        config.cars.len(),
        config.connectors.len()
    );

    let store = StateStore::from_config(&config);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<DriverCommand>();
    let mut engine = ChargeEngine::new(
        config.clone(),
        store.clone(),
        collaborators(&config)?,
        cmd_rx,
    )
    .context("Failed to create charging engine")?;
    let shutdown = engine.shutdown_token();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    #[cfg(feature = "web")]
    let web_task = config.web.enabled.then(|| {
        let state = heliocharge::web::AppState {
            store,
            snapshot: engine.subscribe_snapshot(),
            commands: cmd_tx.clone(),
        };
        let (host, port) = (config.web.host.clone(), config.web.port);
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = heliocharge::web::serve(state, &host, port, token).await {
                error!("Web server error: {}", e);
            }
        })
    });
    #[cfg(not(feature = "web"))]
    let _ = (store, &cmd_tx);

    let result = engine.run().await;

    #[cfg(feature = "web")]
    if let Some(task) = web_task {
        shutdown.cancel();
        task.await.ok();
    }

    match result {
        Ok(()) => {
            info!("Engine shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Engine failed with error: {}", e);
            Err(e.into())
        }
    }
}
