use heliocharge::ChargeMode;
use heliocharge::config::{CarConfig, Config, ConnectorConfig};
use heliocharge::error::HelioError;

fn car(id: u32) -> CarConfig {
    CarConfig {
        id,
        name: format!("car {}", id),
        vin: None,
        usable_energy_kwh: Some(58.0),
        min_current: Some(6.0),
        max_current: Some(16.0),
        max_phases: Some(3),
        priority: 1,
        charge_mode: ChargeMode::Auto,
        manage_by_car: false,
        charging_targets: Vec::new(),
    }
}

fn connector(id: u32) -> ConnectorConfig {
    ConnectorConfig {
        id,
        name: format!("wallbox {}", id),
        min_current: 6.0,
        max_current: 32.0,
        connected_phases: 3,
        can_switch_phases: true,
        priority: 2,
        charge_mode: ChargeMode::PvOnly,
        paired_car_id: None,
    }
}

fn validation_field(cfg: &Config) -> String {
    match cfg.validate() {
        Err(HelioError::Validation { field, .. }) => field,
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("config.yaml");

    let mut cfg = Config::default();
    cfg.cars.push(car(1));
    cfg.connectors.push(connector(7));
    cfg.home_battery.usable_energy_wh = Some(10_000.0);
    cfg.logging.file = path.with_extension("log").to_string_lossy().to_string();

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.cars.len(), 1);
    assert_eq!(loaded.cars[0].usable_energy_kwh, Some(58.0));
    assert_eq!(loaded.connectors[0].charge_mode, ChargeMode::PvOnly);
    assert_eq!(loaded.home_battery.usable_energy_wh, Some(10_000.0));
    assert_eq!(loaded.logging.file, cfg.logging.file);
    loaded.validate().unwrap();
}

#[test]
fn partial_yaml_uses_defaults() {
    let yaml = r#"
control:
  tick_interval_ms: 10000
cars:
  - id: 3
    usable_energy_kwh: 77
    charge_mode: max_power
"#;
    let cfg: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(cfg.control.tick_interval_ms, 10_000);
    assert_eq!(cfg.control.nominal_voltage, 230.0);
    assert_eq!(cfg.cars[0].charge_mode, ChargeMode::MaxPower);
    assert!(cfg.cars[0].charging_targets.is_empty());
    assert!(cfg.validate().is_ok());
}

#[test]
fn missing_file_is_an_io_error() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let err = Config::from_file(tmp_dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, HelioError::Io { .. }));
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();
    cfg.control.tick_interval_ms = 0;
    assert_eq!(validation_field(&cfg), "control.tick_interval_ms");

    let mut cfg = Config::default();
    cfg.charging.charge_loss_percent = 100.0;
    assert_eq!(validation_field(&cfg), "charging.charge_loss_percent");

    let mut cfg = Config::default();
    cfg.home_battery.min_soc_percent = Some(40.0);
    cfg.home_battery.dynamic_min_soc = true;
    cfg.home_battery.max_dynamic_min_soc_percent = 30.0;
    assert_eq!(validation_field(&cfg), "home_battery.max_dynamic_min_soc_percent");

    let mut cfg = Config::default();
    cfg.timezone = "Mars/Olympus".to_string();
    assert_eq!(validation_field(&cfg), "timezone");

    let mut cfg = Config::default();
    cfg.cars = vec![car(1), car(1)];
    assert_eq!(validation_field(&cfg), "cars.id");

    let mut cfg = Config::default();
    let mut wallbox = connector(1);
    wallbox.connected_phases = 4;
    cfg.connectors.push(wallbox);
    assert_eq!(validation_field(&cfg), "connectors.connected_phases");

    let mut cfg = Config::default();
    let mut wallbox = connector(1);
    wallbox.paired_car_id = Some(9);
    cfg.connectors.push(wallbox);
    assert_eq!(validation_field(&cfg), "connectors.paired_car_id");
}
