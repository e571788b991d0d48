use super::*;

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/heliocharge.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8089,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 30_000,
            nominal_voltage: 230.0,
            power_buffer_w: 0.0,
            overage_average_seconds: 60,
            switch_on_delay_seconds: 60,
            switch_off_delay_seconds: 300,
            switch_on_offset_w: 0.0,
            switch_off_offset_w: 0.0,
            phase_hysteresis_w: 300.0,
            phase_switch_cooldown_seconds: 600,
            current_update_threshold_a: 1.0,
        }
    }
}

impl Default for ChargingConfig {
    fn default() -> Self {
        Self {
            charge_loss_percent: 10.0,
            use_solar_prediction: true,
            use_price_optimization: false,
            switch_bridge_minutes: 20,
            forecast_horizon_hours: 48,
        }
    }
}

impl Default for HomeBatteryConfig {
    fn default() -> Self {
        Self {
            usable_energy_wh: None,
            max_charging_power_w: None,
            min_soc_percent: None,
            dynamic_min_soc: false,
            max_dynamic_min_soc_percent: 80.0,
            dynamic_min_soc_buffer_percent: 10.0,
            force_full_by_sunset: false,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            latitude: None,
            longitude: None,
            home_radius_m: 100.0,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            static_grid_price: 0.25,
        }
    }
}

impl Default for TibberConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            enabled: false,
            home_id: String::new(),
            api_url: "https://api.tibber.com/v1-beta/gql".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            web: WebConfig::default(),
            control: ControlConfig::default(),
            charging: ChargingConfig::default(),
            home_battery: HomeBatteryConfig::default(),
            inverter: InverterConfig::default(),
            location: LocationConfig::default(),
            pricing: PricingConfig::default(),
            tibber: TibberConfig::default(),
            cars: Vec::new(),
            connectors: Vec::new(),
            timezone: "UTC".to_string(),
        }
    }
}
