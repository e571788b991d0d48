//! Power budget: the signed power available to allocate to charging
//!
//! Positive values are surplus that charging may take on, negative values
//! mean current charging has to shrink by that much.

use crate::loadpoint::AvailablePowerSources;
use crate::reasons::ReasonCollector;

/// Home battery readings that take part in the budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomeBatteryInputs {
    pub soc_percent: f64,
    /// Positive while charging
    pub power_w: f64,
    /// Static or dynamic minimum SoC to protect
    pub min_soc_percent: f64,
    pub max_charging_power_w: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetInputs {
    pub sources: AvailablePowerSources,
    pub averaged_overage_w: Option<f64>,
    pub inverter_power_w: Option<f64>,
    pub current_charging_power_w: f64,
    pub power_buffer_w: f64,
    pub home_battery: Option<HomeBatteryInputs>,
    pub max_inverter_ac_power_w: Option<f64>,
}

/// Compute the power to control.
///
/// Returns `None` when neither a grid overage reading nor an inverter reading
/// is available.
pub fn power_to_control(inputs: &BudgetInputs, reasons: &mut ReasonCollector) -> Option<f64> {
    let overage = inputs
        .averaged_overage_w
        .filter(|_| inputs.sources.grid_power_available);
    let inverter = inputs
        .inverter_power_w
        .filter(|_| inputs.sources.inverter_power_available);

    let mut budget = match (overage, inverter) {
        (Some(overage), _) => overage,
        (None, Some(inverter)) => inverter - inputs.current_charging_power_w,
        (None, None) => {
            reasons.add_global("No grid or inverter power reading available");
            return None;
        }
    };

    budget -= inputs.power_buffer_w;

    let mut reserved = 0.0;
    if let Some(battery) = inputs
        .home_battery
        .filter(|_| inputs.sources.home_battery_power_available)
    {
        if battery.soc_percent < battery.min_soc_percent {
            reserved = battery.max_charging_power_w;
            reasons.add_global(format!(
                "Reserving {:.0} W for the home battery (SoC {:.0}% below minimum {:.0}%)",
                reserved, battery.soc_percent, battery.min_soc_percent
            ));
        }
        // Power the battery takes beyond its reservation is available to cars
        budget += battery.power_w - reserved;
    }

    if let (Some(inverter), Some(max_ac)) = (inverter, inputs.max_inverter_ac_power_w)
        && inverter > max_ac
    {
        let reduction = (inverter - max_ac - reserved).max(0.0);
        if reduction > 0.0 {
            reasons.add_global(format!(
                "Inverter overloaded by {:.0} W, reducing charging power",
                inverter - max_ac
            ));
        }
        budget -= reduction;
    }

    Some(budget)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(grid: bool, inverter: bool, battery: bool) -> AvailablePowerSources {
        AvailablePowerSources {
            grid_power_available: grid,
            inverter_power_available: inverter,
            home_battery_power_available: battery,
        }
    }

    fn inputs() -> BudgetInputs {
        BudgetInputs {
            sources: sources(true, false, false),
            averaged_overage_w: Some(1500.0),
            inverter_power_w: None,
            current_charging_power_w: 4000.0,
            power_buffer_w: 100.0,
            home_battery: None,
            max_inverter_ac_power_w: None,
        }
    }

    #[test]
    fn overage_minus_buffer() {
        let mut reasons = ReasonCollector::new();
        assert_eq!(power_to_control(&inputs(), &mut reasons), Some(1400.0));
        assert!(reasons.is_empty());
    }

    #[test]
    fn inverter_minus_charging_without_grid_meter() {
        let mut reasons = ReasonCollector::new();
        let i = BudgetInputs {
            sources: sources(false, true, false),
            averaged_overage_w: None,
            inverter_power_w: Some(6000.0),
            ..inputs()
        };
        assert_eq!(power_to_control(&i, &mut reasons), Some(1900.0));
    }

    #[test]
    fn no_source_is_missing_data() {
        let mut reasons = ReasonCollector::new();
        let i = BudgetInputs {
            sources: sources(false, false, false),
            ..inputs()
        };
        assert_eq!(power_to_control(&i, &mut reasons), None);
        assert_eq!(reasons.global().len(), 1);
    }

    #[test]
    fn battery_draw_above_min_soc_is_freed() {
        let mut reasons = ReasonCollector::new();
        let i = BudgetInputs {
            sources: sources(true, false, true),
            home_battery: Some(HomeBatteryInputs {
                soc_percent: 60.0,
                power_w: 2000.0,
                min_soc_percent: 30.0,
                max_charging_power_w: 3000.0,
            }),
            ..inputs()
        };
        assert_eq!(power_to_control(&i, &mut reasons), Some(3400.0));
        assert!(reasons.is_empty());
    }

    #[test]
    fn reservation_is_counted_once() {
        let mut reasons = ReasonCollector::new();
        let i = BudgetInputs {
            sources: sources(true, true, true),
            averaged_overage_w: Some(1000.0),
            inverter_power_w: Some(9000.0),
            power_buffer_w: 200.0,
            home_battery: Some(HomeBatteryInputs {
                soc_percent: 20.0,
                power_w: 2000.0,
                min_soc_percent: 30.0,
                max_charging_power_w: 3000.0,
            }),
            max_inverter_ac_power_w: Some(8000.0),
            ..inputs()
        };
        // 1000 - 200 + (2000 - 3000); the 1000 W overload is covered by the
        // reservation and takes nothing more
        assert_eq!(power_to_control(&i, &mut reasons), Some(-200.0));
        assert_eq!(reasons.global().len(), 1);
    }

    #[test]
    fn overload_beyond_reservation_reduces_budget() {
        let mut reasons = ReasonCollector::new();
        let i = BudgetInputs {
            sources: sources(false, true, false),
            averaged_overage_w: None,
            inverter_power_w: Some(10_000.0),
            current_charging_power_w: 7000.0,
            power_buffer_w: 0.0,
            max_inverter_ac_power_w: Some(8000.0),
            ..inputs()
        };
        assert_eq!(power_to_control(&i, &mut reasons), Some(1000.0));
    }
}
