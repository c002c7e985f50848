use rand::Rng;
use serde::{Deserialize, Serialize};

/// Report published by the device on the telemetry topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub river_level: f64,
    pub tank1_level: f64,
    pub tank2_level: f64,
    pub rain_status: String,
    pub status: String,
    pub buzzer_state: bool,
    pub led_color: String,
    pub flow_rate1: f64,
    pub flow_rate2: f64,
    pub valve1_state: u8,
    pub valve2_state: u8,
}

const RIVER_BASE: f64 = 120.0;
const RIVER_WARNING: f64 = 350.0;
const RIVER_CRITICAL: f64 = 500.0;
const TANK_CAPACITY: f64 = 400.0;
const PUMP_RATE: f64 = 15.0;

/// Crude physical model of the installation: rain raises the river, a high
/// river opens the valves into the tanks, and the pump drains the tanks.
#[derive(Debug, Clone)]
pub struct Installation {
    river_level: f64,
    tank1_level: f64,
    tank2_level: f64,
    raining: bool,
    manual_pump: bool,
    valve1_open: bool,
    valve2_open: bool,
    flow_rate1: f64,
    flow_rate2: f64,
}

impl Default for Installation {
    fn default() -> Self {
        Self {
            river_level: RIVER_BASE,
            tank1_level: 20.0,
            tank2_level: 20.0,
            raining: false,
            manual_pump: false,
            valve1_open: false,
            valve2_open: false,
            flow_rate1: 0.0,
            flow_rate2: 0.0,
        }
    }
}

impl Installation {
    /// Applies a manual pump command. Anything but `ON` returns the pump to
    /// automatic control.
    pub fn apply_command(&mut self, payload: &str) {
        self.manual_pump = payload.trim() == "ON";
    }

    pub fn manual_pump(&self) -> bool {
        self.manual_pump
    }

    pub fn step(&mut self, rng: &mut impl Rng, rain_probability: f64) {
        if rng.gen_bool(0.1) {
            self.raining = rng.gen_bool(probability(rain_probability));
        }

        if self.raining {
            self.river_level += rng.gen_range(5.0..25.0);
        } else {
            self.river_level -= (self.river_level - RIVER_BASE).max(0.0) * 0.05;
        }
        self.river_level = self.river_level.clamp(0.0, 650.0);

        self.valve1_open = self.river_level > RIVER_WARNING;
        self.valve2_open = self.river_level > RIVER_CRITICAL;
        self.flow_rate1 = if self.valve1_open { rng.gen_range(8.0..14.0) } else { 0.0 };
        self.flow_rate2 = if self.valve2_open { rng.gen_range(6.0..12.0) } else { 0.0 };

        self.tank1_level = (self.tank1_level + self.flow_rate1).min(TANK_CAPACITY);
        self.tank2_level = (self.tank2_level + self.flow_rate2).min(TANK_CAPACITY);

        if self.pumping() {
            self.tank1_level = (self.tank1_level - PUMP_RATE).max(0.0);
            self.tank2_level = (self.tank2_level - PUMP_RATE).max(0.0);
            self.river_level = (self.river_level - 2.0).max(0.0);
        }
    }

    fn pumping(&self) -> bool {
        self.manual_pump || self.tank1_level > TANK_CAPACITY * 0.75 || self.tank2_level > TANK_CAPACITY * 0.75
    }

    pub fn report(&self) -> Telemetry {
        let critical = self.river_level > RIVER_CRITICAL;
        let warning = self.river_level > RIVER_WARNING;

        let status = if self.manual_pump {
            "MANUAL PUMP ON".to_string()
        } else if critical {
            "CRITICAL - FLOOD".to_string()
        } else if self.pumping() {
            "PUMPING OUT".to_string()
        } else if warning {
            "FLOOD WARNING".to_string()
        } else {
            "NORMAL".to_string()
        };

        let led_color = if critical || warning {
            "RED"
        } else if self.pumping() {
            "BLUE"
        } else {
            "GREEN"
        };

        Telemetry {
            river_level: round1(self.river_level),
            tank1_level: round1(self.tank1_level),
            tank2_level: round1(self.tank2_level),
            rain_status: if self.raining { "RAINING" } else { "NORMAL" }.to_string(),
            status,
            buzzer_state: critical,
            led_color: led_color.to_string(),
            flow_rate1: round1(self.flow_rate1),
            flow_rate2: round1(self.flow_rate2),
            valve1_state: self.valve1_open as u8,
            valve2_state: self.valve2_open as u8,
        }
    }
}

/// Clamps a user-supplied chance into the range `gen_bool` accepts.
pub fn probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_manual_override_reported() {
        let mut installation = Installation::default();
        installation.apply_command("ON");
        let report = installation.report();
        assert!(report.status.contains("MANUAL"));

        installation.apply_command("OFF");
        assert!(!installation.manual_pump());
        installation.apply_command("garbage");
        assert!(!installation.manual_pump());
    }

    #[test]
    fn test_quiet_installation_reports_normal() {
        let report = Installation::default().report();
        assert_eq!(report.status, "NORMAL");
        assert_eq!(report.led_color, "GREEN");
        assert_eq!(report.rain_status, "NORMAL");
        assert!(!report.buzzer_state);
        assert_eq!(report.valve1_state, 0);
    }

    #[test]
    fn test_out_of_range_rain_probability_is_clamped() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut installation = Installation::default();

        for p in [5.0, -1.0, f64::NAN, f64::INFINITY] {
            for _ in 0..50 {
                installation.step(&mut rng, p);
            }
        }

        assert_eq!(probability(2.0), 1.0);
        assert_eq!(probability(-0.5), 0.0);
        assert_eq!(probability(f64::NAN), 0.0);
        assert_eq!(probability(0.4), 0.4);
    }

    #[test]
    fn test_sustained_rain_raises_alarm() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut installation = Installation {
            raining: true,
            ..Installation::default()
        };

        for _ in 0..200 {
            installation.step(&mut rng, 1.0);
        }

        let report = installation.report();
        assert_eq!(report.rain_status, "RAINING");
        assert!(report.river_level > RIVER_WARNING);
        assert_eq!(report.led_color, "RED");
        assert_eq!(report.valve1_state, 1);
    }
}
