use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Age past which the latest sample no longer counts as a live device.
pub const DEFAULT_STALENESS_THRESHOLD_MS: u64 = 15_000;

/// Command type that switches the pump into manual override.
pub const PUMP_ON: &str = "PUMP_ON";
pub const PUMP_OFF: &str = "PUMP_OFF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RainStatus {
    Normal,
    Raining,
}

impl RainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RainStatus::Normal => "NORMAL",
            RainStatus::Raining => "RAINING",
        }
    }
}

impl FromStr for RainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NORMAL" => Ok(RainStatus::Normal),
            "RAINING" => Ok(RainStatus::Raining),
            other => Err(format!("unknown rain status {:?}", other)),
        }
    }
}

/// Indicator light colour. Some firmware revisions report the green
/// "all clear" light as `NORMAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LedColor {
    Red,
    Blue,
    #[serde(alias = "NORMAL")]
    Green,
}

impl LedColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedColor::Red => "RED",
            LedColor::Blue => "BLUE",
            LedColor::Green => "GREEN",
        }
    }
}

impl FromStr for LedColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RED" => Ok(LedColor::Red),
            "BLUE" => Ok(LedColor::Blue),
            "GREEN" | "NORMAL" => Ok(LedColor::Green),
            other => Err(format!("unknown led color {:?}", other)),
        }
    }
}

/// One report from the flood-control device, as published on the telemetry topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub river_level: f64,
    pub tank1_level: f64,
    pub tank2_level: f64,
    pub rain_status: RainStatus,
    pub status: String,
    pub buzzer_state: bool,
    pub led_color: LedColor,
    pub flow_rate1: f64,
    pub flow_rate2: f64,
    pub valve1_state: f64,
    pub valve2_state: f64,
}

impl TelemetrySample {
    pub fn is_raining(&self) -> bool {
        self.rain_status == RainStatus::Raining
    }

    /// The device reports the pump running either under manual override
    /// or while draining the tanks.
    pub fn pump_active(&self) -> bool {
        self.status.contains("MANUAL") || self.status.contains("PUMPING OUT")
    }

    pub fn critical(&self) -> bool {
        self.status.contains("FLOOD") || self.status.contains("CRITICAL")
    }

    pub fn valve1_open(&self) -> bool {
        self.valve1_state > 0.0
    }

    pub fn valve2_open(&self) -> bool {
        self.valve2_state > 0.0
    }
}

/// A sample as persisted in the log, with its server-assigned identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSample {
    pub id: i64,
    #[serde(flatten)]
    pub sample: TelemetrySample,
    pub created_at: DateTime<Utc>,
}

impl StoredSample {
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.created_at).num_milliseconds()
    }

    /// Online means the latest sample is younger than `threshold_ms`.
    pub fn is_online(&self, now: DateTime<Utc>, threshold_ms: u64) -> bool {
        self.age_ms(now) < i64::try_from(threshold_ms).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryState {
    #[default]
    Pending,
    Forwarded,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "PENDING",
            DeliveryState::Forwarded => "FORWARDED",
            DeliveryState::Failed => "FAILED",
        }
    }
}

impl FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DeliveryState::Pending),
            "FORWARDED" => Ok(DeliveryState::Forwarded),
            "FAILED" => Ok(DeliveryState::Failed),
            other => Err(format!("unknown delivery state {:?}", other)),
        }
    }
}

/// An operator command row from the command queue table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRow {
    pub id: i64,
    #[serde(default)]
    pub command_type: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_state: DeliveryState,
    #[serde(default)]
    pub forwarded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCommand {
    pub command_type: String,
}

/// Payload sent to the device on the manual pump topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceInstruction {
    On,
    Off,
}

impl DeviceInstruction {
    /// Only an exact `PUMP_ON` turns the pump on; everything else,
    /// including a missing value, falls back to `Off`.
    pub fn for_command(command_type: Option<&str>) -> Self {
        match command_type {
            Some(PUMP_ON) => DeviceInstruction::On,
            _ => DeviceInstruction::Off,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceInstruction::On => "ON",
            DeviceInstruction::Off => "OFF",
        }
    }
}

impl fmt::Display for DeviceInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// REST API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct TelemetryResponse {
    pub data: Vec<StoredSample>,
    pub total: usize,
    pub limit: usize,
}

/// Derived view of the latest sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub raining: bool,
    pub pump_active: bool,
    pub critical: bool,
    pub buzzer_on: bool,
    pub led_color: LedColor,
    pub valve1_open: bool,
    pub valve2_open: bool,
}

impl From<&TelemetrySample> for DeviceState {
    fn from(sample: &TelemetrySample) -> Self {
        Self {
            raining: sample.is_raining(),
            pump_active: sample.pump_active(),
            critical: sample.critical(),
            buzzer_on: sample.buzzer_state,
            led_color: sample.led_color,
            valve1_open: sample.valve1_open(),
            valve2_open: sample.valve2_open(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub age_ms: Option<i64>,
    pub staleness_threshold_ms: u64,
    pub broker: String,
    pub device: Option<DeviceState>,
}
