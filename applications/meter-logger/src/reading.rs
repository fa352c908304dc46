use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MeterId = String;

/// One calibrated poll result for a single meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub meter_id: MeterId,
    pub voltage_v: f64,
    pub current_a: f64,
    pub active_power_w: f64,
    pub power_factor: f64,
    pub frequency_hz: f64,
    /// The meter's own energy counter. Logged for reference, never used for accrual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_register_kwh: Option<f64>,
}

/// A reading accepted into the ledger, as persisted locally and relayed downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedRow {
    #[serde(flatten)]
    pub reading: Reading,
    pub energy_wh_interval: f64,
    pub cumulative_energy_wh: f64,
}

/// Ledger position of one meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyState {
    pub cumulative_energy_wh: f64,
    pub last_timestamp: DateTime<Utc>,
}
