use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

pub type MeterId = String;

/// A row of the logger's ledger as seen by the bridge. Only the fields the
/// aggregation needs are kept; anything else on the wire is ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRow {
    pub timestamp: DateTime<Utc>,
    pub meter_id: MeterId,
    pub voltage_v: f64,
    pub current_a: f64,
    pub active_power_w: f64,
    pub power_factor: f64,
    pub frequency_hz: f64,
    pub energy_wh_interval: f64,
    pub cumulative_energy_wh: f64,
}

#[derive(Deserialize)]
struct WireRow {
    timestamp: Value,
    meter_id: Value,
    voltage_v: f64,
    current_a: f64,
    active_power_w: f64,
    power_factor: f64,
    frequency_hz: f64,
    energy_wh_interval: f64,
    cumulative_energy_wh: f64,
}

impl LoggedRow {
    /// Decode a JSON payload as published by the logger.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        let wire: WireRow = serde_json::from_slice(payload)?;
        let meter_id = match wire.meter_id {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => return Err(AppError::Other(anyhow::anyhow!("meter_id must be a string or number, got {}", other))),
        };
        Ok(Self {
            timestamp: parse_timestamp(&wire.timestamp)?,
            meter_id,
            voltage_v: wire.voltage_v,
            current_a: wire.current_a,
            active_power_w: wire.active_power_w,
            power_factor: wire.power_factor,
            frequency_hz: wire.frequency_hz,
            energy_wh_interval: wire.energy_wh_interval,
            cumulative_energy_wh: wire.cumulative_energy_wh,
        })
    }
}

/// RFC 3339 strings, offset-less ISO 8601 strings (taken as UTC) and Unix
/// milliseconds are accepted.
pub fn parse_timestamp(v: &Value) -> Result<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
                .map_err(|e| AppError::Time(format!("iso8601 parse '{}': {}", s, e)))
        }
        Value::Number(n) => {
            let ms = n
                .as_i64()
                .ok_or_else(|| AppError::Time("unix_ms not i64".into()))?;
            Utc.timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| AppError::Time("unix_ms out of range".into()))
        }
        other => Err(AppError::Time(format!("unsupported timestamp {}", other))),
    }
}
