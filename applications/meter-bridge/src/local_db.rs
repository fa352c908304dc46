use crate::error::{AppError, Result};
use crate::row::{LoggedRow, MeterId};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

pub type LocalPool = Pool<Sqlite>;

/// Incremental reader over the logger's `readings` table.
///
/// Rows are returned in insertion order. The cursor is the `id` of the last
/// row handed out, so a row written late, e.g. replayed by the logger after a
/// failed write or stamped with an earlier timestamp than rows already read,
/// is still delivered. Per meter, insertion order is timestamp order.
pub struct LocalDbTail {
    pool: LocalPool,
    batch_size: u32,
    last_id: i64,
    from_ts_ms: i64,
}

impl LocalDbTail {
    pub async fn open(url: &str, batch_size: u32) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)?.read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Ok(Self::from_pool(pool, batch_size))
    }

    pub fn from_pool(pool: LocalPool, batch_size: u32) -> Self {
        Self {
            pool,
            batch_size,
            last_id: 0,
            from_ts_ms: i64::MIN,
        }
    }

    /// Skip rows stamped before `ts`.
    pub fn start_at(&mut self, ts: DateTime<Utc>) {
        self.from_ts_ms = ts.timestamp_millis();
    }

    pub async fn meters(&self) -> Result<Vec<MeterId>> {
        let rows = sqlx::query("SELECT DISTINCT meter_id FROM readings ORDER BY meter_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("meter_id").map_err(AppError::from))
            .collect()
    }

    pub async fn next_batch(&mut self) -> Result<Vec<LoggedRow>> {
        let rows = sqlx::query(
            "SELECT id, meter_id, ts_ms, voltage_v, current_a, active_power_w, power_factor,
                    frequency_hz, energy_wh_interval, cumulative_energy_wh
             FROM readings
             WHERE id > ? AND ts_ms >= ?
             ORDER BY id
             LIMIT ?",
        )
        .bind(self.last_id)
        .bind(self.from_ts_ms)
        .bind(self.batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        let batch = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
        if let Some(last) = rows.last() {
            self.last_id = last.try_get("id")?;
            debug!(count = batch.len(), last_id = self.last_id, "read rows from local store");
        }
        Ok(batch)
    }
}

fn decode_row(row: &SqliteRow) -> Result<LoggedRow> {
    let ts_ms: i64 = row.try_get("ts_ms")?;
    let timestamp = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .ok_or_else(|| AppError::Time(format!("ts_ms {} out of range", ts_ms)))?;
    Ok(LoggedRow {
        timestamp,
        meter_id: row.try_get("meter_id")?,
        voltage_v: row.try_get("voltage_v")?,
        current_a: row.try_get("current_a")?,
        active_power_w: row.try_get("active_power_w")?,
        power_factor: row.try_get("power_factor")?,
        frequency_hz: row.try_get("frequency_hz")?,
        energy_wh_interval: row.try_get("energy_wh_interval")?,
        cumulative_energy_wh: row.try_get("cumulative_energy_wh")?,
    })
}

/// Where tailing may start without missing an unclosed window: the earliest
/// stored window end across all local meters, or the beginning of the log when
/// some local meter has nothing stored remotely yet.
pub fn resume_point(local_meters: &[MeterId], stored_ends: &HashMap<MeterId, DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let mut earliest: Option<DateTime<Utc>> = None;
    for meter in local_meters {
        let end = *stored_ends.get(meter)?;
        earliest = Some(earliest.map_or(end, |e| e.min(end)));
    }
    earliest
}
