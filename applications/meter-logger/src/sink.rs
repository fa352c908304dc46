//! Durable local log of accepted rows.
//!
//! Rows are appended to the `readings` table of a SQLite file, unique per
//! `(meter_id, ts_ms)`. The `id` column numbers rows in insertion order, which
//! is the order the bridge's local-database mode reads them in. The same table
//! seeds the accrual ledger after a restart.

use crate::error::{AppError, Result};
use crate::reading::{EnergyState, LoggedRow, MeterId};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use tracing::{debug, error, warn};

pub type LocalPool = Pool<Sqlite>;

#[async_trait]
pub trait LocalSink: Send + Sync {
    async fn append(&self, row: &LoggedRow) -> Result<()>;
}

pub async fn connect(url: &str) -> Result<LocalPool> {
    let opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    // a single connection keeps `sqlite::memory:` databases alive and writes serialized
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

pub struct SqliteSink {
    pool: LocalPool,
}

impl SqliteSink {
    pub fn new(pool: LocalPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &LocalPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                meter_id TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                voltage_v REAL NOT NULL,
                current_a REAL NOT NULL,
                active_power_w REAL NOT NULL,
                power_factor REAL NOT NULL,
                frequency_hz REAL NOT NULL,
                energy_register_kwh REAL,
                energy_wh_interval REAL NOT NULL,
                cumulative_energy_wh REAL NOT NULL,
                UNIQUE (meter_id, ts_ms)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Ledger position of every meter as of its newest persisted row.
    pub async fn latest_states(&self) -> Result<HashMap<MeterId, EnergyState>> {
        let rows = sqlx::query(
            "SELECT r.meter_id, r.ts_ms, r.cumulative_energy_wh
             FROM readings r
             WHERE r.ts_ms = (SELECT MAX(ts_ms) FROM readings WHERE meter_id = r.meter_id)",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut states = HashMap::with_capacity(rows.len());
        for row in rows {
            let meter_id: String = row.try_get("meter_id")?;
            let ts_ms: i64 = row.try_get("ts_ms")?;
            let cumulative_energy_wh: f64 = row.try_get("cumulative_energy_wh")?;
            let Some(last_timestamp) = Utc.timestamp_millis_opt(ts_ms).single() else {
                warn!(meter_id = %meter_id, ts_ms, "unrepresentable timestamp in local store; not seeding");
                continue;
            };
            states.insert(
                meter_id,
                EnergyState {
                    cumulative_energy_wh,
                    last_timestamp,
                },
            );
        }
        Ok(states)
    }
}

#[async_trait]
impl LocalSink for SqliteSink {
    async fn append(&self, row: &LoggedRow) -> Result<()> {
        let r = &row.reading;
        sqlx::query(
            "INSERT INTO readings (
                meter_id, ts_ms, timestamp, voltage_v, current_a, active_power_w,
                power_factor, frequency_hz, energy_register_kwh,
                energy_wh_interval, cumulative_energy_wh
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (meter_id, ts_ms) DO NOTHING",
        )
        .bind(&r.meter_id)
        .bind(r.timestamp.timestamp_millis())
        .bind(r.timestamp.to_rfc3339())
        .bind(r.voltage_v)
        .bind(r.current_a)
        .bind(r.active_power_w)
        .bind(r.power_factor)
        .bind(r.frequency_hz)
        .bind(r.energy_register_kwh)
        .bind(row.energy_wh_interval)
        .bind(row.cumulative_energy_wh)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::SinkWrite(e.to_string()))?;
        Ok(())
    }
}

/// Keeps rows the sink refused and replays them, oldest first, before newer ones.
///
/// The queue is bounded; once full the oldest pending row is discarded.
pub struct BufferedSink<S> {
    sink: S,
    pending: VecDeque<LoggedRow>,
    capacity: usize,
}

impl<S: LocalSink> BufferedSink<S> {
    pub fn new(sink: S, capacity: usize) -> Self {
        Self {
            sink,
            pending: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn inner(&self) -> &S {
        &self.sink
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub async fn write(&mut self, row: LoggedRow) -> Result<()> {
        if self.pending.len() >= self.capacity {
            if let Some(dropped) = self.pending.pop_front() {
                error!(
                    meter_id = %dropped.reading.meter_id,
                    ts = %dropped.reading.timestamp,
                    "local store backlog full; dropping oldest row"
                );
            }
        }
        self.pending.push_back(row);
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<()> {
        while let Some(row) = self.pending.front() {
            if let Err(e) = self.sink.append(row).await {
                warn!(pending = self.pending.len(), error = %e, "local store write failed; keeping rows");
                return Err(e);
            }
            self.pending.pop_front();
        }
        debug!("local store up to date");
        Ok(())
    }
}
