use crate::aggregate::AggregateWindow;
use crate::error::{AppError, Result};
use crate::row::MeterId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use std::collections::{BTreeMap, HashMap};

pub type DbPool = Pool<Postgres>;

const TABLE: &str = "energy_windows";
const KEY: [&str; 2] = ["meter_id", "window_start"];
const COLUMNS: [&str; 13] = [
    "meter_id",
    "window_start",
    "window_end",
    "energy_wh_sum",
    "power_w_avg",
    "voltage_v_avg",
    "current_a_avg",
    "power_factor_avg",
    "frequency_hz_avg",
    "cumulative_energy_wh_end",
    "sample_count",
    "last_sample_at",
    "complete",
];

/// Destination of closed windows. Writes are idempotent per `(meter_id, window_start)`.
#[async_trait]
pub trait WindowSink: Send + Sync {
    async fn upsert(&self, windows: &[AggregateWindow]) -> Result<()>;
}

pub async fn connect(url: &str) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await?;
    Ok(pool)
}

pub struct PgWindowStore {
    pool: DbPool,
}

impl PgWindowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS energy_windows (
                meter_id TEXT NOT NULL,
                window_start TIMESTAMPTZ NOT NULL,
                window_end TIMESTAMPTZ NOT NULL,
                energy_wh_sum DOUBLE PRECISION NOT NULL,
                power_w_avg DOUBLE PRECISION NOT NULL,
                voltage_v_avg DOUBLE PRECISION NOT NULL,
                current_a_avg DOUBLE PRECISION NOT NULL,
                power_factor_avg DOUBLE PRECISION NOT NULL,
                frequency_hz_avg DOUBLE PRECISION NOT NULL,
                cumulative_energy_wh_end DOUBLE PRECISION NOT NULL,
                sample_count BIGINT NOT NULL,
                last_sample_at TIMESTAMPTZ NOT NULL,
                complete BOOLEAN NOT NULL,
                PRIMARY KEY (meter_id, window_start)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// End of the newest complete window per meter; aggregation resumes there.
    pub async fn latest_window_ends(&self) -> Result<HashMap<MeterId, DateTime<Utc>>> {
        let rows = sqlx::query(
            "SELECT meter_id, MAX(window_end) AS last_end FROM energy_windows
             WHERE complete GROUP BY meter_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let meter_id: String = row.try_get("meter_id")?;
            let last_end: DateTime<Utc> = row.try_get("last_end")?;
            out.insert(meter_id, last_end);
        }
        Ok(out)
    }

    /// Windows flushed at shutdown before they were complete, oldest first.
    pub async fn partial_windows(&self) -> Result<Vec<AggregateWindow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE NOT complete ORDER BY window_start",
            COLUMNS.join(", "),
            TABLE
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(decode_window).collect()
    }
}

fn decode_window(row: &PgRow) -> Result<AggregateWindow> {
    Ok(AggregateWindow {
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        meter_id: row.try_get("meter_id")?,
        energy_wh_sum: row.try_get("energy_wh_sum")?,
        power_w_avg: row.try_get("power_w_avg")?,
        voltage_v_avg: row.try_get("voltage_v_avg")?,
        current_a_avg: row.try_get("current_a_avg")?,
        power_factor_avg: row.try_get("power_factor_avg")?,
        frequency_hz_avg: row.try_get("frequency_hz_avg")?,
        cumulative_energy_wh_end: row.try_get("cumulative_energy_wh_end")?,
        sample_count: row.try_get("sample_count")?,
        last_sample_at: row.try_get("last_sample_at")?,
        complete: row.try_get("complete")?,
    })
}

#[async_trait]
impl WindowSink for PgWindowStore {
    async fn upsert(&self, windows: &[AggregateWindow]) -> Result<()> {
        let batch = dedupe(windows);
        if batch.is_empty() {
            return Ok(());
        }
        let sql = upsert_sql(batch.len());
        let mut q = sqlx::query(&sql);
        for w in batch {
            q = q
                .bind(&w.meter_id)
                .bind(w.window_start)
                .bind(w.window_end)
                .bind(w.energy_wh_sum)
                .bind(w.power_w_avg)
                .bind(w.voltage_v_avg)
                .bind(w.current_a_avg)
                .bind(w.power_factor_avg)
                .bind(w.frequency_hz_avg)
                .bind(w.cumulative_energy_wh_end)
                .bind(w.sample_count)
                .bind(w.last_sample_at)
                .bind(w.complete);
        }
        q.execute(&self.pool)
            .await
            .map_err(|e| AppError::SinkWrite(e.to_string()))?;
        Ok(())
    }
}

/// One row per key, the last occurrence winning. Postgres refuses an upsert
/// that touches the same row twice in one statement.
pub fn dedupe(windows: &[AggregateWindow]) -> Vec<&AggregateWindow> {
    let mut by_key: BTreeMap<(&str, DateTime<Utc>), &AggregateWindow> = BTreeMap::new();
    for w in windows {
        by_key.insert((w.meter_id.as_str(), w.window_start), w);
    }
    by_key.into_values().collect()
}

/// Multi-row `INSERT ... ON CONFLICT DO UPDATE` for `rows` windows.
pub fn upsert_sql(rows: usize) -> String {
    let mut values_placeholders: Vec<String> = Vec::with_capacity(rows);
    let mut arg_index = 1;
    for _ in 0..rows {
        let tuple: Vec<String> = (0..COLUMNS.len())
            .map(|i| format!("${}", arg_index + i))
            .collect();
        arg_index += COLUMNS.len();
        values_placeholders.push(format!("({})", tuple.join(", ")));
    }

    let update_cols: Vec<String> = COLUMNS
        .iter()
        .filter(|col| !KEY.contains(*col))
        .map(|col| format!("{} = EXCLUDED.{}", col, col))
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {}",
        TABLE,
        COLUMNS.join(", "),
        values_placeholders.join(", "),
        KEY.join(", "),
        update_cols.join(", ")
    )
}
