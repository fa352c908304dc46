//! Fixed-window roll-up of ledger rows.
//!
//! A window's energy is the plain sum of the interval energies of its rows,
//! never a difference of cumulative totals, so per-window sums always add up
//! to the ledger. Windows without rows produce nothing: a missing window
//! means "no data", not "no consumption".
//!
//! A window written at shutdown before its end was reached is marked
//! incomplete. On restart it is reopened with its stored totals, and the
//! rows that follow are added to it.

use crate::row::{LoggedRow, MeterId};
use crate::window::{Window, WindowSpec};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateWindow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub meter_id: MeterId,
    pub energy_wh_sum: f64,
    pub power_w_avg: f64,
    pub voltage_v_avg: f64,
    pub current_a_avg: f64,
    pub power_factor_avg: f64,
    pub frequency_hz_avg: f64,
    /// Ledger total at the last row of the window, for cross-checking only.
    pub cumulative_energy_wh_end: f64,
    pub sample_count: i64,
    /// Timestamp of the newest row included.
    pub last_sample_at: DateTime<Utc>,
    /// False when the window was flushed before its end was reached.
    pub complete: bool,
}

/// Summarise the rows of one meter that fall inside `window`. Rows outside it
/// are ignored; `None` when none are left.
pub fn roll_up(rows: &[LoggedRow], window: Window) -> Option<AggregateWindow> {
    let inside: Vec<&LoggedRow> = rows.iter().filter(|r| window.contains(r.timestamp)).collect();
    let last = inside.iter().max_by_key(|r| r.timestamp)?;

    let n = inside.len() as f64;
    let mean = |f: fn(&LoggedRow) -> f64| inside.iter().map(|r| f(r)).sum::<f64>() / n;

    Some(AggregateWindow {
        window_start: window.start,
        window_end: window.end,
        meter_id: last.meter_id.clone(),
        energy_wh_sum: inside.iter().map(|r| r.energy_wh_interval).sum(),
        power_w_avg: mean(|r| r.active_power_w),
        voltage_v_avg: mean(|r| r.voltage_v),
        current_a_avg: mean(|r| r.current_a),
        power_factor_avg: mean(|r| r.power_factor),
        frequency_hz_avg: mean(|r| r.frequency_hz),
        cumulative_energy_wh_end: last.cumulative_energy_wh,
        sample_count: inside.len() as i64,
        last_sample_at: last.timestamp,
        complete: true,
    })
}

/// Combine a stored partial window with the roll-up of the rows that came
/// after it. Averages are weighted by sample count.
pub fn merge(earlier: &AggregateWindow, later: &AggregateWindow) -> AggregateWindow {
    let n1 = earlier.sample_count as f64;
    let n2 = later.sample_count as f64;
    let mean = |a: f64, b: f64| (a * n1 + b * n2) / (n1 + n2);
    AggregateWindow {
        window_start: earlier.window_start,
        window_end: earlier.window_end,
        meter_id: earlier.meter_id.clone(),
        energy_wh_sum: earlier.energy_wh_sum + later.energy_wh_sum,
        power_w_avg: mean(earlier.power_w_avg, later.power_w_avg),
        voltage_v_avg: mean(earlier.voltage_v_avg, later.voltage_v_avg),
        current_a_avg: mean(earlier.current_a_avg, later.current_a_avg),
        power_factor_avg: mean(earlier.power_factor_avg, later.power_factor_avg),
        frequency_hz_avg: mean(earlier.frequency_hz_avg, later.frequency_hz_avg),
        cumulative_energy_wh_end: later.cumulative_energy_wh_end,
        sample_count: earlier.sample_count + later.sample_count,
        last_sample_at: later.last_sample_at.max(earlier.last_sample_at),
        complete: later.complete,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// Row added to the meter's open window.
    Buffered,
    /// Row opened a new window; the previous one is complete.
    Closed(AggregateWindow),
    /// Row belongs to a window that has already been closed, or was already
    /// counted in a reopened one.
    Late,
}

struct OpenWindow {
    window: Window,
    /// Totals stored before a restart.
    carried: Option<AggregateWindow>,
    rows: Vec<LoggedRow>,
}

impl OpenWindow {
    fn new(window: Window, row: LoggedRow) -> Self {
        Self {
            window,
            carried: None,
            rows: vec![row],
        }
    }
}

/// Per-meter window state. Each meter has at most one open window, and a
/// boundary before which rows are no longer accepted.
pub struct WindowAggregator {
    spec: WindowSpec,
    idle_close: Option<Duration>,
    open: BTreeMap<MeterId, OpenWindow>,
    closed_until: BTreeMap<MeterId, DateTime<Utc>>,
}

impl WindowAggregator {
    pub fn new(spec: WindowSpec, idle_close: Option<Duration>) -> Self {
        Self {
            spec,
            idle_close,
            open: BTreeMap::new(),
            closed_until: BTreeMap::new(),
        }
    }

    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    /// Treat everything before `boundary` as already closed for `meter_id`,
    /// typically the end of the newest complete window in the remote store.
    pub fn resume_from(&mut self, meter_id: impl Into<MeterId>, boundary: DateTime<Utc>) {
        let entry = self.closed_until.entry(meter_id.into()).or_insert(boundary);
        if boundary > *entry {
            *entry = boundary;
        }
    }

    /// Continue a window that was stored before it was complete. Rows up to
    /// its last sample are treated as already counted.
    pub fn reopen(&mut self, partial: AggregateWindow) {
        let meter_id = partial.meter_id.clone();
        if let Some(boundary) = self.closed_until(&meter_id) {
            if partial.window_end <= boundary {
                debug!(meter_id = %meter_id, window_start = %partial.window_start, "partial window already superseded");
                return;
            }
        }
        let window = self.spec.window_for(partial.window_start);
        if window.start != partial.window_start || window.end != partial.window_end {
            warn!(
                meter_id = %meter_id,
                window_start = %partial.window_start,
                window_end = %partial.window_end,
                "stored partial window does not match the window size; not reopened"
            );
            return;
        }
        info!(
            meter_id = %meter_id,
            window_start = %partial.window_start,
            samples = partial.sample_count,
            "reopening partial window"
        );
        self.resume_from(meter_id.clone(), partial.last_sample_at + Duration::nanoseconds(1));
        self.open.insert(
            meter_id,
            OpenWindow {
                window,
                carried: Some(partial),
                rows: Vec::new(),
            },
        );
    }

    pub fn closed_until(&self, meter_id: &str) -> Option<DateTime<Utc>> {
        self.closed_until.get(meter_id).copied()
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    pub fn push(&mut self, row: LoggedRow) -> Push {
        if let Some(boundary) = self.closed_until.get(&row.meter_id) {
            if row.timestamp < *boundary {
                warn!(
                    meter_id = %row.meter_id,
                    ts = %row.timestamp,
                    closed_until = %boundary,
                    "late row for a closed window; dropped"
                );
                return Push::Late;
            }
        }

        let window = self.spec.window_for(row.timestamp);
        match self.open.get_mut(&row.meter_id) {
            Some(open) if open.window == window => {
                open.rows.push(row);
                Push::Buffered
            }
            Some(open) if window.start < open.window.start => {
                // only reachable when rows of one meter arrive out of order
                warn!(meter_id = %row.meter_id, ts = %row.timestamp, "row older than open window; dropped");
                Push::Late
            }
            Some(_) => {
                let meter_id = row.meter_id.clone();
                let closed = self.close(&meter_id, true);
                self.open.insert(meter_id, OpenWindow::new(window, row));
                match closed {
                    Some(agg) => Push::Closed(agg),
                    None => Push::Buffered,
                }
            }
            None => {
                self.open.insert(row.meter_id.clone(), OpenWindow::new(window, row));
                Push::Buffered
            }
        }
    }

    /// Close windows whose end lies more than the idle grace period before `now`.
    /// Does nothing unless an idle grace period is configured.
    pub fn close_idle(&mut self, now: DateTime<Utc>) -> Vec<AggregateWindow> {
        let Some(grace) = self.idle_close else {
            return Vec::new();
        };
        let due: Vec<MeterId> = self
            .open
            .iter()
            .filter(|(_, o)| now >= o.window.end + grace)
            .map(|(id, _)| id.clone())
            .collect();
        due.iter().filter_map(|id| self.close(id, true)).collect()
    }

    /// Flush every open window regardless of time. The results are marked
    /// incomplete so that a later run can reopen them.
    pub fn drain(&mut self) -> Vec<AggregateWindow> {
        let ids: Vec<MeterId> = self.open.keys().cloned().collect();
        ids.iter().filter_map(|id| self.close(id, false)).collect()
    }

    fn close(&mut self, meter_id: &str, complete: bool) -> Option<AggregateWindow> {
        let open = self.open.remove(meter_id)?;
        self.resume_from(meter_id.to_string(), open.window.end);
        let agg = match (open.carried, roll_up(&open.rows, open.window)) {
            (Some(carried), Some(fresh)) => Some(merge(&carried, &fresh)),
            (carried, fresh) => carried.or(fresh),
        };
        agg.map(|mut a| {
            a.complete = complete;
            debug!(
                meter_id = %a.meter_id,
                window_start = %a.window_start,
                samples = a.sample_count,
                energy_wh = a.energy_wh_sum,
                complete,
                "window closed"
            );
            a
        })
    }
}
