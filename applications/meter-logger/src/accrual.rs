//! Energy accrual from instantaneous power.
//!
//! The meter's own energy register is not trusted. Instead every accepted
//! reading contributes `active_power_w × elapsed_hours`, where the elapsed time
//! is the real gap to the previous accepted reading of the same meter. Missed
//! polls and downtime therefore widen the next interval instead of losing
//! energy.
//!
//! The engine is owned by the single polling task of a transport; all
//! per-meter ledger state lives in one map and is only mutated through
//! [`AccrualEngine::accept`].

use crate::config::{AccrualConfig, ValidationConfig};
use crate::reading::{EnergyState, LoggedRow, MeterId, Reading};
use crate::validation::{validate, ValidationError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Why a reading was kept out of the ledger. The ledger is untouched in both cases.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("invalid reading from meter {meter_id}: {reason}")]
    Validation {
        meter_id: MeterId,
        reason: ValidationError,
    },
    #[error("out-of-order reading from meter {meter_id}: {got} is not after {last}")]
    OutOfOrder {
        meter_id: MeterId,
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },
}

/// Energy in Wh drawn at a constant `power_w` over `elapsed_ms`.
pub fn energy_wh(power_w: f64, elapsed_ms: i64) -> f64 {
    power_w * elapsed_ms as f64 / MS_PER_HOUR
}

#[derive(Debug, Clone)]
pub struct AccrualSettings {
    pub nominal_interval: ChronoDuration,
    pub gap_warn_factor: f64,
    pub max_gap: Option<ChronoDuration>,
}

impl AccrualSettings {
    pub fn new(interval_secs: u64, cfg: &AccrualConfig) -> Self {
        Self {
            nominal_interval: ChronoDuration::seconds(interval_secs as i64),
            gap_warn_factor: cfg.gap_warn_factor,
            max_gap: cfg.max_gap_secs.map(|s| ChronoDuration::seconds(s as i64)),
        }
    }
}

pub struct AccrualEngine {
    bounds: ValidationConfig,
    settings: AccrualSettings,
    states: HashMap<MeterId, EnergyState>,
}

impl AccrualEngine {
    pub fn new(bounds: ValidationConfig, settings: AccrualSettings) -> Self {
        Self {
            bounds,
            settings,
            states: HashMap::new(),
        }
    }

    /// Continue a meter's ledger from a known position, e.g. the last persisted row.
    pub fn seed(&mut self, meter_id: impl Into<MeterId>, state: EnergyState) {
        self.states.insert(meter_id.into(), state);
    }

    pub fn state(&self, meter_id: &str) -> Option<&EnergyState> {
        self.states.get(meter_id)
    }

    /// Validate a reading and, if it is acceptable, book its interval energy.
    pub fn accept(&mut self, reading: Reading) -> Result<LoggedRow, Rejection> {
        if let Err(reason) = validate(&self.bounds, &reading) {
            return Err(Rejection::Validation {
                meter_id: reading.meter_id,
                reason,
            });
        }

        let (energy_wh_interval, cumulative_energy_wh) =
            match self.states.entry(reading.meter_id.clone()) {
                Entry::Vacant(slot) => {
                    debug!(meter_id = %reading.meter_id, ts = %reading.timestamp, "seeding ledger");
                    slot.insert(EnergyState {
                        cumulative_energy_wh: 0.0,
                        last_timestamp: reading.timestamp,
                    });
                    (0.0, 0.0)
                }
                Entry::Occupied(mut slot) => {
                    let state = slot.get_mut();
                    if reading.timestamp <= state.last_timestamp {
                        return Err(Rejection::OutOfOrder {
                            meter_id: reading.meter_id,
                            last: state.last_timestamp,
                            got: reading.timestamp,
                        });
                    }
                    let gap = integrable_gap(
                        &self.settings,
                        &reading.meter_id,
                        reading.timestamp - state.last_timestamp,
                    );
                    let delta = energy_wh(reading.active_power_w, gap.num_milliseconds());
                    state.cumulative_energy_wh += delta;
                    state.last_timestamp = reading.timestamp;
                    (delta, state.cumulative_energy_wh)
                }
            };

        Ok(LoggedRow {
            reading,
            energy_wh_interval,
            cumulative_energy_wh,
        })
    }
}

fn integrable_gap(settings: &AccrualSettings, meter_id: &str, gap: ChronoDuration) -> ChronoDuration {
    let nominal_ms = settings.nominal_interval.num_milliseconds() as f64;
    if gap.num_milliseconds() as f64 > nominal_ms * settings.gap_warn_factor {
        warn!(
            meter_id = %meter_id,
            gap_secs = gap.num_seconds(),
            "integrating downtime gap"
        );
    }
    match settings.max_gap {
        Some(max) if gap > max => max,
        _ => gap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn reading(secs: i64, power: f64) -> Reading {
        Reading {
            timestamp: at(secs),
            meter_id: "1".into(),
            voltage_v: 230.0,
            current_a: power / 230.0,
            active_power_w: power,
            power_factor: 1.0,
            frequency_hz: 50.0,
            energy_register_kwh: None,
        }
    }

    fn engine() -> AccrualEngine {
        AccrualEngine::new(
            ValidationConfig::default(),
            AccrualSettings::new(5, &AccrualConfig::default()),
        )
    }

    #[test]
    fn test_first_reading_seeds_with_zero_interval() {
        let mut e = engine();
        let row = e.accept(reading(0, 500.0)).unwrap();
        assert_eq!(row.energy_wh_interval, 0.0);
        assert_eq!(row.cumulative_energy_wh, 0.0);
        assert_eq!(e.state("1").unwrap().last_timestamp, at(0));
    }

    #[test]
    fn test_worked_example_two_intervals() {
        let mut e = engine();
        e.accept(reading(0, 0.0)).unwrap();
        let r1 = e.accept(reading(5, 720.0)).unwrap();
        let r2 = e.accept(reading(10, 720.0)).unwrap();
        assert_eq!(r1.energy_wh_interval, 1.0);
        assert_eq!(r2.energy_wh_interval, 1.0);
        assert_eq!(r2.cumulative_energy_wh, 2.0);
    }

    #[test]
    fn test_long_gap_uses_actual_elapsed_time() {
        let mut e = engine();
        e.accept(reading(0, 0.0)).unwrap();
        e.accept(reading(10, 720.0)).unwrap();
        let row = e.accept(reading(310, 600.0)).unwrap();
        assert_eq!(row.energy_wh_interval, 50.0);
    }

    #[test]
    fn test_duplicate_and_stale_timestamps_rejected_without_mutation() {
        let mut e = engine();
        e.accept(reading(0, 100.0)).unwrap();
        e.accept(reading(5, 100.0)).unwrap();
        let before = *e.state("1").unwrap();

        for secs in [5, 3] {
            let err = e.accept(reading(secs, 100.0)).unwrap_err();
            assert!(matches!(err, Rejection::OutOfOrder { .. }));
            assert_eq!(*e.state("1").unwrap(), before);
        }
    }

    #[test]
    fn test_malformed_reading_between_valid_ones_is_ignored() {
        let mut e = engine();
        e.accept(reading(0, 0.0)).unwrap();
        e.accept(reading(5, 720.0)).unwrap();

        let bad = Reading { voltage_v: -5.0, ..reading(10, 720.0) };
        assert!(matches!(e.accept(bad), Err(Rejection::Validation { .. })));
        assert_eq!(e.state("1").unwrap().cumulative_energy_wh, 1.0);

        // the next good reading spans the whole gap back to the last accepted one
        let row = e.accept(reading(15, 720.0)).unwrap();
        assert_eq!(row.energy_wh_interval, 2.0);
        assert_eq!(row.cumulative_energy_wh, 3.0);
    }

    #[test]
    fn test_seeded_state_continues_cumulative_total() {
        let mut e = engine();
        e.seed("1", EnergyState { cumulative_energy_wh: 42.0, last_timestamp: at(0) });
        let row = e.accept(reading(3600, 1000.0)).unwrap();
        assert_eq!(row.energy_wh_interval, 1000.0);
        assert_eq!(row.cumulative_energy_wh, 1042.0);
    }

    #[test]
    fn test_meters_are_independent() {
        let mut e = engine();
        e.accept(reading(0, 100.0)).unwrap();
        let other = Reading { meter_id: "2".into(), ..reading(0, 100.0) };
        let row = e.accept(other).unwrap();
        assert_eq!(row.energy_wh_interval, 0.0);
        assert!(e.state("2").is_some());
    }

    #[test]
    fn test_optional_gap_ceiling() {
        let mut e = AccrualEngine::new(
            ValidationConfig::default(),
            AccrualSettings::new(
                5,
                &AccrualConfig { gap_warn_factor: 10.0, max_gap_secs: Some(60) },
            ),
        );
        e.accept(reading(0, 0.0)).unwrap();
        let row = e.accept(reading(3600, 3600.0)).unwrap();
        assert_relative_eq!(row.energy_wh_interval, 60.0);
    }

    #[test]
    fn test_energy_wh_is_power_times_hours() {
        assert_eq!(energy_wh(720.0, 5_000), 1.0);
        assert_eq!(energy_wh(600.0, 300_000), 50.0);
        assert_eq!(energy_wh(0.0, 1_000_000), 0.0);
    }
}
