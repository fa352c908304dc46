use crate::accrual::{AccrualEngine, Rejection};
use crate::error::AppError;
use crate::reading::{LoggedRow, MeterId, Reading};
use crate::source::{ReadingSource, RegisterTransport};
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// What one poll cycle produced.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub rows: Vec<LoggedRow>,
    pub rejected: Vec<Rejection>,
    /// Meters that yielded no reading this cycle.
    pub missed: Vec<MeterId>,
}

/// Owns the bus transport and the accrual ledger. Meters are read one after
/// another since a serial bus carries a single transaction at a time.
pub struct Poller<T> {
    transport: T,
    sources: Vec<ReadingSource>,
    engine: AccrualEngine,
    poll_timeout: Duration,
}

impl<T: RegisterTransport> Poller<T> {
    pub fn new(transport: T, sources: Vec<ReadingSource>, engine: AccrualEngine, poll_timeout: Duration) -> Self {
        Self {
            transport,
            sources,
            engine,
            poll_timeout,
        }
    }

    pub fn engine(&self) -> &AccrualEngine {
        &self.engine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Poll every meter once, stamping all readings with `now` cut to whole
    /// milliseconds, the precision of the local store.
    pub async fn poll_cycle(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        let now = now.trunc_subsecs(3);
        let mut outcome = CycleOutcome::default();
        let mut accepted: HashMap<MeterId, Reading> = HashMap::new();

        for source in self.sources.iter_mut() {
            let reading = match source {
                ReadingSource::Physical(meter) => {
                    let read = tokio::time::timeout(self.poll_timeout, meter.read(&mut self.transport, now)).await;
                    let result = match read {
                        Ok(r) => r,
                        Err(_) => {
                            self.transport.disconnect().await;
                            Err(AppError::Timeout(self.poll_timeout.as_millis() as u64))
                        }
                    };
                    match result {
                        Ok(reading) => reading,
                        Err(e) => {
                            warn!(meter_id = %meter.meter_id, error = %e, "meter read failed; cycle skipped");
                            outcome.missed.push(meter.meter_id.clone());
                            continue;
                        }
                    }
                }
                ReadingSource::Simulated(sim) => match accepted.get(sim.base_meter_id()) {
                    Some(base) => sim.next(base),
                    None => {
                        debug!(
                            meter_id = %sim.meter_id(),
                            base = %sim.base_meter_id(),
                            "no base reading this cycle"
                        );
                        outcome.missed.push(sim.meter_id().to_string());
                        continue;
                    }
                },
            };

            match self.engine.accept(reading.clone()) {
                Ok(row) => {
                    accepted.insert(reading.meter_id.clone(), reading);
                    outcome.rows.push(row);
                }
                Err(rejection) => {
                    warn!(error = %rejection, "reading rejected");
                    outcome.rejected.push(rejection);
                }
            }
        }
        outcome
    }
}

/// Time until the next multiple of `period` since the Unix epoch, so that
/// poll timestamps land on round boundaries.
pub fn next_boundary_delay(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1) as i64;
    let rem = now.timestamp_millis().rem_euclid(period_ms);
    Duration::from_millis((period_ms - rem) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_boundary_delay() {
        let p = Duration::from_secs(5);
        let at = |ms: i64| Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap();
        assert_eq!(next_boundary_delay(at(0), p), Duration::from_secs(5));
        assert_eq!(next_boundary_delay(at(1_200), p), Duration::from_millis(3_800));
        assert_eq!(next_boundary_delay(at(4_999), p), Duration::from_millis(1));
    }
}
