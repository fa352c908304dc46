use crate::error::Result;
use crate::source::RegisterTransport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Exponential backoff: each delay doubles until it reaches the ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Retries of a single register read inside one poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

/// Transport decorator that retries transient read failures with backoff.
pub struct Retrying<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> Retrying<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: RegisterTransport> RegisterTransport for Retrying<T> {
    async fn read_holding_registers(&mut self, slave: u8, start: u16, count: u16) -> Result<Vec<u16>> {
        let mut backoff = self.policy.backoff();
        let mut attempt = 1;
        loop {
            match self.inner.read_holding_registers(slave, start, count).await {
                Ok(words) => return Ok(words),
                Err(e) if e.is_transient() && attempt < self.policy.attempts => {
                    let delay = backoff.next_delay();
                    debug!(slave, start, attempt, error = %e, ?delay, "register read failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn disconnect(&mut self) {
        self.inner.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let mut b = Backoff::new(Duration::from_secs(2), Duration::from_secs(60));
        let delays: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(2));
    }

    struct Flaky {
        failures_left: u32,
        calls: u32,
        error: fn() -> AppError,
    }

    #[async_trait]
    impl RegisterTransport for Flaky {
        async fn read_holding_registers(&mut self, _slave: u8, _start: u16, count: u16) -> Result<Vec<u16>> {
            self.calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err((self.error)());
            }
            Ok(vec![0; count as usize])
        }

        async fn disconnect(&mut self) {}
    }

    fn crc_error() -> AppError {
        AppError::Transport("crc mismatch".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let mut t = Retrying::new(
            Flaky { failures_left: 2, calls: 0, error: crc_error },
            RetryPolicy::default(),
        );
        let words = t.read_holding_registers(1, 6, 6).await.unwrap();
        assert_eq!(words.len(), 6);
        assert_eq!(t.inner().calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_configured_attempts() {
        let mut t = Retrying::new(
            Flaky { failures_left: 10, calls: 0, error: crc_error },
            RetryPolicy { attempts: 2, ..RetryPolicy::default() },
        );
        assert!(t.read_holding_registers(1, 6, 6).await.is_err());
        assert_eq!(t.inner().calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_errors_are_not_retried() {
        let mut t = Retrying::new(
            Flaky {
                failures_left: 1,
                calls: 0,
                error: || AppError::Config("bad map".into()),
            },
            RetryPolicy::default(),
        );
        assert!(t.read_holding_registers(1, 6, 6).await.is_err());
        assert_eq!(t.inner().calls, 1);
    }
}
