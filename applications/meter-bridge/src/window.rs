use chrono::{DateTime, Duration, TimeZone, Utc};

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Fixed-size windows aligned to the Unix epoch, so that every run of the
/// bridge cuts time at the same boundaries.
#[derive(Debug, Clone, Copy)]
pub struct WindowSpec {
    size_ms: i64,
}

impl WindowSpec {
    /// `size` is truncated to whole milliseconds and must be at least one.
    pub fn new(size: Duration) -> Self {
        Self {
            size_ms: size.num_milliseconds().max(1),
        }
    }

    pub fn size(&self) -> Duration {
        Duration::milliseconds(self.size_ms)
    }

    pub fn window_for(&self, ts: DateTime<Utc>) -> Window {
        let ms = ts.timestamp_millis();
        let start_ms = ms - ms.rem_euclid(self.size_ms);
        let start = Utc
            .timestamp_millis_opt(start_ms)
            .single()
            .unwrap_or(ts);
        Window {
            start,
            end: start + self.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_five_minute_buckets_are_epoch_aligned() {
        let spec = WindowSpec::new(Duration::seconds(300));
        // 1_700_000_000 is 200 s past a 300 s boundary
        let w = spec.window_for(at(1_700_000_000));
        assert_eq!(w.start, at(1_699_999_800));
        assert_eq!(w.end, at(1_700_000_100));
        assert!(w.contains(at(1_699_999_800)));
        assert!(!w.contains(at(1_700_000_100)));
    }

    #[test]
    fn test_boundary_belongs_to_next_window() {
        let spec = WindowSpec::new(Duration::seconds(300));
        assert_eq!(spec.window_for(at(300)).start, at(300));
        assert_eq!(spec.window_for(at(299)).start, at(0));
    }

    #[test]
    fn test_pre_epoch_timestamps_round_down() {
        let spec = WindowSpec::new(Duration::seconds(300));
        assert_eq!(spec.window_for(at(-1)).start, at(-300));
    }

    #[test]
    fn test_sub_second_timestamps() {
        let spec = WindowSpec::new(Duration::seconds(60));
        let ts = Utc.timestamp_millis_opt(120_999).unwrap();
        assert_eq!(spec.window_for(ts).start, at(120));
    }
}
