use std::time::{Duration, SystemTime};

/// Wall-clock abstraction for the orchestrating caller.
///
/// The computation pipeline never reads a clock; it receives "now" as an
/// argument. Callers obtain that instant from a `Clock` so tests and replays
/// can pin it.
pub trait Clock {
    fn now(&self) -> SystemTime;

    /// Milliseconds since the Unix epoch, saturating at 0 for pre-epoch clocks.
    fn now_ms(&self) -> i64 {
        self.now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Default clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock pinned to a fixed instant; used for replays (`--now`) and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    at: SystemTime,
}

impl FixedClock {
    pub fn from_unix_ms(ms: i64) -> Self {
        let at = if ms >= 0 {
            SystemTime::UNIX_EPOCH + Duration::from_millis(ms.unsigned_abs())
        } else {
            SystemTime::UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
        };
        Self { at }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.at
    }
}
