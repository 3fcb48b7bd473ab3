//! Time sources.
//!
//! Timestamps are epoch microseconds. Wall clocks can step backwards, so a
//! span never reads the wall clock twice: its [`TickClock`] pins the wall
//! time once at start and derives later readings from a monotonic instant.

use std::fmt::Debug;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A source of epoch-microsecond timestamps.
pub trait Clock: Send + Sync + Debug {
    fn current_time_micros(&self) -> u64;
}

/// Reads the wall clock. Times before the epoch read as zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_time_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// A wall-time base plus monotonic elapsed ticks.
///
/// Readings are monotone non-decreasing even when the wall clock steps, so
/// durations computed from one `TickClock` are trustworthy.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TickClock {
    base_micros: u64,
    anchor: Instant,
}

impl TickClock {
    /// Snapshots `clock` now; later readings add monotonic elapsed time.
    pub(crate) fn anchored(clock: &dyn Clock) -> Self {
        TickClock { base_micros: clock.current_time_micros(), anchor: Instant::now() }
    }

    pub(crate) fn current_time_micros(&self) -> u64 {
        self.base_micros.saturating_add(self.anchor.elapsed().as_micros() as u64)
    }
}
