//! Time sources.
//!
//! The protocol reads two clocks: a loosely synchronized "global" wall
//! clock shared across the fleet (skew bounded by `d_max`), used for lease
//! expiries and ballot seeding, and a local monotonic clock used only for
//! timer scheduling on this node. The trait keeps both behind one seam so
//! tests can drive time by hand.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::types::Timestamp;

/// Clock abstraction for the engine and the event loop.
pub trait Clock {
    /// Loosely synchronized wall clock, ms since the Unix epoch.
    fn global_now(&self) -> Timestamp;

    /// Local monotonic time in ms. Only compared against itself.
    fn local_now(&self) -> Timestamp;

    /// Translate a global-clock deadline into the local timer scale.
    fn global_to_local(&self, global: Timestamp) -> Timestamp {
        let g = self.global_now();
        let l = self.local_now();
        if global >= g {
            l + (global - g)
        } else {
            l.saturating_sub(g - global)
        }
    }
}

/// Real clock: system wall time for the global clock, a monotonic instant
/// anchored at construction for the local clock.
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    /// Create a clock anchored at now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn global_now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }

    fn local_now(&self) -> Timestamp {
        self.started.elapsed().as_millis() as Timestamp
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    /// Hand-driven clock for unit tests. Global and local time advance
    /// together; a fixed offset models the global/local scale difference.
    #[derive(Clone)]
    pub struct ManualClock {
        global: Rc<Cell<Timestamp>>,
        local_offset: Timestamp,
    }

    impl ManualClock {
        pub fn at(global: Timestamp) -> Self {
            Self {
                global: Rc::new(Cell::new(global)),
                local_offset: 1_000_000,
            }
        }

        pub fn advance(&self, ms: u64) {
            self.global.set(self.global.get() + ms);
        }

        pub fn set(&self, global: Timestamp) {
            self.global.set(global);
        }
    }

    impl Clock for ManualClock {
        fn global_now(&self) -> Timestamp {
            self.global.get()
        }

        fn local_now(&self) -> Timestamp {
            self.global.get() + self.local_offset
        }
    }
}
