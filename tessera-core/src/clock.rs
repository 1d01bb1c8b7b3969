//! Wall and virtual clocks
//!
//! A virtual clock advances on ingested point timestamps instead of wall
//! time, which keeps retention math meaningful when replaying historical
//! streams.

use crate::encoding::Timestamp;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock used for retention and flush decisions
#[derive(Debug, Clone)]
pub enum Clock {
    /// System wall clock
    Wall,
    /// Advances monotonically on observed ingest timestamps
    Virtual(Arc<AtomicI64>),
}

impl Clock {
    /// Create a wall clock
    pub fn wall() -> Self {
        Clock::Wall
    }

    /// Create a virtual clock starting at zero
    pub fn virtual_time() -> Self {
        Clock::Virtual(Arc::new(AtomicI64::new(0)))
    }

    /// Current time in nanoseconds since the Unix epoch
    pub fn now(&self) -> Timestamp {
        match self {
            Clock::Wall => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0),
            Clock::Virtual(latest) => latest.load(Ordering::Relaxed),
        }
    }

    /// Observe an ingest timestamp; only moves a virtual clock forward
    pub fn advance(&self, ts: Timestamp) {
        if let Clock::Virtual(latest) = self {
            latest.fetch_max(ts, Ordering::Relaxed);
        }
    }
}
