//! Time source for the engine.
//!
//! The ring addresses blocks by wall-clock time, so everything that asks
//! "what is now" goes through a [`Clock`]. Tests swap in a manual clock
//! and drive rollover deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Timestamp;

#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn manual(start: Timestamp) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start)))
    }

    pub fn now(&self) -> Timestamp {
        match self {
            Clock::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as Timestamp)
                .unwrap_or_default(),
            Clock::Manual(t) => t.load(Ordering::SeqCst),
        }
    }

    /// Manual clocks only; a no-op on the system clock.
    pub fn set(&self, t: Timestamp) {
        if let Clock::Manual(cell) = self {
            cell.store(t, Ordering::SeqCst);
        }
    }

    /// Manual clocks only; a no-op on the system clock.
    pub fn advance(&self, delta: Timestamp) {
        if let Clock::Manual(cell) = self {
            cell.fetch_add(delta, Ordering::SeqCst);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}
