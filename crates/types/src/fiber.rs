//! Fiber identity and lifecycle status.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a fiber.
///
/// Identifiers are allocated from a monotonically increasing counter and are
/// never reused within a process. [`FiberId::NONE`] is reserved for requests that
/// originate outside of any fiber (for example a host interrupting a root fiber).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FiberId(u64);

impl FiberId {
    /// Identity used when no fiber is responsible for an action.
    pub const NONE: FiberId = FiberId(0);

    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value of the identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is the [`FiberId::NONE`] sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() { write!(f, "#none") } else { write!(f, "#{}", self.0) }
    }
}

/// Coarse lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FiberStatus {
    /// The fiber's evaluator is stepping through its description.
    Running,
    /// The fiber is parked at a suspension point waiting for a callback,
    /// another fiber, or a timer.
    Suspended,
    /// The fiber produced its exit; it will never run again.
    Done,
}

impl FiberStatus {
    /// Get the display text for this status.
    pub fn display(&self) -> &'static str {
        match self {
            FiberStatus::Running => "Running",
            FiberStatus::Suspended => "Suspended",
            FiberStatus::Done => "Done",
        }
    }

    /// Check if the fiber has terminated.
    pub fn is_done(&self) -> bool {
        matches!(self, FiberStatus::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiber_ids_are_unique_and_increasing() {
        let first = FiberId::next();
        let second = FiberId::next();
        assert!(second > first);
        assert!(!first.is_none());
        assert!(FiberId::NONE.is_none());
    }

    #[test]
    fn fiber_id_display() {
        assert_eq!(FiberId::NONE.to_string(), "#none");
        let id = FiberId::next();
        assert_eq!(id.to_string(), format!("#{}", id.as_u64()));
    }

    #[test]
    fn status_checks() {
        assert!(FiberStatus::Done.is_done());
        assert!(!FiberStatus::Suspended.is_done());
        assert_eq!(FiberStatus::Running.display(), "Running");
    }
}
