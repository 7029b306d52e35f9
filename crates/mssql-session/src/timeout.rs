//! Timeout supervision.
//!
//! The supervisor owns the expiration clock for the in-flight operation.
//! Each timed operation is issued a monotonically increasing identity;
//! a timer fire that does not match the current identity is stale and is
//! dropped silently. Expiration is observed either on the synchronous
//! wait path (`ExpiredSync`) or from a timer task (`ExpiredAsync`); both
//! lead to the same attention sequence, driven by the session.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Grace period allowed for the server's attention acknowledgment before
/// the session is declared broken.
pub const DEFAULT_ATTENTION_GRACE: Duration = Duration::from_secs(5);

/// Timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimerState {
    /// No timed operation in flight.
    Stopped = 0,
    /// A timed operation is running.
    Running = 1,
    /// The timer task fired while the operation was running.
    ExpiredAsync = 2,
    /// The synchronous wait path observed expiration.
    ExpiredSync = 3,
}

impl TimerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::ExpiredAsync,
            3 => Self::ExpiredSync,
            _ => Self::Stopped,
        }
    }
}

/// Per-session expiration clock.
#[derive(Debug)]
pub struct TimeoutSupervisor {
    state: AtomicU8,
    identity: AtomicU64,
    timeout: Mutex<Option<Duration>>,
    attention_grace: Mutex<Duration>,
}

impl Default for TimeoutSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutSupervisor {
    /// Create a supervisor with no timeout configured (infinite).
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TimerState::Stopped as u8),
            identity: AtomicU64::new(0),
            timeout: Mutex::new(None),
            attention_grace: Mutex::new(DEFAULT_ATTENTION_GRACE),
        }
    }

    /// Set the operation timeout in milliseconds. Zero or negative means
    /// infinite.
    pub fn set_timeout_ms(&self, ms: i64) {
        *self.timeout.lock() = if ms <= 0 {
            None
        } else {
            Some(Duration::from_millis(ms as u64))
        };
    }

    /// Configured operation timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    /// Attention acknowledgment grace period.
    #[must_use]
    pub fn attention_grace(&self) -> Duration {
        *self.attention_grace.lock()
    }

    /// Override the attention acknowledgment grace period.
    pub fn set_attention_grace(&self, grace: Duration) {
        *self.attention_grace.lock() = grace;
    }

    /// Start a timed operation: Stopped -> Running with a fresh identity.
    ///
    /// Returns the identity that timer fires must present.
    pub fn begin_operation(&self) -> u64 {
        let id = self.identity.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.store(TimerState::Running as u8, Ordering::Release);
        id
    }

    /// Complete the current operation: back to Stopped.
    pub fn finish_operation(&self) {
        self.state
            .store(TimerState::Stopped as u8, Ordering::Release);
    }

    /// Report expiration for the operation with the given identity.
    ///
    /// Returns false for stale fires (identity mismatch, or the operation
    /// already completed); the caller must then do nothing.
    pub fn expire(&self, identity: u64, synchronous: bool) -> bool {
        if self.identity.load(Ordering::Acquire) != identity {
            tracing::trace!(identity, "dropping stale timer fire");
            return false;
        }
        let target = if synchronous {
            TimerState::ExpiredSync
        } else {
            TimerState::ExpiredAsync
        };
        self.state
            .compare_exchange(
                TimerState::Running as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Current timer state.
    #[must_use]
    pub fn state(&self) -> TimerState {
        TimerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Identity of the current operation.
    #[must_use]
    pub fn current_identity(&self) -> u64 {
        self.identity.load(Ordering::Acquire)
    }

    /// Whether the current operation has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(
            self.state(),
            TimerState::ExpiredAsync | TimerState::ExpiredSync
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_stopped() {
        let supervisor = TimeoutSupervisor::new();
        assert_eq!(supervisor.state(), TimerState::Stopped);
        assert_eq!(supervisor.timeout(), None);
    }

    #[test]
    fn test_non_positive_timeout_means_infinite() {
        let supervisor = TimeoutSupervisor::new();
        supervisor.set_timeout_ms(0);
        assert_eq!(supervisor.timeout(), None);
        supervisor.set_timeout_ms(-5);
        assert_eq!(supervisor.timeout(), None);
        supervisor.set_timeout_ms(1500);
        assert_eq!(supervisor.timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_operation_lifecycle() {
        let supervisor = TimeoutSupervisor::new();
        let id = supervisor.begin_operation();
        assert_eq!(supervisor.state(), TimerState::Running);

        assert!(supervisor.expire(id, true));
        assert_eq!(supervisor.state(), TimerState::ExpiredSync);

        supervisor.finish_operation();
        assert_eq!(supervisor.state(), TimerState::Stopped);
    }

    #[test]
    fn test_identities_are_monotonic() {
        let supervisor = TimeoutSupervisor::new();
        let a = supervisor.begin_operation();
        supervisor.finish_operation();
        let b = supervisor.begin_operation();
        assert!(b > a);
    }

    #[test]
    fn test_stale_fire_is_dropped() {
        let supervisor = TimeoutSupervisor::new();
        let stale = supervisor.begin_operation();
        supervisor.finish_operation();
        let current = supervisor.begin_operation();

        assert!(!supervisor.expire(stale, false));
        assert_eq!(supervisor.state(), TimerState::Running);

        assert!(supervisor.expire(current, false));
        assert_eq!(supervisor.state(), TimerState::ExpiredAsync);
    }

    #[test]
    fn test_expire_after_finish_is_dropped() {
        let supervisor = TimeoutSupervisor::new();
        let id = supervisor.begin_operation();
        supervisor.finish_operation();

        // Identity still matches but the operation is no longer running.
        assert!(!supervisor.expire(id, true));
        assert_eq!(supervisor.state(), TimerState::Stopped);
    }

    #[test]
    fn test_double_expire_reports_once() {
        let supervisor = TimeoutSupervisor::new();
        let id = supervisor.begin_operation();
        assert!(supervisor.expire(id, false));
        assert!(!supervisor.expire(id, true));
        assert_eq!(supervisor.state(), TimerState::ExpiredAsync);
    }
}
