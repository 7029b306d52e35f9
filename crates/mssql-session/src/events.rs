//! Process-wide diagnostics sink.
//!
//! The session core reports structured lifecycle events to an optional
//! process-wide sink. Sessions are identified by a numeric object id.
//! Absent a registered sink, every notification point is a no-op; the
//! `tracing` events emitted alongside are unconditional.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Receiver for session lifecycle events.
///
/// All methods have empty default bodies so a sink implements only what
/// it observes.
pub trait SessionEventSink: Send + Sync {
    /// An attention packet was sent on the session.
    fn attention_sent(&self, session_id: u64) {
        let _ = session_id;
    }

    /// The server acknowledged an attention request.
    fn attention_acknowledged(&self, session_id: u64) {
        let _ = session_id;
    }

    /// The operation timeout expired on the session.
    fn timeout_expired(&self, session_id: u64) {
        let _ = session_id;
    }

    /// The session transitioned to the broken state.
    fn session_broken(&self, session_id: u64) {
        let _ = session_id;
    }

    /// A transaction changed state.
    fn transaction_state(&self, session_id: u64, descriptor: u64, state: &'static str) {
        let _ = (session_id, descriptor, state);
    }
}

static SINK: RwLock<Option<Arc<dyn SessionEventSink>>> = RwLock::new(None);
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Register the process-wide event sink, replacing any previous one.
pub fn register_event_sink(sink: Arc<dyn SessionEventSink>) {
    *SINK.write() = Some(sink);
}

/// Unregister the process-wide event sink.
pub fn unregister_event_sink() {
    *SINK.write() = None;
}

/// Invoke `f` with the registered sink, if any.
pub(crate) fn with_sink(f: impl FnOnce(&dyn SessionEventSink)) {
    if let Some(sink) = SINK.read().as_ref() {
        f(sink.as_ref());
    }
}

/// Allocate the next session object id.
pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        broken: AtomicUsize,
    }

    impl SessionEventSink for CountingSink {
        fn session_broken(&self, _session_id: u64) {
            self.broken.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_sink_lifecycle() {
        let sink = Arc::new(CountingSink {
            broken: AtomicUsize::new(0),
        });
        register_event_sink(sink.clone());

        with_sink(|s| s.session_broken(1));
        assert_eq!(sink.broken.load(Ordering::SeqCst), 1);

        unregister_event_sink();
        with_sink(|s| s.session_broken(2));
        assert_eq!(sink.broken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = next_session_id();
        let b = next_session_id();
        assert_ne!(a, b);
    }
}
