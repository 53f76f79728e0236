//! Global atomic counters for deploy-triage observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a session).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    sessions_run: AtomicU64,
    external_calls: AtomicU64,
    call_retries: AtomicU64,
    call_timeouts: AtomicU64,
    session_timeouts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sessions_run: AtomicU64::new(0),
            external_calls: AtomicU64::new(0),
            call_retries: AtomicU64::new(0),
            call_timeouts: AtomicU64::new(0),
            session_timeouts: AtomicU64::new(0),
        }
    }

    pub fn inc_sessions(&self) {
        self.sessions_run.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_run", "counter incremented");
    }

    /// One attempt against a collaborator, retries included.
    pub fn inc_external_calls(&self) {
        self.external_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "external_calls", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.call_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "call_retries", "counter incremented");
    }

    pub fn inc_call_timeouts(&self) {
        self.call_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "call_timeouts", "counter incremented");
    }

    pub fn inc_session_timeouts(&self) {
        self.session_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "session_timeouts", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            sessions_run = self.sessions_run(),
            external_calls = self.external_calls(),
            call_retries = self.call_retries(),
            call_timeouts = self.call_timeouts(),
            session_timeouts = self.session_timeouts(),
        );
    }

    pub fn sessions_run(&self) -> u64 {
        self.sessions_run.load(Ordering::Relaxed)
    }

    pub fn external_calls(&self) -> u64 {
        self.external_calls.load(Ordering::Relaxed)
    }

    pub fn call_retries(&self) -> u64 {
        self.call_retries.load(Ordering::Relaxed)
    }

    pub fn call_timeouts(&self) -> u64 {
        self.call_timeouts.load(Ordering::Relaxed)
    }

    pub fn session_timeouts(&self) -> u64 {
        self.session_timeouts.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.sessions_run.store(0, Ordering::Relaxed);
        self.external_calls.store(0, Ordering::Relaxed);
        self.call_retries.store(0, Ordering::Relaxed);
        self.call_timeouts.store(0, Ordering::Relaxed);
        self.session_timeouts.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_sessions();
        m.inc_external_calls();
        m.inc_external_calls();
        m.inc_retries();
        m.inc_call_timeouts();
        assert_eq!(m.sessions_run(), 1);
        assert_eq!(m.external_calls(), 2);
        assert_eq!(m.call_retries(), 1);
        assert_eq!(m.call_timeouts(), 1);
        assert_eq!(m.session_timeouts(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_sessions();
        m.inc_session_timeouts();
        m.reset();
        assert_eq!(m.sessions_run(), 0);
        assert_eq!(m.session_timeouts(), 0);
    }
}
