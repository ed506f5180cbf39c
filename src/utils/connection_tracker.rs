//! In-flight exchange accounting and draining.
//!
//! Every request handled by the server holds an [`ExchangeGuard`] for its lifetime;
//! upgraded WebSocket sessions hold one until the session closes. During shutdown the
//! tracker waits for the guards to drop, bounded by a timeout.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::Notify;

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Request,
    WebSocket,
}

#[derive(Debug, Default)]
struct Counters {
    active_requests: AtomicU64,
    active_sessions: AtomicU64,
    total_requests: AtomicU64,
    total_sessions: AtomicU64,
}

/// Snapshot of the tracker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active_requests: u64,
    pub active_sessions: u64,
    pub total_requests: u64,
    pub total_sessions: u64,
}

#[derive(Clone, Default)]
pub struct ConnectionTracker {
    counters: Arc<Counters>,
    drained: Arc<Notify>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an exchange until the returned guard is dropped
    pub fn begin(&self, kind: ExchangeKind) -> ExchangeGuard {
        let active = match kind {
            ExchangeKind::Request => {
                self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
                self.counters.active_requests.fetch_add(1, Ordering::AcqRel) + 1
            }
            ExchangeKind::WebSocket => {
                self.counters.total_sessions.fetch_add(1, Ordering::Relaxed);
                self.counters.active_sessions.fetch_add(1, Ordering::AcqRel);
                self.counters.active_requests.load(Ordering::Acquire)
            }
        };
        metrics::set_active_requests(active);
        ExchangeGuard {
            tracker: self.clone(),
            kind,
        }
    }

    pub fn active(&self) -> u64 {
        self.counters.active_requests.load(Ordering::Acquire)
            + self.counters.active_sessions.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_requests: self.counters.active_requests.load(Ordering::Acquire),
            active_sessions: self.counters.active_sessions.load(Ordering::Acquire),
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            total_sessions: self.counters.total_sessions.load(Ordering::Relaxed),
        }
    }

    /// Wait until no exchange is active. Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drain = async {
            loop {
                let notified = self.drained.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                tracing::info!("All exchanges drained");
                true
            }
            Err(_) => {
                tracing::warn!(active = self.active(), "Drain timeout elapsed with exchanges still active");
                false
            }
        }
    }

    fn finish(&self, kind: ExchangeKind) {
        let counter = match kind {
            ExchangeKind::Request => &self.counters.active_requests,
            ExchangeKind::WebSocket => &self.counters.active_sessions,
        };
        counter.fetch_sub(1, Ordering::AcqRel);
        if kind == ExchangeKind::Request {
            metrics::set_active_requests(self.counters.active_requests.load(Ordering::Acquire));
        }
        if self.active() == 0 {
            self.drained.notify_waiters();
        }
    }
}

/// Keeps one exchange counted as active.
pub struct ExchangeGuard {
    tracker: ConnectionTracker,
    kind: ExchangeKind,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.tracker.finish(self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_update_counters() {
        let tracker = ConnectionTracker::new();
        let request = tracker.begin(ExchangeKind::Request);
        let session = tracker.begin(ExchangeKind::WebSocket);
        assert_eq!(tracker.active(), 2);

        drop(request);
        assert_eq!(
            tracker.stats(),
            ConnectionStats {
                active_requests: 0,
                active_sessions: 1,
                total_requests: 1,
                total_sessions: 1,
            }
        );
        drop(session);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_drain() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.wait_for_drain(Duration::from_millis(10)).await);

        let guard = tracker.begin(ExchangeKind::Request);
        assert!(!tracker.wait_for_drain(Duration::from_millis(20)).await);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_drain(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }
}
