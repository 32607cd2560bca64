//! Pipeline health: counters, recent errors and the status snapshot.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use wxrelay_platforms::PlatformStatsSnapshot;

/// Capacity of the recent-error ring.
const ERROR_RING_CAPACITY: usize = 100;

/// One recorded error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    /// Component that reported it (`listener`, `delivery`, `ingress`, ...).
    pub component: &'static str,
    /// Error summary.
    pub message: String,
    /// Unix timestamp.
    pub at: i64,
}

/// Fixed-capacity ring of the most recent errors.
#[derive(Default)]
pub struct ErrorRing {
    entries: Mutex<VecDeque<ErrorEntry>>,
}

impl ErrorRing {
    /// Builds an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error, evicting the oldest entry when full.
    pub fn push(&self, component: &'static str, message: String, at: i64) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == ERROR_RING_CAPACITY {
                entries.pop_front();
            }
            entries.push_back(ErrorEntry {
                component,
                message,
                at,
            });
        }
    }

    /// A copy of the ring, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ErrorEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Latch for unrecoverable failures (database corruption, disk full).
///
/// Recoverable errors stay with their message; only a fatal store failure
/// may raise this, which makes the process exit non-zero.
#[derive(Default)]
pub struct FatalSignal {
    message: Mutex<Option<String>>,
    notify: tokio::sync::Notify,
}

impl FatalSignal {
    /// Builds an unraised latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the latch; the first message wins.
    pub fn raise(&self, message: String) {
        if let Ok(mut slot) = self.message.lock() {
            if slot.is_none() {
                *slot = Some(message);
            }
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// The failure message, when raised.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.message.lock().ok().and_then(|slot| slot.clone())
    }

    /// Waits until the latch is raised and returns the message.
    pub async fn wait(&self) -> String {
        loop {
            if let Some(message) = self.message() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

/// Throughput counters for the whole pipeline.
#[derive(Default)]
pub struct PipelineCounters {
    pub ingressed: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
}

impl PipelineCounters {
    /// Builds zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A point-in-time copy.
    #[must_use]
    pub fn snapshot(&self) -> ThroughputSnapshot {
        ThroughputSnapshot {
            ingressed: self.ingressed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Counter values in a snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThroughputSnapshot {
    pub ingressed: u64,
    pub delivered: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Per-instance state in a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub instance_id: String,
    pub online: bool,
    pub last_seen: Option<i64>,
    /// CPU percentage from the remote, when the probe succeeded.
    pub cpu_percent: Option<f64>,
    /// Used memory in MB from the remote, when the probe succeeded.
    pub memory_used: Option<f64>,
}

/// Per-listener state in a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerHealth {
    pub instance_id: String,
    pub chat_name: String,
    pub status: String,
    pub manual_added: bool,
    pub last_message_time: i64,
    pub api_connected: bool,
}

/// Read-only view of the whole pipeline, served by the supervisor.
#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub instances: Vec<InstanceHealth>,
    pub listeners: Vec<ListenerHealth>,
    pub platforms: Vec<(String, PlatformStatsSnapshot)>,
    pub throughput: ThroughputSnapshot,
    pub recent_errors: Vec<ErrorEntry>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let ring = ErrorRing::new();
        for i in 0..(ERROR_RING_CAPACITY + 5) {
            ring.push("delivery", format!("err {i}"), i as i64);
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), ERROR_RING_CAPACITY);
        assert_eq!(snapshot[0].message, "err 5");
        assert_eq!(snapshot.last().unwrap().message, format!("err {}", ERROR_RING_CAPACITY + 4));
    }

    #[tokio::test]
    async fn fatal_signal_keeps_the_first_message() {
        let fatal = FatalSignal::new();
        assert_eq!(fatal.message(), None);
        fatal.raise("disk full".to_string());
        fatal.raise("later failure".to_string());
        assert_eq!(fatal.message().as_deref(), Some("disk full"));
        assert_eq!(fatal.wait().await, "disk full");
    }

    #[test]
    fn counters_snapshot_reads_all_fields() {
        let counters = PipelineCounters::new();
        counters.ingressed.fetch_add(3, Ordering::Relaxed);
        counters.delivered.fetch_add(2, Ordering::Relaxed);
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.ingressed, 3);
        assert_eq!(snapshot.delivered, 2);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.skipped, 1);
    }
}
