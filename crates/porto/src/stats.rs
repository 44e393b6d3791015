//! Daemon-wide counters, exposed as `porto_stat[...]` on the root
//! container.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters over the daemon's lifetime.
#[derive(Debug, Default)]
pub struct Stats {
    /// Slave (re)starts.
    pub spawned: AtomicU64,
    /// Errors surfaced to clients.
    pub errors: AtomicU64,
    /// Warnings logged by event handlers.
    pub warns: AtomicU64,
    /// Containers created.
    pub containers_created: AtomicU64,
    /// Containers started.
    pub containers_started: AtomicU64,
    /// Start failures.
    pub containers_failed_start: AtomicU64,
    /// OOM events observed.
    pub containers_oom: AtomicU64,
    /// Containers that failed to restore.
    pub restore_failed: AtomicU64,
    /// Volumes created.
    pub volumes_created: AtomicU64,
    /// Volumes that failed to restore.
    pub volume_restore_failed: AtomicU64,
    /// Requests completed.
    pub requests_completed: AtomicU64,
    /// Requests that returned an error.
    pub requests_failed: AtomicU64,
    /// Events dispatched.
    pub events_dispatched: AtomicU64,
    /// Clients accepted.
    pub clients_accepted: AtomicU64,
}

impl Stats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter by its API name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64> {
        let counter = match name {
            "spawned" => &self.spawned,
            "errors" => &self.errors,
            "warns" => &self.warns,
            "containers_created" => &self.containers_created,
            "containers_started" => &self.containers_started,
            "containers_failed_start" => &self.containers_failed_start,
            "containers_oom" => &self.containers_oom,
            "restore_failed" => &self.restore_failed,
            "volumes_created" => &self.volumes_created,
            "volume_restore_failed" => &self.volume_restore_failed,
            "requests_completed" => &self.requests_completed,
            "requests_failed" => &self.requests_failed,
            "events_dispatched" => &self.events_dispatched,
            "clients_accepted" => &self.clients_accepted,
            _ => return None,
        };
        Some(counter.load(Ordering::Relaxed))
    }

    /// Every counter as (name, value), for `porto_stat` without an index.
    #[must_use]
    pub fn all(&self) -> Vec<(&'static str, u64)> {
        const NAMES: &[&str] = &[
            "spawned",
            "errors",
            "warns",
            "containers_created",
            "containers_started",
            "containers_failed_start",
            "containers_oom",
            "restore_failed",
            "volumes_created",
            "volume_restore_failed",
            "requests_completed",
            "requests_failed",
            "events_dispatched",
            "clients_accepted",
        ];
        NAMES
            .iter()
            .map(|name| (*name, self.get(name).expect("listed counter")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_bump_and_read() {
        let stats = Stats::new();
        Stats::bump(&stats.containers_created);
        Stats::bump(&stats.containers_created);
        assert_eq!(stats.get("containers_created"), Some(2));
        assert_eq!(stats.get("no_such"), None);
        assert_eq!(stats.all().len(), 14);
    }
}
