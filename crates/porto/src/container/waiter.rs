//! Wait registrations.
//!
//! A Wait request that cannot complete immediately registers a waiter and
//! gets its response later, when a matching container dies or the timeout
//! fires. Waiters are owned by the registry; clients refer to them by an
//! opaque handle, so disconnects never have to walk container lists.

use std::collections::HashMap;

use porto_common::name::match_wildcard;

/// One registered waiter.
#[derive(Debug, Clone)]
pub struct Waiter {
    /// Registry handle.
    pub handle: u64,
    /// Owning client id.
    pub client: u64,
    /// Exact names to match.
    pub names: Vec<String>,
    /// Wildcard patterns to match; these also match containers created
    /// after registration.
    pub wildcards: Vec<String>,
}

impl Waiter {
    fn matches(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
            || self.wildcards.iter().any(|p| match_wildcard(p, name))
    }
}

/// A completed wait, ready to be written to its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitReport {
    /// Client to deliver to.
    pub client: u64,
    /// Container that completed the wait; empty on timeout.
    pub name: String,
    /// Container state at completion time.
    pub state: String,
    /// Unix timestamp of the completion.
    pub when: i64,
}

/// All live waiters.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    next_handle: u64,
    waiters: HashMap<u64, Waiter>,
}

impl WaiterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter and return its handle.
    pub fn register(&mut self, client: u64, names: Vec<String>, wildcards: Vec<String>) -> u64 {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.waiters.insert(
            handle,
            Waiter {
                handle,
                client,
                names,
                wildcards,
            },
        );
        handle
    }

    /// Remove one waiter.
    pub fn remove(&mut self, handle: u64) -> Option<Waiter> {
        self.waiters.remove(&handle)
    }

    /// Remove every waiter of a disconnecting client.
    pub fn remove_client(&mut self, client: u64) {
        self.waiters.retain(|_, w| w.client != client);
    }

    /// Signal a container death; every matching waiter completes exactly
    /// once and is removed.
    pub fn notify(&mut self, name: &str, state: &str, when: i64) -> Vec<WaitReport> {
        let handles: Vec<u64> = self
            .waiters
            .values()
            .filter(|w| w.matches(name))
            .map(|w| w.handle)
            .collect();

        handles
            .into_iter()
            .filter_map(|handle| self.waiters.remove(&handle))
            .map(|w| WaitReport {
                client: w.client,
                name: name.to_string(),
                state: state.to_string(),
                when,
            })
            .collect()
    }

    /// Complete a waiter by timeout with an empty name.
    pub fn timeout(&mut self, handle: u64, when: i64) -> Option<WaitReport> {
        self.waiters.remove(&handle).map(|w| WaitReport {
            client: w.client,
            name: String::new(),
            state: String::new(),
            when,
        })
    }

    /// Number of live waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether no waiters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_completes_once() {
        let mut registry = WaiterRegistry::new();
        registry.register(1, vec!["a/b".to_string()], vec![]);

        let reports = registry.notify("a/b", "dead", 100);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "a/b");
        assert_eq!(reports[0].state, "dead");

        // Second death of the same name finds no waiter.
        assert!(registry.notify("a/b", "dead", 101).is_empty());
    }

    #[test]
    fn wildcards_match_new_containers() {
        let mut registry = WaiterRegistry::new();
        registry.register(1, vec![], vec!["job-*".to_string()]);
        assert!(registry.notify("other", "dead", 1).is_empty());
        let reports = registry.notify("job-17", "dead", 2);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].client, 1);
    }

    #[test]
    fn all_matching_waiters_are_notified() {
        let mut registry = WaiterRegistry::new();
        registry.register(1, vec!["x".to_string()], vec![]);
        registry.register(2, vec!["x".to_string()], vec![]);
        registry.register(3, vec!["y".to_string()], vec![]);

        let reports = registry.notify("x", "dead", 5);
        assert_eq!(reports.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn timeout_reports_empty_name() {
        let mut registry = WaiterRegistry::new();
        let handle = registry.register(9, vec!["z".to_string()], vec![]);
        let report = registry.timeout(handle, 7).unwrap();
        assert_eq!(report.name, "");
        assert_eq!(report.client, 9);
        assert!(registry.timeout(handle, 8).is_none());
    }

    #[test]
    fn client_disconnect_drops_waiters() {
        let mut registry = WaiterRegistry::new();
        registry.register(1, vec!["a".to_string()], vec![]);
        registry.register(1, vec![], vec!["*".to_string()]);
        registry.register(2, vec!["a".to_string()], vec![]);
        registry.remove_client(1);
        assert_eq!(registry.len(), 1);
    }
}
