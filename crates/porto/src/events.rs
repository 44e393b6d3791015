//! Deferred events and the deadline-ordered queue.
//!
//! Everything asynchronous in the supervisor is an [`Event`]: task exits,
//! OOM notifications, respawn timers, housekeeping sweeps. The queue is a
//! plain priority heap keyed by absolute deadline; the epoll loop sleeps
//! until the earliest one.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// A deferred unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A memory cgroup reported an OOM kill.
    Oom {
        /// Container id.
        container: u32,
    },
    /// A reaped child exited.
    Exit {
        /// Host pid.
        pid: i32,
        /// Raw wait status.
        status: i32,
    },
    /// A dead container with respawn enabled is due for restart.
    Respawn {
        /// Container id.
        container: u32,
    },
    /// Reconcile lost-and-restored containers against the kernel.
    CgroupSync,
    /// A wait registration ran out of time.
    WaitTimeout {
        /// Waiter handle.
        waiter: u64,
    },
    /// A stop's SIGTERM grace period expired; escalate to SIGKILL.
    StopTimeout {
        /// Container id of the stop's root.
        container: u32,
    },
    /// Re-try removal of cgroups the kernel has not emptied yet.
    CgroupCleanup {
        /// Hierarchical container name the cgroups belong to.
        cgroup: String,
        /// Attempts so far; the retry gives up eventually.
        attempt: u8,
    },
    /// Periodic housekeeping: rotate stdio logs, age dead containers.
    RotateLogs,
    /// Refresh network statistics and classes.
    UpdateNetwork,
    /// A weak container lost its client.
    DestroyWeakContainer {
        /// Container id.
        container: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DueEvent {
    due: Instant,
    seq: u64,
    event: Event,
}

impl Ord for DueEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for DueEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Deadline-ordered event queue.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<DueEvent>>,
    seq: u64,
}

impl EventQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an event `delay` from now.
    pub fn add(&mut self, delay: Duration, event: Event) {
        self.add_at(Instant::now() + delay, event);
    }

    /// Schedule an event at an absolute deadline.
    pub fn add_at(&mut self, due: Instant, event: Event) {
        self.seq += 1;
        self.heap.push(Reverse(DueEvent {
            due,
            seq: self.seq,
            event,
        }));
    }

    /// Deadline of the earliest pending event.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.due)
    }

    /// Pop the earliest event if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Event> {
        if self.heap.peek().is_some_and(|Reverse(e)| e.due <= now) {
            self.heap.pop().map(|Reverse(e)| e.event)
        } else {
            None
        }
    }

    /// Drop every event matching the predicate.
    pub fn cancel_if(&mut self, mut predicate: impl FnMut(&Event) -> bool) {
        let kept: Vec<_> = self
            .heap
            .drain()
            .filter(|Reverse(e)| !predicate(&e.event))
            .collect();
        self.heap.extend(kept);
    }

    /// Drop every pending event.
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_deadline_order() {
        let mut queue = EventQueue::new();
        let now = Instant::now();
        queue.add_at(now + Duration::from_secs(2), Event::RotateLogs);
        queue.add_at(now, Event::CgroupSync);
        queue.add_at(now + Duration::from_secs(1), Event::UpdateNetwork);

        let later = now + Duration::from_secs(3);
        assert_eq!(queue.pop_due(later), Some(Event::CgroupSync));
        assert_eq!(queue.pop_due(later), Some(Event::UpdateNetwork));
        assert_eq!(queue.pop_due(later), Some(Event::RotateLogs));
        assert_eq!(queue.pop_due(later), None);
    }

    #[test]
    fn same_deadline_keeps_insertion_order() {
        let mut queue = EventQueue::new();
        let now = Instant::now();
        queue.add_at(now, Event::Exit { pid: 1, status: 0 });
        queue.add_at(now, Event::Exit { pid: 2, status: 0 });
        assert_eq!(queue.pop_due(now), Some(Event::Exit { pid: 1, status: 0 }));
        assert_eq!(queue.pop_due(now), Some(Event::Exit { pid: 2, status: 0 }));
    }

    #[test]
    fn future_events_stay_queued() {
        let mut queue = EventQueue::new();
        let now = Instant::now();
        queue.add_at(now + Duration::from_secs(60), Event::RotateLogs);
        assert_eq!(queue.pop_due(now), None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn cancellation_filters_events() {
        let mut queue = EventQueue::new();
        queue.add(Duration::ZERO, Event::Respawn { container: 1 });
        queue.add(Duration::ZERO, Event::Respawn { container: 2 });
        queue.add(Duration::ZERO, Event::RotateLogs);
        queue.cancel_if(|e| matches!(e, Event::Respawn { container: 1 }));
        assert_eq!(queue.len(), 2);
    }
}
