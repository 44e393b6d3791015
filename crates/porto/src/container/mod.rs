//! The container tree.
//!
//! Containers are named hierarchical entities held in an arena keyed by
//! integer id: a parent stores child ids, a child stores its parent id,
//! and the outer map resolves names. Each node carries its own
//! reader/writer lock; the lock order is always tree map, then container,
//! then children in traversal order, and a debug tracker enforces it.

pub mod property;
pub mod state;
pub mod tree;
pub mod waiter;

pub use property::{EnablePorto, Properties, PropertyDef, VirtMode, PROPERTIES};
pub use state::ContainerState;
pub use tree::ContainerTree;
pub use waiter::{WaitReport, Waiter, WaiterRegistry};

use std::cell::RefCell;
use std::os::fd::OwnedFd;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use porto_common::{ContainerName, Cred};

use crate::cgroup::{Cgroup, Controller};
use crate::exec::TaskHandle;

thread_local! {
    /// Levels of the container locks this thread currently holds,
    /// outermost first. Acquiring a lock above the last held level is a
    /// bug the debug build catches immediately.
    static LOCK_STACK: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn lock_acquired(level: usize) {
    LOCK_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        debug_assert!(
            stack.last().map_or(true, |&held| held <= level),
            "container lock order violation: acquiring level {level} while holding {stack:?}"
        );
        stack.push(level);
    });
}

fn lock_released() {
    LOCK_STACK.with(|stack| {
        stack.borrow_mut().pop();
    });
}

/// Mutable portion of a container.
#[derive(Debug)]
pub struct Runtime {
    /// Lifecycle state.
    pub state: ContainerState,
    /// Configured properties.
    pub props: Properties,
    /// Owner credentials; who may control the container.
    pub owner: Cred,
    /// Child container ids, in creation order.
    pub children: Vec<u32>,
    /// Root task pids while started.
    pub task: Option<TaskHandle>,
    /// Raw wait status after death.
    pub exit_status: Option<i32>,
    /// errno of a failed start.
    pub start_errno: Option<i32>,
    /// Whether the task was OOM-killed.
    pub oom_killed: bool,
    /// Respawn attempts so far.
    pub respawn_count: u64,
    /// Start timestamp.
    pub start_time: Option<DateTime<Utc>>,
    /// Death timestamp.
    pub death_time: Option<DateTime<Utc>>,
    /// Live OOM eventfd while running.
    pub oom_fd: Option<OwnedFd>,
    /// A stop is in flight: exits complete the stop instead of marking
    /// the container dead.
    pub stopping: bool,
    /// Client id holding this container's weak lifetime, if any.
    pub weak_client: Option<u64>,
}

impl Runtime {
    fn new(owner: Cred, state: ContainerState) -> Self {
        Self {
            state,
            props: Properties::default(),
            owner,
            children: Vec::new(),
            task: None,
            exit_status: None,
            start_errno: None,
            oom_killed: false,
            respawn_count: 0,
            start_time: None,
            death_time: None,
            oom_fd: None,
            stopping: false,
            weak_client: None,
        }
    }

    /// Clear everything a stop invalidates, keeping configuration.
    pub fn clear_task_state(&mut self) {
        self.task = None;
        self.exit_status = None;
        self.start_errno = None;
        self.oom_killed = false;
        self.start_time = None;
        self.death_time = None;
        self.oom_fd = None;
    }
}

/// One container node.
#[derive(Debug)]
pub struct Container {
    id: u32,
    name: ContainerName,
    parent: Option<u32>,
    runtime: RwLock<Runtime>,
}

/// Read guard over a container's runtime, lock-order checked.
pub struct ContainerRead<'a>(RwLockReadGuard<'a, Runtime>);

/// Write guard over a container's runtime, lock-order checked.
pub struct ContainerWrite<'a>(RwLockWriteGuard<'a, Runtime>);

impl std::ops::Deref for ContainerRead<'_> {
    type Target = Runtime;
    fn deref(&self) -> &Runtime {
        &self.0
    }
}

impl std::ops::Deref for ContainerWrite<'_> {
    type Target = Runtime;
    fn deref(&self) -> &Runtime {
        &self.0
    }
}

impl std::ops::DerefMut for ContainerWrite<'_> {
    fn deref_mut(&mut self) -> &mut Runtime {
        &mut self.0
    }
}

impl Drop for ContainerRead<'_> {
    fn drop(&mut self) {
        lock_released();
    }
}

impl Drop for ContainerWrite<'_> {
    fn drop(&mut self) {
        lock_released();
    }
}

impl Container {
    fn new(id: u32, name: ContainerName, parent: Option<u32>, owner: Cred, state: ContainerState) -> Self {
        Self {
            id,
            name,
            parent,
            runtime: RwLock::new(Runtime::new(owner, state)),
        }
    }

    /// Container id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &ContainerName {
        &self.name
    }

    /// Parent container id, `None` for the root.
    #[must_use]
    pub fn parent_id(&self) -> Option<u32> {
        self.parent
    }

    /// Nesting level; the lock-order rank.
    #[must_use]
    pub fn level(&self) -> usize {
        self.name.level()
    }

    /// Take the read lock.
    pub fn read(&self) -> ContainerRead<'_> {
        let guard = self.runtime.read();
        lock_acquired(self.level());
        ContainerRead(guard)
    }

    /// Take the write lock.
    pub fn write(&self) -> ContainerWrite<'_> {
        let guard = self.runtime.write();
        lock_acquired(self.level());
        ContainerWrite(guard)
    }

    /// Current state without holding the lock afterwards.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.read().state
    }

    /// Cgroup of this container in one controller hierarchy.
    #[must_use]
    pub fn cgroup(&self, controller: Controller) -> Cgroup {
        Cgroup::for_container(controller, self.name.as_str())
    }

    /// Cgroups in every controller mounted on this host.
    #[must_use]
    pub fn cgroups(&self) -> Vec<Cgroup> {
        Controller::all()
            .iter()
            .filter(|c| c.supported())
            .map(|c| self.cgroup(*c))
            .collect()
    }

    /// Whether this container is the host root `/`.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.name.is_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, level_parent: Option<u32>) -> Container {
        Container::new(
            1,
            ContainerName::new(name).unwrap(),
            level_parent,
            Cred::root(),
            ContainerState::Stopped,
        )
    }

    #[test]
    fn guards_track_lock_stack() {
        let parent = node("a", None);
        let child = node("a/b", Some(1));

        // Parent before child is the sanctioned order.
        let p = parent.write();
        let c = child.write();
        drop(c);
        drop(p);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    #[cfg(debug_assertions)]
    fn child_before_parent_panics() {
        let parent = node("a", None);
        let child = node("a/b", Some(1));

        let _c = child.write();
        let _p = parent.write();
    }

    #[test]
    fn clear_task_state_keeps_config() {
        let ct = node("a", None);
        {
            let mut rt = ct.write();
            rt.props.set("command", "true").unwrap();
            rt.exit_status = Some(0);
            rt.oom_killed = true;
            rt.respawn_count = 3;
            rt.clear_task_state();
        }
        let rt = ct.read();
        assert_eq!(rt.props.command, "true");
        assert_eq!(rt.exit_status, None);
        assert!(!rt.oom_killed);
        // Respawn counters survive a stop.
        assert_eq!(rt.respawn_count, 3);
    }

    #[test]
    fn cgroup_paths_follow_name() {
        let ct = node("a/b", Some(1));
        let cg = ct.cgroup(Controller::Memory);
        assert_eq!(cg.name(), "/porto/a/b");
    }
}
