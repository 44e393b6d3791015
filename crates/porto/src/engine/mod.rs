//! The engine: every piece of global state, owned by the event loop.
//!
//! The container tree, volume manager, key-value stores, event queue,
//! waiter registry and counters live here and are handed to helpers by
//! reference. Nothing in the core is a static.

pub mod data;
mod events;
pub mod helper;
mod ops;

pub use helper::OpReport;

use std::collections::{BTreeMap, HashMap};
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;
use porto_common::{ContainerName, Cred, PortoError, PortoPaths, PortoResult};

use crate::config::Config;
use crate::container::{Container, ContainerState, ContainerTree, WaitReport, WaiterRegistry};
use crate::events::{Event, EventQueue};
use crate::kvs::KvStore;
use crate::network::{Network, NoNetwork};
use crate::stats::Stats;
use crate::volume::VolumeManager;

/// An OOM eventfd the epoll loop must pick up or drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdUpdate {
    /// Container id the fd belongs to.
    pub container: u32,
    /// The raw eventfd; ownership stays with the container runtime.
    pub fd: RawFd,
    /// Register when true, deregister when false.
    pub add: bool,
}

/// A stop or destroy whose SIGTERM grace period is running.
#[derive(Debug)]
pub(crate) struct PendingStop {
    /// Client awaiting the response, if the stop came over the API.
    pub client: Option<u64>,
    /// Remove the subtree once stopped.
    pub destroy: bool,
}

/// All supervisor state.
pub struct Engine {
    /// Loaded configuration.
    pub config: Config,
    /// Standard paths.
    pub paths: PortoPaths,
    /// The container map.
    pub tree: ContainerTree,
    /// The volume map.
    pub volumes: VolumeManager,
    /// Persistent container records.
    pub kvs: KvStore,
    /// Deferred events.
    pub events: Mutex<EventQueue>,
    /// Wait registrations.
    pub waiters: Mutex<WaiterRegistry>,
    /// Completed waits the daemon has not yet written out.
    pub reports: Mutex<Vec<WaitReport>>,
    /// Completed deferred operations the daemon has not yet written out.
    pub op_reports: Mutex<Vec<OpReport>>,
    /// OOM fd changes the daemon must apply to its epoll set.
    pub fd_updates: Mutex<Vec<FdUpdate>>,
    /// Helper children in flight, keyed by pid.
    pub(crate) helpers: Mutex<HashMap<i32, helper::HelperOp>>,
    /// Stops waiting out their SIGTERM grace, keyed by root id.
    pub(crate) pending_stops: Mutex<HashMap<u32, PendingStop>>,
    /// Daemon-wide counters.
    pub stats: Stats,
    /// Network capability.
    pub network: Box<dyn Network>,
}

impl Engine {
    /// Assemble an engine from configuration and paths.
    pub fn new(config: Config, paths: PortoPaths) -> PortoResult<Self> {
        paths.create_dirs()?;
        let kvs = KvStore::open(paths.container_kvs(), config.daemon.keyvalue_limit)?;
        let volume_kvs = KvStore::open(paths.volume_kvs(), config.daemon.keyvalue_limit)?;
        let volumes = VolumeManager::new(
            paths.place.clone(),
            config.volumes.max_total,
            config.volumes.enable_quota,
            volume_kvs,
        );

        Ok(Self {
            tree: ContainerTree::new(config.container.max_total),
            volumes,
            kvs,
            events: Mutex::new(EventQueue::new()),
            waiters: Mutex::new(WaiterRegistry::new()),
            reports: Mutex::new(Vec::new()),
            op_reports: Mutex::new(Vec::new()),
            fd_updates: Mutex::new(Vec::new()),
            helpers: Mutex::new(HashMap::new()),
            pending_stops: Mutex::new(HashMap::new()),
            stats: Stats::new(),
            network: Box::new(NoNetwork),
            config,
            paths,
        })
    }

    /// Replace the network capability.
    #[must_use]
    pub fn with_network(mut self, network: Box<dyn Network>) -> Self {
        self.network = network;
        self
    }

    /// Drain pending OOM fd registrations for the epoll loop.
    pub fn take_fd_updates(&self) -> Vec<FdUpdate> {
        std::mem::take(&mut *self.fd_updates.lock())
    }

    /// Drain completed wait reports for delivery.
    pub fn take_reports(&self) -> Vec<WaitReport> {
        std::mem::take(&mut *self.reports.lock())
    }

    /// Persist one container's record.
    pub(crate) fn save_container(&self, ct: &Arc<Container>) -> PortoResult<()> {
        if ct.is_root() {
            return Ok(());
        }
        let mut map = {
            let rt = ct.read();
            let mut map = rt.props.to_map();
            map.insert("_name".to_string(), ct.name().as_str().to_string());
            map.insert("_state".to_string(), rt.state.to_string());
            map.insert("_owner_uid".to_string(), rt.owner.uid.to_string());
            map.insert("_owner_gid".to_string(), rt.owner.gid.to_string());
            map.insert("_respawn_count".to_string(), rt.respawn_count.to_string());
            if let Some(task) = rt.task {
                map.insert("_root_pid".to_string(), task.host_pid.to_string());
                map.insert("_parent_pid".to_string(), task.parent_pid.to_string());
                map.insert("_container_pid".to_string(), task.container_pid.to_string());
            }
            map
        };
        map.insert("_id".to_string(), ct.id().to_string());
        self.kvs.save(ct.id(), &map)
    }

    /// Restore containers and volumes after a slave restart.
    ///
    /// Containers recorded as active come back as lost-and-restored and a
    /// CgroupSync event reconciles them with the kernel.
    pub fn restore(&self) -> PortoResult<()> {
        let (nodes, failed) = self.kvs.load_all()?;
        for _ in 0..failed {
            Stats::bump(&self.stats.restore_failed);
        }

        let mut lost_any = false;
        for node in nodes {
            match self.restore_node(node.id, &node.data) {
                Ok(lost) => lost_any |= lost,
                Err(e) => {
                    tracing::warn!(id = node.id, error = %e, "container restore failed");
                    Stats::bump(&self.stats.restore_failed);
                    let _ = self.kvs.remove(node.id);
                }
            }
        }

        let volume_failures = self.volumes.restore()?;
        for _ in 0..volume_failures {
            Stats::bump(&self.stats.volume_restore_failed);
        }

        if lost_any {
            self.events
                .lock()
                .add(std::time::Duration::ZERO, Event::CgroupSync);
        }
        Ok(())
    }

    fn restore_node(&self, id: u32, data: &BTreeMap<String, String>) -> PortoResult<bool> {
        let name = data
            .get("_name")
            .ok_or_else(|| PortoError::unknown("record without a name"))?;
        let name = ContainerName::new(name.as_str())?;
        let recorded: ContainerState = data
            .get("_state")
            .map(String::as_str)
            .unwrap_or("stopped")
            .parse()?;
        let owner = Cred::new(
            parse_u32(data.get("_owner_uid"))?,
            parse_u32(data.get("_owner_gid"))?,
        );

        let (state, lost) = match recorded {
            ContainerState::Running
            | ContainerState::Starting
            | ContainerState::Paused
            | ContainerState::LostAndRestored => (ContainerState::LostAndRestored, true),
            ContainerState::Meta => (ContainerState::Meta, false),
            ContainerState::Dead => (ContainerState::Dead, false),
            _ => (ContainerState::Stopped, false),
        };

        let ct = self.tree.restore(&name, id, owner, state)?;
        {
            let mut rt = ct.write();
            rt.props = crate::container::Properties::from_map(data);
            rt.respawn_count = data
                .get("_respawn_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if let (Some(host), Some(parent), Some(container)) = (
                data.get("_root_pid").and_then(|v| v.parse().ok()),
                data.get("_parent_pid").and_then(|v| v.parse().ok()),
                data.get("_container_pid").and_then(|v| v.parse().ok()),
            ) {
                rt.task = Some(crate::exec::TaskHandle {
                    host_pid: host,
                    parent_pid: parent,
                    container_pid: container,
                });
            }
        }
        tracing::info!(container = %name, id, state = %state, "container restored");
        Ok(lost)
    }

    /// A client disconnected: cancel its waiters and schedule destruction
    /// of its weak containers.
    pub fn client_disconnected(&self, client: u64) {
        self.waiters.lock().remove_client(client);

        let weak: Vec<u32> = self
            .tree
            .list()
            .iter()
            .filter(|ct| ct.read().weak_client == Some(client))
            .map(|ct| ct.id())
            .collect();

        let mut events = self.events.lock();
        for container in weak {
            events.add(
                std::time::Duration::ZERO,
                Event::DestroyWeakContainer { container },
            );
        }
    }
}

fn parse_u32(value: Option<&String>) -> PortoResult<u32> {
    value
        .ok_or_else(|| PortoError::unknown("record without owner"))?
        .parse()
        .map_err(|_| PortoError::unknown("bad owner in record"))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PortoPaths::with_roots(dir.path().join("run"), dir.path().join("place"));
        let engine = Engine::new(Config::default(), paths).unwrap();
        (dir, engine)
    }

    #[test]
    fn engine_starts_with_roots_only() {
        let (_dir, engine) = test_engine();
        assert_eq!(engine.tree.count(), 2);
        assert!(engine.events.lock().is_empty());
    }

    #[test]
    fn restore_roundtrip_preserves_config_and_state() {
        let (_dir, engine) = test_engine();
        let name = ContainerName::new("a").unwrap();
        let ct = engine.tree.create(&name, Cred::new(5, 5)).unwrap();
        {
            let mut rt = ct.write();
            rt.props.set("command", "sleep 10").unwrap();
            rt.props.set("memory_limit", "64M").unwrap();
            rt.state = ContainerState::Dead;
            rt.respawn_count = 2;
        }
        engine.save_container(&ct).unwrap();
        let id = ct.id();

        // A fresh engine over the same directories plays the records back.
        let engine2 = Engine::new(Config::default(), engine.paths.clone()).unwrap();
        engine2.restore().unwrap();

        let restored = engine2.tree.find("a").unwrap();
        assert_eq!(restored.id(), id);
        assert_eq!(restored.state(), ContainerState::Dead);
        let rt = restored.read();
        assert_eq!(rt.props.command, "sleep 10");
        assert_eq!(rt.props.memory_limit, 64 << 20);
        assert_eq!(rt.owner.uid, 5);
        assert_eq!(rt.respawn_count, 2);
    }

    #[test]
    fn restore_marks_running_containers_lost() {
        let (_dir, engine) = test_engine();
        let name = ContainerName::new("a").unwrap();
        let ct = engine.tree.create(&name, Cred::root()).unwrap();
        {
            let mut rt = ct.write();
            rt.state = ContainerState::Running;
            rt.task = Some(crate::exec::TaskHandle {
                host_pid: 12345,
                parent_pid: 12345,
                container_pid: 1,
            });
        }
        engine.save_container(&ct).unwrap();

        let engine2 = Engine::new(Config::default(), engine.paths.clone()).unwrap();
        engine2.restore().unwrap();

        let restored = engine2.tree.find("a").unwrap();
        assert_eq!(restored.state(), ContainerState::LostAndRestored);
        assert_eq!(restored.read().task.unwrap().host_pid, 12345);
        // A CgroupSync is queued to reconcile it.
        assert_eq!(engine2.events.lock().len(), 1);
    }

    #[test]
    fn restore_is_idempotent() {
        let (_dir, engine) = test_engine();
        let name = ContainerName::new("a").unwrap();
        let ct = engine.tree.create(&name, Cred::root()).unwrap();
        ct.write().state = ContainerState::Dead;
        engine.save_container(&ct).unwrap();

        let engine2 = Engine::new(Config::default(), engine.paths.clone()).unwrap();
        engine2.restore().unwrap();
        let engine3 = Engine::new(Config::default(), engine.paths.clone()).unwrap();
        engine3.restore().unwrap();

        assert_eq!(engine2.tree.count(), engine3.tree.count());
        assert_eq!(
            engine2.tree.find("a").unwrap().state(),
            engine3.tree.find("a").unwrap().state()
        );
    }

    #[test]
    fn disconnect_schedules_weak_destruction() {
        let (_dir, engine) = test_engine();
        let name = ContainerName::new("tmp").unwrap();
        let ct = engine.tree.create(&name, Cred::root()).unwrap();
        ct.write().weak_client = Some(77);

        engine.client_disconnected(77);
        assert_eq!(engine.events.lock().len(), 1);
    }
}
