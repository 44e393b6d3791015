//! Cgroup v1 management.
//!
//! One [`Cgroup`] object represents a (controller, hierarchical-name)
//! pair under `/sys/fs/cgroup`. Containers own one cgroup per configured
//! controller, all rooted at the `porto` slice.

mod subsystem;

pub use subsystem::{
    BlkioCg, CpuCg, CpuacctCg, CpusetCg, DevicesCg, FreezerCg, HugetlbCg, MemoryCg, NetClsCg,
    PidsCg,
};

use std::collections::HashMap;
use std::path::PathBuf;

use porto_common::{PortoError, PortoResult};

/// Root of the cgroup v1 mount.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Slice all porto-managed cgroups live under.
pub const PORTO_CGROUP_PREFIX: &str = "/porto";

/// A cgroup v1 controller kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    /// memory
    Memory,
    /// cpu
    Cpu,
    /// cpuacct
    Cpuacct,
    /// cpuset
    Cpuset,
    /// devices
    Devices,
    /// blkio
    Blkio,
    /// freezer
    Freezer,
    /// hugetlb
    Hugetlb,
    /// pids
    Pids,
    /// net_cls
    NetCls,
}

impl Controller {
    /// Kernel name of the controller.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Cpuset => "cpuset",
            Self::Devices => "devices",
            Self::Blkio => "blkio",
            Self::Freezer => "freezer",
            Self::Hugetlb => "hugetlb",
            Self::Pids => "pids",
            Self::NetCls => "net_cls",
        }
    }

    /// Every controller porto knows about.
    #[must_use]
    pub fn all() -> &'static [Controller] {
        &[
            Self::Memory,
            Self::Cpu,
            Self::Cpuacct,
            Self::Cpuset,
            Self::Devices,
            Self::Blkio,
            Self::Freezer,
            Self::Hugetlb,
            Self::Pids,
            Self::NetCls,
        ]
    }

    /// Whether the controller hierarchy is mounted on this host.
    #[must_use]
    pub fn supported(&self) -> bool {
        PathBuf::from(CGROUP_ROOT).join(self.name()).is_dir()
    }
}

impl std::fmt::Display for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One cgroup directory in one controller hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    controller: Controller,
    /// Hierarchical name, `/` for the hierarchy root, `/porto/a/b` for
    /// container `a/b`.
    name: String,
}

impl Cgroup {
    /// The root cgroup of a controller hierarchy.
    #[must_use]
    pub fn root(controller: Controller) -> Self {
        Self {
            controller,
            name: "/".to_string(),
        }
    }

    /// The porto slice of a controller hierarchy.
    #[must_use]
    pub fn porto_root(controller: Controller) -> Self {
        Self {
            controller,
            name: PORTO_CGROUP_PREFIX.to_string(),
        }
    }

    /// Cgroup of a container in a controller hierarchy.
    #[must_use]
    pub fn for_container(controller: Controller, container_name: &str) -> Self {
        let name = if container_name == "/" {
            PORTO_CGROUP_PREFIX.to_string()
        } else {
            format!("{PORTO_CGROUP_PREFIX}/{container_name}")
        };
        Self { controller, name }
    }

    /// The controller this cgroup belongs to.
    #[must_use]
    pub fn controller(&self) -> Controller {
        self.controller
    }

    /// Hierarchical name of the cgroup.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute filesystem path of the cgroup directory.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        let mut path = PathBuf::from(CGROUP_ROOT).join(self.controller.name());
        if self.name != "/" {
            path.push(self.name.trim_start_matches('/'));
        }
        path
    }

    /// A child cgroup one level down.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        let base = if self.name == "/" { "" } else { &self.name };
        Self {
            controller: self.controller,
            name: format!("{base}/{name}"),
        }
    }

    /// Whether the cgroup directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path().is_dir()
    }

    /// Create the cgroup directory, including missing ancestors.
    pub fn create(&self) -> PortoResult<()> {
        tracing::debug!(cgroup = %self, "creating cgroup");
        std::fs::create_dir_all(self.path()).map_err(|e| self.error("mkdir", e))
    }

    /// Remove the cgroup directory.
    ///
    /// Fails with [`PortoError::Busy`] while processes remain; callers
    /// retry because the kernel empties cgroups lazily.
    pub fn remove(&self) -> PortoResult<()> {
        tracing::debug!(cgroup = %self, "removing cgroup");
        match std::fs::remove_dir(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Err(PortoError::Busy {
                message: format!("cgroup {self} is not empty"),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error("rmdir", e)),
        }
    }

    /// Whether the cgroup has neither processes nor child cgroups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.get_processes().map_or(true, |pids| pids.is_empty())
    }

    /// Move a process into the cgroup.
    pub fn attach(&self, pid: libc::pid_t) -> PortoResult<()> {
        tracing::debug!(cgroup = %self, pid, "attaching process");
        self.set_string("cgroup.procs", &pid.to_string())
    }

    /// List member process ids.
    pub fn get_processes(&self) -> PortoResult<Vec<libc::pid_t>> {
        self.read_pids("cgroup.procs")
    }

    /// List member task (thread) ids.
    pub fn get_tasks(&self) -> PortoResult<Vec<libc::pid_t>> {
        self.read_pids("tasks")
    }

    /// Number of processes or threads in the cgroup.
    pub fn get_count(&self, threads: bool) -> PortoResult<usize> {
        let knob = if threads { "tasks" } else { "cgroup.procs" };
        Ok(self.read_pids(knob)?.len())
    }

    fn read_pids(&self, knob: &str) -> PortoResult<Vec<libc::pid_t>> {
        let text = self.get_string(knob)?;
        Ok(text
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// Path of a knob file inside the cgroup.
    #[must_use]
    pub fn knob(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }

    /// Whether a knob file exists.
    #[must_use]
    pub fn has_knob(&self, name: &str) -> bool {
        self.knob(name).exists()
    }

    /// Read a knob as a string.
    pub fn get_string(&self, knob: &str) -> PortoResult<String> {
        std::fs::read_to_string(self.knob(knob)).map_err(|e| self.knob_error(knob, e))
    }

    /// Write a string to a knob.
    pub fn set_string(&self, knob: &str, value: &str) -> PortoResult<()> {
        std::fs::write(self.knob(knob), value).map_err(|e| self.knob_error(knob, e))
    }

    /// Write a knob, silently ignoring a missing file.
    ///
    /// Optional knobs vary by kernel build; porto has always treated
    /// their absence as success.
    pub fn set_string_opt(&self, knob: &str, value: &str) -> PortoResult<()> {
        if !self.has_knob(knob) {
            return Ok(());
        }
        self.set_string(knob, value)
    }

    /// Read a knob as u64.
    pub fn get_uint64(&self, knob: &str) -> PortoResult<u64> {
        let text = self.get_string(knob)?;
        text.trim().parse().map_err(|_| PortoError::Cgroup {
            knob: knob.to_string(),
            message: format!("unparsable value {:?}", text.trim()),
            errno: 0,
        })
    }

    /// Write a u64 to a knob.
    pub fn set_uint64(&self, knob: &str, value: u64) -> PortoResult<()> {
        self.set_string(knob, &value.to_string())
    }

    /// Read a knob as i64; `max` and negative values pass through.
    pub fn get_int64(&self, knob: &str) -> PortoResult<i64> {
        let text = self.get_string(knob)?;
        let trimmed = text.trim();
        if trimmed == "max" {
            return Ok(i64::MAX);
        }
        trimmed.parse().map_err(|_| PortoError::Cgroup {
            knob: knob.to_string(),
            message: format!("unparsable value {trimmed:?}"),
            errno: 0,
        })
    }

    /// Write an i64 to a knob.
    pub fn set_int64(&self, knob: &str, value: i64) -> PortoResult<()> {
        self.set_string(knob, &value.to_string())
    }

    /// Read a 0/1 knob as bool.
    pub fn get_bool(&self, knob: &str) -> PortoResult<bool> {
        Ok(self.get_uint64(knob)? != 0)
    }

    /// Write a bool to a knob as 0/1.
    pub fn set_bool(&self, knob: &str, value: bool) -> PortoResult<()> {
        self.set_string(knob, if value { "1" } else { "0" })
    }

    /// Read a `key value` per line knob like `memory.stat`.
    pub fn get_uint_map(&self, knob: &str) -> PortoResult<HashMap<String, u64>> {
        let text = self.get_string(knob)?;
        let mut map = HashMap::new();
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
                if let Ok(value) = value.parse() {
                    map.insert(key.to_string(), value);
                }
            }
        }
        Ok(map)
    }

    /// One kill sweep over every process in the cgroup.
    ///
    /// Freezes the matching freezer cgroup, signals the set, thaws, and
    /// returns how many pids were signaled. Racing forks can repopulate
    /// the group, so callers re-run the sweep from a scheduled event
    /// until it reports zero; nothing here sleeps or waits.
    pub fn kill_all(&self, signal: i32) -> PortoResult<usize> {
        let pids = self.get_processes()?;
        if pids.is_empty() {
            return Ok(0);
        }

        tracing::debug!(cgroup = %self, signal, count = pids.len(), "killing processes");

        // An unconfirmed freeze is fine: signals queue against freezing
        // tasks and fire on thaw.
        let freezer = Cgroup {
            controller: Controller::Freezer,
            name: self.name.clone(),
        };
        let frozen = freezer.exists() && freezer.set_string("freezer.state", "FROZEN").is_ok();

        for pid in &pids {
            // Racing exits leave stale pids behind, ESRCH is fine.
            unsafe {
                libc::kill(*pid, signal);
            }
        }

        if frozen {
            let _ = freezer.set_string("freezer.state", "THAWED");
        }
        Ok(pids.len())
    }

    fn error(&self, op: &str, e: std::io::Error) -> PortoError {
        PortoError::Cgroup {
            knob: format!("{}:{}", self.controller, self.name),
            message: format!("{op} failed: {e}"),
            errno: e.raw_os_error().unwrap_or(0),
        }
    }

    fn knob_error(&self, knob: &str, e: std::io::Error) -> PortoError {
        PortoError::Cgroup {
            knob: format!("{}.{}", self.controller, knob),
            message: e.to_string(),
            errno: e.raw_os_error().unwrap_or(0),
        }
    }
}

impl std::fmt::Display for Cgroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.controller, self.name)
    }
}

/// Find the cgroup name of a pid in one controller hierarchy by parsing
/// `/proc/<pid>/cgroup`.
pub fn pid_cgroup(pid: libc::pid_t, controller: Controller) -> PortoResult<String> {
    let text = std::fs::read_to_string(format!("/proc/{pid}/cgroup"))?;
    for line in text.lines() {
        let mut parts = line.splitn(3, ':');
        let (_, controllers, path) = (parts.next(), parts.next(), parts.next());
        if let (Some(controllers), Some(path)) = (controllers, path) {
            if controllers.split(',').any(|c| c == controller.name()) {
                return Ok(path.to_string());
            }
        }
    }
    Err(PortoError::unknown(format!(
        "no {controller} cgroup for pid {pid}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted_at_porto() {
        let cg = Cgroup::for_container(Controller::Memory, "a/b");
        assert_eq!(cg.name(), "/porto/a/b");
        assert_eq!(
            cg.path(),
            PathBuf::from("/sys/fs/cgroup/memory/porto/a/b")
        );

        let root = Cgroup::for_container(Controller::Freezer, "/");
        assert_eq!(root.name(), "/porto");
    }

    #[test]
    fn child_extends_name() {
        let cg = Cgroup::porto_root(Controller::Cpu);
        assert_eq!(cg.child("x").name(), "/porto/x");
        assert_eq!(Cgroup::root(Controller::Cpu).child("x").name(), "/x");
    }

    #[test]
    fn controller_names_match_kernel() {
        assert_eq!(Controller::NetCls.name(), "net_cls");
        assert_eq!(Controller::all().len(), 10);
    }

    #[test]
    #[ignore = "requires root and cgroup v1"]
    fn create_attach_remove() {
        let cg = Cgroup::for_container(Controller::Freezer, "porto-test");
        cg.create().unwrap();
        assert!(cg.exists());
        assert!(cg.is_empty());
        cg.remove().unwrap();
    }
}
