//! Per-controller knob façades.
//!
//! Free functions grouped by controller, each taking the [`Cgroup`] they
//! operate on. The container layer composes these instead of touching
//! knob files directly.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use porto_common::{PortoError, PortoResult};

use super::Cgroup;

/// memory controller knobs.
pub struct MemoryCg;

impl MemoryCg {
    /// Hard limit; also caps memory+swap when the knob exists.
    pub fn set_limit(cg: &Cgroup, limit: u64) -> PortoResult<()> {
        if limit == 0 {
            cg.set_int64("memory.limit_in_bytes", -1)?;
            return cg.set_string_opt("memory.memsw.limit_in_bytes", "-1");
        }
        cg.set_uint64("memory.limit_in_bytes", limit)?;
        cg.set_string_opt("memory.memsw.limit_in_bytes", &limit.to_string())
    }

    /// Soft limit used as reclaim pressure target.
    pub fn set_guarantee(cg: &Cgroup, bytes: u64) -> PortoResult<()> {
        cg.set_string_opt("memory.low_limit_in_bytes", &bytes.to_string())
    }

    /// Anonymous memory limit, a porto kernel extension.
    pub fn set_anon_limit(cg: &Cgroup, bytes: u64) -> PortoResult<()> {
        cg.set_string_opt("memory.anon.limit", &bytes.to_string())
    }

    /// Dirty page limit.
    pub fn set_dirty_limit(cg: &Cgroup, bytes: u64) -> PortoResult<()> {
        cg.set_string_opt("memory.dirty.limit_in_bytes", &bytes.to_string())
    }

    /// Recharge pages to the faulting cgroup, kernel extension.
    pub fn set_recharge_on_pgfault(cg: &Cgroup, on: bool) -> PortoResult<()> {
        cg.set_string_opt("memory.recharge_on_pgfault", if on { "1" } else { "0" })
    }

    /// Filesystem bandwidth limit, kernel extension.
    pub fn set_io_limit(cg: &Cgroup, bytes_per_s: u64) -> PortoResult<()> {
        cg.set_string_opt("memory.fs_bps_limit", &bytes_per_s.to_string())
    }

    /// Filesystem iops limit, kernel extension.
    pub fn set_io_ops_limit(cg: &Cgroup, ops_per_s: u64) -> PortoResult<()> {
        cg.set_string_opt("memory.fs_iops_limit", &ops_per_s.to_string())
    }

    /// Current usage in bytes.
    pub fn usage(cg: &Cgroup) -> PortoResult<u64> {
        cg.get_uint64("memory.usage_in_bytes")
    }

    /// Full memory.stat map.
    pub fn stat(cg: &Cgroup) -> PortoResult<HashMap<String, u64>> {
        cg.get_uint_map("memory.stat")
    }

    /// Peak resident set size in bytes.
    pub fn max_rss(cg: &Cgroup) -> PortoResult<u64> {
        Ok(Self::stat(cg)?.get("max_rss").copied().unwrap_or(0))
    }

    /// Disable the kernel OOM killer inside the cgroup.
    pub fn set_oom_kill_disable(cg: &Cgroup, disable: bool) -> PortoResult<()> {
        cg.set_string_opt("memory.oom_control", if disable { "1" } else { "0" })
    }

    /// Wire an eventfd to the cgroup's OOM notifications.
    ///
    /// Opens `memory.oom_control`, creates a non-blocking eventfd and
    /// registers the pair through `cgroup.event_control` in one write.
    /// The returned fd becomes readable on every OOM kill in the group.
    pub fn setup_oom_event(cg: &Cgroup) -> PortoResult<OwnedFd> {
        let oom_control = std::fs::File::open(cg.knob("memory.oom_control"))
            .map_err(|e| PortoError::Cgroup {
                knob: "memory.oom_control".to_string(),
                message: e.to_string(),
                errno: e.raw_os_error().unwrap_or(0),
            })?;
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(PortoError::from_errno("eventfd failed"));
        }
        // SAFETY: raw is a freshly created fd owned by nobody else.
        let event_fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let line = format!("{} {}", event_fd.as_raw_fd(), oom_control.as_raw_fd());
        cg.set_string("cgroup.event_control", &line)?;
        Ok(event_fd)
    }
}

/// cpu controller knobs.
pub struct CpuCg;

impl CpuCg {
    /// Bandwidth limit as a fraction of one core, in milli-cores.
    pub fn set_limit(cg: &Cgroup, millicores: u64) -> PortoResult<()> {
        const PERIOD_US: u64 = 100_000;
        if millicores == 0 {
            return cg.set_int64("cpu.cfs_quota_us", -1);
        }
        cg.set_uint64("cpu.cfs_period_us", PERIOD_US)?;
        let quota = (PERIOD_US * millicores / 1000).max(1000);
        cg.set_uint64("cpu.cfs_quota_us", quota)
    }

    /// Relative weight from a guarantee in milli-cores.
    pub fn set_guarantee(cg: &Cgroup, millicores: u64) -> PortoResult<()> {
        // cpu.shares baseline is 1024 per core.
        let shares = (millicores * 1024 / 1000).max(2);
        cg.set_uint64("cpu.shares", shares)
    }

    /// Scheduling policy: normal, rt, idle or batch.
    pub fn set_policy(cg: &Cgroup, policy: &str) -> PortoResult<()> {
        match policy {
            "normal" | "batch" => cg.set_string_opt("cpu.rt_runtime_us", "0"),
            "rt" => cg.set_string_opt("cpu.rt_runtime_us", "-1"),
            "idle" => cg.set_string_opt("cpu.idle", "1"),
            other => Err(PortoError::InvalidValue {
                message: format!("unknown cpu policy: {other}"),
            }),
        }
    }
}

/// cpuacct controller knobs.
pub struct CpuacctCg;

impl CpuacctCg {
    /// Cumulative cpu usage in nanoseconds.
    pub fn usage(cg: &Cgroup) -> PortoResult<u64> {
        cg.get_uint64("cpuacct.usage")
    }
}

/// cpuset controller knobs.
pub struct CpusetCg;

impl CpusetCg {
    /// Bind to a cpu list, empty inherits the parent mask.
    pub fn set_cpus(cg: &Cgroup, cpus: &str) -> PortoResult<()> {
        if cpus.is_empty() {
            let parent = cg.path().parent().map(|p| p.join("cpuset.cpus"));
            if let Some(parent) = parent {
                let mask = std::fs::read_to_string(parent)?;
                return cg.set_string("cpuset.cpus", mask.trim());
            }
        }
        cg.set_string("cpuset.cpus", cpus)
    }

    /// Bind to a memory-node list.
    pub fn set_mems(cg: &Cgroup, mems: &str) -> PortoResult<()> {
        if mems.is_empty() {
            let parent = cg.path().parent().map(|p| p.join("cpuset.mems"));
            if let Some(parent) = parent {
                let mask = std::fs::read_to_string(parent)?;
                return cg.set_string("cpuset.mems", mask.trim());
            }
        }
        cg.set_string("cpuset.mems", mems)
    }
}

/// devices controller knobs.
pub struct DevicesCg;

impl DevicesCg {
    /// Deny all device access.
    pub fn deny_all(cg: &Cgroup) -> PortoResult<()> {
        cg.set_string("devices.deny", "a")
    }

    /// Allow one device rule, e.g. `c 1:3 rwm`.
    pub fn allow(cg: &Cgroup, rule: &str) -> PortoResult<()> {
        cg.set_string("devices.allow", rule)
    }

    /// Default rules every container gets: null, zero, full, random,
    /// urandom, tty, console, ptmx and pts.
    pub fn apply_defaults(cg: &Cgroup) -> PortoResult<()> {
        Self::deny_all(cg)?;
        for rule in [
            "c 1:3 rwm",   // null
            "c 1:5 rwm",   // zero
            "c 1:7 rwm",   // full
            "c 1:8 rwm",   // random
            "c 1:9 rwm",   // urandom
            "c 5:0 rwm",   // tty
            "c 5:1 rwm",   // console
            "c 5:2 rwm",   // ptmx
            "c 136:* rwm", // pts
        ] {
            Self::allow(cg, rule)?;
        }
        Ok(())
    }
}

/// blkio controller knobs.
pub struct BlkioCg;

impl BlkioCg {
    /// Relative weight, 100..1000.
    pub fn set_weight(cg: &Cgroup, weight: u64) -> PortoResult<()> {
        cg.set_string_opt("blkio.weight", &weight.to_string())
    }

    /// Throttle read bandwidth on one device.
    pub fn set_read_bps(cg: &Cgroup, device: &str, limit: u64) -> PortoResult<()> {
        cg.set_string("blkio.throttle.read_bps_device", &format!("{device} {limit}"))
    }

    /// Throttle write bandwidth on one device.
    pub fn set_write_bps(cg: &Cgroup, device: &str, limit: u64) -> PortoResult<()> {
        cg.set_string(
            "blkio.throttle.write_bps_device",
            &format!("{device} {limit}"),
        )
    }

    /// Per-device io statistics from one of the service files.
    pub fn device_map(cg: &Cgroup, knob: &str, op: &str) -> PortoResult<HashMap<String, u64>> {
        let text = cg.get_string(knob)?;
        let mut map = HashMap::new();
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(dev), Some(kind), Some(value)) = (parts.next(), parts.next(), parts.next())
            {
                if kind == op {
                    if let Ok(value) = value.parse() {
                        map.insert(dev.to_string(), value);
                    }
                }
            }
        }
        Ok(map)
    }
}

/// freezer controller knobs.
pub struct FreezerCg;

impl FreezerCg {
    /// Start freezing the cgroup.
    ///
    /// The kernel freezer is asynchronous: the group sits in FREEZING
    /// until every task parks. Nothing waits here; callers that care
    /// poll [`FreezerCg::state`] from a scheduled event.
    pub fn freeze(cg: &Cgroup) -> PortoResult<()> {
        cg.set_string("freezer.state", "FROZEN")
    }

    /// Thaw the cgroup.
    pub fn thaw(cg: &Cgroup) -> PortoResult<()> {
        cg.set_string("freezer.state", "THAWED")
    }

    /// Current freezer state: THAWED, FREEZING or FROZEN.
    pub fn state(cg: &Cgroup) -> PortoResult<String> {
        Ok(cg.get_string("freezer.state")?.trim().to_string())
    }

    /// Whether the cgroup is frozen or freezing.
    pub fn is_frozen(cg: &Cgroup) -> PortoResult<bool> {
        Ok(Self::state(cg)? != "THAWED")
    }
}

/// hugetlb controller knobs.
pub struct HugetlbCg;

impl HugetlbCg {
    /// Limit 2MB huge pages usage in bytes.
    pub fn set_limit(cg: &Cgroup, bytes: u64) -> PortoResult<()> {
        cg.set_string_opt("hugetlb.2MB.limit_in_bytes", &bytes.to_string())
    }
}

/// pids controller knobs.
pub struct PidsCg;

impl PidsCg {
    /// Thread/process count limit.
    pub fn set_limit(cg: &Cgroup, limit: u64) -> PortoResult<()> {
        if limit == 0 {
            return cg.set_string("pids.max", "max");
        }
        cg.set_uint64("pids.max", limit)
    }

    /// Current count.
    pub fn current(cg: &Cgroup) -> PortoResult<u64> {
        cg.get_uint64("pids.current")
    }
}

/// net_cls controller knobs.
pub struct NetClsCg;

impl NetClsCg {
    /// Tag traffic with a `major:minor` class id; the minor is the
    /// container id.
    pub fn set_classid(cg: &Cgroup, major: u32, minor: u32) -> PortoResult<()> {
        let classid = (u64::from(major) << 16) | u64::from(minor);
        cg.set_uint64("net_cls.classid", classid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::Controller;

    #[test]
    fn classid_packs_major_minor() {
        // 1:7 -> 0x10007
        let classid = (1u64 << 16) | 7;
        assert_eq!(classid, 0x10007);
    }

    #[test]
    #[ignore = "requires root and cgroup v1"]
    fn freeze_thaw_cycle() {
        let cg = Cgroup::for_container(Controller::Freezer, "porto-test-freeze");
        cg.create().unwrap();
        FreezerCg::freeze(&cg).unwrap();
        assert!(FreezerCg::is_frozen(&cg).unwrap());
        FreezerCg::thaw(&cg).unwrap();
        cg.remove().unwrap();
    }

    #[test]
    #[ignore = "requires root and cgroup v1"]
    fn oom_event_wiring() {
        let cg = Cgroup::for_container(Controller::Memory, "porto-test-oom");
        cg.create().unwrap();
        let fd = MemoryCg::setup_oom_event(&cg).unwrap();
        assert!(fd.as_raw_fd() >= 0);
        drop(fd);
        cg.remove().unwrap();
    }
}
