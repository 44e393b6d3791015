//! Read-only container data.
//!
//! Data names mirror properties on the API but are computed from runtime
//! state and the kernel rather than stored. Reads on a running container
//! go straight to the cgroups.

use std::sync::Arc;

use porto_common::{PortoError, PortoResult};

use super::Engine;
use crate::cgroup::{BlkioCg, Controller, CpuacctCg, MemoryCg};
use crate::container::property::split_index;
use crate::container::{Container, ContainerState};

/// One read-only data entry for DataList.
#[derive(Debug, Clone, Copy)]
pub struct DataDef {
    /// Data name on the API.
    pub name: &'static str,
    /// One-line description.
    pub desc: &'static str,
}

/// Every readable data name, in DataList order.
pub const DATA: &[DataDef] = &[
    DataDef { name: "absolute_name", desc: "Full name including the porto prefix" },
    DataDef { name: "state", desc: "Container state" },
    DataDef { name: "exit_status", desc: "Raw wait status after death" },
    DataDef { name: "start_errno", desc: "errno of a failed start" },
    DataDef { name: "oom_killed", desc: "Whether the task died from OOM" },
    DataDef { name: "respawn_count", desc: "Respawn attempts so far" },
    DataDef { name: "root_pid", desc: "Root task pid in the host namespace" },
    DataDef { name: "parent", desc: "Parent container name" },
    DataDef { name: "stdout", desc: "Collected stdout tail" },
    DataDef { name: "stderr", desc: "Collected stderr tail" },
    DataDef { name: "cpu_usage", desc: "CPU time consumed, nanoseconds" },
    DataDef { name: "memory_usage", desc: "Memory usage, bytes" },
    DataDef { name: "minor_faults", desc: "Minor page faults" },
    DataDef { name: "major_faults", desc: "Major page faults" },
    DataDef { name: "max_rss", desc: "Peak resident set size, bytes" },
    DataDef { name: "io_read", desc: "Bytes read per device" },
    DataDef { name: "io_write", desc: "Bytes written per device" },
    DataDef { name: "io_ops", desc: "IO operations per device" },
    DataDef { name: "net_bytes", desc: "Transmitted bytes per interface" },
    DataDef { name: "net_packets", desc: "Transmitted packets per interface" },
    DataDef { name: "net_drops", desc: "Egress drops per interface" },
    DataDef { name: "net_overlimits", desc: "Egress overlimits per interface" },
    DataDef { name: "net_rx_bytes", desc: "Received bytes per interface" },
    DataDef { name: "net_rx_packets", desc: "Received packets per interface" },
    DataDef { name: "net_rx_drops", desc: "Ingress drops per interface" },
    DataDef { name: "time", desc: "Seconds since start" },
    DataDef { name: "porto_stat", desc: "Daemon counters" },
];

/// Look up a data definition.
#[must_use]
pub fn data_def(name: &str) -> Option<&'static DataDef> {
    DATA.iter().find(|def| def.name == name)
}

impl Engine {
    /// Read one data value of a container.
    pub fn get_data(&self, name: &str, data: &str) -> PortoResult<String> {
        let ct = self.tree.find(name)?;
        let (base, index) = match split_index(data) {
            Some((base, index)) => (base, Some(index)),
            None => (data, None),
        };

        match base {
            "absolute_name" => Ok(if ct.is_root() {
                "/".to_string()
            } else {
                format!("/porto/{}", ct.name())
            }),
            "state" => Ok(ct.state().to_string()),
            "exit_status" => Ok(ct
                .read()
                .exit_status
                .map(|s| s.to_string())
                .unwrap_or_default()),
            "start_errno" => Ok(ct
                .read()
                .start_errno
                .map(|e| e.to_string())
                .unwrap_or_default()),
            "oom_killed" => Ok(porto_common::value::format_bool(ct.read().oom_killed).to_string()),
            "respawn_count" => Ok(ct.read().respawn_count.to_string()),
            "root_pid" => Ok(ct
                .read()
                .task
                .map(|t| t.host_pid.to_string())
                .unwrap_or_default()),
            "parent" => match ct.parent_id() {
                Some(id) => Ok(self.tree.find_by_id(id)?.name().as_str().to_string()),
                None => Ok(String::new()),
            },
            "stdout" => self.read_stdio(&ct, "stdout"),
            "stderr" => self.read_stdio(&ct, "stderr"),
            "cpu_usage" => Ok(CpuacctCg::usage(&ct.cgroup(Controller::Cpuacct))
                .unwrap_or(0)
                .to_string()),
            "memory_usage" => Ok(MemoryCg::usage(&ct.cgroup(Controller::Memory))
                .unwrap_or(0)
                .to_string()),
            "minor_faults" => self.memory_stat(&ct, "pgfault"),
            "major_faults" => self.memory_stat(&ct, "pgmajfault"),
            "max_rss" => Ok(MemoryCg::max_rss(&ct.cgroup(Controller::Memory))
                .unwrap_or(0)
                .to_string()),
            "io_read" => self.io_map(&ct, "blkio.throttle.io_service_bytes", "Read", index),
            "io_write" => self.io_map(&ct, "blkio.throttle.io_service_bytes", "Write", index),
            "io_ops" => self.io_map(&ct, "blkio.throttle.io_serviced", "Total", index),
            "net_bytes" | "net_packets" | "net_drops" | "net_overlimits" | "net_rx_bytes"
            | "net_rx_packets" | "net_rx_drops" => self.net_map(&ct, base, index),
            "time" => {
                let rt = ct.read();
                let seconds = match (rt.start_time, rt.death_time) {
                    (Some(start), Some(death)) => (death - start).num_seconds().max(0),
                    (Some(start), None) => (chrono::Utc::now() - start).num_seconds().max(0),
                    _ => 0,
                };
                Ok(seconds.to_string())
            }
            "porto_stat" => match index {
                Some(counter) => {
                    self.stats
                        .get(counter)
                        .map(|v| v.to_string())
                        .ok_or_else(|| PortoError::InvalidProperty {
                            property: data.to_string(),
                        })
                }
                None => Ok(self
                    .stats
                    .all()
                    .into_iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join("; ")),
            },
            _ => Err(PortoError::InvalidProperty {
                property: data.to_string(),
            }),
        }
    }

    fn read_stdio(&self, ct: &Arc<Container>, which: &str) -> PortoResult<String> {
        let (configured, limit) = {
            let rt = ct.read();
            let path = if which == "stdout" {
                rt.props.stdout_path.clone()
            } else {
                rt.props.stderr_path.clone()
            };
            (path, rt.props.stdout_limit)
        };
        let path = if configured.as_os_str().is_empty() {
            self.container_dir(ct.id()).join(which)
        } else {
            configured
        };

        match std::fs::read(&path) {
            Ok(data) => {
                let tail = &data[data.len().saturating_sub(limit as usize)..];
                Ok(String::from_utf8_lossy(tail).into_owned())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn memory_stat(&self, ct: &Arc<Container>, key: &str) -> PortoResult<String> {
        let value = MemoryCg::stat(&ct.cgroup(Controller::Memory))
            .ok()
            .and_then(|stat| stat.get(key).copied())
            .unwrap_or(0);
        Ok(value.to_string())
    }

    fn io_map(
        &self,
        ct: &Arc<Container>,
        knob: &str,
        op: &str,
        index: Option<&str>,
    ) -> PortoResult<String> {
        let map = BlkioCg::device_map(&ct.cgroup(Controller::Blkio), knob, op).unwrap_or_default();
        match index {
            Some(device) => map
                .get(device)
                .map(|v| v.to_string())
                .ok_or_else(|| PortoError::InvalidProperty {
                    property: format!("{knob}[{device}]"),
                }),
            None => Ok(map
                .into_iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join("; ")),
        }
    }

    fn net_map(&self, ct: &Arc<Container>, base: &str, index: Option<&str>) -> PortoResult<String> {
        let stats = self.network.class_stats(ct.id()).unwrap_or_default();
        let pick = |s: &crate::network::NetStats| match base {
            "net_bytes" => s.tx_bytes,
            "net_packets" => s.tx_packets,
            "net_drops" => s.tx_drops,
            "net_overlimits" => s.overlimits,
            "net_rx_bytes" => s.rx_bytes,
            "net_rx_packets" => s.rx_packets,
            _ => s.rx_drops,
        };
        match index {
            Some(iface) => Ok(stats.get(iface).map(pick).unwrap_or(0).to_string()),
            None => Ok(stats
                .iter()
                .map(|(k, v)| format!("{k}: {}", pick(v)))
                .collect::<Vec<_>>()
                .join("; ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use porto_common::{ContainerName, Cred, PortoPaths};

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PortoPaths::with_roots(dir.path().join("run"), dir.path().join("place"));
        (dir, Engine::new(Config::default(), paths).unwrap())
    }

    #[test]
    fn basic_data_reads() {
        let (_dir, engine) = engine();
        let ct = engine
            .create_container(&ContainerName::new("a").unwrap(), Cred::root(), None)
            .unwrap();

        assert_eq!(engine.get_data("a", "state").unwrap(), "stopped");
        assert_eq!(engine.get_data("a", "parent").unwrap(), "/");
        assert_eq!(engine.get_data("a", "exit_status").unwrap(), "");
        assert_eq!(engine.get_data("a", "oom_killed").unwrap(), "false");
        assert_eq!(engine.get_data("a", "absolute_name").unwrap(), "/porto/a");

        ct.write().exit_status = Some(256);
        assert_eq!(engine.get_data("a", "exit_status").unwrap(), "256");
    }

    #[test]
    fn unknown_data_is_invalid_property() {
        let (_dir, engine) = engine();
        engine
            .create_container(&ContainerName::new("a").unwrap(), Cred::root(), None)
            .unwrap();
        assert!(matches!(
            engine.get_data("a", "no_such"),
            Err(PortoError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn porto_stat_is_indexed() {
        let (_dir, engine) = engine();
        assert_eq!(
            engine.get_data("/", "porto_stat[containers_created]").unwrap(),
            "0"
        );
        assert!(engine.get_data("/", "porto_stat[bogus]").is_err());
        assert!(engine
            .get_data("/", "porto_stat")
            .unwrap()
            .contains("containers_created: 0"));
    }

    #[test]
    fn stdio_tail_reads_internal_file() {
        let (_dir, engine) = engine();
        let ct = engine
            .create_container(&ContainerName::new("a").unwrap(), Cred::root(), None)
            .unwrap();
        let dir = engine.container_dir(ct.id());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stdout"), b"hello porto\n").unwrap();

        assert_eq!(engine.get_data("a", "stdout").unwrap(), "hello porto\n");
        assert_eq!(engine.get_data("a", "stderr").unwrap(), "");
    }

    #[test]
    fn data_registry_is_complete() {
        assert!(data_def("state").is_some());
        assert!(data_def("porto_stat").is_some());
        assert!(data_def("bogus").is_none());
        assert_eq!(DATA.len(), 27);
    }
}
