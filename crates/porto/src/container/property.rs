//! Container property model.
//!
//! Every configurable knob of a container is a named property with a
//! string form on the API and a typed form here. Dynamic properties may
//! be changed while the container runs; the rest only while it is
//! stopped. The same string form is what the key-value store persists.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use porto_common::value::{format_bool, format_size, parse_bool, parse_env_list, parse_size};
use porto_common::{PortoError, PortoResult};

use crate::exec::Rlimit;
use crate::namespace::mount::BindMount;

/// How much of the porto API a container's tasks may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum EnablePorto {
    /// No access at all.
    None,
    /// Read-only access.
    ReadOnly,
    /// No access itself, children may.
    ChildOnly,
    /// Full access confined to the subtree.
    Isolate,
    /// Full access.
    Normal,
}

impl fmt::Display for EnablePorto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::ReadOnly => "read-only",
            Self::ChildOnly => "child-only",
            Self::Isolate => "isolate",
            Self::Normal => "true",
        };
        f.write_str(s)
    }
}

impl FromStr for EnablePorto {
    type Err = PortoError;

    fn from_str(s: &str) -> PortoResult<Self> {
        match s {
            "none" | "false" => Ok(Self::None),
            "read-only" => Ok(Self::ReadOnly),
            "child-only" => Ok(Self::ChildOnly),
            "isolate" => Ok(Self::Isolate),
            "true" => Ok(Self::Normal),
            other => Err(PortoError::InvalidValue {
                message: format!("unknown enable_porto value: {other}"),
            }),
        }
    }
}

/// Virtualization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VirtMode {
    /// One application, porto manages stdio and respawn.
    App,
    /// A full OS payload with its own init.
    Os,
}

impl fmt::Display for VirtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::App => "app",
            Self::Os => "os",
        })
    }
}

impl FromStr for VirtMode {
    type Err = PortoError;

    fn from_str(s: &str) -> PortoResult<Self> {
        match s {
            "app" => Ok(Self::App),
            "os" => Ok(Self::Os),
            other => Err(PortoError::InvalidValue {
                message: format!("unknown virt_mode: {other}"),
            }),
        }
    }
}

/// Capability names to bit numbers, the subset porto manages.
const CAPABILITIES: &[(&str, u64)] = &[
    ("CHOWN", 0),
    ("DAC_OVERRIDE", 1),
    ("DAC_READ_SEARCH", 2),
    ("FOWNER", 3),
    ("FSETID", 4),
    ("KILL", 5),
    ("SETGID", 6),
    ("SETUID", 7),
    ("SETPCAP", 8),
    ("LINUX_IMMUTABLE", 9),
    ("NET_BIND_SERVICE", 10),
    ("NET_BROADCAST", 11),
    ("NET_ADMIN", 12),
    ("NET_RAW", 13),
    ("IPC_LOCK", 14),
    ("IPC_OWNER", 15),
    ("SYS_MODULE", 16),
    ("SYS_RAWIO", 17),
    ("SYS_CHROOT", 18),
    ("SYS_PTRACE", 19),
    ("SYS_PACCT", 20),
    ("SYS_ADMIN", 21),
    ("SYS_BOOT", 22),
    ("SYS_NICE", 23),
    ("SYS_RESOURCE", 24),
    ("SYS_TIME", 25),
    ("SYS_TTY_CONFIG", 26),
    ("MKNOD", 27),
    ("LEASE", 28),
    ("AUDIT_WRITE", 29),
    ("AUDIT_CONTROL", 30),
    ("SETFCAP", 31),
];

/// Default capability mask for app containers.
#[must_use]
pub fn default_capabilities() -> u64 {
    [
        "CHOWN",
        "DAC_OVERRIDE",
        "FOWNER",
        "FSETID",
        "KILL",
        "SETGID",
        "SETUID",
        "SETPCAP",
        "SETFCAP",
        "NET_BIND_SERVICE",
        "NET_RAW",
        "SYS_CHROOT",
        "AUDIT_WRITE",
        "MKNOD",
    ]
    .iter()
    .filter_map(|name| cap_bit(name))
    .fold(0, |mask, bit| mask | (1 << bit))
}

fn cap_bit(name: &str) -> Option<u64> {
    CAPABILITIES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, bit)| *bit)
}

/// One property in the registry.
#[derive(Debug, Clone, Copy)]
pub struct PropertyDef {
    /// Property name on the API.
    pub name: &'static str,
    /// May be set while the container is running.
    pub dynamic: bool,
    /// One-line description for PropertyList.
    pub desc: &'static str,
}

/// Every settable property, in PropertyList order.
pub const PROPERTIES: &[PropertyDef] = &[
    PropertyDef { name: "command", dynamic: false, desc: "Command executed on start" },
    PropertyDef { name: "cwd", dynamic: false, desc: "Working directory" },
    PropertyDef { name: "root", dynamic: false, desc: "Container chroot" },
    PropertyDef { name: "root_readonly", dynamic: false, desc: "Read-only root" },
    PropertyDef { name: "bind", dynamic: false, desc: "Bind mounts: source target [ro|rw];..." },
    PropertyDef { name: "bind_dns", dynamic: false, desc: "Bind resolv.conf and hosts from host" },
    PropertyDef { name: "env", dynamic: false, desc: "Environment: NAME=value;..." },
    PropertyDef { name: "user", dynamic: false, desc: "User the task runs as" },
    PropertyDef { name: "group", dynamic: false, desc: "Group the task runs as" },
    PropertyDef { name: "ulimit", dynamic: false, desc: "Resource limits: name: soft hard;..." },
    PropertyDef { name: "hostname", dynamic: false, desc: "Hostname inside the container" },
    PropertyDef { name: "isolate", dynamic: false, desc: "New pid/ipc/uts namespaces" },
    PropertyDef { name: "virt_mode", dynamic: false, desc: "Virtualization mode: app|os" },
    PropertyDef { name: "enable_porto", dynamic: true, desc: "API access level for tasks" },
    PropertyDef { name: "porto_namespace", dynamic: false, desc: "Name prefix for nested containers" },
    PropertyDef { name: "memory_limit", dynamic: true, desc: "Memory hard limit" },
    PropertyDef { name: "memory_guarantee", dynamic: true, desc: "Memory guarantee" },
    PropertyDef { name: "anon_limit", dynamic: true, desc: "Anonymous memory limit" },
    PropertyDef { name: "dirty_limit", dynamic: true, desc: "Dirty page limit" },
    PropertyDef { name: "recharge_on_pgfault", dynamic: true, desc: "Recharge pages on fault" },
    PropertyDef { name: "io_limit", dynamic: true, desc: "Filesystem bandwidth limit" },
    PropertyDef { name: "io_ops_limit", dynamic: true, desc: "Filesystem iops limit" },
    PropertyDef { name: "io_policy", dynamic: true, desc: "IO scheduling policy" },
    PropertyDef { name: "cpu_limit", dynamic: true, desc: "CPU limit in cores" },
    PropertyDef { name: "cpu_guarantee", dynamic: true, desc: "CPU guarantee in cores" },
    PropertyDef { name: "cpu_policy", dynamic: true, desc: "CPU policy: normal|rt|idle|batch" },
    PropertyDef { name: "cpu_set", dynamic: true, desc: "CPU affinity set" },
    PropertyDef { name: "thread_limit", dynamic: true, desc: "Thread count limit" },
    PropertyDef { name: "hugetlb_limit", dynamic: true, desc: "Huge pages limit" },
    PropertyDef { name: "net", dynamic: false, desc: "Network configuration" },
    PropertyDef { name: "ip", dynamic: false, desc: "IP addresses" },
    PropertyDef { name: "net_guarantee", dynamic: true, desc: "Egress bandwidth guarantee per interface" },
    PropertyDef { name: "net_limit", dynamic: true, desc: "Egress bandwidth limit per interface" },
    PropertyDef { name: "net_priority", dynamic: true, desc: "Egress priority per interface" },
    PropertyDef { name: "net_tos", dynamic: true, desc: "IP TOS for egress traffic" },
    PropertyDef { name: "devices", dynamic: false, desc: "Extra device access rules" },
    PropertyDef { name: "capabilities", dynamic: false, desc: "Capability bounding set" },
    PropertyDef { name: "respawn", dynamic: true, desc: "Restart the task after death" },
    PropertyDef { name: "max_respawns", dynamic: true, desc: "Respawn attempt ceiling, -1 unlimited" },
    PropertyDef { name: "aging_time", dynamic: true, desc: "Seconds a dead container is kept" },
    PropertyDef { name: "stdin_path", dynamic: false, desc: "Stdin source" },
    PropertyDef { name: "stdout_path", dynamic: false, desc: "Stdout destination" },
    PropertyDef { name: "stderr_path", dynamic: false, desc: "Stderr destination" },
    PropertyDef { name: "stdout_limit", dynamic: true, desc: "Bytes of stdout/stderr kept" },
    PropertyDef { name: "weak", dynamic: true, desc: "Destroy with the creating client" },
    PropertyDef { name: "private", dynamic: true, desc: "Free-form user label" },
];

/// Look up a property definition.
#[must_use]
pub fn property_def(name: &str) -> Option<&'static PropertyDef> {
    PROPERTIES.iter().find(|def| def.name == name)
}

/// Typed property values of one container.
#[derive(Debug, Clone, PartialEq)]
pub struct Properties {
    /// Command executed on start; empty makes the container meta.
    pub command: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Container chroot, `/` for none.
    pub root: PathBuf,
    /// Remount the root read-only.
    pub root_readonly: bool,
    /// Declared bind mounts.
    pub bind: Vec<BindMount>,
    /// Bind resolv.conf and hosts into the chroot.
    pub bind_dns: bool,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// User the task runs as.
    pub user: String,
    /// Group the task runs as.
    pub group: String,
    /// Resource limits.
    pub ulimit: Vec<Rlimit>,
    /// Hostname, empty inherits.
    pub hostname: String,
    /// New pid/ipc/uts namespaces.
    pub isolate: bool,
    /// Virtualization mode.
    pub virt_mode: VirtMode,
    /// API access for the container's tasks.
    pub enable_porto: EnablePorto,
    /// Name prefix applied to nested containers.
    pub porto_namespace: String,
    /// Memory hard limit in bytes, 0 unlimited.
    pub memory_limit: u64,
    /// Memory guarantee in bytes.
    pub memory_guarantee: u64,
    /// Anonymous memory limit in bytes.
    pub anon_limit: u64,
    /// Dirty page limit in bytes.
    pub dirty_limit: u64,
    /// Recharge pages to the faulting cgroup.
    pub recharge_on_pgfault: bool,
    /// Filesystem bandwidth limit in bytes per second.
    pub io_limit: u64,
    /// Filesystem iops limit.
    pub io_ops_limit: u64,
    /// IO policy name.
    pub io_policy: String,
    /// CPU limit in millicores, 0 unlimited.
    pub cpu_limit: u64,
    /// CPU guarantee in millicores.
    pub cpu_guarantee: u64,
    /// CPU policy.
    pub cpu_policy: String,
    /// CPU affinity list.
    pub cpu_set: String,
    /// Thread count limit, 0 unlimited.
    pub thread_limit: u64,
    /// Huge pages limit in bytes.
    pub hugetlb_limit: u64,
    /// Network configuration string.
    pub net: String,
    /// IP address configuration string.
    pub ip: String,
    /// Egress guarantee per interface.
    pub net_guarantee: BTreeMap<String, u64>,
    /// Egress limit per interface.
    pub net_limit: BTreeMap<String, u64>,
    /// Egress priority per interface.
    pub net_priority: BTreeMap<String, u64>,
    /// IP TOS.
    pub net_tos: u64,
    /// Extra device rules.
    pub devices: Vec<String>,
    /// Capability bounding mask.
    pub capabilities: u64,
    /// Restart after death.
    pub respawn: bool,
    /// Respawn ceiling, -1 unlimited.
    pub max_respawns: i64,
    /// Seconds a dead container is kept before aging out.
    pub aging_time_s: u64,
    /// Stdin source, empty is /dev/null.
    pub stdin_path: PathBuf,
    /// Stdout destination, empty is an internal file.
    pub stdout_path: PathBuf,
    /// Stderr destination, empty is an internal file.
    pub stderr_path: PathBuf,
    /// Bytes of stdout/stderr kept.
    pub stdout_limit: u64,
    /// Destroy with the creating client.
    pub weak: bool,
    /// Free-form user label.
    pub private: String,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            command: String::new(),
            cwd: PathBuf::from("/"),
            root: PathBuf::from("/"),
            root_readonly: false,
            bind: Vec::new(),
            bind_dns: false,
            env: Vec::new(),
            user: "root".to_string(),
            group: String::new(),
            ulimit: Vec::new(),
            hostname: String::new(),
            isolate: true,
            virt_mode: VirtMode::App,
            enable_porto: EnablePorto::Normal,
            porto_namespace: String::new(),
            memory_limit: 0,
            memory_guarantee: 0,
            anon_limit: 0,
            dirty_limit: 0,
            recharge_on_pgfault: false,
            io_limit: 0,
            io_ops_limit: 0,
            io_policy: "normal".to_string(),
            cpu_limit: 0,
            cpu_guarantee: 0,
            cpu_policy: "normal".to_string(),
            cpu_set: String::new(),
            thread_limit: 0,
            hugetlb_limit: 0,
            net: "inherited".to_string(),
            ip: String::new(),
            net_guarantee: BTreeMap::new(),
            net_limit: BTreeMap::new(),
            net_priority: BTreeMap::new(),
            net_tos: 0,
            devices: Vec::new(),
            capabilities: default_capabilities(),
            respawn: false,
            max_respawns: -1,
            aging_time_s: 60 * 60 * 24,
            stdin_path: PathBuf::new(),
            stdout_path: PathBuf::new(),
            stderr_path: PathBuf::new(),
            stdout_limit: 8 << 20,
            weak: false,
            private: String::new(),
        }
    }
}

impl Properties {
    /// String form of a property.
    pub fn get(&self, name: &str) -> PortoResult<String> {
        if let Some((base, index)) = split_index(name) {
            let map = self.indexed_map(base)?;
            return map
                .get(index)
                .map(ToString::to_string)
                .ok_or_else(|| PortoError::InvalidProperty {
                    property: name.to_string(),
                });
        }

        let value = match name {
            "command" => self.command.clone(),
            "cwd" => self.cwd.display().to_string(),
            "root" => self.root.display().to_string(),
            "root_readonly" => format_bool(self.root_readonly).to_string(),
            "bind" => self
                .bind
                .iter()
                .map(BindMount::format)
                .collect::<Vec<_>>()
                .join("; "),
            "bind_dns" => format_bool(self.bind_dns).to_string(),
            "env" => self
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(";"),
            "user" => self.user.clone(),
            "group" => self.group.clone(),
            "ulimit" => format_ulimits(&self.ulimit),
            "hostname" => self.hostname.clone(),
            "isolate" => format_bool(self.isolate).to_string(),
            "virt_mode" => self.virt_mode.to_string(),
            "enable_porto" => self.enable_porto.to_string(),
            "porto_namespace" => self.porto_namespace.clone(),
            "memory_limit" => format_size(self.memory_limit),
            "memory_guarantee" => format_size(self.memory_guarantee),
            "anon_limit" => format_size(self.anon_limit),
            "dirty_limit" => format_size(self.dirty_limit),
            "recharge_on_pgfault" => format_bool(self.recharge_on_pgfault).to_string(),
            "io_limit" => self.io_limit.to_string(),
            "io_ops_limit" => self.io_ops_limit.to_string(),
            "io_policy" => self.io_policy.clone(),
            "cpu_limit" => format_millicores(self.cpu_limit),
            "cpu_guarantee" => format_millicores(self.cpu_guarantee),
            "cpu_policy" => self.cpu_policy.clone(),
            "cpu_set" => self.cpu_set.clone(),
            "thread_limit" => self.thread_limit.to_string(),
            "hugetlb_limit" => format_size(self.hugetlb_limit),
            "net" => self.net.clone(),
            "ip" => self.ip.clone(),
            "net_guarantee" | "net_limit" | "net_priority" => {
                format_uint_map(self.indexed_map(name)?)
            }
            "net_tos" => self.net_tos.to_string(),
            "devices" => self.devices.join("; "),
            "capabilities" => format_capabilities(self.capabilities),
            "respawn" => format_bool(self.respawn).to_string(),
            "max_respawns" => self.max_respawns.to_string(),
            "aging_time" => self.aging_time_s.to_string(),
            "stdin_path" => self.stdin_path.display().to_string(),
            "stdout_path" => self.stdout_path.display().to_string(),
            "stderr_path" => self.stderr_path.display().to_string(),
            "stdout_limit" => format_size(self.stdout_limit),
            "weak" => format_bool(self.weak).to_string(),
            "private" => self.private.clone(),
            _ => {
                return Err(PortoError::InvalidProperty {
                    property: name.to_string(),
                })
            }
        };
        Ok(value)
    }

    /// Set a property from its string form, validating the value.
    pub fn set(&mut self, name: &str, value: &str) -> PortoResult<()> {
        if let Some((base, index)) = split_index(name) {
            let parsed = parse_size(value)?;
            let map = self.indexed_map_mut(base)?;
            map.insert(index.to_string(), parsed);
            return Ok(());
        }

        match name {
            "command" => self.command = value.to_string(),
            "cwd" => self.cwd = parse_abs_path(value)?,
            "root" => self.root = parse_abs_path(value)?,
            "root_readonly" => self.root_readonly = parse_bool(value)?,
            "bind" => self.bind = BindMount::parse_list(value)?,
            "bind_dns" => self.bind_dns = parse_bool(value)?,
            "env" => self.env = parse_env_list(value)?,
            "user" => self.user = value.to_string(),
            "group" => self.group = value.to_string(),
            "ulimit" => self.ulimit = parse_ulimits(value)?,
            "hostname" => self.hostname = value.to_string(),
            "isolate" => self.isolate = parse_bool(value)?,
            "virt_mode" => self.virt_mode = value.parse()?,
            "enable_porto" => self.enable_porto = value.parse()?,
            "porto_namespace" => self.porto_namespace = value.to_string(),
            "memory_limit" => self.memory_limit = parse_size(value)?,
            "memory_guarantee" => self.memory_guarantee = parse_size(value)?,
            "anon_limit" => self.anon_limit = parse_size(value)?,
            "dirty_limit" => self.dirty_limit = parse_size(value)?,
            "recharge_on_pgfault" => self.recharge_on_pgfault = parse_bool(value)?,
            "io_limit" => self.io_limit = parse_size(value)?,
            "io_ops_limit" => self.io_ops_limit = porto_common::value::parse_u64(value)?,
            "io_policy" => self.io_policy = parse_choice(value, &["normal", "batch", "rt"])?,
            "cpu_limit" => self.cpu_limit = parse_millicores(value)?,
            "cpu_guarantee" => self.cpu_guarantee = parse_millicores(value)?,
            "cpu_policy" => {
                self.cpu_policy = parse_choice(value, &["normal", "rt", "idle", "batch"])?
            }
            "cpu_set" => self.cpu_set = value.to_string(),
            "thread_limit" => self.thread_limit = porto_common::value::parse_u64(value)?,
            "hugetlb_limit" => self.hugetlb_limit = parse_size(value)?,
            "net" => self.net = value.to_string(),
            "ip" => self.ip = value.to_string(),
            "net_tos" => self.net_tos = porto_common::value::parse_u64(value)?,
            "net_guarantee" | "net_limit" | "net_priority" => {
                let parsed = parse_uint_map(value)?;
                *self.indexed_map_mut(name)? = parsed;
            }
            "devices" => {
                self.devices = value
                    .split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            }
            "capabilities" => self.capabilities = parse_capabilities(value)?,
            "respawn" => self.respawn = parse_bool(value)?,
            "max_respawns" => self.max_respawns = porto_common::value::parse_i64(value)?,
            "aging_time" => self.aging_time_s = porto_common::value::parse_u64(value)?,
            "stdin_path" => self.stdin_path = PathBuf::from(value),
            "stdout_path" => self.stdout_path = PathBuf::from(value),
            "stderr_path" => self.stderr_path = PathBuf::from(value),
            "stdout_limit" => self.stdout_limit = parse_size(value)?,
            "weak" => self.weak = parse_bool(value)?,
            "private" => {
                if value.len() > 4096 {
                    return Err(PortoError::InvalidValue {
                        message: "private label longer than 4096 bytes".to_string(),
                    });
                }
                self.private = value.to_string();
            }
            _ => {
                return Err(PortoError::InvalidProperty {
                    property: name.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Serialize every non-default property for persistence.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let defaults = Self::default();
        let mut map = BTreeMap::new();
        for def in PROPERTIES {
            let value = self.get(def.name).expect("registered property");
            let default = defaults.get(def.name).expect("registered property");
            if value != default {
                map.insert(def.name.to_string(), value);
            }
        }
        map
    }

    /// Rebuild properties from a persisted map, ignoring unknown keys so
    /// records from newer versions still restore.
    #[must_use]
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let mut props = Self::default();
        for (key, value) in map {
            if property_def(key).is_some() {
                if let Err(e) = props.set(key, value) {
                    tracing::warn!(property = %key, error = %e, "dropping bad persisted property");
                }
            }
        }
        props
    }

    fn indexed_map(&self, base: &str) -> PortoResult<&BTreeMap<String, u64>> {
        match base {
            "net_guarantee" => Ok(&self.net_guarantee),
            "net_limit" => Ok(&self.net_limit),
            "net_priority" => Ok(&self.net_priority),
            _ => Err(PortoError::InvalidProperty {
                property: base.to_string(),
            }),
        }
    }

    fn indexed_map_mut(&mut self, base: &str) -> PortoResult<&mut BTreeMap<String, u64>> {
        match base {
            "net_guarantee" => Ok(&mut self.net_guarantee),
            "net_limit" => Ok(&mut self.net_limit),
            "net_priority" => Ok(&mut self.net_priority),
            _ => Err(PortoError::InvalidProperty {
                property: base.to_string(),
            }),
        }
    }
}

/// Split `name[index]` into base and index.
#[must_use]
pub fn split_index(name: &str) -> Option<(&str, &str)> {
    let open = name.find('[')?;
    let close = name.strip_suffix(']')?;
    Some((&name[..open], &close[open + 1..]))
}

fn parse_abs_path(value: &str) -> PortoResult<PathBuf> {
    let path = PathBuf::from(value);
    if !path.is_absolute() {
        return Err(PortoError::InvalidValue {
            message: format!("path must be absolute: {value}"),
        });
    }
    Ok(path)
}

fn parse_choice(value: &str, choices: &[&str]) -> PortoResult<String> {
    if choices.contains(&value) {
        Ok(value.to_string())
    } else {
        Err(PortoError::InvalidValue {
            message: format!("expected one of {choices:?}, got {value:?}"),
        })
    }
}

/// Millicore values are written as fractional cores: "1.5c" or "1.5".
fn parse_millicores(value: &str) -> PortoResult<u64> {
    let value = value.trim().trim_end_matches('c');
    let cores: f64 = value.parse().map_err(|_| PortoError::InvalidValue {
        message: format!("invalid cpu value: {value}"),
    })?;
    if !(0.0..=4096.0).contains(&cores) {
        return Err(PortoError::InvalidValue {
            message: format!("cpu value out of range: {value}"),
        });
    }
    Ok((cores * 1000.0).round() as u64)
}

fn format_millicores(millicores: u64) -> String {
    if millicores % 1000 == 0 {
        format!("{}c", millicores / 1000)
    } else {
        format!("{:.3}c", millicores as f64 / 1000.0)
    }
}

const RLIMIT_NAMES: &[(&str, i32)] = &[
    ("core", libc::RLIMIT_CORE as i32),
    ("cpu", libc::RLIMIT_CPU as i32),
    ("data", libc::RLIMIT_DATA as i32),
    ("fsize", libc::RLIMIT_FSIZE as i32),
    ("memlock", libc::RLIMIT_MEMLOCK as i32),
    ("nofile", libc::RLIMIT_NOFILE as i32),
    ("nproc", libc::RLIMIT_NPROC as i32),
    ("stack", libc::RLIMIT_STACK as i32),
];

fn parse_ulimits(value: &str) -> PortoResult<Vec<Rlimit>> {
    let mut limits = Vec::new();
    for item in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, rest) = item.split_once(':').ok_or_else(|| PortoError::InvalidValue {
            message: format!("ulimit entry without ':': {item}"),
        })?;
        let resource = RLIMIT_NAMES
            .iter()
            .find(|(n, _)| *n == name.trim())
            .map(|(_, r)| *r)
            .ok_or_else(|| PortoError::InvalidValue {
                message: format!("unknown ulimit: {name}"),
            })?;
        let mut parts = rest.split_whitespace();
        let soft = parse_limit_word(parts.next())?;
        let hard = parse_limit_word(parts.next().or(Some("unlimited")))?;
        limits.push(Rlimit {
            resource,
            soft,
            hard,
        });
    }
    Ok(limits)
}

fn parse_limit_word(word: Option<&str>) -> PortoResult<u64> {
    match word {
        Some("unlimited") | None => Ok(libc::RLIM_INFINITY),
        Some(word) => parse_size(word),
    }
}

fn format_ulimits(limits: &[Rlimit]) -> String {
    limits
        .iter()
        .map(|l| {
            let name = RLIMIT_NAMES
                .iter()
                .find(|(_, r)| *r == l.resource)
                .map_or("?", |(n, _)| *n);
            format!("{name}: {} {}", format_limit_word(l.soft), format_limit_word(l.hard))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_limit_word(value: u64) -> String {
    if value == libc::RLIM_INFINITY {
        "unlimited".to_string()
    } else {
        value.to_string()
    }
}

fn parse_capabilities(value: &str) -> PortoResult<u64> {
    let mut mask = 0;
    for name in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let bit = cap_bit(name).ok_or_else(|| PortoError::InvalidValue {
            message: format!("unknown capability: {name}"),
        })?;
        mask |= 1 << bit;
    }
    Ok(mask)
}

fn format_capabilities(mask: u64) -> String {
    CAPABILITIES
        .iter()
        .filter(|(_, bit)| mask & (1 << bit) != 0)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_uint_map(value: &str) -> PortoResult<BTreeMap<String, u64>> {
    let mut map = BTreeMap::new();
    for item in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, val) = item.split_once(':').ok_or_else(|| PortoError::InvalidValue {
            message: format!("map entry without ':': {item}"),
        })?;
        map.insert(key.trim().to_string(), parse_size(val.trim())?);
    }
    Ok(map)
}

fn format_uint_map(map: &BTreeMap<String, u64>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let props = Properties::default();
        assert_eq!(props.get("cpu_policy").unwrap(), "normal");
        assert_eq!(props.get("isolate").unwrap(), "true");
        assert_eq!(props.get("max_respawns").unwrap(), "-1");
        assert_eq!(props.get("aging_time").unwrap(), "86400");
    }

    #[test]
    fn set_and_get_roundtrip() {
        let mut props = Properties::default();
        props.set("command", "sleep 1000").unwrap();
        props.set("memory_limit", "32M").unwrap();
        props.set("cpu_limit", "1.5c").unwrap();
        props.set("env", "A=1;B=2").unwrap();
        props.set("bind", "/src /dst ro").unwrap();

        assert_eq!(props.get("command").unwrap(), "sleep 1000");
        assert_eq!(props.memory_limit, 32 << 20);
        assert_eq!(props.cpu_limit, 1500);
        assert_eq!(props.get("env").unwrap(), "A=1;B=2");
        assert_eq!(props.get("bind").unwrap(), "/src /dst ro");
    }

    #[test]
    fn unknown_property_is_rejected() {
        let mut props = Properties::default();
        assert!(matches!(
            props.set("no_such", "x"),
            Err(PortoError::InvalidProperty { .. })
        ));
        assert!(props.get("no_such").is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut props = Properties::default();
        assert!(props.set("memory_limit", "lots").is_err());
        assert!(props.set("root", "relative/path").is_err());
        assert!(props.set("virt_mode", "vm").is_err());
        assert!(props.set("cpu_policy", "fifo").is_err());
        assert!(props.set("respawn", "maybe").is_err());
    }

    #[test]
    fn indexed_properties() {
        let mut props = Properties::default();
        props.set("net_limit[eth0]", "10M").unwrap();
        assert_eq!(props.get("net_limit[eth0]").unwrap(), (10 << 20).to_string());
        assert!(props.get("net_limit[eth1]").is_err());
        props.set("net_limit", "eth0: 1M; eth1: 2M").unwrap();
        assert_eq!(props.net_limit.len(), 2);
    }

    #[test]
    fn ulimit_parsing() {
        let mut props = Properties::default();
        props.set("ulimit", "nofile: 1024 2048; core: unlimited").unwrap();
        assert_eq!(props.ulimit.len(), 2);
        assert_eq!(props.ulimit[0].soft, 1024);
        assert_eq!(props.ulimit[0].hard, 2048);
        assert_eq!(props.ulimit[1].soft, libc::RLIM_INFINITY);
        assert!(props.set("ulimit", "bogus: 1").is_err());
    }

    #[test]
    fn capability_parsing() {
        let mut props = Properties::default();
        props.set("capabilities", "NET_ADMIN; SYS_ADMIN").unwrap();
        assert_eq!(props.capabilities, (1 << 12) | (1 << 21));
        assert!(props.set("capabilities", "CAP_FAKE").is_err());
    }

    #[test]
    fn persistence_roundtrip_keeps_non_defaults() {
        let mut props = Properties::default();
        props.set("command", "true").unwrap();
        props.set("memory_limit", "64M").unwrap();
        props.set("respawn", "true").unwrap();

        let map = props.to_map();
        assert!(map.contains_key("command"));
        assert!(!map.contains_key("cpu_policy"));

        let restored = Properties::from_map(&map);
        assert_eq!(restored, props);
    }
}
