#![allow(unsafe_code)]
//! Container mount-tree construction.
//!
//! Runs inside the child after the new mount namespace exists. The order
//! of operations matters: propagation is cut first, the chroot content is
//! assembled next, binds and /proc hardening follow, and the final
//! pivot-root flips propagation back to shared for subcontainers.

use std::ffi::CString;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use porto_common::{PortoError, PortoResult};
use rustix::mount::{MountFlags, UnmountFlags};

/// Paths where a bind source is considered system-critical: binding one
/// requires write access even for a read-only bind.
const SYSTEM_PATHS: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/run", "/sbin",
    "/sys", "/usr", "/var",
];

/// Whether a path is system-critical.
#[must_use]
pub fn is_system_path(path: &Path) -> bool {
    SYSTEM_PATHS.iter().any(|sys| {
        let sys = Path::new(sys);
        path == sys || (sys != Path::new("/") && path.starts_with(sys))
    }) || path == Path::new("/")
}

/// One declared bind mount.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BindMount {
    /// Host-side source path.
    pub source: PathBuf,
    /// Target path relative to the container root.
    pub target: PathBuf,
    /// Remount-bind read-only after binding.
    pub read_only: bool,
}

impl BindMount {
    /// Parse one `source target [ro|rw]` triple.
    pub fn parse(spec: &str) -> PortoResult<Self> {
        let mut parts = spec.split_whitespace();
        let source = parts.next().ok_or_else(|| PortoError::InvalidValue {
            message: format!("bind without source: {spec}"),
        })?;
        let target = parts.next().ok_or_else(|| PortoError::InvalidValue {
            message: format!("bind without target: {spec}"),
        })?;
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => {
                return Err(PortoError::InvalidValue {
                    message: format!("bad bind flag {other:?} in {spec}"),
                })
            }
        };
        Ok(Self {
            source: PathBuf::from(source),
            target: PathBuf::from(target),
            read_only,
        })
    }

    /// Parse a `;`-separated list of binds.
    pub fn parse_list(spec: &str) -> PortoResult<Vec<Self>> {
        spec.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Format back to the `source target flag` form.
    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "{} {} {}",
            self.source.display(),
            self.target.display(),
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// Everything the mount builder needs to know about a container.
#[derive(Debug, Clone)]
pub struct MountEnv {
    /// Container root path in the host view, `/` for no chroot.
    pub root: PathBuf,
    /// Remount the root read-only after construction.
    pub root_readonly: bool,
    /// Declared bind mounts, applied in order.
    pub binds: Vec<BindMount>,
    /// Size of the /dev tmpfs.
    pub dev_size: u64,
    /// Size of the /run tmpfs.
    pub run_size: u64,
    /// How many pre-existing /run subdirectories are recreated.
    pub run_subdir_limit: usize,
    /// Mount hugetlbfs at /dev/hugepages.
    pub hugetlb: bool,
    /// Bind the host systemd cgroup slice for compatibility.
    pub systemd_cgroup: bool,
}

impl MountEnv {
    /// Build the container's filesystem view.
    pub fn build(&self) -> PortoResult<()> {
        // Cut outward propagation but keep receiving host mounts.
        set_propagation(Path::new("/"), libc::MS_SLAVE | libc::MS_REC)?;

        remount_proc_sys()?;

        let chroot = self.root != Path::new("/");
        if chroot {
            self.prepare_chroot()?;
        }

        for bind in &self.binds {
            self.apply_bind(bind)?;
        }

        if chroot {
            protect_proc(&self.root)?;
            if self.systemd_cgroup {
                self.mount_systemd_slice()?;
            }
            pivot_root_or_chroot(&self.root)?;
            if self.root_readonly {
                remount_readonly(Path::new("/"))?;
            }
        }

        // Subcontainers inherit mounts from here on.
        set_propagation(Path::new("/"), libc::MS_SHARED | libc::MS_REC)?;
        Ok(())
    }

    fn prepare_chroot(&self) -> PortoResult<()> {
        let root = &self.root;

        let dev = root.join("dev");
        std::fs::create_dir_all(&dev)?;
        mount_tmpfs(&dev, &format!("mode=755,size={}", self.dev_size))?;

        let pts = dev.join("pts");
        std::fs::create_dir_all(&pts)?;
        rustix::mount::mount(
            "devpts",
            &pts,
            "devpts",
            MountFlags::NOSUID | MountFlags::NOEXEC,
            "newinstance,ptmxmode=0666,mode=620,gid=5,max=1024",
        )
        .map_err(|e| mount_error("devpts", &pts, e))?;

        let proc = root.join("proc");
        std::fs::create_dir_all(&proc)?;
        rustix::mount::mount(
            "proc",
            &proc,
            "proc",
            MountFlags::NOSUID | MountFlags::NOEXEC | MountFlags::NODEV,
            "",
        )
        .map_err(|e| mount_error("proc", &proc, e))?;

        let sys = root.join("sys");
        std::fs::create_dir_all(&sys)?;
        rustix::mount::mount(
            "sysfs",
            &sys,
            "sysfs",
            MountFlags::RDONLY | MountFlags::NOSUID | MountFlags::NOEXEC | MountFlags::NODEV,
            "",
        )
        .map_err(|e| mount_error("sysfs", &sys, e))?;

        recreate_run(&root.join("run"), self.run_size, self.run_subdir_limit)?;
        make_device_nodes(&dev)?;

        if self.hugetlb {
            let hugepages = dev.join("hugepages");
            std::fs::create_dir_all(&hugepages)?;
            rustix::mount::mount(
                "hugetlbfs",
                &hugepages,
                "hugetlbfs",
                MountFlags::NOSUID | MountFlags::NODEV,
                "",
            )
            .map_err(|e| mount_error("hugetlbfs", &hugepages, e))?;
        }

        let lock = root.join("run/lock");
        std::fs::create_dir_all(&lock)?;
        mount_tmpfs(&lock, "mode=1777,size=65536k")?;

        let shm = dev.join("shm");
        std::fs::create_dir_all(&shm)?;
        mount_tmpfs(&shm, "mode=1777")?;

        Ok(())
    }

    fn apply_bind(&self, bind: &BindMount) -> PortoResult<()> {
        let target = if self.root == Path::new("/") {
            bind.target.clone()
        } else {
            self.root
                .join(bind.target.strip_prefix("/").unwrap_or(&bind.target))
        };

        // A bind must not escape the container root through symlinks.
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
            let resolved = parent.canonicalize()?;
            if !resolved.starts_with(&self.root) {
                return Err(PortoError::Permission {
                    message: format!(
                        "bind target {} escapes container root",
                        bind.target.display()
                    ),
                });
            }
        }

        if bind.source.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if !target.exists() {
            std::fs::write(&target, b"")?;
        }

        bind_mount(&bind.source, &target, bind.read_only)
    }

    fn mount_systemd_slice(&self) -> PortoResult<()> {
        let target = self.root.join("sys/fs/cgroup/systemd");
        std::fs::create_dir_all(&target)?;
        bind_mount(Path::new("/sys/fs/cgroup/systemd"), &target, true)
    }
}

/// Change mount propagation, recursively when MS_REC is set.
pub fn set_propagation(path: &Path, flags: libc::c_ulong) -> PortoResult<()> {
    let target = cstring(path)?;
    let none = CString::new("none").expect("static string");
    let rc = unsafe {
        libc::mount(
            std::ptr::null(),
            target.as_ptr(),
            none.as_ptr(),
            flags,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(PortoError::from_errno(format!(
            "cannot change propagation of {}",
            path.display()
        )));
    }
    Ok(())
}

/// Re-mount /proc and /sys for a fresh namespace.
fn remount_proc_sys() -> PortoResult<()> {
    let proc = Path::new("/proc");
    rustix::mount::mount(
        "proc",
        proc,
        "proc",
        MountFlags::NOSUID | MountFlags::NOEXEC | MountFlags::NODEV,
        "",
    )
    .map_err(|e| mount_error("proc", proc, e))?;
    let sys = Path::new("/sys");
    rustix::mount::mount("sysfs", sys, "sysfs", MountFlags::empty(), "")
        .map_err(|e| mount_error("sysfs", sys, e))
}

/// Mount a tmpfs with the given options.
pub fn mount_tmpfs(target: &Path, options: &str) -> PortoResult<()> {
    rustix::mount::mount(
        "tmpfs",
        target,
        "tmpfs",
        MountFlags::NOSUID | MountFlags::NODEV,
        options,
    )
    .map_err(|e| mount_error("tmpfs", target, e))
}

/// Bind one path onto another, optionally remounting read-only.
pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> PortoResult<()> {
    rustix::mount::mount_bind(source, target).map_err(|e| mount_error("bind", target, e))?;
    if read_only {
        remount_readonly(target)?;
    }
    Ok(())
}

/// Remount-bind a mount point read-only in place.
pub fn remount_readonly(target: &Path) -> PortoResult<()> {
    rustix::mount::mount_remount(target, MountFlags::BIND | MountFlags::RDONLY, "")
        .map_err(|e| mount_error("remount-ro", target, e))
}

/// Detach a mount point.
pub fn unmount(target: &Path) -> PortoResult<()> {
    rustix::mount::unmount(target, UnmountFlags::DETACH)
        .map_err(|e| mount_error("umount", target, e))
}

/// Recreate /run as a capped tmpfs, preserving the modes and owners of up
/// to `limit` pre-existing subdirectories.
fn recreate_run(run: &Path, size: u64, limit: usize) -> PortoResult<()> {
    let mut saved: Vec<(PathBuf, u32, u32, u32)> = Vec::new();
    if run.is_dir() {
        let mut queue = vec![run.to_path_buf()];
        while let Some(dir) = queue.pop() {
            if saved.len() >= limit {
                break;
            }
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                if saved.len() >= limit {
                    break;
                }
                let path = entry.path();
                let meta = match entry.metadata() {
                    Ok(meta) if meta.is_dir() => meta,
                    _ => continue,
                };
                let rel = path.strip_prefix(run).unwrap_or(&path).to_path_buf();
                saved.push((rel, meta.mode(), meta.uid(), meta.gid()));
                queue.push(path);
            }
        }
    }

    std::fs::create_dir_all(run)?;
    mount_tmpfs(run, &format!("mode=755,size={size}"))?;

    for (rel, mode, uid, gid) in saved {
        let path = run.join(&rel);
        if std::fs::create_dir_all(&path).is_err() {
            continue;
        }
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode));
        let c_path = match cstring(&path) {
            Ok(c) => c,
            Err(_) => continue,
        };
        unsafe {
            libc::chown(c_path.as_ptr(), uid, gid);
        }
    }
    Ok(())
}

/// Create the canonical device nodes and symlinks under a fresh /dev.
fn make_device_nodes(dev: &Path) -> PortoResult<()> {
    const NODES: &[(&str, u32, u32)] = &[
        ("null", 1, 3),
        ("zero", 1, 5),
        ("full", 1, 7),
        ("random", 1, 8),
        ("urandom", 1, 9),
        ("tty", 5, 0),
        ("console", 5, 1),
    ];

    for (name, major, minor) in NODES {
        let path = dev.join(name);
        let c_path = cstring(&path)?;
        let rdev = libc::makedev(*major, *minor);
        let rc = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR | 0o666, rdev) };
        if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EEXIST) {
            return Err(PortoError::from_errno(format!("mknod {name}")));
        }
    }

    let _ = symlink("pts/ptmx", dev.join("ptmx"));
    let _ = symlink("/proc/self/fd", dev.join("fd"));
    let _ = symlink("/proc/self/fd/0", dev.join("stdin"));
    let _ = symlink("/proc/self/fd/1", dev.join("stdout"));
    let _ = symlink("/proc/self/fd/2", dev.join("stderr"));
    Ok(())
}

/// Shadow dangerous /proc entries after the container proc is mounted.
fn protect_proc(root: &Path) -> PortoResult<()> {
    let proc = root.join("proc");
    for name in ["sysrq-trigger", "irq", "bus", "sys"] {
        let path = proc.join(name);
        if path.exists() {
            bind_mount(&path, &path, true)?;
        }
    }
    let kcore = proc.join("kcore");
    let null = root.join("dev/null");
    if kcore.exists() && null.exists() {
        bind_mount(&null, &kcore, false)?;
    }
    Ok(())
}

/// Pivot into the new root, falling back to plain chroot when the root
/// filesystem cannot host a pivot (e.g. initramfs).
fn pivot_root_or_chroot(root: &Path) -> PortoResult<()> {
    // pivot_root requires the new root to be a mount point.
    bind_mount(root, root, false)?;
    rustix::process::chdir(root).map_err(|e| PortoError::Unknown {
        message: format!("chdir to {}: {e}", root.display()),
        errno: e.raw_os_error(),
    })?;

    match rustix::process::pivot_root(".", ".") {
        Ok(()) => {
            // Old root is stacked on the same directory, drop it.
            rustix::mount::unmount(".", UnmountFlags::DETACH)
                .map_err(|e| mount_error("umount old root", Path::new("."), e))?;
        }
        Err(_) => {
            rustix::process::chroot(".").map_err(|e| PortoError::Unknown {
                message: format!("chroot to {}: {e}", root.display()),
                errno: e.raw_os_error(),
            })?;
        }
    }
    rustix::process::chdir("/").map_err(|e| PortoError::Unknown {
        message: format!("chdir to /: {e}"),
        errno: e.raw_os_error(),
    })?;
    Ok(())
}

fn mount_error(what: &str, target: &Path, e: rustix::io::Errno) -> PortoError {
    PortoError::Unknown {
        message: format!("{what} mount on {} failed: {e}", target.display()),
        errno: e.raw_os_error(),
    }
}

fn cstring(path: &Path) -> PortoResult<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).map_err(|_| PortoError::InvalidValue {
        message: format!("path contains NUL: {}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_paths() {
        assert!(is_system_path(Path::new("/")));
        assert!(is_system_path(Path::new("/etc")));
        assert!(is_system_path(Path::new("/usr/lib/x")));
        assert!(!is_system_path(Path::new("/home/user/data")));
        assert!(!is_system_path(Path::new("/place/volumes/1")));
    }

    #[test]
    fn bind_parsing() {
        let bind = BindMount::parse("/src /dst ro").unwrap();
        assert_eq!(bind.source, PathBuf::from("/src"));
        assert_eq!(bind.target, PathBuf::from("/dst"));
        assert!(bind.read_only);

        let bind = BindMount::parse("/a /b").unwrap();
        assert!(!bind.read_only);

        assert!(BindMount::parse("/only-source").is_err());
        assert!(BindMount::parse("/a /b rx").is_err());
    }

    #[test]
    fn bind_list_roundtrip() {
        let list = BindMount::parse_list("/a /b ro; /c /d rw").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].format(), "/a /b ro");
        assert_eq!(list[1].format(), "/c /d rw");
        assert!(BindMount::parse_list("").unwrap().is_empty());
    }
}
