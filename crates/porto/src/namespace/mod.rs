#![allow(unsafe_code)]
//! Linux namespace handles.
//!
//! A [`NsHandle`] is an open file under `/proc/<pid>/ns/<kind>`; two
//! handles name the same namespace iff their (dev, ino) pairs match. A
//! [`NsSnapshot`] bundles every namespace of a task plus its root and cwd
//! so the spawner can re-enter a parent container completely.

pub mod mount;

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use porto_common::{PortoError, PortoResult};

/// Namespace kinds porto manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NsKind {
    /// pid namespace
    Pid,
    /// mount namespace
    Mnt,
    /// uts (hostname) namespace
    Uts,
    /// ipc namespace
    Ipc,
    /// network namespace
    Net,
    /// user namespace
    User,
}

impl NsKind {
    /// Name of the namespace link under `/proc/<pid>/ns`.
    #[must_use]
    pub fn proc_name(&self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Mnt => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Net => "net",
            Self::User => "user",
        }
    }

    /// Matching CLONE_* flag.
    #[must_use]
    pub fn clone_flag(&self) -> libc::c_int {
        match self {
            Self::Pid => libc::CLONE_NEWPID,
            Self::Mnt => libc::CLONE_NEWNS,
            Self::Uts => libc::CLONE_NEWUTS,
            Self::Ipc => libc::CLONE_NEWIPC,
            Self::Net => libc::CLONE_NEWNET,
            Self::User => libc::CLONE_NEWUSER,
        }
    }

    /// The five namespaces captured in a snapshot.
    #[must_use]
    pub fn all() -> &'static [NsKind] {
        &[Self::Pid, Self::Mnt, Self::Uts, Self::Ipc, Self::Net]
    }
}

/// An open namespace file descriptor.
#[derive(Debug)]
pub struct NsHandle {
    kind: NsKind,
    file: File,
}

impl NsHandle {
    /// Open the namespace of a task.
    pub fn open(pid: libc::pid_t, kind: NsKind) -> PortoResult<Self> {
        let path = PathBuf::from(format!("/proc/{pid}/ns/{}", kind.proc_name()));
        let file = File::open(&path).map_err(|e| PortoError::Unknown {
            message: format!("cannot open {}: {e}", path.display()),
            errno: e.raw_os_error().unwrap_or(0),
        })?;
        Ok(Self { kind, file })
    }

    /// The namespace kind.
    #[must_use]
    pub fn kind(&self) -> NsKind {
        self.kind
    }

    /// (dev, ino) identity of the namespace.
    pub fn identity(&self) -> PortoResult<(u64, u64)> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.file.as_raw_fd(), &mut stat) };
        if rc != 0 {
            return Err(PortoError::from_errno("fstat on namespace fd"));
        }
        Ok((stat.st_dev, stat.st_ino))
    }

    /// Whether two handles name the same namespace.
    pub fn same_as(&self, other: &NsHandle) -> PortoResult<bool> {
        Ok(self.identity()? == other.identity()?)
    }

    /// Move the calling task into this namespace.
    pub fn enter(&self) -> PortoResult<()> {
        let rc = unsafe { libc::setns(self.file.as_raw_fd(), self.kind.clone_flag()) };
        if rc != 0 {
            return Err(PortoError::from_errno(format!(
                "setns into {} namespace",
                self.kind.proc_name()
            )));
        }
        Ok(())
    }
}

/// Every namespace of a task plus its root and cwd.
#[derive(Debug)]
pub struct NsSnapshot {
    handles: Vec<NsHandle>,
    root: File,
    cwd: File,
}

impl NsSnapshot {
    /// Capture the namespaces, root and cwd of a task.
    ///
    /// Namespaces a kernel does not expose are skipped.
    pub fn capture(pid: libc::pid_t) -> PortoResult<Self> {
        let mut handles = Vec::new();
        for kind in NsKind::all() {
            match NsHandle::open(pid, *kind) {
                Ok(handle) => handles.push(handle),
                Err(PortoError::Unknown { errno, .. }) if errno == libc::ENOENT => {}
                Err(e) => return Err(e),
            }
        }
        let root = File::open(format!("/proc/{pid}/root"))?;
        let cwd = File::open(format!("/proc/{pid}/cwd"))?;
        Ok(Self { handles, root, cwd })
    }

    /// Enter every captured namespace, then chroot to the captured root
    /// and chdir to the captured cwd.
    ///
    /// The mount namespace is entered last so the other `/proc` fds stay
    /// valid while switching.
    pub fn enter(&self) -> PortoResult<()> {
        for handle in self.handles.iter().filter(|h| h.kind != NsKind::Mnt) {
            handle.enter()?;
        }
        if let Some(mnt) = self.handles.iter().find(|h| h.kind == NsKind::Mnt) {
            mnt.enter()?;
        }
        let rc = unsafe { libc::fchdir(self.root.as_raw_fd()) };
        if rc != 0 {
            return Err(PortoError::from_errno("fchdir to captured root"));
        }
        let cwd = std::ffi::CString::new(".").expect("static string");
        let rc = unsafe { libc::chroot(cwd.as_ptr()) };
        if rc != 0 {
            return Err(PortoError::from_errno("chroot to captured root"));
        }
        let rc = unsafe { libc::fchdir(self.cwd.as_raw_fd()) };
        if rc != 0 {
            return Err(PortoError::from_errno("fchdir to captured cwd"));
        }
        Ok(())
    }

    /// Handle of one captured namespace kind, if present.
    #[must_use]
    pub fn handle(&self, kind: NsKind) -> Option<&NsHandle> {
        self.handles.iter().find(|h| h.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_names_and_flags() {
        assert_eq!(NsKind::Mnt.proc_name(), "mnt");
        assert_eq!(NsKind::Pid.clone_flag(), libc::CLONE_NEWPID);
        assert_eq!(NsKind::all().len(), 5);
    }

    #[test]
    fn own_namespaces_compare_equal() {
        let pid = std::process::id() as libc::pid_t;
        let a = NsHandle::open(pid, NsKind::Mnt).unwrap();
        let b = NsHandle::open(pid, NsKind::Mnt).unwrap();
        assert!(a.same_as(&b).unwrap());
        assert_eq!(a.kind(), NsKind::Mnt);
    }

    #[test]
    fn snapshot_captures_self() {
        let pid = std::process::id() as libc::pid_t;
        let snapshot = NsSnapshot::capture(pid).unwrap();
        assert!(snapshot.handle(NsKind::Mnt).is_some());
        assert!(snapshot.handle(NsKind::Net).is_some());
    }
}
