#![allow(unsafe_code)]
//! Task spawner.
//!
//! Launches a container's first process through a fork pipeline:
//!
//! - the supervisor forks a **middle** process over a socketpair;
//! - the middle attaches itself to the target cgroups, opens stdio on the
//!   host side, enters the parent container's namespaces, unshares the
//!   requested new namespaces and forks the **payload**;
//! - the payload builds the mount tree, drops privileges and execs.
//!
//! Pids and errors travel back as tagged words; the report socket is
//! close-on-exec, so a successful exec reads as EOF.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use porto_common::{Cred, PortoError, PortoResult};

use crate::cgroup::Cgroup;
use crate::namespace::mount::MountEnv;
use crate::namespace::NsSnapshot;

/// Report-message tags on the spawn socket.
const TAG_WPID: u8 = 1;
const TAG_VPID: u8 = 2;
const TAG_PPID: u8 = 3;
const TAG_ERRNO: u8 = 4;

/// One rlimit setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Rlimit {
    /// RLIMIT_* resource number.
    pub resource: i32,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

/// Everything needed to launch a container's root task.
#[derive(Debug)]
pub struct TaskEnv {
    /// Container name, for logging only.
    pub container: String,
    /// Command line, argv[0] first.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory inside the container root.
    pub cwd: PathBuf,
    /// Credentials the payload runs as.
    pub cred: Cred,
    /// Hostname, applied when a new uts namespace exists.
    pub hostname: Option<String>,
    /// Unshare pid/mnt/uts/ipc namespaces.
    pub isolate: bool,
    /// Unshare the network namespace.
    pub new_net: bool,
    /// Namespaces of the parent container to enter first.
    pub parent_ns: Option<NsSnapshot>,
    /// Mount-tree description.
    pub mounts: MountEnv,
    /// Cgroups the task is attached to before it starts.
    pub cgroups: Vec<Cgroup>,
    /// Stdio paths, host view.
    pub stdin_path: PathBuf,
    /// Stdout destination.
    pub stdout_path: PathBuf,
    /// Stderr destination.
    pub stderr_path: PathBuf,
    /// Resource limits.
    pub rlimits: Vec<Rlimit>,
    /// Bounding-set capability mask; bit N keeps capability N.
    pub cap_bound: u64,
    /// How long to wait for the pipeline to report.
    pub start_timeout: Duration,
}

/// Pids of a launched task in the three relevant views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    /// Pid in the host namespace.
    pub host_pid: libc::pid_t,
    /// Pid in the parent container's namespace.
    pub parent_pid: libc::pid_t,
    /// Pid in the task's own namespace, 1 when pid-isolated.
    pub container_pid: libc::pid_t,
}

/// Launch the task described by `env`.
///
/// On any failure every prepared cgroup is killed so no stray process
/// survives a botched start.
pub fn spawn(env: &TaskEnv) -> PortoResult<TaskHandle> {
    let (parent_sock, child_sock) = socketpair()?;

    tracing::debug!(container = %env.container, command = ?env.command, "spawning task");

    let middle_pid = unsafe { libc::fork() };
    if middle_pid < 0 {
        return Err(PortoError::from_errno("fork middle process"));
    }

    if middle_pid == 0 {
        // Middle process; never returns.
        drop(parent_sock);
        let code = middle_main(env, child_sock.as_raw_fd());
        unsafe { libc::_exit(code) };
    }

    drop(child_sock);
    match supervise(env, &parent_sock, middle_pid) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            for cg in &env.cgroups {
                let _ = cg.kill_all(libc::SIGKILL);
            }
            reap(middle_pid);
            Err(e)
        }
    }
}

/// Parent side: collect pids, reap the middle, send the go token and
/// wait for exec confirmation.
fn supervise(env: &TaskEnv, sock: &OwnedFd, middle_pid: libc::pid_t) -> PortoResult<TaskHandle> {
    let deadline = Instant::now() + env.start_timeout;
    let mut wpid = None;
    let mut vpid = None;
    let mut ppid = None;

    while wpid.is_none() || vpid.is_none() || ppid.is_none() {
        let (tag, value) = read_report(sock, deadline)?.ok_or_else(|| {
            PortoError::unknown(format!(
                "task pipeline for {} died before reporting pids",
                env.container
            ))
        })?;
        match tag {
            TAG_WPID => wpid = Some(value),
            TAG_VPID => vpid = Some(value),
            TAG_PPID => ppid = Some(value),
            TAG_ERRNO => {
                reap(middle_pid);
                return Err(PortoError::Unknown {
                    message: format!("task setup for {} failed", env.container),
                    errno: value,
                });
            }
            _ => {
                return Err(PortoError::unknown(format!(
                    "bad report tag {tag} from task pipeline"
                )))
            }
        }
    }

    reap(middle_pid);

    // Go token: the payload may exec now. A write failure means the
    // payload died first; its errno report is read below.
    let go = [0u8];
    unsafe {
        libc::write(sock.as_raw_fd(), go.as_ptr().cast(), 1);
    }

    // EOF means the close-on-exec fd is gone and the payload is running.
    match read_report(sock, deadline)? {
        None => Ok(TaskHandle {
            host_pid: wpid.expect("checked above"),
            parent_pid: vpid.expect("checked above"),
            container_pid: ppid.expect("checked above"),
        }),
        Some((TAG_ERRNO, errno)) => Err(PortoError::Unknown {
            message: format!("exec of {:?} failed", env.command.first()),
            errno,
        }),
        Some((tag, _)) => Err(PortoError::unknown(format!(
            "unexpected report tag {tag} after go token"
        ))),
    }
}

/// Middle process body. Returns the exit code; all errors are reported
/// through the socket first.
fn middle_main(env: &TaskEnv, sock: RawFd) -> i32 {
    if let Err(errno) = middle_setup(env, sock) {
        report(sock, TAG_ERRNO, errno);
        return 1;
    }
    0
}

fn middle_setup(env: &TaskEnv, sock: RawFd) -> Result<(), i32> {
    reset_signals();

    let my_pid = unsafe { libc::getpid() };
    for cg in &env.cgroups {
        cg.attach(my_pid).map_err(|e| nonzero(e.errno()))?;
    }

    // Host-relative stdio is opened before any namespace change.
    let stdin_fd = open_stdio(&env.stdin_path, libc::O_RDONLY)?;
    let stdout_fd = open_stdio(&env.stdout_path, libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND)?;
    let stderr_fd = open_stdio(&env.stderr_path, libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND)?;

    if let Some(parent_ns) = &env.parent_ns {
        parent_ns.enter().map_err(|e| nonzero(e.errno()))?;
    }

    let mut unshare_flags = 0;
    if env.isolate {
        unshare_flags |= libc::CLONE_NEWPID | libc::CLONE_NEWNS | libc::CLONE_NEWUTS | libc::CLONE_NEWIPC;
    } else {
        unshare_flags |= libc::CLONE_NEWNS;
    }
    if env.new_net {
        unshare_flags |= libc::CLONE_NEWNET;
    }
    if unsafe { libc::unshare(unshare_flags) } != 0 {
        return Err(last_errno());
    }

    let payload_pid = unsafe { libc::fork() };
    if payload_pid < 0 {
        return Err(last_errno());
    }

    if payload_pid == 0 {
        // Payload: the container's root task.
        let code = payload_main(env, sock, stdin_fd, stdout_fd, stderr_fd);
        unsafe { libc::_exit(code) };
    }

    // The middle still shares the host pid namespace view unless it
    // entered a parent pid namespace, in which case the fork return is
    // the parent-view pid and the host pid is recovered via NSpid.
    let host_pid = if env.parent_ns.is_some() {
        host_pid_of(payload_pid, env).unwrap_or(payload_pid)
    } else {
        payload_pid
    };
    let container_pid = if env.isolate { 1 } else { payload_pid };

    report(sock, TAG_WPID, host_pid);
    report(sock, TAG_VPID, payload_pid);
    report(sock, TAG_PPID, container_pid);
    Ok(())
}

/// Payload body: isolation, privileges, stdio, go token, exec.
fn payload_main(env: &TaskEnv, sock: RawFd, stdin_fd: RawFd, stdout_fd: RawFd, stderr_fd: RawFd) -> i32 {
    match payload_setup(env, sock, stdin_fd, stdout_fd, stderr_fd) {
        Ok(never) => never,
        Err(errno) => {
            report(sock, TAG_ERRNO, errno);
            127
        }
    }
}

fn payload_setup(
    env: &TaskEnv,
    sock: RawFd,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
) -> Result<i32, i32> {
    env.mounts.build().map_err(|e| nonzero(e.errno()))?;

    if env.isolate {
        if let Some(hostname) = &env.hostname {
            let rc = unsafe {
                libc::sethostname(hostname.as_ptr().cast(), hostname.len())
            };
            if rc != 0 {
                return Err(last_errno());
            }
        }
    }

    for rlimit in &env.rlimits {
        let value = libc::rlimit {
            rlim_cur: rlimit.soft,
            rlim_max: rlimit.hard,
        };
        let rc = unsafe { libc::setrlimit(rlimit.resource as libc::c_int as _, &value) };
        if rc != 0 {
            return Err(last_errno());
        }
    }

    drop_bounding_caps(env.cap_bound)?;
    drop_credentials(&env.cred)?;

    unsafe {
        if libc::dup2(stdin_fd, 0) < 0 || libc::dup2(stdout_fd, 1) < 0 || libc::dup2(stderr_fd, 2) < 0 {
            return Err(last_errno());
        }
        libc::close(stdin_fd);
        libc::close(stdout_fd);
        libc::close(stderr_fd);
    }

    if !env.cwd.as_os_str().is_empty() {
        let cwd = cstr(env.cwd.to_string_lossy().as_ref())?;
        if unsafe { libc::chdir(cwd.as_ptr()) } != 0 {
            return Err(last_errno());
        }
    }

    // Wait for the supervisor's go token.
    let mut token = [0u8];
    let rc = unsafe { libc::read(sock, token.as_mut_ptr().cast(), 1) };
    if rc != 1 {
        return Err(libc::EPIPE);
    }

    restore_signals();

    let argv: Vec<CString> = env
        .command
        .iter()
        .map(|a| cstr(a))
        .collect::<Result<_, _>>()?;
    let envp: Vec<CString> = env
        .env
        .iter()
        .map(|(k, v)| cstr(&format!("{k}={v}")))
        .collect::<Result<_, _>>()?;

    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|e| e.as_ptr()).collect();
    envp_ptrs.push(std::ptr::null());

    unsafe {
        libc::execvpe(argv_ptrs[0], argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
    }
    Err(last_errno())
}

/// Recover the host-namespace pid of a task via the NSpid line of any
/// process in the container's first cgroup.
fn host_pid_of(parent_view_pid: libc::pid_t, env: &TaskEnv) -> Option<libc::pid_t> {
    let cg = env.cgroups.first()?;
    for pid in cg.get_processes().ok()? {
        let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("NSpid:") {
                let pids: Vec<libc::pid_t> =
                    rest.split_whitespace().filter_map(|p| p.parse().ok()).collect();
                if pids.len() >= 2 && pids[1..].contains(&parent_view_pid) {
                    return pids.first().copied();
                }
            }
        }
    }
    None
}

fn drop_bounding_caps(keep_mask: u64) -> Result<(), i32> {
    let last_cap = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(40);
    for cap in 0..=last_cap {
        if keep_mask & (1 << cap) == 0 {
            let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
            if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EINVAL) {
                return Err(last_errno());
            }
        }
    }
    Ok(())
}

/// setgid, setgroups, setuid, strictly in this order.
fn drop_credentials(cred: &Cred) -> Result<(), i32> {
    unsafe {
        if libc::setgid(cred.gid) != 0 {
            return Err(last_errno());
        }
        let groups: Vec<libc::gid_t> = cred.grps.clone();
        if libc::setgroups(groups.len(), groups.as_ptr()) != 0 {
            return Err(last_errno());
        }
        if libc::setuid(cred.uid) != 0 {
            return Err(last_errno());
        }
    }
    Ok(())
}

fn open_stdio(path: &std::path::Path, flags: libc::c_int) -> Result<RawFd, i32> {
    if path.as_os_str().is_empty() {
        let null = cstr("/dev/null")?;
        let fd = unsafe { libc::open(null.as_ptr(), flags & !libc::O_CREAT, 0) };
        return if fd < 0 { Err(last_errno()) } else { Ok(fd) };
    }
    let c_path = cstr(path.to_string_lossy().as_ref())?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o644) };
    if fd < 0 {
        Err(last_errno())
    } else {
        Ok(fd)
    }
}

fn report(sock: RawFd, tag: u8, value: i32) {
    let mut buf = [0u8; 5];
    buf[0] = tag;
    buf[1..].copy_from_slice(&value.to_ne_bytes());
    unsafe {
        libc::write(sock, buf.as_ptr().cast(), buf.len());
    }
}

/// Read one tagged report word, `None` on clean EOF.
fn read_report(sock: &OwnedFd, deadline: Instant) -> PortoResult<Option<(u8, i32)>> {
    let mut buf = [0u8; 5];
    let mut read = 0;
    while read < buf.len() {
        let now = Instant::now();
        if now >= deadline {
            return Err(PortoError::Busy {
                message: "task pipeline timed out".to_string(),
            });
        }
        let timeout_ms = (deadline - now).as_millis().min(i32::MAX as u128) as i32;
        let mut pfd = libc::pollfd {
            fd: sock.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }
        if rc == 0 {
            return Err(PortoError::Busy {
                message: "task pipeline timed out".to_string(),
            });
        }
        let n = unsafe {
            libc::read(
                sock.as_raw_fd(),
                buf[read..].as_mut_ptr().cast(),
                buf.len() - read,
            )
        };
        match n {
            0 if read == 0 => return Ok(None),
            0 => {
                return Err(PortoError::unknown("short report from task pipeline"));
            }
            n if n < 0 => {
                let e = std::io::Error::last_os_error();
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            n => read += n as usize,
        }
    }
    let value = i32::from_ne_bytes([buf[1], buf[2], buf[3], buf[4]]);
    Ok(Some((buf[0], value)))
}

fn socketpair() -> PortoResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(PortoError::from_errno("socketpair"));
    }
    // SAFETY: both fds are freshly created and owned here.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

fn reap(pid: libc::pid_t) {
    let mut status = 0;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
}

fn reset_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
    }
}

fn restore_signals() {
    for sig in [libc::SIGPIPE, libc::SIGCHLD, libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}

fn cstr(s: &str) -> Result<CString, i32> {
    CString::new(s).map_err(|_| libc::EINVAL)
}

fn nonzero(errno: i32) -> i32 {
    if errno == 0 {
        libc::EIO
    } else {
        errno
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_words_roundtrip() {
        let (a, b) = socketpair().unwrap();
        report(b.as_raw_fd(), TAG_VPID, 4321);
        let deadline = Instant::now() + Duration::from_secs(1);
        let (tag, value) = read_report(&a, deadline).unwrap().unwrap();
        assert_eq!(tag, TAG_VPID);
        assert_eq!(value, 4321);
    }

    #[test]
    fn eof_reads_as_none() {
        let (a, b) = socketpair().unwrap();
        drop(b);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(read_report(&a, deadline).unwrap().is_none());
    }

    #[test]
    fn timeout_reports_busy() {
        let (a, _b) = socketpair().unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(matches!(
            read_report(&a, deadline),
            Err(PortoError::Busy { .. })
        ));
    }
}
