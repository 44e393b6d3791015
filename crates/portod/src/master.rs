#![allow(unsafe_code)]
//! The master process.
//!
//! The master forks the slave and stays tiny: it reaps children, forwards
//! exit statuses of re-adopted container tasks to the slave over a pipe
//! read at fd 3, and respawns the slave when it dies abnormally. Kernel
//! state (cgroups, mounts, loop devices) survives slave restarts, so
//! containers keep running across them.

use std::os::fd::RawFd;

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::SignalFd;
use porto::Config;
use porto_common::{PortoPaths, PortoResult};

use crate::daemon::{self, STATUS_PIPE_FD};

/// Run the master until a terminating signal; returns that signal.
pub fn run(config: Config, paths: PortoPaths) -> PortoResult<i32> {
    write_pid_file(&paths.master_pid())?;
    unsafe {
        libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
    }

    let mut mask = SigSet::empty();
    for signal in [Signal::SIGCHLD, Signal::SIGHUP, Signal::SIGTERM, Signal::SIGINT] {
        mask.add(signal);
    }
    mask.thread_block()?;
    let mut signal_fd = SignalFd::new(&mask)?;

    let mut slave = SlaveHandle::spawn(&config, &paths)?;
    let mut respawns = 0u64;

    let exit_signal = loop {
        let Ok(Some(info)) = signal_fd.read_signal() else {
            continue;
        };
        match Signal::try_from(info.ssi_signo as i32) {
            Ok(Signal::SIGCHLD) => {
                if reap_and_forward(&mut slave) {
                    respawns += 1;
                    tracing::warn!(respawns, "slave died, respawning");
                    slave = SlaveHandle::spawn(&config, &paths)?;
                }
            }
            Ok(Signal::SIGHUP) => {
                daemon::reopen_log();
                slave.kill(libc::SIGHUP);
            }
            Ok(signal @ (Signal::SIGTERM | Signal::SIGINT)) => {
                slave.shutdown(config.daemon.portod_stop_timeout_s);
                break signal as i32;
            }
            _ => {}
        }
    };

    let _ = std::fs::remove_file(paths.master_pid());
    Ok(exit_signal)
}

struct SlaveHandle {
    pid: libc::pid_t,
    status_pipe: RawFd,
}

impl SlaveHandle {
    /// Fork the slave with the status pipe on fd 3.
    fn spawn(config: &Config, paths: &PortoPaths) -> PortoResult<Self> {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(porto_common::PortoError::from_errno("status pipe"));
        }
        let (read_end, write_end) = (fds[0], fds[1]);

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(porto_common::PortoError::from_errno("fork slave"));
        }

        if pid == 0 {
            // Slave: the pipe read end becomes fd 3, signals are reset so
            // the slave's own signalfd can claim them.
            unsafe {
                libc::close(write_end);
                libc::dup2(read_end, STATUS_PIPE_FD);
                libc::close(read_end);
                let mut set: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut set);
                libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
            }
            let _ = write_pid_file(&paths.slave_pid());
            let code = match daemon::run(config.clone(), paths.clone()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "slave failed");
                    1
                }
            };
            unsafe { libc::_exit(code) };
        }

        unsafe {
            libc::close(read_end);
        }
        tracing::info!(pid, "slave spawned");
        Ok(Self {
            pid,
            status_pipe: write_end,
        })
    }

    fn kill(&self, signal: i32) {
        unsafe {
            libc::kill(self.pid, signal);
        }
    }

    /// SIGTERM, bounded wait, SIGKILL.
    fn shutdown(&mut self, timeout_s: u64) {
        self.kill(libc::SIGTERM);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(timeout_s);
        loop {
            let mut status = 0;
            let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
            if rc == self.pid || rc < 0 {
                return;
            }
            if std::time::Instant::now() >= deadline {
                self.kill(libc::SIGKILL);
                unsafe {
                    libc::waitpid(self.pid, &mut status, 0);
                }
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }

    /// Forward a re-adopted task's exit status to the slave.
    fn forward(&self, pid: libc::pid_t, status: i32) {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&pid.to_ne_bytes());
        buf[4..].copy_from_slice(&status.to_ne_bytes());
        unsafe {
            libc::write(self.status_pipe, buf.as_ptr().cast(), 8);
        }
    }
}

impl Drop for SlaveHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.status_pipe);
        }
    }
}

/// Reap every exited child. Returns true when the slave itself died.
fn reap_and_forward(slave: &mut SlaveHandle) -> bool {
    let mut slave_died = false;
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        if pid == slave.pid {
            slave_died = true;
        } else {
            // A container task orphaned by a slave restart.
            slave.forward(pid, status);
        }
    }
    slave_died
}

fn write_pid_file(path: &std::path::Path) -> PortoResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}
