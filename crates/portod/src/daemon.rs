#![allow(unsafe_code)]
//! The slave daemon: the single-threaded event loop.
//!
//! One epoll set multiplexes the RPC listener, every client socket,
//! every live OOM eventfd, the signalfd and the exit-status pipe from
//! the master. `epoll_wait` is the only place the process blocks.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use porto::epoll::{EpollLoop, Source};
use porto::events::Event;
use porto::stats::Stats;
use porto::{Config, Engine};
use porto_common::{PortoPaths, PortoResult};

use crate::rpc::{ClientConn, Dispatcher, Response};

/// Fd of the exit-status pipe inherited from the master.
pub const STATUS_PIPE_FD: RawFd = 3;

/// Run the slave until a terminating signal; returns that signal.
pub fn run(config: Config, paths: PortoPaths) -> PortoResult<i32> {
    // Orphaned container tasks must reparent to us, not to init.
    unsafe {
        libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
    }

    let engine = Engine::new(config, paths)?;
    if let Err(e) = engine.kvs.mount_tmpfs(engine.config.daemon.keyvalue_size) {
        tracing::warn!(error = %e, "key-value tmpfs mount failed, using the plain directory");
    }
    engine.restore()?;
    Stats::bump(&engine.stats.spawned);

    let socket_path = engine.paths.socket();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    listener.set_nonblocking(true)?;
    setup_socket_permissions(&socket_path);

    let mut epoll = EpollLoop::new()?;
    {
        use std::os::fd::AsRawFd;
        epoll.add(listener.as_raw_fd(), Source::Listener)?;
    }
    if status_pipe_present() {
        unsafe {
            let flags = libc::fcntl(STATUS_PIPE_FD, libc::F_GETFL);
            libc::fcntl(STATUS_PIPE_FD, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        epoll.add(STATUS_PIPE_FD, Source::StatusPipe)?;
    }

    let rotate_period = Duration::from_secs(engine.config.daemon.rotate_period_s);
    {
        let mut events = engine.events.lock();
        events.add(rotate_period, Event::RotateLogs);
        events.add(rotate_period, Event::UpdateNetwork);
    }

    let mut loop_state = LoopState {
        engine: &engine,
        epoll: &mut epoll,
        listener: &listener,
        clients: HashMap::new(),
        by_client_id: HashMap::new(),
        next_client_id: 1,
    };

    tracing::info!(socket = %socket_path.display(), "porto is serving");

    let exit_signal = loop_state.run(rotate_period)?;

    let _ = std::fs::remove_file(&socket_path);
    tracing::info!(signal = exit_signal, "porto is shutting down");
    Ok(exit_signal)
}

struct LoopState<'a> {
    engine: &'a Engine,
    epoll: &'a mut EpollLoop,
    listener: &'a UnixListener,
    clients: HashMap<RawFd, ClientConn>,
    by_client_id: HashMap<u64, RawFd>,
    next_client_id: u64,
}

impl LoopState<'_> {
    fn run(&mut self, rotate_period: Duration) -> PortoResult<i32> {
        loop {
            let timeout = self
                .engine
                .events
                .lock()
                .next_deadline()
                .map_or(rotate_period, |deadline| {
                    deadline.saturating_duration_since(Instant::now())
                })
                .min(rotate_period);

            let ready = self.epoll.wait(timeout)?;

            for signal in self.epoll.drain_signals() {
                match signal {
                    Signal::SIGCHLD => self.reap_children(),
                    Signal::SIGHUP => reopen_log(),
                    Signal::SIGTERM | Signal::SIGINT => {
                        self.engine.events.lock().clear();
                        return Ok(signal as i32);
                    }
                    other => tracing::debug!(signal = %other, "ignored signal"),
                }
            }

            loop {
                let due = self.engine.events.lock().pop_due(Instant::now());
                let Some(event) = due else { break };
                let periodic = matches!(event, Event::RotateLogs | Event::UpdateNetwork);
                let again = event.clone();
                self.engine.handle_event(event);
                if periodic {
                    self.engine.events.lock().add(rotate_period, again);
                }
                self.sync_engine();
            }

            for item in ready {
                match item.source {
                    Source::Listener => self.accept_clients(),
                    Source::Client(fd) => self.serve_client(fd, item.writable),
                    Source::Oom(container) => self.handle_oom_fd(container),
                    Source::Signal | Source::StatusPipe => {}
                }
                self.sync_engine();
            }

            // The status pipe is drained outside the match so a readable
            // signalfd in the same wakeup cannot starve it.
            self.drain_status_pipe();
            self.sync_engine();
        }
    }

    /// Apply OOM fd registrations and deliver completed waits and
    /// deferred operations.
    fn sync_engine(&mut self) {
        for update in self.engine.take_fd_updates() {
            let result = if update.add {
                self.epoll.add(update.fd, Source::Oom(update.container))
            } else {
                self.epoll.remove(update.fd)
            };
            if let Err(e) = result {
                tracing::warn!(fd = update.fd, error = %e, "OOM fd registration failed");
            }
        }

        for report in self.engine.take_reports() {
            let Some(&fd) = self.by_client_id.get(&report.client) else {
                continue;
            };
            if let Some(client) = self.clients.get_mut(&fd) {
                let display = client
                    .identity
                    .as_ref()
                    .map(|i| {
                        report
                            .name
                            .strip_prefix(&i.namespace)
                            .unwrap_or(&report.name)
                            .to_string()
                    })
                    .unwrap_or_else(|| report.name.clone());
                let response = Response::ok(serde_json::json!({
                    "name": display,
                    "state": report.state,
                    "when": report.when,
                }));
                client.waiting = false;
                if client.queue_response(&response).is_err() {
                    self.disconnect(fd);
                } else {
                    self.rearm(fd);
                }
            }
        }

        // Deferred operations: stops, destroys, volume builds, imports.
        for report in self.engine.take_op_reports() {
            let Some(&fd) = self.by_client_id.get(&report.client) else {
                continue;
            };
            if let Some(client) = self.clients.get_mut(&fd) {
                let response = match report.result {
                    Ok(Some(value)) => Response::ok(serde_json::json!(value)),
                    Ok(None) => Response::empty(),
                    Err(e) => Response::from_error(&e),
                };
                client.waiting = false;
                if client.queue_response(&response).is_err() {
                    self.disconnect(fd);
                } else {
                    self.rearm(fd);
                }
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = self.register_client(stream) {
                        tracing::warn!(error = %e, "client registration failed");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn register_client(&mut self, stream: UnixStream) -> PortoResult<()> {
        let id = self.next_client_id;
        self.next_client_id += 1;
        let client = ClientConn::new(id, stream)?;
        let fd = client.fd();
        self.epoll.add(fd, Source::Client(fd))?;
        self.by_client_id.insert(id, fd);
        self.clients.insert(fd, client);
        Stats::bump(&self.engine.stats.clients_accepted);
        Ok(())
    }

    fn serve_client(&mut self, fd: RawFd, writable: bool) {
        let engine = self.engine;
        let max_len = engine.config.daemon.max_msg_len;
        let mut requests = Vec::new();

        let alive = match self.clients.get_mut(&fd) {
            Some(client) => {
                if writable {
                    let _ = client.flush();
                }
                match client.read_requests(max_len, &mut requests) {
                    Ok(alive) => alive,
                    Err(e) => {
                        tracing::debug!(fd, error = %e, "client read failed");
                        false
                    }
                }
            }
            None => return,
        };

        if !alive {
            self.disconnect(fd);
            return;
        }

        for request in requests {
            let dispatcher = Dispatcher::new(engine);
            let Some(client) = self.clients.get_mut(&fd) else {
                return;
            };
            let outcome = dispatcher.dispatch(client, request);
            let response = match outcome {
                Ok(Some(response)) => response,
                Ok(None) => continue, // deferred wait
                Err(e) => {
                    Stats::bump(&engine.stats.requests_failed);
                    Response::from_error(&e)
                }
            };
            Stats::bump(&engine.stats.requests_completed);
            if client.queue_response(&response).is_err() {
                self.disconnect(fd);
                return;
            }
        }
        self.rearm(fd);
    }

    fn rearm(&mut self, fd: RawFd) {
        if let Some(client) = self.clients.get(&fd) {
            let _ = self.epoll.modify(fd, Source::Client(fd), client.wants_write());
        }
    }

    fn disconnect(&mut self, fd: RawFd) {
        if let Some(client) = self.clients.remove(&fd) {
            tracing::debug!(client = client.id, "client disconnected");
            self.by_client_id.remove(&client.id);
            let _ = self.epoll.remove(fd);
            self.engine.client_disconnected(client.id);
        }
    }

    /// SIGCHLD: reap everything that exited and synthesize Exit events.
    fn reap_children(&mut self) {
        loop {
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            self.engine.handle_event(Event::Exit { pid, status });
        }
    }

    /// An OOM eventfd fired: consume the counter, raise the event.
    fn handle_oom_fd(&mut self, container: u32) {
        if let Ok(ct) = self.engine.tree.find_by_id(container) {
            let fd = {
                use std::os::fd::AsRawFd;
                ct.read().oom_fd.as_ref().map(|f| f.as_raw_fd())
            };
            if let Some(fd) = fd {
                let mut counter = [0u8; 8];
                unsafe {
                    libc::read(fd, counter.as_mut_ptr().cast(), 8);
                }
            }
        }
        self.engine.handle_event(Event::Oom { container });
    }

    /// Exit statuses of re-adopted tasks forwarded by the master.
    fn drain_status_pipe(&mut self) {
        if !status_pipe_present() {
            return;
        }
        loop {
            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(STATUS_PIPE_FD, buf.as_mut_ptr().cast(), 8) };
            if n != 8 {
                break;
            }
            let pid = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
            let status = i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
            self.engine.handle_event(Event::Exit { pid, status });
        }
    }
}

fn status_pipe_present() -> bool {
    unsafe { libc::fcntl(STATUS_PIPE_FD, libc::F_GETFD) != -1 }
}

fn setup_socket_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660));
    if let Ok(gid) = porto_common::Cred::lookup_gid(porto_common::cred::PORTO_GROUP) {
        use std::os::unix::ffi::OsStrExt;
        if let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) {
            unsafe {
                libc::chown(c_path.as_ptr(), u32::MAX, gid);
            }
        }
    }
}

/// SIGHUP: reopen the log file over stderr.
pub fn reopen_log() {
    let path = PortoPaths::default().slave_log();
    let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    else {
        return;
    };
    use std::os::fd::AsRawFd;
    unsafe {
        libc::dup2(file.as_raw_fd(), 2);
    }
    tracing::info!(log = %path.display(), "log reopened");
}
