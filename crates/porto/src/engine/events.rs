#![allow(unsafe_code)]
//! Event handlers.
//!
//! Exit, OOM, respawn, wait timeouts and the housekeeping sweep all land
//! here from the epoll loop. Handlers never propagate errors; failures
//! are logged and counted.

use std::sync::Arc;
use std::time::Duration;

use super::Engine;
use crate::container::{Container, ContainerState};
use crate::events::Event;
use crate::stats::Stats;

impl Engine {
    /// Dispatch one event. Never fails; handler errors are logged.
    pub fn handle_event(&self, event: Event) {
        Stats::bump(&self.stats.events_dispatched);
        tracing::debug!(?event, "dispatching event");

        match event {
            Event::Exit { pid, status } => self.handle_exit(pid, status),
            Event::Oom { container } => self.handle_oom(container),
            Event::Respawn { container } => self.handle_respawn(container),
            Event::WaitTimeout { waiter } => {
                let report = self
                    .waiters
                    .lock()
                    .timeout(waiter, chrono::Utc::now().timestamp());
                if let Some(report) = report {
                    self.reports.lock().push(report);
                }
            }
            Event::StopTimeout { container } => {
                // Grace expired: escalate to SIGKILL and finish the stop.
                let pending = self.pending_stops.lock().remove(&container);
                if let Some(pending) = pending {
                    let result = self.finalize_stop(container, pending.destroy);
                    self.report_op(pending.client, result);
                }
            }
            Event::CgroupCleanup { cgroup, attempt } => {
                self.handle_cgroup_cleanup(&cgroup, attempt);
            }
            Event::RotateLogs => self.handle_rotate_logs(),
            Event::CgroupSync => self.handle_cgroup_sync(),
            Event::UpdateNetwork => {
                if let Err(e) = self.network.update() {
                    tracing::warn!(error = %e, "network update failed");
                    Stats::bump(&self.stats.warns);
                }
            }
            Event::DestroyWeakContainer { container } => {
                let Ok(ct) = self.tree.find_by_id(container) else {
                    return;
                };
                if ct.read().weak_client.is_some() {
                    let name = ct.name().as_str().to_string();
                    if let Err(e) = self.destroy_container(&name, None) {
                        tracing::warn!(container = %name, error = %e, "weak destroy failed");
                        Stats::bump(&self.stats.warns);
                    }
                }
            }
        }
    }

    /// A reaped child exited: helper children resume their pending
    /// operations, container tasks die or finish a stop in flight.
    fn handle_exit(&self, pid: i32, status: i32) {
        if self.helper_exited(pid, status) {
            return;
        }
        let Some(ct) = self.find_by_pid(pid) else {
            // Exits of middle processes are not containers.
            tracing::debug!(pid, "exit of an unowned process");
            return;
        };
        if ct.read().stopping {
            ct.write().task = None;
            self.check_stop_progress(&ct);
            return;
        }
        self.on_death(&ct, status, false);
    }

    fn handle_oom(&self, container: u32) {
        let Ok(ct) = self.tree.find_by_id(container) else {
            return;
        };
        // OOM after death carries no information.
        if ct.state() == ContainerState::Dead {
            return;
        }
        Stats::bump(&self.stats.containers_oom);
        self.on_death(&ct, 9, true);
    }

    /// Transition to Dead, wake waiters, maybe schedule a respawn.
    pub(crate) fn on_death(&self, ct: &Arc<Container>, status: i32, oom: bool) {
        let respawn_due = {
            let mut rt = ct.write();
            // A stop in flight owns the exit; nothing to report.
            if rt.state == ContainerState::Dead || rt.stopping {
                return;
            }
            rt.state = ContainerState::Dead;
            rt.exit_status = Some(status);
            rt.oom_killed = oom;
            rt.death_time = Some(chrono::Utc::now());

            rt.props.respawn
                && (rt.props.max_respawns < 0
                    || rt.respawn_count < rt.props.max_respawns as u64)
        };

        tracing::info!(container = %ct.name(), status, oom, "container died");
        if let Err(e) = self.save_container(ct) {
            tracing::warn!(container = %ct.name(), error = %e, "persisting death failed");
            Stats::bump(&self.stats.warns);
        }

        let when = chrono::Utc::now().timestamp();
        let reports = self
            .waiters
            .lock()
            .notify(ct.name().as_str(), "dead", when);
        self.reports.lock().extend(reports);

        if respawn_due {
            self.events.lock().add(
                Duration::from_millis(self.config.container.respawn_delay_ms),
                Event::Respawn {
                    container: ct.id(),
                },
            );
        }
    }

    /// Restart a dead container with respawn enabled, keeping properties
    /// and counters, clearing runtime data.
    fn handle_respawn(&self, container: u32) {
        let Ok(ct) = self.tree.find_by_id(container) else {
            return;
        };
        {
            let rt = ct.read();
            if rt.state != ContainerState::Dead || !rt.props.respawn {
                return;
            }
            if rt.props.max_respawns >= 0 && rt.respawn_count >= rt.props.max_respawns as u64 {
                return;
            }
        }

        // The task is gone already, so the cleanup is purely releasing
        // kernel state; nothing blocks here.
        let name = ct.name().as_str().to_string();
        self.cleanup_node(&ct);
        ct.write().respawn_count += 1;
        if let Err(e) = self.start_container(&name) {
            tracing::warn!(container = %name, error = %e, "respawn start failed");
            Stats::bump(&self.stats.warns);
        }
    }

    /// Retry removal of cgroups the kernel has not emptied yet; each
    /// attempt is one kill sweep plus one rmdir, rescheduled instead of
    /// slept on.
    fn handle_cgroup_cleanup(&self, name: &str, attempt: u8) {
        const MAX_ATTEMPTS: u8 = 50;

        // The container may have restarted meanwhile; its cgroups are
        // live again and not ours to remove.
        if let Ok(ct) = self.tree.find(name) {
            if ct.state() != ContainerState::Stopped {
                return;
            }
        }

        let mut busy = false;
        for controller in crate::cgroup::Controller::all() {
            if !controller.supported() {
                continue;
            }
            let cg = crate::cgroup::Cgroup::for_container(*controller, name);
            if !cg.exists() {
                continue;
            }
            let _ = cg.kill_all(libc::SIGKILL);
            match cg.remove() {
                Ok(()) => {}
                Err(porto_common::PortoError::Busy { .. }) => busy = true,
                Err(e) => tracing::warn!(cgroup = %cg, error = %e, "cgroup removal failed"),
            }
        }

        if busy {
            if attempt < MAX_ATTEMPTS {
                self.events.lock().add(
                    Duration::from_millis(100),
                    Event::CgroupCleanup {
                        cgroup: name.to_string(),
                        attempt: attempt + 1,
                    },
                );
            } else {
                tracing::warn!(container = %name, "cgroups stayed busy, giving up");
                Stats::bump(&self.stats.warns);
            }
        }
    }

    /// Housekeeping: age out dead containers, cap stdio files.
    fn handle_rotate_logs(&self) {
        let now = chrono::Utc::now();
        let mut doomed = Vec::new();

        for ct in self.tree.list() {
            let rt = ct.read();
            if rt.state == ContainerState::Dead {
                if let Some(death) = rt.death_time {
                    let age = (now - death).num_seconds().max(0) as u64;
                    if age >= rt.props.aging_time_s {
                        doomed.push(ct.name().as_str().to_string());
                        continue;
                    }
                }
            }
            if rt.state.is_active() || rt.state == ContainerState::Dead {
                let limit = rt.props.stdout_limit.min(self.config.daemon.max_log_size);
                drop(rt);
                for name in ["stdout", "stderr"] {
                    let path = self.container_dir(ct.id()).join(name);
                    rotate_file(&path, limit);
                }
            }
        }

        for name in doomed {
            tracing::info!(container = %name, "aging out dead container");
            if let Err(e) = self.destroy_container(&name, None) {
                tracing::warn!(container = %name, error = %e, "aging destroy failed");
                Stats::bump(&self.stats.warns);
            }
        }
    }

    /// Reconcile lost-and-restored containers with the kernel.
    ///
    /// A lost container whose root task still runs re-enters Running and
    /// gets its OOM eventfd re-wired; one whose task vanished is marked
    /// Dead with the status observed so far.
    fn handle_cgroup_sync(&self) {
        for ct in self.tree.list() {
            if ct.state() != ContainerState::LostAndRestored {
                continue;
            }

            let task = ct.read().task;
            let alive = task.is_some_and(|t| {
                std::path::Path::new(&format!("/proc/{}", t.host_pid)).exists()
                    && self.pid_in_cgroup(&ct, t.host_pid)
            });

            if alive {
                {
                    let mut rt = ct.write();
                    rt.state = if rt.props.command.is_empty() {
                        ContainerState::Meta
                    } else {
                        ContainerState::Running
                    };
                }
                if crate::cgroup::Controller::Memory.supported() {
                    match crate::cgroup::MemoryCg::setup_oom_event(
                        &ct.cgroup(crate::cgroup::Controller::Memory),
                    ) {
                        Ok(fd) => {
                            use std::os::fd::AsRawFd;
                            self.fd_updates.lock().push(super::FdUpdate {
                                container: ct.id(),
                                fd: fd.as_raw_fd(),
                                add: true,
                            });
                            ct.write().oom_fd = Some(fd);
                        }
                        Err(e) => {
                            tracing::warn!(container = %ct.name(), error = %e,
                                "OOM re-wiring failed after restore");
                        }
                    }
                }
                tracing::info!(container = %ct.name(), "lost container re-adopted");
                let _ = self.save_container(&ct);
            } else {
                tracing::info!(container = %ct.name(), "lost container's task is gone");
                self.on_death(&ct, 0, false);
            }
        }
    }

    /// Container owning a host pid as its root task.
    #[must_use]
    pub fn find_by_pid(&self, pid: i32) -> Option<Arc<Container>> {
        self.tree
            .list()
            .into_iter()
            .find(|ct| ct.read().task.is_some_and(|t| t.host_pid == pid))
    }

    fn pid_in_cgroup(&self, ct: &Arc<Container>, pid: i32) -> bool {
        let controller = crate::cgroup::Controller::Freezer;
        if !controller.supported() {
            return true;
        }
        crate::cgroup::pid_cgroup(pid, controller)
            .map(|path| path == ct.cgroup(controller).name())
            .unwrap_or(false)
    }
}

fn rotate_file(path: &std::path::Path, limit: u64) {
    let Ok(meta) = path.metadata() else { return };
    if meta.len() <= limit {
        return;
    }
    // Keep the newest half by copying the tail in place.
    if let Ok(data) = std::fs::read(path) {
        let keep = (limit / 2) as usize;
        let tail = &data[data.len().saturating_sub(keep)..];
        let _ = std::fs::write(path, tail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exec::TaskHandle;
    use porto_common::{ContainerName, Cred, PortoPaths};

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PortoPaths::with_roots(dir.path().join("run"), dir.path().join("place"));
        (dir, Engine::new(Config::default(), paths).unwrap())
    }

    fn running(engine: &Engine, name: &str, pid: i32) -> Arc<Container> {
        let ct = engine
            .create_container(&ContainerName::new(name).unwrap(), Cred::root(), None)
            .unwrap();
        {
            let mut rt = ct.write();
            rt.props.set("command", "sleep 1000").unwrap();
            rt.state = ContainerState::Running;
            rt.task = Some(TaskHandle {
                host_pid: pid,
                parent_pid: pid,
                container_pid: 1,
            });
        }
        ct
    }

    #[test]
    fn exit_event_marks_dead_and_wakes_waiters() {
        let (_dir, engine) = engine();
        let ct = running(&engine, "a", 4242);
        engine
            .wait_containers(7, &["a".to_string()], None)
            .unwrap();

        engine.handle_event(Event::Exit {
            pid: 4242,
            status: 256,
        });

        assert_eq!(ct.state(), ContainerState::Dead);
        assert_eq!(ct.read().exit_status, Some(256));
        let reports = engine.take_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].client, 7);
        assert_eq!(reports[0].name, "a");
    }

    #[test]
    fn oom_after_death_is_ignored() {
        let (_dir, engine) = engine();
        let ct = running(&engine, "a", 100);
        engine.handle_event(Event::Exit { pid: 100, status: 0 });
        assert_eq!(ct.read().exit_status, Some(0));

        engine.handle_event(Event::Oom { container: ct.id() });
        // Status is unchanged: the OOM arrived too late.
        assert_eq!(ct.read().exit_status, Some(0));
        assert!(!ct.read().oom_killed);
    }

    #[test]
    fn oom_sets_killed_flag_and_status_nine() {
        let (_dir, engine) = engine();
        let ct = running(&engine, "a", 100);
        engine.handle_event(Event::Oom { container: ct.id() });

        let rt = ct.read();
        assert_eq!(rt.state, ContainerState::Dead);
        assert_eq!(rt.exit_status, Some(9));
        assert!(rt.oom_killed);
    }

    #[test]
    fn death_schedules_respawn_within_bounds() {
        let (_dir, engine) = engine();
        let ct = running(&engine, "a", 100);
        {
            let mut rt = ct.write();
            rt.props.set("respawn", "true").unwrap();
            rt.props.set("max_respawns", "2").unwrap();
            rt.respawn_count = 2;
        }
        engine.handle_event(Event::Exit { pid: 100, status: 0 });
        // Ceiling reached: no respawn event queued.
        assert!(engine.events.lock().is_empty());

        let ct2 = running(&engine, "b", 200);
        ct2.write().props.set("respawn", "true").unwrap();
        engine.handle_event(Event::Exit { pid: 200, status: 0 });
        assert_eq!(engine.events.lock().len(), 1);
    }

    #[test]
    fn wait_timeout_delivers_empty_report() {
        let (_dir, engine) = engine();
        engine
            .create_container(&ContainerName::new("a").unwrap(), Cred::root(), None)
            .unwrap();
        engine
            .wait_containers(3, &["a".to_string()], Some(Duration::from_secs(60)))
            .unwrap();

        let handle = 1;
        engine.handle_event(Event::WaitTimeout { waiter: handle });
        let reports = engine.take_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "");
    }

    #[test]
    fn aging_destroys_old_dead_containers() {
        let (_dir, engine) = engine();
        let ct = running(&engine, "a", 100);
        engine.handle_event(Event::Exit { pid: 100, status: 0 });
        {
            let mut rt = ct.write();
            rt.props.set("aging_time", "0").unwrap();
            rt.death_time = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
        }

        engine.handle_event(Event::RotateLogs);
        assert!(!engine.tree.contains("a"));
    }

    #[test]
    fn unknown_exit_pid_is_ignored() {
        let (_dir, engine) = engine();
        running(&engine, "a", 100);
        engine.handle_event(Event::Exit {
            pid: 999,
            status: 0,
        });
        assert_eq!(engine.tree.find("a").unwrap().state(), ContainerState::Running);
    }
}
