#![allow(unsafe_code)]
//! Helper child processes and deferred operations.
//!
//! tar, mkfs, losetup and rbd may legitimately block, so they never run
//! on the event-loop thread: the engine spawns them as child processes,
//! keeps a pending-operation record keyed by pid, and resumes the
//! operation when the SIGCHLD reaper observes the exit. A client whose
//! request started the chain gets its response through an [`OpReport`],
//! the same deferred pattern Wait uses.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use porto_common::{Cred, PortoError, PortoResult};

use super::Engine;
use crate::stats::Stats;
use crate::volume::{
    layer, storage, BuildOutcome, BuildPhase, CreateOutcome, DestroyOutcome, DestroyPhase,
    HelperCmd, LayerStore, StorageStore, UnlinkOutcome, Volume,
};

/// A deferred operation finished; the daemon writes the response.
#[derive(Debug)]
pub struct OpReport {
    /// Client to deliver to.
    pub client: u64,
    /// Success with an optional payload value, or the error.
    pub result: PortoResult<Option<String>>,
}

/// What to do when a helper child exits.
pub(crate) enum HelperKind {
    /// tar extraction of a layer into its staging directory.
    LayerImport {
        staging: PathBuf,
        target: PathBuf,
        owner: Cred,
        merge: bool,
    },
    /// tar extraction of a storage into its staging directory.
    StorageImport {
        staging: PathBuf,
        target: PathBuf,
        private_path: PathBuf,
        private: String,
    },
    /// tar export of a layer or storage; nothing left but the status.
    Export,
    /// One phase of a volume build chain.
    VolumeBuild { path: PathBuf, phase: BuildPhase },
    /// One phase of a volume teardown chain.
    VolumeDestroy {
        path: PathBuf,
        phase: DestroyPhase,
        strict: bool,
        links: Vec<String>,
    },
}

/// One running helper child.
pub(crate) struct HelperOp {
    stdout: Option<std::process::ChildStdout>,
    client: Option<u64>,
    kind: HelperKind,
}

impl Engine {
    /// Spawn a helper child without waiting for it; the exit resumes the
    /// operation from the reaper.
    pub(crate) fn spawn_helper(
        &self,
        cmd: HelperCmd,
        client: Option<u64>,
        kind: HelperKind,
    ) -> PortoResult<i32> {
        let mut command = Command::new(cmd.tool);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .stdout(if cmd.capture {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn().map_err(|e| PortoError::Unknown {
            message: format!("cannot run {}: {e}", cmd.tool),
            errno: e.raw_os_error().unwrap_or(0),
        })?;
        let pid = child.id() as i32;
        let stdout = child.stdout.take();
        // The Child handle is dropped without waiting; the SIGCHLD
        // reaper collects the exit like any other child.
        drop(child);

        tracing::debug!(tool = cmd.tool, pid, "helper spawned");
        self.helpers.lock().insert(
            pid,
            HelperOp {
                stdout,
                client,
                kind,
            },
        );
        Ok(pid)
    }

    /// Route a reaped pid to its pending operation. Returns false when
    /// the pid was no helper of ours.
    pub(crate) fn helper_exited(&self, pid: i32, status: i32) -> bool {
        let Some(op) = self.helpers.lock().remove(&pid) else {
            return false;
        };

        // The writer is gone, so this drains the pipe buffer and stops.
        let output = op.stdout.map_or_else(String::new, |mut pipe| {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        });
        let ok = libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
        tracing::debug!(pid, ok, "helper exited");

        match op.kind {
            HelperKind::LayerImport {
                staging,
                target,
                owner,
                merge,
            } => {
                let result = if ok {
                    layer::finish_import(&staging, &target, &owner, merge).map(|()| None)
                } else {
                    let _ = std::fs::remove_dir_all(&staging);
                    Err(helper_failed("tar", status))
                };
                self.complete_op(op.client, result);
            }
            HelperKind::StorageImport {
                staging,
                target,
                private_path,
                private,
            } => {
                let result = if ok {
                    storage::finish_import(&staging, &target, &private_path, &private)
                        .map(|()| None)
                } else {
                    let _ = std::fs::remove_dir_all(&staging);
                    Err(helper_failed("tar", status))
                };
                self.complete_op(op.client, result);
            }
            HelperKind::Export => {
                let result = if ok {
                    Ok(None)
                } else {
                    Err(helper_failed("tar", status))
                };
                self.complete_op(op.client, result);
            }
            HelperKind::VolumeBuild { path, phase } => {
                self.resume_volume_build(&path, phase, ok, status, &output, op.client);
            }
            HelperKind::VolumeDestroy {
                path,
                phase,
                strict,
                links,
            } => {
                self.resume_volume_destroy(&path, phase, strict, links, ok, status, &output, op.client);
            }
        }
        true
    }

    fn resume_volume_build(
        &self,
        path: &Path,
        phase: BuildPhase,
        ok: bool,
        status: i32,
        output: &str,
        client: Option<u64>,
    ) {
        let step = (|| {
            if !ok {
                return Err(helper_failed("volume helper", status));
            }
            let volume = self.volumes.find(path)?;
            let outcome = self.volumes.resume_build(&volume, phase, output)?;
            Ok((volume, outcome))
        })();

        match step {
            Ok((volume, BuildOutcome::Ready)) => {
                let result = self.volumes.finish_build(&volume).map(|()| {
                    Stats::bump(&self.stats.volumes_created);
                    Some(path.display().to_string())
                });
                if result.is_err() {
                    self.volumes.fail_build(&volume);
                }
                self.complete_op(client, result);
            }
            Ok((volume, BuildOutcome::Pending(cmd, next))) => {
                let kind = HelperKind::VolumeBuild {
                    path: path.to_path_buf(),
                    phase: next,
                };
                if let Err(e) = self.spawn_helper(cmd, client, kind) {
                    self.volumes.fail_build(&volume);
                    self.complete_op(client, Err(e));
                }
            }
            Err(e) => {
                if let Ok(volume) = self.volumes.find(path) {
                    self.volumes.fail_build(&volume);
                }
                self.complete_op(client, Err(e));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn resume_volume_destroy(
        &self,
        path: &Path,
        phase: DestroyPhase,
        strict: bool,
        links: Vec<String>,
        ok: bool,
        status: i32,
        output: &str,
        client: Option<u64>,
    ) {
        let step = (|| {
            if !ok {
                return Err(helper_failed("volume helper", status));
            }
            let volume = self.volumes.find(path)?;
            let outcome = self.volumes.resume_destroy(&volume, phase, output)?;
            Ok((volume, outcome))
        })();

        match step {
            Ok((volume, DestroyOutcome::Done)) => {
                let result = self.volumes.finish_destroy(&volume).map(|()| None);
                self.complete_op(client, result);
            }
            Ok((volume, DestroyOutcome::Pending(cmd, next))) => {
                let kind = HelperKind::VolumeDestroy {
                    path: path.to_path_buf(),
                    phase: next,
                    strict,
                    links: links.clone(),
                };
                if let Err(e) = self.spawn_helper(cmd, client, kind) {
                    self.volume_destroy_failed(&volume, strict, links, client, e);
                }
            }
            Err(e) => {
                if let Ok(volume) = self.volumes.find(path) {
                    self.volume_destroy_failed(&volume, strict, links, client, e);
                } else {
                    self.complete_op(client, Err(e));
                }
            }
        }
    }

    fn volume_destroy_failed(
        &self,
        volume: &Arc<Volume>,
        strict: bool,
        links: Vec<String>,
        client: Option<u64>,
        error: PortoError,
    ) {
        if strict {
            self.volumes.restore_links(volume, links);
            self.complete_op(client, Err(error));
        } else {
            tracing::warn!(volume = %volume.spec().path.display(), error = %error,
                "volume teardown failed, dropping anyway");
            Stats::bump(&self.stats.warns);
            self.volumes.forget_and_remove(volume);
            self.complete_op(client, Ok(None));
        }
    }

    fn complete_op(&self, client: Option<u64>, result: PortoResult<Option<String>>) {
        if let Err(e) = &result {
            tracing::debug!(error = %e, "deferred operation failed");
        }
        if let Some(client) = client {
            self.op_reports.lock().push(OpReport { client, result });
        }
    }

    /// Drain completed deferred operations for delivery.
    pub fn take_op_reports(&self) -> Vec<OpReport> {
        std::mem::take(&mut *self.op_reports.lock())
    }

    /// Import a layer from a tarball; completes through an [`OpReport`].
    pub fn import_layer(
        &self,
        place: &Path,
        name: &str,
        tarball: &Path,
        owner: &Cred,
        merge: bool,
        client: u64,
    ) -> PortoResult<()> {
        let store = LayerStore::new(place);
        let (cmd, staging, target) = store.begin_import(name, tarball, merge)?;
        let kind = HelperKind::LayerImport {
            staging: staging.clone(),
            target,
            owner: owner.clone(),
            merge,
        };
        if let Err(e) = self.spawn_helper(cmd, Some(client), kind) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        Ok(())
    }

    /// Export a layer as a tarball; completes through an [`OpReport`].
    pub fn export_layer(
        &self,
        place: &Path,
        name: &str,
        tarball: &Path,
        client: u64,
    ) -> PortoResult<()> {
        let cmd = LayerStore::new(place).export_cmd(name, tarball)?;
        self.spawn_helper(cmd, Some(client), HelperKind::Export)?;
        Ok(())
    }

    /// Import a storage from a tarball; completes through an
    /// [`OpReport`].
    pub fn import_storage(
        &self,
        place: &Path,
        name: &str,
        tarball: &Path,
        private: &str,
        client: u64,
    ) -> PortoResult<()> {
        let store = StorageStore::new(place);
        let (cmd, staging, target) = store.begin_import(name, tarball)?;
        let kind = HelperKind::StorageImport {
            staging: staging.clone(),
            target,
            private_path: store.private_label_path(name),
            private: private.to_string(),
        };
        if let Err(e) = self.spawn_helper(cmd, Some(client), kind) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        Ok(())
    }

    /// Export a storage as a tarball; completes through an [`OpReport`].
    pub fn export_storage(
        &self,
        place: &Path,
        name: &str,
        tarball: &Path,
        client: u64,
    ) -> PortoResult<()> {
        let cmd = StorageStore::new(place).export_cmd(name, tarball)?;
        self.spawn_helper(cmd, Some(client), HelperKind::Export)?;
        Ok(())
    }

    /// Create a volume. `Some(path)` when built inline, `None` when a
    /// helper chain is running and the response is deferred.
    pub fn create_volume(
        &self,
        path: Option<PathBuf>,
        properties: &BTreeMap<String, String>,
        creator: &Cred,
        first_link: &str,
        client: u64,
    ) -> PortoResult<Option<String>> {
        match self.volumes.create(path, properties, creator, first_link)? {
            CreateOutcome::Ready(volume) => {
                Stats::bump(&self.stats.volumes_created);
                Ok(Some(volume.spec().path.display().to_string()))
            }
            CreateOutcome::Building { volume, cmd, phase } => {
                let kind = HelperKind::VolumeBuild {
                    path: volume.spec().path.clone(),
                    phase,
                };
                if let Err(e) = self.spawn_helper(cmd, Some(client), kind) {
                    self.volumes.fail_build(&volume);
                    return Err(e);
                }
                Ok(None)
            }
        }
    }

    /// Unlink a volume. `Some(())` when done inline, `None` when a
    /// teardown chain is running and the response is deferred.
    pub fn unlink_volume(
        &self,
        volume: &Arc<Volume>,
        container: &str,
        strict: bool,
        client: u64,
    ) -> PortoResult<Option<()>> {
        match self.volumes.unlink(volume, container, strict)? {
            (UnlinkOutcome::Done, _) => Ok(Some(())),
            (UnlinkOutcome::Destroying { cmd, phase }, links) => {
                let kind = HelperKind::VolumeDestroy {
                    path: volume.spec().path.clone(),
                    phase,
                    strict,
                    links: links.clone(),
                };
                if let Err(e) = self.spawn_helper(cmd, Some(client), kind) {
                    if strict {
                        self.volumes.restore_links(volume, links);
                        return Err(e);
                    }
                    tracing::warn!(volume = %volume.spec().path.display(), error = %e,
                        "teardown helper failed to start, dropping anyway");
                    self.volumes.forget_and_remove(volume);
                    return Ok(Some(()));
                }
                Ok(None)
            }
        }
    }

    /// Drop every volume link a container holds, spawning teardown
    /// chains fire-and-forget. Used on container destruction.
    pub fn unlink_container_volumes(&self, container: &str) {
        for (volume, cmd, phase) in self.volumes.unlink_container(container) {
            let kind = HelperKind::VolumeDestroy {
                path: volume.spec().path.clone(),
                phase,
                strict: false,
                links: Vec::new(),
            };
            if let Err(e) = self.spawn_helper(cmd, None, kind) {
                tracing::warn!(volume = %volume.spec().path.display(), error = %e,
                    "teardown helper failed to start");
                self.volumes.forget_and_remove(&volume);
            }
        }
    }
}

fn helper_failed(what: &str, status: i32) -> PortoError {
    let detail = if libc::WIFEXITED(status) {
        format!("exited with {}", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        format!("killed by signal {}", libc::WTERMSIG(status))
    } else {
        format!("wait status {status}")
    };
    PortoError::unknown(format!("{what} {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use porto_common::PortoPaths;

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PortoPaths::with_roots(dir.path().join("run"), dir.path().join("place"));
        (dir, Engine::new(Config::default(), paths).unwrap())
    }

    fn wait_status(pid: i32) -> i32 {
        let mut status = 0;
        unsafe {
            libc::waitpid(pid, &mut status, 0);
        }
        status
    }

    #[test]
    fn helper_success_reports_to_the_client() {
        let (_dir, engine) = engine();
        let pid = engine
            .spawn_helper(HelperCmd::new("true", vec![]), Some(9), HelperKind::Export)
            .unwrap();

        let status = wait_status(pid);
        assert!(engine.helper_exited(pid, status));

        let reports = engine.take_op_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].client, 9);
        assert!(reports[0].result.is_ok());
    }

    #[test]
    fn helper_failure_reports_the_error() {
        let (_dir, engine) = engine();
        let pid = engine
            .spawn_helper(HelperCmd::new("false", vec![]), Some(4), HelperKind::Export)
            .unwrap();

        let status = wait_status(pid);
        assert!(engine.helper_exited(pid, status));

        let reports = engine.take_op_reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].result.is_err());
    }

    #[test]
    fn failed_import_cleans_staging() {
        let (_dir, engine) = engine();
        let place = engine.volumes.default_place().to_path_buf();
        std::fs::create_dir_all(place.join("layers")).unwrap();

        engine
            .import_layer(
                &place,
                "l",
                std::path::Path::new("/nonexistent.tar"),
                &Cred::current(),
                false,
                7,
            )
            .unwrap();

        // The registry holds exactly one pending helper.
        let pid = *engine.helpers.lock().keys().next().unwrap();
        let status = wait_status(pid);
        assert!(engine.helper_exited(pid, status));

        // tar failed on the missing tarball; the client hears about it
        // and the staging directory is gone.
        let reports = engine.take_op_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].client, 7);
        assert!(reports[0].result.is_err());
        assert!(!place.join("layers/_import_l").exists());
    }

    #[test]
    fn unknown_pids_are_not_helpers() {
        let (_dir, engine) = engine();
        assert!(!engine.helper_exited(999_999, 0));
    }
}
