//! Volume backends.
//!
//! A backend turns a validated volume description into a mounted
//! filesystem and back. Mount syscalls run inline; heavy external tools
//! (mkfs, losetup, rbd) never run on the event-loop thread: a backend
//! that needs one returns a [`HelperCmd`] plus the phase to resume from,
//! the engine spawns the tool as a child process, and the exit arrives
//! through SIGCHLD like any other child.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use porto_common::{PortoError, PortoResult};
use rustix::mount::MountFlags;

use super::quota::ProjectQuota;
use super::HelperCmd;
use crate::namespace::mount::{bind_mount, mount_tmpfs, remount_readonly, unmount};

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Bind of the storage directory.
    Plain,
    /// tmpfs sized to the space limit.
    Tmpfs,
    /// Project quota directly on the path.
    Quota,
    /// Storage directory with project quota, bound onto the path.
    Native,
    /// Overlayfs over read-only layers.
    Overlay,
    /// ext4 image attached through a loop device.
    Loop,
    /// Ceph rbd image.
    Rbd,
}

impl BackendKind {
    /// Whether the backend enforces space/inode quota.
    #[must_use]
    pub fn supports_quota(&self) -> bool {
        matches!(
            self,
            Self::Quota | Self::Native | Self::Overlay | Self::Loop | Self::Rbd | Self::Tmpfs
        )
    }

    /// Whether layers may be stacked or merged in.
    #[must_use]
    pub fn supports_layers(&self) -> bool {
        matches!(self, Self::Overlay | Self::Native | Self::Loop)
    }

    /// Whether build or teardown involves external helper tools.
    #[must_use]
    pub fn needs_helpers(&self) -> bool {
        matches!(self, Self::Loop | Self::Rbd)
    }

    /// Default backend choice for a volume description.
    #[must_use]
    pub fn choose(has_layers: bool, wants_quota: bool, quota_supported: bool) -> Self {
        if has_layers {
            Self::Overlay
        } else if wants_quota && !quota_supported {
            Self::Loop
        } else if quota_supported {
            Self::Native
        } else {
            Self::Plain
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Plain => "plain",
            Self::Tmpfs => "tmpfs",
            Self::Quota => "quota",
            Self::Native => "native",
            Self::Overlay => "overlay",
            Self::Loop => "loop",
            Self::Rbd => "rbd",
        };
        f.write_str(s)
    }
}

impl FromStr for BackendKind {
    type Err = PortoError;

    fn from_str(s: &str) -> PortoResult<Self> {
        match s {
            "plain" => Ok(Self::Plain),
            "tmpfs" => Ok(Self::Tmpfs),
            "quota" => Ok(Self::Quota),
            "native" => Ok(Self::Native),
            "overlay" => Ok(Self::Overlay),
            "loop" => Ok(Self::Loop),
            "rbd" => Ok(Self::Rbd),
            other => Err(PortoError::InvalidValue {
                message: format!("unknown volume backend: {other}"),
            }),
        }
    }
}

/// What a backend needs to build or destroy one volume.
#[derive(Debug)]
pub struct BuildContext<'a> {
    /// Volume id, doubles as the quota project id.
    pub id: u32,
    /// Mount point.
    pub path: &'a Path,
    /// Backing directory, or image file for loop, or pool/image for rbd.
    pub storage: &'a Path,
    /// Resolved read-only layer paths, top first.
    pub layers: &'a [PathBuf],
    /// Space limit in bytes, 0 unlimited.
    pub space_limit: u64,
    /// Inode limit, 0 unlimited.
    pub inode_limit: u64,
    /// Mount read-only.
    pub read_only: bool,
}

/// Progress of a build.
#[derive(Debug)]
pub enum BuildOutcome {
    /// The volume is mounted; the caller may finish the build.
    Ready,
    /// A helper must run first; resume from the phase when it exits.
    Pending(HelperCmd, BuildPhase),
}

/// Where a pending build resumes after its helper exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    /// mkfs over a fresh image; losetup comes next.
    Mkfs,
    /// losetup --find --show; its output is the device to mount.
    Attach,
    /// rbd map; its output is the device to mount.
    Map,
}

/// Progress of a teardown.
#[derive(Debug)]
pub enum DestroyOutcome {
    /// Kernel state is released; the caller may finish the destroy.
    Done,
    /// A helper must run first; resume from the phase when it exits.
    Pending(HelperCmd, DestroyPhase),
}

/// Where a pending teardown resumes after its helper exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyPhase {
    /// losetup -j listing the devices attached to the image.
    DetachQuery,
    /// losetup -d of one device; the rest follow one by one.
    Detach {
        /// Devices still to detach.
        remaining: Vec<String>,
    },
    /// rbd unmap.
    Unmap,
}

impl BackendKind {
    /// Start building the volume. Mount syscalls happen inline; loop and
    /// rbd hand back the first helper of their chain.
    pub fn build(&self, ctx: &BuildContext<'_>) -> PortoResult<BuildOutcome> {
        tracing::debug!(backend = %self, path = %ctx.path.display(), "building volume");
        match self {
            Self::Plain => {
                bind_mount(ctx.storage, ctx.path, ctx.read_only)?;
                Ok(BuildOutcome::Ready)
            }
            Self::Tmpfs => {
                if ctx.space_limit == 0 {
                    return Err(PortoError::InvalidValue {
                        message: "tmpfs backend requires space_limit".to_string(),
                    });
                }
                let mut options = format!("size={}", ctx.space_limit);
                if ctx.inode_limit > 0 {
                    options.push_str(&format!(",nr_inodes={}", ctx.inode_limit));
                }
                mount_tmpfs(ctx.path, &options)?;
                if ctx.read_only {
                    remount_readonly(ctx.path)?;
                }
                Ok(BuildOutcome::Ready)
            }
            Self::Quota => {
                ProjectQuota::new(ctx.path, ctx.id).create(ctx.space_limit, ctx.inode_limit)?;
                Ok(BuildOutcome::Ready)
            }
            Self::Native => {
                if ctx.space_limit > 0 || ctx.inode_limit > 0 {
                    ProjectQuota::new(ctx.storage, ctx.id)
                        .create(ctx.space_limit, ctx.inode_limit)?;
                }
                bind_mount(ctx.storage, ctx.path, ctx.read_only)?;
                Ok(BuildOutcome::Ready)
            }
            Self::Overlay => {
                if ctx.space_limit > 0 || ctx.inode_limit > 0 {
                    ProjectQuota::new(ctx.storage, ctx.id)
                        .create(ctx.space_limit, ctx.inode_limit)?;
                }
                mount_overlay(ctx)?;
                Ok(BuildOutcome::Ready)
            }
            Self::Loop => begin_loop_build(ctx),
            Self::Rbd => Ok(BuildOutcome::Pending(
                HelperCmd::with_capture("rbd", vec!["map".into(), ctx.storage.display().to_string()]),
                BuildPhase::Map,
            )),
        }
    }

    /// Start tearing the volume down, leaving the layers intact.
    pub fn destroy(&self, ctx: &BuildContext<'_>) -> PortoResult<DestroyOutcome> {
        tracing::debug!(backend = %self, path = %ctx.path.display(), "destroying volume");
        match self {
            Self::Plain | Self::Tmpfs => {
                unmount(ctx.path)?;
                Ok(DestroyOutcome::Done)
            }
            Self::Quota => {
                ProjectQuota::new(ctx.path, ctx.id).destroy()?;
                Ok(DestroyOutcome::Done)
            }
            Self::Native => {
                unmount(ctx.path)?;
                if ctx.space_limit > 0 || ctx.inode_limit > 0 {
                    ProjectQuota::new(ctx.storage, ctx.id).destroy()?;
                }
                Ok(DestroyOutcome::Done)
            }
            Self::Overlay => {
                unmount(ctx.path)?;
                if ctx.space_limit > 0 || ctx.inode_limit > 0 {
                    ProjectQuota::new(ctx.storage, ctx.id).destroy()?;
                }
                // Only upper and work are ours to delete.
                let _ = std::fs::remove_dir_all(ctx.storage.join("upper"));
                let _ = std::fs::remove_dir_all(ctx.storage.join("work"));
                Ok(DestroyOutcome::Done)
            }
            Self::Loop => {
                unmount(ctx.path)?;
                Ok(DestroyOutcome::Pending(
                    HelperCmd::with_capture(
                        "losetup",
                        vec![
                            "-j".into(),
                            ctx.storage.display().to_string(),
                            "-O".into(),
                            "NAME".into(),
                            "-n".into(),
                        ],
                    ),
                    DestroyPhase::DetachQuery,
                ))
            }
            Self::Rbd => {
                unmount(ctx.path)?;
                Ok(DestroyOutcome::Pending(
                    HelperCmd::new("rbd", vec!["unmap".into(), ctx.storage.display().to_string()]),
                    DestroyPhase::Unmap,
                ))
            }
        }
    }
}

/// Continue a build after its helper exited; `output` is the helper's
/// captured stdout.
pub fn resume_build(
    ctx: &BuildContext<'_>,
    phase: BuildPhase,
    output: &str,
) -> PortoResult<BuildOutcome> {
    match phase {
        BuildPhase::Mkfs => Ok(BuildOutcome::Pending(
            HelperCmd::with_capture(
                "losetup",
                vec![
                    "--find".into(),
                    "--show".into(),
                    ctx.storage.display().to_string(),
                ],
            ),
            BuildPhase::Attach,
        )),
        BuildPhase::Attach | BuildPhase::Map => {
            let device = output.trim();
            if device.is_empty() {
                return Err(PortoError::unknown(format!(
                    "no device reported for {}",
                    ctx.storage.display()
                )));
            }
            mount_device(device, ctx)?;
            Ok(BuildOutcome::Ready)
        }
    }
}

/// Continue a teardown after its helper exited.
pub fn resume_destroy(
    ctx: &BuildContext<'_>,
    phase: DestroyPhase,
    output: &str,
) -> PortoResult<DestroyOutcome> {
    match phase {
        DestroyPhase::DetachQuery => {
            let mut devices: Vec<String> = output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(ToString::to_string)
                .collect();
            match devices.pop() {
                None => Ok(DestroyOutcome::Done),
                Some(first) => Ok(DestroyOutcome::Pending(
                    HelperCmd::new("losetup", vec!["-d".into(), first]),
                    DestroyPhase::Detach { remaining: devices },
                )),
            }
        }
        DestroyPhase::Detach { mut remaining } => match remaining.pop() {
            None => Ok(DestroyOutcome::Done),
            Some(next) => Ok(DestroyOutcome::Pending(
                HelperCmd::new("losetup", vec!["-d".into(), next]),
                DestroyPhase::Detach { remaining },
            )),
        },
        DestroyPhase::Unmap => {
            let _ = ctx;
            Ok(DestroyOutcome::Done)
        }
    }
}

fn begin_loop_build(ctx: &BuildContext<'_>) -> PortoResult<BuildOutcome> {
    if ctx.space_limit == 0 {
        return Err(PortoError::InvalidValue {
            message: "loop backend requires space_limit".to_string(),
        });
    }

    if ctx.storage.exists() {
        // An existing image skips mkfs and goes straight to attach.
        return Ok(BuildOutcome::Pending(
            HelperCmd::with_capture(
                "losetup",
                vec![
                    "--find".into(),
                    "--show".into(),
                    ctx.storage.display().to_string(),
                ],
            ),
            BuildPhase::Attach,
        ));
    }

    let file = std::fs::File::create(ctx.storage)?;
    file.set_len(ctx.space_limit)?;
    Ok(BuildOutcome::Pending(
        HelperCmd::new(
            "mkfs.ext4",
            vec!["-q".into(), "-F".into(), ctx.storage.display().to_string()],
        ),
        BuildPhase::Mkfs,
    ))
}

fn mount_device(device: &str, ctx: &BuildContext<'_>) -> PortoResult<()> {
    let mut flags = MountFlags::empty();
    if ctx.read_only {
        flags |= MountFlags::RDONLY;
    }
    rustix::mount::mount(device, ctx.path, "ext4", flags, "").map_err(|e| PortoError::Unknown {
        message: format!("mount of {device} on {} failed: {e}", ctx.path.display()),
        errno: e.raw_os_error(),
    })
}

/// Mount overlayfs with the context's layers as lowerdirs and upper/work
/// inside the storage directory.
fn mount_overlay(ctx: &BuildContext<'_>) -> PortoResult<()> {
    let upper = ctx.storage.join("upper");
    let work = ctx.storage.join("work");
    std::fs::create_dir_all(&upper)?;
    std::fs::create_dir_all(&work)?;

    let lower = ctx
        .layers
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    let options = format!(
        "lowerdir={lower},upperdir={},workdir={}",
        upper.display(),
        work.display()
    );

    let mut flags = MountFlags::empty();
    if ctx.read_only {
        flags |= MountFlags::RDONLY;
    }

    rustix::mount::mount("overlay", ctx.path, "overlay", flags, options.as_str()).map_err(|e| {
        PortoError::Unknown {
            message: format!("overlay mount on {} failed: {e}", ctx.path.display()),
            errno: e.raw_os_error(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_roundtrip() {
        for kind in [
            BackendKind::Plain,
            BackendKind::Tmpfs,
            BackendKind::Quota,
            BackendKind::Native,
            BackendKind::Overlay,
            BackendKind::Loop,
            BackendKind::Rbd,
        ] {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("zfs".parse::<BackendKind>().is_err());
    }

    #[test]
    fn backend_choice_rules() {
        // Layers present: overlay.
        assert_eq!(BackendKind::choose(true, false, true), BackendKind::Overlay);
        // Quota wanted but unsupported: loop image.
        assert_eq!(BackendKind::choose(false, true, false), BackendKind::Loop);
        // Quota supported: native.
        assert_eq!(BackendKind::choose(false, false, true), BackendKind::Native);
        // Nothing available: plain bind.
        assert_eq!(BackendKind::choose(false, false, false), BackendKind::Plain);
    }

    #[test]
    fn capability_table_matches_spec() {
        assert!(!BackendKind::Plain.supports_quota());
        assert!(!BackendKind::Plain.supports_layers());
        assert!(BackendKind::Overlay.supports_layers());
        assert!(BackendKind::Native.supports_layers());
        assert!(!BackendKind::Rbd.supports_layers());
        assert!(BackendKind::Tmpfs.supports_quota());
        assert!(BackendKind::Loop.needs_helpers());
        assert!(!BackendKind::Native.needs_helpers());
    }

    fn ctx<'a>(storage: &'a Path, path: &'a Path) -> BuildContext<'a> {
        BuildContext {
            id: 1,
            path,
            storage,
            layers: &[],
            space_limit: 1 << 20,
            inode_limit: 0,
            read_only: false,
        }
    }

    #[test]
    fn loop_build_chains_mkfs_then_attach() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("loop.img");
        let mount = dir.path().join("volume");
        let ctx = ctx(&image, &mount);

        // Fresh image: mkfs first.
        let outcome = BackendKind::Loop.build(&ctx).unwrap();
        let BuildOutcome::Pending(cmd, phase) = outcome else {
            panic!("expected a pending build");
        };
        assert_eq!(cmd.tool, "mkfs.ext4");
        assert_eq!(phase, BuildPhase::Mkfs);
        assert!(image.exists());

        // mkfs done: losetup with captured output follows.
        let outcome = resume_build(&ctx, BuildPhase::Mkfs, "").unwrap();
        let BuildOutcome::Pending(cmd, phase) = outcome else {
            panic!("expected a pending build");
        };
        assert_eq!(cmd.tool, "losetup");
        assert!(cmd.capture);
        assert_eq!(phase, BuildPhase::Attach);

        // An attach that reported no device is an error.
        assert!(resume_build(&ctx, BuildPhase::Attach, "\n").is_err());
    }

    #[test]
    fn loop_destroy_detaches_each_device() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("loop.img");
        let mount = dir.path().join("volume");
        let ctx = ctx(&image, &mount);

        let outcome = resume_destroy(&ctx, DestroyPhase::DetachQuery, "/dev/loop3\n/dev/loop7\n")
            .unwrap();
        let DestroyOutcome::Pending(cmd, DestroyPhase::Detach { remaining }) = outcome else {
            panic!("expected a pending detach");
        };
        assert_eq!(cmd.args, vec!["-d", "/dev/loop7"]);
        assert_eq!(remaining, vec!["/dev/loop3"]);

        let outcome = resume_destroy(&ctx, DestroyPhase::Detach { remaining }, "").unwrap();
        let DestroyOutcome::Pending(cmd, DestroyPhase::Detach { remaining }) = outcome else {
            panic!("expected a pending detach");
        };
        assert_eq!(cmd.args, vec!["-d", "/dev/loop3"]);
        assert!(remaining.is_empty());

        let outcome = resume_destroy(&ctx, DestroyPhase::Detach { remaining }, "").unwrap();
        assert!(matches!(outcome, DestroyOutcome::Done));

        // No devices attached at all: done immediately.
        let outcome = resume_destroy(&ctx, DestroyPhase::DetachQuery, "").unwrap();
        assert!(matches!(outcome, DestroyOutcome::Done));
    }
}
