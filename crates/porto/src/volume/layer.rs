#![allow(unsafe_code)]
//! Layer storage.
//!
//! Layers are read-only directories under `<place>/layers/<name>`, used
//! as overlay lowerdirs or copy-merged into non-overlay volumes. Imports
//! stage into `_import_<name>` and rename into place; removals rename
//! into `_remove_<name>` first so a crash never leaves a half-deleted
//! layer under its public name. aufs whiteouts are rewritten to overlayfs
//! form on import.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use porto_common::paths::{
    is_reserved_name, LAYER_IMPORT_PREFIX, LAYER_PRIVATE_PREFIX, LAYER_REMOVE_PREFIX,
    LAYER_TMP_PREFIX,
};
use porto_common::{Cred, PortoError, PortoPaths, PortoResult};

const OPAQUE_MARKER: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";
const METADATA_PREFIX: &str = ".wh..wh.";

/// Layer metadata returned by ListLayers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    /// Layer name.
    pub name: String,
    /// Owner uid/gid.
    pub owner: Cred,
    /// Private label.
    pub private: String,
    /// Last use, unix seconds.
    pub last_usage: i64,
}

/// Layers of one place.
#[derive(Debug, Clone)]
pub struct LayerStore {
    place: PathBuf,
}

impl LayerStore {
    /// Store over a place; `<place>/layers` must already be prepared.
    #[must_use]
    pub fn new(place: impl Into<PathBuf>) -> Self {
        Self {
            place: place.into(),
        }
    }

    fn layers_dir(&self) -> PathBuf {
        PortoPaths::place_layers(&self.place)
    }

    /// Directory of a named layer.
    #[must_use]
    pub fn layer_path(&self, name: &str) -> PathBuf {
        PortoPaths::layer_dir(&self.place, name)
    }

    /// Resolve a layer reference: absolute paths pass through, names
    /// resolve under the place and must exist.
    pub fn resolve(&self, reference: &str) -> PortoResult<PathBuf> {
        let path = if reference.starts_with('/') {
            PathBuf::from(reference)
        } else {
            self.check_name(reference)?;
            self.layer_path(reference)
        };
        if !path.is_dir() {
            return Err(PortoError::LayerNotFound {
                name: reference.to_string(),
            });
        }
        Ok(path)
    }

    /// Import a directory tree as a named layer.
    ///
    /// The content is staged under `_import_<name>`, sanitized, and
    /// renamed into place only when complete.
    pub fn import(&self, name: &str, content: &Path, owner: &Cred, merge: bool) -> PortoResult<()> {
        self.check_name(name)?;
        let target = self.layer_path(name);
        if target.exists() && !merge {
            return Err(PortoError::LayerAlreadyExists {
                name: name.to_string(),
            });
        }

        let staging = self.layers_dir().join(format!("{LAYER_IMPORT_PREFIX}{name}"));
        if staging.exists() {
            return Err(PortoError::Busy {
                message: format!("layer {name} is already being imported"),
            });
        }

        let result = (|| {
            copy_tree(content, &staging)?;
            sanitize_whiteouts(&staging, false)?;
            if merge && target.exists() {
                merge_tree(&staging, &target)?;
                std::fs::remove_dir_all(&staging)?;
            } else {
                std::fs::rename(&staging, &target)?;
            }
            chown(&target, owner)
        })();

        if result.is_err() {
            let _ = std::fs::remove_dir_all(&staging);
        }
        tracing::info!(layer = %name, merge, "layer imported");
        result
    }

    /// Export a layer's contents into a directory.
    pub fn export(&self, name: &str, destination: &Path) -> PortoResult<()> {
        let source = self.resolve(name)?;
        copy_tree(&source, destination)
    }

    /// Begin a tarball import: reserve the `_import_` staging directory
    /// and hand back the tar command to run as a child process.
    ///
    /// The caller completes the import with [`finish_import`] when the
    /// tar child exits, or removes the staging directory on failure.
    pub fn begin_import(
        &self,
        name: &str,
        tarball: &Path,
        merge: bool,
    ) -> PortoResult<(super::HelperCmd, PathBuf, PathBuf)> {
        self.check_name(name)?;
        let target = self.layer_path(name);
        if target.exists() && !merge {
            return Err(PortoError::LayerAlreadyExists {
                name: name.to_string(),
            });
        }

        let staging = self.layers_dir().join(format!("{LAYER_IMPORT_PREFIX}{name}"));
        if staging.exists() {
            return Err(PortoError::Busy {
                message: format!("layer {name} is already being imported"),
            });
        }
        std::fs::create_dir_all(&staging)?;
        Ok((tar_extract_cmd(tarball, &staging), staging, target))
    }

    /// The tar command exporting a layer as a tarball.
    pub fn export_cmd(&self, name: &str, tarball: &Path) -> PortoResult<super::HelperCmd> {
        let source = self.resolve(name)?;
        Ok(tar_create_cmd(&source, tarball))
    }

    /// Remove a layer; fails while volumes reference it.
    pub fn remove(&self, name: &str, in_use: bool) -> PortoResult<()> {
        self.check_name(name)?;
        let path = self.layer_path(name);
        if !path.is_dir() {
            return Err(PortoError::LayerNotFound {
                name: name.to_string(),
            });
        }
        if in_use {
            return Err(PortoError::Busy {
                message: format!("layer {name} is referenced by a volume"),
            });
        }

        let grave = self.layers_dir().join(format!("{LAYER_REMOVE_PREFIX}{name}"));
        std::fs::rename(&path, &grave)?;
        std::fs::remove_dir_all(&grave)?;
        let _ = std::fs::remove_file(self.private_path(name));
        tracing::info!(layer = %name, "layer removed");
        Ok(())
    }

    /// List layers, reserved names excluded.
    pub fn list(&self) -> PortoResult<Vec<LayerInfo>> {
        let mut layers = Vec::new();
        let dir = self.layers_dir();
        if !dir.is_dir() {
            return Ok(layers);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            if is_reserved_name(&name) || !entry.path().is_dir() {
                continue;
            }
            let meta = entry.metadata()?;
            use std::os::unix::fs::MetadataExt;
            layers.push(LayerInfo {
                private: self.get_private(&name).unwrap_or_default(),
                owner: Cred::new(meta.uid(), meta.gid()),
                last_usage: meta.mtime(),
                name,
            });
        }
        layers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(layers)
    }

    /// Read a layer's private label.
    pub fn get_private(&self, name: &str) -> PortoResult<String> {
        self.check_name(name)?;
        if !self.layer_path(name).is_dir() {
            return Err(PortoError::LayerNotFound {
                name: name.to_string(),
            });
        }
        match std::fs::read_to_string(self.private_path(name)) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a layer's private label.
    pub fn set_private(&self, name: &str, value: &str) -> PortoResult<()> {
        self.check_name(name)?;
        if !self.layer_path(name).is_dir() {
            return Err(PortoError::LayerNotFound {
                name: name.to_string(),
            });
        }
        if value.len() > 4096 {
            return Err(PortoError::InvalidValue {
                message: "private label longer than 4096 bytes".to_string(),
            });
        }
        std::fs::write(self.private_path(name), value)?;
        Ok(())
    }

    /// Drop staging leftovers; runs at restore before volumes load.
    pub fn cleanup(&self) -> PortoResult<()> {
        let dir = self.layers_dir();
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            let stale = name.starts_with(LAYER_TMP_PREFIX)
                || name.starts_with(LAYER_IMPORT_PREFIX)
                || name.starts_with(LAYER_REMOVE_PREFIX);
            if stale {
                tracing::debug!(entry = %name, "clearing stale layer staging");
                if entry.path().is_dir() {
                    let _ = std::fs::remove_dir_all(entry.path());
                } else {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    fn private_path(&self, name: &str) -> PathBuf {
        self.layers_dir().join(format!("{LAYER_PRIVATE_PREFIX}{name}"))
    }

    fn check_name(&self, name: &str) -> PortoResult<()> {
        if name.is_empty() || name.contains('/') {
            return Err(PortoError::InvalidValue {
                message: format!("invalid layer name: {name}"),
            });
        }
        if is_reserved_name(name) {
            return Err(PortoError::InvalidValue {
                message: format!("reserved layer name: {name}"),
            });
        }
        Ok(())
    }
}

/// Rewrite aufs whiteouts into overlayfs form, recursively.
///
/// - `.wh..wh..opq` becomes `trusted.overlay.opaque=y` on the directory;
/// - other `.wh..wh.*` metadata entries are deleted;
/// - `.wh.NAME` deletes `NAME` and, outside merge mode, leaves a 0:0
///   character-device whiteout in its place.
pub fn sanitize_whiteouts(dir: &Path, merge: bool) -> PortoResult<()> {
    let mut queue = vec![dir.to_path_buf()];

    while let Some(dir) = queue.pop() {
        let entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        for entry in entries {
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };

            if name == OPAQUE_MARKER {
                set_opaque(&dir)?;
                std::fs::remove_file(&path)?;
            } else if name.starts_with(METADATA_PREFIX) {
                std::fs::remove_file(&path)?;
            } else if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                let victim = dir.join(target);
                if victim.is_dir() {
                    std::fs::remove_dir_all(&victim)?;
                } else if victim.exists() {
                    std::fs::remove_file(&victim)?;
                }
                std::fs::remove_file(&path)?;
                if !merge {
                    make_whiteout(&victim)?;
                }
            } else if path.is_dir() && !path.is_symlink() {
                queue.push(path);
            }
        }
    }
    Ok(())
}

fn set_opaque(dir: &Path) -> PortoResult<()> {
    use std::os::unix::ffi::OsStrExt;
    let path = CString::new(dir.as_os_str().as_bytes()).map_err(|_| PortoError::InvalidValue {
        message: "path contains NUL".to_string(),
    })?;
    let name = CString::new("trusted.overlay.opaque").expect("static string");
    let rc = unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            b"y".as_ptr().cast(),
            1,
            0,
        )
    };
    if rc != 0 {
        return Err(PortoError::from_errno(format!(
            "setting opaque xattr on {}",
            dir.display()
        )));
    }
    Ok(())
}

/// An overlayfs whiteout is a 0:0 character device.
fn make_whiteout(path: &Path) -> PortoResult<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| PortoError::InvalidValue {
        message: "path contains NUL".to_string(),
    })?;
    let rc = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR | 0o000, libc::makedev(0, 0)) };
    if rc != 0 {
        return Err(PortoError::from_errno(format!(
            "creating whiteout at {}",
            path.display()
        )));
    }
    Ok(())
}

/// Copy a directory tree preserving modes; metadata-only and fast enough
/// for layer staging.
pub fn copy_tree(from: &Path, to: &Path) -> PortoResult<()> {
    std::fs::create_dir_all(to)?;
    let mut queue = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((src, dst)) = queue.pop() {
        for entry in std::fs::read_dir(&src)? {
            let entry = entry?;
            let src_path = entry.path();
            let dst_path = dst.join(entry.file_name());
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                std::fs::create_dir_all(&dst_path)?;
                let meta = entry.metadata()?;
                std::fs::set_permissions(&dst_path, meta.permissions())?;
                queue.push((src_path, dst_path));
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(&src_path)?;
                std::os::unix::fs::symlink(target, &dst_path)?;
            } else {
                std::fs::copy(&src_path, &dst_path)?;
            }
        }
    }
    Ok(())
}

/// Copy `upper` over `lower` in place, honouring whiteout markers that
/// survived sanitization as 0:0 device nodes.
pub fn merge_tree(upper: &Path, lower: &Path) -> PortoResult<()> {
    use std::os::unix::fs::FileTypeExt;

    let mut queue = vec![(upper.to_path_buf(), lower.to_path_buf())];
    while let Some((src, dst)) = queue.pop() {
        std::fs::create_dir_all(&dst)?;
        for entry in std::fs::read_dir(&src)? {
            let entry = entry?;
            let src_path = entry.path();
            let dst_path = dst.join(entry.file_name());
            let file_type = entry.file_type()?;

            if file_type.is_char_device() {
                // Whiteout: removal of the lower entry.
                if dst_path.is_dir() {
                    std::fs::remove_dir_all(&dst_path)?;
                } else if dst_path.exists() {
                    std::fs::remove_file(&dst_path)?;
                }
            } else if file_type.is_dir() {
                queue.push((src_path, dst_path));
            } else {
                if dst_path.exists() {
                    std::fs::remove_file(&dst_path)?;
                }
                if file_type.is_symlink() {
                    let target = std::fs::read_link(&src_path)?;
                    std::os::unix::fs::symlink(target, &dst_path)?;
                } else {
                    std::fs::copy(&src_path, &dst_path)?;
                }
            }
        }
    }
    Ok(())
}

/// The tar command unpacking a tarball into a directory.
#[must_use]
pub fn tar_extract_cmd(tarball: &Path, dir: &Path) -> super::HelperCmd {
    super::HelperCmd::new(
        "tar",
        vec![
            "--numeric-owner".into(),
            "-xf".into(),
            tarball.display().to_string(),
            "-C".into(),
            dir.display().to_string(),
        ],
    )
}

/// The tar command packing a directory into a tarball.
#[must_use]
pub fn tar_create_cmd(dir: &Path, tarball: &Path) -> super::HelperCmd {
    super::HelperCmd::new(
        "tar",
        vec![
            "--numeric-owner".into(),
            "-czf".into(),
            tarball.display().to_string(),
            "-C".into(),
            dir.display().to_string(),
            ".".into(),
        ],
    )
}

/// Complete a staged import after the tar child exited successfully:
/// rewrite whiteouts, merge or rename into place, hand ownership over.
pub fn finish_import(staging: &Path, target: &Path, owner: &Cred, merge: bool) -> PortoResult<()> {
    let result = (|| {
        sanitize_whiteouts(staging, false)?;
        if merge && target.exists() {
            merge_tree(staging, target)?;
            std::fs::remove_dir_all(staging)?;
        } else {
            std::fs::rename(staging, target)?;
        }
        chown(target, owner)
    })();

    if result.is_err() {
        let _ = std::fs::remove_dir_all(staging);
    }
    result
}

fn chown(path: &Path, cred: &Cred) -> PortoResult<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| PortoError::InvalidValue {
        message: "path contains NUL".to_string(),
    })?;
    let rc = unsafe { libc::chown(c_path.as_ptr(), cred.uid, cred.gid) };
    if rc != 0 {
        return Err(PortoError::from_errno(format!(
            "chown {} to {cred}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LayerStore) {
        let place = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(place.path().join("layers")).unwrap();
        let store = LayerStore::new(place.path());
        (place, store)
    }

    #[test]
    fn reserved_and_bad_names_are_rejected() {
        let (_place, store) = store();
        assert!(store.check_name("_tmp_x").is_err());
        assert!(store.check_name("a/b").is_err());
        assert!(store.check_name("").is_err());
        assert!(store.check_name("ubuntu").is_ok());
    }

    #[test]
    fn import_list_remove_cycle() {
        let (_place, store) = store();
        let content = tempfile::tempdir().unwrap();
        std::fs::write(content.path().join("file"), b"data").unwrap();

        store
            .import("base", content.path(), &Cred::current(), false)
            .unwrap();
        assert!(store.layer_path("base").join("file").exists());

        let layers = store.list().unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].name, "base");

        assert!(matches!(
            store.import("base", content.path(), &Cred::current(), false),
            Err(PortoError::LayerAlreadyExists { .. })
        ));

        assert!(matches!(
            store.remove("base", true),
            Err(PortoError::Busy { .. })
        ));
        store.remove("base", false).unwrap();
        assert!(!store.layer_path("base").exists());
    }

    #[test]
    fn private_labels_persist() {
        let (_place, store) = store();
        let content = tempfile::tempdir().unwrap();
        store
            .import("l", content.path(), &Cred::current(), false)
            .unwrap();

        assert_eq!(store.get_private("l").unwrap(), "");
        store.set_private("l", "team=search").unwrap();
        assert_eq!(store.get_private("l").unwrap(), "team=search");
        assert!(store.get_private("missing").is_err());
    }

    #[test]
    fn whiteout_metadata_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/.wh..wh.aufs"), b"").unwrap();
        std::fs::write(dir.path().join("sub/keep"), b"k").unwrap();

        sanitize_whiteouts(dir.path(), true).unwrap();
        assert!(!dir.path().join("sub/.wh..wh.aufs").exists());
        assert!(dir.path().join("sub/keep").exists());
    }

    #[test]
    fn whiteout_removes_target_in_merge_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("victim"), b"x").unwrap();
        std::fs::write(dir.path().join(".wh.victim"), b"").unwrap();

        sanitize_whiteouts(dir.path(), true).unwrap();
        assert!(!dir.path().join("victim").exists());
        assert!(!dir.path().join(".wh.victim").exists());
    }

    #[test]
    fn staged_import_lifecycle() {
        let (_place, store) = store();
        let tarball = std::path::Path::new("/tmp/l.tar");

        let (cmd, staging, target) = store.begin_import("l", tarball, false).unwrap();
        assert_eq!(cmd.tool, "tar");
        assert!(cmd.args.iter().any(|a| a == "-xf"));
        assert!(staging.is_dir());

        // A second import of the same name is busy while staged.
        assert!(matches!(
            store.begin_import("l", tarball, false),
            Err(PortoError::Busy { .. })
        ));

        // Pretend tar populated the staging dir, then complete.
        std::fs::write(staging.join("file"), b"x").unwrap();
        finish_import(&staging, &target, &Cred::current(), false).unwrap();
        assert!(target.join("file").exists());
        assert!(!staging.exists());
    }

    #[test]
    fn export_cmd_requires_the_layer() {
        let (_place, store) = store();
        assert!(matches!(
            store.export_cmd("missing", std::path::Path::new("/tmp/out.tar")),
            Err(PortoError::LayerNotFound { .. })
        ));
    }

    #[test]
    fn cleanup_clears_staging() {
        let (place, store) = store();
        let layers = place.path().join("layers");
        std::fs::create_dir(layers.join("_tmp_1")).unwrap();
        std::fs::create_dir(layers.join("_import_x")).unwrap();
        std::fs::create_dir(layers.join("real")).unwrap();

        store.cleanup().unwrap();
        assert!(!layers.join("_tmp_1").exists());
        assert!(!layers.join("_import_x").exists());
        assert!(layers.join("real").exists());
    }

    #[test]
    fn copy_and_merge_trees() {
        let lower = tempfile::tempdir().unwrap();
        std::fs::write(lower.path().join("a"), b"old").unwrap();
        std::fs::write(lower.path().join("b"), b"keep").unwrap();

        let upper = tempfile::tempdir().unwrap();
        std::fs::write(upper.path().join("a"), b"new").unwrap();

        merge_tree(upper.path(), lower.path()).unwrap();
        assert_eq!(std::fs::read(lower.path().join("a")).unwrap(), b"new");
        assert_eq!(std::fs::read(lower.path().join("b")).unwrap(), b"keep");
    }
}
