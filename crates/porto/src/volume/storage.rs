//! Storage namespace.
//!
//! A storage is a named directory under `<place>/storage/<name>` that
//! volumes may use as persistent backing across container lifetimes.
//! Imports and removals follow the same staging discipline as layers.

use std::path::PathBuf;

use porto_common::paths::{
    is_reserved_name, LAYER_IMPORT_PREFIX, LAYER_PRIVATE_PREFIX, LAYER_REMOVE_PREFIX,
};
use porto_common::{Cred, PortoError, PortoPaths, PortoResult};

use super::layer::{tar_create_cmd, tar_extract_cmd};
use super::HelperCmd;

/// Storage metadata returned by ListStorage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    /// Storage name.
    pub name: String,
    /// Owner uid/gid.
    pub owner: Cred,
    /// Private label.
    pub private: String,
    /// Last use, unix seconds.
    pub last_usage: i64,
}

/// Storages of one place.
#[derive(Debug, Clone)]
pub struct StorageStore {
    place: PathBuf,
}

impl StorageStore {
    /// Store over a place.
    #[must_use]
    pub fn new(place: impl Into<PathBuf>) -> Self {
        Self {
            place: place.into(),
        }
    }

    fn storage_dir(&self) -> PathBuf {
        PortoPaths::place_storage(&self.place)
    }

    /// Directory of a named storage.
    #[must_use]
    pub fn path(&self, name: &str) -> PathBuf {
        self.storage_dir().join(name)
    }

    /// Begin a tarball import: reserve the `_import_` staging directory
    /// and hand back the tar command to run as a child process.
    ///
    /// The caller completes with [`finish_import`] when the tar child
    /// exits, or removes the staging directory on failure.
    pub fn begin_import(
        &self,
        name: &str,
        tarball: &std::path::Path,
    ) -> PortoResult<(HelperCmd, PathBuf, PathBuf)> {
        check_name(name)?;
        let target = self.path(name);
        if target.exists() {
            return Err(PortoError::VolumeAlreadyExists {
                path: target.display().to_string(),
            });
        }

        let staging = self.storage_dir().join(format!("{LAYER_IMPORT_PREFIX}{name}"));
        if staging.exists() {
            return Err(PortoError::Busy {
                message: format!("storage {name} is already being imported"),
            });
        }
        std::fs::create_dir_all(&staging)?;
        Ok((tar_extract_cmd(tarball, &staging), staging, target))
    }

    /// Path of a storage's private label file; written by the import
    /// completion.
    #[must_use]
    pub fn private_label_path(&self, name: &str) -> PathBuf {
        self.private_path(name)
    }

    /// The tar command exporting a storage as a tarball.
    pub fn export_cmd(&self, name: &str, tarball: &std::path::Path) -> PortoResult<HelperCmd> {
        check_name(name)?;
        let path = self.path(name);
        if !path.is_dir() {
            return Err(PortoError::VolumeNotFound {
                path: path.display().to_string(),
            });
        }
        Ok(tar_create_cmd(&path, tarball))
    }

    /// Remove a storage through the `_remove_` grave.
    pub fn remove(&self, name: &str) -> PortoResult<()> {
        check_name(name)?;
        let path = self.path(name);
        if !path.is_dir() {
            return Err(PortoError::VolumeNotFound {
                path: path.display().to_string(),
            });
        }
        let grave = self.storage_dir().join(format!("{LAYER_REMOVE_PREFIX}{name}"));
        std::fs::rename(&path, &grave)?;
        std::fs::remove_dir_all(&grave)?;
        let _ = std::fs::remove_file(self.private_path(name));
        tracing::info!(storage = %name, "storage removed");
        Ok(())
    }

    /// List storages, reserved names excluded.
    pub fn list(&self) -> PortoResult<Vec<StorageInfo>> {
        let mut storages = Vec::new();
        let dir = self.storage_dir();
        if !dir.is_dir() {
            return Ok(storages);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            if is_reserved_name(&name) || !entry.path().is_dir() {
                continue;
            }
            use std::os::unix::fs::MetadataExt;
            let meta = entry.metadata()?;
            storages.push(StorageInfo {
                private: std::fs::read_to_string(self.private_path(&name)).unwrap_or_default(),
                owner: Cred::new(meta.uid(), meta.gid()),
                last_usage: meta.mtime(),
                name,
            });
        }
        storages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(storages)
    }

    fn private_path(&self, name: &str) -> PathBuf {
        self.storage_dir().join(format!("{LAYER_PRIVATE_PREFIX}{name}"))
    }
}

/// Complete a staged storage import: rename into place, write the label.
pub fn finish_import(
    staging: &std::path::Path,
    target: &std::path::Path,
    private_path: &std::path::Path,
    private: &str,
) -> PortoResult<()> {
    let result = (|| {
        std::fs::rename(staging, target)?;
        if !private.is_empty() {
            std::fs::write(private_path, private)?;
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_dir_all(staging);
    }
    result
}

fn check_name(name: &str) -> PortoResult<()> {
    if name.is_empty() || name.contains('/') || is_reserved_name(name) {
        return Err(PortoError::InvalidValue {
            message: format!("invalid storage name: {name}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        assert!(check_name("data").is_ok());
        assert!(check_name("_tmp_x").is_err());
        assert!(check_name("a/b").is_err());
    }

    #[test]
    fn list_skips_reserved_entries() {
        let place = tempfile::tempdir().unwrap();
        let store = StorageStore::new(place.path());
        let dir = place.path().join("storage");
        std::fs::create_dir_all(dir.join("data")).unwrap();
        std::fs::create_dir_all(dir.join("_remove_old")).unwrap();

        let storages = store.list().unwrap();
        assert_eq!(storages.len(), 1);
        assert_eq!(storages[0].name, "data");
    }

    #[test]
    fn remove_missing_storage_fails() {
        let place = tempfile::tempdir().unwrap();
        let store = StorageStore::new(place.path());
        std::fs::create_dir_all(place.path().join("storage")).unwrap();
        assert!(matches!(
            store.remove("nope"),
            Err(PortoError::VolumeNotFound { .. })
        ));
    }
}
