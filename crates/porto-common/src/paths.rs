//! Standard filesystem paths for Porto.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default runtime directory.
pub static PORTO_RUN_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PORTO_RUN_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/porto"))
});

/// Default place for volumes and layers.
pub static PORTO_PLACE: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PORTO_PLACE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/place"))
});

/// Reserved layer-name prefixes used for staging and removal.
pub const LAYER_TMP_PREFIX: &str = "_tmp_";
/// Staging prefix for layers being imported.
pub const LAYER_IMPORT_PREFIX: &str = "_import_";
/// Rename target for layers being removed asynchronously.
pub const LAYER_REMOVE_PREFIX: &str = "_remove_";
/// Prefix of the files holding layer private labels.
pub const LAYER_PRIVATE_PREFIX: &str = "_private_";

/// Standard paths used by the Porto supervisor.
#[derive(Debug, Clone)]
pub struct PortoPaths {
    /// Runtime directory (default: /run/porto).
    pub runtime: PathBuf,
    /// Default place for volumes and layers (default: /place).
    pub place: PathBuf,
}

impl PortoPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths rooted at a custom runtime directory and place.
    #[must_use]
    pub fn with_roots(runtime: impl Into<PathBuf>, place: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            place: place.into(),
        }
    }

    /// API socket path.
    #[must_use]
    pub fn socket(&self) -> PathBuf {
        self.runtime.join("portod.socket")
    }

    /// Master process pid file.
    #[must_use]
    pub fn master_pid(&self) -> PathBuf {
        self.runtime.join("portod.pid")
    }

    /// Slave process pid file.
    #[must_use]
    pub fn slave_pid(&self) -> PathBuf {
        self.runtime.join("portod-slave.pid")
    }

    /// Key-value directory for container records.
    #[must_use]
    pub fn container_kvs(&self) -> PathBuf {
        self.runtime.join("kvs")
    }

    /// Key-value directory for volume records.
    #[must_use]
    pub fn volume_kvs(&self) -> PathBuf {
        self.runtime.join("pkvs")
    }

    /// Master log file.
    #[must_use]
    pub fn master_log(&self) -> PathBuf {
        PathBuf::from("/var/log/portod-master.log")
    }

    /// Slave log file.
    #[must_use]
    pub fn slave_log(&self) -> PathBuf {
        PathBuf::from("/var/log/portod.log")
    }

    /// Volumes subtree of a place.
    #[must_use]
    pub fn place_volumes(place: &std::path::Path) -> PathBuf {
        place.join("volumes")
    }

    /// Layers subtree of a place.
    #[must_use]
    pub fn place_layers(place: &std::path::Path) -> PathBuf {
        place.join("layers")
    }

    /// Storage subtree of a place.
    #[must_use]
    pub fn place_storage(place: &std::path::Path) -> PathBuf {
        place.join("storage")
    }

    /// Internal directory for a volume id under a place.
    #[must_use]
    pub fn volume_dir(place: &std::path::Path, id: u32) -> PathBuf {
        Self::place_volumes(place).join(id.to_string())
    }

    /// Auto-generated mount point for a volume id under a place.
    #[must_use]
    pub fn volume_mountpoint(place: &std::path::Path, id: u32) -> PathBuf {
        Self::volume_dir(place, id).join("volume")
    }

    /// Directory of a named layer under a place.
    #[must_use]
    pub fn layer_dir(place: &std::path::Path, name: &str) -> PathBuf {
        Self::place_layers(place).join(name)
    }

    /// Create the runtime directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.runtime)?;
        std::fs::create_dir_all(self.container_kvs())?;
        std::fs::create_dir_all(self.volume_kvs())?;
        Ok(())
    }
}

impl Default for PortoPaths {
    fn default() -> Self {
        Self {
            runtime: PORTO_RUN_DIR.clone(),
            place: PORTO_PLACE.clone(),
        }
    }
}

/// Whether a layer or storage name is reserved for internal use.
#[must_use]
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with(LAYER_TMP_PREFIX)
        || name.starts_with(LAYER_IMPORT_PREFIX)
        || name.starts_with(LAYER_REMOVE_PREFIX)
        || name.starts_with(LAYER_PRIVATE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn custom_roots() {
        let paths = PortoPaths::with_roots("/tmp/porto-run", "/tmp/place");
        assert_eq!(paths.socket(), PathBuf::from("/tmp/porto-run/portod.socket"));
        assert_eq!(
            paths.container_kvs(),
            PathBuf::from("/tmp/porto-run/kvs")
        );
        assert_eq!(paths.volume_kvs(), PathBuf::from("/tmp/porto-run/pkvs"));
    }

    #[test]
    fn place_layout() {
        let place = Path::new("/place");
        assert_eq!(
            PortoPaths::volume_mountpoint(place, 7),
            PathBuf::from("/place/volumes/7/volume")
        );
        assert_eq!(
            PortoPaths::layer_dir(place, "base"),
            PathBuf::from("/place/layers/base")
        );
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved_name("_tmp_x"));
        assert!(is_reserved_name("_import_base"));
        assert!(is_reserved_name("_remove_17"));
        assert!(!is_reserved_name("ubuntu"));
    }
}
