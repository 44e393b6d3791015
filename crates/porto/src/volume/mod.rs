#![allow(unsafe_code)]
//! Volume manager.
//!
//! Volumes are mounted filesystems described by a property map, built by
//! a pluggable backend and kept alive by container links. Every mutation
//! happens under the volume map mutex; each volume additionally carries
//! its own lock for link-list changes.

pub mod backend;
pub mod layer;
pub mod quota;
pub mod storage;

pub use backend::{BackendKind, BuildOutcome, BuildPhase, DestroyOutcome, DestroyPhase};
pub use layer::{LayerInfo, LayerStore};
pub use quota::ProjectQuota;
pub use storage::{StorageInfo, StorageStore};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use porto_common::value::{format_bool, parse_bool, parse_size};
use porto_common::{Cred, IdMap, PortoError, PortoPaths, PortoResult};

use crate::kvs::KvStore;
use backend::BuildContext;

/// Wildcard container name that unlinks a volume from everything.
pub const UNLINK_ALL: &str = "***";

/// An external tool invocation the event loop must not wait for.
///
/// The engine spawns the command as a child process; its exit arrives
/// through SIGCHLD and resumes the pending operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCmd {
    /// Tool name, resolved through PATH.
    pub tool: &'static str,
    /// Arguments.
    pub args: Vec<String>,
    /// Capture stdout; the output feeds the resume step.
    pub capture: bool,
}

impl HelperCmd {
    /// Command whose output nobody needs.
    #[must_use]
    pub fn new(tool: &'static str, args: Vec<String>) -> Self {
        Self {
            tool,
            args,
            capture: false,
        }
    }

    /// Command whose stdout feeds the resume step.
    #[must_use]
    pub fn with_capture(tool: &'static str, args: Vec<String>) -> Self {
        Self {
            tool,
            args,
            capture: true,
        }
    }
}

/// Result of creating a volume.
#[derive(Debug)]
pub enum CreateOutcome {
    /// Built and ready.
    Ready(Arc<Volume>),
    /// Registered but waiting on a helper chain; the engine drives the
    /// remaining phases and finishes or fails the build.
    Building {
        /// The registered, not-yet-ready volume.
        volume: Arc<Volume>,
        /// First helper of the chain.
        cmd: HelperCmd,
        /// Phase to resume from when it exits.
        phase: BuildPhase,
    },
}

/// Result of dropping a volume link.
pub enum UnlinkOutcome {
    /// Links remain, or the teardown completed inline.
    Done,
    /// The last link dropped and teardown needs a helper chain.
    Destroying {
        /// First helper of the chain.
        cmd: HelperCmd,
        /// Phase to resume from when it exits.
        phase: DestroyPhase,
    },
}

/// Immutable description of a built volume.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    /// Volume id; kvs key and quota project id.
    pub id: u32,
    /// Mount point.
    pub path: PathBuf,
    /// Backing directory or image file.
    pub storage: PathBuf,
    /// Place this volume belongs to.
    pub place: PathBuf,
    /// Backend that built it.
    pub backend: BackendKind,
    /// Resolved layer paths, top first.
    pub layers: Vec<PathBuf>,
    /// Space limit in bytes, 0 unlimited.
    pub space_limit: u64,
    /// Inode limit, 0 unlimited.
    pub inode_limit: u64,
    /// Space guarantee in bytes.
    pub space_guarantee: u64,
    /// Inode guarantee.
    pub inode_guarantee: u64,
    /// Who created the volume.
    pub creator: Cred,
    /// Who owns the mount point.
    pub owner: Cred,
    /// Mount point permissions.
    pub permissions: u32,
    /// Read-only volume.
    pub read_only: bool,
    /// Whether path and storage live under the place's internal tree.
    pub internal: bool,
}

/// Mutable state of a volume.
#[derive(Debug, Default)]
pub struct VolumeState {
    /// Set once the backend build completed.
    pub ready: bool,
    /// Names of containers holding a link.
    pub containers: Vec<String>,
}

/// One volume.
#[derive(Debug)]
pub struct Volume {
    spec: VolumeSpec,
    state: RwLock<VolumeState>,
}

impl Volume {
    /// Immutable description.
    #[must_use]
    pub fn spec(&self) -> &VolumeSpec {
        &self.spec
    }

    /// Whether the build completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.read().ready
    }

    /// Containers currently linked.
    #[must_use]
    pub fn containers(&self) -> Vec<String> {
        self.state.read().containers.clone()
    }

    fn to_map(&self) -> BTreeMap<String, String> {
        let spec = &self.spec;
        let state = self.state.read();
        let mut map = BTreeMap::new();
        map.insert("path".into(), spec.path.display().to_string());
        map.insert("storage".into(), spec.storage.display().to_string());
        map.insert("place".into(), spec.place.display().to_string());
        map.insert("backend".into(), spec.backend.to_string());
        map.insert(
            "layers".into(),
            spec.layers
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(";"),
        );
        map.insert("space_limit".into(), spec.space_limit.to_string());
        map.insert("inode_limit".into(), spec.inode_limit.to_string());
        map.insert("space_guarantee".into(), spec.space_guarantee.to_string());
        map.insert("inode_guarantee".into(), spec.inode_guarantee.to_string());
        map.insert("creator".into(), spec.creator.to_string());
        map.insert("owner".into(), spec.owner.to_string());
        map.insert("permissions".into(), format!("{:o}", spec.permissions));
        map.insert("read_only".into(), format_bool(spec.read_only).to_string());
        map.insert("internal".into(), format_bool(spec.internal).to_string());
        map.insert("ready".into(), format_bool(state.ready).to_string());
        map.insert("containers".into(), state.containers.join(";"));
        map
    }

    fn from_map(id: u32, map: &BTreeMap<String, String>) -> PortoResult<Self> {
        let get = |key: &str| {
            map.get(key).ok_or_else(|| PortoError::unknown(format!(
                "volume record {id} lacks {key}"
            )))
        };
        let parse_cred = |s: &str| -> PortoResult<Cred> {
            let (uid, gid) = s.split_once(':').ok_or_else(|| PortoError::InvalidValue {
                message: format!("bad credential: {s}"),
            })?;
            Ok(Cred::new(
                porto_common::value::parse_u64(uid)? as u32,
                porto_common::value::parse_u64(gid)? as u32,
            ))
        };

        let layers = get("layers")?
            .split(';')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        let spec = VolumeSpec {
            id,
            path: PathBuf::from(get("path")?),
            storage: PathBuf::from(get("storage")?),
            place: PathBuf::from(get("place")?),
            backend: get("backend")?.parse()?,
            layers,
            space_limit: porto_common::value::parse_u64(get("space_limit")?)?,
            inode_limit: porto_common::value::parse_u64(get("inode_limit")?)?,
            space_guarantee: porto_common::value::parse_u64(get("space_guarantee")?)?,
            inode_guarantee: porto_common::value::parse_u64(get("inode_guarantee")?)?,
            creator: parse_cred(get("creator")?)?,
            owner: parse_cred(get("owner")?)?,
            permissions: u32::from_str_radix(get("permissions")?, 8).map_err(|_| {
                PortoError::InvalidValue {
                    message: "bad permissions in volume record".to_string(),
                }
            })?,
            read_only: parse_bool(get("read_only")?)?,
            internal: parse_bool(get("internal")?)?,
        };
        let state = VolumeState {
            ready: parse_bool(get("ready")?)?,
            containers: get("containers")?
                .split(';')
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
        };
        Ok(Self {
            spec,
            state: RwLock::new(state),
        })
    }

    fn build_context(&self) -> BuildContext<'_> {
        BuildContext {
            id: self.spec.id,
            path: &self.spec.path,
            storage: &self.spec.storage,
            layers: &self.spec.layers,
            space_limit: self.spec.space_limit,
            inode_limit: self.spec.inode_limit,
            read_only: self.spec.read_only,
        }
    }
}

struct Inner {
    by_path: HashMap<PathBuf, Arc<Volume>>,
    ids: IdMap,
}

/// The volume map and its operations.
pub struct VolumeManager {
    default_place: PathBuf,
    enable_quota: bool,
    kvs: KvStore,
    inner: Mutex<Inner>,
}

impl VolumeManager {
    /// Create a manager persisting into `kvs`.
    pub fn new(
        default_place: impl Into<PathBuf>,
        max_total: u32,
        enable_quota: bool,
        kvs: KvStore,
    ) -> Self {
        Self {
            default_place: default_place.into(),
            enable_quota,
            kvs,
            inner: Mutex::new(Inner {
                by_path: HashMap::new(),
                ids: IdMap::new(max_total),
            }),
        }
    }

    /// Default place of this manager.
    #[must_use]
    pub fn default_place(&self) -> &Path {
        &self.default_place
    }

    /// Find a volume by mount point.
    pub fn find(&self, path: &Path) -> PortoResult<Arc<Volume>> {
        self.inner
            .lock()
            .by_path
            .get(path)
            .cloned()
            .ok_or_else(|| PortoError::VolumeNotFound {
                path: path.display().to_string(),
            })
    }

    /// Every volume, optionally filtered by mount-point prefix and
    /// linked container.
    #[must_use]
    pub fn list(&self, path: Option<&Path>, container: Option<&str>) -> Vec<Arc<Volume>> {
        let mut volumes: Vec<_> = self
            .inner
            .lock()
            .by_path
            .values()
            .filter(|v| path.map_or(true, |p| v.spec().path.starts_with(p)))
            .filter(|v| container.map_or(true, |c| v.containers().iter().any(|l| l == c)))
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.spec().path.cmp(&b.spec().path));
        volumes
    }

    /// Create a volume from its property map and start the build.
    ///
    /// Backends without helper tools come back [`CreateOutcome::Ready`];
    /// loop and rbd come back [`CreateOutcome::Building`] and the engine
    /// drives the chain. Every failed step is rolled back: allocated ids
    /// are released, created directories removed, a half-built backend
    /// destroyed.
    pub fn create(
        &self,
        path: Option<PathBuf>,
        properties: &BTreeMap<String, String>,
        creator: &Cred,
        first_link: &str,
    ) -> PortoResult<CreateOutcome> {
        let place = self.resolve_place(properties.get("place").map(String::as_str))?;
        let layer_store = LayerStore::new(&place);

        let mut layers = Vec::new();
        if let Some(spec) = properties.get("layers") {
            for reference in spec.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                layers.push(layer_store.resolve(reference)?);
            }
        }

        let space_limit = properties
            .get("space_limit")
            .map(|v| parse_size(v))
            .transpose()?
            .unwrap_or(0);
        let inode_limit = properties
            .get("inode_limit")
            .map(|v| porto_common::value::parse_u64(v))
            .transpose()?
            .unwrap_or(0);
        let space_guarantee = properties
            .get("space_guarantee")
            .map(|v| parse_size(v))
            .transpose()?
            .unwrap_or(0);
        let inode_guarantee = properties
            .get("inode_guarantee")
            .map(|v| porto_common::value::parse_u64(v))
            .transpose()?
            .unwrap_or(0);
        let read_only = properties
            .get("read_only")
            .map(|v| parse_bool(v))
            .transpose()?
            .unwrap_or(false);
        let permissions = properties
            .get("permissions")
            .map(|v| {
                u32::from_str_radix(v, 8).map_err(|_| PortoError::InvalidValue {
                    message: format!("bad permissions: {v}"),
                })
            })
            .transpose()?
            .unwrap_or(0o775);

        let quota_supported =
            self.enable_quota && ProjectQuota::supported(&PortoPaths::place_volumes(&place));
        let backend = match properties.get("backend") {
            Some(name) => {
                let backend: BackendKind = name.parse()?;
                let wants_quota = space_limit > 0 || inode_limit > 0;
                if wants_quota && backend.supports_quota() && !quota_supported {
                    match backend {
                        BackendKind::Quota | BackendKind::Native | BackendKind::Overlay => {
                            return Err(PortoError::NotSupported {
                                feature: format!("project quota for backend {backend}"),
                            })
                        }
                        _ => {}
                    }
                }
                if !layers.is_empty() && !backend.supports_layers() {
                    return Err(PortoError::InvalidValue {
                        message: format!("backend {backend} does not support layers"),
                    });
                }
                backend
            }
            None => BackendKind::choose(
                !layers.is_empty(),
                space_limit > 0 || inode_limit > 0,
                quota_supported,
            ),
        };

        self.check_guarantee(&place, space_guarantee, inode_guarantee)?;

        let mut inner = self.inner.lock();
        let id = inner.ids.get()?;

        let internal_dir = PortoPaths::volume_dir(&place, id);
        let (path, internal) = match path {
            Some(path) => {
                if !path.is_absolute() {
                    inner.ids.put(id);
                    return Err(PortoError::InvalidValue {
                        message: format!("volume path must be absolute: {}", path.display()),
                    });
                }
                if inner.by_path.contains_key(&path) {
                    inner.ids.put(id);
                    return Err(PortoError::VolumeAlreadyExists {
                        path: path.display().to_string(),
                    });
                }
                (path, false)
            }
            None => (internal_dir.join("volume"), true),
        };

        let storage = match properties.get("storage") {
            Some(storage) => PathBuf::from(storage),
            None if backend == BackendKind::Loop => internal_dir.join("loop.img"),
            None => internal_dir.join("storage"),
        };

        let spec = VolumeSpec {
            id,
            path: path.clone(),
            storage,
            place,
            backend,
            layers,
            space_limit,
            inode_limit,
            space_guarantee,
            inode_guarantee,
            creator: creator.clone(),
            owner: creator.clone(),
            permissions,
            read_only,
            internal,
        };

        let volume = Arc::new(Volume {
            spec,
            state: RwLock::new(VolumeState {
                ready: false,
                containers: vec![first_link.to_string()],
            }),
        });
        inner.by_path.insert(path.clone(), Arc::clone(&volume));
        drop(inner);

        match self.begin_build(&volume) {
            Ok(BuildOutcome::Ready) => {
                self.finish_build(&volume)?;
                Ok(CreateOutcome::Ready(volume))
            }
            Ok(BuildOutcome::Pending(cmd, phase)) => Ok(CreateOutcome::Building {
                volume,
                cmd,
                phase,
            }),
            Err(e) => {
                self.fail_build(&volume);
                Err(e)
            }
        }
    }

    fn begin_build(&self, volume: &Arc<Volume>) -> PortoResult<BuildOutcome> {
        let spec = volume.spec();

        std::fs::create_dir_all(&spec.path)?;
        let storage_is_dir = !matches!(
            spec.backend,
            BackendKind::Loop | BackendKind::Rbd | BackendKind::Quota
        );
        if storage_is_dir && !spec.storage.exists() {
            std::fs::create_dir_all(&spec.storage)?;
        }

        spec.backend.build(&volume.build_context())
    }

    /// Resume a pending build after its helper exited.
    pub fn resume_build(
        &self,
        volume: &Arc<Volume>,
        phase: BuildPhase,
        output: &str,
    ) -> PortoResult<BuildOutcome> {
        backend::resume_build(&volume.build_context(), phase, output)
    }

    /// Complete a mounted build: merge layers, set ownership, mark ready
    /// and persist.
    pub fn finish_build(&self, volume: &Arc<Volume>) -> PortoResult<()> {
        let spec = volume.spec();

        // Non-overlay backends get their layers merged in by copy.
        if !spec.layers.is_empty() && spec.backend != BackendKind::Overlay {
            for layer_path in spec.layers.iter().rev() {
                layer::merge_tree(layer_path, &spec.path)?;
            }
            layer::sanitize_whiteouts(&spec.path, true)?;
        }

        chown_chmod(&spec.path, &spec.owner, spec.permissions)?;
        volume.state.write().ready = true;
        self.save(volume)?;
        tracing::info!(volume = %spec.path.display(), backend = %spec.backend, "volume created");
        Ok(())
    }

    /// Roll a failed build back: best-effort teardown of whatever got
    /// mounted, drop the map entry and the internal directory.
    pub fn fail_build(&self, volume: &Arc<Volume>) {
        let spec = volume.spec();
        tracing::warn!(volume = %spec.path.display(), "volume build failed, rolling back");
        match spec.backend.destroy(&volume.build_context()) {
            Ok(DestroyOutcome::Done) => {}
            Ok(DestroyOutcome::Pending(..)) => {
                tracing::warn!(volume = %spec.path.display(),
                    "helper-backed teardown skipped during rollback, a device may linger");
            }
            Err(e) => {
                tracing::debug!(volume = %spec.path.display(), error = %e, "rollback teardown");
            }
        }
        self.forget(volume);
        if spec.internal {
            let _ = std::fs::remove_dir_all(PortoPaths::volume_dir(&spec.place, spec.id));
        }
    }

    /// Link a container to a volume.
    pub fn link(&self, volume: &Arc<Volume>, container: &str) -> PortoResult<()> {
        let mut state = volume.state.write();
        if state.containers.iter().any(|c| c == container) {
            return Err(PortoError::VolumeAlreadyExists {
                path: format!("{} already linked to {container}", volume.spec().path.display()),
            });
        }
        state.containers.push(container.to_string());
        drop(state);
        self.save(volume)
    }

    /// Drop one link, starting teardown when the last link goes.
    ///
    /// [`UNLINK_ALL`] removes every link and destroys unconditionally.
    /// With `strict`, inline teardown errors roll the links back; the
    /// previous link list is returned so the engine can do the same for
    /// a helper chain that fails later.
    pub fn unlink(
        &self,
        volume: &Arc<Volume>,
        container: &str,
        strict: bool,
    ) -> PortoResult<(UnlinkOutcome, Vec<String>)> {
        let previous = self.remove_link(volume, container)?;

        if !volume.state.read().containers.is_empty() {
            self.save(volume)?;
            return Ok((UnlinkOutcome::Done, previous));
        }

        match self.begin_destroy(volume) {
            Ok(DestroyOutcome::Done) => {
                self.finish_destroy(volume)?;
                Ok((UnlinkOutcome::Done, previous))
            }
            Ok(DestroyOutcome::Pending(cmd, phase)) => {
                Ok((UnlinkOutcome::Destroying { cmd, phase }, previous))
            }
            Err(e) if strict => {
                self.restore_links(volume, previous);
                Err(e)
            }
            Err(e) => {
                tracing::warn!(volume = %volume.spec().path.display(), error = %e,
                    "volume teardown failed, dropping anyway");
                self.forget_and_remove(volume);
                Ok((UnlinkOutcome::Done, previous))
            }
        }
    }

    /// Drop every link a container holds. Inline teardowns complete
    /// here; helper-backed ones are handed back for the engine to drive.
    /// Used on container death and destruction.
    pub fn unlink_container(
        &self,
        container: &str,
    ) -> Vec<(Arc<Volume>, HelperCmd, DestroyPhase)> {
        let mut pending = Vec::new();
        for volume in self.list(None, Some(container)) {
            match self.unlink(&volume, container, false) {
                Ok((UnlinkOutcome::Done, _)) => {}
                Ok((UnlinkOutcome::Destroying { cmd, phase }, _)) => {
                    pending.push((volume, cmd, phase));
                }
                Err(e) => {
                    tracing::warn!(volume = %volume.spec().path.display(), error = %e,
                        "unlink on container teardown failed");
                }
            }
        }
        pending
    }

    fn remove_link(&self, volume: &Arc<Volume>, container: &str) -> PortoResult<Vec<String>> {
        let mut state = volume.state.write();
        let previous = state.containers.clone();
        if container == UNLINK_ALL {
            state.containers.clear();
        } else {
            let before = state.containers.len();
            state.containers.retain(|c| c != container);
            if state.containers.len() == before {
                return Err(PortoError::VolumeNotFound {
                    path: format!(
                        "{} is not linked to {container}",
                        volume.spec().path.display()
                    ),
                });
            }
        }
        Ok(previous)
    }

    /// Adjust quota limits of a built volume.
    pub fn tune(&self, volume: &Arc<Volume>, properties: &BTreeMap<String, String>) -> PortoResult<()> {
        let spec = volume.spec();
        if !spec.backend.supports_quota() || spec.backend == BackendKind::Loop {
            return Err(PortoError::NotSupported {
                feature: format!("resize of backend {}", spec.backend),
            });
        }
        let space_limit = properties
            .get("space_limit")
            .map(|v| parse_size(v))
            .transpose()?
            .unwrap_or(spec.space_limit);
        let inode_limit = properties
            .get("inode_limit")
            .map(|v| porto_common::value::parse_u64(v))
            .transpose()?
            .unwrap_or(spec.inode_limit);

        let target = if spec.backend == BackendKind::Quota {
            &spec.path
        } else {
            &spec.storage
        };
        ProjectQuota::new(target, spec.id).tune(space_limit, inode_limit)?;
        Ok(())
    }

    fn begin_destroy(&self, volume: &Arc<Volume>) -> PortoResult<DestroyOutcome> {
        volume.spec().backend.destroy(&volume.build_context())
    }

    /// Resume a pending teardown after its helper exited.
    pub fn resume_destroy(
        &self,
        volume: &Arc<Volume>,
        phase: DestroyPhase,
        output: &str,
    ) -> PortoResult<DestroyOutcome> {
        backend::resume_destroy(&volume.build_context(), phase, output)
    }

    /// Complete a teardown: drop the internal directory, the map entry
    /// and the persistent record.
    pub fn finish_destroy(&self, volume: &Arc<Volume>) -> PortoResult<()> {
        let spec = volume.spec();
        if spec.internal {
            let _ = std::fs::remove_dir_all(PortoPaths::volume_dir(&spec.place, spec.id));
        }
        self.forget(volume);
        self.kvs.remove(spec.id)?;
        tracing::info!(volume = %spec.path.display(), "volume destroyed");
        Ok(())
    }

    /// Put the link list back after a strict teardown failed.
    pub fn restore_links(&self, volume: &Arc<Volume>, links: Vec<String>) {
        volume.state.write().containers = links;
        let _ = self.save(volume);
    }

    /// Drop a volume whose teardown failed non-strictly.
    pub fn forget_and_remove(&self, volume: &Arc<Volume>) {
        self.forget(volume);
        let _ = self.kvs.remove(volume.spec().id);
    }

    fn forget(&self, volume: &Arc<Volume>) {
        let mut inner = self.inner.lock();
        inner.by_path.remove(&volume.spec().path);
        inner.ids.put(volume.spec().id);
    }

    pub(crate) fn save(&self, volume: &Arc<Volume>) -> PortoResult<()> {
        self.kvs.save(volume.spec().id, &volume.to_map())
    }

    /// Restore volumes from the key-value store.
    ///
    /// Staging leftovers are cleared first; volumes whose record is
    /// incomplete or whose storage vanished are torn down and dropped.
    /// Returns how many volumes failed to restore.
    pub fn restore(&self) -> PortoResult<u64> {
        LayerStore::new(&self.default_place).cleanup()?;

        let (nodes, mut failed) = self.kvs.load_all()?;
        for node in nodes {
            match Volume::from_map(node.id, &node.data) {
                Ok(volume) if volume.is_ready() && volume.spec().storage.exists() => {
                    let volume = Arc::new(volume);
                    let mut inner = self.inner.lock();
                    if inner.ids.get_at(volume.spec().id).is_err() {
                        failed += 1;
                        continue;
                    }
                    inner
                        .by_path
                        .insert(volume.spec().path.clone(), Arc::clone(&volume));
                    drop(inner);
                    tracing::debug!(volume = %volume.spec().path.display(), "volume restored");
                }
                Ok(volume) => {
                    tracing::warn!(volume = %volume.spec().path.display(),
                        "dropping stale volume at restore");
                    match volume.spec().backend.destroy(&volume.build_context()) {
                        Ok(DestroyOutcome::Pending(..)) => {
                            tracing::warn!(volume = %volume.spec().path.display(),
                                "stale volume needs helper teardown, a device may linger");
                        }
                        Ok(DestroyOutcome::Done) | Err(_) => {}
                    }
                    let _ = self.kvs.remove(node.id);
                    failed += 1;
                }
                Err(e) => {
                    tracing::warn!(id = node.id, error = %e, "unreadable volume record");
                    let _ = self.kvs.remove(node.id);
                    failed += 1;
                }
            }
        }
        Ok(failed)
    }

    fn resolve_place(&self, place: Option<&str>) -> PortoResult<PathBuf> {
        let place = match place {
            Some(place) => {
                let place = PathBuf::from(place);
                if !place.is_absolute() || place.components().any(|c| {
                    matches!(c, std::path::Component::ParentDir | std::path::Component::CurDir)
                }) {
                    return Err(PortoError::InvalidValue {
                        message: format!("place must be absolute and normalized: {}", place.display()),
                    });
                }
                if crate::namespace::mount::is_system_path(&place) {
                    return Err(PortoError::Permission {
                        message: format!("place inside a system path: {}", place.display()),
                    });
                }
                place
            }
            None => self.default_place.clone(),
        };

        std::fs::create_dir_all(PortoPaths::place_volumes(&place))?;
        std::fs::create_dir_all(PortoPaths::place_layers(&place))?;
        std::fs::create_dir_all(PortoPaths::place_storage(&place))?;
        Ok(place)
    }

    /// Aggregate guarantee invariant: the guarantees of every volume on
    /// this place plus the new one must fit into what the filesystem can
    /// still promise.
    fn check_guarantee(&self, place: &Path, space: u64, inodes: u64) -> PortoResult<()> {
        if space == 0 && inodes == 0 {
            return Ok(());
        }

        let (free_space, free_inodes) = statvfs(place)?;
        let (mut claimed_space, mut claimed_inodes) = (0u64, 0u64);
        for volume in self.inner.lock().by_path.values() {
            if volume.spec().place == place {
                claimed_space += volume.spec().space_guarantee;
                claimed_inodes += volume.spec().inode_guarantee;
            }
        }

        if claimed_space + space > free_space {
            return Err(PortoError::NoSpace {
                message: format!(
                    "space guarantee {space} over {} already claimed exceeds free {free_space}",
                    claimed_space
                ),
            });
        }
        if claimed_inodes + inodes > free_inodes {
            return Err(PortoError::NoSpace {
                message: format!(
                    "inode guarantee {inodes} over {} already claimed exceeds free {free_inodes}",
                    claimed_inodes
                ),
            });
        }
        Ok(())
    }
}

fn statvfs(path: &Path) -> PortoResult<(u64, u64)> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        PortoError::InvalidValue {
            message: "path contains NUL".to_string(),
        }
    })?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(PortoError::from_errno(format!(
            "statvfs on {}",
            path.display()
        )));
    }
    Ok((
        stat.f_bavail as u64 * stat.f_bsize as u64,
        stat.f_favail as u64,
    ))
}

fn chown_chmod(path: &Path, owner: &Cred, permissions: u32) -> PortoResult<()> {
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        PortoError::InvalidValue {
            message: "path contains NUL".to_string(),
        }
    })?;
    // Best effort for non-root test runs; the daemon runs as root.
    unsafe {
        libc::chown(c_path.as_ptr(), owner.uid, owner.gid);
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(permissions))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, tempfile::TempDir, VolumeManager) {
        let place = tempfile::tempdir().unwrap();
        let kvs_dir = tempfile::tempdir().unwrap();
        let kvs = KvStore::open(kvs_dir.path(), 1 << 20).unwrap();
        let manager = VolumeManager::new(place.path(), 100, false, kvs);
        (place, kvs_dir, manager)
    }

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn record_roundtrip() {
        let spec = VolumeSpec {
            id: 4,
            path: PathBuf::from("/mnt/v"),
            storage: PathBuf::from("/place/volumes/4/storage"),
            place: PathBuf::from("/place"),
            backend: BackendKind::Native,
            layers: vec![PathBuf::from("/place/layers/base")],
            space_limit: 1 << 30,
            inode_limit: 1000,
            space_guarantee: 1 << 20,
            inode_guarantee: 10,
            creator: Cred::new(1000, 1000),
            owner: Cred::new(1000, 100),
            permissions: 0o775,
            read_only: false,
            internal: true,
        };
        let volume = Volume {
            spec,
            state: RwLock::new(VolumeState {
                ready: true,
                containers: vec!["a".to_string(), "b/c".to_string()],
            }),
        };

        let map = volume.to_map();
        let restored = Volume::from_map(4, &map).unwrap();
        assert_eq!(restored.spec().backend, BackendKind::Native);
        assert_eq!(restored.spec().space_limit, 1 << 30);
        assert_eq!(restored.spec().owner.gid, 100);
        assert_eq!(restored.containers(), vec!["a", "b/c"]);
        assert!(restored.is_ready());
    }

    #[test]
    fn place_validation() {
        let (_place, _kvs, manager) = manager();
        assert!(manager.resolve_place(Some("relative")).is_err());
        assert!(manager.resolve_place(Some("/etc/place")).is_err());
        assert!(manager.resolve_place(Some("/data/../place")).is_err());
    }

    #[test]
    fn place_subdirs_are_created() {
        let (place, _kvs, manager) = manager();
        manager.resolve_place(None).unwrap();
        assert!(place.path().join("volumes").is_dir());
        assert!(place.path().join("layers").is_dir());
        assert!(place.path().join("storage").is_dir());
    }

    #[test]
    fn missing_layer_fails_creation() {
        let (_place, _kvs, manager) = manager();
        let err = manager
            .create(None, &props(&[("layers", "missing")]), &Cred::current(), "a")
            .unwrap_err();
        assert!(matches!(err, PortoError::LayerNotFound { .. }));
    }

    #[test]
    fn guarantee_is_checked_against_free_space() {
        let (_place, _kvs, manager) = manager();
        let place = manager.resolve_place(None).unwrap();
        // An absurd guarantee cannot fit.
        let err = manager
            .check_guarantee(&place, u64::MAX / 2, 0)
            .unwrap_err();
        assert!(matches!(err, PortoError::NoSpace { .. }));
        manager.check_guarantee(&place, 0, 0).unwrap();
    }

    #[test]
    fn remove_and_restore_links() {
        let (_place, _kvs, manager) = manager();
        let volume = Arc::new(Volume {
            spec: VolumeSpec {
                id: 3,
                path: PathBuf::from("/mnt/v"),
                storage: PathBuf::from("/place/volumes/3/storage"),
                place: PathBuf::from("/place"),
                backend: BackendKind::Plain,
                layers: Vec::new(),
                space_limit: 0,
                inode_limit: 0,
                space_guarantee: 0,
                inode_guarantee: 0,
                creator: Cred::root(),
                owner: Cred::root(),
                permissions: 0o775,
                read_only: false,
                internal: true,
            },
            state: RwLock::new(VolumeState {
                ready: true,
                containers: vec!["a".to_string(), "b".to_string()],
            }),
        });
        manager
            .inner
            .lock()
            .by_path
            .insert(volume.spec().path.clone(), Arc::clone(&volume));

        let previous = manager.remove_link(&volume, "a").unwrap();
        assert_eq!(previous, vec!["a", "b"]);
        assert_eq!(volume.containers(), vec!["b"]);
        assert!(manager.remove_link(&volume, "a").is_err());

        manager.restore_links(&volume, previous);
        assert_eq!(volume.containers(), vec!["a", "b"]);

        // The wildcard clears every link at once.
        manager.remove_link(&volume, UNLINK_ALL).unwrap();
        assert!(volume.containers().is_empty());
    }

    #[test]
    fn unknown_volume_lookup_fails() {
        let (_place, _kvs, manager) = manager();
        assert!(matches!(
            manager.find(Path::new("/no/such")),
            Err(PortoError::VolumeNotFound { .. })
        ));
    }
}
