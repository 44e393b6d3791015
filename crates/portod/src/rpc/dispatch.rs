//! Request dispatch.
//!
//! Every request is identified, its container names rewritten through
//! the client's porto namespace, gated by the access level, and routed
//! to the engine. Requests that have to wait for something — a Wait
//! match, a SIGTERM grace period, a helper child like tar or mkfs —
//! defer their response; the engine completes them through the report
//! queues once the event arrives.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use porto::cgroup::{pid_cgroup, Controller};
use porto::container::property::PROPERTIES;
use porto::engine::data::DATA;
use porto::volume::{LayerStore, StorageStore, UNLINK_ALL};
use porto::Engine;
use porto_common::cred::PORTO_GROUP;
use porto_common::{ContainerName, Cred, PortoError, PortoResult};
use serde_json::{json, Value};

use super::client::{AccessLevel, ClientConn, Identity};
use super::wire::{Request, Response};
use porto::container::EnablePorto;

/// Routes requests into the engine.
pub struct Dispatcher<'a> {
    engine: &'a Engine,
}

impl<'a> Dispatcher<'a> {
    /// Dispatcher over an engine.
    #[must_use]
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Refresh the client's identity when its peer credentials changed.
    pub fn identify(&self, client: &mut ClientConn) -> PortoResult<Identity> {
        let (pid, cred) = client.peer()?;
        if let Some(identity) = &client.identity {
            if identity.pid == pid && identity.cred == cred {
                return Ok(identity.clone());
            }
        }

        let container = self.container_of_pid(pid);
        let namespace = self.namespace_of(&container);
        let access = self.access_level(&cred, &container);

        let identity = Identity {
            pid,
            cred,
            container,
            namespace,
            access,
        };
        client.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Container a task runs in, by its freezer cgroup.
    fn container_of_pid(&self, pid: i32) -> String {
        if !Controller::Freezer.supported() {
            return "/".to_string();
        }
        match pid_cgroup(pid, Controller::Freezer) {
            Ok(path) => match path.strip_prefix("/porto/") {
                Some(name) => name.to_string(),
                None => "/".to_string(),
            },
            Err(_) => "/".to_string(),
        }
    }

    /// Accumulated porto-namespace prefix of a container.
    fn namespace_of(&self, container: &str) -> String {
        if container == "/" {
            return String::new();
        }
        let mut prefix = String::new();
        let mut partial = String::new();
        for segment in container.split('/') {
            if !partial.is_empty() {
                partial.push('/');
            }
            partial.push_str(segment);
            if let Ok(ct) = self.engine.tree.find(&partial) {
                let rt = ct.read();
                match rt.props.enable_porto {
                    // Confined levels pin the namespace to the subtree.
                    EnablePorto::Isolate | EnablePorto::ChildOnly => {
                        prefix = format!("{partial}/");
                    }
                    _ => {
                        if !rt.props.porto_namespace.is_empty() {
                            prefix.push_str(&rt.props.porto_namespace);
                        }
                    }
                }
            }
        }
        prefix
    }

    /// Access level: the credential's power capped by the weakest
    /// `enable_porto` along the container's ancestry.
    fn access_level(&self, cred: &Cred, container: &str) -> AccessLevel {
        let cred_level = if cred.is_root() {
            AccessLevel::SuperUser
        } else if cred.is_member_of_group(PORTO_GROUP) {
            AccessLevel::Normal
        } else {
            AccessLevel::ReadOnly
        };

        if container == "/" {
            return cred_level;
        }

        let mut porto_level = AccessLevel::Normal;
        let mut partial = String::new();
        for segment in container.split('/') {
            if !partial.is_empty() {
                partial.push('/');
            }
            partial.push_str(segment);
            if let Ok(ct) = self.engine.tree.find(&partial) {
                let level = match ct.read().props.enable_porto {
                    EnablePorto::None => AccessLevel::None,
                    EnablePorto::ReadOnly => AccessLevel::ReadOnly,
                    _ => AccessLevel::Normal,
                };
                porto_level = porto_level.min(level);
            }
        }
        cred_level.min(porto_level)
    }

    /// Rewrite a request name into an absolute container name.
    pub fn resolve_name(&self, identity: &Identity, name: &str) -> PortoResult<String> {
        let resolved = if name == "/" {
            "/".to_string()
        } else if name == "self" {
            identity.container.clone()
        } else if let Some(rest) = name.strip_prefix("self/") {
            if identity.container == "/" {
                rest.to_string()
            } else {
                format!("{}/{rest}", identity.container)
            }
        } else if name == "/porto" {
            "/".to_string()
        } else if let Some(rest) = name.strip_prefix("/porto/") {
            rest.to_string()
        } else if name == "." {
            let trimmed = identity.namespace.trim_end_matches('/');
            match trimmed.rsplit_once('/') {
                Some((parent, _)) => parent.to_string(),
                None if trimmed.is_empty() => "/".to_string(),
                None => trimmed.to_string(),
            }
        } else {
            format!("{}{name}", identity.namespace)
        };

        if resolved == "/" {
            return Ok(resolved);
        }
        ContainerName::new(resolved.as_str())?;

        // The result must stay inside the namespace or be an ancestor of
        // the client's own container.
        let inside = resolved.starts_with(&identity.namespace);
        let ancestor = identity.container != "/"
            && (identity.container == resolved
                || identity.container.starts_with(&format!("{resolved}/")));
        if !inside && !ancestor {
            return Err(PortoError::Permission {
                message: format!("container {name} is outside the namespace"),
            });
        }
        Ok(resolved)
    }

    /// Name as the client sees it: the namespace prefix stripped.
    fn display_name(&self, identity: &Identity, absolute: &str) -> String {
        absolute
            .strip_prefix(&identity.namespace)
            .unwrap_or(absolute)
            .to_string()
    }

    /// Whether the caller may mutate the named container.
    fn can_control(&self, identity: &Identity, name: &str) -> PortoResult<()> {
        if identity.access < AccessLevel::Normal {
            return Err(PortoError::Permission {
                message: "read-only access".to_string(),
            });
        }
        if identity.access >= AccessLevel::SuperUser || name == "/" {
            return Ok(());
        }
        let ct = self.engine.tree.find(name)?;
        let owner = ct.read().owner.clone();
        if identity.cred.can_control(&owner) {
            Ok(())
        } else {
            Err(PortoError::Permission {
                message: format!("container {name} belongs to {owner}"),
            })
        }
    }

    fn require(&self, identity: &Identity, level: AccessLevel) -> PortoResult<()> {
        if identity.access < level {
            return Err(PortoError::Permission {
                message: format!("operation requires {level:?} access"),
            });
        }
        Ok(())
    }

    /// Handle one request.
    ///
    /// `Ok(None)` means the response is deferred: a queued wait, a stop
    /// or destroy waiting out its grace period, or an operation driven
    /// by a helper child process.
    pub fn dispatch(
        &self,
        client: &mut ClientConn,
        request: Request,
    ) -> PortoResult<Option<Response>> {
        let identity = self.identify(client)?;
        if identity.access == AccessLevel::None {
            return Err(PortoError::Permission {
                message: "porto is disabled for this container".to_string(),
            });
        }

        self.dispatch_inner(client, &identity, request)
    }

    fn dispatch_inner(
        &self,
        client: &mut ClientConn,
        identity: &Identity,
        request: Request,
    ) -> PortoResult<Option<Response>> {
        let response = match request {
            Request::Create { name } => {
                self.create(identity, &name, None)?;
                Response::empty()
            }
            Request::CreateWeak { name } => {
                self.create(identity, &name, Some(client.id))?;
                Response::empty()
            }
            Request::Destroy { name } => {
                let name = self.resolve_name(identity, &name)?;
                self.can_control(identity, &name)?;
                match self.engine.destroy_container(&name, Some(client.id))? {
                    Some(()) => Response::empty(),
                    None => {
                        client.waiting = true;
                        return Ok(None);
                    }
                }
            }
            Request::List { mask } => {
                let names: Vec<String> = self
                    .engine
                    .tree
                    .list()
                    .iter()
                    .filter(|ct| !ct.is_root() && ct.name().as_str() != "porto")
                    .map(|ct| ct.name().as_str().to_string())
                    .filter(|name| name.starts_with(&identity.namespace))
                    .map(|name| self.display_name(identity, &name))
                    .filter(|name| {
                        mask.as_deref().map_or(true, |m| {
                            porto_common::name::match_wildcard(m, name)
                        })
                    })
                    .collect();
                Response::ok(json!(names))
            }
            Request::GetProperty { name, property } => {
                let name = self.resolve_name(identity, &name)?;
                let value = self.read_variable(&name, &property)?;
                Response::ok(json!(value))
            }
            Request::SetProperty {
                name,
                property,
                value,
            } => {
                let name = self.resolve_name(identity, &name)?;
                self.can_control(identity, &name)?;
                self.engine.set_property(&name, &property, &value)?;
                Response::empty()
            }
            Request::GetData { name, data } => {
                let name = self.resolve_name(identity, &name)?;
                let value = self.read_data_first(&name, &data)?;
                Response::ok(json!(value))
            }
            Request::Get { names, variables } => {
                let mut result = BTreeMap::new();
                for name in names {
                    let mut values = BTreeMap::new();
                    match self.resolve_name(identity, &name) {
                        Ok(resolved) => {
                            for variable in &variables {
                                match self.read_variable(&resolved, variable) {
                                    Ok(value) => {
                                        values.insert(variable.clone(), json!({"value": value}));
                                    }
                                    Err(e) => {
                                        values.insert(
                                            variable.clone(),
                                            json!({"error": e.code(), "error_msg": e.to_string()}),
                                        );
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            for variable in &variables {
                                values.insert(
                                    variable.clone(),
                                    json!({"error": e.code(), "error_msg": e.to_string()}),
                                );
                            }
                        }
                    }
                    result.insert(name, values);
                }
                Response::ok(json!(result))
            }
            Request::Start { name } => {
                let name = self.resolve_name(identity, &name)?;
                self.can_control(identity, &name)?;
                self.engine.start_container(&name)?;
                Response::empty()
            }
            Request::Stop { name, timeout_ms } => {
                let name = self.resolve_name(identity, &name)?;
                self.can_control(identity, &name)?;
                match self.engine.stop_container(
                    &name,
                    timeout_ms.map(Duration::from_millis),
                    Some(client.id),
                )? {
                    Some(()) => Response::empty(),
                    None => {
                        client.waiting = true;
                        return Ok(None);
                    }
                }
            }
            Request::Pause { name } => {
                let name = self.resolve_name(identity, &name)?;
                self.can_control(identity, &name)?;
                self.engine.pause_container(&name)?;
                Response::empty()
            }
            Request::Resume { name } => {
                let name = self.resolve_name(identity, &name)?;
                self.can_control(identity, &name)?;
                self.engine.resume_container(&name)?;
                Response::empty()
            }
            Request::Kill { name, sig } => {
                let name = self.resolve_name(identity, &name)?;
                self.can_control(identity, &name)?;
                self.engine.kill_container(&name, sig)?;
                Response::empty()
            }
            Request::Wait { names, timeout_ms } => {
                let mut targets = Vec::new();
                for name in &names {
                    if name.contains('*') || name.contains('?') {
                        targets.push(format!("{}{name}", identity.namespace));
                    } else {
                        targets.push(self.resolve_name(identity, name)?);
                    }
                }
                match self.engine.wait_containers(
                    client.id,
                    &targets,
                    timeout_ms.map(Duration::from_millis),
                )? {
                    Some(report) => Response::ok(json!({
                        "name": self.display_name(identity, &report.name),
                        "state": report.state,
                        "when": report.when,
                    })),
                    None => {
                        client.waiting = true;
                        return Ok(None);
                    }
                }
            }
            Request::PropertyList => {
                let list: Vec<Value> = PROPERTIES
                    .iter()
                    .map(|def| json!({"name": def.name, "desc": def.desc, "dynamic": def.dynamic}))
                    .collect();
                Response::ok(json!(list))
            }
            Request::DataList => {
                let list: Vec<Value> = DATA
                    .iter()
                    .map(|def| json!({"name": def.name, "desc": def.desc}))
                    .collect();
                Response::ok(json!(list))
            }
            Request::Version => Response::ok(json!({
                "tag": env!("CARGO_PKG_VERSION"),
            })),
            Request::ConvertPath {
                path,
                source,
                destination,
            } => {
                let source = self.resolve_name(identity, &source)?;
                let destination = self.resolve_name(identity, &destination)?;
                let converted = self.convert_path(&path, &source, &destination)?;
                Response::ok(json!(converted))
            }
            Request::AttachProcess { name, pid, comm } => {
                let name = self.resolve_name(identity, &name)?;
                self.can_control(identity, &name)?;
                self.attach_process(&name, pid, &comm)?;
                Response::empty()
            }
            Request::LocateProcess { pid, comm } => {
                check_comm(pid, &comm)?;
                let container = self.container_of_pid(pid);
                if container != "/" && !container.starts_with(&identity.namespace) {
                    return Err(PortoError::Permission {
                        message: "process is outside the namespace".to_string(),
                    });
                }
                Response::ok(json!(self.display_name(identity, &container)))
            }
            Request::CreateVolume { path, properties } => {
                self.require(identity, AccessLevel::Normal)?;
                let link = if identity.container == "/" {
                    "/".to_string()
                } else {
                    identity.container.clone()
                };
                match self.engine.create_volume(
                    path.map(PathBuf::from),
                    &properties,
                    &identity.cred,
                    &link,
                    client.id,
                )? {
                    Some(volume_path) => Response::ok(json!(volume_path)),
                    None => {
                        client.waiting = true;
                        return Ok(None);
                    }
                }
            }
            Request::LinkVolume { path, container } => {
                self.require(identity, AccessLevel::Normal)?;
                let volume = self.engine.volumes.find(Path::new(&path))?;
                let container = match container {
                    Some(name) => self.resolve_name(identity, &name)?,
                    None => identity.container.clone(),
                };
                self.engine.volumes.link(&volume, &container)?;
                Response::empty()
            }
            Request::UnlinkVolume {
                path,
                container,
                strict,
            } => {
                self.require(identity, AccessLevel::Normal)?;
                let volume = self.engine.volumes.find(Path::new(&path))?;
                let container = match container.as_deref() {
                    Some(UNLINK_ALL) => UNLINK_ALL.to_string(),
                    Some(name) => self.resolve_name(identity, name)?,
                    None => identity.container.clone(),
                };
                match self.engine.unlink_volume(
                    &volume,
                    &container,
                    strict.unwrap_or(false),
                    client.id,
                )? {
                    Some(()) => Response::empty(),
                    None => {
                        client.waiting = true;
                        return Ok(None);
                    }
                }
            }
            Request::ListVolumes { path, container } => {
                let container = match container {
                    Some(name) => Some(self.resolve_name(identity, &name)?),
                    None => None,
                };
                let volumes: Vec<Value> = self
                    .engine
                    .volumes
                    .list(path.as_deref().map(Path::new), container.as_deref())
                    .iter()
                    .map(|v| {
                        json!({
                            "path": v.spec().path.display().to_string(),
                            "backend": v.spec().backend.to_string(),
                            "space_limit": v.spec().space_limit,
                            "inode_limit": v.spec().inode_limit,
                            "read_only": v.spec().read_only,
                            "containers": v.containers(),
                        })
                    })
                    .collect();
                Response::ok(json!(volumes))
            }
            Request::TuneVolume { path, properties } => {
                self.require(identity, AccessLevel::Normal)?;
                let volume = self.engine.volumes.find(Path::new(&path))?;
                self.engine.volumes.tune(&volume, &properties)?;
                Response::empty()
            }
            Request::ImportLayer {
                layer,
                tarball,
                merge,
                place,
            } => {
                self.require(identity, AccessLevel::Normal)?;
                // tar runs as a child process; the response follows its
                // exit.
                self.engine.import_layer(
                    &self.place(place.as_deref())?,
                    &layer,
                    Path::new(&tarball),
                    &identity.cred,
                    merge.unwrap_or(false),
                    client.id,
                )?;
                client.waiting = true;
                return Ok(None);
            }
            Request::ExportLayer {
                layer,
                tarball,
                place,
            } => {
                self.engine.export_layer(
                    &self.place(place.as_deref())?,
                    &layer,
                    Path::new(&tarball),
                    client.id,
                )?;
                client.waiting = true;
                return Ok(None);
            }
            Request::RemoveLayer { layer, place } => {
                self.require(identity, AccessLevel::Normal)?;
                let store = self.layer_store(place.as_deref())?;
                let layer_path = store.layer_path(&layer);
                let in_use = self
                    .engine
                    .volumes
                    .list(None, None)
                    .iter()
                    .any(|v| v.spec().layers.contains(&layer_path));
                store.remove(&layer, in_use)?;
                Response::empty()
            }
            Request::ListLayers { place } => {
                let layers: Vec<Value> = self
                    .layer_store(place.as_deref())?
                    .list()?
                    .into_iter()
                    .map(|l| {
                        json!({
                            "name": l.name,
                            "owner": l.owner.to_string(),
                            "private": l.private,
                            "last_usage": l.last_usage,
                        })
                    })
                    .collect();
                Response::ok(json!(layers))
            }
            Request::GetLayerPrivate { layer, place } => {
                let private = self.layer_store(place.as_deref())?.get_private(&layer)?;
                Response::ok(json!(private))
            }
            Request::SetLayerPrivate {
                layer,
                private,
                place,
            } => {
                self.require(identity, AccessLevel::Normal)?;
                self.layer_store(place.as_deref())?
                    .set_private(&layer, &private)?;
                Response::empty()
            }
            Request::ImportStorage {
                name,
                tarball,
                private,
                place,
            } => {
                self.require(identity, AccessLevel::Normal)?;
                self.engine.import_storage(
                    &self.place(place.as_deref())?,
                    &name,
                    Path::new(&tarball),
                    private.as_deref().unwrap_or(""),
                    client.id,
                )?;
                client.waiting = true;
                return Ok(None);
            }
            Request::ExportStorage {
                name,
                tarball,
                place,
            } => {
                self.engine.export_storage(
                    &self.place(place.as_deref())?,
                    &name,
                    Path::new(&tarball),
                    client.id,
                )?;
                client.waiting = true;
                return Ok(None);
            }
            Request::RemoveStorage { name, place } => {
                self.require(identity, AccessLevel::Normal)?;
                self.storage_store(place.as_deref())?.remove(&name)?;
                Response::empty()
            }
            Request::ListStorage { place } => {
                let storages: Vec<Value> = self
                    .storage_store(place.as_deref())?
                    .list()?
                    .into_iter()
                    .map(|s| {
                        json!({
                            "name": s.name,
                            "owner": s.owner.to_string(),
                            "private": s.private,
                            "last_usage": s.last_usage,
                        })
                    })
                    .collect();
                Response::ok(json!(storages))
            }
        };
        Ok(Some(response))
    }

    fn create(&self, identity: &Identity, name: &str, weak: Option<u64>) -> PortoResult<()> {
        self.require(identity, AccessLevel::Normal)?;
        let resolved = self.resolve_name(identity, name)?;
        let resolved = ContainerName::new(resolved)?;

        // The caller must control the parent it creates under.
        if let Some(parent) = resolved.parent() {
            if !parent.is_root() {
                self.can_control(identity, parent.as_str())?;
            }
        }

        self.engine
            .create_container(&resolved, identity.cred.clone(), weak)?;
        Ok(())
    }

    /// Properties first, data second; Get and GetProperty accept both.
    fn read_variable(&self, name: &str, variable: &str) -> PortoResult<String> {
        match self.engine.get_property(name, variable) {
            Ok(value) => Ok(value),
            Err(PortoError::InvalidProperty { .. }) => self.engine.get_data(name, variable),
            Err(e) => Err(e),
        }
    }

    fn read_data_first(&self, name: &str, variable: &str) -> PortoResult<String> {
        match self.engine.get_data(name, variable) {
            Ok(value) => Ok(value),
            Err(PortoError::InvalidProperty { .. }) => self.engine.get_property(name, variable),
            Err(e) => Err(e),
        }
    }

    fn convert_path(&self, path: &str, source: &str, destination: &str) -> PortoResult<String> {
        let root_of = |name: &str| -> PortoResult<PathBuf> {
            if name == "/" {
                return Ok(PathBuf::from("/"));
            }
            Ok(self.engine.tree.find(name)?.read().props.root.clone())
        };
        let source_root = root_of(source)?;
        let destination_root = root_of(destination)?;

        let absolute = if source_root == Path::new("/") {
            PathBuf::from(path)
        } else {
            source_root.join(path.trim_start_matches('/'))
        };

        if destination_root == Path::new("/") {
            return Ok(absolute.display().to_string());
        }
        match absolute.strip_prefix(&destination_root) {
            Ok(rest) => Ok(format!("/{}", rest.display())),
            Err(_) => Err(PortoError::InvalidValue {
                message: format!(
                    "{path} in {source} is not reachable from {destination}"
                ),
            }),
        }
    }

    fn attach_process(&self, name: &str, pid: i32, comm: &str) -> PortoResult<()> {
        check_comm(pid, comm)?;
        let ct = self.engine.tree.find(name)?;
        if !ct.state().is_active() {
            return Err(PortoError::InvalidState {
                message: format!("container {name} is {}", ct.state()),
            });
        }
        for cg in ct.cgroups() {
            cg.attach(pid)?;
        }
        Ok(())
    }

    fn layer_store(&self, place: Option<&str>) -> PortoResult<LayerStore> {
        Ok(LayerStore::new(self.place(place)?))
    }

    fn storage_store(&self, place: Option<&str>) -> PortoResult<StorageStore> {
        Ok(StorageStore::new(self.place(place)?))
    }

    fn place(&self, place: Option<&str>) -> PortoResult<PathBuf> {
        match place {
            Some(place) => {
                let place = PathBuf::from(place);
                if !place.is_absolute() {
                    return Err(PortoError::InvalidValue {
                        message: format!("place must be absolute: {}", place.display()),
                    });
                }
                Ok(place)
            }
            None => Ok(self.engine.volumes.default_place().to_path_buf()),
        }
    }
}

/// Guard against pid reuse: the caller names the command it expects.
pub(crate) fn check_comm(pid: i32, comm: &str) -> PortoResult<()> {
    if comm.is_empty() {
        return Ok(());
    }
    let actual = std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map_err(|_| PortoError::InvalidValue {
            message: format!("no such process: {pid}"),
        })?;
    if actual.trim() != comm {
        return Err(PortoError::InvalidValue {
            message: format!("process {pid} is {}, not {comm}", actual.trim()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use porto::Config;
    use porto_common::PortoPaths;

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PortoPaths::with_roots(dir.path().join("run"), dir.path().join("place"));
        (dir, Engine::new(Config::default(), paths).unwrap())
    }

    fn identity(container: &str, namespace: &str, access: AccessLevel) -> Identity {
        Identity {
            pid: 1,
            cred: Cred::root(),
            container: container.to_string(),
            namespace: namespace.to_string(),
            access,
        }
    }

    #[test]
    fn name_resolution_rules() {
        let (_dir, engine) = engine();
        let dispatcher = Dispatcher::new(&engine);
        let host = identity("/", "", AccessLevel::SuperUser);

        assert_eq!(dispatcher.resolve_name(&host, "/").unwrap(), "/");
        assert_eq!(dispatcher.resolve_name(&host, "a/b").unwrap(), "a/b");
        assert_eq!(dispatcher.resolve_name(&host, "/porto/x").unwrap(), "x");
        assert_eq!(dispatcher.resolve_name(&host, "/porto").unwrap(), "/");

        let nested = identity("a/b", "a/", AccessLevel::Normal);
        assert_eq!(dispatcher.resolve_name(&nested, "self").unwrap(), "a/b");
        assert_eq!(dispatcher.resolve_name(&nested, "self/c").unwrap(), "a/b/c");
        assert_eq!(dispatcher.resolve_name(&nested, "x").unwrap(), "a/x");
        assert_eq!(dispatcher.resolve_name(&nested, ".").unwrap(), "a");
        // The client's own ancestor is readable even outside the prefix.
        assert_eq!(dispatcher.resolve_name(&nested, "/porto/a").unwrap(), "a");
        // A sibling namespace is not.
        assert!(dispatcher.resolve_name(&nested, "/porto/b").is_err());
    }

    #[test]
    fn read_only_clients_cannot_mutate() {
        let (_dir, engine) = engine();
        let dispatcher = Dispatcher::new(&engine);
        let reader = identity("/", "", AccessLevel::ReadOnly);
        assert!(matches!(
            dispatcher.create(&reader, "a", None),
            Err(PortoError::Permission { .. })
        ));
    }

    #[test]
    fn create_and_list_through_dispatcher() {
        let (_dir, engine) = engine();
        let dispatcher = Dispatcher::new(&engine);
        let admin = identity("/", "", AccessLevel::SuperUser);

        dispatcher.create(&admin, "a", None).unwrap();
        dispatcher.create(&admin, "a/b", None).unwrap();
        assert!(engine.tree.contains("a/b"));

        // A namespaced client sees only its prefix, names rewritten.
        let nested = identity("a", "a/", AccessLevel::Normal);
        assert_eq!(dispatcher.display_name(&nested, "a/b"), "b");
    }

    #[test]
    fn convert_path_between_roots() {
        let (_dir, engine) = engine();
        let dispatcher = Dispatcher::new(&engine);
        let admin = identity("/", "", AccessLevel::SuperUser);
        dispatcher.create(&admin, "a", None).unwrap();
        engine
            .tree
            .find("a")
            .unwrap()
            .write()
            .props
            .set("root", "/place/rootfs")
            .unwrap();

        assert_eq!(
            dispatcher.convert_path("/tmp/x", "a", "/").unwrap(),
            "/place/rootfs/tmp/x"
        );
        assert_eq!(
            dispatcher.convert_path("/place/rootfs/tmp/x", "/", "a").unwrap(),
            "/tmp/x"
        );
        assert!(dispatcher.convert_path("/etc", "/", "a").is_err());
    }

    #[test]
    fn comm_check_guards_pid_reuse() {
        assert!(check_comm(std::process::id() as i32, "").is_ok());
        assert!(check_comm(std::process::id() as i32, "definitely-not").is_err());
    }
}
