//! Name map and arena for containers.
//!
//! A single mutex guards the name map, the id arena and all parent/child
//! linkage; individual containers carry their own locks. The root `/` and
//! the porto meta root `/porto` exist from the start and cannot be
//! destroyed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use porto_common::name::PORTO_ROOT_CONTAINER;
use porto_common::{ContainerName, Cred, IdMap, PortoError, PortoResult};

use super::{Container, ContainerState};

struct TreeInner {
    by_name: HashMap<String, Arc<Container>>,
    by_id: HashMap<u32, Arc<Container>>,
    ids: IdMap,
    max_total: u32,
}

/// The container map.
pub struct ContainerTree {
    inner: Mutex<TreeInner>,
}

impl ContainerTree {
    /// Create a tree holding at most `max_total` containers, with the
    /// root and porto-root nodes pre-created.
    #[must_use]
    pub fn new(max_total: u32) -> Self {
        let mut inner = TreeInner {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            ids: IdMap::new(max_total),
            max_total,
        };

        let root_id = inner.ids.get().expect("fresh pool");
        let root = Arc::new(Container::new(
            root_id,
            ContainerName::root(),
            None,
            Cred::root(),
            ContainerState::Meta,
        ));
        inner.by_name.insert("/".to_string(), Arc::clone(&root));
        inner.by_id.insert(root_id, Arc::clone(&root));

        let porto_id = inner.ids.get().expect("fresh pool");
        let porto_name = ContainerName::new(PORTO_ROOT_CONTAINER.trim_start_matches('/'))
            .expect("static name");
        let porto = Arc::new(Container::new(
            porto_id,
            porto_name,
            Some(root_id),
            Cred::root(),
            ContainerState::Meta,
        ));
        root.write().children.push(porto_id);
        inner
            .by_name
            .insert(porto.name().as_str().to_string(), Arc::clone(&porto));
        inner.by_id.insert(porto_id, porto);

        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Find a container by name.
    pub fn find(&self, name: &str) -> PortoResult<Arc<Container>> {
        self.inner
            .lock()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| PortoError::ContainerDoesNotExist {
                name: name.to_string(),
            })
    }

    /// Find a container by id.
    pub fn find_by_id(&self, id: u32) -> PortoResult<Arc<Container>> {
        self.inner
            .lock()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| PortoError::ContainerDoesNotExist {
                name: format!("id {id}"),
            })
    }

    /// Whether a name is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().by_name.contains_key(name)
    }

    /// Number of containers, the two roots included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().by_name.len()
    }

    /// Create a container in Stopped state under an existing parent.
    pub fn create(&self, name: &ContainerName, owner: Cred) -> PortoResult<Arc<Container>> {
        let mut inner = self.inner.lock();

        if inner.by_name.contains_key(name.as_str()) {
            return Err(PortoError::ContainerAlreadyExists {
                name: name.as_str().to_string(),
            });
        }
        if inner.by_name.len() as u32 >= inner.max_total {
            return Err(PortoError::ResourceNotAvailable {
                message: format!("container limit {} reached", inner.max_total),
            });
        }

        let parent_name = name.parent().ok_or_else(|| PortoError::InvalidValue {
            message: "cannot create the root container".to_string(),
        })?;
        let parent = inner
            .by_name
            .get(parent_name.as_str())
            .cloned()
            .ok_or_else(|| PortoError::ContainerDoesNotExist {
                name: parent_name.as_str().to_string(),
            })?;

        let id = inner.ids.get()?;
        let container = Arc::new(Container::new(
            id,
            name.clone(),
            Some(parent.id()),
            owner,
            ContainerState::Stopped,
        ));

        parent.write().children.push(id);
        inner
            .by_name
            .insert(name.as_str().to_string(), Arc::clone(&container));
        inner.by_id.insert(id, Arc::clone(&container));

        tracing::info!(container = %name, id, "container created");
        Ok(container)
    }

    /// Re-insert a restored container with its persisted id.
    pub fn restore(
        &self,
        name: &ContainerName,
        id: u32,
        owner: Cred,
        state: ContainerState,
    ) -> PortoResult<Arc<Container>> {
        let mut inner = self.inner.lock();

        if inner.by_name.contains_key(name.as_str()) {
            return Err(PortoError::ContainerAlreadyExists {
                name: name.as_str().to_string(),
            });
        }
        let parent_name = name.parent().ok_or_else(|| PortoError::InvalidValue {
            message: "cannot restore the root container".to_string(),
        })?;
        let parent = inner
            .by_name
            .get(parent_name.as_str())
            .cloned()
            .ok_or_else(|| PortoError::ContainerDoesNotExist {
                name: parent_name.as_str().to_string(),
            })?;

        inner.ids.get_at(id)?;
        let container = Arc::new(Container::new(id, name.clone(), Some(parent.id()), owner, state));

        parent.write().children.push(id);
        inner
            .by_name
            .insert(name.as_str().to_string(), Arc::clone(&container));
        inner.by_id.insert(id, Arc::clone(&container));
        Ok(container)
    }

    /// Unlink a leaf container and free its id.
    ///
    /// The node is removed from the name map first, then its id returns
    /// to the pool; both happen under the tree lock. Non-leaf removal is
    /// a caller bug surfaced as invalid-state.
    pub fn remove(&self, container: &Arc<Container>) -> PortoResult<()> {
        let mut inner = self.inner.lock();

        if !container.read().children.is_empty() {
            return Err(PortoError::InvalidState {
                message: format!("container {} still has children", container.name()),
            });
        }

        if let Some(parent_id) = container.parent_id() {
            if let Some(parent) = inner.by_id.get(&parent_id).cloned() {
                parent.write().children.retain(|&c| c != container.id());
            }
        }

        inner.by_name.remove(container.name().as_str());
        inner.by_id.remove(&container.id());
        inner.ids.put(container.id());

        tracing::info!(container = %container.name(), id = container.id(), "container removed");
        Ok(())
    }

    /// Every container, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Container>> {
        let mut all: Vec<_> = self.inner.lock().by_name.values().cloned().collect();
        all.sort_by(|a, b| a.name().as_str().cmp(b.name().as_str()));
        all
    }

    /// A container and its descendants, parents before children.
    #[must_use]
    pub fn subtree(&self, container: &Arc<Container>) -> Vec<Arc<Container>> {
        let inner = self.inner.lock();
        let mut result = vec![Arc::clone(container)];
        let mut index = 0;
        while index < result.len() {
            let children: Vec<u32> = result[index].read().children.clone();
            for id in children {
                if let Some(child) = inner.by_id.get(&id) {
                    result.push(Arc::clone(child));
                }
            }
            index += 1;
        }
        result
    }

    /// Direct children of a container.
    #[must_use]
    pub fn children(&self, container: &Arc<Container>) -> Vec<Arc<Container>> {
        let inner = self.inner.lock();
        container
            .read()
            .children
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> ContainerTree {
        ContainerTree::new(100)
    }

    #[test]
    fn roots_exist_from_start() {
        let tree = tree();
        assert!(tree.contains("/"));
        assert!(tree.contains("porto"));
        assert_eq!(tree.count(), 2);
        assert_eq!(tree.find("/").unwrap().state(), ContainerState::Meta);
    }

    #[test]
    fn create_links_parent_and_child() {
        let tree = tree();
        let a = tree.create(&ContainerName::new("a").unwrap(), Cred::root()).unwrap();
        let ab = tree.create(&ContainerName::new("a/b").unwrap(), Cred::root()).unwrap();

        assert_eq!(ab.parent_id(), Some(a.id()));
        assert!(a.read().children.contains(&ab.id()));
        // Tree consistency: parent is resolvable and lists the child.
        let parent = tree.find_by_id(ab.parent_id().unwrap()).unwrap();
        assert_eq!(parent.name().as_str(), "a");
    }

    #[test]
    fn create_requires_parent() {
        let tree = tree();
        assert!(matches!(
            tree.create(&ContainerName::new("a/b").unwrap(), Cred::root()),
            Err(PortoError::ContainerDoesNotExist { .. })
        ));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let tree = tree();
        let name = ContainerName::new("a").unwrap();
        tree.create(&name, Cred::root()).unwrap();
        assert!(matches!(
            tree.create(&name, Cred::root()),
            Err(PortoError::ContainerAlreadyExists { .. })
        ));
    }

    #[test]
    fn count_limit_is_enforced() {
        let tree = ContainerTree::new(3);
        tree.create(&ContainerName::new("a").unwrap(), Cred::root()).unwrap();
        assert!(matches!(
            tree.create(&ContainerName::new("b").unwrap(), Cred::root()),
            Err(PortoError::ResourceNotAvailable { .. })
        ));
    }

    #[test]
    fn remove_frees_name_and_id() {
        let tree = tree();
        let a = tree.create(&ContainerName::new("a").unwrap(), Cred::root()).unwrap();
        let id = a.id();
        tree.remove(&a).unwrap();
        assert!(!tree.contains("a"));

        // The id is reusable.
        let b = tree.create(&ContainerName::new("b").unwrap(), Cred::root()).unwrap();
        assert_eq!(b.id(), id);
    }

    #[test]
    fn remove_refuses_non_leaf() {
        let tree = tree();
        let a = tree.create(&ContainerName::new("a").unwrap(), Cred::root()).unwrap();
        tree.create(&ContainerName::new("a/b").unwrap(), Cred::root()).unwrap();
        assert!(matches!(
            tree.remove(&a),
            Err(PortoError::InvalidState { .. })
        ));
    }

    #[test]
    fn subtree_is_parents_first() {
        let tree = tree();
        tree.create(&ContainerName::new("a").unwrap(), Cred::root()).unwrap();
        tree.create(&ContainerName::new("a/b").unwrap(), Cred::root()).unwrap();
        tree.create(&ContainerName::new("a/b/c").unwrap(), Cred::root()).unwrap();
        tree.create(&ContainerName::new("a/d").unwrap(), Cred::root()).unwrap();

        let a = tree.find("a").unwrap();
        let names: Vec<String> = tree
            .subtree(&a)
            .iter()
            .map(|c| c.name().as_str().to_string())
            .collect();
        assert_eq!(names[0], "a");
        assert!(names.contains(&"a/b/c".to_string()));
        assert_eq!(names.len(), 4);
        let b_pos = names.iter().position(|n| n == "a/b").unwrap();
        let c_pos = names.iter().position(|n| n == "a/b/c").unwrap();
        assert!(b_pos < c_pos);
    }

    #[test]
    fn restore_claims_persisted_id() {
        let tree = tree();
        let a = tree
            .restore(
                &ContainerName::new("a").unwrap(),
                42,
                Cred::new(1000, 1000),
                ContainerState::Dead,
            )
            .unwrap();
        assert_eq!(a.id(), 42);
        assert_eq!(a.state(), ContainerState::Dead);
        assert!(tree
            .restore(
                &ContainerName::new("b").unwrap(),
                42,
                Cred::root(),
                ContainerState::Stopped
            )
            .is_err());
    }
}
