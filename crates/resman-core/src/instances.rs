use crate::instance::ResourceInstance;
use crate::CoreError;
use resman_schema::ResourceId;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

struct Entry {
    instance: ResourceInstance,
    busy: bool,
}

struct Arena {
    next_id: ResourceId,
    entries: BTreeMap<ResourceId, Entry>,
}

/// In-memory arena of resource instances.
///
/// Ids are allocated under the same lock that inserts the instance, so they
/// are strictly increasing and never reused. At most one transition holds a
/// claim on an instance at any time.
pub struct InstanceStore {
    arena: Mutex<Arena>,
}

impl Default for InstanceStore {
    fn default() -> Self {
        Self {
            arena: Mutex::new(Arena {
                next_id: ResourceId::new(1),
                entries: BTreeMap::new(),
            }),
        }
    }
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Arena>, CoreError> {
        self.arena
            .lock()
            .map_err(|_| CoreError::Lock("instance store mutex poisoned".to_owned()))
    }

    fn allocate<F>(arena: &mut Arena, build: F, busy: bool) -> ResourceId
    where
        F: FnOnce(ResourceId) -> ResourceInstance,
    {
        let id = arena.next_id;
        arena.next_id = id.next();
        let instance = build(id);
        debug!("registered resource instance {id} ({})", instance.name);
        arena.entries.insert(id, Entry { instance, busy });
        id
    }

    /// Allocate an id and insert the instance built for it.
    pub fn insert_with<F>(&self, build: F) -> Result<ResourceId, CoreError>
    where
        F: FnOnce(ResourceId) -> ResourceInstance,
    {
        let mut arena = self.lock()?;
        Ok(Self::allocate(&mut arena, build, false))
    }

    /// Like [`insert_with`](Self::insert_with), returning a claim on the new
    /// instance.
    pub fn create_claimed<F>(self: &Arc<Self>, build: F) -> Result<InstanceClaim, CoreError>
    where
        F: FnOnce(ResourceId) -> ResourceInstance,
    {
        let mut arena = self.lock()?;
        let id = Self::allocate(&mut arena, build, true);
        Ok(InstanceClaim::new(Arc::clone(self), id, true))
    }

    /// Claim the network instance matching `location`, `type_name` and
    /// `networkname`, creating it when none exists. Lookup and creation are
    /// atomic, so concurrent installs of one network yield one instance.
    pub fn find_or_create_network<F>(
        self: &Arc<Self>,
        location: &str,
        type_name: &str,
        networkname: &str,
        build: F,
    ) -> Result<InstanceClaim, CoreError>
    where
        F: FnOnce(ResourceId) -> ResourceInstance,
    {
        let mut arena = self.lock()?;
        let existing = arena
            .entries
            .iter_mut()
            .find(|(_, e)| e.instance.is_network_named(location, type_name, networkname));
        if let Some((id, entry)) = existing {
            if entry.busy {
                return Err(CoreError::ResourceBusy(id.to_string()));
            }
            entry.busy = true;
            let id = *id;
            return Ok(InstanceClaim::new(Arc::clone(self), id, false));
        }
        let id = Self::allocate(&mut arena, build, true);
        Ok(InstanceClaim::new(Arc::clone(self), id, true))
    }

    /// Take exclusive use of an existing instance.
    pub fn claim(self: &Arc<Self>, id: ResourceId) -> Result<InstanceClaim, CoreError> {
        let mut arena = self.lock()?;
        let entry = arena
            .entries
            .get_mut(&id)
            .ok_or_else(|| CoreError::InstanceNotFound(id.to_string()))?;
        if entry.busy {
            return Err(CoreError::ResourceBusy(id.to_string()));
        }
        entry.busy = true;
        Ok(InstanceClaim::new(Arc::clone(self), id, false))
    }

    pub fn get(&self, id: ResourceId) -> Result<Option<ResourceInstance>, CoreError> {
        Ok(self.lock()?.entries.get(&id).map(|e| e.instance.clone()))
    }

    /// Instance by location, name and type.
    pub fn find(
        &self,
        location: &str,
        name: &str,
        type_name: &str,
    ) -> Result<Option<ResourceInstance>, CoreError> {
        Ok(self
            .lock()?
            .entries
            .values()
            .find(|e| {
                e.instance.location == location
                    && e.instance.name == name
                    && e.instance.type_name() == type_name
            })
            .map(|e| e.instance.clone()))
    }

    /// Every instance in `location`, optionally restricted to one type.
    pub fn search(
        &self,
        location: &str,
        type_name: Option<&str>,
    ) -> Result<Vec<ResourceInstance>, CoreError> {
        Ok(self
            .lock()?
            .entries
            .values()
            .filter(|e| e.instance.location == location)
            .filter(|e| match type_name {
                Some(t) => e.instance.type_name() == t,
                None => true,
            })
            .map(|e| e.instance.clone())
            .collect())
    }

    pub fn remove(&self, id: ResourceId) -> Result<Option<ResourceInstance>, CoreError> {
        let removed = self.lock()?.entries.remove(&id).map(|e| e.instance);
        if removed.is_some() {
            debug!("removed resource instance {id}");
        }
        Ok(removed)
    }

    pub fn is_busy(&self, id: ResourceId) -> bool {
        self.lock()
            .map(|a| a.entries.get(&id).is_some_and(|e| e.busy))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|a| a.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive use of one instance for the duration of a transition. Dropping
/// the claim makes the instance available again.
pub struct InstanceClaim {
    store: Arc<InstanceStore>,
    id: ResourceId,
    created: bool,
    released: bool,
}

impl InstanceClaim {
    fn new(store: Arc<InstanceStore>, id: ResourceId, created: bool) -> Self {
        Self {
            store,
            id,
            created,
            released: false,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Whether the instance was created for this claim.
    pub fn created(&self) -> bool {
        self.created
    }

    /// A working copy of the claimed instance.
    pub fn snapshot(&self) -> Result<ResourceInstance, CoreError> {
        self.store
            .get(self.id)?
            .ok_or_else(|| CoreError::InstanceNotFound(self.id.to_string()))
    }

    /// Replace the stored instance with `instance`.
    pub fn commit(&self, instance: ResourceInstance) -> Result<(), CoreError> {
        let mut arena = self.store.lock()?;
        let entry = arena
            .entries
            .get_mut(&self.id)
            .ok_or_else(|| CoreError::InstanceNotFound(self.id.to_string()))?;
        entry.instance = instance;
        Ok(())
    }

    /// Delete the claimed instance from the store.
    pub fn remove(mut self) -> Result<Option<ResourceInstance>, CoreError> {
        self.released = true;
        self.store.remove(self.id)
    }
}

impl Drop for InstanceClaim {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut arena = self
            .store
            .arena
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = arena.entries.get_mut(&self.id) {
            entry.busy = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resman_schema::{Properties, ResourceType};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::thread;

    const NETWORK: &str = "resource::docker-network::1.0";

    fn network_type() -> Arc<ResourceType> {
        Arc::new(ResourceType::builtin_network().unwrap())
    }

    fn network(id: ResourceId, name: &str) -> ResourceInstance {
        let mut props = Properties::new();
        props.insert("networkname".to_owned(), json!(name));
        ResourceInstance::new(id, network_type(), name, "local", props)
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let store = InstanceStore::new();
        let a = store.insert_with(|id| network(id, "a")).unwrap();
        let b = store.insert_with(|id| network(id, "b")).unwrap();
        assert!(b > a);
        store.remove(b).unwrap();
        let c = store.insert_with(|id| network(id, "c")).unwrap();
        assert!(c > b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn built_instance_carries_allocated_id() {
        let store = InstanceStore::new();
        let id = store.insert_with(|id| network(id, "a")).unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().resource_id, id);
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let store = Arc::new(InstanceStore::new());
        let id = store.insert_with(|id| network(id, "a")).unwrap();

        let claim = store.claim(id).unwrap();
        assert!(!claim.created());
        assert!(store.is_busy(id));
        assert!(matches!(store.claim(id), Err(CoreError::ResourceBusy(_))));
        drop(claim);

        assert!(!store.is_busy(id));
        assert!(store.claim(id).is_ok());
    }

    #[test]
    fn claim_of_unknown_instance_fails() {
        let store = Arc::new(InstanceStore::new());
        assert!(matches!(
            store.claim(ResourceId::new(99)),
            Err(CoreError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn commit_and_remove_through_claim() {
        let store = Arc::new(InstanceStore::new());
        let claim = store.create_claimed(|id| network(id, "a")).unwrap();
        assert!(claim.created());
        let id = claim.id();

        let mut working = claim.snapshot().unwrap();
        working
            .properties
            .insert("networkid".to_owned(), json!("n-1"));
        claim.commit(working).unwrap();
        assert_eq!(
            store.get(id).unwrap().unwrap().properties["networkid"],
            json!("n-1")
        );

        claim.remove().unwrap();
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn find_or_create_network_reuses_existing_instance() {
        let store = Arc::new(InstanceStore::new());
        let first = store
            .find_or_create_network("local", NETWORK, "net1", |id| network(id, "net1"))
            .unwrap();
        assert!(first.created());
        let id = first.id();

        assert!(matches!(
            store.find_or_create_network("local", NETWORK, "net1", |id| network(id, "net1")),
            Err(CoreError::ResourceBusy(_))
        ));
        drop(first);

        let second = store
            .find_or_create_network("local", NETWORK, "net1", |id| network(id, "net1"))
            .unwrap();
        assert!(!second.created());
        assert_eq!(second.id(), id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn search_filters_by_location_and_type() {
        let store = InstanceStore::new();
        store.insert_with(|id| network(id, "a")).unwrap();
        store
            .insert_with(|id| {
                let mut inst = network(id, "b");
                inst.location = "remote".to_owned();
                inst
            })
            .unwrap();

        assert_eq!(store.search("local", None).unwrap().len(), 1);
        assert_eq!(store.search("local", Some(NETWORK)).unwrap().len(), 1);
        assert!(store.search("local", Some("resource::web::1.0")).unwrap().is_empty());
        assert!(store.find("remote", "b", NETWORK).unwrap().is_some());
        assert!(store.find("local", "b", NETWORK).unwrap().is_none());
    }

    #[test]
    fn concurrent_inserts_yield_distinct_ids() {
        let store = Arc::new(InstanceStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..25)
                        .map(|i| {
                            store
                                .insert_with(|id| network(id, &format!("n{t}-{i}")))
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = BTreeSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(ids.insert(id));
            }
        }
        assert_eq!(ids.len(), 200);
        assert_eq!(store.len(), 200);
    }
}
