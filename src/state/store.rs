//! Replica Store
//!
//! Holds the replicas known to a node. Replicas are shared as immutable
//! `Arc`s; a change clones the current value, mutates the clone and swaps it
//! in under the store's lock so readers never observe a half-applied delta.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::replica::Replica;
use crate::identifier::EntityId;

/// Outcome of a [`ReplicaStore::compute`] step
#[derive(Debug)]
pub enum Compute {
    /// Leave the slot as it is
    Keep,
    /// Store a new value
    Put(Replica),
    /// Remove the replica
    Remove,
}

/// Storage for replicas
pub trait ReplicaStore: Send + Sync {
    /// Current replica, if any
    fn get(&self, id: &EntityId) -> Option<Arc<Replica>>;

    /// Atomically inspect and replace one slot.
    ///
    /// Returns the replica stored after the step.
    fn compute(
        &self,
        id: &EntityId,
        f: &mut dyn FnMut(Option<&Replica>) -> Compute,
    ) -> Option<Arc<Replica>>;

    /// All known entity ids
    fn keys(&self) -> Vec<EntityId>;

    /// Number of replicas held
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `f` to a clone of the replica and store the result
    fn modify(&self, id: &EntityId, f: &mut dyn FnMut(&mut Replica)) -> Option<Arc<Replica>> {
        self.compute(id, &mut |current| match current {
            Some(replica) => {
                let mut next = replica.clone();
                f(&mut next);
                Compute::Put(next)
            }
            None => Compute::Keep,
        })
    }

    /// Store a replica, replacing any previous one
    fn put(&self, replica: Replica) -> Arc<Replica>;

    /// Remove a replica, returning it
    fn remove(&self, id: &EntityId) -> Option<Arc<Replica>> {
        let previous = self.get(id);
        self.compute(id, &mut |_| Compute::Remove);
        previous
    }
}

/// In-memory replica store
#[derive(Default)]
pub struct InMemoryReplicaStore {
    replicas: RwLock<HashMap<EntityId, Arc<Replica>>>,
}

impl InMemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicaStore for InMemoryReplicaStore {
    fn get(&self, id: &EntityId) -> Option<Arc<Replica>> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn put(&self, replica: Replica) -> Arc<Replica> {
        let replica = Arc::new(replica);
        self.replicas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(replica.id().clone(), Arc::clone(&replica));
        replica
    }

    fn compute(
        &self,
        id: &EntityId,
        f: &mut dyn FnMut(Option<&Replica>) -> Compute,
    ) -> Option<Arc<Replica>> {
        let mut replicas = self.replicas.write().unwrap_or_else(PoisonError::into_inner);
        let current = replicas.get(id).cloned();
        match f(current.as_deref()) {
            Compute::Keep => current,
            Compute::Put(replica) => {
                let replica = Arc::new(replica);
                replicas.insert(id.clone(), Arc::clone(&replica));
                Some(replica)
            }
            Compute::Remove => {
                replicas.remove(id);
                None
            }
        }
    }

    fn keys(&self) -> Vec<EntityId> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::PropertyType;
    use crate::replication::{ChangeEvent, ChangeKind};

    #[test]
    fn test_put_get_remove() {
        let store = InMemoryReplicaStore::new();
        assert!(store.is_empty());
        store.put(Replica::new_home(EntityId::from("e1"), 1));
        assert_eq!(store.len(), 1);
        assert!(store.get(&EntityId::from("e1")).is_some());
        assert!(store.remove(&EntityId::from("e1")).is_some());
        assert!(store.get(&EntityId::from("e1")).is_none());
    }

    #[test]
    fn test_modify_is_copy_on_write() {
        let store = InMemoryReplicaStore::new();
        let before = store.put(Replica::new_home(EntityId::from("e1"), 1));
        let after = store
            .modify(&EntityId::from("e1"), &mut |replica| {
                replica.apply_change(&ChangeEvent::new(
                    EntityId::from("e1"),
                    2,
                    ChangeKind::PropertyChanged {
                        property: PropertyType::from("p"),
                        value: Some("v".into()),
                    },
                ));
            })
            .unwrap();

        assert_eq!(before.property(&PropertyType::from("p")), None);
        assert_eq!(after.property(&PropertyType::from("p")), Some(Some("v")));
    }

    #[test]
    fn test_modify_missing_is_noop() {
        let store = InMemoryReplicaStore::new();
        assert!(store.modify(&EntityId::from("nope"), &mut |_| {}).is_none());
        assert!(store.is_empty());
    }
}
