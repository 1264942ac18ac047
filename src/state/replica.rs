//! Replica
//!
//! A node-local copy of a shared entity. Every field carries the time it was
//! last set so concurrent changes merge last-writer-wins per field; removals
//! are kept as timestamped tombstones.

use std::collections::{BTreeMap, BTreeSet};

use crate::identifier::{EntityId, NodeIdentifier, PropertyType, TypeId};
use crate::replication::{
    ChangeEvent, ChangeKind, EntitySnapshot, NeighborSnapshot, PropertySnapshot, TimeStamp,
    TypeStamp,
};

/// A value and the time it was last set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamped<T> {
    pub value: T,
    pub time_updated: TimeStamp,
}

impl<T> Stamped<T> {
    pub fn new(value: T, time_updated: TimeStamp) -> Self {
        Self {
            value,
            time_updated,
        }
    }
}

/// Relationship to one neighbor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub present: Stamped<bool>,
    pub roles: BTreeMap<TypeId, Stamped<bool>>,
}

/// Set `slot` to `value` if `time` is strictly newer than what it holds
fn write_if_newer<K: Ord, V>(map: &mut BTreeMap<K, Stamped<V>>, key: K, value: V, time: TimeStamp) -> bool {
    match map.get(&key) {
        Some(existing) if existing.time_updated >= time => false,
        _ => {
            map.insert(key, Stamped::new(value, time));
            true
        }
    }
}

/// Local copy of an entity
#[derive(Debug, Clone, PartialEq)]
pub struct Replica {
    id: EntityId,
    time_created: TimeStamp,
    time_updated: TimeStamp,
    time_read: TimeStamp,
    time_expires: Option<TimeStamp>,
    types: BTreeMap<TypeId, Stamped<bool>>,
    properties: BTreeMap<PropertyType, Stamped<Option<String>>>,
    neighbors: BTreeMap<EntityId, Relationship>,
    give_up_lock: bool,
    /// Next hop towards the home replica; `None` if this is the home
    home_proxy: Option<NodeIdentifier>,
    /// Next hop towards the lock holder; `None` if the lock is local
    lock_proxy: Option<NodeIdentifier>,
    /// Peers replicating from this replica
    dependents: BTreeSet<NodeIdentifier>,
    /// The proxy towards home or lock has gone away
    orphaned: bool,
    /// Home is a local probe rather than a peer
    shadow: bool,
}

impl Replica {
    /// A new home replica holding its own lock
    pub fn new_home(id: EntityId, now: TimeStamp) -> Self {
        Self {
            id,
            time_created: now,
            time_updated: now,
            time_read: now,
            time_expires: None,
            types: BTreeMap::new(),
            properties: BTreeMap::new(),
            neighbors: BTreeMap::new(),
            give_up_lock: true,
            home_proxy: None,
            lock_proxy: None,
            dependents: BTreeSet::new(),
            orphaned: false,
            shadow: false,
        }
    }

    /// A dependent replica built from a snapshot received over `via`
    pub fn from_snapshot(snapshot: &EntitySnapshot, via: NodeIdentifier) -> Self {
        let mut replica = Self::new_home(snapshot.id.clone(), snapshot.time_created);
        replica.home_proxy = Some(via.clone());
        replica.lock_proxy = Some(via);
        replica.replace_content(snapshot);
        replica
    }

    /// A replica produced by a probe run for `source`
    pub fn shadow(snapshot: &EntitySnapshot, source: NodeIdentifier) -> Self {
        let mut replica = Self::from_snapshot(snapshot, source);
        replica.shadow = true;
        replica
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn time_created(&self) -> TimeStamp {
        self.time_created
    }

    pub fn time_updated(&self) -> TimeStamp {
        self.time_updated
    }

    pub fn time_read(&self) -> TimeStamp {
        self.time_read
    }

    pub fn time_expires(&self) -> Option<TimeStamp> {
        self.time_expires
    }

    pub fn set_time_expires(&mut self, expires: Option<TimeStamp>) {
        self.time_expires = expires;
    }

    pub fn touch_read(&mut self, now: TimeStamp) {
        self.time_read = self.time_read.max(now);
    }

    pub fn give_up_lock(&self) -> bool {
        self.give_up_lock
    }

    pub fn set_give_up_lock(&mut self, give_up: bool) {
        self.give_up_lock = give_up;
    }

    pub fn home_proxy(&self) -> Option<&NodeIdentifier> {
        self.home_proxy.as_ref()
    }

    pub fn lock_proxy(&self) -> Option<&NodeIdentifier> {
        self.lock_proxy.as_ref()
    }

    pub fn set_lock_proxy(&mut self, lock_proxy: Option<NodeIdentifier>) {
        self.lock_proxy = lock_proxy;
    }

    pub fn dependents(&self) -> &BTreeSet<NodeIdentifier> {
        &self.dependents
    }

    pub fn add_dependent(&mut self, peer: NodeIdentifier) -> bool {
        self.dependents.insert(peer)
    }

    pub fn remove_dependent(&mut self, peer: &NodeIdentifier) -> bool {
        self.dependents.remove(peer)
    }

    pub fn is_home(&self) -> bool {
        self.home_proxy.is_none()
    }

    pub fn has_lock(&self) -> bool {
        self.lock_proxy.is_none()
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned
    }

    pub fn is_shadow(&self) -> bool {
        self.shadow
    }

    /// Mark the replica permanently stale because `peer` went away.
    ///
    /// A home replica is never orphaned; if `peer` held its lock, the lock
    /// comes back home instead. Returns true if the replica pointed through
    /// `peer`.
    pub fn orphan_via(&mut self, peer: &NodeIdentifier) -> bool {
        let mut affected = self.dependents.remove(peer);
        if self.lock_proxy.as_ref() == Some(peer) && self.is_home() {
            self.lock_proxy = None;
            affected = true;
        } else if self.home_proxy.as_ref() == Some(peer) || self.lock_proxy.as_ref() == Some(peer) {
            self.orphaned = true;
            affected = true;
        }
        affected
    }

    /// Current value of a property; `None` if never set
    pub fn property(&self, property: &PropertyType) -> Option<Option<&str>> {
        self.properties
            .get(property)
            .map(|stamped| stamped.value.as_deref())
    }

    /// Time a property was last set
    pub fn property_time(&self, property: &PropertyType) -> Option<TimeStamp> {
        self.properties.get(property).map(|s| s.time_updated)
    }

    /// Types currently blessed
    pub fn types(&self) -> impl Iterator<Item = &TypeId> {
        self.types
            .iter()
            .filter(|(_, stamp)| stamp.value)
            .map(|(id, _)| id)
    }

    pub fn is_blessed_by(&self, type_id: &TypeId) -> bool {
        self.types.get(type_id).map(|s| s.value).unwrap_or(false)
    }

    /// Neighbors currently related
    pub fn neighbors(&self) -> impl Iterator<Item = &EntityId> {
        self.neighbors
            .iter()
            .filter(|(_, rel)| rel.present.value)
            .map(|(id, _)| id)
    }

    /// Roles currently played towards a neighbor
    pub fn roles(&self, neighbor: &EntityId) -> Vec<&TypeId> {
        match self.neighbors.get(neighbor) {
            Some(rel) if rel.present.value => rel
                .roles
                .iter()
                .filter(|(_, s)| s.value)
                .map(|(id, _)| id)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Peers that should hear about a change, excluding `except`
    pub fn related_peers(&self, except: Option<&NodeIdentifier>) -> Vec<NodeIdentifier> {
        let mut peers = BTreeSet::new();
        if !self.orphaned && !self.shadow {
            peers.extend(self.home_proxy.iter().cloned());
            peers.extend(self.lock_proxy.iter().cloned());
        }
        peers.extend(self.dependents.iter().cloned());
        if let Some(except) = except {
            peers.remove(except);
        }
        peers.into_iter().collect()
    }

    /// Apply one delta; true if any field was strictly newer
    pub fn apply_change(&mut self, change: &ChangeEvent) -> bool {
        let time = change.time_updated;
        let applied = match &change.kind {
            ChangeKind::PropertyChanged { property, value } => {
                write_if_newer(&mut self.properties, property.clone(), value.clone(), time)
            }
            ChangeKind::TypesAdded { types } => self.set_types(types, true, time),
            ChangeKind::TypesRemoved { types } => self.set_types(types, false, time),
            ChangeKind::NeighborAdded { neighbor, roles } => {
                let rel = self.relationship(neighbor);
                let mut applied = if rel.present.time_updated < time {
                    rel.present = Stamped::new(true, time);
                    true
                } else {
                    false
                };
                for role in roles {
                    applied |= write_if_newer(&mut rel.roles, role.clone(), true, time);
                }
                applied
            }
            ChangeKind::NeighborRemoved { neighbor } => {
                let rel = self.relationship(neighbor);
                if rel.present.time_updated < time {
                    rel.present = Stamped::new(false, time);
                    let roles: Vec<TypeId> = rel.roles.keys().cloned().collect();
                    for role in roles {
                        write_if_newer(&mut rel.roles, role, false, time);
                    }
                    true
                } else {
                    false
                }
            }
            ChangeKind::RolesAdded { neighbor, roles } => {
                let rel = self.relationship(neighbor);
                let mut applied = false;
                for role in roles {
                    applied |= write_if_newer(&mut rel.roles, role.clone(), true, time);
                }
                applied
            }
            ChangeKind::RolesRemoved { neighbor, roles } => {
                let rel = self.relationship(neighbor);
                let mut applied = false;
                for role in roles {
                    applied |= write_if_newer(&mut rel.roles, role.clone(), false, time);
                }
                applied
            }
        };

        if applied {
            self.time_updated = self.time_updated.max(time);
        }
        applied
    }

    fn set_types(&mut self, types: &[TypeId], value: bool, time: TimeStamp) -> bool {
        let mut applied = false;
        for type_id in types {
            applied |= write_if_newer(&mut self.types, type_id.clone(), value, time);
        }
        applied
    }

    fn relationship(&mut self, neighbor: &EntityId) -> &mut Relationship {
        self.neighbors
            .entry(neighbor.clone())
            .or_insert_with(|| Relationship {
                present: Stamped::new(false, TimeStamp::MIN),
                roles: BTreeMap::new(),
            })
    }

    /// Merge a full snapshot field by field, last writer wins
    pub fn merge_snapshot(&mut self, snapshot: &EntitySnapshot) -> bool {
        let mut applied = false;
        for stamp in &snapshot.types {
            applied |= write_if_newer(&mut self.types, stamp.id.clone(), true, stamp.time_updated);
        }
        for property in &snapshot.properties {
            applied |= write_if_newer(
                &mut self.properties,
                property.property.clone(),
                property.value.clone(),
                property.time_updated,
            );
        }
        for neighbor in &snapshot.neighbors {
            let rel = self.relationship(&neighbor.neighbor);
            if rel.present.time_updated < neighbor.time_updated {
                rel.present = Stamped::new(true, neighbor.time_updated);
                applied = true;
            }
            for role in &neighbor.roles {
                applied |= write_if_newer(&mut rel.roles, role.id.clone(), true, role.time_updated);
            }
        }
        self.time_created = self.time_created.min(snapshot.time_created);
        self.time_updated = self.time_updated.max(snapshot.time_updated);
        self.time_read = self.time_read.max(snapshot.time_read);
        if snapshot.time_expires.is_some() {
            self.time_expires = snapshot.time_expires;
        }
        applied
    }

    /// Replace all content with a snapshot, keeping proxies and dependents
    pub fn replace_content(&mut self, snapshot: &EntitySnapshot) {
        self.time_created = snapshot.time_created;
        self.time_updated = snapshot.time_updated;
        self.time_read = snapshot.time_read;
        self.time_expires = snapshot.time_expires;
        self.give_up_lock = snapshot.give_up_lock;
        self.types = snapshot
            .types
            .iter()
            .map(|s| (s.id.clone(), Stamped::new(true, s.time_updated)))
            .collect();
        self.properties = snapshot
            .properties
            .iter()
            .map(|p| (p.property.clone(), Stamped::new(p.value.clone(), p.time_updated)))
            .collect();
        self.neighbors = snapshot
            .neighbors
            .iter()
            .map(|n| {
                (
                    n.neighbor.clone(),
                    Relationship {
                        present: Stamped::new(true, n.time_updated),
                        roles: n
                            .roles
                            .iter()
                            .map(|r| (r.id.clone(), Stamped::new(true, r.time_updated)))
                            .collect(),
                    },
                )
            })
            .collect();
    }

    /// Present state as a snapshot; tombstones are not conveyed
    pub fn to_snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            id: self.id.clone(),
            time_created: self.time_created,
            time_updated: self.time_updated,
            time_read: self.time_read,
            time_expires: self.time_expires,
            give_up_lock: self.give_up_lock,
            types: self
                .types
                .iter()
                .filter(|(_, s)| s.value)
                .map(|(id, s)| TypeStamp {
                    id: id.clone(),
                    time_updated: s.time_updated,
                })
                .collect(),
            properties: self
                .properties
                .iter()
                .map(|(property, s)| PropertySnapshot {
                    property: property.clone(),
                    value: s.value.clone(),
                    time_updated: s.time_updated,
                })
                .collect(),
            neighbors: self
                .neighbors
                .iter()
                .filter(|(_, rel)| rel.present.value)
                .map(|(id, rel)| NeighborSnapshot {
                    neighbor: id.clone(),
                    roles: rel
                        .roles
                        .iter()
                        .filter(|(_, s)| s.value)
                        .map(|(role, s)| TypeStamp {
                            id: role.clone(),
                            time_updated: s.time_updated,
                        })
                        .collect(),
                    time_updated: rel.present.time_updated,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property_change(value: &str, at: TimeStamp) -> ChangeEvent {
        ChangeEvent::new(
            EntityId::from("e1"),
            at,
            ChangeKind::PropertyChanged {
                property: PropertyType::from("name"),
                value: Some(value.to_string()),
            },
        )
    }

    #[test]
    fn test_last_writer_wins_in_either_order() {
        let early = property_change("early", 1);
        let late = property_change("late", 2);

        let mut forward = Replica::new_home(EntityId::from("e1"), 0);
        assert!(forward.apply_change(&early));
        assert!(forward.apply_change(&late));

        let mut backward = Replica::new_home(EntityId::from("e1"), 0);
        assert!(backward.apply_change(&late));
        assert!(!backward.apply_change(&early));

        let name = PropertyType::from("name");
        assert_eq!(forward.property(&name), Some(Some("late")));
        assert_eq!(backward.property(&name), Some(Some("late")));
        assert_eq!(forward.time_updated(), 2);
    }

    #[test]
    fn test_concurrent_changes_to_different_fields_both_survive() {
        let mut replica = Replica::new_home(EntityId::from("e1"), 0);
        replica.apply_change(&property_change("x", 5));
        replica.apply_change(&ChangeEvent::new(
            EntityId::from("e1"),
            3,
            ChangeKind::PropertyChanged {
                property: PropertyType::from("other"),
                value: Some("y".into()),
            },
        ));
        assert_eq!(replica.property(&PropertyType::from("name")), Some(Some("x")));
        assert_eq!(replica.property(&PropertyType::from("other")), Some(Some("y")));
    }

    #[test]
    fn test_duplicate_delta_is_idempotent() {
        let mut replica = Replica::new_home(EntityId::from("e1"), 0);
        let change = property_change("x", 5);
        assert!(replica.apply_change(&change));
        let before = replica.clone();
        assert!(!replica.apply_change(&change));
        assert_eq!(replica, before);
    }

    #[test]
    fn test_removal_tombstone_beats_older_add() {
        let mut replica = Replica::new_home(EntityId::from("e1"), 0);
        let person = TypeId::from("Person");
        replica.apply_change(&ChangeEvent::new(
            EntityId::from("e1"),
            10,
            ChangeKind::TypesRemoved {
                types: vec![person.clone()],
            },
        ));
        replica.apply_change(&ChangeEvent::new(
            EntityId::from("e1"),
            5,
            ChangeKind::TypesAdded {
                types: vec![person.clone()],
            },
        ));
        assert!(!replica.is_blessed_by(&person));
    }

    #[test]
    fn test_neighbor_roles() {
        let mut replica = Replica::new_home(EntityId::from("e1"), 0);
        let e2 = EntityId::from("e2");
        replica.apply_change(&ChangeEvent::new(
            EntityId::from("e1"),
            1,
            ChangeKind::NeighborAdded {
                neighbor: e2.clone(),
                roles: vec![TypeId::from("knows")],
            },
        ));
        replica.apply_change(&ChangeEvent::new(
            EntityId::from("e1"),
            2,
            ChangeKind::RolesAdded {
                neighbor: e2.clone(),
                roles: vec![TypeId::from("likes")],
            },
        ));
        assert_eq!(replica.roles(&e2).len(), 2);

        replica.apply_change(&ChangeEvent::new(
            EntityId::from("e1"),
            3,
            ChangeKind::NeighborRemoved { neighbor: e2.clone() },
        ));
        assert_eq!(replica.neighbors().count(), 0);
        assert!(replica.roles(&e2).is_empty());
    }

    #[test]
    fn test_snapshot_round_trip_into_dependent() {
        let mut home = Replica::new_home(EntityId::from("e1"), 1);
        home.apply_change(&property_change("x", 2));
        home.apply_change(&ChangeEvent::new(
            EntityId::from("e1"),
            3,
            ChangeKind::TypesAdded {
                types: vec![TypeId::from("T")],
            },
        ));

        let via = NodeIdentifier::from_canonical("http://a.example/".to_string());
        let dependent = Replica::from_snapshot(&home.to_snapshot(), via.clone());
        assert_eq!(dependent.home_proxy(), Some(&via));
        assert_eq!(dependent.lock_proxy(), Some(&via));
        assert!(!dependent.has_lock());
        assert_eq!(dependent.to_snapshot(), home.to_snapshot());
    }

    #[test]
    fn test_orphan_via() {
        let via = NodeIdentifier::from_canonical("http://a.example/".to_string());
        let snapshot = Replica::new_home(EntityId::from("e1"), 1).to_snapshot();
        let mut dependent = Replica::from_snapshot(&snapshot, via.clone());
        assert!(dependent.orphan_via(&via));
        assert!(dependent.is_orphaned());
        assert!(dependent.related_peers(None).is_empty());
    }

    #[test]
    fn test_home_takes_lock_back_when_holder_goes_away() {
        let holder = NodeIdentifier::from_canonical("http://b.example/".to_string());
        let mut home = Replica::new_home(EntityId::from("e1"), 1);
        home.add_dependent(holder.clone());
        home.set_lock_proxy(Some(holder.clone()));

        assert!(home.orphan_via(&holder));
        assert!(!home.is_orphaned());
        assert!(home.has_lock());
        assert!(home.dependents().is_empty());
    }
}
