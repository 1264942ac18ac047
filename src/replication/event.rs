//! Replication Events
//!
//! Deltas and snapshots carried by a [`ReplicationMessage`](super::ReplicationMessage).

use crate::identifier::{EntityId, PropertyType, TypeId};

/// Milliseconds since the Unix epoch at the origin of a change
pub type TimeStamp = i64;

/// One incremental change to an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Affected entity
    pub entity: EntityId,
    /// When the change happened at its origin
    pub time_updated: TimeStamp,
    /// What changed
    pub kind: ChangeKind,
}

/// Closed set of delta kinds, fixed by the wire format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    PropertyChanged {
        property: PropertyType,
        value: Option<String>,
    },
    NeighborAdded {
        neighbor: EntityId,
        roles: Vec<TypeId>,
    },
    NeighborRemoved {
        neighbor: EntityId,
    },
    RolesAdded {
        neighbor: EntityId,
        roles: Vec<TypeId>,
    },
    RolesRemoved {
        neighbor: EntityId,
        roles: Vec<TypeId>,
    },
    TypesAdded {
        types: Vec<TypeId>,
    },
    TypesRemoved {
        types: Vec<TypeId>,
    },
}

impl ChangeKind {
    /// Name used for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ChangeKind::PropertyChanged { .. } => "PropertyChanged",
            ChangeKind::NeighborAdded { .. } => "NeighborAdded",
            ChangeKind::NeighborRemoved { .. } => "NeighborRemoved",
            ChangeKind::RolesAdded { .. } => "RolesAdded",
            ChangeKind::RolesRemoved { .. } => "RolesRemoved",
            ChangeKind::TypesAdded { .. } => "TypesAdded",
            ChangeKind::TypesRemoved { .. } => "TypesRemoved",
        }
    }
}

impl ChangeEvent {
    pub fn new(entity: EntityId, time_updated: TimeStamp, kind: ChangeKind) -> Self {
        Self {
            entity,
            time_updated,
            kind,
        }
    }
}

/// Notice that an entity was deleted at its origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedEntity {
    pub entity: EntityId,
    pub time_updated: TimeStamp,
}

/// A type or role together with the time it was last set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeStamp {
    pub id: TypeId,
    pub time_updated: TimeStamp,
}

/// A property value together with the time it was last set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySnapshot {
    pub property: PropertyType,
    pub value: Option<String>,
    pub time_updated: TimeStamp,
}

/// A relationship to a neighbor and the roles it plays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSnapshot {
    pub neighbor: EntityId,
    pub roles: Vec<TypeStamp>,
    pub time_updated: TimeStamp,
}

/// Full state of an entity, used for creation notices, conveyed replicas
/// and resynchronization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub time_created: TimeStamp,
    pub time_updated: TimeStamp,
    pub time_read: TimeStamp,
    pub time_expires: Option<TimeStamp>,
    pub give_up_lock: bool,
    pub types: Vec<TypeStamp>,
    pub properties: Vec<PropertySnapshot>,
    pub neighbors: Vec<NeighborSnapshot>,
}

impl EntitySnapshot {
    /// Empty snapshot created at `now`
    pub fn new(id: EntityId, now: TimeStamp) -> Self {
        Self {
            id,
            time_created: now,
            time_updated: now,
            time_read: now,
            time_expires: None,
            give_up_lock: true,
            types: Vec::new(),
            properties: Vec::new(),
            neighbors: Vec::new(),
        }
    }
}
