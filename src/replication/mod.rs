//! Replication Module
//!
//! The in-memory representation of protocol exchanges between proxies.

pub mod event;
mod message;

pub use event::{
    ChangeEvent, ChangeKind, DeletedEntity, EntitySnapshot, NeighborSnapshot, PropertySnapshot,
    TimeStamp, TypeStamp,
};
pub use message::{ReplicationMessage, ReplicationMessageBuilder};

/// Current wall-clock time in milliseconds
pub fn now_millis() -> TimeStamp {
    chrono::Utc::now().timestamp_millis()
}
