//! State Management Module
//!
//! Node-local replicas, their storage and the engine that keeps them
//! consistent with the rest of the mesh.

mod engine;
mod replica;
mod store;

pub use engine::{ConsistencyEngine, Fanout, IncomingOutcome, LocalUpdate, LockStatus, Release};
pub use replica::{Relationship, Replica, Stamped};
pub use store::{Compute, InMemoryReplicaStore, ReplicaStore};
