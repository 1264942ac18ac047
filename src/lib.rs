//! MeshBase - Peer-to-peer Replication Node
//!
//! A mesh base holds replicas of entities in a distributed graph-of-objects
//! store and keeps them consistent with the replicas held by its peers.
//!
//! # Architecture
//!
//! Every entity has one home replica and any number of dependent replicas on
//! other nodes. Exactly one replica holds the write lock at a time; the lock
//! moves between nodes on request. Changes travel as deltas stamped with the
//! writer's clock and are applied last-writer-wins per field.
//!
//! Each pair of communicating nodes talks through a proxy on either side.
//! Proxies number their messages, drop duplicates, match answers to the
//! requests that caused them and encode everything as XML.
//!
//! # Features
//!
//! - Access paths: reach an entity through a chain of intermediary nodes
//! - Lock hand-over with FIFO queuing while the holder is inside a transaction
//! - Delta fan-out to every related replica
//! - Orphaning of replicas when a peer ceases or becomes unreachable
//! - Resynchronization, release, lock reclaim and periodic sweeping
//! - Probes that install read-only shadow replicas from external sources

pub mod codec;
pub mod config;
pub mod error;
pub mod identifier;
pub mod network;
pub mod node;
pub mod probe;
pub mod proxy;
pub mod replication;
pub mod state;
pub mod sweeper;

pub use config::MeshBaseConfig;
pub use error::{Error, Result};
pub use node::{MeshBase, Transaction};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::MeshBaseConfig;
    pub use crate::error::{Error, Result};
    pub use crate::identifier::{AccessPath, EntityId, IdentifierResolver, NodeIdentifier, PropertyType, TypeId};
    pub use crate::network::{MemoryNetwork, TcpTransport, Transport};
    pub use crate::node::{MeshBase, Transaction};
    pub use crate::probe::{Probe, ProbeScheduler};
    pub use crate::replication::{ChangeKind, EntitySnapshot, ReplicationMessage};
    pub use crate::state::{LockStatus, Replica};
    pub use crate::sweeper::Sweeper;
}
