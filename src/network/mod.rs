//! Network Module
//!
//! Moves encoded replication messages between mesh bases. Delivery is
//! one-way: a transport only sends; whatever it receives is pushed into the
//! node's inbound channel and matched to requests by the proxy layer.

mod client;
mod frame;
mod memory;
mod server;

pub use client::{NetworkClient, TcpTransport};
pub use frame::{FrameCodec, FrameHeader};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use server::NetworkServer;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::MeshBaseConfig;
use crate::error::{Error, Result};
use crate::identifier::{IdentifierResolver, NodeIdentifier};

/// Sends encoded messages to peers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one encoded message to `peer`.
    ///
    /// An error means the peer is considered unreachable.
    async fn send(&self, peer: &NodeIdentifier, payload: Bytes) -> Result<()>;
}

/// Maps node identifiers to socket addresses
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    addresses: HashMap<NodeIdentifier, String>,
    default_port: u16,
}

impl AddressBook {
    pub fn new(default_port: u16) -> Self {
        Self {
            addresses: HashMap::new(),
            default_port,
        }
    }

    /// Build from the `[[peers]]` table of a configuration
    pub fn from_config(config: &MeshBaseConfig, resolver: &IdentifierResolver) -> Result<Self> {
        let mut book = Self::new(config.transport.default_port);
        for peer in &config.peers {
            let identifier = resolver.guess(&peer.identifier)?;
            book.insert(identifier, peer.address.clone());
        }
        Ok(book)
    }

    pub fn insert(&mut self, node: NodeIdentifier, address: impl Into<String>) {
        self.addresses.insert(node, address.into());
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Socket address for a node; falls back to its host and the default port
    pub fn address_for(&self, node: &NodeIdentifier) -> Result<String> {
        if let Some(address) = self.addresses.get(node) {
            return Ok(address.clone());
        }
        let url = url::Url::parse(node.canonical_form())
            .map_err(|e| Error::Network(format!("{}: {}", node, e)))?;
        let host = url.host_str().ok_or_else(|| Error::PeerUnreachable {
            peer: node.to_string(),
            reason: "identifier has no host and no configured address".into(),
        })?;
        let port = url.port().unwrap_or(self.default_port);
        Ok(format!("{}:{}", host, port))
    }
}
