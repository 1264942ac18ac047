//! In-process Transport
//!
//! Connects mesh bases living in the same process. Used by tests and by
//! embedders that run several bases side by side. Nodes can be cut off to
//! simulate peer failure.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::Transport;
use crate::error::{Error, Result};
use crate::identifier::NodeIdentifier;

#[derive(Default)]
struct Hub {
    inboxes: HashMap<NodeIdentifier, mpsc::Sender<Bytes>>,
    disconnected: HashSet<NodeIdentifier>,
}

/// Shared hub of in-process nodes
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<RwLock<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, returning its transport and inbound channel
    pub fn register(&self, node: &NodeIdentifier, capacity: usize) -> (MemoryTransport, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut hub = self.hub.write().unwrap_or_else(PoisonError::into_inner);
        hub.inboxes.insert(node.clone(), tx);
        hub.disconnected.remove(node);
        let transport = MemoryTransport {
            local: node.clone(),
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Cut a node off: every send to or from it fails
    pub fn disconnect(&self, node: &NodeIdentifier) {
        self.hub
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .disconnected
            .insert(node.clone());
    }

    /// Undo [`disconnect`](Self::disconnect)
    pub fn reconnect(&self, node: &NodeIdentifier) {
        self.hub
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .disconnected
            .remove(node);
    }

    fn route(&self, from: &NodeIdentifier, to: &NodeIdentifier) -> Result<mpsc::Sender<Bytes>> {
        let hub = self.hub.read().unwrap_or_else(PoisonError::into_inner);
        if hub.disconnected.contains(from) || hub.disconnected.contains(to) {
            return Err(Error::PeerUnreachable {
                peer: to.to_string(),
                reason: "disconnected".into(),
            });
        }
        hub.inboxes.get(to).cloned().ok_or_else(|| Error::PeerUnreachable {
            peer: to.to_string(),
            reason: "no such node".into(),
        })
    }
}

/// Transport endpoint of one node on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    local: NodeIdentifier,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: &NodeIdentifier, payload: Bytes) -> Result<()> {
        let inbox = self.network.route(&self.local, peer)?;
        inbox.send(payload).await.map_err(|_| Error::PeerUnreachable {
            peer: peer.to_string(),
            reason: "inbound channel closed".into(),
        })
    }
}
