//! Proxy Manager
//!
//! Creates proxies on first contact with a peer. Each proxy gets an outbox
//! task that hands its encoded messages to the transport strictly in send
//! order, and an inbox channel through which received messages reach it one
//! at a time.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::peer::Proxy;
use crate::codec::WireCodec;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::identifier::NodeIdentifier;
use crate::network::Transport;
use crate::replication::ReplicationMessage;

/// Sender half of a proxy's inbox
pub type InboxSender = mpsc::UnboundedSender<ReplicationMessage>;
/// Receiver half of a proxy's inbox, drained by the node
pub type Inbox = mpsc::UnboundedReceiver<ReplicationMessage>;
/// Transport failures reported by outbox tasks
pub type FailureSender = mpsc::UnboundedSender<(NodeIdentifier, Error)>;

struct ProxyEntry {
    proxy: Arc<Proxy>,
    inbox: InboxSender,
}

/// Registry of live proxies
pub struct ProxyManager {
    local: NodeIdentifier,
    codec: WireCodec,
    config: ProxyConfig,
    transport: Arc<dyn Transport>,
    failures: FailureSender,
    proxies: RwLock<HashMap<NodeIdentifier, ProxyEntry>>,
}

impl ProxyManager {
    pub fn new(
        local: NodeIdentifier,
        codec: WireCodec,
        config: ProxyConfig,
        transport: Arc<dyn Transport>,
        failures: FailureSender,
    ) -> Self {
        Self {
            local,
            codec,
            config,
            transport,
            failures,
            proxies: RwLock::new(HashMap::new()),
        }
    }

    /// Existing proxy for a peer
    pub fn get(&self, peer: &NodeIdentifier) -> Option<Arc<Proxy>> {
        self.proxies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|entry| Arc::clone(&entry.proxy))
    }

    /// Proxy for a peer, created on first use.
    ///
    /// When the proxy is new its inbox receiver is returned as well; the
    /// caller must drain it.
    pub fn obtain(&self, peer: &NodeIdentifier) -> Result<(Arc<Proxy>, Option<Inbox>)> {
        if *peer == self.local {
            return Err(Error::Protocol(format!("refusing to proxy to ourselves ({})", peer)));
        }
        if let Some(proxy) = self.get(peer) {
            return Ok((proxy, None));
        }

        let mut proxies = self.proxies.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = proxies.get(peer) {
            return Ok((Arc::clone(&entry.proxy), None));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let proxy = Arc::new(Proxy::new(
            self.local.clone(),
            peer.clone(),
            self.codec.clone(),
            self.config.clone(),
            outbound_tx,
        ));
        self.spawn_outbox(peer.clone(), outbound_rx);

        tracing::debug!("Created proxy for {}", peer);
        proxies.insert(
            peer.clone(),
            ProxyEntry {
                proxy: Arc::clone(&proxy),
                inbox: inbox_tx,
            },
        );
        Ok((proxy, Some(inbox_rx)))
    }

    fn spawn_outbox(&self, peer: NodeIdentifier, mut outbound: mpsc::UnboundedReceiver<Bytes>) {
        let transport = Arc::clone(&self.transport);
        let failures = self.failures.clone();
        tokio::spawn(async move {
            while let Some(payload) = outbound.recv().await {
                if let Err(e) = transport.send(&peer, payload).await {
                    tracing::warn!("Transport to {} failed: {}", peer, e);
                    let _ = failures.send((peer.clone(), e));
                    break;
                }
            }
            tracing::trace!("Outbox for {} closed", peer);
        });
    }

    /// Queue a received message for its proxy's inbox
    pub fn deliver(&self, peer: &NodeIdentifier, message: ReplicationMessage) -> Result<()> {
        let proxies = self.proxies.read().unwrap_or_else(PoisonError::into_inner);
        let entry = proxies
            .get(peer)
            .ok_or_else(|| Error::Internal(format!("no proxy for {}", peer)))?;
        entry
            .inbox
            .send(message)
            .map_err(|_| Error::Ceased(peer.to_string()))
    }

    /// Forget a proxy; its tasks wind down once drained
    pub fn remove(&self, peer: &NodeIdentifier) -> Option<Arc<Proxy>> {
        self.proxies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
            .map(|entry| entry.proxy)
    }

    /// Remove and return every proxy
    pub fn drain(&self) -> Vec<Arc<Proxy>> {
        self.proxies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry.proxy)
            .collect()
    }

    pub fn peers(&self) -> Vec<NodeIdentifier> {
        self.proxies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::identifier::IdentifierResolver;
    use crate::network::MemoryNetwork;

    fn node(name: &str) -> NodeIdentifier {
        NodeIdentifier::from_canonical(format!("http://{}/", name))
    }

    fn manager(network: &MemoryNetwork, local: &str) -> (ProxyManager, mpsc::UnboundedReceiver<(NodeIdentifier, Error)>) {
        let (transport, _rx) = network.register(&node(local), 16);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let codec = WireCodec::new(Arc::new(IdentifierResolver::new(&ResolverConfig::default())));
        (
            ProxyManager::new(node(local), codec, ProxyConfig::default(), Arc::new(transport), failures_tx),
            failures_rx,
        )
    }

    #[tokio::test]
    async fn test_obtain_creates_once() {
        let network = MemoryNetwork::new();
        let (manager, _failures) = manager(&network, "a");

        let (first, inbox) = manager.obtain(&node("b")).unwrap();
        assert!(inbox.is_some());
        let (second, inbox) = manager.obtain(&node("b")).unwrap();
        assert!(inbox.is_none());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.peers(), vec![node("b")]);

        assert!(manager.obtain(&node("a")).is_err());
    }

    #[tokio::test]
    async fn test_outbox_reports_transport_failure() {
        let network = MemoryNetwork::new();
        let (manager, mut failures) = manager(&network, "a");
        let (proxy, _inbox) = manager.obtain(&node("nobody")).unwrap();

        proxy.send_message(ReplicationMessage::builder()).await.unwrap();
        let (peer, error) = failures.recv().await.unwrap();
        assert_eq!(peer, node("nobody"));
        assert!(error.is_peer_failure());
    }

    #[tokio::test]
    async fn test_deliver_reaches_inbox() {
        let network = MemoryNetwork::new();
        let (manager, _failures) = manager(&network, "a");
        let (_proxy, inbox) = manager.obtain(&node("b")).unwrap();
        let mut inbox = inbox.unwrap();

        manager
            .deliver(&node("b"), ReplicationMessage::builder().request_id(3).build())
            .unwrap();
        assert_eq!(inbox.recv().await.unwrap().request_id(), 3);

        assert!(manager.remove(&node("b")).is_some());
        assert!(manager.deliver(&node("b"), ReplicationMessage::default()).is_err());
        assert!(manager.is_empty());
    }
}
