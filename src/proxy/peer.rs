//! Peer Proxy
//!
//! The local stand-in for one remote mesh base. A proxy numbers outgoing
//! messages, drops duplicate or stray incoming ones, answers requests and
//! matches responses to the callers waiting for them.
//!
//! All state lives behind one async mutex so a message is applied, answered
//! and its waiter woken as a single step with respect to other messages on
//! the same proxy.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::codec::WireCodec;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::identifier::{AccessPath, EntityId, NodeIdentifier};
use crate::replication::{now_millis, ReplicationMessage, ReplicationMessageBuilder};
use crate::state::{ConsistencyEngine, Fanout};

/// Request ids of a new proxy start above any id a previous session with
/// the same peer could have reached.
fn initial_request_id() -> u64 {
    (now_millis().max(0) as u64) << 10
}

struct ProxyState {
    last_sent_request_id: u64,
    last_received_request_id: u64,
    last_sent: Option<ReplicationMessage>,
    last_received: Option<ReplicationMessage>,
    pending: HashMap<u64, oneshot::Sender<ReplicationMessage>>,
    replicas: BTreeSet<EntityId>,
    consecutive_timeouts: u32,
}

/// What the caller must still do after a message was received
#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    /// Messages for other peers
    pub fanout: Fanout,
    /// First-time requests to obtain from further hops on the sender's behalf
    pub deferred: Vec<AccessPath>,
    /// The peer ceased communications
    pub ceased: bool,
}

/// Local representative of a remote mesh base
pub struct Proxy {
    local: NodeIdentifier,
    peer: NodeIdentifier,
    codec: WireCodec,
    config: ProxyConfig,
    outbound: mpsc::UnboundedSender<Bytes>,
    ceased: AtomicBool,
    state: Mutex<ProxyState>,
}

impl Proxy {
    /// Create a proxy whose encoded messages go to `outbound` in send order
    pub fn new(
        local: NodeIdentifier,
        peer: NodeIdentifier,
        codec: WireCodec,
        config: ProxyConfig,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        Self {
            local,
            peer,
            codec,
            config,
            outbound,
            ceased: AtomicBool::new(false),
            state: Mutex::new(ProxyState {
                last_sent_request_id: initial_request_id(),
                last_received_request_id: 0,
                last_sent: None,
                last_received: None,
                pending: HashMap::new(),
                replicas: BTreeSet::new(),
                consecutive_timeouts: 0,
            }),
        }
    }

    pub fn peer(&self) -> &NodeIdentifier {
        &self.peer
    }

    pub fn is_ceased(&self) -> bool {
        self.ceased.load(Ordering::SeqCst)
    }

    pub async fn last_sent_request_id(&self) -> u64 {
        self.state.lock().await.last_sent_request_id
    }

    pub async fn last_received_request_id(&self) -> u64 {
        self.state.lock().await.last_received_request_id
    }

    pub async fn last_sent(&self) -> Option<ReplicationMessage> {
        self.state.lock().await.last_sent.clone()
    }

    pub async fn last_received(&self) -> Option<ReplicationMessage> {
        self.state.lock().await.last_received.clone()
    }

    /// Replicas whose home, lock or dependents go through this proxy
    pub async fn associated_replicas(&self) -> Vec<EntityId> {
        self.state.lock().await.replicas.iter().cloned().collect()
    }

    /// Record replicas as reached through this proxy
    pub async fn associate(&self, entities: impl IntoIterator<Item = EntityId>) {
        self.state.lock().await.replicas.extend(entities);
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_ceased() {
            return Err(Error::Ceased(self.peer.to_string()));
        }
        Ok(())
    }

    /// Stamp, encode and enqueue a message; returns its request id
    fn send_locked(&self, state: &mut ProxyState, mut builder: ReplicationMessageBuilder) -> Result<u64> {
        let request_id = state.last_sent_request_id + 1;
        builder.set_request_id(request_id);
        builder.set_sender(Some(self.local.clone()));
        builder.set_receiver(Some(self.peer.clone()));
        let message = builder.build();

        let bytes = self.codec.encode(&message)?;
        self.outbound
            .send(Bytes::from(bytes))
            .map_err(|_| Error::Ceased(self.peer.to_string()))?;

        tracing::trace!("-> {} {}", self.peer, message.summary());
        state.last_sent_request_id = request_id;
        state.last_sent = Some(message);
        Ok(request_id)
    }

    /// Send a message without waiting for an answer
    pub async fn send_message(&self, builder: ReplicationMessageBuilder) -> Result<u64> {
        self.ensure_live()?;
        let mut state = self.state.lock().await;
        self.send_locked(&mut state, builder)
    }

    /// Send a message and wait for the message answering it.
    ///
    /// By the time this returns, the answer has been applied to the local
    /// replicas.
    pub async fn request(&self, builder: ReplicationMessageBuilder) -> Result<ReplicationMessage> {
        self.ensure_live()?;
        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut state = self.state.lock().await;
            let request_id = self.send_locked(&mut state, builder)?;
            state.pending.insert(request_id, tx);
            request_id
        };

        match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Ceased(self.peer.to_string())),
            Err(_) => {
                let mut state = self.state.lock().await;
                state.pending.remove(&request_id);
                state.consecutive_timeouts += 1;
                let max = self.config.max_consecutive_timeouts;
                tracing::warn!(
                    "Request {} to {} timed out ({} in a row)",
                    request_id,
                    self.peer,
                    state.consecutive_timeouts
                );
                if max > 0 && state.consecutive_timeouts >= max {
                    Err(Error::PeerUnreachable {
                        peer: self.peer.to_string(),
                        reason: format!("{} consecutive request timeouts", state.consecutive_timeouts),
                    })
                } else {
                    Err(Error::RequestTimeout {
                        peer: self.peer.to_string(),
                        request_id,
                    })
                }
            }
        }
    }

    /// Handle a message from the peer: deduplicate, apply, answer, wake
    pub async fn on_message_received(
        &self,
        message: ReplicationMessage,
        engine: &ConsistencyEngine,
    ) -> Result<ReceiveOutcome> {
        self.ensure_live()?;
        let mut state = self.state.lock().await;

        if message.request_id() <= state.last_received_request_id {
            tracing::debug!(
                "Dropping duplicate message {} from {} (last {})",
                message.request_id(),
                self.peer,
                state.last_received_request_id
            );
            return Ok(ReceiveOutcome::default());
        }
        if let Some(response_id) = message.response_id() {
            if response_id > state.last_sent_request_id {
                tracing::warn!(
                    "Dropping message from {} answering unsent request {}",
                    self.peer,
                    response_id
                );
                return Ok(ReceiveOutcome::default());
            }
        }

        tracing::trace!("<- {} {}", self.peer, message.summary());
        state.last_received_request_id = message.request_id();
        state.consecutive_timeouts = 0;

        let incoming = engine.process_incoming(&self.peer, &message);
        for entity in &incoming.released {
            state.replicas.remove(entity);
        }
        state.replicas.extend(incoming.associated);

        if message.requests_anything() {
            let mut reply = incoming.response;
            reply.set_response_id(Some(message.request_id()));
            if let Err(e) = self.send_locked(&mut state, reply) {
                tracing::warn!("Failed to answer {} from {}: {}", message.request_id(), self.peer, e);
            }
        }

        if let Some(waiter) = message.response_id().and_then(|id| state.pending.remove(&id)) {
            let _ = waiter.send(message.clone());
        }

        let ceased = message.cease_communications();
        state.last_received = Some(message);
        if ceased {
            tracing::info!("{} ceased communications", self.peer);
            self.cease_locked(&mut state, engine);
        }

        Ok(ReceiveOutcome {
            fanout: incoming.fanout,
            deferred: incoming.deferred,
            ceased,
        })
    }

    /// Stop talking to the peer and orphan every replica reached through it
    pub async fn cease(&self, engine: &ConsistencyEngine, notify_peer: bool) {
        let mut state = self.state.lock().await;
        if self.is_ceased() {
            return;
        }
        if notify_peer {
            let builder = ReplicationMessage::builder().cease_communications(true);
            if let Err(e) = self.send_locked(&mut state, builder) {
                tracing::debug!("Could not tell {} we are ceasing: {}", self.peer, e);
            }
        }
        self.cease_locked(&mut state, engine);
    }

    fn cease_locked(&self, state: &mut ProxyState, engine: &ConsistencyEngine) {
        self.ceased.store(true, Ordering::SeqCst);
        let replicas: Vec<EntityId> = std::mem::take(&mut state.replicas).into_iter().collect();
        engine.orphan(&self.peer, &replicas);
        // dropping the senders wakes every waiter with Ceased
        state.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::identifier::IdentifierResolver;
    use crate::state::{InMemoryReplicaStore, LockStatus};
    use std::sync::Arc;
    use std::time::Duration;

    fn node(name: &str) -> NodeIdentifier {
        NodeIdentifier::from_canonical(format!("http://{}/", name))
    }

    fn codec() -> WireCodec {
        WireCodec::new(Arc::new(IdentifierResolver::new(&ResolverConfig::default())))
    }

    struct Side {
        proxy: Arc<Proxy>,
        outbox: mpsc::UnboundedReceiver<Bytes>,
        engine: ConsistencyEngine,
    }

    fn side(local: &str, peer: &str, config: ProxyConfig) -> Side {
        let (tx, rx) = mpsc::unbounded_channel();
        Side {
            proxy: Arc::new(Proxy::new(node(local), node(peer), codec(), config, tx)),
            outbox: rx,
            engine: ConsistencyEngine::new(node(local), Arc::new(InMemoryReplicaStore::new())),
        }
    }

    fn next_sent(side: &mut Side) -> ReplicationMessage {
        let bytes = side.outbox.try_recv().expect("nothing was sent");
        codec().decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_request_ids_increase() {
        let mut a = side("a", "b", ProxyConfig::default());
        let first = a.proxy.send_message(ReplicationMessage::builder()).await.unwrap();
        let second = a.proxy.send_message(ReplicationMessage::builder()).await.unwrap();
        assert_eq!(second, first + 1);

        let sent = next_sent(&mut a);
        assert_eq!(sent.request_id(), first);
        assert_eq!(sent.sender(), Some(&node("a")));
        assert_eq!(sent.receiver(), Some(&node("b")));
    }

    #[tokio::test]
    async fn test_duplicates_and_stray_responses_are_dropped() {
        let mut b = side("b", "a", ProxyConfig::default());
        b.engine.create(EntityId::from("e1"), 1).unwrap();

        let mut builder = ReplicationMessage::builder().request_id(5).sender(node("a"));
        builder.add_requested_first_time_object(AccessPath::local(EntityId::from("e1")));
        let request = builder.build();

        b.proxy.on_message_received(request.clone(), &b.engine).await.unwrap();
        let reply = next_sent(&mut b);
        assert_eq!(reply.response_id(), Some(5));
        assert_eq!(reply.conveyed().len(), 1);

        // same id again: no second reply
        b.proxy.on_message_received(request, &b.engine).await.unwrap();
        assert!(b.outbox.try_recv().is_err());

        let stray = ReplicationMessage::builder()
            .request_id(6)
            .response_id(u64::MAX)
            .build();
        b.proxy.on_message_received(stray, &b.engine).await.unwrap();
        assert_eq!(b.proxy.last_received_request_id().await, 5);
    }

    #[tokio::test]
    async fn test_non_request_gets_no_reply() {
        let mut b = side("b", "a", ProxyConfig::default());
        let ping = ReplicationMessage::builder().request_id(1).build();
        b.proxy.on_message_received(ping, &b.engine).await.unwrap();
        assert!(b.outbox.try_recv().is_err());
        assert!(b.proxy.last_received().await.is_some());
    }

    #[tokio::test]
    async fn test_request_resolves_after_response_applied() {
        let mut a = side("a", "b", ProxyConfig::default());
        let mut b = side("b", "a", ProxyConfig::default());
        b.engine.create(EntityId::from("e1"), 1).unwrap();

        let proxy = Arc::clone(&a.proxy);
        let mut builder = ReplicationMessage::builder();
        builder.add_requested_first_time_object(AccessPath::via(node("b"), EntityId::from("e1")));
        let waiting = tokio::spawn(async move { proxy.request(builder).await });

        tokio::task::yield_now().await;
        let request = loop {
            if let Ok(bytes) = a.outbox.try_recv() {
                break codec().decode(&bytes).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        b.proxy.on_message_received(request, &b.engine).await.unwrap();
        let reply = next_sent(&mut b);
        a.proxy.on_message_received(reply, &a.engine).await.unwrap();

        let response = waiting.await.unwrap().unwrap();
        assert_eq!(response.conveyed().len(), 1);
        assert_eq!(a.engine.lock_status(&EntityId::from("e1")), LockStatus::Remote(node("b")));
        assert_eq!(a.proxy.associated_replicas().await, vec![EntityId::from("e1")]);
    }

    #[tokio::test]
    async fn test_repeated_timeouts_mark_peer_failed() {
        let config = ProxyConfig {
            request_timeout_ms: 10,
            max_consecutive_timeouts: 2,
            ..ProxyConfig::default()
        };
        let a = side("a", "b", config);
        let first = a.proxy.request(ReplicationMessage::builder()).await.unwrap_err();
        assert!(matches!(first, Error::RequestTimeout { .. }));
        let second = a.proxy.request(ReplicationMessage::builder()).await.unwrap_err();
        assert!(second.is_peer_failure());
    }

    #[tokio::test]
    async fn test_cease_orphans_associated_replicas() {
        let mut a = side("a", "b", ProxyConfig::default());
        let snapshot = crate::replication::EntitySnapshot::new(EntityId::from("e1"), 1);
        let mut builder = ReplicationMessage::builder().request_id(1);
        builder.add_conveyed(snapshot);
        a.proxy.on_message_received(builder.build(), &a.engine).await.unwrap();

        let cease = ReplicationMessage::builder().request_id(2).cease_communications(true).build();
        let outcome = a.proxy.on_message_received(cease, &a.engine).await.unwrap();
        assert!(outcome.ceased);
        assert!(a.proxy.is_ceased());
        assert_eq!(a.engine.lock_status(&EntityId::from("e1")), LockStatus::Orphaned);
        assert!(a.proxy.send_message(ReplicationMessage::builder()).await.is_err());
        assert!(a.outbox.try_recv().is_err());
    }
}
