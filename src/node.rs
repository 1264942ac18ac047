//! Mesh Base Node
//!
//! The application-facing handle of one mesh base. It owns the consistency
//! engine and the proxies, routes inbound frames to the right proxy and turns
//! local operations into replication traffic.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::WireCodec;
use crate::config::{MeshBaseConfig, ProxyConfig};
use crate::error::{Error, Result};
use crate::identifier::{AccessPath, EntityId, IdentifierResolver, NodeIdentifier, PropertyType, TypeId};
use crate::network::Transport;
use crate::proxy::{Inbox, Proxy, ProxyManager};
use crate::replication::{
    now_millis, ChangeKind, EntitySnapshot, ReplicationMessage, ReplicationMessageBuilder, TimeStamp,
};
use crate::state::{ConsistencyEngine, Fanout, InMemoryReplicaStore, LockStatus, Replica, ReplicaStore};

type FailureReceiver = mpsc::UnboundedReceiver<(NodeIdentifier, Error)>;

struct Shared {
    identifier: NodeIdentifier,
    resolver: Arc<IdentifierResolver>,
    codec: WireCodec,
    engine: Arc<ConsistencyEngine>,
    proxies: ProxyManager,
    config: ProxyConfig,
    failures: Mutex<Option<FailureReceiver>>,
    shutdown: watch::Sender<bool>,
}

/// One mesh base
#[derive(Clone)]
pub struct MeshBase {
    shared: Arc<Shared>,
}

impl MeshBase {
    /// Create a node.
    ///
    /// Nothing is received until [`start`](Self::start) is called with the
    /// channel the transport delivers into.
    pub fn new(
        identifier: NodeIdentifier,
        resolver: Arc<IdentifierResolver>,
        config: ProxyConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ReplicaStore>,
    ) -> Self {
        let codec = WireCodec::new(Arc::clone(&resolver));
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let engine = Arc::new(ConsistencyEngine::new(identifier.clone(), store));
        let proxies = ProxyManager::new(
            identifier.clone(),
            codec.clone(),
            config.clone(),
            transport,
            failures_tx,
        );

        Self {
            shared: Arc::new(Shared {
                identifier,
                resolver,
                codec,
                engine,
                proxies,
                config,
                failures: Mutex::new(Some(failures_rx)),
                shutdown,
            }),
        }
    }

    /// Create a node from configuration with an in-memory replica store
    pub fn from_config(config: &MeshBaseConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let resolver = Arc::new(IdentifierResolver::new(&config.resolver));
        let identifier = resolver.guess(&config.node.identifier)?;
        Ok(Self::new(
            identifier,
            resolver,
            config.proxy.clone(),
            transport,
            Arc::new(InMemoryReplicaStore::new()),
        ))
    }

    pub fn identifier(&self) -> &NodeIdentifier {
        &self.shared.identifier
    }

    pub fn resolver(&self) -> &Arc<IdentifierResolver> {
        &self.shared.resolver
    }

    pub fn engine(&self) -> &Arc<ConsistencyEngine> {
        &self.shared.engine
    }

    /// Peers with a live proxy
    pub fn peers(&self) -> Vec<NodeIdentifier> {
        self.shared.proxies.peers()
    }

    /// Proxy for a peer, if one exists
    pub fn proxy(&self, peer: &NodeIdentifier) -> Option<Arc<Proxy>> {
        self.shared.proxies.get(peer)
    }

    /// Flips to `true` once [`shutdown`](Self::shutdown) is called
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    /// Start consuming frames delivered by the transport
    pub fn start(&self, mut inbound: mpsc::Receiver<Bytes>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let mut failures = self
            .shared
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut shutdown = self.shared.shutdown.subscribe();
        tracing::info!("Mesh base {} started", self.shared.identifier);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = inbound.recv() => {
                        let Some(frame) = frame else { break };
                        let Some(shared) = weak.upgrade() else { break };
                        shared.receive_frame(&frame);
                    }
                    Some((peer, error)) = next_failure(&mut failures) => {
                        let Some(shared) = weak.upgrade() else { break };
                        tracing::warn!("Peer {} failed: {}", peer, error);
                        shared.peer_failed(&peer).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Receive loop stopped");
        })
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Replica held here, without any network traffic
    pub fn find_replica(&self, id: &EntityId) -> Option<Arc<Replica>> {
        self.shared.engine.replica(id)
    }

    /// Replica at the end of an access path, obtaining it over the first
    /// hop if it is not held here yet. `None` if no node along the path
    /// knows the entity.
    pub async fn access_locally(&self, path: &AccessPath) -> Result<Option<Arc<Replica>>> {
        self.shared.obtain(path).await
    }

    /// Like [`access_locally`](Self::access_locally) with the path given as
    /// raw hop strings
    pub async fn access_locally_via(&self, hops: &[&str], target: &str) -> Result<Option<Arc<Replica>>> {
        let path = self.shared.resolver.compose_path(None, hops, target, None)?;
        self.shared.obtain(&path).await
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Create a new entity homed here
    pub fn create_entity(&self, id: impl Into<EntityId>) -> Result<Arc<Replica>> {
        let replica = self.shared.engine.create(id.into(), now_millis())?;
        tracing::debug!("Created entity {}", replica.id());
        Ok(replica)
    }

    /// Wait until the write lock of `id` is held here.
    ///
    /// Asks the current holder once and then waits for the lock to arrive,
    /// up to the configured lock wait timeout.
    pub async fn acquire_lock(&self, id: &EntityId) -> Result<()> {
        let deadline = Instant::now() + self.shared.config.lock_wait_timeout();
        self.shared.acquire_lock(id, deadline).await
    }

    /// Open a transaction on an entity whose lock is already held here
    pub fn begin_transaction(&self, id: &EntityId) -> Result<Transaction> {
        self.shared.engine.begin_transaction(id)?;
        Ok(Transaction {
            shared: Arc::clone(&self.shared),
            entity: id.clone(),
            finished: false,
        })
    }

    /// Acquire the lock and open a transaction
    pub async fn transaction(&self, id: &EntityId) -> Result<Transaction> {
        let deadline = Instant::now() + self.shared.config.lock_wait_timeout();
        loop {
            self.shared.acquire_lock(id, deadline).await?;
            match self.begin_transaction(id) {
                // lock moved on between acquiring and opening; try again
                Err(Error::LockUnavailable { .. }) if Instant::now() < deadline => continue,
                other => return other,
            }
        }
    }

    async fn mutate(&self, id: &EntityId, kinds: Vec<ChangeKind>) -> Result<Arc<Replica>> {
        let transaction = self.transaction(id).await?;
        let result = transaction.apply(kinds).await;
        transaction.commit().await;
        result
    }

    /// Set or clear a property
    pub async fn set_property(
        &self,
        id: &EntityId,
        property: impl Into<PropertyType>,
        value: Option<String>,
    ) -> Result<Arc<Replica>> {
        self.mutate(
            id,
            vec![ChangeKind::PropertyChanged {
                property: property.into(),
                value,
            }],
        )
        .await
    }

    /// Add entity types
    pub async fn bless(&self, id: &EntityId, types: Vec<TypeId>) -> Result<Arc<Replica>> {
        self.mutate(id, vec![ChangeKind::TypesAdded { types }]).await
    }

    /// Remove entity types
    pub async fn unbless(&self, id: &EntityId, types: Vec<TypeId>) -> Result<Arc<Replica>> {
        self.mutate(id, vec![ChangeKind::TypesRemoved { types }]).await
    }

    /// Relate to a neighbor playing the given roles
    pub async fn relate(&self, id: &EntityId, neighbor: EntityId, roles: Vec<TypeId>) -> Result<Arc<Replica>> {
        self.mutate(id, vec![ChangeKind::NeighborAdded { neighbor, roles }]).await
    }

    /// Remove the relationship to a neighbor
    pub async fn unrelate(&self, id: &EntityId, neighbor: EntityId) -> Result<Arc<Replica>> {
        self.mutate(id, vec![ChangeKind::NeighborRemoved { neighbor }]).await
    }

    pub async fn add_roles(&self, id: &EntityId, neighbor: EntityId, roles: Vec<TypeId>) -> Result<Arc<Replica>> {
        self.mutate(id, vec![ChangeKind::RolesAdded { neighbor, roles }]).await
    }

    pub async fn remove_roles(&self, id: &EntityId, neighbor: EntityId, roles: Vec<TypeId>) -> Result<Arc<Replica>> {
        self.mutate(id, vec![ChangeKind::RolesRemoved { neighbor, roles }]).await
    }

    /// Delete an entity everywhere
    pub async fn delete_entity(&self, id: &EntityId) -> Result<()> {
        let transaction = self.transaction(id).await?;
        let deleted = match self.shared.engine.delete_local(id, now_millis()) {
            Ok(fanout) => {
                tracing::debug!("Deleted entity {}", id);
                self.shared.dispatch(fanout).await;
                Ok(())
            }
            Err(e) => Err(e),
        };
        transaction.commit().await;
        deleted
    }

    /// Whether the lock on `id` may be handed to peers that ask for it
    pub fn set_give_up_lock(&self, id: &EntityId, give_up: bool) -> Result<()> {
        self.shared.engine.set_give_up_lock(id, give_up)
    }

    /// Let the sweeper evict a dependent replica once `expires` has passed
    pub fn set_expiry(&self, id: &EntityId, expires: Option<TimeStamp>) -> Result<()> {
        self.shared.engine.set_expiry(id, expires)
    }

    /// Take the write lock back at the home replica
    pub async fn reclaim_lock(&self, id: &EntityId) -> Result<()> {
        let Some(holder) = self.shared.engine.reclaim_local(id)? else {
            return Ok(());
        };
        let proxy = self.shared.proxy_for(&holder)?;
        let mut builder = ReplicationMessage::builder();
        builder.add_reclaimed_lock(id.clone());
        proxy.send_message(builder).await?;
        Ok(())
    }

    /// Refresh a dependent replica wholesale from its home
    pub async fn resynchronize(&self, id: &EntityId) -> Result<Arc<Replica>> {
        let replica = self
            .find_replica(id)
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;
        if replica.is_orphaned() {
            return Err(Error::NoHome(id.to_string()));
        }
        if replica.is_shadow() {
            return Err(Error::Protocol(format!("{} is maintained by a probe", id)));
        }
        let Some(home) = replica.home_proxy().cloned() else {
            return Err(Error::Protocol(format!("{} is the home replica", id)));
        };

        let mut builder = ReplicationMessage::builder();
        builder.add_requested_resynchronize(id.clone());
        self.shared.request(&home, builder).await?;
        self.find_replica(id)
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))
    }

    /// Drop a dependent replica and tell its home to stop sending deltas
    pub async fn release_replica(&self, id: &EntityId) -> Result<()> {
        let release = self.shared.engine.release_local(id)?;
        let Some(home) = release.home else {
            return Ok(());
        };

        let mut builder = ReplicationMessage::builder();
        if release.returned_lock {
            builder.add_pushed_lock(id.clone());
        }
        builder.add_requested_canceled_object(id.clone());
        let proxy = self.shared.proxy_for(&home)?;
        proxy.send_message(builder).await?;
        tracing::debug!("Released replica {}", id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Install a probe batch as shadow replicas
    pub async fn apply_probe_batch(&self, source: &NodeIdentifier, snapshots: &[EntitySnapshot]) {
        let fanout = self.shared.engine.apply_shadow_batch(source, snapshots);
        self.shared.dispatch(fanout).await;
    }

    /// Evict expired dependent replicas; returns how many went
    pub async fn sweep(&self) -> usize {
        let evicted = self.shared.engine.sweep(now_millis());
        let count = evicted.len();

        let mut cancellations: BTreeMap<NodeIdentifier, Vec<EntityId>> = BTreeMap::new();
        for (id, home) in evicted {
            if let Some(home) = home {
                cancellations.entry(home).or_default().push(id);
            }
        }
        let mut fanout = Fanout::default();
        for (home, ids) in cancellations {
            let builder = fanout.entry(home);
            for id in ids {
                builder.add_requested_canceled_object(id);
            }
        }
        self.shared.dispatch(fanout).await;
        count
    }

    /// Tell every peer we are going away and stop receiving
    pub async fn shutdown(&self) {
        tracing::info!("Mesh base {} shutting down", self.shared.identifier);
        self.shared.shutdown.send_replace(true);
        for proxy in self.shared.proxies.drain() {
            proxy.cease(&self.shared.engine, true).await;
        }
    }
}

async fn next_failure(failures: &mut Option<FailureReceiver>) -> Option<(NodeIdentifier, Error)> {
    match failures {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Shared {
    /// Proxy for a peer, spawning its inbox task on first contact
    fn proxy_for(self: &Arc<Self>, peer: &NodeIdentifier) -> Result<Arc<Proxy>> {
        if self.engine.is_shadow_source(peer) {
            return Err(Error::Protocol(format!("{} is a probe source, not a peer", peer)));
        }
        if let Some(existing) = self.proxies.get(peer) {
            if !existing.is_ceased() {
                return Ok(existing);
            }
            self.proxies.remove(peer);
        }
        let (proxy, inbox) = self.proxies.obtain(peer)?;
        if let Some(inbox) = inbox {
            self.spawn_inbox(Arc::clone(&proxy), inbox);
        }
        Ok(proxy)
    }

    fn spawn_inbox(self: &Arc<Self>, proxy: Arc<Proxy>, mut inbox: Inbox) {
        let weak: Weak<Shared> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                shared.handle_message(&proxy, message).await;
            }
            tracing::trace!("Inbox for {} closed", proxy.peer());
        });
    }

    fn receive_frame(self: &Arc<Self>, frame: &[u8]) {
        let message = match self.codec.decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Discarding undecodable message: {}", e);
                return;
            }
        };
        let Some(sender) = message.sender().cloned() else {
            tracing::warn!("Discarding message without sender: {}", message.summary());
            return;
        };
        if let Some(receiver) = message.receiver() {
            if *receiver != self.identifier {
                tracing::warn!("Discarding message from {} addressed to {}", sender, receiver);
                return;
            }
        }
        if sender == self.identifier {
            tracing::warn!("Discarding message claiming to come from ourselves");
            return;
        }

        let result = self
            .proxy_for(&sender)
            .and_then(|_| self.proxies.deliver(&sender, message));
        if let Err(e) = result {
            tracing::warn!("Could not route message from {}: {}", sender, e);
        }
    }

    async fn handle_message(self: &Arc<Self>, proxy: &Arc<Proxy>, message: ReplicationMessage) {
        match proxy.on_message_received(message, &self.engine).await {
            Ok(outcome) => {
                self.dispatch(outcome.fanout).await;
                for path in outcome.deferred {
                    self.spawn_forward(proxy.peer().clone(), path);
                }
                if outcome.ceased {
                    self.proxies.remove(proxy.peer());
                }
            }
            Err(e) => tracing::debug!("Message from {} not processed: {}", proxy.peer(), e),
        }
    }

    /// Send accumulated messages, each to its peer
    async fn dispatch(self: &Arc<Self>, fanout: Fanout) {
        for (peer, builder) in fanout.into_messages() {
            if builder.is_empty() {
                continue;
            }
            let result = match self.proxy_for(&peer) {
                Ok(proxy) => proxy.send_message(builder).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!("Could not send to {}: {}", peer, e);
            }
        }
    }

    /// Obtain an entity further along a path on behalf of `requester`, then
    /// convey it
    fn spawn_forward(self: &Arc<Self>, requester: NodeIdentifier, path: AccessPath) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let target = path.target().clone();
            match shared.obtain(&path).await {
                Ok(Some(_)) => {
                    let Some(snapshot) = shared.engine.convey_to(&target, &requester) else {
                        return;
                    };
                    let result = match shared.proxy_for(&requester) {
                        Ok(proxy) => {
                            proxy.associate([target.clone()]).await;
                            let mut builder = ReplicationMessage::builder();
                            builder.add_conveyed(snapshot);
                            proxy.send_message(builder).await.map(|_| ())
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        tracing::warn!("Could not convey {} to {}: {}", target, requester, e);
                    }
                }
                Ok(None) => tracing::debug!("{} not found along {} for {}", target, path, requester),
                Err(e) => tracing::warn!("Forwarding {} for {} failed: {}", path, requester, e),
            }
        });
    }

    /// Send a request and treat peer failure like a cease
    async fn request(
        self: &Arc<Self>,
        peer: &NodeIdentifier,
        builder: ReplicationMessageBuilder,
    ) -> Result<ReplicationMessage> {
        let proxy = self.proxy_for(peer)?;
        match proxy.request(builder).await {
            Err(e) if e.is_peer_failure() => {
                self.peer_failed(peer).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn obtain(self: &Arc<Self>, path: &AccessPath) -> Result<Option<Arc<Replica>>> {
        let path = path.strip_leading(&self.identifier);
        let target = path.target().clone();
        if let Some(replica) = self.engine.replica(&target) {
            return Ok(Some(replica));
        }
        let Some(hop) = path.first_hop().cloned() else {
            return Ok(None);
        };

        let mut changes = self.engine.subscribe_lock_changes();
        let mut builder = ReplicationMessage::builder();
        builder.add_requested_first_time_object(path.clone());
        self.request(&hop, builder).await?;

        if let Some(replica) = self.engine.replica(&target) {
            return Ok(Some(replica));
        }
        if path.hops().len() < 2 {
            return Ok(None);
        }

        // the intermediary conveys separately once it has obtained the entity
        let deadline = Instant::now() + self.config.request_timeout();
        loop {
            let _ = changes.borrow_and_update();
            if let Some(replica) = self.engine.replica(&target) {
                return Ok(Some(replica));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return Ok(None),
            }
        }
    }

    async fn acquire_lock(self: &Arc<Self>, id: &EntityId, deadline: Instant) -> Result<()> {
        let mut changes = self.engine.subscribe_lock_changes();
        let mut asked: Option<NodeIdentifier> = None;

        loop {
            let _ = changes.borrow_and_update();
            let holder = match self.engine.lock_status(id) {
                LockStatus::Local => return Ok(()),
                LockStatus::Missing => return Err(Error::EntityNotFound(id.to_string())),
                LockStatus::Orphaned => return Err(Error::NoHome(id.to_string())),
                LockStatus::Shadow => {
                    return Err(Error::lock_unavailable(id.as_str(), "replica is maintained by a probe"))
                }
                LockStatus::Remote(holder) => holder,
            };

            if asked.as_ref() != Some(&holder) {
                asked = Some(holder.clone());
                let mut builder = ReplicationMessage::builder();
                builder.add_requested_lock(id.clone());
                match self.request(&holder, builder).await {
                    Ok(_) => continue,
                    Err(e) if e.is_peer_failure() => continue,
                    Err(e) => return Err(Error::lock_unavailable(id.as_str(), e.to_string())),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => {
                    return Err(Error::lock_unavailable(
                        id.as_str(),
                        format!("{} did not hand over the lock in time", holder),
                    ))
                }
            }
        }
    }

    /// Tear down a proxy whose peer is gone
    async fn peer_failed(self: &Arc<Self>, peer: &NodeIdentifier) {
        if let Some(proxy) = self.proxies.remove(peer) {
            proxy.cease(&self.engine, false).await;
        }
    }

    /// Hand a queued lock to its next holder
    async fn hand_over_lock(self: &Arc<Self>, entity: EntityId, next: NodeIdentifier) {
        let result = match self.proxy_for(&next) {
            Ok(proxy) => {
                proxy.associate([entity.clone()]).await;
                let mut builder = ReplicationMessage::builder();
                builder.add_pushed_lock(entity.clone());
                proxy.send_message(builder).await.map(|_| ())
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("Could not hand lock on {} to {}: {}", entity, next, e);
        }
    }
}

/// A local transaction on one entity.
///
/// While open, lock requests from peers are queued instead of granted. The
/// first queued peer receives the lock when the last transaction on the
/// entity ends. Prefer [`commit`](Self::commit); dropping the guard also ends
/// the transaction but hands the lock over on a background task.
pub struct Transaction {
    shared: Arc<Shared>,
    entity: EntityId,
    finished: bool,
}

impl Transaction {
    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    /// Apply changes to the entity and propagate them
    pub async fn apply(&self, kinds: Vec<ChangeKind>) -> Result<Arc<Replica>> {
        let update = self.shared.engine.apply_local(&self.entity, kinds, now_millis())?;
        tracing::trace!("Applied {} change(s) to {}", update.events.len(), self.entity);
        self.shared.dispatch(update.fanout).await;
        Ok(update.replica)
    }

    /// End the transaction
    pub async fn commit(mut self) {
        self.finished = true;
        if let Some(next) = self.shared.engine.end_transaction(&self.entity) {
            self.shared.hand_over_lock(self.entity.clone(), next).await;
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(next) = self.shared.engine.end_transaction(&self.entity) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(&self.shared);
                let entity = self.entity.clone();
                handle.spawn(async move { shared.hand_over_lock(entity, next).await });
            }
            Err(_) => tracing::error!(
                "Lock on {} was granted to {} outside a runtime; it will not be delivered",
                self.entity,
                next
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::network::MemoryNetwork;

    fn mesh(network: &MemoryNetwork, name: &str) -> MeshBase {
        let resolver = Arc::new(IdentifierResolver::new(&ResolverConfig::default()));
        let identifier = resolver.guess(name).unwrap();
        let (transport, inbound) = network.register(&identifier, 64);
        let node = MeshBase::new(
            identifier,
            resolver,
            ProxyConfig {
                request_timeout_ms: 1000,
                lock_wait_timeout_ms: 1000,
                max_consecutive_timeouts: 2,
            },
            Arc::new(transport),
            Arc::new(InMemoryReplicaStore::new()),
        );
        node.start(inbound);
        node
    }

    #[tokio::test]
    async fn test_local_entity_lifecycle() {
        let network = MemoryNetwork::new();
        let a = mesh(&network, "a.example");
        let e1 = EntityId::from("e1");

        a.create_entity(e1.clone()).unwrap();
        assert!(matches!(a.create_entity(e1.clone()), Err(Error::EntityExists(_))));

        let replica = a.set_property(&e1, "name", Some("x".into())).await.unwrap();
        assert_eq!(replica.property(&PropertyType::from("name")), Some(Some("x")));

        let local = a.access_locally(&AccessPath::local(e1.clone())).await.unwrap();
        assert!(local.is_some());

        a.delete_entity(&e1).await.unwrap();
        assert!(a.find_replica(&e1).is_none());
    }

    #[tokio::test]
    async fn test_transaction_guard_releases_on_drop() {
        let network = MemoryNetwork::new();
        let a = mesh(&network, "a.example");
        let e1 = EntityId::from("e1");
        a.create_entity(e1.clone()).unwrap();

        {
            let txn = a.begin_transaction(&e1).unwrap();
            assert_eq!(txn.entity(), &e1);
            assert!(a.engine().is_busy(&e1));
        }
        assert!(!a.engine().is_busy(&e1));
    }

    #[tokio::test]
    async fn test_unknown_remote_entity_is_none() {
        let network = MemoryNetwork::new();
        let a = mesh(&network, "a.example");
        let b = mesh(&network, "b.example");

        let found = a
            .access_locally(&AccessPath::via(b.identifier().clone(), EntityId::from("nope")))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_release_stops_updates() {
        let network = MemoryNetwork::new();
        let a = mesh(&network, "a.example");
        let b = mesh(&network, "b.example");
        let e1 = EntityId::from("e1");
        a.create_entity(e1.clone()).unwrap();

        b.access_locally(&AccessPath::via(a.identifier().clone(), e1.clone()))
            .await
            .unwrap()
            .unwrap();
        b.release_replica(&e1).await.unwrap();
        assert!(b.find_replica(&e1).is_none());

        // the cancellation is processed asynchronously at a
        for _ in 0..100 {
            if a.find_replica(&e1).unwrap().dependents().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(a.find_replica(&e1).unwrap().dependents().is_empty());
    }
}
