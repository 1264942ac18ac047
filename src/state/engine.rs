//! Consistency Engine
//!
//! Applies incoming replication messages to the local replicas, answers the
//! requests they carry and works out which peers must hear about each
//! accepted change. It also owns the local side of the single-writer lock:
//! which entities are inside a transaction and who is queued for their lock.
//!
//! The engine never performs I/O. Everything it wants sent is returned to the
//! caller as message builders keyed by peer.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::watch;

use super::replica::Replica;
use super::store::{Compute, ReplicaStore};
use crate::error::{Error, Result};
use crate::identifier::{AccessPath, EntityId, NodeIdentifier};
use crate::replication::{
    now_millis, ChangeEvent, ChangeKind, DeletedEntity, EntitySnapshot, ReplicationMessage,
    ReplicationMessageBuilder, TimeStamp,
};

/// Where the write lock of a replica currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// Held here
    Local,
    /// Held beyond the given proxy
    Remote(NodeIdentifier),
    /// The proxy towards home or lock went away
    Orphaned,
    /// Maintained by a probe; never writable
    Shadow,
    /// No replica here
    Missing,
}

/// Outbound messages accumulated per peer
#[derive(Debug, Default)]
pub struct Fanout {
    messages: BTreeMap<NodeIdentifier, ReplicationMessageBuilder>,
}

impl Fanout {
    /// Builder for the message to `peer`
    pub fn entry(&mut self, peer: NodeIdentifier) -> &mut ReplicationMessageBuilder {
        self.messages.entry(peer).or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &NodeIdentifier> {
        self.messages.keys()
    }

    pub fn into_messages(self) -> impl Iterator<Item = (NodeIdentifier, ReplicationMessageBuilder)> {
        self.messages.into_iter()
    }
}

/// What processing one incoming message produced
#[derive(Debug, Default)]
pub struct IncomingOutcome {
    /// Answer content for the sender, sent iff the message requested anything
    pub response: ReplicationMessageBuilder,
    /// Replicas that now point through the sender
    pub associated: Vec<EntityId>,
    /// Replicas that no longer point through the sender
    pub released: Vec<EntityId>,
    /// Changes to forward to other peers
    pub fanout: Fanout,
    /// First-time requests that must be obtained from a further hop
    pub deferred: Vec<AccessPath>,
}

/// Result of a local mutation
#[derive(Debug)]
pub struct LocalUpdate {
    pub replica: Arc<Replica>,
    pub events: Vec<ChangeEvent>,
    pub fanout: Fanout,
}

/// Result of releasing a dependent replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Proxy towards home, if it is still reachable
    pub home: Option<NodeIdentifier>,
    /// The lock was held here and must go back to home
    pub returned_lock: bool,
}

#[derive(Debug, Default)]
struct LockTable {
    /// Open transaction count per entity
    busy: HashMap<EntityId, usize>,
    /// Peers waiting for the lock, oldest first
    queues: HashMap<EntityId, VecDeque<NodeIdentifier>>,
}

enum PushVerdict {
    Unknown,
    Accepted,
    Duplicate,
    Rejected(NodeIdentifier),
}

enum LockVerdict {
    Unknown,
    Granted,
    Queued,
    Kept,
    NotHolder(Option<NodeIdentifier>),
}

/// Replica consistency engine for one node
pub struct ConsistencyEngine {
    local: NodeIdentifier,
    store: Arc<dyn ReplicaStore>,
    locks: Mutex<LockTable>,
    shadow_sources: RwLock<BTreeSet<NodeIdentifier>>,
    lock_epoch: watch::Sender<u64>,
}

impl ConsistencyEngine {
    pub fn new(local: NodeIdentifier, store: Arc<dyn ReplicaStore>) -> Self {
        let (lock_epoch, _) = watch::channel(0);
        Self {
            local,
            store,
            locks: Mutex::new(LockTable::default()),
            shadow_sources: RwLock::new(BTreeSet::new()),
            lock_epoch,
        }
    }

    pub fn local(&self) -> &NodeIdentifier {
        &self.local
    }

    pub fn replica(&self, id: &EntityId) -> Option<Arc<Replica>> {
        self.store.get(id)
    }

    pub fn entities(&self) -> Vec<EntityId> {
        self.store.keys()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Receiver that changes whenever a lock moves or a replica is orphaned
    pub fn subscribe_lock_changes(&self) -> watch::Receiver<u64> {
        self.lock_epoch.subscribe()
    }

    fn bump_lock_epoch(&self) {
        self.lock_epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    fn lock_table(&self) -> MutexGuard<'_, LockTable> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_status(&self, id: &EntityId) -> LockStatus {
        match self.store.get(id) {
            None => LockStatus::Missing,
            Some(r) if r.is_shadow() => LockStatus::Shadow,
            Some(r) if r.is_orphaned() => LockStatus::Orphaned,
            Some(r) => match r.lock_proxy() {
                None => LockStatus::Local,
                Some(holder) => LockStatus::Remote(holder.clone()),
            },
        }
    }

    /// Peers queued for the lock on `id`
    pub fn queued_lock_requests(&self, id: &EntityId) -> Vec<NodeIdentifier> {
        self.lock_table()
            .queues
            .get(id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_busy(&self, id: &EntityId) -> bool {
        self.lock_table().busy.contains_key(id)
    }

    pub fn is_shadow_source(&self, node: &NodeIdentifier) -> bool {
        self.shadow_sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(node)
    }

    fn check_writable(replica: &Replica) -> Result<()> {
        if replica.is_shadow() {
            return Err(Error::lock_unavailable(
                replica.id().as_str(),
                "replica is maintained by a probe",
            ));
        }
        if replica.is_orphaned() {
            return Err(Error::NoHome(replica.id().to_string()));
        }
        if let Some(holder) = replica.lock_proxy() {
            return Err(Error::lock_unavailable(
                replica.id().as_str(),
                format!("lock is held via {}", holder),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Incoming messages
    // ------------------------------------------------------------------

    /// Apply a message received from `peer`
    pub fn process_incoming(&self, peer: &NodeIdentifier, message: &ReplicationMessage) -> IncomingOutcome {
        let mut outcome = IncomingOutcome::default();

        for snapshot in message.created().iter().chain(message.conveyed()) {
            self.accept_snapshot(peer, snapshot, &mut outcome);
        }
        for snapshot in message.resynchronized() {
            self.accept_resynchronized(peer, snapshot, &mut outcome);
        }
        for deleted in message.deleted() {
            self.accept_deleted(peer, deleted, &mut outcome);
        }
        for change in message.changes() {
            self.accept_change(peer, change, &mut outcome);
        }
        for entity in message.reclaimed_locks() {
            self.accept_reclaimed_lock(peer, entity, &mut outcome);
        }
        for entity in message.pushed_locks() {
            self.accept_pushed_lock(peer, entity);
        }
        for entity in message.requested_canceled_objects() {
            self.accept_cancel(peer, entity, &mut outcome);
        }
        for path in message.requested_first_time_objects() {
            self.answer_first_time(peer, path, &mut outcome);
        }
        for entity in message.requested_resynchronize() {
            self.answer_resynchronize(peer, entity, &mut outcome);
        }
        for entity in message.requested_locks() {
            self.answer_lock_request(peer, entity, &mut outcome);
        }

        outcome
    }

    fn accept_snapshot(&self, peer: &NodeIdentifier, snapshot: &EntitySnapshot, outcome: &mut IncomingOutcome) {
        let mut created = false;
        let mut dependents = Vec::new();
        self.store.compute(&snapshot.id, &mut |current| match current {
            None => {
                created = true;
                Compute::Put(Replica::from_snapshot(snapshot, peer.clone()))
            }
            Some(existing) => {
                let mut next = existing.clone();
                if next.merge_snapshot(snapshot) {
                    dependents = next.dependents().iter().filter(|d| *d != peer).cloned().collect();
                    Compute::Put(next)
                } else {
                    Compute::Keep
                }
            }
        });

        if created {
            tracing::debug!("Replica {} established via {}", snapshot.id, peer);
            outcome.associated.push(snapshot.id.clone());
            self.bump_lock_epoch();
        }
        for dependent in dependents {
            outcome.fanout.entry(dependent).add_conveyed(snapshot.clone());
        }
    }

    fn accept_resynchronized(&self, peer: &NodeIdentifier, snapshot: &EntitySnapshot, outcome: &mut IncomingOutcome) {
        let mut created = false;
        let mut dependents = Vec::new();
        self.store.compute(&snapshot.id, &mut |current| match current {
            None => {
                created = true;
                Compute::Put(Replica::from_snapshot(snapshot, peer.clone()))
            }
            Some(existing) => {
                let mut next = existing.clone();
                next.replace_content(snapshot);
                dependents = next.dependents().iter().filter(|d| *d != peer).cloned().collect();
                Compute::Put(next)
            }
        });

        tracing::debug!("Replica {} resynchronized from {}", snapshot.id, peer);
        if created {
            outcome.associated.push(snapshot.id.clone());
            self.bump_lock_epoch();
        }
        for dependent in dependents {
            outcome.fanout.entry(dependent).add_resynchronized(snapshot.clone());
        }
    }

    fn accept_deleted(&self, peer: &NodeIdentifier, deleted: &DeletedEntity, outcome: &mut IncomingOutcome) {
        let mut removed = false;
        let mut related = Vec::new();
        self.store.compute(&deleted.entity, &mut |current| match current {
            Some(replica) if deleted.time_updated >= replica.time_updated() => {
                removed = true;
                related = replica.related_peers(Some(peer));
                Compute::Remove
            }
            _ => Compute::Keep,
        });

        if !removed {
            tracing::debug!("Ignoring stale or unknown deletion of {} from {}", deleted.entity, peer);
            return;
        }

        tracing::info!("Replica {} deleted by {}", deleted.entity, peer);
        self.lock_table().queues.remove(&deleted.entity);
        outcome.released.push(deleted.entity.clone());
        for other in related {
            outcome.fanout.entry(other).add_deleted(deleted.clone());
        }
        self.bump_lock_epoch();
    }

    fn accept_change(&self, peer: &NodeIdentifier, change: &ChangeEvent, outcome: &mut IncomingOutcome) {
        let mut known = false;
        let mut related = Vec::new();
        self.store.compute(&change.entity, &mut |current| match current {
            Some(replica) => {
                known = true;
                let mut next = replica.clone();
                if next.apply_change(change) {
                    related = next.related_peers(Some(peer));
                    Compute::Put(next)
                } else {
                    Compute::Keep
                }
            }
            None => Compute::Keep,
        });

        if !known {
            tracing::debug!(
                "Dropping {} for unknown entity {} from {}",
                change.kind.type_name(),
                change.entity,
                peer
            );
            return;
        }
        for other in related {
            outcome.fanout.entry(other).add_change(change.clone());
        }
    }

    fn accept_reclaimed_lock(&self, peer: &NodeIdentifier, entity: &EntityId, outcome: &mut IncomingOutcome) {
        let mut was_holder = false;
        let updated = self.store.modify(entity, &mut |replica| {
            was_holder = replica.has_lock();
            replica.set_lock_proxy(Some(peer.clone()));
        });

        if updated.is_none() {
            tracing::warn!("Lock reclaim for unknown entity {} from {}", entity, peer);
            return;
        }
        if was_holder {
            tracing::warn!("Lock on {} reclaimed by {}", entity, peer);
        }
        self.lock_table().queues.remove(entity);
        outcome.associated.push(entity.clone());
        self.bump_lock_epoch();
    }

    fn accept_pushed_lock(&self, peer: &NodeIdentifier, entity: &EntityId) {
        let mut verdict = PushVerdict::Unknown;
        self.store.compute(entity, &mut |current| {
            let Some(replica) = current else {
                return Compute::Keep;
            };
            match replica.lock_proxy() {
                Some(holder) if holder == peer => {
                    verdict = PushVerdict::Accepted;
                    let mut next = replica.clone();
                    next.set_lock_proxy(None);
                    Compute::Put(next)
                }
                Some(holder) => {
                    verdict = PushVerdict::Rejected(holder.clone());
                    Compute::Keep
                }
                None => {
                    verdict = PushVerdict::Duplicate;
                    Compute::Keep
                }
            }
        });

        match verdict {
            PushVerdict::Accepted => {
                tracing::info!("Lock on {} received from {}", entity, peer);
                self.bump_lock_epoch();
            }
            PushVerdict::Duplicate => {
                tracing::debug!("Duplicate lock push for {} from {}", entity, peer);
            }
            PushVerdict::Rejected(holder) => {
                tracing::warn!(
                    "Rejecting lock push for {} from {}: lock is recorded via {}",
                    entity,
                    peer,
                    holder
                );
            }
            PushVerdict::Unknown => {
                tracing::warn!("Lock push for unknown entity {} from {}", entity, peer);
            }
        }
    }

    fn accept_cancel(&self, peer: &NodeIdentifier, entity: &EntityId, outcome: &mut IncomingOutcome) {
        let mut still_associated = false;
        let updated = self.store.modify(entity, &mut |replica| {
            replica.remove_dependent(peer);
            still_associated =
                replica.home_proxy() == Some(peer) || replica.lock_proxy() == Some(peer);
        });
        if updated.is_some() {
            tracing::debug!("{} stopped replicating {}", peer, entity);
            if !still_associated {
                outcome.released.push(entity.clone());
            }
        }
    }

    fn answer_first_time(&self, peer: &NodeIdentifier, path: &AccessPath, outcome: &mut IncomingOutcome) {
        let path = path.strip_leading(&self.local);
        if !path.is_local() {
            outcome.deferred.push(path);
            return;
        }

        let target = path.target();
        let mut snapshot = None;
        let mut orphaned = false;
        self.store.compute(target, &mut |current| match current {
            Some(replica) if replica.is_orphaned() => {
                orphaned = true;
                Compute::Keep
            }
            Some(replica) => {
                let mut next = replica.clone();
                next.add_dependent(peer.clone());
                next.touch_read(now_millis());
                snapshot = Some(next.to_snapshot());
                Compute::Put(next)
            }
            None => Compute::Keep,
        });

        match snapshot {
            Some(snapshot) => {
                tracing::debug!("Conveying {} to {}", target, peer);
                outcome.response.add_conveyed(snapshot);
                outcome.associated.push(target.clone());
            }
            None if orphaned => {
                tracing::debug!("Not conveying orphaned replica {} to {}", target, peer)
            }
            None => tracing::debug!("{} requested unknown entity {}", peer, target),
        }
    }

    fn answer_resynchronize(&self, peer: &NodeIdentifier, entity: &EntityId, outcome: &mut IncomingOutcome) {
        match self.store.get(entity) {
            Some(replica) => {
                outcome.response.add_resynchronized(replica.to_snapshot());
            }
            None => tracing::warn!("{} asked to resynchronize unknown entity {}", peer, entity),
        }
    }

    fn answer_lock_request(&self, peer: &NodeIdentifier, entity: &EntityId, outcome: &mut IncomingOutcome) {
        let mut locks = self.lock_table();
        let busy = locks.busy.contains_key(entity);
        let mut verdict = LockVerdict::Unknown;

        self.store.compute(entity, &mut |current| {
            let Some(replica) = current else {
                return Compute::Keep;
            };
            if !replica.has_lock() || replica.is_shadow() {
                verdict = LockVerdict::NotHolder(replica.lock_proxy().cloned());
                Compute::Keep
            } else if !replica.give_up_lock() {
                verdict = LockVerdict::Kept;
                Compute::Keep
            } else if busy {
                verdict = LockVerdict::Queued;
                Compute::Keep
            } else {
                verdict = LockVerdict::Granted;
                let mut next = replica.clone();
                next.set_lock_proxy(Some(peer.clone()));
                Compute::Put(next)
            }
        });

        match verdict {
            LockVerdict::Granted => {
                drop(locks);
                tracing::info!("Granting lock on {} to {}", entity, peer);
                outcome.response.add_pushed_lock(entity.clone());
                outcome.associated.push(entity.clone());
                self.bump_lock_epoch();
            }
            LockVerdict::Queued => {
                let queue = locks.queues.entry(entity.clone()).or_default();
                if !queue.contains(peer) {
                    queue.push_back(peer.clone());
                }
                tracing::debug!("Queued lock request for {} from {} ({} waiting)", entity, peer, queue.len());
            }
            LockVerdict::Kept => {
                tracing::debug!("Refusing lock on {} to {}: holder keeps it", entity, peer);
            }
            LockVerdict::NotHolder(holder) => {
                tracing::warn!(
                    "Protocol error: {} requested lock on {} but it is held via {:?}",
                    peer,
                    entity,
                    holder
                );
            }
            LockVerdict::Unknown => {
                tracing::warn!("{} requested lock on unknown entity {}", peer, entity);
            }
        }
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    /// Create a new home replica
    pub fn create(&self, id: EntityId, now: TimeStamp) -> Result<Arc<Replica>> {
        let mut exists = false;
        let stored = self.store.compute(&id, &mut |current| match current {
            Some(_) => {
                exists = true;
                Compute::Keep
            }
            None => Compute::Put(Replica::new_home(id.clone(), now)),
        });
        if exists {
            return Err(Error::EntityExists(id.to_string()));
        }
        stored.ok_or_else(|| Error::Internal(format!("replica {} vanished on create", id)))
    }

    /// Enter a local transaction; the lock must be held here
    pub fn begin_transaction(&self, id: &EntityId) -> Result<()> {
        let mut locks = self.lock_table();
        let replica = self
            .store
            .get(id)
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;
        Self::check_writable(&replica)?;
        *locks.busy.entry(id.clone()).or_insert(0) += 1;
        Ok(())
    }

    /// Leave a local transaction.
    ///
    /// When the last transaction on the entity ends and a peer is queued for
    /// its lock, the lock is handed over and the new holder is returned; the
    /// caller must send it the pushLock.
    pub fn end_transaction(&self, id: &EntityId) -> Option<NodeIdentifier> {
        let mut locks = self.lock_table();
        let remaining = match locks.busy.get_mut(id) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return None,
        };
        if remaining > 0 {
            return None;
        }
        locks.busy.remove(id);

        let next = locks.queues.get_mut(id).and_then(VecDeque::pop_front)?;
        if locks.queues.get(id).map_or(false, VecDeque::is_empty) {
            locks.queues.remove(id);
        }

        let mut granted = false;
        self.store.compute(id, &mut |current| match current {
            Some(replica) if replica.has_lock() && !replica.is_orphaned() => {
                granted = true;
                let mut next_replica = replica.clone();
                next_replica.set_lock_proxy(Some(next.clone()));
                Compute::Put(next_replica)
            }
            _ => Compute::Keep,
        });
        drop(locks);

        if granted {
            tracing::info!("Handing queued lock on {} to {}", id, next);
            self.bump_lock_epoch();
            Some(next)
        } else {
            None
        }
    }

    /// Apply changes made by the local application
    pub fn apply_local(&self, id: &EntityId, kinds: Vec<ChangeKind>, now: TimeStamp) -> Result<LocalUpdate> {
        let mut failure = None;
        let mut events = Vec::new();
        let mut peers = Vec::new();

        let stored = self.store.compute(id, &mut |current| {
            let Some(replica) = current else {
                failure = Some(Error::EntityNotFound(id.to_string()));
                return Compute::Keep;
            };
            if let Err(e) = Self::check_writable(replica) {
                failure = Some(e);
                return Compute::Keep;
            }
            let time = now.max(replica.time_updated() + 1);
            let mut next = replica.clone();
            events = kinds
                .iter()
                .cloned()
                .map(|kind| ChangeEvent::new(id.clone(), time, kind))
                .collect();
            for event in &events {
                next.apply_change(event);
            }
            peers = next.related_peers(None);
            Compute::Put(next)
        });

        if let Some(e) = failure {
            return Err(e);
        }
        let replica = stored.ok_or_else(|| Error::EntityNotFound(id.to_string()))?;

        let mut fanout = Fanout::default();
        for peer in peers {
            let builder = fanout.entry(peer);
            for event in &events {
                builder.add_change(event.clone());
            }
        }
        Ok(LocalUpdate {
            replica,
            events,
            fanout,
        })
    }

    /// Delete an entity; the lock must be held here
    pub fn delete_local(&self, id: &EntityId, now: TimeStamp) -> Result<Fanout> {
        let mut failure = None;
        let mut deleted = None;
        let mut peers = Vec::new();

        self.store.compute(id, &mut |current| {
            let Some(replica) = current else {
                failure = Some(Error::EntityNotFound(id.to_string()));
                return Compute::Keep;
            };
            if let Err(e) = Self::check_writable(replica) {
                failure = Some(e);
                return Compute::Keep;
            }
            deleted = Some(DeletedEntity {
                entity: id.clone(),
                time_updated: now.max(replica.time_updated() + 1),
            });
            peers = replica.related_peers(None);
            Compute::Remove
        });

        if let Some(e) = failure {
            return Err(e);
        }
        let deleted = deleted.ok_or_else(|| Error::EntityNotFound(id.to_string()))?;
        self.lock_table().queues.remove(id);
        self.bump_lock_epoch();

        let mut fanout = Fanout::default();
        for peer in peers {
            fanout.entry(peer).add_deleted(deleted.clone());
        }
        Ok(fanout)
    }

    /// Take the lock back at the home replica.
    ///
    /// Returns the previous holder's proxy, which must be told.
    pub fn reclaim_local(&self, id: &EntityId) -> Result<Option<NodeIdentifier>> {
        let mut failure = None;
        let mut previous = None;
        self.store.compute(id, &mut |current| {
            let Some(replica) = current else {
                failure = Some(Error::EntityNotFound(id.to_string()));
                return Compute::Keep;
            };
            if !replica.is_home() {
                failure = Some(Error::Protocol(format!(
                    "only the home replica may reclaim the lock on {}",
                    id
                )));
                return Compute::Keep;
            }
            match replica.lock_proxy() {
                Some(holder) => {
                    previous = Some(holder.clone());
                    let mut next = replica.clone();
                    next.set_lock_proxy(None);
                    Compute::Put(next)
                }
                None => Compute::Keep,
            }
        });

        if let Some(e) = failure {
            return Err(e);
        }
        if let Some(holder) = &previous {
            tracing::info!("Reclaimed lock on {} from {}", id, holder);
            self.bump_lock_epoch();
        }
        Ok(previous)
    }

    /// Drop a dependent replica
    pub fn release_local(&self, id: &EntityId) -> Result<Release> {
        let locks = self.lock_table();
        if locks.busy.contains_key(id) {
            return Err(Error::Protocol(format!("{} is inside a transaction", id)));
        }

        let mut failure = None;
        let mut release = None;
        self.store.compute(id, &mut |current| {
            let Some(replica) = current else {
                failure = Some(Error::EntityNotFound(id.to_string()));
                return Compute::Keep;
            };
            if replica.is_home() {
                failure = Some(Error::Protocol(format!("cannot release home replica {}", id)));
                return Compute::Keep;
            }
            let reachable = !replica.is_orphaned() && !replica.is_shadow();
            release = Some(Release {
                home: replica.home_proxy().filter(|_| reachable).cloned(),
                returned_lock: reachable && replica.has_lock(),
            });
            Compute::Remove
        });
        drop(locks);

        if let Some(e) = failure {
            return Err(e);
        }
        let release = release.ok_or_else(|| Error::EntityNotFound(id.to_string()))?;
        self.lock_table().queues.remove(id);
        self.bump_lock_epoch();
        Ok(release)
    }

    /// Set whether the lock may be handed to requesters
    pub fn set_give_up_lock(&self, id: &EntityId, give_up: bool) -> Result<()> {
        let mut failure = None;
        let updated = self.store.compute(id, &mut |current| {
            let Some(replica) = current else {
                return Compute::Keep;
            };
            if let Err(e) = Self::check_writable(replica) {
                failure = Some(e);
                return Compute::Keep;
            }
            let mut next = replica.clone();
            next.set_give_up_lock(give_up);
            Compute::Put(next)
        });
        if let Some(e) = failure {
            return Err(e);
        }
        updated.map(|_| ()).ok_or_else(|| Error::EntityNotFound(id.to_string()))
    }

    /// Set when a replica becomes eligible for sweeping
    pub fn set_expiry(&self, id: &EntityId, expires: Option<TimeStamp>) -> Result<()> {
        self.store
            .modify(id, &mut |replica| replica.set_time_expires(expires))
            .map(|_| ())
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))
    }

    /// Register `peer` as a dependent and return the snapshot to convey
    pub fn convey_to(&self, id: &EntityId, peer: &NodeIdentifier) -> Option<EntitySnapshot> {
        self.store
            .modify(id, &mut |replica| {
                replica.add_dependent(peer.clone());
            })
            .map(|replica| replica.to_snapshot())
    }

    /// Mark replicas reached through `peer` as orphaned
    pub fn orphan(&self, peer: &NodeIdentifier, entities: &[EntityId]) -> usize {
        let mut orphaned = 0;
        for id in entities {
            let mut affected = false;
            self.store.modify(id, &mut |replica| {
                affected = replica.orphan_via(peer);
            });
            if affected {
                orphaned += 1;
            }
        }

        let mut locks = self.lock_table();
        for queue in locks.queues.values_mut() {
            queue.retain(|queued| queued != peer);
        }
        locks.queues.retain(|_, queue| !queue.is_empty());
        drop(locks);

        if orphaned > 0 {
            tracing::warn!("Lost {} replica link(s) through {}", orphaned, peer);
        }
        self.bump_lock_epoch();
        orphaned
    }

    /// Evict expired dependent replicas nobody relies on.
    ///
    /// Returns each evicted entity with the proxy towards its home, if the
    /// home should be told.
    pub fn sweep(&self, now: TimeStamp) -> Vec<(EntityId, Option<NodeIdentifier>)> {
        let locks = self.lock_table();
        let mut evicted = Vec::new();

        for id in self.store.keys() {
            if locks.busy.contains_key(&id) {
                continue;
            }
            let mut home = None;
            let mut removed = false;
            self.store.compute(&id, &mut |current| match current {
                Some(replica)
                    if !replica.is_home()
                        && !replica.has_lock()
                        && replica.dependents().is_empty()
                        && replica.time_expires().map_or(false, |t| t <= now) =>
                {
                    removed = true;
                    if !replica.is_orphaned() && !replica.is_shadow() {
                        home = replica.home_proxy().cloned();
                    }
                    Compute::Remove
                }
                _ => Compute::Keep,
            });
            if removed {
                evicted.push((id, home));
            }
        }

        if !evicted.is_empty() {
            tracing::debug!("Swept {} expired replica(s)", evicted.len());
        }
        evicted
    }

    /// Install or refresh replicas produced by a probe of `source`
    pub fn apply_shadow_batch(&self, source: &NodeIdentifier, snapshots: &[EntitySnapshot]) -> Fanout {
        self.shadow_sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.clone());

        let mut fanout = Fanout::default();
        for snapshot in snapshots {
            let mut dependents = Vec::new();
            let mut collided = false;
            self.store.compute(&snapshot.id, &mut |current| match current {
                None => Compute::Put(Replica::shadow(snapshot, source.clone())),
                Some(replica) if replica.is_shadow() => {
                    if replica.to_snapshot() == *snapshot {
                        return Compute::Keep;
                    }
                    let mut next = replica.clone();
                    next.replace_content(snapshot);
                    dependents = next.dependents().iter().cloned().collect();
                    Compute::Put(next)
                }
                Some(_) => {
                    collided = true;
                    Compute::Keep
                }
            });

            if collided {
                tracing::warn!("Probe of {} produced {} which is already a live replica", source, snapshot.id);
            }
            for dependent in dependents {
                fanout.entry(dependent).add_resynchronized(snapshot.clone());
            }
        }
        fanout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::PropertyType;
    use crate::state::InMemoryReplicaStore;

    fn node(name: &str) -> NodeIdentifier {
        NodeIdentifier::from_canonical(format!("http://{}/", name))
    }

    fn engine(name: &str) -> ConsistencyEngine {
        ConsistencyEngine::new(node(name), Arc::new(InMemoryReplicaStore::new()))
    }

    fn set_name(value: &str) -> Vec<ChangeKind> {
        vec![ChangeKind::PropertyChanged {
            property: PropertyType::from("name"),
            value: Some(value.to_string()),
        }]
    }

    fn from(peer: &NodeIdentifier, build: impl FnOnce(&mut ReplicationMessageBuilder)) -> ReplicationMessage {
        let mut builder = ReplicationMessage::builder().request_id(1).sender(peer.clone());
        build(&mut builder);
        builder.build()
    }

    /// Home `a` with e1, and `b` holding a dependent replica of it
    fn replicated_pair() -> (ConsistencyEngine, ConsistencyEngine) {
        let a = engine("a");
        let b = engine("b");
        a.create(EntityId::from("e1"), 10).unwrap();

        let request = from(&node("b"), |m| {
            m.add_requested_first_time_object(AccessPath::via(node("a"), EntityId::from("e1")));
        });
        let outcome = a.process_incoming(&node("b"), &request);
        let response = outcome.response.build();
        b.process_incoming(&node("a"), &response);
        (a, b)
    }

    #[test]
    fn test_first_time_request_conveys_and_registers_dependent() {
        let (a, b) = replicated_pair();
        let home = a.replica(&EntityId::from("e1")).unwrap();
        assert!(home.dependents().contains(&node("b")));

        let dependent = b.replica(&EntityId::from("e1")).unwrap();
        assert_eq!(dependent.home_proxy(), Some(&node("a")));
        assert_eq!(b.lock_status(&EntityId::from("e1")), LockStatus::Remote(node("a")));
    }

    #[test]
    fn test_first_time_request_for_unknown_entity_is_silent() {
        let a = engine("a");
        let request = from(&node("b"), |m| {
            m.add_requested_first_time_object(AccessPath::local(EntityId::from("missing")));
        });
        let outcome = a.process_incoming(&node("b"), &request);
        assert!(outcome.response.is_empty());
        assert!(outcome.associated.is_empty());
    }

    #[test]
    fn test_multi_hop_request_is_deferred() {
        let a = engine("a");
        let path = AccessPath::new(
            vec![
                crate::identifier::AccessPathHop::new(node("a")),
                crate::identifier::AccessPathHop::new(node("c")),
            ],
            EntityId::from("e9"),
        );
        let request = from(&node("b"), |m| {
            m.add_requested_first_time_object(path);
        });
        let outcome = a.process_incoming(&node("b"), &request);
        assert_eq!(outcome.deferred.len(), 1);
        assert_eq!(outcome.deferred[0].first_hop(), Some(&node("c")));
    }

    #[test]
    fn test_lock_request_granted_when_idle() {
        let (a, b) = replicated_pair();
        let e1 = EntityId::from("e1");

        let outcome = a.process_incoming(&node("b"), &from(&node("b"), |m| {
            m.add_requested_lock(e1.clone());
        }));
        let response = outcome.response.build();
        assert_eq!(response.pushed_locks(), &[e1.clone()]);
        assert_eq!(a.lock_status(&e1), LockStatus::Remote(node("b")));

        b.process_incoming(&node("a"), &response);
        assert_eq!(b.lock_status(&e1), LockStatus::Local);
    }

    #[test]
    fn test_lock_request_queued_while_busy() {
        let (a, _b) = replicated_pair();
        let e1 = EntityId::from("e1");
        a.begin_transaction(&e1).unwrap();

        let outcome = a.process_incoming(&node("b"), &from(&node("b"), |m| {
            m.add_requested_lock(e1.clone());
        }));
        assert!(outcome.response.build().pushed_locks().is_empty());
        assert_eq!(a.queued_lock_requests(&e1), vec![node("b")]);
        assert_eq!(a.lock_status(&e1), LockStatus::Local);

        assert_eq!(a.end_transaction(&e1), Some(node("b")));
        assert_eq!(a.lock_status(&e1), LockStatus::Remote(node("b")));
        assert!(a.queued_lock_requests(&e1).is_empty());
    }

    #[test]
    fn test_lock_request_to_non_holder_is_ignored() {
        let (_a, b) = replicated_pair();
        let outcome = b.process_incoming(&node("c"), &from(&node("c"), |m| {
            m.add_requested_lock(EntityId::from("e1"));
        }));
        assert!(outcome.response.is_empty());
        assert_eq!(b.lock_status(&EntityId::from("e1")), LockStatus::Remote(node("a")));
    }

    #[test]
    fn test_push_lock_from_wrong_peer_rejected() {
        let (_a, b) = replicated_pair();
        let e1 = EntityId::from("e1");
        b.process_incoming(&node("c"), &from(&node("c"), |m| {
            m.add_pushed_lock(e1.clone());
        }));
        assert_eq!(b.lock_status(&e1), LockStatus::Remote(node("a")));
    }

    #[test]
    fn test_local_write_requires_lock() {
        let (a, b) = replicated_pair();
        let e1 = EntityId::from("e1");

        let err = b.apply_local(&e1, set_name("x"), 100).unwrap_err();
        assert!(matches!(err, Error::LockUnavailable { .. }));

        let update = a.apply_local(&e1, set_name("x"), 100).unwrap();
        assert_eq!(update.events[0].time_updated, 100);
        assert_eq!(update.fanout.peers().collect::<Vec<_>>(), vec![&node("b")]);
    }

    #[test]
    fn test_local_timestamps_are_monotonic() {
        let a = engine("a");
        let e1 = EntityId::from("e1");
        a.create(e1.clone(), 500).unwrap();
        let first = a.apply_local(&e1, set_name("x"), 10).unwrap();
        let second = a.apply_local(&e1, set_name("y"), 10).unwrap();
        assert_eq!(first.events[0].time_updated, 501);
        assert_eq!(second.events[0].time_updated, 502);
    }

    #[test]
    fn test_incoming_change_fans_out_except_sender() {
        let (a, b) = replicated_pair();
        let e1 = EntityId::from("e1");

        // b takes the lock then writes; a forwards to nobody but would to c
        let grant = a.process_incoming(&node("b"), &from(&node("b"), |m| {
            m.add_requested_lock(e1.clone());
        }));
        b.process_incoming(&node("a"), &grant.response.build());
        a.convey_to(&e1, &node("c")).unwrap();

        let update = b.apply_local(&e1, set_name("x"), 100).unwrap();
        let (peer, builder) = update.fanout.into_messages().next().unwrap();
        assert_eq!(peer, node("a"));

        let outcome = a.process_incoming(&node("b"), &builder.build());
        let peers: Vec<_> = outcome.fanout.peers().cloned().collect();
        assert_eq!(peers, vec![node("c")]);
        let home = a.replica(&e1).unwrap();
        assert_eq!(home.property(&PropertyType::from("name")), Some(Some("x")));
    }

    #[test]
    fn test_orphaned_replica_reports_no_home() {
        let (_a, b) = replicated_pair();
        let e1 = EntityId::from("e1");
        assert_eq!(b.orphan(&node("a"), &[e1.clone()]), 1);
        assert_eq!(b.lock_status(&e1), LockStatus::Orphaned);
        assert!(matches!(b.begin_transaction(&e1), Err(Error::NoHome(_))));
    }

    #[test]
    fn test_orphaned_replica_is_not_conveyed() {
        let (_a, b) = replicated_pair();
        let e1 = EntityId::from("e1");
        b.orphan(&node("a"), &[e1.clone()]);

        let request = from(&node("c"), |m| {
            m.add_requested_first_time_object(AccessPath::via(node("b"), e1.clone()));
        });
        let outcome = b.process_incoming(&node("c"), &request);
        assert!(outcome.response.is_empty());
        assert!(outcome.associated.is_empty());
        assert!(b.replica(&e1).unwrap().dependents().is_empty());
    }

    #[test]
    fn test_home_writable_after_lock_holder_goes_away() {
        let (a, b) = replicated_pair();
        let e1 = EntityId::from("e1");
        let grant = a.process_incoming(&node("b"), &from(&node("b"), |m| {
            m.add_requested_lock(e1.clone());
        }));
        b.process_incoming(&node("a"), &grant.response.build());
        assert_eq!(a.lock_status(&e1), LockStatus::Remote(node("b")));

        assert_eq!(a.orphan(&node("b"), &[e1.clone()]), 1);
        assert_eq!(a.lock_status(&e1), LockStatus::Local);
        assert!(a.apply_local(&e1, set_name("back home"), 500).is_ok());
    }

    #[test]
    fn test_deletion_propagates_to_dependents() {
        let (a, b) = replicated_pair();
        let e1 = EntityId::from("e1");
        let fanout = a.delete_local(&e1, 1000).unwrap();
        let (peer, builder) = fanout.into_messages().next().unwrap();
        assert_eq!(peer, node("b"));
        let outcome = b.process_incoming(&node("a"), &builder.build());
        assert_eq!(outcome.released, vec![e1.clone()]);
        assert!(b.replica(&e1).is_none());
    }

    #[test]
    fn test_reclaim_only_at_home() {
        let (a, b) = replicated_pair();
        let e1 = EntityId::from("e1");
        assert!(b.reclaim_local(&e1).is_err());

        a.process_incoming(&node("b"), &from(&node("b"), |m| {
            m.add_requested_lock(e1.clone());
        }));
        assert_eq!(a.reclaim_local(&e1).unwrap(), Some(node("b")));
        assert_eq!(a.lock_status(&e1), LockStatus::Local);

        b.process_incoming(&node("a"), &from(&node("a"), |m| {
            m.add_reclaimed_lock(e1.clone());
        }));
        assert_eq!(b.lock_status(&e1), LockStatus::Remote(node("a")));
    }

    #[test]
    fn test_resynchronize_replaces_content() {
        let (a, b) = replicated_pair();
        let e1 = EntityId::from("e1");
        a.apply_local(&e1, set_name("fresh"), 100).unwrap();

        let outcome = a.process_incoming(&node("b"), &from(&node("b"), |m| {
            m.add_requested_resynchronize(e1.clone());
        }));
        b.process_incoming(&node("a"), &outcome.response.build());
        let replica = b.replica(&e1).unwrap();
        assert_eq!(replica.property(&PropertyType::from("name")), Some(Some("fresh")));
    }

    #[test]
    fn test_release_returns_lock_to_home() {
        let (a, b) = replicated_pair();
        let e1 = EntityId::from("e1");
        let grant = a.process_incoming(&node("b"), &from(&node("b"), |m| {
            m.add_requested_lock(e1.clone());
        }));
        b.process_incoming(&node("a"), &grant.response.build());

        let release = b.release_local(&e1).unwrap();
        assert_eq!(release.home, Some(node("a")));
        assert!(release.returned_lock);
        assert!(a.release_local(&e1).is_err());
    }

    #[test]
    fn test_sweep_evicts_expired_dependents_only() {
        let (a, b) = replicated_pair();
        let e1 = EntityId::from("e1");
        b.store.modify(&e1, &mut |r| r.set_time_expires(Some(50)));
        a.store.modify(&e1, &mut |r| r.set_time_expires(Some(50)));

        assert!(b.sweep(40).is_empty());
        assert_eq!(b.sweep(60), vec![(e1.clone(), Some(node("a")))]);
        assert!(a.sweep(60).is_empty());
    }

    #[test]
    fn test_shadow_replicas_are_read_only() {
        let a = engine("a");
        let source = node("probe");
        let snapshot = EntitySnapshot::new(EntityId::from("file1"), 5);
        a.apply_shadow_batch(&source, &[snapshot]);

        assert!(a.is_shadow_source(&source));
        assert_eq!(a.lock_status(&EntityId::from("file1")), LockStatus::Shadow);
        assert!(a.begin_transaction(&EntityId::from("file1")).is_err());
    }
}
