//! Replication Message
//!
//! One protocol exchange between two proxies: a bundle of deltas and
//! control requests addressed by request and response id.

use super::event::{ChangeEvent, DeletedEntity, EntitySnapshot};
use crate::identifier::{AccessPath, EntityId, NodeIdentifier};

/// Immutable replication message. Build with [`ReplicationMessageBuilder`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplicationMessage {
    request_id: u64,
    response_id: Option<u64>,
    sender: Option<NodeIdentifier>,
    receiver: Option<NodeIdentifier>,
    requested_first_time_objects: Vec<AccessPath>,
    requested_canceled_objects: Vec<EntityId>,
    deleted: Vec<DeletedEntity>,
    created: Vec<EntitySnapshot>,
    conveyed: Vec<EntitySnapshot>,
    changes: Vec<ChangeEvent>,
    requested_locks: Vec<EntityId>,
    pushed_locks: Vec<EntityId>,
    reclaimed_locks: Vec<EntityId>,
    requested_resynchronize: Vec<EntityId>,
    resynchronized: Vec<EntitySnapshot>,
    cease_communications: bool,
}

impl ReplicationMessage {
    /// Start building a message
    pub fn builder() -> ReplicationMessageBuilder {
        ReplicationMessageBuilder::default()
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn response_id(&self) -> Option<u64> {
        self.response_id
    }

    pub fn sender(&self) -> Option<&NodeIdentifier> {
        self.sender.as_ref()
    }

    pub fn receiver(&self) -> Option<&NodeIdentifier> {
        self.receiver.as_ref()
    }

    pub fn requested_first_time_objects(&self) -> &[AccessPath] {
        &self.requested_first_time_objects
    }

    pub fn requested_canceled_objects(&self) -> &[EntityId] {
        &self.requested_canceled_objects
    }

    pub fn deleted(&self) -> &[DeletedEntity] {
        &self.deleted
    }

    pub fn created(&self) -> &[EntitySnapshot] {
        &self.created
    }

    pub fn conveyed(&self) -> &[EntitySnapshot] {
        &self.conveyed
    }

    pub fn changes(&self) -> &[ChangeEvent] {
        &self.changes
    }

    pub fn requested_locks(&self) -> &[EntityId] {
        &self.requested_locks
    }

    pub fn pushed_locks(&self) -> &[EntityId] {
        &self.pushed_locks
    }

    pub fn reclaimed_locks(&self) -> &[EntityId] {
        &self.reclaimed_locks
    }

    pub fn requested_resynchronize(&self) -> &[EntityId] {
        &self.requested_resynchronize
    }

    pub fn resynchronized(&self) -> &[EntitySnapshot] {
        &self.resynchronized
    }

    pub fn cease_communications(&self) -> bool {
        self.cease_communications
    }

    /// True if the peer expects an answer to this message
    pub fn requests_anything(&self) -> bool {
        !self.requested_first_time_objects.is_empty()
            || !self.requested_locks.is_empty()
            || !self.requested_resynchronize.is_empty()
    }

    /// True if the message carries no payload (a ping)
    pub fn is_empty(&self) -> bool {
        self.requested_first_time_objects.is_empty()
            && self.requested_canceled_objects.is_empty()
            && self.deleted.is_empty()
            && self.created.is_empty()
            && self.conveyed.is_empty()
            && self.changes.is_empty()
            && self.requested_locks.is_empty()
            && self.pushed_locks.is_empty()
            && self.reclaimed_locks.is_empty()
            && self.requested_resynchronize.is_empty()
            && self.resynchronized.is_empty()
            && !self.cease_communications
    }

    /// Short summary for logging
    pub fn summary(&self) -> String {
        format!(
            "req={} resp={:?} ftr={} cancel={} del={} new={} conv={} chg={} lock?={} lock>={} lock<={} resync?={} resync={} cease={}",
            self.request_id,
            self.response_id,
            self.requested_first_time_objects.len(),
            self.requested_canceled_objects.len(),
            self.deleted.len(),
            self.created.len(),
            self.conveyed.len(),
            self.changes.len(),
            self.requested_locks.len(),
            self.pushed_locks.len(),
            self.reclaimed_locks.len(),
            self.requested_resynchronize.len(),
            self.resynchronized.len(),
            self.cease_communications,
        )
    }
}

/// Mutable accumulator for a [`ReplicationMessage`]
#[derive(Debug, Clone, Default)]
pub struct ReplicationMessageBuilder {
    message: ReplicationMessage,
}

impl ReplicationMessageBuilder {
    pub fn request_id(mut self, request_id: u64) -> Self {
        self.message.request_id = request_id;
        self
    }

    pub fn response_id(mut self, response_id: u64) -> Self {
        self.message.response_id = Some(response_id);
        self
    }

    pub fn sender(mut self, sender: NodeIdentifier) -> Self {
        self.message.sender = Some(sender);
        self
    }

    pub fn receiver(mut self, receiver: NodeIdentifier) -> Self {
        self.message.receiver = Some(receiver);
        self
    }

    pub fn cease_communications(mut self, cease: bool) -> Self {
        self.message.cease_communications = cease;
        self
    }

    pub fn set_request_id(&mut self, request_id: u64) {
        self.message.request_id = request_id;
    }

    pub fn set_response_id(&mut self, response_id: Option<u64>) {
        self.message.response_id = response_id;
    }

    pub fn set_sender(&mut self, sender: Option<NodeIdentifier>) {
        self.message.sender = sender;
    }

    pub fn set_receiver(&mut self, receiver: Option<NodeIdentifier>) {
        self.message.receiver = receiver;
    }

    pub fn set_cease_communications(&mut self, cease: bool) {
        self.message.cease_communications = cease;
    }

    pub fn add_requested_first_time_object(&mut self, path: AccessPath) -> &mut Self {
        self.message.requested_first_time_objects.push(path);
        self
    }

    pub fn add_requested_canceled_object(&mut self, entity: EntityId) -> &mut Self {
        self.message.requested_canceled_objects.push(entity);
        self
    }

    pub fn add_deleted(&mut self, deleted: DeletedEntity) -> &mut Self {
        self.message.deleted.push(deleted);
        self
    }

    pub fn add_created(&mut self, snapshot: EntitySnapshot) -> &mut Self {
        self.message.created.push(snapshot);
        self
    }

    pub fn add_conveyed(&mut self, snapshot: EntitySnapshot) -> &mut Self {
        self.message.conveyed.push(snapshot);
        self
    }

    pub fn add_change(&mut self, change: ChangeEvent) -> &mut Self {
        self.message.changes.push(change);
        self
    }

    pub fn add_requested_lock(&mut self, entity: EntityId) -> &mut Self {
        self.message.requested_locks.push(entity);
        self
    }

    pub fn add_pushed_lock(&mut self, entity: EntityId) -> &mut Self {
        self.message.pushed_locks.push(entity);
        self
    }

    pub fn add_reclaimed_lock(&mut self, entity: EntityId) -> &mut Self {
        self.message.reclaimed_locks.push(entity);
        self
    }

    pub fn add_requested_resynchronize(&mut self, entity: EntityId) -> &mut Self {
        self.message.requested_resynchronize.push(entity);
        self
    }

    pub fn add_resynchronized(&mut self, snapshot: EntitySnapshot) -> &mut Self {
        self.message.resynchronized.push(snapshot);
        self
    }

    /// True if nothing but the envelope has been set
    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }

    /// True if the message under construction asks the peer for an answer
    pub fn requests_anything(&self) -> bool {
        self.message.requests_anything()
    }

    /// Finish the message
    pub fn build(self) -> ReplicationMessage {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::event::{ChangeKind, TimeStamp};
    use crate::identifier::PropertyType;

    fn change(at: TimeStamp) -> ChangeEvent {
        ChangeEvent::new(
            EntityId::from("e1"),
            at,
            ChangeKind::PropertyChanged {
                property: PropertyType::from("name"),
                value: Some("x".into()),
            },
        )
    }

    #[test]
    fn test_empty_message_is_ping() {
        let msg = ReplicationMessage::builder().request_id(7).build();
        assert!(msg.is_empty());
        assert!(!msg.requests_anything());
        assert_eq!(msg.request_id(), 7);
        assert_eq!(msg.response_id(), None);
    }

    #[test]
    fn test_builder_accumulates_in_order() {
        let mut builder = ReplicationMessage::builder().request_id(1).response_id(4);
        builder.add_change(change(1)).add_change(change(2));
        builder.add_requested_lock(EntityId::from("e1"));
        let msg = builder.build();

        assert_eq!(msg.changes().len(), 2);
        assert_eq!(msg.changes()[1].time_updated, 2);
        assert!(msg.requests_anything());
        assert!(!msg.is_empty());
        assert_eq!(msg.response_id(), Some(4));
    }

    #[test]
    fn test_cease_alone_is_not_empty() {
        let msg = ReplicationMessage::builder().cease_communications(true).build();
        assert!(!msg.is_empty());
        assert!(msg.summary().contains("cease=true"));
    }
}
