//! Streaming XML encoder

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::*;
use crate::error::{Error, Result};
use crate::identifier::{AccessPath, TypeId};
use crate::replication::{ChangeEvent, ChangeKind, EntitySnapshot, ReplicationMessage, TypeStamp};

/// Append-only XML writer over a byte buffer
struct XmlSink {
    writer: Writer<Vec<u8>>,
}

impl XmlSink {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::with_capacity(512)),
        }
    }

    fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| Error::Encode(e.to_string()))
    }

    fn element(tag: &str, attrs: &[(&str, String)]) -> BytesStart<'static> {
        let mut start = BytesStart::new(tag.to_string());
        for (key, value) in attrs {
            start.push_attribute((*key, value.as_str()));
        }
        start
    }

    fn open(&mut self, tag: &str, attrs: &[(&str, String)]) -> Result<()> {
        self.write(Event::Start(Self::element(tag, attrs)))
    }

    fn empty(&mut self, tag: &str, attrs: &[(&str, String)]) -> Result<()> {
        self.write(Event::Empty(Self::element(tag, attrs)))
    }

    fn close(&mut self, tag: &str) -> Result<()> {
        self.write(Event::End(BytesEnd::new(tag)))
    }

    fn text(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.write(Event::Text(BytesText::new(text)))
    }

    fn finish(self) -> Vec<u8> {
        self.writer.into_inner()
    }
}

/// Serialize a message
pub(super) fn encode(message: &ReplicationMessage) -> Result<Vec<u8>> {
    let mut sink = XmlSink::new();
    sink.write(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut envelope = vec![(ATTR_REQUEST_ID, message.request_id().to_string())];
    if let Some(response_id) = message.response_id() {
        envelope.push((ATTR_RESPONSE_ID, response_id.to_string()));
    }
    if let Some(sender) = message.sender() {
        envelope.push((ATTR_SENDER, escape_identifier(sender.canonical_form())));
    }
    if let Some(receiver) = message.receiver() {
        envelope.push((ATTR_RECEIVER, escape_identifier(receiver.canonical_form())));
    }
    if message.cease_communications() {
        envelope.push((ATTR_CEASE, "true".to_string()));
    }
    sink.open(TAG_MESSAGE, &envelope)?;

    for path in message.requested_first_time_objects() {
        write_path(&mut sink, path)?;
    }
    for entity in message.requested_canceled_objects() {
        sink.empty(TAG_CANCELED, &[(ATTR_ENTITY, escape_identifier(entity.as_str()))])?;
    }
    for deleted in message.deleted() {
        sink.empty(
            TAG_DELETED,
            &[
                (ATTR_ENTITY, escape_identifier(deleted.entity.as_str())),
                (ATTR_TIME_UPDATED, deleted.time_updated.to_string()),
            ],
        )?;
    }
    for snapshot in message.created() {
        write_snapshot(&mut sink, TAG_CREATED, snapshot)?;
    }
    for snapshot in message.conveyed() {
        write_snapshot(&mut sink, TAG_CONVEYED, snapshot)?;
    }
    for change in message.changes() {
        write_change(&mut sink, change)?;
    }
    for entity in message.requested_locks() {
        sink.empty(TAG_REQUESTED_LOCK, &[(ATTR_ENTITY, escape_identifier(entity.as_str()))])?;
    }
    for entity in message.pushed_locks() {
        sink.empty(TAG_PUSH_LOCK, &[(ATTR_ENTITY, escape_identifier(entity.as_str()))])?;
    }
    for entity in message.reclaimed_locks() {
        sink.empty(TAG_RECLAIMED_LOCK, &[(ATTR_ENTITY, escape_identifier(entity.as_str()))])?;
    }
    for entity in message.requested_resynchronize() {
        sink.empty(TAG_REQUESTED_RESYNC, &[(ATTR_ENTITY, escape_identifier(entity.as_str()))])?;
    }
    for snapshot in message.resynchronized() {
        write_snapshot(&mut sink, TAG_RESYNCHRONIZED, snapshot)?;
    }

    sink.close(TAG_MESSAGE)?;
    Ok(sink.finish())
}

fn write_path(sink: &mut XmlSink, path: &AccessPath) -> Result<()> {
    sink.open(
        TAG_FIRST_TIME,
        &[
            (ATTR_TARGET, escape_identifier(path.target().as_str())),
            (ATTR_FOLLOW, path.follow_redirects().to_string()),
        ],
    )?;
    for hop in path.hops() {
        let mut attrs = vec![(ATTR_NODE, escape_identifier(hop.node().canonical_form()))];
        if let Some(coherence) = hop.coherence() {
            attrs.push((ATTR_COHERENCE, coherence.to_external_form()));
        }
        sink.empty(TAG_HOP, &attrs)?;
    }
    sink.close(TAG_FIRST_TIME)
}

fn write_stamped_types(sink: &mut XmlSink, types: &[TypeStamp]) -> Result<()> {
    for stamp in types {
        sink.empty(
            TAG_TYPE,
            &[
                (ATTR_ID, escape_identifier(stamp.id.as_str())),
                (ATTR_TIME_UPDATED, stamp.time_updated.to_string()),
            ],
        )?;
    }
    Ok(())
}

fn write_types(sink: &mut XmlSink, types: &[TypeId]) -> Result<()> {
    for id in types {
        sink.empty(TAG_TYPE, &[(ATTR_ID, escape_identifier(id.as_str()))])?;
    }
    Ok(())
}

fn write_property(
    sink: &mut XmlSink,
    tag: &str,
    mut attrs: Vec<(&str, String)>,
    value: Option<&str>,
) -> Result<()> {
    match value {
        None => {
            attrs.push((ATTR_NULL, "true".to_string()));
            sink.empty(tag, &attrs)
        }
        Some(text) => {
            sink.open(tag, &attrs)?;
            sink.text(text)?;
            sink.close(tag)
        }
    }
}

fn write_snapshot(sink: &mut XmlSink, tag: &str, snapshot: &EntitySnapshot) -> Result<()> {
    let mut attrs = vec![
        (ATTR_ID, escape_identifier(snapshot.id.as_str())),
        (ATTR_TIME_CREATED, snapshot.time_created.to_string()),
        (ATTR_TIME_UPDATED, snapshot.time_updated.to_string()),
        (ATTR_TIME_READ, snapshot.time_read.to_string()),
    ];
    if let Some(expires) = snapshot.time_expires {
        attrs.push((ATTR_TIME_EXPIRES, expires.to_string()));
    }
    attrs.push((ATTR_GIVE_UP_LOCK, snapshot.give_up_lock.to_string()));
    sink.open(tag, &attrs)?;

    write_stamped_types(sink, &snapshot.types)?;
    for property in &snapshot.properties {
        write_property(
            sink,
            TAG_PROPERTY,
            vec![
                (ATTR_TYPE, escape_identifier(property.property.as_str())),
                (ATTR_TIME_UPDATED, property.time_updated.to_string()),
            ],
            property.value.as_deref(),
        )?;
    }
    for neighbor in &snapshot.neighbors {
        sink.open(
            TAG_NEIGHBOR,
            &[
                (ATTR_ID, escape_identifier(neighbor.neighbor.as_str())),
                (ATTR_TIME_UPDATED, neighbor.time_updated.to_string()),
            ],
        )?;
        write_stamped_types(sink, &neighbor.roles)?;
        sink.close(TAG_NEIGHBOR)?;
    }

    sink.close(tag)
}

fn write_change(sink: &mut XmlSink, change: &ChangeEvent) -> Result<()> {
    let entity = (ATTR_ENTITY, escape_identifier(change.entity.as_str()));
    let time = (ATTR_TIME_UPDATED, change.time_updated.to_string());

    match &change.kind {
        ChangeKind::PropertyChanged { property, value } => write_property(
            sink,
            TAG_PROPERTY_CHANGE,
            vec![
                entity,
                (ATTR_TYPE, escape_identifier(property.as_str())),
                time,
            ],
            value.as_deref(),
        ),
        ChangeKind::NeighborRemoved { neighbor } => sink.empty(
            TAG_NEIGHBOR_REMOVED,
            &[entity, (ATTR_NEIGHBOR, escape_identifier(neighbor.as_str())), time],
        ),
        ChangeKind::NeighborAdded { neighbor, roles } => {
            let attrs = [entity, (ATTR_NEIGHBOR, escape_identifier(neighbor.as_str())), time];
            write_type_list(sink, TAG_NEIGHBOR_ADDED, &attrs, roles)
        }
        ChangeKind::RolesAdded { neighbor, roles } => {
            let attrs = [entity, (ATTR_NEIGHBOR, escape_identifier(neighbor.as_str())), time];
            write_type_list(sink, TAG_ROLES_ADDED, &attrs, roles)
        }
        ChangeKind::RolesRemoved { neighbor, roles } => {
            let attrs = [entity, (ATTR_NEIGHBOR, escape_identifier(neighbor.as_str())), time];
            write_type_list(sink, TAG_ROLES_REMOVED, &attrs, roles)
        }
        ChangeKind::TypesAdded { types } => write_type_list(sink, TAG_TYPES_ADDED, &[entity, time], types),
        ChangeKind::TypesRemoved { types } => {
            write_type_list(sink, TAG_TYPES_REMOVED, &[entity, time], types)
        }
    }
}

fn write_type_list(
    sink: &mut XmlSink,
    tag: &str,
    attrs: &[(&str, String)],
    types: &[TypeId],
) -> Result<()> {
    sink.open(tag, attrs)?;
    write_types(sink, types)?;
    sink.close(tag)
}
