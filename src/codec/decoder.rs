//! Event-driven XML decoder
//!
//! Single pass over the reader's events. Elements under construction live on
//! an explicit frame stack; an element's frame is finalized into its parent
//! (or into the message) when the element closes.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::*;
use crate::error::{Error, Result};
use crate::identifier::{
    AccessPath, AccessPathHop, CoherenceSpecification, EntityId, NodeIdentifier, PropertyType,
    TypeId,
};
use crate::replication::{
    ChangeEvent, ChangeKind, DeletedEntity, EntitySnapshot, NeighborSnapshot, PropertySnapshot,
    ReplicationMessage, ReplicationMessageBuilder, TimeStamp, TypeStamp,
};

type Attrs = HashMap<String, String>;

#[derive(Debug, Clone, Copy)]
enum SnapshotKind {
    Created,
    Conveyed,
    Resynchronized,
}

#[derive(Debug)]
enum PropertyTarget {
    Snapshot,
    Change(EntityId),
}

/// Accumulates a property value, either inside a snapshot or as a delta
#[derive(Debug)]
struct PropertyFrame {
    target: PropertyTarget,
    property: PropertyType,
    null: bool,
    time_updated: TimeStamp,
    text: String,
}

#[derive(Debug)]
enum TypesDelta {
    NeighborAdded(EntityId),
    RolesAdded(EntityId),
    RolesRemoved(EntityId),
    TypesAdded,
    TypesRemoved,
}

/// Accumulates a delta whose payload is a list of `<type>` children
#[derive(Debug)]
struct TypesFrame {
    entity: EntityId,
    time_updated: TimeStamp,
    delta: TypesDelta,
    types: Vec<TypeId>,
}

/// Accumulates an access path
#[derive(Debug)]
struct PathFrame {
    target: EntityId,
    follow_redirects: bool,
    hops: Vec<AccessPathHop>,
    valid: bool,
}

#[derive(Debug)]
enum Frame {
    Envelope,
    Snapshot(SnapshotKind, EntitySnapshot),
    Neighbor(NeighborSnapshot),
    Property(PropertyFrame),
    Types(TypesFrame),
    Path(PathFrame),
    /// Element fully handled at its start tag
    Leaf,
    /// Unknown or invalid element; its subtree is ignored
    Skip,
}

struct Decoder<'r> {
    resolver: &'r IdentifierResolver,
    stack: Vec<Frame>,
    builder: ReplicationMessageBuilder,
    started: bool,
    finished: bool,
}

/// Parse a message
pub(super) fn decode(bytes: &[u8], resolver: &IdentifierResolver) -> Result<ReplicationMessage> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Decode(format!("message is not UTF-8: {}", e)))?;
    let mut reader = Reader::from_str(text);
    let mut decoder = Decoder {
        resolver,
        stack: Vec::new(),
        builder: ReplicationMessage::builder(),
        started: false,
        finished: false,
    };

    loop {
        match reader.read_event()? {
            Event::Start(e) => decoder.start(&e)?,
            Event::Empty(e) => {
                decoder.start(&e)?;
                decoder.end();
            }
            Event::End(_) => decoder.end(),
            Event::Text(t) => {
                let text = t.unescape()?;
                decoder.text(&text);
            }
            Event::CData(c) => {
                let raw = c.into_inner();
                let text = std::str::from_utf8(&raw)
                    .map_err(|e| Error::Decode(format!("CDATA is not UTF-8: {}", e)))?;
                decoder.text(text);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !decoder.finished {
        return Err(Error::Decode("unexpected end of message".into()));
    }
    Ok(decoder.builder.build())
}

impl Decoder<'_> {
    fn start(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let attrs = read_attributes(e)?;

        let frame = match self.stack.last_mut() {
            None => {
                if self.started {
                    return Err(Error::Decode(format!("unexpected element <{}> after message", name)));
                }
                self.start_envelope(&name, &attrs)?;
                Frame::Envelope
            }
            Some(Frame::Skip) => Frame::Skip,
            Some(Frame::Leaf) | Some(Frame::Property(_)) => {
                tracing::warn!("Ignoring unexpected child element <{}>", name);
                Frame::Skip
            }
            Some(Frame::Envelope) => self.start_in_envelope(&name, &attrs),
            Some(Frame::Snapshot(_, snapshot)) => match name.as_str() {
                TAG_TYPE => {
                    if let Some(stamp) = stamped_type(&attrs) {
                        snapshot.types.push(stamp);
                    }
                    Frame::Leaf
                }
                TAG_PROPERTY => match property_frame(PropertyTarget::Snapshot, &attrs) {
                    Some(frame) => Frame::Property(frame),
                    None => Frame::Skip,
                },
                TAG_NEIGHBOR => match (
                    entity_attr(&attrs, ATTR_ID),
                    time_attr(&attrs, ATTR_TIME_UPDATED),
                ) {
                    (Some(neighbor), Some(time_updated)) => Frame::Neighbor(NeighborSnapshot {
                        neighbor,
                        roles: Vec::new(),
                        time_updated,
                    }),
                    _ => {
                        tracing::warn!("Omitting neighbor with malformed identifier or time");
                        Frame::Skip
                    }
                },
                _ => unknown(&name),
            },
            Some(Frame::Neighbor(neighbor)) => match name.as_str() {
                TAG_TYPE => {
                    if let Some(stamp) = stamped_type(&attrs) {
                        neighbor.roles.push(stamp);
                    }
                    Frame::Leaf
                }
                _ => unknown(&name),
            },
            Some(Frame::Types(types)) => match name.as_str() {
                TAG_TYPE => {
                    if let Some(id) = type_attr(&attrs, ATTR_ID) {
                        types.types.push(id);
                    }
                    Frame::Leaf
                }
                _ => unknown(&name),
            },
            Some(Frame::Path(path)) => match name.as_str() {
                TAG_HOP => {
                    match hop(self.resolver, &attrs) {
                        Some(hop) => path.hops.push(hop),
                        None => path.valid = false,
                    }
                    Frame::Leaf
                }
                _ => unknown(&name),
            },
        };

        self.stack.push(frame);
        Ok(())
    }

    /// Envelope fields abort the decode when malformed
    fn start_envelope(&mut self, name: &str, attrs: &Attrs) -> Result<()> {
        if name != TAG_MESSAGE {
            return Err(Error::Decode(format!("expected <{}>, found <{}>", TAG_MESSAGE, name)));
        }
        self.started = true;

        let request_id = attrs
            .get(ATTR_REQUEST_ID)
            .ok_or_else(|| Error::Decode("missing requestId".into()))?
            .parse::<u64>()
            .map_err(|e| Error::Decode(format!("bad requestId: {}", e)))?;
        self.builder.set_request_id(request_id);

        if let Some(raw) = attrs.get(ATTR_RESPONSE_ID) {
            let response_id = raw
                .parse::<u64>()
                .map_err(|e| Error::Decode(format!("bad responseId: {}", e)))?;
            self.builder.set_response_id(Some(response_id));
        }
        if let Some(raw) = attrs.get(ATTR_SENDER) {
            self.builder.set_sender(Some(envelope_node(self.resolver, ATTR_SENDER, raw)?));
        }
        if let Some(raw) = attrs.get(ATTR_RECEIVER) {
            self.builder.set_receiver(Some(envelope_node(self.resolver, ATTR_RECEIVER, raw)?));
        }
        if let Some(raw) = attrs.get(ATTR_CEASE) {
            let cease = parse_bool(raw)
                .ok_or_else(|| Error::Decode(format!("bad cease flag: {}", raw)))?;
            self.builder.set_cease_communications(cease);
        }
        Ok(())
    }

    fn start_in_envelope(&mut self, name: &str, attrs: &Attrs) -> Frame {
        match name {
            TAG_FIRST_TIME => match entity_attr(attrs, ATTR_TARGET) {
                Some(target) => Frame::Path(PathFrame {
                    target,
                    follow_redirects: attrs
                        .get(ATTR_FOLLOW)
                        .and_then(|raw| parse_bool(raw))
                        .unwrap_or(true),
                    hops: Vec::new(),
                    valid: true,
                }),
                None => malformed(name),
            },
            TAG_CANCELED | TAG_REQUESTED_LOCK | TAG_PUSH_LOCK | TAG_RECLAIMED_LOCK
            | TAG_REQUESTED_RESYNC => {
                let Some(entity) = entity_attr(attrs, ATTR_ENTITY) else {
                    return malformed(name);
                };
                match name {
                    TAG_CANCELED => self.builder.add_requested_canceled_object(entity),
                    TAG_REQUESTED_LOCK => self.builder.add_requested_lock(entity),
                    TAG_PUSH_LOCK => self.builder.add_pushed_lock(entity),
                    TAG_RECLAIMED_LOCK => self.builder.add_reclaimed_lock(entity),
                    _ => self.builder.add_requested_resynchronize(entity),
                };
                Frame::Leaf
            }
            TAG_DELETED => {
                match (entity_attr(attrs, ATTR_ENTITY), time_attr(attrs, ATTR_TIME_UPDATED)) {
                    (Some(entity), Some(time_updated)) => {
                        self.builder.add_deleted(DeletedEntity {
                            entity,
                            time_updated,
                        });
                        Frame::Leaf
                    }
                    _ => malformed(name),
                }
            }
            TAG_CREATED | TAG_CONVEYED | TAG_RESYNCHRONIZED => {
                let kind = match name {
                    TAG_CREATED => SnapshotKind::Created,
                    TAG_CONVEYED => SnapshotKind::Conveyed,
                    _ => SnapshotKind::Resynchronized,
                };
                match snapshot(attrs) {
                    Some(snapshot) => Frame::Snapshot(kind, snapshot),
                    None => malformed(name),
                }
            }
            TAG_PROPERTY_CHANGE => match entity_attr(attrs, ATTR_ENTITY) {
                Some(entity) => match property_frame(PropertyTarget::Change(entity), attrs) {
                    Some(frame) => Frame::Property(frame),
                    None => malformed(name),
                },
                None => malformed(name),
            },
            TAG_NEIGHBOR_REMOVED => match (
                entity_attr(attrs, ATTR_ENTITY),
                entity_attr(attrs, ATTR_NEIGHBOR),
                time_attr(attrs, ATTR_TIME_UPDATED),
            ) {
                (Some(entity), Some(neighbor), Some(time_updated)) => {
                    self.builder.add_change(ChangeEvent::new(
                        entity,
                        time_updated,
                        ChangeKind::NeighborRemoved { neighbor },
                    ));
                    Frame::Leaf
                }
                _ => malformed(name),
            },
            TAG_NEIGHBOR_ADDED | TAG_ROLES_ADDED | TAG_ROLES_REMOVED | TAG_TYPES_ADDED
            | TAG_TYPES_REMOVED => {
                let (Some(entity), Some(time_updated)) =
                    (entity_attr(attrs, ATTR_ENTITY), time_attr(attrs, ATTR_TIME_UPDATED))
                else {
                    return malformed(name);
                };
                let delta = match name {
                    TAG_TYPES_ADDED => TypesDelta::TypesAdded,
                    TAG_TYPES_REMOVED => TypesDelta::TypesRemoved,
                    _ => {
                        let Some(neighbor) = entity_attr(attrs, ATTR_NEIGHBOR) else {
                            return malformed(name);
                        };
                        match name {
                            TAG_NEIGHBOR_ADDED => TypesDelta::NeighborAdded(neighbor),
                            TAG_ROLES_ADDED => TypesDelta::RolesAdded(neighbor),
                            _ => TypesDelta::RolesRemoved(neighbor),
                        }
                    }
                };
                Frame::Types(TypesFrame {
                    entity,
                    time_updated,
                    delta,
                    types: Vec::new(),
                })
            }
            _ => unknown(name),
        }
    }

    fn end(&mut self) {
        let Some(frame) = self.stack.pop() else {
            return;
        };

        match frame {
            Frame::Envelope => self.finished = true,
            Frame::Snapshot(kind, snapshot) => {
                match kind {
                    SnapshotKind::Created => self.builder.add_created(snapshot),
                    SnapshotKind::Conveyed => self.builder.add_conveyed(snapshot),
                    SnapshotKind::Resynchronized => self.builder.add_resynchronized(snapshot),
                };
            }
            Frame::Neighbor(neighbor) => {
                if let Some(Frame::Snapshot(_, snapshot)) = self.stack.last_mut() {
                    snapshot.neighbors.push(neighbor);
                }
            }
            Frame::Property(property) => match property.target {
                PropertyTarget::Snapshot => {
                    if let Some(Frame::Snapshot(_, snapshot)) = self.stack.last_mut() {
                        snapshot.properties.push(PropertySnapshot {
                            property: property.property,
                            value: (!property.null).then_some(property.text),
                            time_updated: property.time_updated,
                        });
                    }
                }
                PropertyTarget::Change(entity) => {
                    self.builder.add_change(ChangeEvent::new(
                        entity,
                        property.time_updated,
                        ChangeKind::PropertyChanged {
                            property: property.property,
                            value: (!property.null).then_some(property.text),
                        },
                    ));
                }
            },
            Frame::Types(frame) => {
                let kind = match frame.delta {
                    TypesDelta::NeighborAdded(neighbor) => ChangeKind::NeighborAdded {
                        neighbor,
                        roles: frame.types,
                    },
                    TypesDelta::RolesAdded(neighbor) => ChangeKind::RolesAdded {
                        neighbor,
                        roles: frame.types,
                    },
                    TypesDelta::RolesRemoved(neighbor) => ChangeKind::RolesRemoved {
                        neighbor,
                        roles: frame.types,
                    },
                    TypesDelta::TypesAdded => ChangeKind::TypesAdded { types: frame.types },
                    TypesDelta::TypesRemoved => ChangeKind::TypesRemoved { types: frame.types },
                };
                self.builder
                    .add_change(ChangeEvent::new(frame.entity, frame.time_updated, kind));
            }
            Frame::Path(path) => {
                if path.valid {
                    let mut access_path = AccessPath::new(path.hops, path.target);
                    access_path.set_follow_redirects(path.follow_redirects);
                    self.builder.add_requested_first_time_object(access_path);
                } else {
                    tracing::warn!("Omitting first-time request for {} with malformed hop", path.target);
                }
            }
            Frame::Leaf | Frame::Skip => {}
        }
    }

    fn text(&mut self, text: &str) {
        if let Some(Frame::Property(property)) = self.stack.last_mut() {
            property.text.push_str(text);
        }
    }
}

fn read_attributes(e: &BytesStart<'_>) -> Result<Attrs> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Decode(format!("malformed attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn unknown(name: &str) -> Frame {
    tracing::warn!("Skipping unknown element <{}>", name);
    Frame::Skip
}

fn malformed(name: &str) -> Frame {
    tracing::warn!("Omitting <{}> with malformed identifier or time", name);
    Frame::Skip
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn envelope_node(resolver: &IdentifierResolver, field: &str, raw: &str) -> Result<NodeIdentifier> {
    let unescaped = unescape_identifier(raw)
        .ok_or_else(|| Error::Decode(format!("bad escape in {}: {}", field, raw)))?;
    resolver
        .from_external_form(&unescaped)
        .map_err(|e| Error::Decode(format!("bad {}: {}", field, e)))
}

fn entity_attr(attrs: &Attrs, key: &str) -> Option<EntityId> {
    let raw = attrs.get(key)?;
    match unescape_identifier(raw) {
        Some(id) => Some(EntityId::new(id)),
        None => {
            tracing::warn!("Malformed identifier in {}: {}", key, raw);
            None
        }
    }
}

fn type_attr(attrs: &Attrs, key: &str) -> Option<TypeId> {
    let raw = attrs.get(key)?;
    match unescape_identifier(raw) {
        Some(id) => Some(TypeId::new(id)),
        None => {
            tracing::warn!("Omitting malformed type identifier '{}'", raw);
            None
        }
    }
}

fn time_attr(attrs: &Attrs, key: &str) -> Option<TimeStamp> {
    let raw = attrs.get(key)?;
    match raw.parse() {
        Ok(time) => Some(time),
        Err(_) => {
            tracing::warn!("Malformed timestamp in {}: {}", key, raw);
            None
        }
    }
}

fn stamped_type(attrs: &Attrs) -> Option<TypeStamp> {
    let id = type_attr(attrs, ATTR_ID)?;
    let time_updated = time_attr(attrs, ATTR_TIME_UPDATED)?;
    Some(TypeStamp { id, time_updated })
}

fn property_frame(target: PropertyTarget, attrs: &Attrs) -> Option<PropertyFrame> {
    let property = attrs.get(ATTR_TYPE).and_then(|raw| unescape_identifier(raw));
    let time_updated = time_attr(attrs, ATTR_TIME_UPDATED);
    match (property, time_updated) {
        (Some(property), Some(time_updated)) => Some(PropertyFrame {
            target,
            property: PropertyType::new(property),
            null: attrs.get(ATTR_NULL).and_then(|raw| parse_bool(raw)).unwrap_or(false),
            time_updated,
            text: String::new(),
        }),
        _ => {
            tracing::warn!("Omitting property with malformed type or time");
            None
        }
    }
}

fn hop(resolver: &IdentifierResolver, attrs: &Attrs) -> Option<AccessPathHop> {
    let raw = attrs.get(ATTR_NODE)?;
    let node = match unescape_identifier(raw).map(|id| resolver.from_external_form(&id)) {
        Some(Ok(node)) => node,
        Some(Err(e)) => {
            tracing::warn!("Malformed hop identifier {}: {}", raw, e);
            return None;
        }
        None => {
            tracing::warn!("Malformed hop escape {}", raw);
            return None;
        }
    };
    match attrs.get(ATTR_COHERENCE) {
        None => Some(AccessPathHop::new(node)),
        Some(raw) => match CoherenceSpecification::from_external_form(raw) {
            Some(coherence) => Some(AccessPathHop::with_coherence(node, coherence)),
            None => {
                tracing::warn!("Omitting malformed coherence '{}'", raw);
                Some(AccessPathHop::new(node))
            }
        },
    }
}

/// Snapshot header; timestamps other than the id degrade to defaults
fn snapshot(attrs: &Attrs) -> Option<EntitySnapshot> {
    let id = entity_attr(attrs, ATTR_ID)?;
    let time = |key: &str| -> TimeStamp {
        if attrs.contains_key(key) {
            time_attr(attrs, key).unwrap_or_default()
        } else {
            0
        }
    };
    Some(EntitySnapshot {
        time_created: time(ATTR_TIME_CREATED),
        time_updated: time(ATTR_TIME_UPDATED),
        time_read: time(ATTR_TIME_READ),
        time_expires: attrs
            .get(ATTR_TIME_EXPIRES)
            .and_then(|_| time_attr(attrs, ATTR_TIME_EXPIRES)),
        give_up_lock: attrs
            .get(ATTR_GIVE_UP_LOCK)
            .and_then(|raw| parse_bool(raw))
            .unwrap_or(true),
        types: Vec::new(),
        properties: Vec::new(),
        neighbors: Vec::new(),
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;

    fn resolver() -> IdentifierResolver {
        IdentifierResolver::new(&ResolverConfig::default())
    }

    #[test]
    fn test_decode_hand_written_message() {
        let xml = br#"<?xml version="1.0"?>
<message requestId="2" responseId="1" sender="http://a.example/">
  <conveyed id="e1" timeCreated="1" timeUpdated="3" timeRead="3">
    <type id="Person" timeUpdated="1"/>
    <property type="name" timeUpdated="3">Alice &amp; co</property>
    <neighbor id="e2" timeUpdated="2"><type id="knows" timeUpdated="2"/></neighbor>
  </conveyed>
</message>"#;
        let msg = decode(xml, &resolver()).unwrap();
        assert_eq!(msg.request_id(), 2);
        assert_eq!(msg.response_id(), Some(1));
        assert_eq!(msg.sender().unwrap().canonical_form(), "http://a.example/");

        let snapshot = &msg.conveyed()[0];
        assert!(snapshot.give_up_lock);
        assert_eq!(snapshot.types[0].id.as_str(), "Person");
        assert_eq!(snapshot.properties[0].value.as_deref(), Some("Alice & co"));
        assert_eq!(snapshot.neighbors[0].roles[0].id.as_str(), "knows");
    }

    #[test]
    fn test_second_root_is_rejected() {
        let xml = br#"<message requestId="1"/><message requestId="2"/>"#;
        assert!(decode(xml, &resolver()).is_err());
    }

    #[test]
    fn test_snapshot_without_id_is_omitted() {
        let xml = br#"<message requestId="1"><conveyed timeCreated="1"><type id="T" timeUpdated="1"/></conveyed></message>"#;
        let msg = decode(xml, &resolver()).unwrap();
        assert!(msg.conveyed().is_empty());
    }
}
