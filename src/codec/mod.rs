//! Wire Codec
//!
//! Serializes replication messages to and from UTF-8 XML.
//!
//! # Format
//!
//! ```text
//! <message requestId="3" responseId="2" sender="http://a.example/" receiver="http://b.example/">
//!   <requestedFirstTimeObject target="e1" follow="true"><hop node="http://a.example/"/></requestedFirstTimeObject>
//!   <conveyed id="e1" timeCreated="1" timeUpdated="2" timeRead="2" giveUpLock="true">
//!     <type id="Person" timeUpdated="1"/>
//!     <property type="name" timeUpdated="2">Alice</property>
//!     <neighbor id="e2" timeUpdated="2"><type id="knows" timeUpdated="2"/></neighbor>
//!   </conveyed>
//!   <propertyChange entity="e1" type="name" timeUpdated="5">Bob</propertyChange>
//!   <typesAdded entity="e1" timeUpdated="6"><type id="Employee"/></typesAdded>
//!   <requestedLock entity="e1"/>
//! </message>
//! ```
//!
//! Identifiers in attributes are percent-escaped (`%` as `%25`, `#` as
//! `%23`) so a literal `#` never collides with fragment syntax.

mod decoder;
mod encoder;

use std::sync::Arc;

use crate::error::Result;
use crate::identifier::IdentifierResolver;
use crate::replication::ReplicationMessage;

// Element names
pub(crate) const TAG_MESSAGE: &str = "message";
pub(crate) const TAG_FIRST_TIME: &str = "requestedFirstTimeObject";
pub(crate) const TAG_HOP: &str = "hop";
pub(crate) const TAG_CANCELED: &str = "requestedCanceledObject";
pub(crate) const TAG_DELETED: &str = "deleted";
pub(crate) const TAG_CREATED: &str = "created";
pub(crate) const TAG_CONVEYED: &str = "conveyed";
pub(crate) const TAG_RESYNCHRONIZED: &str = "resynchronized";
pub(crate) const TAG_TYPE: &str = "type";
pub(crate) const TAG_PROPERTY: &str = "property";
pub(crate) const TAG_NEIGHBOR: &str = "neighbor";
pub(crate) const TAG_PROPERTY_CHANGE: &str = "propertyChange";
pub(crate) const TAG_NEIGHBOR_ADDED: &str = "neighborAdded";
pub(crate) const TAG_NEIGHBOR_REMOVED: &str = "neighborRemoved";
pub(crate) const TAG_ROLES_ADDED: &str = "rolesAdded";
pub(crate) const TAG_ROLES_REMOVED: &str = "rolesRemoved";
pub(crate) const TAG_TYPES_ADDED: &str = "typesAdded";
pub(crate) const TAG_TYPES_REMOVED: &str = "typesRemoved";
pub(crate) const TAG_REQUESTED_LOCK: &str = "requestedLock";
pub(crate) const TAG_PUSH_LOCK: &str = "pushLock";
pub(crate) const TAG_RECLAIMED_LOCK: &str = "reclaimedLock";
pub(crate) const TAG_REQUESTED_RESYNC: &str = "requestedResynchronize";

// Attribute names
pub(crate) const ATTR_REQUEST_ID: &str = "requestId";
pub(crate) const ATTR_RESPONSE_ID: &str = "responseId";
pub(crate) const ATTR_SENDER: &str = "sender";
pub(crate) const ATTR_RECEIVER: &str = "receiver";
pub(crate) const ATTR_CEASE: &str = "cease";
pub(crate) const ATTR_TARGET: &str = "target";
pub(crate) const ATTR_FOLLOW: &str = "follow";
pub(crate) const ATTR_NODE: &str = "node";
pub(crate) const ATTR_COHERENCE: &str = "coherence";
pub(crate) const ATTR_ENTITY: &str = "entity";
pub(crate) const ATTR_ID: &str = "id";
pub(crate) const ATTR_NEIGHBOR: &str = "neighbor";
pub(crate) const ATTR_TYPE: &str = "type";
pub(crate) const ATTR_NULL: &str = "null";
pub(crate) const ATTR_TIME_CREATED: &str = "timeCreated";
pub(crate) const ATTR_TIME_UPDATED: &str = "timeUpdated";
pub(crate) const ATTR_TIME_READ: &str = "timeRead";
pub(crate) const ATTR_TIME_EXPIRES: &str = "timeExpires";
pub(crate) const ATTR_GIVE_UP_LOCK: &str = "giveUpLock";

/// Encodes and decodes [`ReplicationMessage`]s
#[derive(Debug, Clone)]
pub struct WireCodec {
    resolver: Arc<IdentifierResolver>,
}

impl WireCodec {
    /// Create a codec that parses node identifiers with `resolver`
    pub fn new(resolver: Arc<IdentifierResolver>) -> Self {
        Self { resolver }
    }

    /// Serialize a message
    pub fn encode(&self, message: &ReplicationMessage) -> Result<Vec<u8>> {
        encoder::encode(message)
    }

    /// Parse a message
    pub fn decode(&self, bytes: &[u8]) -> Result<ReplicationMessage> {
        decoder::decode(bytes, &self.resolver)
    }
}

/// Escape `%` and `#` in an identifier
pub(crate) fn escape_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '#' => out.push_str("%23"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse [`escape_identifier`]; `None` on a malformed escape sequence
pub(crate) fn unescape_identifier(escaped: &str) -> Option<String> {
    if !escaped.contains('%') {
        return Some(escaped.to_string());
    }

    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped.get(i + 1..i + 3)?;
            let value = u8::from_str_radix(hex, 16).ok()?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::identifier::{
        AccessPath, AccessPathHop, CoherenceSpecification, EntityId, PropertyType, TypeId,
    };
    use crate::replication::{
        ChangeEvent, ChangeKind, DeletedEntity, EntitySnapshot, NeighborSnapshot,
        PropertySnapshot, TypeStamp,
    };

    fn codec() -> (WireCodec, Arc<IdentifierResolver>) {
        let resolver = Arc::new(IdentifierResolver::new(&ResolverConfig::default()));
        (WireCodec::new(resolver.clone()), resolver)
    }

    fn snapshot(id: &str) -> EntitySnapshot {
        EntitySnapshot {
            id: EntityId::from(id),
            time_created: 10,
            time_updated: 20,
            time_read: 30,
            time_expires: Some(-1),
            give_up_lock: false,
            types: vec![TypeStamp {
                id: TypeId::from("Person"),
                time_updated: 10,
            }],
            properties: vec![
                PropertySnapshot {
                    property: PropertyType::from("name"),
                    value: Some("Alice & <Bob>".into()),
                    time_updated: 20,
                },
                PropertySnapshot {
                    property: PropertyType::from("nickname"),
                    value: None,
                    time_updated: 15,
                },
                PropertySnapshot {
                    property: PropertyType::from("empty"),
                    value: Some(String::new()),
                    time_updated: 16,
                },
                PropertySnapshot {
                    property: PropertyType::from("spaced"),
                    value: Some("  leading and trailing\n".into()),
                    time_updated: 17,
                },
            ],
            neighbors: vec![NeighborSnapshot {
                neighbor: EntityId::from("e#2"),
                roles: vec![TypeStamp {
                    id: TypeId::from("knows"),
                    time_updated: 19,
                }],
                time_updated: 18,
            }],
        }
    }

    fn maximal(resolver: &IdentifierResolver) -> ReplicationMessage {
        let a = resolver.guess("a.example").unwrap();
        let b = resolver.guess("https://b.example:8443/x#frag").unwrap();
        let mut path = AccessPath::new(
            vec![
                AccessPathHop::new(a.clone()),
                AccessPathHop::with_coherence(
                    b.clone(),
                    CoherenceSpecification::Adaptive { min_ms: 5, max_ms: 10 },
                ),
            ],
            EntityId::from("100%#odd"),
        );
        path.set_follow_redirects(false);

        let mut builder = ReplicationMessage::builder()
            .request_id(12)
            .response_id(11)
            .sender(a)
            .receiver(b)
            .cease_communications(true);
        builder
            .add_requested_first_time_object(path)
            .add_requested_first_time_object(AccessPath::local(EntityId::from("")))
            .add_requested_canceled_object(EntityId::from("c1"))
            .add_deleted(DeletedEntity {
                entity: EntityId::from("d1"),
                time_updated: -5,
            })
            .add_created(snapshot("n1"))
            .add_conveyed(snapshot("v1"))
            .add_conveyed(EntitySnapshot::new(EntityId::from("v2"), 1))
            .add_change(ChangeEvent::new(
                EntityId::from("e1"),
                i64::MAX,
                ChangeKind::PropertyChanged {
                    property: PropertyType::from("name"),
                    value: None,
                },
            ))
            .add_change(ChangeEvent::new(
                EntityId::from("e1"),
                2,
                ChangeKind::NeighborAdded {
                    neighbor: EntityId::from("e2"),
                    roles: vec![TypeId::from("r1"), TypeId::from("r2")],
                },
            ))
            .add_change(ChangeEvent::new(
                EntityId::from("e1"),
                3,
                ChangeKind::NeighborRemoved {
                    neighbor: EntityId::from("e3"),
                },
            ))
            .add_change(ChangeEvent::new(
                EntityId::from("e1"),
                4,
                ChangeKind::RolesAdded {
                    neighbor: EntityId::from("e2"),
                    roles: vec![TypeId::from("r3")],
                },
            ))
            .add_change(ChangeEvent::new(
                EntityId::from("e1"),
                5,
                ChangeKind::RolesRemoved {
                    neighbor: EntityId::from("e2"),
                    roles: vec![TypeId::from("r1")],
                },
            ))
            .add_change(ChangeEvent::new(
                EntityId::from("e1"),
                6,
                ChangeKind::TypesAdded {
                    types: vec![TypeId::from("T1")],
                },
            ))
            .add_change(ChangeEvent::new(
                EntityId::from("e1"),
                7,
                ChangeKind::TypesRemoved { types: vec![] },
            ))
            .add_requested_lock(EntityId::from("l1"))
            .add_pushed_lock(EntityId::from("l2"))
            .add_reclaimed_lock(EntityId::from("l3"))
            .add_requested_resynchronize(EntityId::from("s1"))
            .add_resynchronized(snapshot("s1"));
        builder.build()
    }

    #[test]
    fn test_round_trip_empty() {
        let (codec, _) = codec();
        let msg = ReplicationMessage::builder().build();
        let bytes = codec.encode(&msg).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_round_trip_single_delta() {
        let (codec, _) = codec();
        let mut builder = ReplicationMessage::builder().request_id(1);
        builder.add_change(ChangeEvent::new(
            EntityId::from("e1"),
            1_700_000_000_000,
            ChangeKind::PropertyChanged {
                property: PropertyType::from("title"),
                value: Some("hello".into()),
            },
        ));
        let msg = builder.build();
        let bytes = codec.encode(&msg).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_round_trip_maximal() {
        let (codec, resolver) = codec();
        let msg = maximal(&resolver);
        let bytes = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert!(!decoded.requested_first_time_objects()[0].follow_redirects());
        assert_eq!(
            decoded.requested_first_time_objects()[0].hops()[1].coherence(),
            Some(CoherenceSpecification::Adaptive { min_ms: 5, max_ms: 10 })
        );
    }

    #[test]
    fn test_round_trip_blank_keys() {
        let (codec, _) = codec();
        let mut builder = ReplicationMessage::builder().request_id(2);
        builder
            .add_change(ChangeEvent::new(
                EntityId::from("e1"),
                10,
                ChangeKind::TypesAdded {
                    types: vec![TypeId::from(" "), TypeId::from("")],
                },
            ))
            .add_change(ChangeEvent::new(
                EntityId::from("e1"),
                11,
                ChangeKind::PropertyChanged {
                    property: PropertyType::from(""),
                    value: Some("v".into()),
                },
            ));
        let msg = builder.build();
        let bytes = codec.encode(&msg).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_hash_is_escaped_on_the_wire() {
        let (codec, resolver) = codec();
        let msg = maximal(&resolver);
        let text = String::from_utf8(codec.encode(&msg).unwrap()).unwrap();
        assert!(text.contains("100%25%23odd"));
        assert!(text.contains("e%232"));
        assert!(!text.contains("e#2"));
    }

    #[test]
    fn test_escape_round_trip() {
        for raw in ["plain", "a#b", "%", "%23", "ü#%x"] {
            assert_eq!(unescape_identifier(&escape_identifier(raw)).as_deref(), Some(raw));
        }
        assert_eq!(unescape_identifier("%G1"), None);
        assert_eq!(unescape_identifier("abc%2"), None);
    }

    #[test]
    fn test_envelope_errors_abort() {
        let (codec, _) = codec();
        assert!(codec.decode(b"<message requestId=\"x\"/>").is_err());
        assert!(codec.decode(b"<message requestId=\"1\" sender=\"ftp://x/\"/>").is_err());
        assert!(codec.decode(b"<other requestId=\"1\"/>").is_err());
        assert!(codec.decode(b"<message requestId=\"1\">").is_err());
        assert!(codec.decode(b"").is_err());
        assert!(codec.decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_malformed_fields_are_omitted() {
        let (codec, _) = codec();
        let xml = br#"<message requestId="4">
            <requestedLock entity="ok"/>
            <requestedLock entity="bad%zz"/>
            <typesAdded entity="e1" timeUpdated="3"><type id="%zz"/><type id="T"/></typesAdded>
            <propertyChange entity="e1" type="p" timeUpdated="nope">v</propertyChange>
            <requestedFirstTimeObject target="e9"><hop node="gopher://x/"/></requestedFirstTimeObject>
        </message>"#;
        let msg = codec.decode(xml).unwrap();
        assert_eq!(msg.requested_locks(), &[EntityId::from("ok")]);
        assert_eq!(msg.changes().len(), 1);
        match &msg.changes()[0].kind {
            ChangeKind::TypesAdded { types } => assert_eq!(types, &vec![TypeId::from("T")]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(msg.requested_first_time_objects().is_empty());
    }

    #[test]
    fn test_unknown_elements_are_skipped() {
        let (codec, _) = codec();
        let xml = br#"<message requestId="4"><futureThing a="1"><nested/></futureThing><pushLock entity="e1"/></message>"#;
        let msg = codec.decode(xml).unwrap();
        assert_eq!(msg.pushed_locks(), &[EntityId::from("e1")]);
    }
}
