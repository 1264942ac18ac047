//! Identifiers
//!
//! Node identifiers, node-scoped entity identifiers, type identifiers and
//! the access paths composed from them.

mod access_path;
mod resolver;

pub use access_path::{AccessPath, AccessPathHop, CoherenceSpecification};
pub use resolver::IdentifierResolver;

use std::fmt;

/// Canonical identifier of a mesh base.
///
/// Only obtainable through an [`IdentifierResolver`], which guarantees the
/// wrapped string is in canonical form. Two identifiers are equal iff their
/// canonical forms are equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentifier {
    canonical: String,
}

impl NodeIdentifier {
    pub(crate) fn from_canonical(canonical: String) -> Self {
        Self { canonical }
    }

    /// The canonical external form
    pub fn canonical_form(&self) -> &str {
        &self.canonical
    }

    /// The scheme part, lower-cased
    pub fn scheme(&self) -> &str {
        self.canonical
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .unwrap_or("")
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentifier({})", self.canonical)
    }
}

macro_rules! string_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw key
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// The raw key
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_identifier!(
    /// Node-scoped key of a replicated entity; globally unique only together
    /// with its home node's identifier.
    EntityId
);

string_identifier!(
    /// Identifier of an entity type or a relationship role
    TypeId
);

string_identifier!(
    /// Identifier of a property
    PropertyType
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_of_identifier() {
        let id = NodeIdentifier::from_canonical("https://a.example/".to_string());
        assert_eq!(id.scheme(), "https");
        assert_eq!(id.to_string(), "https://a.example/");
    }

    #[test]
    fn test_entity_id_ordering() {
        let mut ids = vec![EntityId::from("b"), EntityId::from("a")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "a");
    }
}
