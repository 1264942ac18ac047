//! Access Paths
//!
//! An access path says how to reach a remote entity: traverse hop 1, then
//! hop 2, and so on, then ask for the target entity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use super::{EntityId, NodeIdentifier};

/// How a replica obtained over a hop should be kept up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoherenceSpecification {
    /// Obtain once, never refresh
    OneTimeOnly,
    /// Refresh at a fixed period
    Periodic { period_ms: u64 },
    /// Refresh between a minimum and maximum period depending on change rate
    Adaptive { min_ms: u64, max_ms: u64 },
}

impl CoherenceSpecification {
    /// Periodic refresh
    pub fn periodic(period: Duration) -> Self {
        CoherenceSpecification::Periodic {
            period_ms: period.as_millis() as u64,
        }
    }

    /// Wire form, e.g. `once`, `periodic:30000`, `adaptive:1000-60000`
    pub fn to_external_form(&self) -> String {
        match self {
            CoherenceSpecification::OneTimeOnly => "once".to_string(),
            CoherenceSpecification::Periodic { period_ms } => format!("periodic:{}", period_ms),
            CoherenceSpecification::Adaptive { min_ms, max_ms } => {
                format!("adaptive:{}-{}", min_ms, max_ms)
            }
        }
    }

    /// Parse the wire form; `None` if malformed
    pub fn from_external_form(raw: &str) -> Option<Self> {
        if raw == "once" {
            return Some(CoherenceSpecification::OneTimeOnly);
        }
        if let Some(period) = raw.strip_prefix("periodic:") {
            return period
                .parse()
                .ok()
                .map(|period_ms| CoherenceSpecification::Periodic { period_ms });
        }
        if let Some(range) = raw.strip_prefix("adaptive:") {
            let (min, max) = range.split_once('-')?;
            let min_ms: u64 = min.parse().ok()?;
            let max_ms: u64 = max.parse().ok()?;
            if min_ms > max_ms {
                return None;
            }
            return Some(CoherenceSpecification::Adaptive { min_ms, max_ms });
        }
        None
    }
}

/// One hop of an access path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessPathHop {
    node: NodeIdentifier,
    coherence: Option<CoherenceSpecification>,
}

impl AccessPathHop {
    /// Hop without a coherence policy
    pub fn new(node: NodeIdentifier) -> Self {
        Self {
            node,
            coherence: None,
        }
    }

    /// Hop with a coherence policy
    pub fn with_coherence(node: NodeIdentifier, coherence: CoherenceSpecification) -> Self {
        Self {
            node,
            coherence: Some(coherence),
        }
    }

    pub fn node(&self) -> &NodeIdentifier {
        &self.node
    }

    pub fn coherence(&self) -> Option<CoherenceSpecification> {
        self.coherence
    }
}

/// Ordered hops plus a target entity.
///
/// Equality and hashing cover the hop sequence and the target only; the
/// follow-redirects flag and the as-entered text are configuration.
#[derive(Debug, Clone)]
pub struct AccessPath {
    hops: Vec<AccessPathHop>,
    target: EntityId,
    follow_redirects: bool,
    as_entered: Option<String>,
}

impl AccessPath {
    /// Create a path
    pub fn new(hops: Vec<AccessPathHop>, target: EntityId) -> Self {
        Self {
            hops,
            target,
            follow_redirects: true,
            as_entered: None,
        }
    }

    /// Path to an entity on the receiving node itself
    pub fn local(target: EntityId) -> Self {
        Self::new(Vec::new(), target)
    }

    /// Single-hop path
    pub fn via(node: NodeIdentifier, target: EntityId) -> Self {
        Self::new(vec![AccessPathHop::new(node)], target)
    }

    /// Attach the text the user originally typed
    pub fn with_as_entered(mut self, as_entered: impl Into<String>) -> Self {
        self.as_entered = Some(as_entered.into());
        self
    }

    pub fn hops(&self) -> &[AccessPathHop] {
        &self.hops
    }

    pub fn target(&self) -> &EntityId {
        &self.target
    }

    pub fn as_entered(&self) -> Option<&str> {
        self.as_entered.as_deref()
    }

    /// True if no hops remain
    pub fn is_local(&self) -> bool {
        self.hops.is_empty()
    }

    /// The first hop's node, if any
    pub fn first_hop(&self) -> Option<&NodeIdentifier> {
        self.hops.first().map(|h| h.node())
    }

    /// The path as seen from the first hop
    pub fn rest(&self) -> AccessPath {
        AccessPath {
            hops: self.hops.iter().skip(1).cloned().collect(),
            target: self.target.clone(),
            follow_redirects: self.follow_redirects,
            as_entered: None,
        }
    }

    /// Drop leading hops naming `node`
    pub fn strip_leading(&self, node: &NodeIdentifier) -> AccessPath {
        let skip = self.hops.iter().take_while(|h| h.node() == node).count();
        AccessPath {
            hops: self.hops[skip..].to_vec(),
            target: self.target.clone(),
            follow_redirects: self.follow_redirects,
            as_entered: self.as_entered.clone(),
        }
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    pub fn set_follow_redirects(&mut self, follow: bool) {
        self.follow_redirects = follow;
    }
}

impl PartialEq for AccessPath {
    fn eq(&self, other: &Self) -> bool {
        self.hops == other.hops && self.target == other.target
    }
}

impl Eq for AccessPath {}

impl Hash for AccessPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hops.hash(state);
        self.target.hash(state);
    }
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hop) in self.hops.iter().enumerate() {
            if i > 0 {
                f.write_str("!")?;
            }
            write!(f, "{}", hop.node())?;
        }
        write!(f, "#{}", self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn node(s: &str) -> NodeIdentifier {
        NodeIdentifier::from_canonical(s.to_string())
    }

    #[test]
    fn test_equality_ignores_follow_redirects() {
        let a = AccessPath::via(node("http://a.example/"), EntityId::from("e1"));
        let mut b = a.clone().with_as_entered("a#e1");
        b.set_follow_redirects(false);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        let a = node("http://a.example/");
        let b = node("http://b.example/");
        let ab = AccessPath::new(
            vec![AccessPathHop::new(a.clone()), AccessPathHop::new(b.clone())],
            EntityId::from("e1"),
        );
        let ba = AccessPath::new(
            vec![AccessPathHop::new(b), AccessPathHop::new(a)],
            EntityId::from("e1"),
        );
        assert_ne!(ab, ba);
        assert_eq!(ab.to_string(), "http://a.example/!http://b.example/#e1");
    }

    #[test]
    fn test_rest_and_strip() {
        let a = node("http://a.example/");
        let b = node("http://b.example/");
        let path = AccessPath::new(
            vec![AccessPathHop::new(a.clone()), AccessPathHop::new(b.clone())],
            EntityId::from("e1"),
        );
        assert_eq!(path.first_hop(), Some(&a));
        assert_eq!(path.rest().first_hop(), Some(&b));
        assert_eq!(path.strip_leading(&a).hops().len(), 1);
        assert_eq!(path.strip_leading(&b).hops().len(), 2);
        assert!(path.rest().rest().is_local());
    }

    #[test]
    fn test_coherence_external_form() {
        for spec in [
            CoherenceSpecification::OneTimeOnly,
            CoherenceSpecification::periodic(Duration::from_secs(30)),
            CoherenceSpecification::Adaptive { min_ms: 1000, max_ms: 60000 },
        ] {
            let parsed = CoherenceSpecification::from_external_form(&spec.to_external_form());
            assert_eq!(parsed, Some(spec));
        }
        assert_eq!(CoherenceSpecification::from_external_form("periodic:x"), None);
        assert_eq!(CoherenceSpecification::from_external_form("adaptive:9-1"), None);
    }
}
