//! Identifier Resolver
//!
//! Parses and canonicalizes node identifiers against a configured scheme
//! table. Built once at startup from [`ResolverConfig`] and shared.

use url::Url;

use super::{AccessPath, AccessPathHop, EntityId, NodeIdentifier};
use crate::config::ResolverConfig;
use crate::error::{Error, Result};

/// Global-context symbols that mark an XRI
const XRI_GLOBAL_CONTEXTS: [char; 2] = ['=', '@'];

/// Proxy resolver prefix for XRIs
const XRI_RESOLVER_PREFIX: &str = "http://xri.net/";

/// Resolves raw strings into canonical [`NodeIdentifier`]s
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    /// Recognized schemes, lower-cased, in match order
    schemes: Vec<String>,
    /// Scheme inserted when guessing
    default_scheme: String,
}

impl IdentifierResolver {
    /// Create a resolver from configuration
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            schemes: config
                .schemes
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            default_scheme: config.default_scheme.to_ascii_lowercase(),
        }
    }

    /// Supported scheme names, in match order
    pub fn supported_schemes(&self) -> &[String] {
        &self.schemes
    }

    /// Resolve a raw string into an identifier.
    ///
    /// With `guess_protocol` set, input without a scheme separator is
    /// completed: relative to `context` when given, otherwise by inserting
    /// the default scheme.
    pub fn resolve(
        &self,
        context: Option<&NodeIdentifier>,
        raw: &str,
        guess_protocol: bool,
    ) -> Result<NodeIdentifier> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid(raw, "identifier is empty"));
        }

        let candidate = if has_scheme(trimmed) {
            trimmed.to_string()
        } else if guess_protocol {
            self.guess_form(context, trimmed)?
        } else {
            return Err(invalid(raw, "missing scheme"));
        };

        self.match_scheme(&candidate)?;
        canonicalize(&candidate)
    }

    /// Resolve with protocol guessing and no context
    pub fn guess(&self, raw: &str) -> Result<NodeIdentifier> {
        self.resolve(None, raw, true)
    }

    /// Strict parse of a previously canonicalized string
    pub fn from_external_form(&self, raw: &str) -> Result<NodeIdentifier> {
        self.resolve(None, raw, false)
    }

    /// Compose an access path from raw hop strings.
    ///
    /// Each hop is resolved relative to the previous one (the first relative
    /// to `context`). Blank hops are rejected.
    pub fn compose_path(
        &self,
        context: Option<&NodeIdentifier>,
        hops: &[&str],
        target: &str,
        as_entered: Option<&str>,
    ) -> Result<AccessPath> {
        let mut resolved: Vec<AccessPathHop> = Vec::with_capacity(hops.len());
        for (index, raw) in hops.iter().enumerate() {
            if raw.trim().is_empty() {
                return Err(Error::EmptyHop { index });
            }
            let hop_context = resolved.last().map(|h| h.node()).or(context);
            let node = self.resolve(hop_context, raw, true)?;
            resolved.push(AccessPathHop::new(node));
        }

        let mut path = AccessPath::new(resolved, EntityId::new(target));
        if let Some(entered) = as_entered {
            path = path.with_as_entered(entered);
        }
        Ok(path)
    }

    /// Complete a scheme-less string
    fn guess_form(&self, context: Option<&NodeIdentifier>, raw: &str) -> Result<String> {
        if raw.starts_with(XRI_GLOBAL_CONTEXTS) {
            return Ok(format!("{}{}", XRI_RESOLVER_PREFIX, raw));
        }

        if let Some(context) = context {
            let base = Url::parse(context.canonical_form())
                .map_err(|e| invalid(context.canonical_form(), &e.to_string()))?;
            let joined = base.join(raw).map_err(|e| invalid(raw, &e.to_string()))?;
            return Ok(joined.to_string());
        }

        if raw.starts_with('/') {
            return Ok(format!("file://{}", raw));
        }

        if raw.contains('/') {
            Ok(format!("{}://{}", self.default_scheme, raw))
        } else {
            Ok(format!("{}://{}/", self.default_scheme, raw))
        }
    }

    /// First configured scheme whose name prefixes the lower-cased input
    fn match_scheme(&self, candidate: &str) -> Result<&str> {
        let lower = candidate.to_ascii_lowercase();
        for scheme in &self.schemes {
            if lower.len() > scheme.len()
                && lower.starts_with(scheme.as_str())
                && lower.as_bytes()[scheme.len()] == b':'
            {
                return Ok(scheme);
            }
        }

        let attempted = lower
            .split_once(':')
            .map(|(s, _)| s.to_string())
            .unwrap_or(lower.clone());
        Err(Error::UnknownProtocol {
            attempted,
            supported: self.schemes.clone(),
        })
    }
}

/// True if the string starts with `scheme://`
fn has_scheme(raw: &str) -> bool {
    match raw.split_once("://") {
        Some((scheme, _)) => {
            let mut chars = scheme.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Parse and serialize through `url`, which lower-cases scheme and host,
/// strips default ports and normalizes an empty path to `/`.
fn canonicalize(candidate: &str) -> Result<NodeIdentifier> {
    let url = Url::parse(candidate).map_err(|e| invalid(candidate, &e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(invalid(candidate, "identifier must be hierarchical"));
    }
    Ok(NodeIdentifier::from_canonical(url.to_string()))
}

fn invalid(raw: &str, reason: &str) -> Error {
    Error::InvalidIdentifier {
        raw: raw.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> IdentifierResolver {
        IdentifierResolver::new(&ResolverConfig::default())
    }

    #[test]
    fn test_guess_bare_host() {
        let id = resolver().guess("Example.COM").unwrap();
        assert_eq!(id.canonical_form(), "http://example.com/");
    }

    #[test]
    fn test_strips_default_ports() {
        let r = resolver();
        assert_eq!(
            r.guess("http://a.example:80/x").unwrap().canonical_form(),
            "http://a.example/x"
        );
        assert_eq!(
            r.guess("https://a.example:443/").unwrap().canonical_form(),
            "https://a.example/"
        );
        assert_eq!(
            r.guess("https://a.example:8443/").unwrap().canonical_form(),
            "https://a.example:8443/"
        );
    }

    #[test]
    fn test_guess_file_path() {
        let id = resolver().guess("/var/lib/meshbase/data").unwrap();
        assert_eq!(id.canonical_form(), "file:///var/lib/meshbase/data");
        assert_eq!(id.scheme(), "file");
    }

    #[test]
    fn test_guess_xri() {
        let id = resolver().guess("=alice").unwrap();
        assert_eq!(id.canonical_form(), "http://xri.net/=alice");
    }

    #[test]
    fn test_guess_relative_to_context() {
        let r = resolver();
        let context = r.guess("http://a.example/base/").unwrap();
        let id = r.resolve(Some(&context), "child", true).unwrap();
        assert_eq!(id.canonical_form(), "http://a.example/base/child");
    }

    #[test]
    fn test_unknown_protocol() {
        let err = resolver().guess("ftp://x.example/").unwrap_err();
        match err {
            Error::UnknownProtocol { attempted, supported } => {
                assert_eq!(attempted, "ftp");
                assert_eq!(supported, vec!["http", "https", "file"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_first_matching_scheme_wins() {
        let r = IdentifierResolver::new(&ResolverConfig {
            schemes: vec!["https".into(), "http".into()],
            default_scheme: "https".into(),
        });
        assert_eq!(r.guess("HTTP://a.example/").unwrap().scheme(), "http");
        assert_eq!(r.guess("a.example").unwrap().scheme(), "https");
    }

    #[test]
    fn test_strict_form_does_not_guess() {
        let r = resolver();
        assert!(r.from_external_form("a.example").is_err());
        assert!(r.from_external_form("http://a.example/").is_ok());
        assert!(r.from_external_form("   ").is_err());
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let r = resolver();
        for raw in [
            "a.example",
            "HTTP://A.Example:80",
            "https://b.example:443/path/to?q=1",
            "/tmp/store",
            "@org*group",
            "http://c.example/x#frag",
            "localhost:8080",
        ] {
            let first = r.guess(raw).unwrap();
            let second = r.guess(first.canonical_form()).unwrap();
            assert_eq!(first, second, "not idempotent for {raw}");
            assert_eq!(r.from_external_form(first.canonical_form()).unwrap(), first);
        }
    }

    #[test]
    fn test_compose_path_rejects_blank_hop() {
        let r = resolver();
        let err = r
            .compose_path(None, &["a.example", " "], "e1", None)
            .unwrap_err();
        assert!(matches!(err, Error::EmptyHop { index: 1 }));
    }

    #[test]
    fn test_compose_path_chains_context() {
        let r = resolver();
        let path = r
            .compose_path(None, &["a.example", "http://b.example/"], "e1", Some("a!b#e1"))
            .unwrap();
        assert_eq!(path.hops().len(), 2);
        assert_eq!(path.hops()[0].node().canonical_form(), "http://a.example/");
        assert_eq!(path.target().as_str(), "e1");
        assert_eq!(path.as_entered(), Some("a!b#e1"));
    }
}
