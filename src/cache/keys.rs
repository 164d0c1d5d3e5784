//! Cache key definitions.
//!
//! Keys are plain strings of the form `resource:segment:segment`, e.g.
//! `releases:user42` or `tickets:unread`. The leading segment names the
//! backend resource so that every key of a resource can be invalidated at once.

use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use thiserror::Error;

const SEPARATOR: char = ':';

/// Backend resources read through the cabinet and the admin back office.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Release submissions and their moderation state.
    Releases,
    /// Support tickets and their messages.
    Tickets,
    /// Payout requests and balances.
    Payouts,
    /// Label news posts.
    News,
    /// Artist and admin user profiles.
    Profiles,
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::Releases,
        Resource::Tickets,
        Resource::Payouts,
        Resource::News,
        Resource::Profiles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Releases => "releases",
            Resource::Tickets => "tickets",
            Resource::Payouts => "payouts",
            Resource::News => "news",
            Resource::Profiles => "profiles",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource `{0}`")]
pub struct UnknownResource(pub String);

impl FromStr for Resource {
    type Err = UnknownResource;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|resource| resource.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownResource(value.to_string()))
    }
}

/// Identifier of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Start a key for an arbitrary resource name.
    pub fn new(resource: impl Into<String>) -> Self {
        Self(resource.into())
    }

    /// Start a key for one of the known backend resources.
    pub fn for_resource(resource: Resource) -> Self {
        Self::new(resource.as_str())
    }

    /// Append a `:segment` to the key.
    pub fn segment(mut self, segment: impl fmt::Display) -> Self {
        use fmt::Write;

        // Writing into a String cannot fail.
        let _ = write!(self.0, "{SEPARATOR}{segment}");
        self
    }

    /// Append a hash of query parameters, independent of their order.
    pub fn params<K, V>(self, params: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let hash = hash_params(params);
        self.segment(format!("{hash:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The leading segment, which names the resource.
    pub fn resource(&self) -> &str {
        self.0
            .split_once(SEPARATOR)
            .map_or(self.0.as_str(), |(resource, _)| resource)
    }

    /// True when the key equals `prefix` or continues it at a segment boundary.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        match self.0.strip_prefix(prefix) {
            Some("") => true,
            Some(rest) => prefix.ends_with(SEPARATOR) || rest.starts_with(SEPARATOR),
            None => false,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Resource> for CacheKey {
    fn from(value: Resource) -> Self {
        Self::for_resource(value)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Hash Utilities
// ============================================================================

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hash query parameters for key generation, ignoring their order.
pub fn hash_params<K, V>(params: &[(K, V)]) -> u64
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(&str, &str)> = params
        .iter()
        .map(|(key, value)| (key.as_ref(), value.as_ref()))
        .collect();
    pairs.sort_unstable();
    hash_value(&pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_joins_segments() {
        let key = CacheKey::for_resource(Resource::Releases).segment("user42");
        assert_eq!(key.as_str(), "releases:user42");
        assert_eq!(key, CacheKey::from("releases:user42"));
        assert_eq!(key.resource(), "releases");
    }

    #[test]
    fn resources_parse_case_insensitively() {
        assert_eq!("Tickets".parse::<Resource>(), Ok(Resource::Tickets));
        assert_eq!(
            "royalties".parse::<Resource>(),
            Err(UnknownResource("royalties".to_string()))
        );
    }

    #[test]
    fn resource_of_bare_key_is_whole_key() {
        assert_eq!(CacheKey::from("news").resource(), "news");
    }

    #[test]
    fn prefix_matches_only_on_segment_boundary() {
        let key = CacheKey::from("tickets:unread");
        assert!(key.has_prefix("tickets"));
        assert!(key.has_prefix("tickets:"));
        assert!(key.has_prefix("tickets:unread"));
        assert!(!key.has_prefix("tick"));
        assert!(!CacheKey::from("ticketsarchive").has_prefix("tickets"));
    }

    #[test]
    fn params_hash_is_order_independent() {
        let a = CacheKey::for_resource(Resource::Payouts).params(&[("status", "open"), ("page", "2")]);
        let b = CacheKey::for_resource(Resource::Payouts).params(&[("page", "2"), ("status", "open")]);
        assert_eq!(a, b);
        assert!(a.has_prefix("payouts"));
    }

    #[test]
    fn different_params_produce_different_hashes() {
        assert_ne!(
            hash_params(&[("page", "1")]),
            hash_params(&[("page", "2")])
        );
    }
}
