//! Store key generation for sliding windows.

/// Identifies one sliding window: a caller on an endpoint under a policy.
///
/// The identifier is wrapped in braces so that, on a clustered store, every
/// window belonging to one caller hashes to the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Policy namespace
    pub prefix: String,
    /// The caller (address, user id or a composite)
    pub identifier: String,
    /// The endpoint being limited
    pub endpoint: String,
}

/// Escape the characters that would let one identifier's key range overlap
/// another's.
fn escape_identifier(identifier: &str) -> String {
    identifier.replace('%', "%25").replace('}', "%7D")
}

impl WindowKey {
    /// Create a new window key.
    pub fn new(prefix: &str, identifier: &str, endpoint: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            identifier: identifier.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    /// The key under which the window's entries are stored.
    pub fn to_store_key(&self) -> String {
        format!("{}{}", Self::identifier_prefix(&self.prefix, &self.identifier), self.endpoint)
    }

    /// Prefix shared by every window of `identifier` under `prefix`.
    pub fn identifier_prefix(prefix: &str, identifier: &str) -> String {
        format!("{}:{{{}}}:", prefix, escape_identifier(identifier))
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}
