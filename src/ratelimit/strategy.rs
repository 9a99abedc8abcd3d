//! Client key strategies.

use super::request::ClientRequest;

/// Where a per-client bucket key comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClientKeyStrategy {
    /// No client key; only global limiting applies
    #[default]
    None,
    /// Value of the named header
    Header(String),
    /// Resolved client IP address
    Ip,
    /// Value of the named request parameter
    Param(String),
}

impl ClientKeyStrategy {
    /// Derive the client key for `request`.
    ///
    /// Returns `None` when the source is absent or empty, and always for
    /// [`ClientKeyStrategy::None`].
    pub fn extract_key<R: ClientRequest + ?Sized>(&self, request: &R) -> Option<String> {
        let key = match self {
            ClientKeyStrategy::None => return None,
            ClientKeyStrategy::Header(name) => request.header(name)?.to_string(),
            ClientKeyStrategy::Ip => request.client_ip()?.to_string(),
            ClientKeyStrategy::Param(name) => request.param(name)?.to_string(),
        };

        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }

    /// Whether this strategy can produce per-client keys at all.
    pub fn is_keyed(&self) -> bool {
        match self {
            ClientKeyStrategy::None => false,
            ClientKeyStrategy::Ip => true,
            ClientKeyStrategy::Header(name) | ClientKeyStrategy::Param(name) => !name.is_empty(),
        }
    }
}

impl std::fmt::Display for ClientKeyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientKeyStrategy::None => write!(f, "none"),
            ClientKeyStrategy::Header(name) => write!(f, "header:{}", name),
            ClientKeyStrategy::Ip => write!(f, "ip"),
            ClientKeyStrategy::Param(name) => write!(f, "param:{}", name),
        }
    }
}

/// What to do with a request whose client key cannot be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingKeyPolicy {
    /// All keyless requests share one dedicated bucket
    #[default]
    Shared,
    /// Keyless requests are denied
    Deny,
}
