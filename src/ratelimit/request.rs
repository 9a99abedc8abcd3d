//! The request surface the limiter reads client keys from.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// What the limiter needs to know about a request.
///
/// Hosts implement this for their own request type. Implementations that sit
/// behind trusted proxies should override [`ClientRequest::client_ip`] to
/// resolve the forwarded address chain.
pub trait ClientRequest {
    /// Value of the named header. Lookup should be case-insensitive.
    fn header(&self, name: &str) -> Option<&str>;

    /// Address of the immediate peer.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Value of a named request parameter or path variable.
    fn param(&self, name: &str) -> Option<&str>;

    /// Resolved client address. Defaults to the peer address.
    fn client_ip(&self) -> Option<IpAddr> {
        self.peer_addr().map(|addr| addr.ip())
    }
}

/// A plain owned request, used by the replay binary and in tests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestParts {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub peer: Option<SocketAddr>,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl RequestParts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

impl ClientRequest for RequestParts {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}
