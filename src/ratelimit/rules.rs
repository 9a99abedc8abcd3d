//! Rate limit settings and their extraction from extra-config blocks.
//!
//! Gateway descriptors carry free-form `extra_config` maps keyed by namespace.
//! This module turns the rate limit namespaces into a strongly typed
//! [`RateLimitConfig`]. Parsing is total: a field with the wrong type or an
//! out-of-range value keeps its zero default and is reported as a
//! [`FieldIssue`], so one bad field never takes the rest of the block down.

use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use super::registry::{OverflowPolicy, RegistryOptions, MAX_ENTRIES_LIMIT};
use super::strategy::{ClientKeyStrategy, MissingKeyPolicy};

/// Namespace of endpoint-level limiters (global and per-client).
pub const ROUTER_NAMESPACE: &str = "qos/ratelimit/router";
/// Namespace of backend-level limiters (global only).
pub const PROXY_NAMESPACE: &str = "qos/ratelimit/proxy";

/// Endpoint namespaces also accepted, in lookup order after [`ROUTER_NAMESPACE`].
const ROUTER_ALIASES: &[&str] = &[
    "github.com/devopsfaith/krakend-ratelimit/rate/router",
    "github.com/devopsfaith/krakend-ratelimit/juju/router",
];
/// Backend namespaces also accepted, in lookup order after [`PROXY_NAMESPACE`].
const PROXY_ALIASES: &[&str] = &[
    "github.com/devopsfaith/krakend-ratelimit/rate/proxy",
    "github.com/devopsfaith/krakend-ratelimit/juju/proxy",
];

/// Free-form extension block attached to endpoints and backends.
pub type ExtraConfig = Map<String, Value>;

/// Why no configuration could be read for a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The namespace is absent; the limiter is simply not wanted
    #[error("no extra config")]
    NotConfigured,
    /// The namespace is present but is not a map
    #[error("wrong extra config for {0}: expected a map")]
    Malformed(String),
}

/// A field that was ignored or reset while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub reason: String,
}

impl std::fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Where a limiter sits in the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterScope {
    /// In front of an endpoint; supports global and per-client limits
    Endpoint,
    /// In front of a single backend call; global limit only
    Backend,
}

impl LimiterScope {
    /// The extra-config namespace read for this scope.
    pub fn namespace(&self) -> &'static str {
        match self {
            LimiterScope::Endpoint => ROUTER_NAMESPACE,
            LimiterScope::Backend => PROXY_NAMESPACE,
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            LimiterScope::Endpoint => ROUTER_ALIASES,
            LimiterScope::Backend => PROXY_ALIASES,
        }
    }
}

/// Source of per-client keys, as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeySource {
    #[default]
    None,
    Header,
    Ip,
    Param,
}

impl KeySource {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" => Some(KeySource::None),
            "header" => Some(KeySource::Header),
            "ip" => Some(KeySource::Ip),
            "param" => Some(KeySource::Param),
            _ => None,
        }
    }

    /// Configuration spelling; empty for [`KeySource::None`].
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySource::None => "",
            KeySource::Header => "header",
            KeySource::Ip => "ip",
            KeySource::Param => "param",
        }
    }
}

/// Immutable rate limit settings for one limiter.
///
/// `Default` is the fully disabled configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RateLimitConfig {
    /// Global tokens per second; 0 disables global limiting
    pub max_rate: f64,
    /// Global burst size; 0 means "same as `max_rate`"
    pub capacity: u64,
    /// Per-client tokens per second; 0 disables client limiting
    pub client_max_rate: f64,
    /// Per-client burst size; 0 means "same as `client_max_rate`"
    pub client_capacity: u64,
    pub strategy: KeySource,
    /// Header or parameter name for keyed strategies
    pub key: String,
    /// Maximum tracked client keys; 0 selects the registry default
    pub max_clients: usize,
    pub overflow: OverflowPolicy,
    pub idle_ttl: Option<Duration>,
    /// Sweep period; only meaningful with `idle_ttl`, which it defaults to
    pub sweep_interval: Option<Duration>,
    pub on_missing_key: MissingKeyPolicy,
}

/// Result of parsing one extra-config block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedConfig {
    pub config: RateLimitConfig,
    pub issues: Vec<FieldIssue>,
}

impl RateLimitConfig {
    /// Read the block for `scope` out of an extra-config map.
    pub fn from_extra_config(
        extra: &ExtraConfig,
        scope: LimiterScope,
    ) -> Result<ParsedConfig, ConfigError> {
        let (namespace, block) = std::iter::once(scope.namespace())
            .chain(scope.aliases().iter().copied())
            .find_map(|namespace| extra.get(namespace).map(|block| (namespace, block)))
            .ok_or(ConfigError::NotConfigured)?;
        let map = block
            .as_object()
            .ok_or_else(|| ConfigError::Malformed(namespace.to_string()))?;

        let mut parsed = Self::from_map(map);
        if scope == LimiterScope::Backend {
            parsed.restrict_to_global();
        }
        Ok(parsed)
    }

    /// Parse a rate limit block. Never fails.
    pub fn from_map(map: &Map<String, Value>) -> ParsedConfig {
        let mut config = RateLimitConfig::default();
        let mut issues = Vec::new();

        for (field, value) in map {
            let outcome = match field.as_str() {
                "max_rate" | "maxRate" => rate(value).map(|v| config.max_rate = v),
                "capacity" => count(value).map(|v| config.capacity = v),
                "client_max_rate" | "clientMaxRate" => {
                    rate(value).map(|v| config.client_max_rate = v)
                }
                "client_capacity" | "clientCapacity" => {
                    count(value).map(|v| config.client_capacity = v)
                }
                "strategy" => text(value).and_then(|s| {
                    KeySource::parse(s)
                        .map(|source| config.strategy = source)
                        .ok_or_else(|| format!("unknown strategy {:?}", s))
                }),
                "key" => text(value).map(|s| config.key = s.to_string()),
                "max_clients" | "maxClients" => count(value).and_then(|v| {
                    usize::try_from(v)
                        .ok()
                        .filter(|&n| n <= MAX_ENTRIES_LIMIT)
                        .map(|n| config.max_clients = n)
                        .ok_or_else(|| format!("must not exceed {}", MAX_ENTRIES_LIMIT))
                }),
                "overflow" => text(value).and_then(|s| match s {
                    "evict" | "lru" => {
                        config.overflow = OverflowPolicy::EvictLru;
                        Ok(())
                    }
                    "reject" => {
                        config.overflow = OverflowPolicy::Reject;
                        Ok(())
                    }
                    other => Err(format!("unknown overflow policy {:?}", other)),
                }),
                "idle_ttl_secs" => seconds(value).map(|v| config.idle_ttl = v),
                "sweep_interval_secs" => seconds(value).map(|v| config.sweep_interval = v),
                "on_missing_key" => text(value).and_then(|s| match s {
                    "shared" => {
                        config.on_missing_key = MissingKeyPolicy::Shared;
                        Ok(())
                    }
                    "deny" => {
                        config.on_missing_key = MissingKeyPolicy::Deny;
                        Ok(())
                    }
                    other => Err(format!("unknown missing key policy {:?}", other)),
                }),
                _ => Err("unknown field".to_string()),
            };

            if let Err(reason) = outcome {
                issues.push(FieldIssue {
                    field: field.clone(),
                    reason,
                });
            }
        }

        if config.sweep_interval.is_some() && config.idle_ttl.is_none() {
            config.sweep_interval = None;
            issues.push(FieldIssue {
                field: "sweep_interval_secs".to_string(),
                reason: "ignored without idle_ttl_secs".to_string(),
            });
        }

        ParsedConfig { config, issues }
    }

    /// Whether the global bucket is enabled.
    pub fn global_enabled(&self) -> bool {
        self.max_rate > 0.0
    }

    /// Global burst size with the `max_rate` fallback applied.
    pub fn global_capacity(&self) -> u64 {
        effective_capacity(self.capacity, self.max_rate)
    }

    /// Whether per-client buckets are enabled.
    pub fn client_enabled(&self) -> bool {
        self.client_max_rate > 0.0 && self.client_strategy().is_keyed()
    }

    /// Per-client burst size with the `client_max_rate` fallback applied.
    pub fn client_capacity(&self) -> u64 {
        effective_capacity(self.client_capacity, self.client_max_rate)
    }

    /// The key strategy described by `strategy` and `key`.
    pub fn client_strategy(&self) -> ClientKeyStrategy {
        match self.strategy {
            KeySource::None => ClientKeyStrategy::None,
            KeySource::Header => ClientKeyStrategy::Header(self.key.clone()),
            KeySource::Ip => ClientKeyStrategy::Ip,
            KeySource::Param => ClientKeyStrategy::Param(self.key.clone()),
        }
    }

    /// How often idle client buckets are swept; `None` without an idle TTL.
    ///
    /// Defaults to the TTL itself when no interval is set.
    pub fn sweep_period(&self) -> Option<Duration> {
        self.idle_ttl.map(|ttl| self.sweep_interval.unwrap_or(ttl))
    }

    /// Registry settings for the per-client buckets.
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            max_entries: self.max_clients,
            overflow: self.overflow,
            idle_ttl: self.idle_ttl,
        }
    }
}

impl ParsedConfig {
    /// Drop per-client settings, reporting each one that was set.
    fn restrict_to_global(&mut self) {
        let defaults = RateLimitConfig {
            max_rate: self.config.max_rate,
            capacity: self.config.capacity,
            ..RateLimitConfig::default()
        };
        let config = &self.config;

        let mut ignored = Vec::new();
        if config.client_max_rate != defaults.client_max_rate {
            ignored.push("client_max_rate");
        }
        if config.client_capacity != defaults.client_capacity {
            ignored.push("client_capacity");
        }
        if config.strategy != defaults.strategy {
            ignored.push("strategy");
        }
        if config.key != defaults.key {
            ignored.push("key");
        }

        self.issues.extend(ignored.into_iter().map(|field| FieldIssue {
            field: field.to_string(),
            reason: "ignored for backend limiters".to_string(),
        }));
        self.config = defaults;
    }
}

fn effective_capacity(capacity: u64, rate: f64) -> u64 {
    if capacity > 0 {
        capacity
    } else {
        // Saturating float-to-int cast
        rate.ceil().max(1.0) as u64
    }
}

fn rate(value: &Value) -> Result<f64, String> {
    let n = value
        .as_f64()
        .ok_or_else(|| format!("expected a number, got {}", kind(value)))?;
    if n < 0.0 {
        return Err("must not be negative".to_string());
    }
    Ok(n)
}

fn count(value: &Value) -> Result<u64, String> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let n = value
        .as_f64()
        .ok_or_else(|| format!("expected a number, got {}", kind(value)))?;
    if n < 0.0 {
        return Err("must not be negative".to_string());
    }
    Ok(n.trunc() as u64)
}

fn seconds(value: &Value) -> Result<Option<Duration>, String> {
    count(value).map(|secs| (secs > 0).then(|| Duration::from_secs(secs)))
}

fn text(value: &Value) -> Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected a string, got {}", kind(value)))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a map",
    }
}
