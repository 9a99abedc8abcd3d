//! The limiter facade: one optional global bucket plus optional per-client
//! buckets behind a single admission check.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use super::bucket::TokenBucket;
use super::clock::{Clock, SystemClock};
use super::registry::BucketRegistry;
use super::request::ClientRequest;
use super::rules::{ConfigError, ExtraConfig, LimiterScope, RateLimitConfig};
use super::strategy::{ClientKeyStrategy, MissingKeyPolicy};
use crate::error::{Limited, Result, TurnstileError};

/// Which checks a limiter performs. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterMode {
    Disabled,
    GlobalOnly,
    ClientOnly,
    Both,
}

struct ClientLimits {
    strategy: ClientKeyStrategy,
    registry: Arc<BucketRegistry>,
    /// Bucket shared by requests without a key; `None` denies them
    unknown: Option<TokenBucket>,
    sweep_interval: Option<std::time::Duration>,
}

impl ClientLimits {
    fn admit<R: ClientRequest + ?Sized>(&self, request: &R) -> bool {
        match self.strategy.extract_key(request) {
            Some(key) => self
                .registry
                .get_or_create(&key)
                .is_some_and(|bucket| bucket.try_take(1)),
            None => self.unknown.as_ref().is_some_and(|bucket| bucket.try_take(1)),
        }
    }
}

/// Admission control for one endpoint or backend.
///
/// `allow` is safe to call from any number of tasks at once. It performs no
/// I/O and no logging; everything worth reporting is reported once, when the
/// limiter is built.
pub struct Limiter {
    global: Option<TokenBucket>,
    client: Option<ClientLimits>,
}

impl Limiter {
    /// A limiter that admits everything.
    pub fn disabled() -> Self {
        Self {
            global: None,
            client: None,
        }
    }

    /// Build a limiter from `config` using the system clock.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a limiter from `config`.
    ///
    /// Settings that cannot produce a working bucket disable their axis and
    /// are logged; construction itself never fails.
    pub fn with_clock(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let global = if config.global_enabled() {
            match TokenBucket::with_clock(config.global_capacity(), config.max_rate, clock.clone())
            {
                Ok(bucket) => Some(bucket),
                Err(e) => {
                    warn!(error = %e, "Global rate limiting disabled");
                    None
                }
            }
        } else {
            None
        };

        let client = Self::build_client_limits(config, clock);
        let limiter = Self { global, client };

        match limiter.mode() {
            LimiterMode::Disabled => debug!("Rate limiter disabled"),
            mode => info!(
                mode = ?mode,
                max_rate = config.max_rate,
                capacity = config.global_capacity(),
                client_max_rate = config.client_max_rate,
                client_capacity = config.client_capacity(),
                strategy = %config.client_strategy(),
                "Enabling the rate limiter"
            ),
        }

        limiter
    }

    fn build_client_limits(
        config: &RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Option<ClientLimits> {
        if config.client_max_rate <= 0.0 {
            return None;
        }

        let strategy = config.client_strategy();
        if !strategy.is_keyed() {
            warn!(
                strategy = %strategy,
                "Client rate limiting disabled: strategy needs a source and key"
            );
            return None;
        }

        let capacity = config.client_capacity();
        let rate = config.client_max_rate;
        let registry =
            match BucketRegistry::new(capacity, rate, config.registry_options(), clock.clone()) {
                Ok(registry) => Arc::new(registry),
                Err(e) => {
                    warn!(error = %e, "Client rate limiting disabled");
                    return None;
                }
            };

        let unknown = match config.on_missing_key {
            MissingKeyPolicy::Shared => TokenBucket::with_clock(capacity, rate, clock).ok(),
            MissingKeyPolicy::Deny => None,
        };

        Some(ClientLimits {
            strategy,
            registry,
            unknown,
            sweep_interval: config.sweep_period(),
        })
    }

    /// Build a limiter from the `scope` namespace of an extra-config block.
    ///
    /// A missing or malformed block yields a disabled limiter. `label` names
    /// the endpoint or backend in log output.
    pub fn from_extra_config(extra: &ExtraConfig, scope: LimiterScope, label: &str) -> Self {
        Self::from_extra_config_with_clock(extra, scope, label, Arc::new(SystemClock))
    }

    pub fn from_extra_config_with_clock(
        extra: &ExtraConfig,
        scope: LimiterScope,
        label: &str,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let _span = info_span!("ratelimit", scope = ?scope, route = %label).entered();

        match RateLimitConfig::from_extra_config(extra, scope) {
            Ok(parsed) => {
                for issue in &parsed.issues {
                    warn!(field = %issue.field, reason = %issue.reason, "Ignoring rate limit field");
                }
                Self::with_clock(&parsed.config, clock)
            }
            Err(ConfigError::NotConfigured) => {
                debug!("No rate limit configured");
                Self::disabled()
            }
            Err(e) => {
                error!(error = %e, "Rate limiter disabled");
                Self::disabled()
            }
        }
    }

    /// Which checks this limiter performs.
    pub fn mode(&self) -> LimiterMode {
        match (self.global.is_some(), self.client.is_some()) {
            (false, false) => LimiterMode::Disabled,
            (true, false) => LimiterMode::GlobalOnly,
            (false, true) => LimiterMode::ClientOnly,
            (true, true) => LimiterMode::Both,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode() != LimiterMode::Disabled
    }

    /// Decide whether `request` may proceed.
    ///
    /// The global bucket is checked first; when it denies, no client token is
    /// spent. A request passes only if every configured bucket yields a token.
    pub fn allow<R: ClientRequest + ?Sized>(&self, request: &R) -> std::result::Result<(), Limited> {
        if let Some(global) = &self.global {
            if !global.try_take(1) {
                return Err(Limited);
            }
        }

        if let Some(client) = &self.client {
            if !client.admit(request) {
                return Err(Limited);
            }
        }

        Ok(())
    }

    /// Like [`Limiter::allow`], but does not start if `cancel` has fired.
    pub fn allow_cancellable<R: ClientRequest + ?Sized>(
        &self,
        request: &R,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(TurnstileError::Cancelled);
        }
        self.allow(request).map_err(TurnstileError::from)
    }

    /// The global bucket, if global limiting is enabled.
    pub fn global_bucket(&self) -> Option<&TokenBucket> {
        self.global.as_ref()
    }

    /// The per-client registry, if client limiting is enabled.
    pub fn registry(&self) -> Option<&Arc<BucketRegistry>> {
        self.client.as_ref().map(|client| &client.registry)
    }

    /// Start the idle sweep for the client registry, if one is configured.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let client = self.client.as_ref()?;
        let interval = client.sweep_interval?;
        Some(client.registry.spawn_sweeper(interval))
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("mode", &self.mode())
            .field("global", &self.global)
            .field("registry", &self.registry())
            .finish()
    }
}
