//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod limiter;
mod registry;
mod request;
mod rules;
mod strategy;

pub use bucket::TokenBucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Limiter, LimiterMode};
pub use registry::{BucketRegistry, OverflowPolicy, RegistryOptions, DEFAULT_MAX_ENTRIES, MAX_ENTRIES_LIMIT};
pub use request::{ClientRequest, RequestParts};
pub use rules::{
    ConfigError, ExtraConfig, FieldIssue, KeySource, LimiterScope, ParsedConfig, RateLimitConfig,
    PROXY_NAMESPACE, ROUTER_NAMESPACE,
};
pub use strategy::{ClientKeyStrategy, MissingKeyPolicy};
