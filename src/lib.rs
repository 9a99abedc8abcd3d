//! Turnstile - Token-bucket admission control for gateways
//!
//! This crate decides, per request, whether a call through a gateway may
//! proceed or must be rejected because a configured rate has been exceeded.
//! Limits apply globally per endpoint or backend, and per client, keyed by a
//! header, a request parameter or the client address.

pub mod config;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod ratelimit;

pub use error::{Limited, Result, TurnstileError};
pub use ratelimit::{Limiter, RateLimitConfig};
