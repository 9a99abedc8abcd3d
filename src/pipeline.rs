//! Composable request stages and the rate limiting stage.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::ratelimit::{ClientRequest, Limiter};

/// One step of a request pipeline.
#[async_trait]
pub trait Stage<R: Send + Sync>: Send + Sync {
    type Response: Send;

    async fn handle(&self, request: &R) -> Result<Self::Response>;
}

/// A type-erased stage.
pub type BoxStage<R, T> = Box<dyn Stage<R, Response = T>>;

#[async_trait]
impl<R, T> Stage<R> for BoxStage<R, T>
where
    R: Send + Sync,
    T: Send,
{
    type Response = T;

    async fn handle(&self, request: &R) -> Result<T> {
        (**self).handle(request).await
    }
}

/// Runs the limiter before handing the request to the next stage.
///
/// A denied request never reaches `next`; the stage returns
/// [`TurnstileError::Limited`](crate::error::TurnstileError::Limited) instead.
pub struct RateLimitStage<S> {
    limiter: Arc<Limiter>,
    next: S,
}

impl<S> RateLimitStage<S> {
    pub fn new(limiter: Arc<Limiter>, next: S) -> Self {
        Self { limiter, next }
    }

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }
}

#[async_trait]
impl<R, S> Stage<R> for RateLimitStage<S>
where
    R: ClientRequest + Send + Sync,
    S: Stage<R>,
{
    type Response = S::Response;

    async fn handle(&self, request: &R) -> Result<S::Response> {
        self.limiter.allow(request)?;
        self.next.handle(request).await
    }
}

/// Wrap `next` with `limiter`, or return `next` untouched when the limiter is
/// disabled.
pub fn rate_limited<R, S>(limiter: Arc<Limiter>, next: S) -> BoxStage<R, S::Response>
where
    R: ClientRequest + Send + Sync + 'static,
    S: Stage<R> + 'static,
{
    if limiter.is_enabled() {
        Box::new(RateLimitStage::new(limiter, next))
    } else {
        Box::new(next)
    }
}
