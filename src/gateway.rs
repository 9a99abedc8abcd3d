//! Assembles per-endpoint limiter pipelines from a gateway descriptor.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{EndpointConfig, GatewayConfig};
use crate::error::{Result, TurnstileError};
use crate::pipeline::{rate_limited, BoxStage, Stage};
use crate::ratelimit::{Clock, Limiter, LimiterScope, RequestParts, SystemClock};

/// Terminal stage: the request made it past every limiter.
struct Forward;

#[async_trait]
impl Stage<RequestParts> for Forward {
    type Response = ();

    async fn handle(&self, _request: &RequestParts) -> Result<()> {
        Ok(())
    }
}

struct Route {
    pipeline: BoxStage<RequestParts, ()>,
    limiters: Vec<Arc<Limiter>>,
}

/// Every configured endpoint with its limiter chain.
///
/// A request to an endpoint passes the endpoint limiter first, then the
/// limiter of each backend in declaration order.
pub struct Gateway {
    routes: HashMap<String, Route>,
}

impl Gateway {
    /// Build all routes using the system clock.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &GatewayConfig, clock: Arc<dyn Clock>) -> Self {
        let mut routes = HashMap::with_capacity(config.endpoints.len());

        for endpoint in &config.endpoints {
            let route = Self::build_route(endpoint, &clock);
            if routes.insert(endpoint.endpoint.clone(), route).is_some() {
                warn!(endpoint = %endpoint.endpoint, "Duplicate endpoint, keeping the last definition");
            }
        }

        info!(routes = routes.len(), "Gateway routes assembled");
        Self { routes }
    }

    fn build_route(endpoint: &EndpointConfig, clock: &Arc<dyn Clock>) -> Route {
        let mut limiters = Vec::with_capacity(endpoint.backends.len() + 1);
        let mut pipeline: BoxStage<RequestParts, ()> = Box::new(Forward);

        for backend in endpoint.backends.iter().rev() {
            let limiter = Arc::new(Limiter::from_extra_config_with_clock(
                &backend.extra_config,
                LimiterScope::Backend,
                &backend.url_pattern,
                clock.clone(),
            ));
            limiters.push(limiter.clone());
            pipeline = rate_limited(limiter, pipeline);
        }

        let limiter = Arc::new(Limiter::from_extra_config_with_clock(
            &endpoint.extra_config,
            LimiterScope::Endpoint,
            &endpoint.endpoint,
            clock.clone(),
        ));
        limiters.push(limiter.clone());
        pipeline = rate_limited(limiter, pipeline);

        Route { pipeline, limiters }
    }

    /// Run `request` through the pipeline of `endpoint`.
    pub async fn dispatch(&self, endpoint: &str, request: &RequestParts) -> Result<()> {
        let route = self
            .routes
            .get(endpoint)
            .ok_or_else(|| TurnstileError::UnknownRoute(endpoint.to_string()))?;
        route.pipeline.handle(request).await
    }

    /// Start idle sweeps for every limiter configured with a sweep interval.
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        self.routes
            .values()
            .flat_map(|route| route.limiters.iter())
            .filter_map(|limiter| limiter.spawn_sweeper())
            .collect()
    }

    /// Limiters of `endpoint`, endpoint limiter last.
    pub fn limiters(&self, endpoint: &str) -> Option<&[Arc<Limiter>]> {
        self.routes.get(endpoint).map(|route| route.limiters.as_slice())
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
