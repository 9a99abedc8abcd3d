//! End-to-end admission checks through the public API.

use std::sync::{Arc, Barrier};
use std::time::Duration;

use serde_json::json;
use turnstile::config::GatewayConfig;
use turnstile::gateway::Gateway;
use turnstile::ratelimit::{
    BucketRegistry, ClientRequest, KeySource, LimiterMode, LimiterScope, ManualClock,
    RegistryOptions, RequestParts, ROUTER_NAMESPACE,
};
use turnstile::{Limited, Limiter, RateLimitConfig};

/// A host request type with its own notion of the client address.
struct ProxiedRequest {
    forwarded_for: Option<&'static str>,
}

impl ClientRequest for ProxiedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        if name.eq_ignore_ascii_case("x-forwarded-for") {
            self.forwarded_for
        } else {
            None
        }
    }

    fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        Some("10.0.0.254:443".parse().unwrap())
    }

    fn param(&self, _name: &str) -> Option<&str> {
        None
    }

    fn client_ip(&self) -> Option<std::net::IpAddr> {
        self.forwarded_for
            .and_then(|chain| chain.split(',').next())
            .and_then(|first| first.trim().parse().ok())
            .or_else(|| self.peer_addr().map(|addr| addr.ip()))
    }
}

#[test]
fn test_global_only_end_to_end() {
    let clock = Arc::new(ManualClock::new());
    let config = RateLimitConfig {
        max_rate: 2.0,
        capacity: 2,
        ..RateLimitConfig::default()
    };
    let limiter = Limiter::with_clock(&config, clock.clone());
    let req = RequestParts::new();

    assert_eq!(limiter.allow(&req), Ok(()));
    assert_eq!(limiter.allow(&req), Ok(()));
    assert_eq!(limiter.allow(&req), Err(Limited));

    clock.advance(Duration::from_millis(500));
    assert_eq!(limiter.allow(&req), Ok(()));
}

#[test]
fn test_header_limited_clients_from_extra_config() {
    let clock = Arc::new(ManualClock::new());
    let extra = json!({
        ROUTER_NAMESPACE: {
            "maxRate": 2000,
            "strategy": "header",
            "clientMaxRate": 1,
            "clientCapacity": 3,
            "key": "X-Private-Token"
        }
    });
    let limiter = Limiter::from_extra_config_with_clock(
        extra.as_object().unwrap(),
        LimiterScope::Endpoint,
        "/private",
        clock.clone(),
    );
    assert_eq!(limiter.mode(), LimiterMode::Both);

    let alice = RequestParts::new().with_header("X-Private-Token", "alice");
    let bob = RequestParts::new().with_header("X-Private-Token", "bob");

    for _ in 0..3 {
        assert!(limiter.allow(&alice).is_ok());
    }
    assert!(limiter.allow(&alice).is_err());
    assert!(limiter.allow(&bob).is_ok());

    clock.advance(Duration::from_secs(1));
    assert!(limiter.allow(&alice).is_ok());
    assert!(limiter.allow(&alice).is_err());
}

#[test]
fn test_host_resolved_client_ip() {
    let config = RateLimitConfig {
        client_max_rate: 1.0,
        client_capacity: 1,
        strategy: KeySource::Ip,
        ..RateLimitConfig::default()
    };
    let limiter = Limiter::with_clock(&config, Arc::new(ManualClock::new()));

    let first = ProxiedRequest {
        forwarded_for: Some("203.0.113.7, 10.0.0.1"),
    };
    let second = ProxiedRequest {
        forwarded_for: Some("198.51.100.2"),
    };

    assert!(limiter.allow(&first).is_ok());
    assert!(limiter.allow(&first).is_err());
    // Same proxy peer, different forwarded client
    assert!(limiter.allow(&second).is_ok());

    let registry = limiter.registry().unwrap();
    assert!(registry.contains("203.0.113.7"));
    assert!(registry.contains("198.51.100.2"));
}

#[test]
fn test_concurrent_first_lookups_share_bucket() {
    let registry = Arc::new(
        BucketRegistry::new(
            5,
            1.0,
            RegistryOptions::default(),
            Arc::new(ManualClock::new()),
        )
        .unwrap(),
    );
    let threads = 32;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                let key = format!("client-{}", i % 4);
                (key.clone(), registry.get_or_create(&key).unwrap())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (key, bucket) in &results {
        let canonical = registry.get_or_create(key).unwrap();
        assert!(Arc::ptr_eq(bucket, &canonical));
    }
    assert_eq!(registry.len(), 4);
}

#[test]
fn test_attacker_keys_cannot_grow_registry() {
    let config = RateLimitConfig {
        client_max_rate: 1.0,
        strategy: KeySource::Header,
        key: "X-Spoofable".to_string(),
        max_clients: 100,
        ..RateLimitConfig::default()
    };
    let limiter = Limiter::with_clock(&config, Arc::new(ManualClock::new()));

    for i in 0..10_000 {
        let req = RequestParts::new().with_header("X-Spoofable", format!("fake-{}", i));
        assert!(limiter.allow(&req).is_ok());
    }

    let registry = limiter.registry().unwrap();
    assert_eq!(registry.len(), 100);
    assert_eq!(registry.evicted_count(), 9_900);
}

#[tokio::test]
async fn test_gateway_descriptor_end_to_end() {
    let yaml = r#"
endpoints:
  - endpoint: /tenants/{tenant}
    extra_config:
      qos/ratelimit/router:
        max_rate: 10
        client_max_rate: 1
        client_capacity: 1
        strategy: param
        key: tenant
        on_missing_key: deny
    backends:
      - url_pattern: /v1/tenants
        extra_config:
          qos/ratelimit/proxy:
            max_rate: 2
            capacity: 2
"#;
    let config = GatewayConfig::from_yaml(yaml).unwrap();
    let clock = Arc::new(ManualClock::new());
    let gateway = Gateway::with_clock(&config, clock.clone());
    let endpoint = "/tenants/{tenant}";

    let acme = RequestParts::new().with_param("tenant", "acme");
    let globex = RequestParts::new().with_param("tenant", "globex");
    let initech = RequestParts::new().with_param("tenant", "initech");

    assert!(gateway.dispatch(endpoint, &acme).await.is_ok());
    // Per-tenant bucket is empty
    assert!(gateway.dispatch(endpoint, &acme).await.unwrap_err().is_limited());
    assert!(gateway.dispatch(endpoint, &globex).await.is_ok());
    // Backend allows two per second in total
    assert!(gateway.dispatch(endpoint, &initech).await.unwrap_err().is_limited());
    // No tenant at all
    assert!(gateway
        .dispatch(endpoint, &RequestParts::new())
        .await
        .unwrap_err()
        .is_limited());

    clock.advance(Duration::from_secs(1));
    assert!(gateway.dispatch(endpoint, &initech).await.is_ok());
}
