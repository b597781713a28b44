//! End-to-end behaviour of the limiter, the brute-force protector and the
//! HTTP layer against shared and broken stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::StatusCode;
use tokio_test::{assert_err, assert_ok};
use tower::ServiceExt;

use gatekeeper::bruteforce::{BruteForceConfig, BruteForceProtection};
use gatekeeper::clock::{Clock, ManualClock};
use gatekeeper::http::{
    api_router, AppState, ClientAddress, ErrorBody, LoginGuard, RateLimitState,
};
use gatekeeper::ratelimit::{Policies, PolicyConfig, RateLimitConfig, RateLimiter};
use gatekeeper::store::{
    CounterStore, MemoryStore, StoreError, StoreResult, TimeoutStore,
};

const START: i64 = 1_700_000_000_000;

/// A store that is down.
struct UnreachableStore;

fn down<T>() -> StoreResult<T> {
    Err(StoreError::Connection("connection refused".to_string()))
}

#[async_trait]
impl CounterStore for UnreachableStore {
    async fn insert(&self, _: &str, _: i64, _: &str) -> StoreResult<()> {
        down()
    }
    async fn purge_before(&self, _: &str, _: i64) -> StoreResult<u64> {
        down()
    }
    async fn count(&self, _: &str) -> StoreResult<u64> {
        down()
    }
    async fn oldest(&self, _: &str) -> StoreResult<Option<i64>> {
        down()
    }
    async fn set_expiry(&self, _: &str, _: Duration) -> StoreResult<()> {
        down()
    }
    async fn increment(&self, _: &str) -> StoreResult<i64> {
        down()
    }
    async fn get(&self, _: &str) -> StoreResult<Option<String>> {
        down()
    }
    async fn set(&self, _: &str, _: &str, _: Duration) -> StoreResult<()> {
        down()
    }
    async fn delete(&self, _: &str) -> StoreResult<()> {
        down()
    }
    async fn delete_prefix(&self, _: &str) -> StoreResult<u64> {
        down()
    }
    async fn ping(&self) -> StoreResult<()> {
        down()
    }
}

/// A store whose client library blows up.
struct PanickingStore;

#[async_trait]
impl CounterStore for PanickingStore {
    async fn insert(&self, _: &str, _: i64, _: &str) -> StoreResult<()> {
        panic!("insert")
    }
    async fn purge_before(&self, _: &str, _: i64) -> StoreResult<u64> {
        panic!("purge_before")
    }
    async fn count(&self, _: &str) -> StoreResult<u64> {
        panic!("count")
    }
    async fn oldest(&self, _: &str) -> StoreResult<Option<i64>> {
        panic!("oldest")
    }
    async fn set_expiry(&self, _: &str, _: Duration) -> StoreResult<()> {
        panic!("set_expiry")
    }
    async fn increment(&self, _: &str) -> StoreResult<i64> {
        panic!("increment")
    }
    async fn get(&self, _: &str) -> StoreResult<Option<String>> {
        panic!("get")
    }
    async fn set(&self, _: &str, _: &str, _: Duration) -> StoreResult<()> {
        panic!("set")
    }
    async fn delete(&self, _: &str) -> StoreResult<()> {
        panic!("delete")
    }
    async fn delete_prefix(&self, _: &str) -> StoreResult<u64> {
        panic!("delete_prefix")
    }
    async fn ping(&self) -> StoreResult<()> {
        panic!("ping")
    }
}

fn memory(clock: &Arc<ManualClock>) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(clock.clone()))
}

#[tokio::test]
async fn scenario_a_fourth_request_in_window_is_denied() {
    let clock = Arc::new(ManualClock::new(START));
    let limiter = RateLimiter::with_clock(
        memory(&clock),
        RateLimitConfig::new(60_000, 3, "rl"),
        clock.clone(),
    )
    .unwrap();

    let mut allowed = Vec::new();
    let mut last = None;
    for _ in 0..4 {
        let result = limiter.check_limit("ip:10.0.0.1", "/api/items").await;
        allowed.push(result.allowed);
        last = Some(result);
        clock.advance(Duration::from_millis(10));
    }

    assert_eq!(allowed, vec![true, true, true, false]);
    let last = last.unwrap();
    assert_eq!(last.remaining, 0);
    assert_eq!(last.retry_after, Some(60));
    assert_eq!(last.reset_at.timestamp_millis(), START + 60_000);
}

#[tokio::test]
async fn scenario_b_five_failures_lock_the_account() {
    let clock = Arc::new(ManualClock::new(START));
    let protection = BruteForceProtection::with_clock(
        memory(&clock),
        BruteForceConfig {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            lockout_duration_ms: 1_800_000,
            ..Default::default()
        },
        clock.clone(),
    )
    .unwrap();

    for _ in 0..5 {
        protection.record_failed_attempt("alice:10.0.0.1").await;
    }
    let verdict = protection.check_attempt("alice:10.0.0.1").await;

    assert!(!verdict.allowed);
    assert_eq!(
        verdict.locked_until.map(|t| t.timestamp_millis()),
        Some(clock.now_ms() + 1_800_000)
    );
}

#[tokio::test]
async fn scenario_c_store_outage_fails_open() {
    let store: Arc<dyn CounterStore> = Arc::new(UnreachableStore);
    let limiter = RateLimiter::new(store.clone(), RateLimitConfig::new(60_000, 3, "rl")).unwrap();
    let protection = BruteForceProtection::new(store, BruteForceConfig::default()).unwrap();

    for _ in 0..10 {
        let result = limiter.check_limit("ip:10.0.0.1", "/api/items").await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 3);

        let verdict = protection.check_attempt("alice:10.0.0.1").await;
        assert!(verdict.allowed);
        assert_eq!(verdict.delay, Duration::ZERO);

        protection.record_failed_attempt("alice:10.0.0.1").await;
        protection.record_successful_attempt("alice:10.0.0.1").await;
    }

    // Operator calls surface the outage instead of hiding it.
    assert_err!(protection.get_status("alice:10.0.0.1").await);
    assert_err!(protection.unlock_account("alice:10.0.0.1").await);
    assert_err!(limiter.reset_limit("ip:10.0.0.1", None).await);
    assert_err!(limiter.get_current_count("ip:10.0.0.1", "/api/items").await);
}

#[tokio::test]
async fn panicking_store_fails_open() {
    let store: Arc<dyn CounterStore> = Arc::new(PanickingStore);
    let limiter = RateLimiter::new(store.clone(), RateLimitConfig::new(60_000, 0, "rl")).unwrap();
    let protection = BruteForceProtection::new(store, BruteForceConfig::default()).unwrap();

    assert!(limiter.check_limit("ip:10.0.0.1", "/").await.allowed);
    assert!(protection.check_attempt("alice").await.allowed);
}

#[tokio::test]
async fn slow_store_times_out_and_fails_open() {
    struct SlowStore(MemoryStore);

    #[async_trait]
    impl CounterStore for SlowStore {
        async fn insert(&self, k: &str, t: i64, m: &str) -> StoreResult<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.0.insert(k, t, m).await
        }
        async fn purge_before(&self, k: &str, c: i64) -> StoreResult<u64> {
            self.0.purge_before(k, c).await
        }
        async fn count(&self, k: &str) -> StoreResult<u64> {
            self.0.count(k).await
        }
        async fn oldest(&self, k: &str) -> StoreResult<Option<i64>> {
            self.0.oldest(k).await
        }
        async fn set_expiry(&self, k: &str, ttl: Duration) -> StoreResult<()> {
            self.0.set_expiry(k, ttl).await
        }
        async fn increment(&self, k: &str) -> StoreResult<i64> {
            self.0.increment(k).await
        }
        async fn get(&self, k: &str) -> StoreResult<Option<String>> {
            self.0.get(k).await
        }
        async fn set(&self, k: &str, v: &str, ttl: Duration) -> StoreResult<()> {
            self.0.set(k, v, ttl).await
        }
        async fn delete(&self, k: &str) -> StoreResult<()> {
            self.0.delete(k).await
        }
        async fn delete_prefix(&self, p: &str) -> StoreResult<u64> {
            self.0.delete_prefix(p).await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.0.ping().await
        }
    }

    let clock = Arc::new(ManualClock::new(START));
    let slow = SlowStore(MemoryStore::new(clock.clone()));
    let store = Arc::new(TimeoutStore::new(slow, Duration::from_millis(20)));
    let limiter =
        RateLimiter::with_clock(store, RateLimitConfig::new(60_000, 0, "rl"), clock).unwrap();

    let started = std::time::Instant::now();
    let result = limiter.check_limit("ip:10.0.0.1", "/").await;
    assert!(result.allowed);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn instances_sharing_a_store_enforce_one_limit() {
    let clock = Arc::new(ManualClock::new(START));
    let store = memory(&clock);
    let config = RateLimitConfig::new(60_000, 4, "rl");

    let instances: Vec<RateLimiter> = (0..3)
        .map(|_| RateLimiter::with_clock(store.clone(), config.clone(), clock.clone()).unwrap())
        .collect();

    let mut allowed = 0;
    for round in 0..4 {
        for instance in &instances {
            if instance.check_limit("user:7", "/api/items").await.allowed {
                allowed += 1;
            }
        }
        clock.advance(Duration::from_millis(round + 1));
    }
    assert_eq!(allowed, 4);

    assert_ok!(instances[0].reset_limit("user:7", None).await);
    assert!(instances[2].check_limit("user:7", "/api/items").await.allowed);
}

fn login_app(clock: Arc<ManualClock>) -> axum::Router {
    let store: Arc<dyn CounterStore> = memory(&clock);
    let protection = BruteForceProtection::with_clock(
        store.clone(),
        BruteForceConfig {
            max_attempts: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..Default::default()
        },
        clock.clone(),
    )
    .unwrap();
    let policies = PolicyConfig::from_yaml(
        r#"
endpoints:
  - path: /auth/login
    window_ms: 60000
    max_requests: 5
    key_prefix: rl:login
"#,
    )
    .unwrap();
    let rate_limit = Arc::new(RateLimitState::new(
        Policies::build(&policies, store.clone(), clock).unwrap(),
        ClientAddress::new("cf-connecting-ip").unwrap(),
    ));

    api_router(Arc::new(AppState::new(
        LoginGuard::new(Arc::new(protection)),
        rate_limit,
        [("bob".to_string(), "hunter2".to_string())].into_iter().collect(),
        store,
    )))
}

fn login(ip: &str, password: &str) -> Request {
    Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .header("cf-connecting-ip", ip)
        .body(Body::from(format!(
            r#"{{"username":"bob","password":"{}"}}"#,
            password
        )))
        .unwrap()
}

async fn error_code(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
    body.error.code
}

#[tokio::test]
async fn login_route_locks_out_then_rate_limits() {
    let clock = Arc::new(ManualClock::new(START));
    let app = login_app(clock.clone());

    for _ in 0..3 {
        let response = app.clone().oneshot(login("192.0.2.1", "wrong")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = app.clone().oneshot(login("192.0.2.1", "hunter2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error_code(response).await, "ACCOUNT_LOCKED");

    // Same credential from another address is tracked separately.
    let response = app.clone().oneshot(login("192.0.2.2", "hunter2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Fifth request from the first address in the window, sixth is throttled.
    let response = app.clone().oneshot(login("192.0.2.1", "hunter2")).await.unwrap();
    assert_eq!(error_code(response).await, "ACCOUNT_LOCKED");
    let response = app.clone().oneshot(login("192.0.2.1", "hunter2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-ratelimit-limit"], "5");
    assert_eq!(error_code(response).await, "RATE_LIMIT_EXCEEDED");

    // After both the window and the lockout pass, the right password works.
    clock.advance(Duration::from_millis(1_800_000));
    let response = app.oneshot(login("192.0.2.1", "hunter2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
