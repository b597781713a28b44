//! Operator endpoints, served on their own listener.
//!
//! - `GET /health`: store connectivity
//! - `GET /lockouts/:id`, `DELETE /lockouts/:id`: brute-force status and unlock
//! - `GET /limits/:id?endpoint=`, `DELETE /limits/:id[?endpoint=]`: window
//!   counts and resets
//!
//! `:id` is the tracked identifier exactly as the middleware builds it, e.g.
//! `ip:203.0.113.7`, `user:42` or `alice@example.com:203.0.113.7`.
//!
//! `endpoint` is the route the middleware counted under, which is the router's
//! route pattern and not the concrete request path: requests to
//! `/api/projects` served by `.route("/api/*path", ..)` are counted under
//! `/api/*path`. Paths covered by an endpoint rule resolve to the rule either
//! way.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::middleware::RateLimitState;
use super::response::error_response;
use crate::bruteforce::BruteForceProtection;
use crate::ratelimit::PolicyKind;
use crate::store::{CounterStore, StoreError};

/// State shared by the admin routes.
#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<dyn CounterStore>,
    pub protection: Arc<BruteForceProtection>,
    pub rate_limit: Arc<RateLimitState>,
}

/// Build the admin router.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/lockouts/:id", get(lockout_status).delete(unlock))
        .route("/limits/:id", get(limit_count).delete(reset_limit))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn health(State(state): State<AdminState>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(Health {
            status: "ok",
            error: None,
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Health {
                    status: "degraded",
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

fn store_failure(e: StoreError) -> Response {
    warn!(error = %e, "Admin operation failed");
    error_response(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", e.to_string())
}

async fn lockout_status(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.protection.get_status(&id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => store_failure(e),
    }
}

async fn unlock(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.protection.unlock_account(&id).await {
        Ok(()) => {
            info!("Account unlocked by operator");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => store_failure(e),
    }
}

#[derive(Debug, Deserialize)]
struct EndpointQuery {
    endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimitCount {
    identifier: String,
    endpoint: String,
    policy: PolicyKind,
    count: u64,
    limit: u64,
}

fn is_authenticated(identifier: &str) -> bool {
    identifier.starts_with("user:")
}

async fn limit_count(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<EndpointQuery>,
) -> Response {
    let Some(endpoint) = query.endpoint else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MISSING_ENDPOINT",
            "The endpoint query parameter (a route pattern) is required",
        );
    };

    let policies = state.rate_limit.policies();
    let selected = policies.select(&endpoint, is_authenticated(&id));
    match selected.limiter.get_current_count(&id, selected.endpoint).await {
        Ok(count) => Json(LimitCount {
            identifier: id.clone(),
            endpoint: selected.endpoint.to_string(),
            policy: selected.kind,
            count,
            limit: selected.limiter.config().max_requests,
        })
        .into_response(),
        Err(e) => store_failure(e),
    }
}

async fn reset_limit(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<EndpointQuery>,
) -> Response {
    let policies = state.rate_limit.policies();

    let outcome = match query.endpoint.as_deref() {
        Some(endpoint) => {
            let selected = policies.select(endpoint, is_authenticated(&id));
            selected
                .limiter
                .reset_limit(&id, Some(selected.endpoint))
                .await
        }
        None => {
            let mut outcome = Ok(());
            for limiter in policies.limiters() {
                if let Err(e) = limiter.reset_limit(&id, None).await {
                    outcome = Err(e);
                    break;
                }
            }
            outcome
        }
    };

    match outcome {
        Ok(()) => {
            info!(endpoint = ?query.endpoint, "Rate limit reset by operator");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => store_failure(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bruteforce::{AttemptStatus, BruteForceConfig};
    use crate::clock::ManualClock;
    use crate::http::identity::ClientAddress;
    use crate::ratelimit::{Policies, PolicyConfig};
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::extract::Request;
    use tower::ServiceExt;

    fn admin_state() -> AdminState {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(clock.clone()));
        let protection = BruteForceProtection::with_clock(
            store.clone(),
            BruteForceConfig::default(),
            clock.clone(),
        )
        .unwrap();
        let policies = Policies::build(&PolicyConfig::default(), store.clone(), clock).unwrap();
        AdminState {
            store,
            protection: Arc::new(protection),
            rate_limit: Arc::new(RateLimitState::new(
                policies,
                ClientAddress::new("cf-connecting-ip").unwrap(),
            )),
        }
    }

    fn call(method: &str, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = admin_router(admin_state())
            .oneshot(call("GET", "/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_lockout_status_and_unlock() {
        let state = admin_state();
        for _ in 0..5 {
            state.protection.record_failed_attempt("alice:10.0.0.1").await;
        }
        let app = admin_router(state.clone());

        let response = app
            .clone()
            .oneshot(call("GET", "/lockouts/alice:10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["isLocked"], true);
        assert_eq!(body["attemptsRemaining"], 0);

        let response = app
            .oneshot(call("DELETE", "/lockouts/alice:10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let status: AttemptStatus = state.protection.get_status("alice:10.0.0.1").await.unwrap();
        assert!(!status.is_locked);
    }

    #[tokio::test]
    async fn test_limit_count_and_reset() {
        let state = admin_state();
        let policies = state.rate_limit.policies();
        let limiter = policies.select("/api/items", false).limiter;
        for _ in 0..3 {
            limiter.check_limit("ip:10.0.0.1", "/api/items").await;
        }
        let app = admin_router(state.clone());

        let response = app
            .clone()
            .oneshot(call("GET", "/limits/ip:10.0.0.1?endpoint=/api/items"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["count"], 3);
        assert_eq!(body["limit"], 100);
        assert_eq!(body["policy"], "anonymous");

        let response = app
            .clone()
            .oneshot(call("DELETE", "/limits/ip:10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            limiter.get_current_count("ip:10.0.0.1", "/api/items").await.unwrap(),
            0
        );

        let response = app
            .oneshot(call("GET", "/limits/ip:10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_limit_count_uses_route_pattern() {
        use crate::http::middleware::rate_limit_middleware;
        use axum::middleware;

        let state = admin_state();
        let api = Router::new()
            .route("/api/*path", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(
                state.rate_limit.clone(),
                rate_limit_middleware,
            ));
        for _ in 0..2 {
            let request = Request::builder()
                .uri("/api/projects")
                .header("x-forwarded-for", "10.0.0.9")
                .body(Body::empty())
                .unwrap();
            assert_eq!(api.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);
        }
        let admin = admin_router(state);

        let response = admin
            .clone()
            .oneshot(call("GET", "/limits/ip:10.0.0.9?endpoint=/api/*path"))
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["endpoint"], "/api/*path");
        assert_eq!(body["count"], 2);

        let response = admin
            .oneshot(call("GET", "/limits/ip:10.0.0.9?endpoint=/api/projects"))
            .await
            .unwrap();
        assert_eq!(json(response).await["count"], 0, "concrete paths are not route keys");
    }
}
