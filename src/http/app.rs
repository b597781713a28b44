//! Demo API protected by the rate limiter and the login guard.
//!
//! `POST /auth/login` checks a static credential table and hands out bearer
//! tokens; `GET /api/*` echoes the caller back. Bearer tokens mark a request
//! as authenticated, which moves it onto the Authenticated policy. Sessions
//! live in the counter store under `session:<token>` and expire after
//! [`DEFAULT_SESSION_TTL`] unless configured otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::identity::{login_identifier, AuthenticatedUser};
use super::login::{AuthOutcome, LoginGuard};
use super::middleware::{rate_limit_middleware, RateLimitState};
use super::response::error_response;
use crate::store::CounterStore;

/// How long a demo session token stays valid.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3_600);

const SESSION_PREFIX: &str = "session:";

/// State of the demo API.
pub struct AppState {
    login: LoginGuard,
    rate_limit: Arc<RateLimitState>,
    credentials: HashMap<String, String>,
    sessions: Arc<dyn CounterStore>,
    session_ttl: Duration,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("users", &self.credentials.len())
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(
        login: LoginGuard,
        rate_limit: Arc<RateLimitState>,
        credentials: HashMap<String, String>,
        sessions: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            login,
            rate_limit,
            credentials,
            sessions,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// Change how long session tokens stay valid.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    async fn session_user(&self, token: &str) -> Option<String> {
        match self.sessions.get(&session_key(token)).await {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "Session lookup failed, treating request as anonymous");
                None
            }
        }
    }
}

fn session_key(token: &str) -> String {
    format!("{}{}", SESSION_PREFIX, token)
}

/// Build the public router.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/api/*path", get(echo))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.rate_limit.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(state, session_middleware))
}

/// Mark requests bearing a known session token as authenticated.
async fn session_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let user = match bearer_token(request.headers()) {
        Some(token) => state.session_user(token).await,
        None => None,
    };
    if let Some(user) = user {
        request.extensions_mut().insert(AuthenticatedUser::new(user));
    }
    next.run(request).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    success: bool,
    token: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Response {
    if body.username.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "username must not be empty",
        );
    }

    let address = state.rate_limit.clients().resolve(&headers);
    let identifier = login_identifier(&body.username, &address);
    let username = body.username.trim().to_lowercase();

    let outcome = state
        .login
        .authenticate(&identifier, || async {
            let valid = state
                .credentials
                .get(&username)
                .is_some_and(|password| *password == body.password);
            valid.then(|| Uuid::new_v4().simple().to_string())
        })
        .await;

    match outcome {
        AuthOutcome::Authorized(token) => {
            if let Err(e) = state
                .sessions
                .set(&session_key(&token), &username, state.session_ttl)
                .await
            {
                warn!(error = %e, "Failed to store session");
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORE_UNAVAILABLE",
                    "Session could not be created",
                );
            }
            Json(LoginResponse {
                success: true,
                token,
            })
            .into_response()
        }
        AuthOutcome::Denied(response) => response,
    }
}

async fn echo(
    Path(path): Path<String>,
    user: Option<Extension<AuthenticatedUser>>,
) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "path": format!("/api/{}", path),
        "user": user.map(|Extension(user)| user.id),
    }))
}
