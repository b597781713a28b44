//! Rate limiting middleware for axum routers.
//!
//! ```ignore
//! let state = Arc::new(RateLimitState::new(policies, ClientAddress::new("cf-connecting-ip")?));
//! let app = Router::new()
//!     .route("/api/projects", get(list_projects))
//!     .layer(middleware::from_fn_with_state(state, rate_limit_middleware));
//! ```

use std::sync::Arc;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::identity::{
    ip_identifier, user_identifier, ClientAddress, ExtensionIdentity, IdentityResolver,
};
use super::response::{insert_rate_limit_headers, rate_limited};
use crate::ratelimit::Policies;

/// Shared state of the rate limiting middleware.
pub struct RateLimitState {
    /// Active policy set; swapped whole on reload
    policies: RwLock<Arc<Policies>>,
    /// Client address resolution
    clients: ClientAddress,
    /// Authenticated user lookup
    identity: Arc<dyn IdentityResolver>,
    /// Add rate limit headers to allowed responses
    expose_headers: bool,
}

impl std::fmt::Debug for RateLimitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitState")
            .field("clients", &self.clients)
            .field("expose_headers", &self.expose_headers)
            .finish_non_exhaustive()
    }
}

impl RateLimitState {
    pub fn new(policies: Policies, clients: ClientAddress) -> Self {
        Self {
            policies: RwLock::new(Arc::new(policies)),
            clients,
            identity: Arc::new(ExtensionIdentity),
            expose_headers: true,
        }
    }

    /// Use a custom identity resolver.
    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    /// Whether allowed responses carry `X-RateLimit-*` headers.
    pub fn expose_headers(mut self, expose: bool) -> Self {
        self.expose_headers = expose;
        self
    }

    /// Current policy set.
    pub fn policies(&self) -> Arc<Policies> {
        self.policies.read().clone()
    }

    /// Replace the policy set. Requests already in flight finish under the
    /// old one.
    pub fn set_policies(&self, policies: Policies) {
        *self.policies.write() = Arc::new(policies);
        info!("Rate limit policies updated");
    }

    /// Client address resolution.
    pub fn clients(&self) -> &ClientAddress {
        &self.clients
    }

    /// Rate limit identifier for `request`, and whether the caller is
    /// authenticated.
    pub fn identify(&self, request: &Request) -> (String, bool) {
        match self.identity.resolve(request) {
            Some(user) => (user_identifier(&user.id), true),
            None => (ip_identifier(&self.clients.resolve(request.headers())), false),
        }
    }
}

/// Rate limiting middleware.
///
/// Authenticated callers are counted per user, everyone else per client
/// address. Denied requests get a 429 and never reach the handler.
pub async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let (identifier, authenticated) = state.identify(&request);

    let policies = state.policies();
    let selected = policies.select(&route, authenticated);
    let result = selected
        .limiter
        .check_limit(&identifier, selected.endpoint)
        .await;

    if !result.allowed {
        debug!(
            identifier = %identifier,
            route = %route,
            policy = ?selected.kind,
            "Request rate limited"
        );
        return rate_limited(&result);
    }

    let mut response = next.run(request).await;
    if state.expose_headers {
        insert_rate_limit_headers(response.headers_mut(), &result);
    }
    response
}
