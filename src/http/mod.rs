//! HTTP surface: rate limiting middleware, login guard, admin and demo routers.

mod admin;
mod app;
mod identity;
mod login;
mod middleware;
mod response;
mod server;

pub use admin::{admin_router, AdminState};
pub use app::{api_router, AppState};
pub use identity::{
    ip_identifier, login_identifier, user_identifier, AuthenticatedUser, ClientAddress,
    ExtensionIdentity, IdentityResolver, UNKNOWN_CLIENT,
};
pub use login::{AuthOutcome, LoginGuard};
pub use middleware::{rate_limit_middleware, RateLimitState};
pub use response::{error_response, rate_limited, ErrorBody, ErrorDetail};
pub use server::HttpServer;
