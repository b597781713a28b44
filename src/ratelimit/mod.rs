//! Sliding-window rate limiting.

mod key;
mod limiter;
mod policy;
mod rules;
mod window;

pub use key::WindowKey;
pub use limiter::RateLimiter;
pub use policy::{
    RateLimitConfig, RateLimitResult, ANONYMOUS_MAX_REQUESTS, ANONYMOUS_WINDOW_MS,
    AUTHENTICATED_MAX_REQUESTS, AUTHENTICATED_WINDOW_MS,
};
pub use rules::{EndpointRule, Policies, PolicyConfig, PolicyKind, SelectedPolicy};
pub use window::{retry_after_secs, WindowEntry};
