//! Gatekeeper - Distributed Request Throttling and Brute-Force Protection
//!
//! This crate implements sliding-window rate limiting and authentication
//! brute-force protection for horizontally scaled HTTP services. All state
//! lives in a shared counter store (Redis in production) so any number of
//! stateless instances enforce the same limits.

pub mod audit;
pub mod bruteforce;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
