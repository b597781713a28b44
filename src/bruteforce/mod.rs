//! Brute-force protection for authentication endpoints.

mod config;
mod protection;

pub use config::BruteForceConfig;
pub use protection::{identifier_hash, AttemptStatus, AttemptVerdict, BruteForceProtection};
