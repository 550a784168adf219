//! Authentication module for the LinkCrm server
//!
//! Signed single-purpose tokens, password hashing, webhook signatures
//! and per-key rate limiting.

pub mod handlers;
mod password;
mod rate_limit;
mod token;
mod webhook;

pub use password::{hash_password, verify_password};
pub use rate_limit::RateLimiter;
pub use token::{Claims, TokenLifetimes, TokenPurpose, TokenService};
pub use webhook::{sign_webhook_body, verify_webhook_signature, SIGNATURE_HEADER};
