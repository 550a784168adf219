pub mod auth;
pub mod clock;
pub mod config;
pub mod error;

use std::sync::Arc;
use actix_web::HttpResponse;

pub use error::{AppError, AuthError, InvalidToken, RateLimitExceeded};
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use auth::{RateLimiter, TokenPurpose, TokenService};
pub use clock::{Clock, ManualClock, SystemClock};

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Application state shared across all request handlers.
///
/// The rate limiter is built once here and shared by handle, so every worker
/// in this process sees the same buckets.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub tokens: Arc<TokenService>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Settings) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Settings, clock: Arc<dyn Clock>) -> Self {
        let tokens = TokenService::from_config(&config.auth, clock.clone());
        let rate_limiter = RateLimiter::with_clock(clock);

        Self {
            config: Arc::new(config),
            tokens: Arc::new(tokens),
            rate_limiter: Arc::new(rate_limiter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_clone_shares_components() {
        let config = Settings::new_for_test().expect("Failed to load test config");
        let state = AppState::new(config);

        let cloned = state.clone();

        // Verify Arc references are shared
        assert!(Arc::ptr_eq(&state.config, &cloned.config));
        assert!(Arc::ptr_eq(&state.tokens, &cloned.tokens));
        assert!(Arc::ptr_eq(&state.rate_limiter, &cloned.rate_limiter));
    }

    #[test]
    fn test_app_state_uses_configured_secret() {
        let config = Settings::new_for_test().unwrap();
        let state = AppState::new(config.clone());
        let other = AppState::new(config);

        // Same secret, so tokens from one state verify in another
        let token = state.tokens.issue_magic_link("a@b.com").unwrap();
        assert_eq!(other.tokens.verify_magic_link(&token).unwrap(), "a@b.com");
    }
}
