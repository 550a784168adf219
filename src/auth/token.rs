//! Signed, time-bound, single-purpose tokens.
//!
//! All four token kinds share one HS256 secret. The `type` claim is the only
//! thing separating a session token from a password-reset token, so it is
//! checked on every verification.

use crate::clock::{Clock, SystemClock};
use crate::config::AuthConfig;
use crate::error::{AppError, InvalidToken};
use chrono::Duration;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    Magic,
    PasswordReset,
    Session,
    Csrf,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::Magic => "magic",
            TokenPurpose::PasswordReset => "password_reset",
            TokenPurpose::Session => "session",
            TokenPurpose::Csrf => "csrf",
        }
    }
}

impl fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>, // Email or profile ID, absent for CSRF
    pub exp: i64, // Expiration time
    #[serde(rename = "type", default)]
    pub purpose: Option<TokenPurpose>,
}

/// Lifetimes for each token kind.
#[derive(Debug, Clone, Copy)]
pub struct TokenLifetimes {
    pub magic_link: Duration,
    pub password_reset: Duration,
    pub session: Duration,
    pub csrf: Duration,
}

impl TokenLifetimes {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            magic_link: Duration::minutes(config.magic_link_ttl_minutes),
            password_reset: Duration::minutes(config.password_reset_ttl_minutes),
            session: Duration::days(config.session_expires_days),
            csrf: Duration::hours(config.csrf_ttl_hours),
        }
    }

    pub fn for_purpose(&self, purpose: TokenPurpose) -> Duration {
        match purpose {
            TokenPurpose::Magic => self.magic_link,
            TokenPurpose::PasswordReset => self.password_reset,
            TokenPurpose::Session => self.session,
            TokenPurpose::Csrf => self.csrf,
        }
    }
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            magic_link: Duration::minutes(15),
            password_reset: Duration::minutes(60),
            session: Duration::days(30),
            csrf: Duration::hours(24),
        }
    }
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    lifetimes: TokenLifetimes,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("lifetimes", &self.lifetimes)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(secret: &str, lifetimes: TokenLifetimes) -> Self {
        Self::with_clock(secret, lifetimes, Arc::new(SystemClock))
    }

    pub fn from_config(config: &AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(&config.secret_key, TokenLifetimes::from_config(config), clock)
    }

    pub fn with_clock(secret: &str, lifetimes: TokenLifetimes, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against our own clock with no leeway
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            lifetimes,
            clock,
        }
    }

    /// Signs `{sub, exp = now + ttl, type}` and returns the compact token.
    ///
    /// `exp` is whole unix seconds, so a sub-second `now + ttl` is rounded up:
    /// the token never expires early, and may outlive `ttl` by under a second.
    pub fn issue(
        &self,
        purpose: TokenPurpose,
        subject: Option<&str>,
        ttl: Duration,
    ) -> Result<String, AppError> {
        let expires_at = self.clock.now() + ttl;
        let exp = if expires_at.timestamp_subsec_nanos() > 0 {
            expires_at.timestamp() + 1
        } else {
            expires_at.timestamp()
        };
        let claims = Claims {
            sub: subject.map(str::to_owned),
            exp,
            purpose: Some(purpose),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::InternalError(format!("failed to sign {} token: {}", purpose, e)))
    }

    /// Returns the subject of a token issued for `expected`.
    ///
    /// Tokens without a subject (CSRF) never pass here; use [`Self::verify_csrf`].
    pub fn verify(&self, token: &str, expected: TokenPurpose) -> Result<String, InvalidToken> {
        self.verify_claims(token, expected)?.sub.ok_or_else(|| {
            debug!(purpose = %expected, "token rejected: missing subject");
            InvalidToken
        })
    }

    fn issue_for(&self, purpose: TokenPurpose, subject: Option<&str>) -> Result<String, AppError> {
        self.issue(purpose, subject, self.lifetimes.for_purpose(purpose))
    }

    fn verify_claims(&self, token: &str, expected: TokenPurpose) -> Result<Claims, InvalidToken> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(purpose = %expected, reason = %e, "token rejected");
                InvalidToken
            })?
            .claims;

        if claims.purpose != Some(expected) {
            debug!(purpose = %expected, "token rejected: purpose mismatch");
            return Err(InvalidToken);
        }
        if self.clock.now().timestamp() >= claims.exp {
            debug!(purpose = %expected, "token rejected: expired");
            return Err(InvalidToken);
        }

        Ok(claims)
    }

    pub fn issue_magic_link(&self, email: &str) -> Result<String, AppError> {
        self.issue_for(TokenPurpose::Magic, Some(email))
    }

    pub fn verify_magic_link(&self, token: &str) -> Result<String, InvalidToken> {
        self.verify(token, TokenPurpose::Magic)
    }

    pub fn issue_password_reset(&self, email: &str) -> Result<String, AppError> {
        self.issue_for(TokenPurpose::PasswordReset, Some(email))
    }

    pub fn verify_password_reset(&self, token: &str) -> Result<String, InvalidToken> {
        self.verify(token, TokenPurpose::PasswordReset)
    }

    /// Session tokens are not recorded anywhere. Signing out only clears the
    /// cookie; the token itself stays valid until `exp`.
    pub fn issue_session(&self, profile_id: &str) -> Result<String, AppError> {
        self.issue_for(TokenPurpose::Session, Some(profile_id))
    }

    pub fn verify_session(&self, token: &str) -> Result<String, InvalidToken> {
        self.verify(token, TokenPurpose::Session)
    }

    pub fn issue_csrf(&self) -> Result<String, AppError> {
        self.issue_for(TokenPurpose::Csrf, None)
    }

    pub fn verify_csrf(&self, token: &str) -> bool {
        self.verify_claims(token, TokenPurpose::Csrf).is_ok()
    }
}
