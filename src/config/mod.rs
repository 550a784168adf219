use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;
use std::fmt;

/// Placeholder shipped in defaults; never acceptable in production.
pub const PLACEHOLDER_SECRET: &str = "change_me_long_random_secret_key_minimum_32_characters";
const MIN_PRODUCTION_SECRET_LEN: usize = 32;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

#[derive(Deserialize, Clone)]
pub struct AuthConfig {
    pub secret_key: String,
    pub session_cookie_name: String,
    pub session_expires_days: i64,
    pub magic_link_ttl_minutes: i64,
    pub password_reset_ttl_minutes: i64,
    pub csrf_ttl_hours: i64,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret_key", &"<redacted>")
            .field("session_cookie_name", &self.session_cookie_name)
            .field("session_expires_days", &self.session_expires_days)
            .field("magic_link_ttl_minutes", &self.magic_link_ttl_minutes)
            .field("password_reset_ttl_minutes", &self.password_reset_ttl_minutes)
            .field("csrf_ttl_hours", &self.csrf_ttl_hours)
            .finish()
    }
}

#[derive(Deserialize, Clone)]
pub struct WebhookConfig {
    pub secret: String,
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = if self.secret.is_empty() { "<unset>" } else { "<redacted>" };
        f.debug_struct("WebhookConfig").field("secret", &secret).finish()
    }
}

/// Allowance for one keyed operation.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max_requests: usize,
    pub window_seconds: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub webhook: RateLimitRule,
    pub lead: RateLimitRule,
    pub cleanup_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub webhook: WebhookConfig,
    pub rate_limit: RateLimitSettings,
    pub cors: CorsConfig,
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
    environment: &str,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("environment", environment)?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8000)?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("auth.secret_key", PLACEHOLDER_SECRET)?
        .set_default("auth.session_cookie_name", "session")?
        .set_default("auth.session_expires_days", 30)?
        .set_default("auth.magic_link_ttl_minutes", 15)?
        .set_default("auth.password_reset_ttl_minutes", 60)?
        .set_default("auth.csrf_ttl_hours", 24)?
        .set_default("webhook.secret", "")?
        .set_default("rate_limit.webhook.max_requests", 30)?
        .set_default("rate_limit.webhook.window_seconds", 60)?
        .set_default("rate_limit.lead.max_requests", 5)?
        .set_default("rate_limit.lead.window_seconds", 300)?
        .set_default("rate_limit.cleanup_interval_seconds", 300)?
        .set_default("cors.enabled", false)?
        .set_default("cors.allowed_origins", Vec::<String>::new())?
        .set_default("cors.max_age", 3600)
}

fn env_source() -> Environment {
    // E.g., `APP_AUTH__SESSION_EXPIRES_DAYS=7` sets `Settings.auth.session_expires_days`
    Environment::with_prefix("app")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let settings: Settings = with_defaults(Config::builder(), "development")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Defaults only, with a fixed secret. Ignores the environment so tests
    /// running in parallel cannot disturb each other.
    pub fn new_for_test() -> Result<Self, ConfigError> {
        with_defaults(Config::builder(), "test")?
            .set_override("auth.secret_key", "test_secret_for_unit_tests_only_0123456789")?
            .set_override("webhook.secret", "test_webhook_secret")?
            .build()?
            .try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.session_expires_days <= 0
            || self.auth.magic_link_ttl_minutes <= 0
            || self.auth.password_reset_ttl_minutes <= 0
            || self.auth.csrf_ttl_hours <= 0
        {
            return Err(ConfigError::Message("token lifetimes must be positive".into()));
        }
        if self.rate_limit.webhook.window_seconds <= 0 || self.rate_limit.lead.window_seconds <= 0 {
            return Err(ConfigError::Message("rate limit windows must be positive".into()));
        }
        if self.auth.secret_key.is_empty() {
            return Err(ConfigError::Message("auth.secret_key must be set".into()));
        }
        if self.is_production()
            && (self.auth.secret_key == PLACEHOLDER_SECRET
                || self.auth.secret_key.len() < MIN_PRODUCTION_SECRET_LEN)
        {
            return Err(ConfigError::Message(format!(
                "auth.secret_key must be a random value of at least {} bytes in production",
                MIN_PRODUCTION_SECRET_LEN
            )));
        }
        Ok(())
    }
}
