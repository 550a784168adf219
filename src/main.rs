use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use linkcrm_server::auth::handlers;
use linkcrm_server::{health_check, AppError, AppState, Settings};
use std::net::TcpListener;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn build_cors(settings: &Settings) -> Cors {
    if !settings.cors.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = settings
        .cors
        .allowed_origins
        .iter()
        .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin));

    cors.allowed_methods(vec!["GET", "POST"])
        .allowed_headers(vec!["Content-Type", handlers::CSRF_HEADER])
        .supports_credentials()
        .max_age(settings.cors.max_age as usize)
}

#[actix_web::main]
async fn main() -> linkcrm_server::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!(environment = %config.environment, "Configuration loaded successfully");

    if config.webhook.secret.is_empty() {
        info!("webhook.secret is not set; payment webhooks will be rejected");
    }

    let state = web::Data::new(AppState::new(config.clone()));

    // Reap idle rate limit buckets
    let reaper_state = state.clone();
    let cleanup_interval = Duration::from_secs(config.rate_limit.cleanup_interval_seconds.max(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(cleanup_interval).await;
            let removed = reaper_state.rate_limiter.cleanup();
            debug!(removed, "rate limiter cleanup pass");
        }
    });

    let workers = config.server.workers as usize;

    // Create and bind TCP listener
    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Starting server at {}:{}", config.server.host, config.server.port);
    let cors_settings = config.clone();

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_settings))
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
            .configure(handlers::configure)
    })
    .listen(listener)?
    .workers(workers)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(())
}
