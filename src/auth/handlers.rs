use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::http::Method;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{verify_webhook_signature, SIGNATURE_HEADER};
use crate::config::{RateLimitRule, Settings};
use crate::error::{AppError, AuthError};
use crate::AppState;

pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// First hop of `X-Forwarded-For`, else the socket peer.
pub fn client_ip(req: &HttpRequest) -> String {
    let forwarded = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    match forwarded {
        Some(ip) => ip.to_string(),
        None => req
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

/// Rate limits `operation` per client IP under the key `"<operation>:<ip>"`.
pub fn enforce_ip_rate_limit(
    req: &HttpRequest,
    state: &AppState,
    operation: &str,
    rule: &RateLimitRule,
) -> Result<(), AppError> {
    let ip = client_ip(req);
    state
        .rate_limiter
        .check_rule(&format!("{}:{}", operation, ip), rule)
        .map_err(|e| {
            warn!(operation, %ip, "rate limit exceeded");
            AppError::from(e)
        })
}

pub fn session_cookie(settings: &Settings, token: &str) -> Cookie<'static> {
    Cookie::build(settings.auth.session_cookie_name.clone(), token.to_owned())
        .path("/")
        .http_only(true)
        .secure(settings.is_production())
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::days(settings.auth.session_expires_days))
        .finish()
}

/// Removal cookie for sign-out. The session token itself is not revoked.
pub fn cleared_session_cookie(settings: &Settings) -> Cookie<'static> {
    let mut cookie = session_cookie(settings, "");
    cookie.make_removal();
    cookie
}

pub fn current_profile_id(req: &HttpRequest, state: &AppState) -> Result<Uuid, AppError> {
    let cookie = req
        .cookie(&state.config.auth.session_cookie_name)
        .ok_or(AuthError::Unauthorized)?;

    let subject = state.tokens.verify_session(cookie.value())?;
    Uuid::parse_str(&subject).map_err(|_| AppError::AuthError(AuthError::InvalidToken))
}

/// State-changing methods need a valid CSRF token, taken from the submitted
/// form field when there is one and from the `X-CSRF-Token` header otherwise.
pub fn csrf_protect(
    req: &HttpRequest,
    state: &AppState,
    form_token: Option<&str>,
) -> Result<(), AppError> {
    if ![Method::POST, Method::PUT, Method::DELETE].contains(req.method()) {
        return Ok(());
    }

    let token = form_token.or_else(|| {
        req.headers()
            .get(CSRF_HEADER)
            .and_then(|h| h.to_str().ok())
    });

    match token {
        Some(token) if state.tokens.verify_csrf(token) => Ok(()),
        _ => {
            warn!(path = %req.path(), "CSRF validation failed");
            Err(AuthError::CsrfFailed.into())
        }
    }
}

/// Form body of a server-rendered POST carrying its CSRF token.
#[derive(Debug, Deserialize)]
pub struct CsrfForm {
    pub csrf_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CsrfResponse {
    pub csrf_token: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub profile_id: Uuid,
}

pub async fn csrf_token(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let csrf_token = state.tokens.issue_csrf()?;
    Ok(HttpResponse::Ok().json(CsrfResponse { csrf_token }))
}

pub async fn session(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let profile_id = current_profile_id(&req, &state)?;
    Ok(HttpResponse::Ok().json(SessionResponse { profile_id }))
}

pub async fn logout(
    req: HttpRequest,
    form: Option<web::Form<CsrfForm>>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    // Non-form bodies fall back to the header
    let form_token = form.as_ref().and_then(|f| f.csrf_token.as_deref());
    csrf_protect(&req, &state, form_token)?;

    Ok(HttpResponse::Ok()
        .cookie(cleared_session_cookie(&state.config))
        .json(serde_json::json!({
            "message": "Successfully logged out"
        })))
}

/// Accepts a payment provider webhook once its signature checks out.
/// Interpreting the payload is left to the subscription layer.
pub async fn payments_webhook(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    enforce_ip_rate_limit(&req, &state, "webhook", &state.config.rate_limit.webhook)?;

    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(AuthError::InvalidSignature)?;

    if !verify_webhook_signature(&state.config.webhook.secret, &body, signature) {
        warn!(ip = %client_ip(&req), "webhook signature rejected");
        return Err(AuthError::InvalidSignature.into());
    }

    info!(bytes = body.len(), "webhook signature verified");
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "accepted" })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/auth/csrf", web::get().to(csrf_token))
        .route("/auth/session", web::get().to(session))
        .route("/auth/logout", web::post().to(logout))
        .route("/payments/webhook", web::post().to(payments_webhook));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn state() -> AppState {
        AppState::new(Settings::new_for_test().unwrap())
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let req = TestRequest::default()
            .insert_header(("X-Forwarded-For", "203.0.113.7, 10.0.0.1"))
            .peer_addr("192.0.2.1:5555".parse().unwrap())
            .to_http_request();
        assert_eq!(client_ip(&req), "203.0.113.7");

        let req = TestRequest::default()
            .peer_addr("192.0.2.1:5555".parse().unwrap())
            .to_http_request();
        assert_eq!(client_ip(&req), "192.0.2.1");

        let req = TestRequest::default().to_http_request();
        assert_eq!(client_ip(&req), "unknown");
    }

    #[test]
    fn test_session_cookie_attributes() {
        let settings = Settings::new_for_test().unwrap();
        let cookie = session_cookie(&settings, "token-value");
        assert_eq!(cookie.name(), "session");
        assert_eq!(cookie.value(), "token-value");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.secure(), Some(false));
        assert_eq!(cookie.max_age(), Some(CookieDuration::days(30)));

        let cleared = cleared_session_cookie(&settings);
        assert_eq!(cleared.value(), "");
        assert_eq!(cleared.max_age(), Some(CookieDuration::ZERO));
        assert_eq!(cleared.http_only(), Some(true));
        assert_eq!(cleared.path(), Some("/"));
    }

    #[test]
    fn test_csrf_skips_safe_methods() {
        let state = state();
        let req = TestRequest::get().to_http_request();
        assert!(csrf_protect(&req, &state, None).is_ok());
    }

    #[test]
    fn test_csrf_form_field_and_header() {
        let state = state();
        let token = state.tokens.issue_csrf().unwrap();

        let req = TestRequest::post().to_http_request();
        assert!(csrf_protect(&req, &state, Some(&token)).is_ok());
        assert!(matches!(
            csrf_protect(&req, &state, None),
            Err(AppError::AuthError(AuthError::CsrfFailed))
        ));

        let req = TestRequest::delete()
            .insert_header((CSRF_HEADER, token.as_str()))
            .to_http_request();
        assert!(csrf_protect(&req, &state, None).is_ok());
    }

    #[test]
    fn test_csrf_rejects_session_token() {
        let state = state();
        let session = state.tokens.issue_session(&Uuid::new_v4().to_string()).unwrap();
        let req = TestRequest::put()
            .insert_header((CSRF_HEADER, session.as_str()))
            .to_http_request();
        assert!(csrf_protect(&req, &state, None).is_err());
    }

    #[test]
    fn test_lead_rule_per_ip() {
        let state = state();
        let rule = state.config.rate_limit.lead;
        let req = TestRequest::post()
            .insert_header(("X-Forwarded-For", "198.51.100.4"))
            .to_http_request();

        for _ in 0..rule.max_requests {
            assert!(enforce_ip_rate_limit(&req, &state, "lead", &rule).is_ok());
        }
        assert!(matches!(
            enforce_ip_rate_limit(&req, &state, "lead", &rule),
            Err(AppError::AuthError(AuthError::RateLimited))
        ));
        // Other operations from the same IP have their own bucket
        assert!(enforce_ip_rate_limit(&req, &state, "webhook", &rule).is_ok());
    }
}
