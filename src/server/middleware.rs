use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::AppState;
use crate::ratelimit::{RateLimitResult, RequestIdentity, RuleKind};

/// API Key authentication middleware
/// Validates X-API-Key header against configured api.key
pub async fn api_key_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    // If no API key is configured, allow all requests (development mode)
    let Some(expected_key) = &state.settings.api.key else {
        return Ok(next.run(req).await);
    };

    match api_key_header(&req) {
        Some(key) if key == expected_key => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("Missing API key header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn api_key_header(req: &Request<Body>) -> Option<&str> {
    req.headers().get("X-API-Key").and_then(|v| v.to_str().ok())
}

/// The presented API key, only when it matches the configured one
fn authenticated_key<'a>(req: &'a Request<Body>, expected: Option<&str>) -> Option<&'a str> {
    let expected = expected?;
    api_key_header(req).filter(|key| *key == expected)
}

/// Client IP.
///
/// The socket peer is the client unless it is a trusted proxy. Behind a
/// trusted proxy, `X-Forwarded-For` is walked from the right and the first
/// hop that is not itself a trusted proxy is the client.
pub fn client_ip(req: &Request<Body>, trusted_proxies: &[IpAddr]) -> Option<IpAddr> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())?;

    if !trusted_proxies.contains(&peer) {
        return Some(peer);
    }

    let Some(forwarded) = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
    else {
        return Some(peer);
    };

    let mut client = peer;
    for hop in forwarded.rsplit(',') {
        let Ok(ip) = hop.trim().parse::<IpAddr>() else {
            break;
        };
        client = ip;
        if !trusted_proxies.contains(&ip) {
            break;
        }
    }
    Some(client)
}

fn identity_for(
    req: &Request<Body>,
    expected_key: Option<&str>,
    trusted_proxies: &[IpAddr],
) -> RequestIdentity {
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Only a validated key names the caller; anything else is keyed by IP.
    // The identity carries a key prefix, never the full key.
    let api_key = authenticated_key(req, expected_key)
        .map(|key| format!("key-{}", key.chars().take(8).collect::<String>()));

    RequestIdentity::default()
        .with_ip(client_ip(req, trusted_proxies))
        .with_user(api_key)
        .with_path(req.uri().path())
        .with_user_agent(user_agent)
}

/// Rate limiting middleware for HTTP API requests.
///
/// Returns 429 Too Many Requests with Retry-After header when rate limited.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let identity = identity_for(
        &req,
        state.settings.api.key.as_deref(),
        &state.settings.server.trusted_proxies,
    );
    let result = state.limiter.check(RuleKind::Http, &identity).await;

    match result {
        RateLimitResult::Allowed {
            remaining,
            limit,
            reset_at,
        } => {
            let mut response = next.run(req).await;

            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert("X-RateLimit-Limit", v);
            }
            if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
                headers.insert("X-RateLimit-Remaining", v);
            }
            if let Ok(v) = HeaderValue::from_str(&reset_at.to_string()) {
                headers.insert("X-RateLimit-Reset", v);
            }

            response
        }
        RateLimitResult::Denied {
            retry_after,
            limit,
            reset_at,
        } => {
            tracing::warn!(
                ip = ?identity.ip,
                path = %req.uri().path(),
                retry_after = retry_after,
                "Rate limit exceeded"
            );
            rate_limit_response(retry_after, limit, reset_at)
        }
        RateLimitResult::Exempt | RateLimitResult::FailedOpen { .. } => next.run(req).await,
    }
}

/// Rate limiting middleware for WebSocket handshakes, keyed by client IP.
pub async fn ws_rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let identity = identity_for(
        &req,
        state.settings.api.key.as_deref(),
        &state.settings.server.trusted_proxies,
    );
    let result = state.limiter.check(RuleKind::WsConnect, &identity).await;

    match result {
        RateLimitResult::Denied {
            retry_after,
            limit,
            reset_at,
        } => {
            tracing::warn!(
                ip = ?identity.ip,
                retry_after = retry_after,
                "WebSocket connection rate limit exceeded"
            );
            rate_limit_response(retry_after, limit, reset_at)
        }
        _ => next.run(req).await,
    }
}

/// Build a rate limit error response with proper headers
fn rate_limit_response(retry_after: u64, limit: u32, reset_at: i64) -> Response {
    let body = json!({
        "error": {
            "code": "RATE_LIMITED",
            "message": format!("Too many requests, please retry after {} seconds", retry_after)
        }
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();

    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
        headers.insert(header::RETRY_AFTER, v);
    }
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
    if let Ok(v) = HeaderValue::from_str(&reset_at.to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }

    response
}
