use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::AppState;
use crate::error::{ServiceError, run_blocking};
use crate::rate_limit::Verdict;

/// The caller resolved by one of the auth gates.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: i64,
    pub username: String,
}

/// Validates the bearer access token and stores the caller as [`AuthUser`].
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| ServiceError::unauthorized("missing bearer token"))?;

    let user = run_blocking(move || state.auth.authenticate(&token)).await?;

    req.extensions_mut().insert(AuthUser {
        id: user.id,
        username: user.username,
    });
    Ok(next.run(req).await)
}

/// Resolves the post key in the path to its owner.
pub async fn require_post_key(
    State(state): State<AppState>,
    Path(post_key): Path<String>,
    mut req: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let user = run_blocking(move || state.auth.authenticate_post_key(&post_key)).await?;

    req.extensions_mut().insert(AuthUser {
        id: user.id,
        username: user.username,
    });
    Ok(next.run(req).await)
}

/// Fixed-window limits for post creation, checked before the key is even
/// looked up.
pub async fn enforce_post_limits(
    State(state): State<AppState>,
    Path(post_key): Path<String>,
    req: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let ip = client_ip(req.headers(), peer_addr(&req), state.trust_forwarded_for);

    match state.post_limits.check(&ip, &post_key)? {
        Verdict::Allowed => Ok(next.run(req).await),
        Verdict::Limited { .. } => Err(ServiceError::rate_limited()),
    }
}

/// Process-wide token bucket in front of every route.
pub async fn global_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    if let Some(limiter) = &state.global_limit {
        if !limiter.try_acquire() {
            debug!("global rate limit hit for {}", req.uri().path());
            return Err(ServiceError::rate_limited());
        }
    }
    Ok(next.run(req).await)
}

fn peer_addr(req: &Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// The peer address, or the first `X-Forwarded-For` hop when the server sits
/// behind a trusted proxy.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
