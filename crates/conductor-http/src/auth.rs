//! Bearer-token gate in front of the websocket route.
//!
//! A connection must be approved here before the router ever registers it,
//! so an unauthenticated client never receives a single engine frame.
//!
//! # Where the token comes from
//!
//! 1. `Authorization: Bearer <token>` for tools that can set headers
//! 2. `?token=<token>` for browsers, which cannot set headers on a websocket
//!    handshake
//!
//! The header wins when both are present.
//!
//! # Decision
//!
//! - No token configured on the daemon: every request passes
//! - Token configured: the presented token must match exactly, otherwise the
//!   request ends here with `401 Unauthorized`

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::HttpState;

/// Token from an `Authorization: Bearer <token>` header.
///
/// Other schemes (`Basic`, ...) and non-UTF-8 header values yield `None`.
///
/// # Arguments
/// * `req` - the incoming request; generic over the body so tests can use `()`
fn bearer_token<B>(req: &axum::http::Request<B>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Value of the `token` query parameter, taken verbatim (no percent-decoding).
///
/// # Arguments
/// * `req` - the incoming request; generic over the body so tests can use `()`
fn query_token<B>(req: &axum::http::Request<B>) -> Option<&str> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token").then_some(value)
    })
}

/// Axum middleware enforcing the bearer token on the routes it wraps.
///
/// Attached with `route_layer` so only matched protected routes pay for it;
/// `/health` stays open.
///
/// # Arguments
/// * `state` - shared HTTP state holding the configured token
/// * `req` - the request being authorised
/// * `next` - the rest of the middleware stack
///
/// # Returns
/// The inner response when authorised, otherwise `401` with a plain-text body.
pub async fn auth_middleware(
    State(state): State<Arc<HttpState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.auth_token.is_none() {
        return next.run(req).await;
    }

    let token = bearer_token(&req).or_else(|| query_token(&req));
    if state.validate_token(token) {
        next.run(req).await
    } else {
        log::warn!("Rejected unauthenticated request to {}", req.uri().path());
        (StatusCode::UNAUTHORIZED, "Invalid or missing authentication token").into_response()
    }
}
