//! HTTP request gateway.
//!
//! Every request lands in a single fallback handler and walks the same
//! state machine:
//!
//! ```text
//! Received ──► method check ──► AuthChecked ──► Routed ──► Responded
//!                  │ 405            │ 401 / 403     │ GET  → 200 / 204 / 404
//!                  ▼                ▼               │ POST → 200 / 500 / 404
//!              Responded        Responded           ▼
//! ```
//!
//! The first failing step produces the only response. Every response carries
//! `Connection: close`, so each connection serves exactly one request.

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, SERVER, WWW_AUTHENTICATE},
        HeaderMap, HeaderValue, Method, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
    Router,
};
use http_body_util::LengthLimitError;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::broker::PublishOutcome;
use crate::state::RelayState;
use crate::topic;

const SERVER_NAME: &str = concat!("mqtt-rest-relay/", env!("CARGO_PKG_VERSION"));

/// Build the relay router.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(SetResponseHeaderLayer::overriding(
            CONNECTION,
            HeaderValue::from_static("close"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map a publish outcome to the HTTP status returned to the caller.
pub fn publish_status(outcome: PublishOutcome) -> StatusCode {
    match outcome {
        PublishOutcome::Confirmed => StatusCode::OK,
        PublishOutcome::Failed | PublishOutcome::BrokerUnavailable => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// The body stays unread until a POST has passed the method, auth and
/// publish gate checks.
async fn dispatch(State(state): State<RelayState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    if parts.method != Method::GET && parts.method != Method::POST {
        tracing::debug!(method = %parts.method, path = parts.uri.path(), "Method not allowed");
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    if let Some(rejection) = authorize(&state, &parts.headers) {
        return rejection;
    }

    let path = decode_path(&parts.uri);
    if parts.method == Method::GET {
        handle_get(&state, &path)
    } else {
        handle_post(&state, &path, &parts.headers, body).await
    }
}

/// Returns the rejection response, or None if the request may proceed.
fn authorize(state: &RelayState, headers: &HeaderMap) -> Option<Response> {
    let presented = headers
        .get(AUTHORIZATION)
        .map(|value| value.to_str().unwrap_or_default());

    if state.guard.needs_auth() && presented.is_none() {
        tracing::warn!("Request without credentials");
        let challenge = format!("Basic realm=\"{}\"", state.realm);
        let mut response = StatusCode::UNAUTHORIZED.into_response();
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response.headers_mut().insert(WWW_AUTHENTICATE, value);
        }
        return Some(response);
    }

    if !state.guard.check(presented) {
        tracing::warn!("Request with invalid credentials");
        return Some(StatusCode::FORBIDDEN.into_response());
    }

    None
}

/// GET /<topic> — serve the cached payload.
fn handle_get(state: &RelayState, path: &str) -> Response {
    match state.cache.get(path) {
        Some(None) => {
            tracing::debug!(path = path, "GET: no message yet");
            StatusCode::NO_CONTENT.into_response()
        }
        Some(Some(payload)) => {
            tracing::debug!(path = path, payload = payload.as_str(), "GET");
            let length = HeaderValue::from(payload.len());
            (StatusCode::OK, [(CONTENT_LENGTH, length)], payload).into_response()
        }
        None => {
            tracing::warn!(path = path, "GET not found");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// POST /<topic> — publish the body and wait for confirmation.
async fn handle_post(state: &RelayState, path: &str, headers: &HeaderMap, body: Body) -> Response {
    if !state.is_publishable(path) {
        tracing::warn!(path = path, "POST not found");
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some(topic) = topic::topic_from_path(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let body = match read_body(state.max_body_bytes, headers, body).await {
        Ok(body) => body,
        Err(status) => return status.into_response(),
    };

    tracing::debug!(
        topic = topic,
        len = body.len(),
        data = %String::from_utf8_lossy(&body),
        "POST"
    );

    let outcome = match &state.publisher {
        Some(publisher) => publisher.publish(topic, body.to_vec()).await,
        None => {
            tracing::error!(topic = topic, "Cannot publish, no MQTT client attached");
            PublishOutcome::BrokerUnavailable
        }
    };

    publish_status(outcome).into_response()
}

/// Buffer a POST body up to `limit` bytes.
///
/// A declared `Content-Length` over the limit is refused before reading.
async fn read_body(limit: usize, headers: &HeaderMap, body: Body) -> Result<Bytes, StatusCode> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if let Some(declared) = declared.filter(|len| *len > limit) {
        tracing::warn!(declared = declared, limit = limit, "POST body too large");
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    axum::body::to_bytes(body, limit).await.map_err(|e| {
        let e = e.into_inner();
        if e.downcast_ref::<LengthLimitError>().is_some() {
            tracing::warn!(limit = limit, "POST body too large");
            StatusCode::PAYLOAD_TOO_LARGE
        } else {
            tracing::warn!(error = %e, "Failed to read POST body");
            StatusCode::BAD_REQUEST
        }
    })
}

/// Percent-decode the request path. The query string is ignored.
fn decode_path(uri: &Uri) -> String {
    let raw = uri.path();
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}
