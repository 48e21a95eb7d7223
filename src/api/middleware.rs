//! Request guards and response decoration.

use std::any::Any;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use super::handlers::AppState;
use super::response::{InternalErrorDetail, GENERIC_ERROR_MESSAGE};
use super::types::ApiResponse;
use crate::error::GatewayError;
use crate::security::events::{EventType, SecurityEvent, Severity};
use crate::security::rate_limit::{ClientAddress, UNKNOWN_ADDRESS};
use crate::security::{looks_suspicious, ValidationError};

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
    ("content-security-policy", "default-src 'self'"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("permissions-policy", "geolocation=(), microphone=(), camera=()"),
];

/// Add the standard security headers to every response.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    response
}

/// Report handler latency in `X-Process-Time` (seconds).
pub async fn process_time(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = format!("{:.6}", start.elapsed().as_secs_f64());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        response.headers_mut().insert("x-process-time", value);
    }
    response
}

/// Refuse request bodies that declare a non-JSON content type.
pub async fn require_json_body(request: Request, next: Next) -> Response {
    let has_body = matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH);
    if has_body {
        let content_type = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.is_empty() && !content_type.contains("application/json") {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                Json(ApiResponse::failure(
                    "Content-Type must be application/json",
                    "unsupported_media_type",
                )),
            )
                .into_response();
        }
    }
    next.run(request).await
}

/// Reject query strings carrying injection markers.
pub async fn reject_suspicious_query(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let suspicious = match request.uri().query() {
        None => false,
        Some(raw) => match Query::<Vec<(String, String)>>::try_from_uri(request.uri()) {
            Ok(Query(pairs)) => pairs.iter().any(|(_, v)| looks_suspicious(v)),
            Err(_) => looks_suspicious(raw),
        },
    };

    if suspicious {
        let address = client_address(&request);
        tracing::warn!("Suspicious query parameters from {}", address);
        state.events.emit(
            SecurityEvent::new(EventType::SuspiciousRequest, address, Severity::Warning)
                .with("path", request.uri().path()),
        );
        return GatewayError::from(ValidationError::SuspiciousInput).into_response();
    }

    next.run(request).await
}

/// Log and record sanitized 5xx responses; expose detail in debug mode.
pub async fn error_boundary(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let address = client_address(&request);

    let response = next.run(request).await;
    let Some(InternalErrorDetail(detail)) = response.extensions().get::<InternalErrorDetail>().cloned()
    else {
        return response;
    };

    state.events.emit(
        SecurityEvent::new(EventType::UnhandledError, address, Severity::Error)
            .with("method", method.as_str())
            .with("path", path)
            .with("error", detail.clone()),
    );

    if !state.settings.debug {
        return response;
    }

    let (mut parts, _) = response.into_parts();
    let mut body = ApiResponse::failure(detail, "internal_server_error");
    body.data = Some(serde_json::json!({ "sanitized_message": GENERIC_ERROR_MESSAGE }));
    let json = serde_json::to_vec(&body).unwrap_or_default();
    parts.headers.remove(axum::http::header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(json))
}

/// Response for a panicking handler.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };

    GatewayError::Internal(format!("handler panicked: {}", detail)).into_response()
}

fn client_address(request: &Request) -> String {
    request
        .extensions()
        .get::<ClientAddress>()
        .map(|a| a.0.clone())
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}
