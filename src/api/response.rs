//! HTTP mapping for [`GatewayError`].

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::types::ApiResponse;
use crate::error::GatewayError;
use crate::security::rate_limit::retry_after_secs;

/// Message returned in place of internal error detail.
pub const GENERIC_ERROR_MESSAGE: &str = "An error occurred while processing your request";

/// Full error text for a sanitized 5xx response.
///
/// Stored in response extensions so the error boundary can log it or, in
/// debug mode, expose it.
#[derive(Debug, Clone)]
pub struct InternalErrorDetail(pub String);

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let detail = (!self.is_client_safe()).then(|| self.to_string());
        let message = match &detail {
            Some(_) => GENERIC_ERROR_MESSAGE.to_string(),
            None => self.to_string(),
        };

        let body = ApiResponse::failure(message, self.code());
        let mut response = (status, Json(body)).into_response();

        if let Some(retry_after) = self.retry_after() {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
        }
        if let Some(detail) = detail {
            tracing::error!(code = self.code(), "Request failed: {}", detail);
            response.extensions_mut().insert(InternalErrorDetail(detail));
        }

        response
    }
}
