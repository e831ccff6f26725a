//! Typed errors surfaced by the proxy pipeline
//!
//! Policy failures and upstream problems are carried as an [`HttpError`] with
//! the status code that should reach the client. Anything else that escapes
//! the pipeline is mapped to 502 at the boundary.

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;

/// An error with a concrete HTTP status attached.
///
/// The client-visible body is the plain-text message, mirroring what
/// `http.Error`-style helpers produce.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status_text(status: StatusCode) -> Self {
        Self::new(status, status.canonical_reason().unwrap_or("error"))
    }

    pub fn not_found() -> Self {
        Self::status_text(StatusCode::NOT_FOUND)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        plain_text_error(self.status, &self.message)
    }
}

/// Build a plain-text error response, the default client-visible failure shape.
pub fn plain_text_error(status: StatusCode, message: &str) -> axum::response::Response {
    let mut resp = Response::new(Body::from(format!("{message}\n")));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Shorthand for a response carrying only the canonical status text.
pub fn status_response(status: StatusCode) -> axum::response::Response {
    plain_text_error(status, status.canonical_reason().unwrap_or("error"))
}
