use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::cache::ImageError;
use crate::infra::upstream::FetchError;

/// Diagnostic chain attached to error responses for trace logging.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Persistence failures of the JSON-file stores (filters, history, settings).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

/// API error response: JSON `{"error": ...}` with the diagnostic report in
/// the response extensions.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl ApiError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status,
            public_message,
            report: ErrorReport::from_message(source, status, detail),
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        Self {
            status,
            public_message,
            report: ErrorReport::from_error(source, status, error),
        }
    }

    pub fn not_found(source: &'static str, detail: impl Into<String>) -> Self {
        Self::new(source, StatusCode::NOT_FOUND, "Resource not found", detail)
    }

    pub fn bad_request(source: &'static str, detail: impl Into<String>) -> Self {
        Self::new(
            source,
            StatusCode::BAD_REQUEST,
            "Request could not be processed",
            detail,
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.public_message }));
        let mut response = (self.status, body).into_response();
        self.report.attach(&mut response);
        response
    }
}

/// Map a classified fetch outcome to the HTTP surface.
pub fn fetch_error_to_api(source: &'static str, err: FetchError) -> ApiError {
    match &err {
        FetchError::NotFound => ApiError::from_error(
            source,
            StatusCode::NOT_FOUND,
            "Resource not found upstream",
            &err,
        ),
        FetchError::Unavailable { .. } => ApiError::from_error(
            source,
            StatusCode::SERVICE_UNAVAILABLE,
            "Upstream temporarily unavailable",
            &err,
        ),
        FetchError::BadRequest { .. } => ApiError::from_error(
            source,
            StatusCode::BAD_REQUEST,
            "Upstream rejected the request",
            &err,
        ),
        FetchError::Payload(_) => ApiError::from_error(
            source,
            StatusCode::BAD_GATEWAY,
            "Upstream returned an unreadable payload",
            &err,
        ),
    }
}

pub fn image_error_to_api(source: &'static str, err: ImageError) -> ApiError {
    match err {
        ImageError::Fetch(err) => fetch_error_to_api(source, err),
        ImageError::Io(err) => ApiError::from_error(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Image store failure",
            &err,
        ),
    }
}

pub fn store_error_to_api(source: &'static str, err: StoreError) -> ApiError {
    ApiError::from_error(
        source,
        StatusCode::INTERNAL_SERVER_ERROR,
        "Persistence failure",
        &err,
    )
}
