use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for the admin handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message.
#[derive(Debug)]
pub enum ApiError {
    /// 404 - Generic not-found.
    NotFound,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - Action or group name failed validation.
    InvalidName(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidName(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound => "not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidName(_) => "invalid_name",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::InvalidName(detail) => format!("Invalid name: {}.", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
