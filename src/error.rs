use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Downstream-visible error. Serializes as the Claude error envelope so
/// callers never see a raw internal failure.
#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub error_type: String,
    pub message: String,
}

impl AppError {
    pub fn new(
        status: StatusCode,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication_error", message)
    }

    pub fn no_capacity(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "overloaded_error", message)
    }

    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        let error_type = match status {
            StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
            StatusCode::SERVICE_UNAVAILABLE => "overloaded_error",
            _ => "api_error",
        };
        Self::new(status, error_type, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "api_error", message)
    }

    /// Failures worth another attempt against a different account.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.status,
            StatusCode::TOO_MANY_REQUESTS
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        )
    }

    /// The upstream told us to back off this specific account. Timeouts are
    /// retryable but carry no such signal.
    pub fn is_rate_limit_signal(&self) -> bool {
        matches!(
            self.status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
        )
    }

    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": { "type": self.error_type, "message": self.message }
        })
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.error_type)
    }
}

impl std::error::Error for AppError {}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::new(StatusCode::GATEWAY_TIMEOUT, "api_error", "upstream timeout")
        } else {
            Self::internal(format!("upstream request failed: {error}"))
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "type")]
    kind: &'static str,
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            kind: "error",
            error: ErrorBody {
                error_type: self.error_type,
                message: self.message,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_picks_error_type() {
        let err = AppError::upstream(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(err.error_type, "rate_limit_error");
        assert!(err.is_retryable());

        let err = AppError::upstream(StatusCode::BAD_GATEWAY, "boom");
        assert_eq!(err.error_type, "api_error");
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeout_retries_without_benching_the_account() {
        let timeout: AppError = AppError::new(
            StatusCode::GATEWAY_TIMEOUT,
            "api_error",
            "upstream timeout",
        );
        assert!(timeout.is_retryable());
        assert!(!timeout.is_rate_limit_signal());

        assert!(AppError::upstream(StatusCode::TOO_MANY_REQUESTS, "quota").is_rate_limit_signal());
        assert!(AppError::upstream(StatusCode::SERVICE_UNAVAILABLE, "busy").is_rate_limit_signal());
    }

    #[test]
    fn envelope_shape() {
        let err = AppError::no_capacity("no available accounts");
        assert_eq!(
            err.envelope(),
            serde_json::json!({
                "type": "error",
                "error": { "type": "overloaded_error", "message": "no available accounts" }
            })
        );
    }
}
