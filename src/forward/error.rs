//! Forward module error types
//!
//! Every client-visible failure renders the same envelope:
//!
//! ```json
//! {"error":{"message":"...","type":"...","code":"...",
//!           "upstreamStatus":N,"upstreamResponse":{...}}}
//! ```
//!
//! Upstream failures pass the upstream status code through unchanged; the
//! gateway never converts a 429/401/402 into a retry against another
//! account.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum ForwardError {
    /// Missing or malformed request body/fields.
    InvalidRequest(String),
    /// Bearer missing, unknown or deleted.
    Unauthorized(String),
    /// Valid key without the required provider permission, or a client
    /// restriction failed.
    PermissionDenied(String),
    /// A bound account id that no longer resolves.
    AccountNotFound(String),
    /// Dialect demands an account family the selection cannot satisfy
    /// (e.g. v1internal with an API-key account).
    InvalidAccountType(String),
    /// Account exists but lacks required configuration (e.g. no project id
    /// and discovery failed).
    ConfigurationRequired(String),
    /// Scheduler found no eligible account.
    NoAvailableAccount(String),
    /// Global session binding points at an unusable account.
    SessionBindingInvalid(String),
    /// Tenant-side quota or rate limit.
    RateLimited(String),
    /// Upstream returned a non-success status; body passed through.
    Upstream { status: u16, body: Value },
    /// Upstream transport timeout.
    Timeout(String),
    /// Mid-stream failure after headers were flushed.
    Stream(String),
    /// Anything unexpected.
    Internal(String),
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ForwardError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ForwardError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ForwardError::AccountNotFound(_) => StatusCode::NOT_FOUND,
            ForwardError::InvalidAccountType(_) => StatusCode::BAD_REQUEST,
            ForwardError::ConfigurationRequired(_) => StatusCode::FORBIDDEN,
            ForwardError::NoAvailableAccount(_) => StatusCode::SERVICE_UNAVAILABLE,
            ForwardError::SessionBindingInvalid(_) => StatusCode::FORBIDDEN,
            ForwardError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ForwardError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ForwardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::Stream(_) => StatusCode::BAD_GATEWAY,
            ForwardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ForwardError::InvalidRequest(_) => "invalid_request_error",
            ForwardError::Unauthorized(_) => "unauthorized",
            ForwardError::PermissionDenied(_) => "permission_denied",
            ForwardError::AccountNotFound(_) => "account_not_found",
            ForwardError::InvalidAccountType(_) => "invalid_account_type",
            ForwardError::ConfigurationRequired(_) => "configuration_required",
            ForwardError::NoAvailableAccount(_) => "service_unavailable",
            ForwardError::SessionBindingInvalid(_) => "permission_denied",
            ForwardError::RateLimited(_) => "usage_limit_reached",
            ForwardError::Upstream { .. } => "api_error",
            ForwardError::Timeout(_) => "api_error",
            ForwardError::Stream(_) => "stream_error",
            ForwardError::Internal(_) => "api_error",
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            ForwardError::SessionBindingInvalid(_) => Some("SESSION_BINDING_INVALID"),
            ForwardError::NoAvailableAccount(_) => Some("NO_AVAILABLE_ACCOUNT"),
            ForwardError::InvalidAccountType(_) => Some("INVALID_ACCOUNT_TYPE"),
            _ => None,
        }
    }

    fn message(&self) -> String {
        match self {
            ForwardError::InvalidRequest(m)
            | ForwardError::Unauthorized(m)
            | ForwardError::PermissionDenied(m)
            | ForwardError::AccountNotFound(m)
            | ForwardError::InvalidAccountType(m)
            | ForwardError::ConfigurationRequired(m)
            | ForwardError::NoAvailableAccount(m)
            | ForwardError::SessionBindingInvalid(m)
            | ForwardError::RateLimited(m)
            | ForwardError::Timeout(m)
            | ForwardError::Stream(m)
            | ForwardError::Internal(m) => m.clone(),
            ForwardError::Upstream { status, body } => body
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("Upstream returned {}", status)),
        }
    }

    /// The JSON body rendered for this error.
    pub fn body(&self) -> Value {
        let mut error = serde_json::json!({
            "message": self.message(),
            "type": self.error_type(),
        });
        if let Some(code) = self.code() {
            error["code"] = Value::String(code.to_string());
        }
        if let ForwardError::Upstream { status, body } = self {
            error["upstreamStatus"] = Value::from(*status);
            if !body.is_null() {
                error["upstreamResponse"] = body.clone();
            }
        }
        serde_json::json!({ "error": error })
    }
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type(), self.message())
    }
}

impl std::error::Error for ForwardError {}

impl From<crate::store::StoreError> for ForwardError {
    fn from(e: crate::store::StoreError) -> Self {
        ForwardError::Internal(format!("store error: {}", e))
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            crate::logger::error("forward", &format!("Returning error response: {}", self));
        } else {
            crate::logger::warn("forward", &format!("Returning error response: {}", self));
        }
        (status, Json(self.body())).into_response()
    }
}

pub type ForwardResult<T> = Result<T, ForwardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let err = ForwardError::SessionBindingInvalid("session bound elsewhere".to_string());
        let body = err.body();
        assert_eq!(body["error"]["type"], "permission_denied");
        assert_eq!(body["error"]["code"], "SESSION_BINDING_INVALID");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn upstream_passthrough_keeps_status_and_body() {
        let upstream_body = serde_json::json!({
            "error": {"type": "usage_limit_reached", "message": "limit hit"}
        });
        let err = ForwardError::Upstream {
            status: 429,
            body: upstream_body.clone(),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = err.body();
        assert_eq!(body["error"]["upstreamStatus"], 429);
        assert_eq!(body["error"]["upstreamResponse"], upstream_body);
        assert_eq!(body["error"]["message"], "limit hit");
    }

    #[test]
    fn invalid_request_is_400() {
        let err = ForwardError::InvalidRequest("contents must not be empty".to_string());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.body()["error"]["type"], "invalid_request_error");
    }
}
