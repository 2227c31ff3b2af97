//! Error taxonomy and JSON error responses for clients

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Why no backend could serve a request
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// The requested resource class is unavailable; another credential may work
    #[error("resource exhausted for credential {}: {}", .credential.as_deref().unwrap_or("<none>"), .reason)]
    ResourceExhausted {
        credential: Option<String>,
        reason: String,
    },
    /// Terminal provisioning failure for this request
    #[error("provisioning failed for credential {}: {}", .credential.as_deref().unwrap_or("<none>"), .reason)]
    Failure {
        credential: Option<String>,
        reason: String,
    },
    /// An active instance stopped answering while a request was forwarded
    #[error("backend unreachable at {endpoint}: {reason}")]
    BackendUnreachable { endpoint: String, reason: String },
}

impl ProvisionError {
    /// Whether trying another credential may help
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::ResourceExhausted { .. })
    }

    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProvisionError::ResourceExhausted { .. } => ProxyErrorCode::ResourceExhausted,
            ProvisionError::Failure { .. } => ProxyErrorCode::ProvisioningFailed,
            ProvisionError::BackendUnreachable { .. } => ProxyErrorCode::BackendUnreachable,
        }
    }
}

/// Error codes for client-visible errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Every credential reported the resource class as unavailable
    ResourceExhausted,
    /// No backend could be provisioned
    ProvisioningFailed,
    /// The backend failed while the request was forwarded
    BackendUnreachable,
    /// Route not served by the gateway
    NotFound,
    /// Request could not be read
    InvalidRequest,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ProvisioningFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ProxyErrorCode::ProvisioningFailed => "PROVISIONING_FAILED",
            ProxyErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// JSON error response describing a provisioning error
pub fn provision_error_response(error: &ProvisionError) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(error.code(), error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::ResourceExhausted.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::ProvisioningFailed.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::BackendUnreachable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyErrorCode::InvalidRequest.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ProvisioningFailed, "login failed");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"PROVISIONING_FAILED\""));
        assert!(json.contains("\"message\":\"login failed\""));
        assert!(json.contains("\"status\":503"));
    }

    #[test]
    fn test_provision_error_response() {
        let error = ProvisionError::ResourceExhausted {
            credential: Some("secondary".to_string()),
            reason: "T4 quota exceeded".to_string(),
        };
        let response = provision_error_response(&error);

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "RESOURCE_EXHAUSTED"
        );
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_provision_error_display() {
        let error = ProvisionError::Failure {
            credential: None,
            reason: "no endpoint submitted within 120s".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "provisioning failed for credential <none>: no endpoint submitted within 120s"
        );
        assert!(!error.is_retryable());
        assert!(ProvisionError::ResourceExhausted {
            credential: None,
            reason: String::new()
        }
        .is_retryable());
    }
}
