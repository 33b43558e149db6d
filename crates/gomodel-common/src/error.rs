use serde::Serialize;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error taxonomy shared across the gateway. Each kind carries a default
/// HTTP status; `Provider` keeps the upstream status when it was a 4xx.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    NotFound,
    RateLimit,
    Provider,
    Timeout,
    CircuitOpen,
    Internal,
}

impl ErrorKind {
    pub fn error_type(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::Provider => "provider_error",
            ErrorKind::Timeout => "timeout_error",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Internal => "internal_error",
        }
    }

    pub fn default_status(self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::RateLimit => 429,
            ErrorKind::Provider => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::CircuitOpen => 503,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    /// Upstream status when it should override the kind's default (4xx passthrough).
    pub upstream_status: Option<u16>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream_status: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn circuit_open(provider: &str) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit open for provider {provider}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Classify an upstream HTTP failure. 4xx statuses keep their meaning
    /// (and their status code); everything else is a provider error.
    pub fn from_upstream_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match status {
            400 => ErrorKind::InvalidRequest,
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            _ => ErrorKind::Provider,
        };
        let upstream_status = if (400..500).contains(&status) {
            Some(status)
        } else {
            None
        };
        Self {
            kind,
            message,
            upstream_status,
        }
    }

    /// The HTTP status the gateway response carries for this error.
    pub fn status(&self) -> u16 {
        self.upstream_status.unwrap_or(self.kind.default_status())
    }

    pub fn error_type(&self) -> &'static str {
        self.kind.error_type()
    }

    /// OpenAI-style error body.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                r#type: self.error_type(),
                message: self.message.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub r#type: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_4xx_keeps_status() {
        let err = GatewayError::from_upstream_status(429, "slow down");
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.status(), 429);

        let err = GatewayError::from_upstream_status(403, "no");
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(err.status(), 403);
    }

    #[test]
    fn upstream_5xx_maps_to_provider_502() {
        let err = GatewayError::from_upstream_status(500, "boom");
        assert_eq!(err.kind, ErrorKind::Provider);
        assert_eq!(err.status(), 502);
    }

    #[test]
    fn error_body_shape() {
        let err = GatewayError::invalid_request("unsupported model: nope");
        let body = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["message"], "unsupported model: nope");
    }
}
