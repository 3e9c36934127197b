use common_api_errors::{ApiError, ErrorBody};
use thiserror::Error;

/// Internal failure taxonomy. Converted to the wire shape at the HTTP edge
/// and to `{code, message}` entries in batch error files.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    InvalidRequest { code: &'static str, message: String },

    #[error("{0}")]
    Authentication(String),

    #[error("{message}")]
    Authorization { code: &'static str, message: String },

    #[error("tenant budget exceeded")]
    BudgetExceeded,

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{message}")]
    Provider { status: u16, message: String },

    /// Expired API key or suspended tenant discovered mid-batch.
    #[error("{0}")]
    Context(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidRequest { code, message: message.into() }
    }

    pub fn status(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest { .. } => 400,
            GatewayError::Authentication(_) => 401,
            GatewayError::Authorization { .. } | GatewayError::BudgetExceeded => 403,
            GatewayError::RateLimited(_) => 429,
            GatewayError::ServiceUnavailable(_) => 503,
            GatewayError::Provider { status, .. } => *status,
            GatewayError::Context(_) => 403,
            GatewayError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            GatewayError::InvalidRequest { code, .. } => Some(code),
            GatewayError::Authentication(_) => Some("invalid_api_key"),
            GatewayError::Authorization { code, .. } => Some(code),
            GatewayError::BudgetExceeded => Some("budget_exceeded"),
            GatewayError::RateLimited(_) => Some("rate_limit_exceeded"),
            GatewayError::ServiceUnavailable(_) => Some("no_available_route"),
            GatewayError::Context(_) => Some("context_error"),
            GatewayError::Provider { .. } | GatewayError::Internal(_) => None,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. } => "invalid_request_error",
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::Authorization { .. } | GatewayError::BudgetExceeded => "permission_error",
            GatewayError::RateLimited(_) => "rate_limit_error",
            GatewayError::ServiceUnavailable(_) => "service_unavailable",
            GatewayError::Provider { status, .. } => error_type_for_status(*status),
            GatewayError::Context(_) => "permission_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Wire body for non-stream responses and in-stream `event: error` payloads.
    pub fn wire_body(&self) -> ErrorBody {
        ErrorBody::new(self.error_type(), self.code(), self.to_string())
    }
}

/// Status-to-type mapping used for errors surfaced through batch output files.
pub fn error_type_for_status(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        403 => "permission_error",
        429 => "rate_limit_error",
        503 => "service_unavailable",
        _ => "provider_error",
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidRequest { code, message } => {
                ApiError::InvalidRequest { code, message }
            }
            GatewayError::Authentication(message) => ApiError::Authentication { message },
            GatewayError::Authorization { code, message } => ApiError::Permission { code, message },
            GatewayError::BudgetExceeded => ApiError::Permission {
                code: "budget_exceeded",
                message: "tenant budget exceeded".into(),
            },
            GatewayError::RateLimited(message) => ApiError::RateLimited { message },
            GatewayError::ServiceUnavailable(message) => ApiError::ServiceUnavailable { message },
            GatewayError::Provider { status, message } => ApiError::Provider { status, message },
            GatewayError::Context(message) => {
                ApiError::Permission { code: "context_error", message }
            }
            GatewayError::Internal(err) => ApiError::Internal { message: err.to_string() },
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
