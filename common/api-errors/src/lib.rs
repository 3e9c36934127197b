use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Wire error envelope: `{"error":{"message":"…","type":"…","code":"…"}}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn new(kind: &str, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.to_string(),
                code: code.map(|c| c.to_string()),
            },
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest { code: &'static str, message: String },
    Authentication { message: String },
    Permission { code: &'static str, message: String },
    NotFound { code: &'static str, message: String },
    RateLimited { message: String },
    ServiceUnavailable { message: String },
    Provider { status: u16, message: String },
    Internal { message: String },
}

impl ApiError {
    pub fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidRequest { code, message: message.into() }
    }

    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal { message: e.to_string() }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Permission { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Provider { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            ApiError::InvalidRequest { code, message } => {
                ErrorBody::new("invalid_request_error", Some(code), message.clone())
            }
            ApiError::Authentication { message } => {
                ErrorBody::new("authentication_error", Some("invalid_api_key"), message.clone())
            }
            ApiError::Permission { code, message } => {
                ErrorBody::new("permission_error", Some(code), message.clone())
            }
            ApiError::NotFound { code, message } => {
                ErrorBody::new("invalid_request_error", Some(code), message.clone())
            }
            ApiError::RateLimited { message } => {
                ErrorBody::new("rate_limit_error", Some("rate_limit_exceeded"), message.clone())
            }
            ApiError::ServiceUnavailable { message } => {
                ErrorBody::new("service_unavailable", Some("no_available_route"), message.clone())
            }
            ApiError::Provider { message, .. } => {
                ErrorBody::new("provider_error", None, message.clone())
            }
            ApiError::Internal { message } => {
                ErrorBody::new("internal_error", None, message.clone())
            }
        }
    }

    fn header_code(&self) -> &str {
        match self {
            ApiError::InvalidRequest { code, .. } => code,
            ApiError::Authentication { .. } => "invalid_api_key",
            ApiError::Permission { code, .. } => code,
            ApiError::NotFound { code, .. } => code,
            ApiError::RateLimited { .. } => "rate_limit_exceeded",
            ApiError::ServiceUnavailable { .. } => "no_available_route",
            ApiError::Provider { .. } => "provider_error",
            ApiError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.header_code().to_string();
        let mut resp = (status, Json(self.body())).into_response();
        if let Ok(val) = HeaderValue::from_str(&code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_shape_matches_wire_contract() {
        let body = ApiError::Permission {
            code: "budget_exceeded",
            message: "tenant budget exceeded".into(),
        }
        .body();
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(
            json,
            r#"{"error":{"message":"tenant budget exceeded","type":"permission_error","code":"budget_exceeded"}}"#
        );
    }

    #[test]
    fn provider_status_is_passed_through() {
        let err = ApiError::Provider { status: 502, message: "upstream".into() };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        let err = ApiError::Provider { status: 9999, message: "bad".into() };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn code_omitted_when_absent() {
        let json = serde_json::to_string(&ApiError::internal("boom").body()).unwrap();
        assert!(!json.contains("\"code\""));
    }
}
