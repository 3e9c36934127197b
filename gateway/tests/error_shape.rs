use axum::body::to_bytes;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use common_api_errors::ApiError;
use model_gateway::error::GatewayError;

async fn body_of(err: GatewayError) -> (StatusCode, String) {
    let resp = ApiError::from(err).into_response();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), 4096).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn budget_exceeded_shape() {
    let (status, body) = body_of(GatewayError::BudgetExceeded).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body,
        r#"{"error":{"message":"tenant budget exceeded","type":"permission_error","code":"budget_exceeded"}}"#
    );
}

#[tokio::test]
async fn rate_limit_shape() {
    let (status, body) = body_of(GatewayError::RateLimited("request rate limit of 1 per minute exceeded".into())).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body.contains("\"type\":\"rate_limit_error\""));
    assert!(body.contains("\"code\":\"rate_limit_exceeded\""));
}

#[tokio::test]
async fn authentication_shape() {
    let (status, body) = body_of(GatewayError::Authentication("unknown API key".into())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("\"type\":\"authentication_error\""));
    assert!(body.contains("\"code\":\"invalid_api_key\""));
}

#[tokio::test]
async fn guardrail_violation_shape() {
    let (status, body) = body_of(GatewayError::Authorization {
        code: "guardrail_violation",
        message: "content blocked by guardrail policy".into(),
    })
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("\"type\":\"permission_error\""));
    assert!(body.contains("\"code\":\"guardrail_violation\""));
}

#[tokio::test]
async fn no_route_shape() {
    let (status, body) =
        body_of(GatewayError::ServiceUnavailable("no route available for model x".into())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("\"type\":\"service_unavailable\""));
}

#[tokio::test]
async fn provider_status_passthrough() {
    let (status, body) =
        body_of(GatewayError::Provider { status: 502, message: "all routes failed".into() }).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("\"type\":\"provider_error\""));
    // Provider errors carry no machine code, only the message.
    assert!(!body.contains("\"code\""));
}

#[tokio::test]
async fn header_code_matches_body() {
    let resp = ApiError::from(GatewayError::BudgetExceeded).into_response();
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "budget_exceeded");
}
