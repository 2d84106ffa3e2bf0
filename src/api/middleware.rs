/// Operator authentication and request metrics
use crate::{context::AppContext, error::HubError, metrics};
use axum::{
    async_trait,
    extract::{FromRequestParts, MatchedPath, Request},
    http::{request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Authenticated operator; the id is recorded as verifier on moderation
#[derive(Debug, Clone)]
pub struct Operator {
    pub id: String,
}

#[async_trait]
impl FromRequestParts<AppContext> for Operator {
    type Rejection = HubError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers)
            .ok_or_else(|| HubError::Unauthorized("Missing authorization header".to_string()))?;

        let operator = state
            .config
            .operator_for_token(&token)
            .ok_or_else(|| HubError::Unauthorized("Invalid operator token".to_string()))?;

        Ok(Operator {
            id: operator.id.clone(),
        })
    }
}

/// Record request counts and latency per matched route
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}
