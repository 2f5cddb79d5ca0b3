//! Bearer token authentication middleware

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use super::ApiState;

/// Extract the bearer token from the Authorization header
fn extract_bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Middleware gating API and stream routes behind `HEARTH_API_KEY`
pub async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // No key configured means an open controller on a trusted network
    let Some(expected) = &state.api_key else {
        return Ok(next.run(req).await);
    };

    match extract_bearer(&req) {
        Some(token) if token == expected => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::debug!("no API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_token_is_extracted_from_the_header() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(extract_bearer(&req), None);

        req.headers_mut().insert(
            "authorization",
            HeaderValue::from_static("Bearer test-key-123"),
        );
        assert_eq!(extract_bearer(&req), Some("test-key-123"));
    }
}
