use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::{EndpointClass, RateLimitDecision, RateLimiter};

/// Header carrying the caller's user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// State for [`rate_limit_middleware`]: the shared limiter and the class of the guarded routes
#[derive(Clone)]
pub struct RateLimitLayerState {
    pub limiter: Arc<RateLimiter>,
    pub class: EndpointClass,
}

impl RateLimitLayerState {
    pub fn new(limiter: Arc<RateLimiter>, class: EndpointClass) -> Self {
        Self { limiter, class }
    }
}

/// Rate limiting middleware for Axum
pub async fn rate_limit_middleware(
    State(state): State<RateLimitLayerState>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let identifier = client_identifier(request.headers());

    match state.limiter.check_limit(&identifier, state.class) {
        RateLimitDecision::Allow(headers) => {
            debug!(
                identifier = %identifier,
                class = %state.class,
                remaining = headers.remaining,
                "Rate limit check passed"
            );
            let mut response = next.run(request).await;
            response.headers_mut().extend(headers.to_header_map());
            Ok(response)
        }
        RateLimitDecision::Deny(headers) => Err(Error::new(ErrorDetails::RateLimitExceeded {
            identifier,
            class: state.class,
            headers,
        })),
    }
}

/// Identify the caller: explicit user id, else the first forwarded hop, else `anonymous`
pub fn client_identifier(headers: &HeaderMap) -> String {
    if let Some(user_id) = header_value(headers, USER_ID_HEADER) {
        return user_id.to_string();
    }
    if let Some(hop) = header_value(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return hop.to_string();
    }
    "anonymous".to_string()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderValue, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use chrono::{TimeZone, Utc};

    use crate::clock::Clock;
    use crate::rate_limit::{EndpointLimit, RateLimitConfig};

    #[test]
    fn test_identifier_prefers_user_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("user-42"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.1, 10.0.0.2"),
        );
        assert_eq!(client_identifier(&headers), "user-42");
    }

    #[test]
    fn test_identifier_falls_back_to_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 10.0.0.1 , 10.0.0.2"),
        );
        assert_eq!(client_identifier(&headers), "10.0.0.1");
    }

    #[test]
    fn test_identifier_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("   "));
        assert_eq!(client_identifier(&headers), "anonymous");
    }

    async fn send(router: &Router, user: &str) -> Response {
        use tower::ServiceExt;
        router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header("x-user-id", user)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_middleware_rejects_with_headers() {
        let clock = Clock::manual(Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap());
        let config = RateLimitConfig {
            auth: EndpointLimit::new(10, 300_000, 2),
            ..Default::default()
        };
        let limiter = Arc::new(RateLimiter::new(Arc::new(config), clock));
        let router = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn_with_state(
                RateLimitLayerState::new(limiter, EndpointClass::Auth),
                rate_limit_middleware,
            ));

        let first = send(&router, "alice").await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-remaining"], "9");
        assert_eq!(send(&router, "alice").await.status(), StatusCode::OK);

        let rejected = send(&router, "alice").await;
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejected.headers()["retry-after"], "5");
        assert_eq!(rejected.headers()["x-ratelimit-limit"], "10");

        assert_eq!(send(&router, "bob").await.status(), StatusCode::OK);
    }
}
