//! Cross-origin request policy.
//!
//! A request whose `Origin` matches one of the allowed patterns gets the
//! CORS response headers; a matching `OPTIONS` preflight is answered here
//! with 204 and never reaches routing.  Patterns are unanchored regular
//! expressions.  Requests from other origins pass through untouched.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use regex::Regex;

const ALLOW_METHODS: &str = "POST, GET, OPTIONS, PUT, DELETE";
const ALLOW_HEADERS: &str =
    "Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization";

#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_origins: Vec<Regex>,
}

impl CorsPolicy {
    pub fn new(allowed_origins: Vec<Regex>) -> Self {
        Self { allowed_origins }
    }

    pub fn allows(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|re| re.is_match(origin))
    }

    fn apply(&self, origin: HeaderValue, headers: &mut HeaderMap) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

/// Middleware applying a [`CorsPolicy`].
pub async fn cors(State(policy): State<Arc<CorsPolicy>>, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .filter(|v| v.to_str().map(|o| policy.allows(o)).unwrap_or(false))
        .cloned();
    let Some(origin) = origin else {
        return next.run(req).await;
    };

    if req.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        policy.apply(origin, response.headers_mut());
        return response;
    }

    let mut response = next.run(req).await;
    policy.apply(origin, response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(patterns: &[&str]) -> CorsPolicy {
        CorsPolicy::new(patterns.iter().map(|p| Regex::new(p).unwrap()).collect())
    }

    #[test]
    fn test_patterns_are_unanchored() {
        let p = policy(&["example\\.com"]);
        assert!(p.allows("https://example.com"));
        assert!(p.allows("https://ui.example.com:8443"));
        assert!(!p.allows("https://example.org"));
    }

    #[test]
    fn test_empty_policy_allows_nothing() {
        assert!(!policy(&[]).allows("https://example.com"));
    }

    #[test]
    fn test_apply_sets_headers() {
        let mut headers = HeaderMap::new();
        policy(&[".*"]).apply(HeaderValue::from_static("https://a.test"), &mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://a.test");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOW_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], ALLOW_HEADERS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }
}
