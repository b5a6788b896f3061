//! Bearer token authentication.
//!
//! Tokens come from a CSV file of `token,user,uid` lines.  A request must
//! carry `Authorization: Bearer <token>` naming one of them; the matching
//! user is attached to the request for handlers to read.

use std::fmt;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::api::UserInfo;
use crate::errors::ApiError;

/// A malformed token file line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct TokenParseError {
    /// 1-based line number.
    pub line: usize,
    pub reason: String,
}

struct TokenEntry {
    token: String,
    user: UserInfo,
}

/// The table of accepted bearer tokens.
pub struct TokenAuthenticator {
    entries: Vec<TokenEntry>,
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("tokens", &self.entries.len())
            .finish()
    }
}

impl TokenAuthenticator {
    /// Parse `token,user[,uid]` lines.  Blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self, TokenParseError> {
        let mut entries = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 2 {
                return Err(TokenParseError {
                    line: i + 1,
                    reason: format!("expected at least 2 fields, found {}", fields.len()),
                });
            }
            if fields[0].is_empty() {
                return Err(TokenParseError {
                    line: i + 1,
                    reason: "empty token".to_string(),
                });
            }
            entries.push(TokenEntry {
                token: fields[0].to_string(),
                user: UserInfo {
                    name: fields[1].to_string(),
                    uid: fields.get(2).map(|s| s.to_string()).unwrap_or_default(),
                },
            });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The user owning `token`, if any.
    ///
    /// Every entry is compared so the time taken does not depend on which
    /// entry matched.
    pub fn authenticate(&self, token: &str) -> Option<&UserInfo> {
        let mut found = None;
        for entry in &self.entries {
            if constant_time_eq(&entry.token, token) && found.is_none() {
                found = Some(&entry.user);
            }
        }
        found
    }
}

/// Compare two tokens in constant time.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Middleware rejecting requests without a known bearer token.
///
/// On success the [`UserInfo`] is inserted into the request extensions.
pub async fn authenticate(
    State(tokens): State<Arc<TokenAuthenticator>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = match bearer_token(req.headers()) {
        Some(token) => tokens.authenticate(token).cloned(),
        None => None,
    };
    match user {
        Some(user) => {
            req.extensions_mut().insert(user);
            Ok(next.run(req).await)
        }
        None => {
            debug!("rejecting unauthenticated {} {}", req.method(), req.uri().path());
            Err(ApiError::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_parse_and_authenticate() {
        let auth = TokenAuthenticator::parse("abc,alice,1\n\n def , bob \n").unwrap();
        assert_eq!(auth.len(), 2);
        let alice = auth.authenticate("abc").unwrap();
        assert_eq!(alice.name, "alice");
        assert_eq!(alice.uid, "1");
        let bob = auth.authenticate("def").unwrap();
        assert_eq!(bob.name, "bob");
        assert_eq!(bob.uid, "");
        assert!(auth.authenticate("ab").is_none());
        assert!(auth.authenticate("").is_none());
    }

    #[test]
    fn test_parse_rejects_short_line() {
        let err = TokenAuthenticator::parse("abc,alice,1\njunk\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_parse_rejects_empty_token() {
        assert!(TokenAuthenticator::parse(",alice,1").is_err());
    }

    #[test]
    fn test_debug_hides_tokens() {
        let auth = TokenAuthenticator::parse("secret-token,alice,1").unwrap();
        assert!(!format!("{auth:?}").contains("secret-token"));
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer"));
        assert_eq!(bearer_token(&headers), None);
    }
}
