//! API error responses.
//!
//! Every failure leaving the server is rendered as a JSON `Status` object
//! carrying a machine-readable `reason` and the HTTP status `code`.
//! [`ApiError`] implements [`axum::response::IntoResponse`] so handlers and
//! middleware can return it directly.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::api::ApiVersion;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{message}")]
    BadRequest { message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("the server could not find the requested resource {path}")]
    RouteNotFound { path: String },

    #[error("request header fields too large")]
    HeaderTooLarge,

    #[error("internal error: {message}")]
    Panic { message: String },
}

/// The `details` member of a `Status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusDetails {
    pub kind: String,
    pub name: String,
}

/// Wire form of an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub kind: &'static str,
    pub api_version: &'static str,
    pub status: &'static str,
    pub message: String,
    pub reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
    pub code: u16,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            message: message.into(),
        }
    }

    /// Machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::Registry(e) => match e {
                RegistryError::NotFound { .. } => "NotFound",
                RegistryError::AlreadyExists { .. } => "AlreadyExists",
                RegistryError::Conflict { .. } => "Conflict",
                RegistryError::Invalid { .. } => "Invalid",
                RegistryError::Expired { .. } => "Expired",
                RegistryError::Internal { .. } => "InternalError",
            },
            ApiError::BadRequest { .. } => "BadRequest",
            ApiError::Unauthorized => "Unauthorized",
            ApiError::RouteNotFound { .. } => "NotFound",
            ApiError::HeaderTooLarge => "RequestHeaderFieldsTooLarge",
            ApiError::Panic { .. } => "InternalError",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Registry(e) => match e {
                RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
                RegistryError::AlreadyExists { .. } => StatusCode::CONFLICT,
                RegistryError::Conflict { .. } => StatusCode::CONFLICT,
                RegistryError::Invalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                RegistryError::Expired { .. } => StatusCode::GONE,
                RegistryError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::HeaderTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ApiError::Panic { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<StatusDetails> {
        match self {
            ApiError::Registry(
                RegistryError::NotFound { kind, name }
                | RegistryError::AlreadyExists { kind, name }
                | RegistryError::Conflict { kind, name, .. }
                | RegistryError::Invalid { kind, name, .. },
            ) => Some(StatusDetails {
                kind: kind.clone(),
                name: name.clone(),
            }),
            _ => None,
        }
    }

    pub fn to_status(&self) -> Status {
        Status {
            kind: "Status",
            api_version: ApiVersion::PREFERRED.as_str(),
            status: "Failure",
            message: self.to_string(),
            reason: self.reason(),
            details: self.details(),
            code: self.status_code().as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::to_string(&self.to_status()).unwrap_or_default();
        (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_mapping() {
        let cases = [
            (RegistryError::not_found("Service", "a"), 404, "NotFound"),
            (
                RegistryError::AlreadyExists {
                    kind: "Service".into(),
                    name: "a".into(),
                },
                409,
                "AlreadyExists",
            ),
            (
                RegistryError::Conflict {
                    kind: "Service".into(),
                    name: "a".into(),
                    message: "stale".into(),
                },
                409,
                "Conflict",
            ),
            (
                RegistryError::Invalid {
                    kind: "Service".into(),
                    name: "a".into(),
                    message: "bad port".into(),
                },
                422,
                "Invalid",
            ),
            (
                RegistryError::Expired {
                    message: "old".into(),
                },
                410,
                "Expired",
            ),
            (RegistryError::internal("boom"), 500, "InternalError"),
        ];
        for (err, code, reason) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status_code().as_u16(), code);
            assert_eq!(api.reason(), reason);
        }
    }

    #[test]
    fn test_status_body() {
        let status = ApiError::from(RegistryError::not_found("Service", "web")).to_status();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["kind"], "Status");
        assert_eq!(json["status"], "Failure");
        assert_eq!(json["code"], 404);
        assert_eq!(json["details"]["name"], "web");

        let json = serde_json::to_value(ApiError::Unauthorized.to_status()).unwrap();
        assert_eq!(json["code"], 401);
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_into_response() {
        let resp = ApiError::HeaderTooLarge.into_response();
        assert_eq!(resp.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
