//! Unversioned support endpoints.

use axum::{http::Uri, response::IntoResponse, Json};
use serde::Serialize;

use crate::api::ApiVersion;
use crate::errors::ApiError;

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    "ok"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub git_version: &'static str,
    pub package: &'static str,
}

/// `GET /version`
pub async fn version() -> Json<VersionInfo> {
    Json(VersionInfo {
        git_version: env!("CARGO_PKG_VERSION"),
        package: env!("CARGO_PKG_NAME"),
    })
}

#[derive(Debug, Serialize)]
pub struct ApiVersions {
    pub versions: Vec<&'static str>,
}

/// `GET {prefix}` -- the API versions served.
pub async fn api_versions() -> Json<ApiVersions> {
    Json(ApiVersions {
        versions: ApiVersion::ALL.iter().map(|v| v.as_str()).collect(),
    })
}

/// Fallback for every unrouted path.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::RouteNotFound {
        path: uri.path().to_string(),
    }
}
