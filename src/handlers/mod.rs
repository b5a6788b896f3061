//! HTTP handlers for the versioned API and the support endpoints.
//!
//! Each API version gets its own router carrying an
//! `Extension(ApiVersion)`; handlers stamp responses with that version.
//! The request namespace comes from the `namespace` query parameter and the
//! authenticated user, if any, from the request extensions.

pub mod endpoints;
pub mod minion;
pub mod service;
pub mod support;
pub mod watch;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Query},
    http::request::Parts,
    Json,
};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::api::{ApiVersion, Context, Kind, ObjectMeta, UserInfo, Versioned, DEFAULT_NAMESPACE};
use crate::errors::ApiError;
use crate::labels::Selector;
use crate::registry::RegistryError;

#[derive(Debug, Default, Deserialize)]
struct ScopeQuery {
    #[serde(default)]
    namespace: String,
}

/// The registry [`Context`] for a request.
#[derive(Debug, Clone)]
pub struct RequestContext(pub Context);

fn is_valid_namespace(ns: &str) -> bool {
    !ns.is_empty()
        && ns.len() <= 63
        && ns
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !ns.starts_with('-')
        && !ns.ends_with('-')
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<ScopeQuery>::try_from_uri(&parts.uri)
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        let namespace = match query.namespace.trim() {
            "" => DEFAULT_NAMESPACE,
            ns if is_valid_namespace(ns) => ns,
            ns => return Err(ApiError::bad_request(format!("invalid namespace {ns:?}"))),
        };
        let mut ctx = Context::new(namespace);
        if let Some(user) = parts.extensions.get::<UserInfo>() {
            ctx = ctx.with_user(user.clone());
        }
        Ok(RequestContext(ctx))
    }
}

/// Wrap `object` in its `kind`/`apiVersion` envelope.
pub fn versioned<T: Kind + Serialize>(version: ApiVersion, object: T) -> Json<Versioned<T>> {
    Json(Versioned::new(version, object))
}

/// Unwrap a JSON body, turning a malformed one into a 400.
pub fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

/// Run `garde` validation, reporting failures as `Invalid`.
pub fn validate<T>(kind: &str, meta: &ObjectMeta, object: &T) -> Result<(), ApiError>
where
    T: Validate,
    T::Context: Default,
{
    object.validate().map_err(|report| {
        ApiError::from(RegistryError::Invalid {
            kind: kind.to_string(),
            name: meta.name.clone(),
            message: report.to_string(),
        })
    })
}

/// Bind the object named in a URL to the object in the body.  A body with
/// no name takes the path's name; a different name is rejected.
pub fn bind_name(meta: &mut ObjectMeta, path_name: &str) -> Result<(), ApiError> {
    if meta.name.is_empty() {
        meta.name = path_name.to_string();
    }
    if meta.name != path_name {
        return Err(ApiError::bad_request(format!(
            "name {:?} in body does not match {:?} in path",
            meta.name, path_name
        )));
    }
    Ok(())
}

/// Selector and cursor query parameters.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorParams {
    #[serde(default)]
    pub labels: String,
    #[serde(default)]
    pub fields: String,
    #[serde(default)]
    pub resource_version: String,
}

impl SelectorParams {
    pub fn label_selector(&self) -> Result<Selector, ApiError> {
        Selector::parse(&self.labels)
            .map_err(|e| ApiError::bad_request(format!("invalid label selector: {e}")))
    }

    pub fn field_selector(&self) -> Result<Selector, ApiError> {
        Selector::parse(&self.fields)
            .map_err(|e| ApiError::bad_request(format!("invalid field selector: {e}")))
    }

    /// `None` when absent or zero, meaning "from now".
    pub fn resource_version(&self) -> Result<Option<u64>, ApiError> {
        match self.resource_version.trim() {
            "" => Ok(None),
            v => v
                .parse::<u64>()
                .map(|rv| (rv > 0).then_some(rv))
                .map_err(|_| ApiError::bad_request(format!("invalid resourceVersion {v:?}"))),
        }
    }
}

/// Body returned by successful deletes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Success {
    kind: &'static str,
    api_version: &'static str,
    status: &'static str,
    code: u16,
}

pub fn success(version: ApiVersion) -> Json<Success> {
    Json(Success {
        kind: "Status",
        api_version: version.as_str(),
        status: "Success",
        code: 200,
    })
}
