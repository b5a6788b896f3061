//! Endpoints sub-resource handlers.  Endpoints exist for every service and
//! are replaced wholesale; they are never created or deleted directly.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    response::{IntoResponse, Response},
    Extension, Json,
};

use super::{bind_name, json_body, validate, versioned, RequestContext, SelectorParams};
use crate::api::{ApiVersion, Endpoints, Kind, Object};
use crate::errors::ApiError;
use crate::AppState;

pub async fn list_endpoints(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    RequestContext(ctx): RequestContext,
    Query(params): Query<SelectorParams>,
) -> Result<Response, ApiError> {
    let label = params.label_selector()?;
    let field = params.field_selector()?;
    let mut list = state.services.list_endpoints(&ctx).await?;
    list.items
        .retain(|e| label.matches(&e.metadata.labels) && field.matches(&e.fields()));
    Ok(versioned(version, list).into_response())
}

pub async fn get_endpoints(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    RequestContext(ctx): RequestContext,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let e = state.services.get_endpoints(&ctx, &name).await?;
    Ok(versioned(version, e).into_response())
}

pub async fn update_endpoints(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    RequestContext(ctx): RequestContext,
    Path(name): Path<String>,
    payload: Result<Json<Endpoints>, JsonRejection>,
) -> Result<Response, ApiError> {
    let mut e = json_body(payload)?;
    bind_name(&mut e.metadata, &name)?;
    validate(Endpoints::KIND, &e.metadata, &e)?;
    let updated = state.services.update_endpoints(&ctx, e).await?;
    Ok(versioned(version, updated).into_response())
}
