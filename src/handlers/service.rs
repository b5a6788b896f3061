//! Service handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use tracing::info;

use super::{bind_name, json_body, success, validate, versioned, RequestContext, SelectorParams};
use crate::api::{ApiVersion, Kind, Object, Service};
use crate::errors::ApiError;
use crate::AppState;

/// `GET /services` -- optionally filtered by the `labels` and `fields`
/// selectors.
pub async fn list_services(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    RequestContext(ctx): RequestContext,
    Query(params): Query<SelectorParams>,
) -> Result<Response, ApiError> {
    let label = params.label_selector()?;
    let field = params.field_selector()?;
    let mut list = state.services.list_services(&ctx).await?;
    list.items
        .retain(|svc| label.matches(&svc.metadata.labels) && field.matches(&svc.fields()));
    Ok(versioned(version, list).into_response())
}

/// `GET /services/:name`
pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    RequestContext(ctx): RequestContext,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let svc = state.services.get_service(&ctx, &name).await?;
    Ok(versioned(version, svc).into_response())
}

/// `POST /services`
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    RequestContext(ctx): RequestContext,
    payload: Result<Json<Service>, JsonRejection>,
) -> Result<Response, ApiError> {
    let svc = json_body(payload)?;
    validate(Service::KIND, &svc.metadata, &svc)?;
    let created = state.services.create_service(&ctx, svc).await?;
    info!(
        "created service {}/{}",
        ctx.namespace(),
        created.metadata.name
    );
    Ok((StatusCode::CREATED, versioned(version, created)).into_response())
}

/// `PUT /services/:name`
pub async fn update_service(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    RequestContext(ctx): RequestContext,
    Path(name): Path<String>,
    payload: Result<Json<Service>, JsonRejection>,
) -> Result<Response, ApiError> {
    let mut svc = json_body(payload)?;
    bind_name(&mut svc.metadata, &name)?;
    validate(Service::KIND, &svc.metadata, &svc)?;
    let updated = state.services.update_service(&ctx, svc).await?;
    Ok(versioned(version, updated).into_response())
}

/// `DELETE /services/:name`
pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    RequestContext(ctx): RequestContext,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.services.delete_service(&ctx, &name).await?;
    info!("deleted service {}/{}", ctx.namespace(), name);
    Ok(success(version).into_response())
}
