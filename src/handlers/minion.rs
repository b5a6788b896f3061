//! Read-only minion handlers.  Every minion reports the configured node
//! capacity.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Extension,
};

use super::versioned;
use crate::api::{ApiVersion, Kind, ListMeta, Minion, MinionList, ObjectMeta};
use crate::errors::ApiError;
use crate::registry::RegistryError;
use crate::AppState;

fn minion(state: &AppState, name: String) -> Minion {
    Minion {
        metadata: ObjectMeta::named(name),
        resources: state.config.nodes.capacity,
    }
}

pub async fn list_minions(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
) -> Result<Response, ApiError> {
    let names = state.minions.list().await?;
    let list = MinionList {
        metadata: ListMeta::default(),
        items: names.into_iter().map(|n| minion(&state, n)).collect(),
    };
    Ok(versioned(version, list).into_response())
}

pub async fn get_minion(
    State(state): State<Arc<AppState>>,
    Extension(version): Extension<ApiVersion>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if !state.minions.contains(&name).await? {
        return Err(RegistryError::not_found(Minion::KIND, &name).into());
    }
    Ok(versioned(version, minion(&state, name)).into_response())
}
