//! Resource registries.
//!
//! A registry is the contract between the HTTP layer and storage for one
//! resource kind.  [`ServiceRegistry`] covers services and their endpoints
//! sub-resource; [`kv::KvServiceRegistry`] implements it on a
//! [`KvStore`](crate::storage::backend::KvStore) and
//! [`recording::RecordingServiceRegistry`] is an in-memory double that
//! records its calls.  [`minion::MinionRegistry`] exposes node membership.

pub mod kv;
pub mod minion;
pub mod recording;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::api::{Context, Endpoints, EndpointsList, Service, ServiceList};
use crate::labels::Selector;
use crate::watch::WatchStream;

/// The single error type every registry call can return.
///
/// `Clone` and `PartialEq` so a double can hand back one injected error from
/// every method and tests can compare it exactly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} {name:?} cannot be updated: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    #[error("{kind} {name:?} is invalid: {message}")]
    Invalid {
        kind: String,
        name: String,
        message: String,
    },

    #[error("too old resource version: {message}")]
    Expired { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RegistryError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        RegistryError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RegistryError::Internal {
            message: message.into(),
        }
    }
}

pub type RegistryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RegistryError>> + Send + 'a>>;

/// Storage contract for services and their endpoints.
///
/// Every call is scoped to the namespace in `ctx`.  `update_*` is keyed by
/// the name carried in the object and fails with `NotFound` when no such
/// object exists.  Watches apply both selectors before emitting and resume
/// after `resource_version` when one is given.
pub trait ServiceRegistry: Send + Sync + 'static {
    fn list_services<'a>(&'a self, ctx: &'a Context) -> RegistryFuture<'a, ServiceList>;

    fn get_service<'a>(&'a self, ctx: &'a Context, name: &'a str) -> RegistryFuture<'a, Service>;

    /// Store a new service and return it as stored.
    fn create_service<'a>(&'a self, ctx: &'a Context, service: Service)
        -> RegistryFuture<'a, Service>;

    /// Replace an existing service and return it as stored.
    fn update_service<'a>(&'a self, ctx: &'a Context, service: Service)
        -> RegistryFuture<'a, Service>;

    fn delete_service<'a>(&'a self, ctx: &'a Context, name: &'a str) -> RegistryFuture<'a, ()>;

    fn watch_services<'a>(
        &'a self,
        ctx: &'a Context,
        label: Selector,
        field: Selector,
        resource_version: Option<u64>,
    ) -> RegistryFuture<'a, WatchStream<Service>>;

    fn list_endpoints<'a>(&'a self, ctx: &'a Context) -> RegistryFuture<'a, EndpointsList>;

    fn get_endpoints<'a>(&'a self, ctx: &'a Context, name: &'a str)
        -> RegistryFuture<'a, Endpoints>;

    fn update_endpoints<'a>(
        &'a self,
        ctx: &'a Context,
        endpoints: Endpoints,
    ) -> RegistryFuture<'a, Endpoints>;

    fn watch_endpoints<'a>(
        &'a self,
        ctx: &'a Context,
        label: Selector,
        field: Selector,
        resource_version: Option<u64>,
    ) -> RegistryFuture<'a, WatchStream<Endpoints>>;
}
