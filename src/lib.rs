//! Cluster control-plane API server.
//!
//! This crate provides the core of the API server: configuration
//! resolution, the resource registry contract and its key-value backed
//! implementation, pluggable cloud providers for node discovery, the HTTP
//! middleware chain, and server bootstrap.

use std::sync::Arc;

pub mod api;
pub mod auth;
pub mod cloudprovider;
pub mod config;
pub mod cors;
pub mod errors;
pub mod handlers;
pub mod labels;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod storage;
pub mod watch;

use crate::config::Config;
use crate::registry::minion::MinionRegistry;
use crate::registry::ServiceRegistry;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Resolved configuration.
    pub config: Arc<Config>,
    /// Services and their endpoints.
    pub services: Arc<dyn ServiceRegistry>,
    /// Node membership.
    pub minions: Arc<dyn MinionRegistry>,
}
