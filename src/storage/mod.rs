//! Key-value storage backends.
//!
//! The [`backend::KvStore`] trait abstracts over the watchable key-value
//! store that holds every API object.  Implementations are an etcd v2
//! client and an in-process store used by tests.

pub mod backend;
pub mod etcd;
pub mod memory;

use std::sync::Arc;

use tracing::info;

use crate::config::StorageSource;
use backend::{KvError, KvStore};

/// Build the store named by the resolved storage source.
pub fn open(source: &StorageSource) -> Result<Arc<dyn KvStore>, KvError> {
    match source {
        StorageSource::Servers(servers) => {
            info!("Using etcd servers {}", servers.join(","));
            Ok(Arc::new(etcd::EtcdClient::new(servers.clone())?))
        }
        StorageSource::ConfigFile(path) => {
            let client = etcd::EtcdClient::from_config_file(path)?;
            info!(
                "Using etcd servers {} from {}",
                client.machines().join(","),
                path.display()
            );
            Ok(Arc::new(client))
        }
    }
}
