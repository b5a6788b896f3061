//! Node (minion) membership.
//!
//! Membership is either a fixed machine list or whatever the cloud provider
//! reports for the node pattern.  Cloud membership can be narrowed to
//! healthy instances and is cached for a fixed time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{RegistryError, RegistryFuture};
use crate::cloudprovider::CloudProvider;
use crate::config::NodeSettings;

/// Read-only view of the current node set.
pub trait MinionRegistry: Send + Sync + 'static {
    /// Every node name, sorted.
    fn list(&self) -> RegistryFuture<'_, Vec<String>>;

    fn contains<'a>(&'a self, name: &'a str) -> RegistryFuture<'a, bool> {
        Box::pin(async move { Ok(self.list().await?.iter().any(|n| n == name)) })
    }
}

/// A fixed machine list.
pub struct StaticMinions {
    machines: Vec<String>,
}

impl StaticMinions {
    pub fn new(mut machines: Vec<String>) -> Self {
        machines.sort();
        machines.dedup();
        Self { machines }
    }
}

impl MinionRegistry for StaticMinions {
    fn list(&self) -> RegistryFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.machines.clone()) })
    }
}

fn cloud_error(cloud: &dyn CloudProvider, err: impl std::fmt::Display) -> RegistryError {
    RegistryError::internal(format!("cloud provider {}: {err}", cloud.name()))
}

/// Instances reported by a cloud provider whose names match a pattern.
pub struct CloudMinions {
    cloud: Arc<dyn CloudProvider>,
    pattern: Regex,
}

impl CloudMinions {
    pub fn new(cloud: Arc<dyn CloudProvider>, pattern: Regex) -> Self {
        Self { cloud, pattern }
    }
}

impl MinionRegistry for CloudMinions {
    fn list(&self) -> RegistryFuture<'_, Vec<String>> {
        Box::pin(async move {
            let instances = self.cloud.instances().ok_or_else(|| {
                cloud_error(self.cloud.as_ref(), "does not support instance listing")
            })?;
            instances
                .list(&self.pattern)
                .await
                .map_err(|e| cloud_error(self.cloud.as_ref(), e))
        })
    }
}

/// Drops nodes the cloud provider does not report as healthy.
pub struct HealthyMinions {
    inner: Arc<dyn MinionRegistry>,
    cloud: Arc<dyn CloudProvider>,
}

impl HealthyMinions {
    pub fn new(inner: Arc<dyn MinionRegistry>, cloud: Arc<dyn CloudProvider>) -> Self {
        Self { inner, cloud }
    }
}

impl MinionRegistry for HealthyMinions {
    fn list(&self) -> RegistryFuture<'_, Vec<String>> {
        Box::pin(async move {
            let names = self.inner.list().await?;
            let Some(instances) = self.cloud.instances() else {
                return Ok(names);
            };
            let mut healthy = Vec::with_capacity(names.len());
            for name in names {
                match instances.exists(&name).await {
                    Ok(true) => healthy.push(name),
                    Ok(false) => debug!("dropping unhealthy minion {}", name),
                    Err(e) => debug!("health check for {} failed: {}", name, e),
                }
            }
            Ok(healthy)
        })
    }
}

/// Serves the inner registry's last answer for up to `ttl`.
pub struct CachingMinions {
    inner: Arc<dyn MinionRegistry>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Vec<String>)>>,
}

impl CachingMinions {
    pub fn new(inner: Arc<dyn MinionRegistry>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: Mutex::new(None),
        }
    }
}

impl MinionRegistry for CachingMinions {
    fn list(&self) -> RegistryFuture<'_, Vec<String>> {
        Box::pin(async move {
            let mut cached = self.cached.lock().await;
            if let Some((at, names)) = cached.as_ref() {
                if at.elapsed() < self.ttl {
                    return Ok(names.clone());
                }
            }
            let names = self.inner.list().await?;
            *cached = Some((Instant::now(), names.clone()));
            Ok(names)
        })
    }
}

/// Assemble the node registry for the resolved node settings.
///
/// A cloud provider is consulted only when a node pattern is also set;
/// otherwise membership is the static machine list.
pub fn build(nodes: &NodeSettings, cloud: Option<Arc<dyn CloudProvider>>) -> Arc<dyn MinionRegistry> {
    let (cloud, pattern) = match (cloud, nodes.pattern.as_ref()) {
        (Some(cloud), Some(pattern)) => (cloud, pattern.clone()),
        _ => {
            if nodes.machines.is_empty() {
                info!("No machines specified!");
            }
            return Arc::new(StaticMinions::new(nodes.machines.clone()));
        }
    };
    if !nodes.machines.is_empty() {
        info!("machines list is overridden by node pattern");
    }

    let mut registry: Arc<dyn MinionRegistry> = Arc::new(CloudMinions::new(cloud.clone(), pattern));
    if nodes.health_check {
        registry = Arc::new(HealthyMinions::new(registry, cloud));
    }
    Arc::new(CachingMinions::new(registry, nodes.cache_ttl))
}
