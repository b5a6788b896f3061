//! Pluggable cloud providers.
//!
//! A provider is looked up by name in a fixed table of factories.  Each
//! factory receives the contents of the provider config file, if one was
//! given.  Providers expose optional capabilities; node discovery is the
//! [`Instances`] capability.

pub mod inventory;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::info;

use crate::config::{CloudSettings, ConfigError};

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("invalid provider configuration: {0}")]
    Config(String),

    #[error("provider request failed: {0}")]
    Unavailable(String),
}

pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CloudError>> + Send + 'a>>;

/// Node discovery and health.
pub trait Instances: Send + Sync {
    /// Names of the instances whose name matches `filter`, sorted.
    fn list<'a>(&'a self, filter: &'a Regex) -> CloudFuture<'a, Vec<String>>;

    /// Whether `name` is a running, healthy instance.
    fn exists<'a>(&'a self, name: &'a str) -> CloudFuture<'a, bool>;
}

/// A hosting environment the server can ask about its nodes.
pub trait CloudProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// The instance capability, if this provider supports it.
    fn instances(&self) -> Option<&dyn Instances>;
}

type Factory = fn(Option<&str>) -> Result<Arc<dyn CloudProvider>, CloudError>;

const PROVIDERS: &[(&str, Factory)] = &[(inventory::PROVIDER_NAME, inventory::factory)];

/// Names of every registered provider.
pub fn provider_names() -> Vec<&'static str> {
    PROVIDERS.iter().map(|(name, _)| *name).collect()
}

/// Build the provider registered as `name`.  Returns `Ok(None)` for an
/// unregistered name.
pub fn get_cloud_provider(
    name: &str,
    config: Option<&str>,
) -> Result<Option<Arc<dyn CloudProvider>>, CloudError> {
    match PROVIDERS.iter().find(|(n, _)| *n == name) {
        Some((_, factory)) => factory(config).map(Some),
        None => Ok(None),
    }
}

/// Resolve the configured provider, if any.  An unregistered name or a
/// provider that rejects its config is a fatal configuration error.
pub fn init_cloud_provider(
    settings: Option<&CloudSettings>,
) -> Result<Option<Arc<dyn CloudProvider>>, ConfigError> {
    let Some(settings) = settings else {
        info!("No cloud provider specified.");
        return Ok(None);
    };
    let provider = get_cloud_provider(&settings.provider, settings.config.as_deref())
        .map_err(|e| ConfigError::CloudConfigInvalid {
            provider: settings.provider.clone(),
            message: e.to_string(),
        })?
        .ok_or_else(|| ConfigError::UnknownCloudProvider(settings.provider.clone()))?;
    info!("Using cloud provider {}", provider.name());
    Ok(Some(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_is_none() {
        assert!(get_cloud_provider("nimbus", None).unwrap().is_none());
    }

    #[test]
    fn test_static_is_registered() {
        assert!(provider_names().contains(&"static"));
        let provider = get_cloud_provider("static", Some("instances: []"))
            .unwrap()
            .unwrap();
        assert_eq!(provider.name(), "static");
        assert!(provider.instances().is_some());
    }

    #[test]
    fn test_init_without_settings() {
        assert!(init_cloud_provider(None).unwrap().is_none());
    }

    #[test]
    fn test_init_unknown_name_is_fatal() {
        let settings = CloudSettings {
            provider: "nimbus".into(),
            config: None,
        };
        let err = init_cloud_provider(Some(&settings)).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownCloudProvider(name) if name == "nimbus"));
    }

    #[test]
    fn test_init_bad_config_is_fatal() {
        let settings = CloudSettings {
            provider: "static".into(),
            config: Some("instances: 12".into()),
        };
        let err = init_cloud_provider(Some(&settings)).err().unwrap();
        assert!(matches!(err, ConfigError::CloudConfigInvalid { .. }));
    }
}
