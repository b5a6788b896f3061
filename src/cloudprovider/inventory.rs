//! The `static` provider: a fixed instance inventory read from YAML.
//!
//! ```yaml
//! instances:
//!   - name: node-1
//!   - name: node-2
//!     healthy: false
//! ```

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;

use super::{CloudError, CloudFuture, CloudProvider, Instances};

pub const PROVIDER_NAME: &str = "static";

#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub instances: Vec<Instance>,
}

pub struct StaticCloud {
    inventory: Inventory,
}

impl StaticCloud {
    pub fn new(inventory: Inventory) -> Self {
        Self { inventory }
    }

    pub fn parse(text: &str) -> Result<Self, CloudError> {
        let inventory: Inventory =
            serde_yaml::from_str(text).map_err(|e| CloudError::Config(e.to_string()))?;
        Ok(Self::new(inventory))
    }
}

pub(super) fn factory(config: Option<&str>) -> Result<Arc<dyn CloudProvider>, CloudError> {
    let cloud = match config {
        Some(text) => StaticCloud::parse(text)?,
        None => StaticCloud::new(Inventory::default()),
    };
    Ok(Arc::new(cloud))
}

impl CloudProvider for StaticCloud {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn instances(&self) -> Option<&dyn Instances> {
        Some(self)
    }
}

impl Instances for StaticCloud {
    fn list<'a>(&'a self, filter: &'a Regex) -> CloudFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut names: Vec<String> = self
                .inventory
                .instances
                .iter()
                .filter(|i| filter.is_match(&i.name))
                .map(|i| i.name.clone())
                .collect();
            names.sort();
            names.dedup();
            Ok(names)
        })
    }

    fn exists<'a>(&'a self, name: &'a str) -> CloudFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .inventory
                .instances
                .iter()
                .any(|i| i.name == name && i.healthy))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
instances:
  - name: node-b
  - name: node-a
  - name: gateway
  - name: node-c
    healthy: false
"#;

    #[tokio::test]
    async fn test_list_filters_and_sorts() {
        let cloud = StaticCloud::parse(INVENTORY).unwrap();
        let filter = Regex::new("^node-").unwrap();
        let names = cloud.list(&filter).await.unwrap();
        assert_eq!(names, vec!["node-a", "node-b", "node-c"]);
    }

    #[tokio::test]
    async fn test_exists_reports_health() {
        let cloud = StaticCloud::parse(INVENTORY).unwrap();
        assert!(cloud.exists("node-a").await.unwrap());
        assert!(!cloud.exists("node-c").await.unwrap());
        assert!(!cloud.exists("missing").await.unwrap());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            StaticCloud::parse("instances: {name: x}"),
            Err(CloudError::Config(_))
        ));
    }
}
