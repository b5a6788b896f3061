//! API object types served over HTTP and persisted by the storage backend.
//!
//! Every persisted kind implements [`Object`], which gives the registry
//! layer uniform access to its [`ObjectMeta`] (name, namespace, resource
//! version, labels).  Objects travel on the wire and in the store wrapped
//! in a [`Versioned`] envelope carrying `kind` and `apiVersion`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Namespace used when a request does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

// -- Request context -----------------------------------------------------------

/// Identity resolved by the authentication stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub name: String,
    pub uid: String,
}

/// Request-scoped namespace and identity.
///
/// Built per request by the routing layer and passed by reference to every
/// registry call.  It is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    namespace: String,
    user: Option<UserInfo>,
}

impl Context {
    /// Create a context scoped to `namespace`.  An empty namespace falls
    /// back to [`DEFAULT_NAMESPACE`].
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: if namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                namespace
            },
            user: None,
        }
    }

    /// Attach the authenticated identity.
    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn user(&self) -> Option<&UserInfo> {
        self.user.as_ref()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

// -- API versions --------------------------------------------------------------

/// Served (and storable) API versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiVersion {
    V1beta1,
    V1beta2,
}

impl ApiVersion {
    /// Version used for storage when none is configured.
    pub const PREFERRED: ApiVersion = ApiVersion::V1beta1;

    /// Every version mounted under the API prefix.
    pub const ALL: [ApiVersion; 2] = [ApiVersion::V1beta1, ApiVersion::V1beta2];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V1beta1 => "v1beta1",
            ApiVersion::V1beta2 => "v1beta2",
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1beta1" => Ok(ApiVersion::V1beta1),
            "v1beta2" => Ok(ApiVersion::V1beta2),
            other => Err(format!("unsupported API version {other:?}")),
        }
    }
}

// -- Object plumbing -----------------------------------------------------------

/// A type with a fixed `kind` name on the wire.
pub trait Kind {
    const KIND: &'static str;
}

/// A named, versioned, storable API object.
pub trait Object: Kind + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Field set visible to field selectors.
    fn fields(&self) -> BTreeMap<String, String> {
        let meta = self.metadata();
        let mut fields = BTreeMap::new();
        for key in ["name", "metadata.name"] {
            fields.insert(key.to_string(), meta.name.clone());
        }
        for key in ["namespace", "metadata.namespace"] {
            fields.insert(key.to_string(), meta.namespace.clone());
        }
        fields
    }
}

/// Wire envelope adding `kind` and `apiVersion` to an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned<T> {
    pub kind: String,
    pub api_version: String,
    #[serde(flatten)]
    pub object: T,
}

impl<T: Kind> Versioned<T> {
    pub fn new(version: ApiVersion, object: T) -> Self {
        Self {
            kind: T::KIND.to_string(),
            api_version: version.as_str().to_string(),
            object,
        }
    }
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Metadata common to every object.
///
/// `name` must be a DNS-1035 label (lowercase alphanumerics and `-`,
/// starting with a letter, at most 63 characters).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    #[garde(length(min = 1, max = 63), pattern(r"^[a-z]([-a-z0-9]*[a-z0-9])?$"))]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    #[garde(skip)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    #[garde(skip)]
    pub uid: String,

    /// Store modification index; zero means "unset".
    #[serde(default, skip_serializing_if = "is_zero")]
    #[garde(skip)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[garde(skip)]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Metadata on list responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub resource_version: u64,
}

// -- Services ------------------------------------------------------------------

/// A named load-balanced port in front of a label-selected set of pods.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default)]
    #[garde(dive)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    #[garde(dive)]
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default)]
    #[garde(range(min = 1, max = 65535))]
    pub port: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub container_port: Option<u16>,

    #[serde(default = "default_protocol")]
    #[garde(pattern(r"^(TCP|UDP)$"))]
    pub protocol: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[garde(skip)]
    pub selector: BTreeMap<String, String>,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

impl Service {
    pub fn new(name: impl Into<String>, port: u32) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: ServiceSpec {
                port,
                container_port: None,
                protocol: default_protocol(),
                selector: BTreeMap::new(),
            },
        }
    }
}

impl Kind for Service {
    const KIND: &'static str = "Service";
}

impl Object for Service {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<Service>,
}

impl Kind for ServiceList {
    const KIND: &'static str = "ServiceList";
}

// -- Endpoints -----------------------------------------------------------------

/// The concrete `host:port` backends currently serving a service.
///
/// Shares its name with the owning service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    #[serde(default)]
    #[garde(dive)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    #[garde(inner(pattern(r"^[^:\s]+:[0-9]{1,5}$")))]
    pub endpoints: Vec<String>,
}

impl Endpoints {
    pub fn new(name: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            endpoints,
        }
    }
}

impl Kind for Endpoints {
    const KIND: &'static str = "Endpoints";
}

impl Object for Endpoints {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointsList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<Endpoints>,
}

impl Kind for EndpointsList {
    const KIND: &'static str = "EndpointsList";
}

// -- Minions -------------------------------------------------------------------

/// Per-node capacity used for scheduling accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    /// CPU in thousandths of a core.
    pub cpu: i64,
    /// Memory in bytes.
    pub memory: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResources {
    pub capacity: ResourceList,
}

/// A worker node eligible for scheduling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Minion {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub resources: NodeResources,
}

impl Kind for Minion {
    const KIND: &'static str = "Minion";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinionList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<Minion>,
}

impl Kind for MinionList {
    const KIND: &'static str = "MinionList";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_defaults_namespace() {
        assert_eq!(Context::new("").namespace(), DEFAULT_NAMESPACE);
        assert_eq!(Context::new("prod").namespace(), "prod");
        assert!(Context::default().user().is_none());
    }

    #[test]
    fn test_api_version_parse() {
        assert_eq!("v1beta1".parse::<ApiVersion>(), Ok(ApiVersion::V1beta1));
        assert_eq!("v1beta2".parse::<ApiVersion>(), Ok(ApiVersion::V1beta2));
        assert!("v2".parse::<ApiVersion>().is_err());
    }

    #[test]
    fn test_versioned_envelope_serializes_kind() {
        let svc = Service::new("frontend", 80);
        let json = serde_json::to_value(Versioned::new(ApiVersion::V1beta2, svc)).unwrap();
        assert_eq!(json["kind"], "Service");
        assert_eq!(json["apiVersion"], "v1beta2");
        assert_eq!(json["metadata"]["name"], "frontend");
        assert_eq!(json["spec"]["port"], 80);
        // Unset resource version is omitted.
        assert!(json["metadata"].get("resourceVersion").is_none());
    }

    #[test]
    fn test_versioned_envelope_parses_back() {
        let raw = r#"{"kind":"Service","apiVersion":"v1beta1","metadata":{"name":"db"},"spec":{"port":5432}}"#;
        let parsed: Versioned<Service> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.object.metadata.name, "db");
        assert_eq!(parsed.object.spec.protocol, "TCP");
    }

    #[test]
    fn test_service_validation() {
        assert!(Service::new("frontend", 80).validate().is_ok());
        assert!(Service::new("Frontend", 80).validate().is_err());
        assert!(Service::new("frontend", 0).validate().is_err());
        assert!(Service::new("frontend", 65535).validate().is_ok());
        assert!(Service::new("frontend", 65536).validate().is_err());
        assert!(Service::new("", 80).validate().is_err());
        assert!(Service::new(&"a".repeat(64), 80).validate().is_err());

        let mut udp = Service::new("dns", 53);
        udp.spec.protocol = "SCTP".to_string();
        assert!(udp.validate().is_err());
    }

    #[test]
    fn test_endpoints_validation() {
        let ok = Endpoints::new("frontend", vec!["10.0.0.1:80".into(), "host-b:8080".into()]);
        assert!(ok.validate().is_ok());
        let bad = Endpoints::new("frontend", vec!["10.0.0.1".into()]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_object_fields() {
        let mut svc = Service::new("frontend", 80);
        svc.metadata.namespace = "prod".to_string();
        let fields = svc.fields();
        assert_eq!(fields["name"], "frontend");
        assert_eq!(fields["metadata.namespace"], "prod");
    }
}
