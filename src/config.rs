//! Startup configuration.
//!
//! Parameters arrive as a [`RawConfig`], read from an optional YAML file and
//! overlaid with command-line flags.  [`RawConfig::resolve`] validates them
//! and produces the immutable [`Config`] the server runs with.  Resolution
//! only touches files it is explicitly pointed at: the cloud provider config
//! and the token file.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::api::{ApiVersion, NodeResources, ResourceList};
use crate::auth::TokenAuthenticator;

/// Errors that stop the server before it listens.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("only one of etcd_servers and etcd_config may be specified")]
    StorageSourceConflict,

    #[error("one of etcd_servers or etcd_config must be specified")]
    StorageSourceMissing,

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("invalid api prefix {0:?}: must start with '/'")]
    InvalidApiPrefix(String),

    #[error("invalid CORS allowed origin {pattern:?}: {source}")]
    InvalidOrigin {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid minion pattern {pattern:?}: {source}")]
    InvalidNodePattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown storage version {0:?}")]
    UnknownStorageVersion(String),

    #[error("couldn't open cloud provider configuration {path}: {source}")]
    CloudConfigUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown cloud provider: {0}")]
    UnknownCloudProvider(String),

    #[error("couldn't init cloud provider {provider:?}: {message}")]
    CloudConfigInvalid { provider: String, message: String },

    #[error("unable to read token file {path}: {source}")]
    TokenFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid token file {path} line {line}: {reason}")]
    TokenFileInvalid {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("invalid storage configuration: {0}")]
    StorageConfigInvalid(String),

    #[error("config file {path}: {message}")]
    ConfigFile { path: PathBuf, message: String },
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Unvalidated startup parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    /// IP address to serve on.
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path prefix the API is mounted under.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Version stamped into stored objects.  Empty selects the preferred
    /// version.
    #[serde(default)]
    pub storage_version: String,

    /// etcd servers.  Mutually exclusive with `etcd_config`.
    #[serde(default)]
    pub etcd_servers: Vec<String>,

    /// etcd client config file.  Mutually exclusive with `etcd_servers`.
    #[serde(default)]
    pub etcd_config: Option<PathBuf>,

    #[serde(default)]
    pub cloud_provider: Option<String>,

    #[serde(default)]
    pub cloud_config: Option<PathBuf>,

    /// Pattern selecting minions among cloud instances.  Only used together
    /// with `cloud_provider`.
    #[serde(default)]
    pub minion_regexp: Option<String>,

    /// Static minion list.
    #[serde(default)]
    pub machines: Vec<String>,

    #[serde(default = "default_true")]
    pub health_check_minions: bool,

    #[serde(default = "default_minion_cache_ttl")]
    pub minion_cache_ttl_secs: u64,

    /// CSV file of `token,user,uid` lines enabling bearer authentication.
    #[serde(default)]
    pub token_auth_file: Option<PathBuf>,

    /// Origin patterns allowed to make cross-origin requests.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,

    #[serde(default = "default_node_milli_cpu")]
    pub node_milli_cpu: i64,

    /// Memory per node in bytes.
    #[serde(default = "default_node_memory")]
    pub node_memory: i64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            api_prefix: default_api_prefix(),
            storage_version: String::new(),
            etcd_servers: Vec::new(),
            etcd_config: None,
            cloud_provider: None,
            cloud_config: None,
            minion_regexp: None,
            machines: Vec::new(),
            health_check_minions: true,
            minion_cache_ttl_secs: default_minion_cache_ttl(),
            token_auth_file: None,
            cors_allowed_origins: Vec::new(),
            node_milli_cpu: default_node_milli_cpu(),
            node_memory: default_node_memory(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Where API objects are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageSource {
    Servers(Vec<String>),
    ConfigFile(PathBuf),
}

/// A named cloud provider and the contents of its config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSettings {
    pub provider: String,
    pub config: Option<String>,
}

/// Node membership and capacity settings.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub pattern: Option<Regex>,
    pub machines: Vec<String>,
    pub health_check: bool,
    pub cache_ttl: Duration,
    pub capacity: NodeResources,
}

/// Resolved configuration.  Built once at startup and read-only after.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Normalized prefix: leading `/`, no trailing `/`.
    pub api_prefix: String,
    pub storage_version: ApiVersion,
    pub storage: StorageSource,
    pub cloud: Option<CloudSettings>,
    pub nodes: NodeSettings,
    pub token_auth: Option<Arc<TokenAuthenticator>>,
    pub cors_allowed_origins: Vec<Regex>,
    pub logging: LoggingConfig,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn non_empty_path(value: &Option<PathBuf>) -> Option<&Path> {
    value.as_deref().filter(|p| !p.as_os_str().is_empty())
}

impl RawConfig {
    /// Validate and normalize.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let storage = self.storage_source()?;

        let storage_version = match self.storage_version.trim() {
            "" => ApiVersion::PREFERRED,
            v => v
                .parse::<ApiVersion>()
                .map_err(|_| ConfigError::UnknownStorageVersion(v.to_string()))?,
        };

        let ip: IpAddr = self
            .address
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))?;

        let api_prefix = self.api_prefix.trim().trim_end_matches('/').to_string();
        if !api_prefix.starts_with('/') {
            return Err(ConfigError::InvalidApiPrefix(self.api_prefix.clone()));
        }

        let cors_allowed_origins = self
            .cors_allowed_origins
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::InvalidOrigin {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let pattern = non_empty(&self.minion_regexp)
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::InvalidNodePattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .transpose()?;

        let cloud = match non_empty(&self.cloud_provider) {
            Some(provider) => Some(CloudSettings {
                provider: provider.to_string(),
                config: non_empty_path(&self.cloud_config)
                    .map(|path| {
                        std::fs::read_to_string(path).map_err(|source| {
                            ConfigError::CloudConfigUnreadable {
                                path: path.to_path_buf(),
                                source,
                            }
                        })
                    })
                    .transpose()?,
            }),
            None => None,
        };

        let token_auth = non_empty_path(&self.token_auth_file)
            .map(load_token_file)
            .transpose()?
            .map(Arc::new);

        Ok(Config {
            listen: SocketAddr::new(ip, self.port),
            api_prefix,
            storage_version,
            storage,
            cloud,
            nodes: NodeSettings {
                pattern,
                machines: self
                    .machines
                    .iter()
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect(),
                health_check: self.health_check_minions,
                cache_ttl: Duration::from_secs(self.minion_cache_ttl_secs),
                capacity: NodeResources {
                    capacity: ResourceList {
                        cpu: self.node_milli_cpu,
                        memory: self.node_memory,
                    },
                },
            },
            token_auth,
            cors_allowed_origins,
            logging: self.logging.clone(),
        })
    }

    fn storage_source(&self) -> Result<StorageSource, ConfigError> {
        let servers: Vec<String> = self
            .etcd_servers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        match (servers.is_empty(), non_empty_path(&self.etcd_config)) {
            (false, Some(_)) => Err(ConfigError::StorageSourceConflict),
            (true, None) => Err(ConfigError::StorageSourceMissing),
            (false, None) => Ok(StorageSource::Servers(servers)),
            (true, Some(path)) => Ok(StorageSource::ConfigFile(path.to_path_buf())),
        }
    }
}

fn load_token_file(path: &Path) -> Result<TokenAuthenticator, ConfigError> {
    let text =
        std::fs::read_to_string(path).map_err(|source| ConfigError::TokenFileUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
    TokenAuthenticator::parse(&text).map_err(|e| ConfigError::TokenFileInvalid {
        path: path.to_path_buf(),
        line: e.line,
        reason: e.reason,
    })
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_minion_cache_ttl() -> u64 {
    30
}

fn default_node_milli_cpu() -> i64 {
    1000
}

fn default_node_memory() -> i64 {
    3 * 1024 * 1024 * 1024 // 3 GiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load raw parameters from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RawConfig, ConfigError> {
    let path = path.as_ref();
    let err = |message: String| ConfigError::ConfigFile {
        path: path.to_path_buf(),
        message,
    };
    let contents = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
    serde_yaml::from_str(&contents).map_err(|e| err(e.to_string()))
}
