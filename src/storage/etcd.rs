//! etcd v2 keys API client.
//!
//! Talks JSON over HTTP to one of a list of machines, failing over to the
//! next machine on transport errors.  Construction performs no I/O; the
//! first request is made lazily by the registry.
//!
//! Watches use long polling (`?wait=true&recursive=true&waitIndex=N`) and
//! re-issue the poll after every delivered event.

use std::path::Path;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::backend::{KvAction, KvError, KvEvent, KvFuture, KvListing, KvNode, KvStore, KvWatch};

/// Header carrying the cluster-wide index on every response.
const ETCD_INDEX_HEADER: &str = "x-etcd-index";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// etcd v2 error codes.
const ERR_KEY_NOT_FOUND: u32 = 100;
const ERR_TEST_FAILED: u32 = 101;
const ERR_NODE_EXIST: u32 = 105;
const ERR_EVENT_INDEX_CLEARED: u32 = 401;

// -- Wire types ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNode {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<WireNode>,
    #[serde(default)]
    created_index: u64,
    #[serde(default)]
    modified_index: u64,
}

impl WireNode {
    fn into_node(self) -> KvNode {
        KvNode {
            key: self.key,
            value: self.value.unwrap_or_default(),
            created_index: self.created_index,
            modified_index: self.modified_index,
        }
    }

    /// Collect every leaf below this node.
    fn flatten_into(self, out: &mut Vec<KvNode>) {
        if self.dir {
            for child in self.nodes {
                child.flatten_into(out);
            }
        } else {
            out.push(self.into_node());
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    action: String,
    node: WireNode,
    #[serde(default)]
    prev_node: Option<WireNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireError {
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

impl WireError {
    fn into_kv_error(self) -> KvError {
        match self.error_code {
            ERR_KEY_NOT_FOUND => KvError::KeyNotFound(self.cause),
            ERR_NODE_EXIST => KvError::NodeExists(self.cause),
            ERR_TEST_FAILED => KvError::TestFailed {
                key: String::new(),
                message: self.cause,
            },
            ERR_EVENT_INDEX_CLEARED => KvError::IndexCleared,
            code => KvError::Other(format!("{} ({code}): {}", self.message, self.cause)),
        }
    }
}

/// Map an etcd action name onto a [`KvAction`].
fn action_of(action: &str, has_prev: bool) -> KvAction {
    match action {
        "create" => KvAction::Created,
        "set" if !has_prev => KvAction::Created,
        "delete" | "expire" | "compareAndDelete" => KvAction::Deleted,
        _ => KvAction::Updated,
    }
}

/// Client configuration file (`etcd_config`).  Accepts YAML or JSON:
///
/// ```yaml
/// cluster:
///   machines: ["http://10.0.0.1:4001", "http://10.0.0.2:4001"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct EtcdClientConfig {
    pub cluster: EtcdCluster,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtcdCluster {
    #[serde(default)]
    pub machines: Vec<String>,
}

// -- Client --------------------------------------------------------------------

/// [`KvStore`] backed by an etcd v2 cluster.
#[derive(Debug, Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    machines: Vec<String>,
}

impl EtcdClient {
    /// Create a client for `machines` (e.g. `http://127.0.0.1:4001`).
    pub fn new(machines: Vec<String>) -> Result<Self, KvError> {
        let machines: Vec<String> = machines
            .into_iter()
            .map(|m| m.trim().trim_end_matches('/').to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if machines.is_empty() {
            return Err(KvError::Other("no etcd machines given".to_string()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| KvError::Other(e.to_string()))?;
        Ok(Self { http, machines })
    }

    /// Create a client from a YAML/JSON client configuration file.
    pub fn from_config_file(path: &Path) -> Result<Self, KvError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| KvError::Other(format!("reading {}: {e}", path.display())))?;
        let config: EtcdClientConfig = serde_yaml::from_str(&contents)
            .map_err(|e| KvError::Decode(format!("parsing {}: {e}", path.display())))?;
        Self::new(config.cluster.machines)
    }

    pub fn machines(&self) -> &[String] {
        &self.machines
    }

    fn key_url(machine: &str, key: &str) -> String {
        format!("{machine}/v2/keys/{}", key.trim_start_matches('/'))
    }

    /// Send a request to the first machine that answers.
    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, &str)]>,
    ) -> Result<reqwest::Response, KvError> {
        let mut last_error = String::new();
        for machine in &self.machines {
            let mut req = self
                .http
                .request(method.clone(), Self::key_url(machine, key))
                .query(query);
            if let Some(form) = form {
                req = req.form(form);
            }
            match req.send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    debug!("etcd machine {} failed: {}", machine, e);
                    last_error = e.to_string();
                }
            }
        }
        Err(KvError::Unreachable(last_error))
    }

    /// Decode a response body, returning it with the cluster index.
    async fn decode(resp: reqwest::Response) -> Result<(WireResponse, u64), KvError> {
        let status = resp.status();
        let index = resp
            .headers()
            .get(ETCD_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let body = resp
            .bytes()
            .await
            .map_err(|e| KvError::Unreachable(e.to_string()))?;
        if status.is_success() {
            let parsed: WireResponse =
                serde_json::from_slice(&body).map_err(|e| KvError::Decode(e.to_string()))?;
            Ok((parsed, index))
        } else {
            Err(decode_error(status, &body))
        }
    }

    async fn write(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        value: Option<&str>,
    ) -> Result<WireResponse, KvError> {
        let form = value.map(|v| [("value", v)]);
        let resp = self
            .send(method, key, query, form.as_ref().map(|f| &f[..]))
            .await?;
        Ok(Self::decode(resp).await?.0)
    }
}

fn decode_error(status: StatusCode, body: &[u8]) -> KvError {
    match serde_json::from_slice::<WireError>(body) {
        Ok(err) => err.into_kv_error(),
        Err(_) => KvError::Other(format!(
            "unexpected status {status}: {}",
            String::from_utf8_lossy(body)
        )),
    }
}

fn decode_listing(resp: WireResponse, index: u64) -> KvListing {
    let mut nodes = Vec::new();
    resp.node.flatten_into(&mut nodes);
    nodes.sort_by(|a, b| a.key.cmp(&b.key));
    KvListing { nodes, index }
}

fn decode_event(resp: WireResponse) -> KvEvent {
    let action = action_of(&resp.action, resp.prev_node.is_some());
    KvEvent {
        action,
        node: resp.node.into_node(),
        prev: resp.prev_node.map(WireNode::into_node),
    }
}

impl KvStore for EtcdClient {
    fn get<'a>(&'a self, key: &'a str) -> KvFuture<'a, KvNode> {
        Box::pin(async move {
            let resp = self.send(Method::GET, key, &[], None).await?;
            Ok(Self::decode(resp).await?.0.node.into_node())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> KvFuture<'a, KvListing> {
        Box::pin(async move {
            let query = [("recursive", "true".to_string())];
            let resp = self.send(Method::GET, prefix, &query, None).await?;
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| KvError::Unreachable(e.to_string()))?;
                return match serde_json::from_slice::<WireError>(&body) {
                    Ok(err) if err.error_code == ERR_KEY_NOT_FOUND => Ok(KvListing {
                        nodes: Vec::new(),
                        index: err.index,
                    }),
                    _ => Err(decode_error(status, &body)),
                };
            }
            let (parsed, index) = Self::decode(resp).await?;
            Ok(decode_listing(parsed, index))
        })
    }

    fn create<'a>(&'a self, key: &'a str, value: String) -> KvFuture<'a, KvNode> {
        Box::pin(async move {
            let query = [("prevExist", "false".to_string())];
            let resp = self.write(Method::PUT, key, &query, Some(&value)).await?;
            Ok(resp.node.into_node())
        })
    }

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        value: String,
        prev_index: u64,
    ) -> KvFuture<'a, KvNode> {
        Box::pin(async move {
            let query = [("prevIndex", prev_index.to_string())];
            let resp = self
                .write(Method::PUT, key, &query, Some(&value))
                .await
                .map_err(|e| match e {
                    KvError::TestFailed { message, .. } => KvError::TestFailed {
                        key: key.to_string(),
                        message,
                    },
                    other => other,
                })?;
            Ok(resp.node.into_node())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> KvFuture<'a, KvNode> {
        Box::pin(async move {
            let resp = self.write(Method::DELETE, key, &[], None).await?;
            let node = resp.node;
            Ok(resp
                .prev_node
                .map(WireNode::into_node)
                .unwrap_or_else(|| node.into_node()))
        })
    }

    fn watch(&self, prefix: &str, after_index: Option<u64>) -> KvWatch {
        let client = self.clone();
        let prefix = prefix.to_string();
        let start = after_index.map(|i| i + 1);

        stream::unfold(Some(start), move |state| {
            let client = client.clone();
            let prefix = prefix.clone();
            async move {
                let wait_index = state?;
                let mut query = vec![
                    ("wait", "true".to_string()),
                    ("recursive", "true".to_string()),
                ];
                if let Some(index) = wait_index {
                    query.push(("waitIndex", index.to_string()));
                }
                let result = match client.send(Method::GET, &prefix, &query, None).await {
                    Ok(resp) => Self::decode(resp).await.map(|(r, _)| decode_event(r)),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(event) => {
                        let next = event.node.modified_index + 1;
                        Some((Ok(event), Some(Some(next))))
                    }
                    Err(e) => {
                        warn!("etcd watch on {} ended: {}", prefix, e);
                        Some((Err(e), None))
                    }
                }
            }
        })
        .boxed()
    }
}
