//! Abstract key-value store trait.
//!
//! Every store the registry can sit on must implement [`KvStore`]: a
//! hierarchical, watchable key space with a single monotonically increasing
//! modification index.  The index of the last write to a key is that key's
//! resource version.

use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use thiserror::Error;

/// A single stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvNode {
    pub key: String,
    pub value: String,
    /// Index of the write that created the key.
    pub created_index: u64,
    /// Index of the most recent write to the key.
    pub modified_index: u64,
}

/// Result of a recursive listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvListing {
    /// Leaf nodes under the prefix, in key order.
    pub nodes: Vec<KvNode>,
    /// Store index at the time of the listing.
    pub index: u64,
}

/// The kind of change a [`KvEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvAction {
    Created,
    Updated,
    Deleted,
}

/// A change notification.
///
/// For deletions `node.value` is empty and `prev` carries the last value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub action: KvAction,
    pub node: KvNode,
    pub prev: Option<KvNode>,
}

/// Store-level errors.  The registry layer translates these into
/// [`RegistryError`](crate::registry::RegistryError).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key already exists: {0}")]
    NodeExists(String),

    #[error("compare failed on {key}: {message}")]
    TestFailed { key: String, message: String },

    #[error("requested index is older than the retained event history")]
    IndexCleared,

    #[error("no storage server reachable: {0}")]
    Unreachable(String),

    #[error("malformed storage response: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Other(String),
}

pub type KvFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, KvError>> + Send + 'a>>;

/// Stream of change notifications.  The stream ends after yielding an error.
pub type KvWatch = Pin<Box<dyn Stream<Item = Result<KvEvent, KvError>> + Send>>;

/// Async watchable key-value store contract.
pub trait KvStore: Send + Sync + 'static {
    /// Read a single key.  Fails with `KeyNotFound`.
    fn get<'a>(&'a self, key: &'a str) -> KvFuture<'a, KvNode>;

    /// List every leaf under `prefix`.  A missing prefix is an empty listing.
    fn list<'a>(&'a self, prefix: &'a str) -> KvFuture<'a, KvListing>;

    /// Create `key`.  Fails with `NodeExists` when it is already present.
    fn create<'a>(&'a self, key: &'a str, value: String) -> KvFuture<'a, KvNode>;

    /// Replace `key` only if its modified index equals `prev_index`.
    /// Fails with `TestFailed` on mismatch and `KeyNotFound` when absent.
    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        value: String,
        prev_index: u64,
    ) -> KvFuture<'a, KvNode>;

    /// Delete `key`, returning its last state.  Fails with `KeyNotFound`.
    fn delete<'a>(&'a self, key: &'a str) -> KvFuture<'a, KvNode>;

    /// Watch every key under `prefix`.  With `after_index` the stream first
    /// replays changes newer than that index; without it only changes made
    /// after the call are reported.
    fn watch(&self, prefix: &str, after_index: Option<u64>) -> KvWatch;
}
