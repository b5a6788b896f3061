//! In-process watchable key-value store.
//!
//! Keys live in a `BTreeMap` behind a mutex together with the global
//! modification index and a bounded history of recent events.  Live
//! watchers are fed from a `tokio::sync::broadcast` channel; every event is
//! sent while the mutex is held, so a watcher that snapshots the history
//! and subscribes under the same lock sees each change exactly once.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;

use super::backend::{KvAction, KvError, KvEvent, KvFuture, KvListing, KvNode, KvStore, KvWatch};

/// Number of past events kept for resuming watches.
pub const DEFAULT_HISTORY: usize = 1000;

/// Capacity of the live event channel per watcher.
const CHANNEL_CAPACITY: usize = 1024;

struct Inner {
    nodes: BTreeMap<String, KvNode>,
    index: u64,
    history: VecDeque<KvEvent>,
}

/// In-memory [`KvStore`].
pub struct MemoryKv {
    inner: Mutex<Inner>,
    events: broadcast::Sender<KvEvent>,
    history_limit: usize,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Create a store retaining at most `history_limit` past events.
    pub fn with_history(history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                nodes: BTreeMap::new(),
                index: 0,
                history: VecDeque::new(),
            }),
            events,
            history_limit,
        }
    }

    /// Current store index.
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the map half-written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an event and publish it.  Must be called with the lock held.
    fn publish(&self, inner: &mut Inner, event: KvEvent) {
        if self.history_limit > 0 {
            if inner.history.len() == self.history_limit {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn create_sync(&self, key: &str, value: String) -> Result<KvNode, KvError> {
        let mut inner = self.lock();
        if inner.nodes.contains_key(key) {
            return Err(KvError::NodeExists(key.to_string()));
        }
        inner.index += 1;
        let node = KvNode {
            key: key.to_string(),
            value,
            created_index: inner.index,
            modified_index: inner.index,
        };
        inner.nodes.insert(key.to_string(), node.clone());
        self.publish(
            &mut inner,
            KvEvent {
                action: KvAction::Created,
                node: node.clone(),
                prev: None,
            },
        );
        Ok(node)
    }

    fn compare_and_swap_sync(
        &self,
        key: &str,
        value: String,
        prev_index: u64,
    ) -> Result<KvNode, KvError> {
        let mut inner = self.lock();
        let prev = inner
            .nodes
            .get(key)
            .cloned()
            .ok_or_else(|| KvError::KeyNotFound(key.to_string()))?;
        if prev.modified_index != prev_index {
            return Err(KvError::TestFailed {
                key: key.to_string(),
                message: format!("[{} != {}]", prev_index, prev.modified_index),
            });
        }
        inner.index += 1;
        let node = KvNode {
            key: key.to_string(),
            value,
            created_index: prev.created_index,
            modified_index: inner.index,
        };
        inner.nodes.insert(key.to_string(), node.clone());
        self.publish(
            &mut inner,
            KvEvent {
                action: KvAction::Updated,
                node: node.clone(),
                prev: Some(prev),
            },
        );
        Ok(node)
    }

    fn delete_sync(&self, key: &str) -> Result<KvNode, KvError> {
        let mut inner = self.lock();
        let prev = inner
            .nodes
            .remove(key)
            .ok_or_else(|| KvError::KeyNotFound(key.to_string()))?;
        inner.index += 1;
        let node = KvNode {
            key: key.to_string(),
            value: String::new(),
            created_index: prev.created_index,
            modified_index: inner.index,
        };
        self.publish(
            &mut inner,
            KvEvent {
                action: KvAction::Deleted,
                node,
                prev: Some(prev.clone()),
            },
        );
        Ok(prev)
    }

    fn list_sync(&self, prefix: &str) -> KvListing {
        let inner = self.lock();
        KvListing {
            nodes: inner
                .nodes
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(_, n)| n.clone())
                .collect(),
            index: inner.index,
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKv {
    fn get<'a>(&'a self, key: &'a str) -> KvFuture<'a, KvNode> {
        Box::pin(async move {
            self.lock()
                .nodes
                .get(key)
                .cloned()
                .ok_or_else(|| KvError::KeyNotFound(key.to_string()))
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> KvFuture<'a, KvListing> {
        Box::pin(async move { Ok(self.list_sync(prefix)) })
    }

    fn create<'a>(&'a self, key: &'a str, value: String) -> KvFuture<'a, KvNode> {
        Box::pin(async move { self.create_sync(key, value) })
    }

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        value: String,
        prev_index: u64,
    ) -> KvFuture<'a, KvNode> {
        Box::pin(async move { self.compare_and_swap_sync(key, value, prev_index) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> KvFuture<'a, KvNode> {
        Box::pin(async move { self.delete_sync(key) })
    }

    fn watch(&self, prefix: &str, after_index: Option<u64>) -> KvWatch {
        let prefix = prefix.to_string();
        let inner = self.lock();
        let after = after_index.unwrap_or(inner.index);

        if after < inner.index {
            let oldest = inner.history.front().map(|e| e.node.modified_index);
            if oldest.map_or(true, |oldest| oldest > after + 1) {
                return stream::once(async { Err::<KvEvent, KvError>(KvError::IndexCleared) }).boxed();
            }
        }

        let replay: Vec<Result<KvEvent, KvError>> = inner
            .history
            .iter()
            .filter(|e| e.node.modified_index > after && e.node.key.starts_with(&prefix))
            .cloned()
            .map(Ok)
            .collect();
        let last = inner.index.max(after);
        let rx = self.events.subscribe();
        drop(inner);

        let live = stream::unfold(Some((rx, prefix, last)), |state| async move {
            let (mut rx, prefix, last) = state?;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.node.modified_index > last && event.node.key.starts_with(&prefix)
                        {
                            let index = event.node.modified_index;
                            return Some((Ok(event), Some((rx, prefix, index))));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "watcher fell behind the event channel");
                        return Some((Err(KvError::IndexCleared), None));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(replay).chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_event(watch: &mut KvWatch) -> KvEvent {
        tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("watch error")
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let kv = MemoryKv::new();
        let node = kv.create("/a/b", "one".into()).await.unwrap();
        assert_eq!(node.modified_index, 1);
        assert_eq!(node.created_index, 1);
        assert_eq!(kv.get("/a/b").await.unwrap().value, "one");
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let kv = MemoryKv::new();
        kv.create("/a", "x".into()).await.unwrap();
        assert_eq!(
            kv.create("/a", "y".into()).await,
            Err(KvError::NodeExists("/a".into()))
        );
    }

    #[tokio::test]
    async fn test_get_missing() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("/nope").await, Err(KvError::KeyNotFound("/nope".into())));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let kv = MemoryKv::new();
        let node = kv.create("/a", "x".into()).await.unwrap();

        let updated = kv
            .compare_and_swap("/a", "y".into(), node.modified_index)
            .await
            .unwrap();
        assert_eq!(updated.value, "y");
        assert_eq!(updated.created_index, node.created_index);
        assert!(updated.modified_index > node.modified_index);

        // Stale index is rejected.
        let stale = kv
            .compare_and_swap("/a", "z".into(), node.modified_index)
            .await;
        assert!(matches!(stale, Err(KvError::TestFailed { .. })));

        let missing = kv.compare_and_swap("/b", "z".into(), 1).await;
        assert_eq!(missing, Err(KvError::KeyNotFound("/b".into())));
    }

    #[tokio::test]
    async fn test_delete_returns_previous() {
        let kv = MemoryKv::new();
        kv.create("/a", "x".into()).await.unwrap();
        let prev = kv.delete("/a").await.unwrap();
        assert_eq!(prev.value, "x");
        assert!(kv.get("/a").await.is_err());
        assert_eq!(kv.delete("/a").await, Err(KvError::KeyNotFound("/a".into())));
    }

    #[tokio::test]
    async fn test_list_is_prefix_scoped() {
        let kv = MemoryKv::new();
        kv.create("/svc/default/a", "1".into()).await.unwrap();
        kv.create("/svc/default/b", "2".into()).await.unwrap();
        kv.create("/svc/other/c", "3".into()).await.unwrap();
        kv.create("/svc/defaultx/d", "4".into()).await.unwrap();

        let listing = kv.list("/svc/default/").await.unwrap();
        let keys: Vec<_> = listing.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["/svc/default/a", "/svc/default/b"]);
        assert_eq!(listing.index, 4);

        let empty = kv.list("/nothing/").await.unwrap();
        assert!(empty.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_watch_from_now_sees_only_new_changes() {
        let kv = MemoryKv::new();
        kv.create("/w/old", "x".into()).await.unwrap();

        let mut watch = kv.watch("/w/", None);
        kv.create("/w/new", "y".into()).await.unwrap();
        kv.create("/elsewhere", "z".into()).await.unwrap();
        kv.delete("/w/new").await.unwrap();

        let ev = next_event(&mut watch).await;
        assert_eq!(ev.action, KvAction::Created);
        assert_eq!(ev.node.key, "/w/new");

        let ev = next_event(&mut watch).await;
        assert_eq!(ev.action, KvAction::Deleted);
        assert_eq!(ev.prev.unwrap().value, "y");
    }

    #[tokio::test]
    async fn test_watch_resumes_after_index() {
        let kv = MemoryKv::new();
        let first = kv.create("/w/a", "1".into()).await.unwrap();
        kv.compare_and_swap("/w/a", "2".into(), first.modified_index)
            .await
            .unwrap();

        let mut watch = kv.watch("/w/", Some(first.modified_index));
        let ev = next_event(&mut watch).await;
        assert_eq!(ev.action, KvAction::Updated);
        assert_eq!(ev.node.value, "2");

        kv.create("/w/b", "3".into()).await.unwrap();
        let ev = next_event(&mut watch).await;
        assert_eq!(ev.node.key, "/w/b");
    }

    #[tokio::test]
    async fn test_watch_index_cleared() {
        let kv = MemoryKv::with_history(2);
        for i in 0..5 {
            kv.create(&format!("/w/{i}"), "v".into()).await.unwrap();
        }
        let mut watch = kv.watch("/w/", Some(1));
        let item = watch.next().await.unwrap();
        assert_eq!(item, Err(KvError::IndexCleared));
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_events_are_ordered() {
        let kv = MemoryKv::new();
        let mut watch = kv.watch("/w/", Some(0));
        for i in 0..10 {
            kv.create(&format!("/w/{i}"), "v".into()).await.unwrap();
        }
        let mut last = 0;
        for _ in 0..10 {
            let ev = next_event(&mut watch).await;
            assert!(ev.node.modified_index > last);
            last = ev.node.modified_index;
        }
    }
}
