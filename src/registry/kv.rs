//! [`ServiceRegistry`] backed by a [`KvStore`].
//!
//! Layout:
//! - `/registry/services/specs/{namespace}/{name}` holds a service
//! - `/registry/services/endpoints/{namespace}/{name}` holds its endpoints
//!
//! Values are JSON envelopes stamped with the configured storage version.
//! An object's resource version is the store's modified index for its key
//! and is never written into the value itself.

use std::sync::Arc;

use chrono::Utc;
use futures::future;
use futures::stream::StreamExt;
use tracing::warn;

use super::{RegistryError, RegistryFuture, ServiceRegistry};
use crate::api::{
    ApiVersion, Context, Endpoints, EndpointsList, ListMeta, Object, Service, ServiceList,
    Versioned,
};
use crate::labels::Selector;
use crate::storage::backend::{KvAction, KvError, KvEvent, KvNode, KvStore, KvWatch};
use crate::watch::{Event, EventType, WatchStream};

const SERVICE_PREFIX: &str = "/registry/services/specs";
const ENDPOINTS_PREFIX: &str = "/registry/services/endpoints";

fn key_for(prefix: &str, ctx: &Context, name: &str) -> String {
    format!("{prefix}/{}/{name}", ctx.namespace())
}

fn dir_for(prefix: &str, ctx: &Context) -> String {
    format!("{prefix}/{}/", ctx.namespace())
}

/// Translate a store error into the registry's uniform error.
fn translate(err: KvError, kind: &str, name: &str) -> RegistryError {
    match err {
        KvError::KeyNotFound(_) => RegistryError::not_found(kind, name),
        KvError::NodeExists(_) => RegistryError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        KvError::TestFailed { message, .. } => RegistryError::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            message: format!("resource version mismatch {message}"),
        },
        KvError::IndexCleared => RegistryError::Expired {
            message: err.to_string(),
        },
        other => {
            warn!("storage error on {} {:?}: {}", kind, name, other);
            RegistryError::internal(other.to_string())
        }
    }
}

/// Decode a stored value, filling in its resource version.
fn decode<T: Object>(node: &KvNode) -> Result<T, RegistryError> {
    let envelope: Versioned<T> = serde_json::from_str(&node.value).map_err(|e| {
        RegistryError::internal(format!("decoding {} at {}: {e}", T::KIND, node.key))
    })?;
    let mut object = envelope.object;
    object.metadata_mut().resource_version = node.modified_index;
    Ok(object)
}

/// Translate one store event into a watch event, or `None` if the object
/// does not satisfy the selectors.
fn to_event<T: Object>(
    event: &KvEvent,
    label: &Selector,
    field: &Selector,
) -> Option<Result<Event<T>, RegistryError>> {
    let (kind, decoded) = match event.action {
        KvAction::Created => (EventType::Added, decode::<T>(&event.node)),
        KvAction::Updated => (EventType::Modified, decode::<T>(&event.node)),
        KvAction::Deleted => {
            let prev = event.prev.as_ref()?;
            let decoded = decode::<T>(prev).map(|mut obj| {
                obj.metadata_mut().resource_version = event.node.modified_index;
                obj
            });
            (EventType::Deleted, decoded)
        }
    };
    match decoded {
        Ok(object) => {
            if label.matches(&object.metadata().labels) && field.matches(&object.fields()) {
                Some(Ok(Event::new(kind, object)))
            } else {
                None
            }
        }
        Err(e) => Some(Err(e)),
    }
}

fn watch_objects<T: Object>(events: KvWatch, label: Selector, field: Selector) -> WatchStream<T> {
    events
        .filter_map(move |item| {
            let out = match item {
                Ok(event) => to_event::<T>(&event, &label, &field),
                Err(err) => Some(Err(translate(err, T::KIND, ""))),
            };
            future::ready(out)
        })
        .boxed()
}

/// Registry for services and endpoints on top of a key-value store.
pub struct KvServiceRegistry {
    store: Arc<dyn KvStore>,
    version: ApiVersion,
}

impl KvServiceRegistry {
    /// Create a registry writing objects stamped with `version`.
    pub fn new(store: Arc<dyn KvStore>, version: ApiVersion) -> Self {
        Self { store, version }
    }

    fn encode<T: Object>(&self, object: &T) -> Result<String, RegistryError> {
        let mut object = object.clone();
        object.metadata_mut().resource_version = 0;
        serde_json::to_string(&Versioned::new(self.version, object))
            .map_err(|e| RegistryError::internal(format!("encoding {}: {e}", T::KIND)))
    }

    async fn list_objects<T: Object>(
        &self,
        prefix: &str,
        ctx: &Context,
    ) -> Result<(Vec<T>, u64), RegistryError> {
        let listing = self
            .store
            .list(&dir_for(prefix, ctx))
            .await
            .map_err(|e| translate(e, T::KIND, ""))?;
        let items = listing
            .nodes
            .iter()
            .map(decode::<T>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, listing.index))
    }

    async fn get_object<T: Object>(
        &self,
        prefix: &str,
        ctx: &Context,
        name: &str,
    ) -> Result<T, RegistryError> {
        let node = self
            .store
            .get(&key_for(prefix, ctx, name))
            .await
            .map_err(|e| translate(e, T::KIND, name))?;
        decode(&node)
    }

    async fn create_object<T: Object>(
        &self,
        prefix: &str,
        ctx: &Context,
        mut object: T,
    ) -> Result<T, RegistryError> {
        let meta = object.metadata_mut();
        meta.namespace = ctx.namespace().to_string();
        meta.uid = uuid::Uuid::new_v4().to_string();
        meta.creation_timestamp = Some(Utc::now());
        let name = meta.name.clone();

        let value = self.encode(&object)?;
        let node = self
            .store
            .create(&key_for(prefix, ctx, &name), value)
            .await
            .map_err(|e| translate(e, T::KIND, &name))?;
        object.metadata_mut().resource_version = node.modified_index;
        Ok(object)
    }

    /// Replace an existing object.  A non-zero resource version on `object`
    /// must match the stored one.  Identity fields are carried over from
    /// the stored object.
    async fn update_object<T: Object>(
        &self,
        prefix: &str,
        ctx: &Context,
        mut object: T,
    ) -> Result<T, RegistryError> {
        let name = object.metadata().name.clone();
        let key = key_for(prefix, ctx, &name);
        let current = self
            .store
            .get(&key)
            .await
            .map_err(|e| translate(e, T::KIND, &name))?;
        let existing: T = decode(&current)?;

        let requested = object.metadata().resource_version;
        if requested != 0 && requested != current.modified_index {
            return Err(RegistryError::Conflict {
                kind: T::KIND.to_string(),
                name,
                message: format!(
                    "resource version {requested} does not match current {}",
                    current.modified_index
                ),
            });
        }

        let meta = object.metadata_mut();
        meta.namespace = ctx.namespace().to_string();
        meta.uid = existing.metadata().uid.clone();
        meta.creation_timestamp = existing.metadata().creation_timestamp;

        let value = self.encode(&object)?;
        let node = self
            .store
            .compare_and_swap(&key, value, current.modified_index)
            .await
            .map_err(|e| translate(e, T::KIND, &name))?;
        object.metadata_mut().resource_version = node.modified_index;
        Ok(object)
    }

    fn watch_prefix<T: Object>(
        &self,
        prefix: &str,
        ctx: &Context,
        label: Selector,
        field: Selector,
        resource_version: Option<u64>,
    ) -> WatchStream<T> {
        let events = self.store.watch(&dir_for(prefix, ctx), resource_version);
        watch_objects(events, label, field)
    }
}

impl ServiceRegistry for KvServiceRegistry {
    fn list_services<'a>(&'a self, ctx: &'a Context) -> RegistryFuture<'a, ServiceList> {
        Box::pin(async move {
            let (items, index) = self.list_objects(SERVICE_PREFIX, ctx).await?;
            Ok(ServiceList {
                metadata: ListMeta {
                    resource_version: index,
                },
                items,
            })
        })
    }

    fn get_service<'a>(&'a self, ctx: &'a Context, name: &'a str) -> RegistryFuture<'a, Service> {
        Box::pin(async move { self.get_object(SERVICE_PREFIX, ctx, name).await })
    }

    /// Creating a service also creates its (empty) endpoints so that
    /// `update_endpoints` has an object to replace.
    fn create_service<'a>(
        &'a self,
        ctx: &'a Context,
        service: Service,
    ) -> RegistryFuture<'a, Service> {
        Box::pin(async move {
            let created = self.create_object(SERVICE_PREFIX, ctx, service).await?;
            let endpoints = Endpoints::new(created.metadata.name.clone(), Vec::new());
            match self.create_object(ENDPOINTS_PREFIX, ctx, endpoints).await {
                // Left over from an earlier service of the same name.
                Ok(_) | Err(RegistryError::AlreadyExists { .. }) => Ok(created),
                Err(e) => Err(e),
            }
        })
    }

    fn update_service<'a>(
        &'a self,
        ctx: &'a Context,
        service: Service,
    ) -> RegistryFuture<'a, Service> {
        Box::pin(async move { self.update_object(SERVICE_PREFIX, ctx, service).await })
    }

    fn delete_service<'a>(&'a self, ctx: &'a Context, name: &'a str) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.store
                .delete(&key_for(SERVICE_PREFIX, ctx, name))
                .await
                .map_err(|e| translate(e, "Service", name))?;
            match self.store.delete(&key_for(ENDPOINTS_PREFIX, ctx, name)).await {
                Ok(_) | Err(KvError::KeyNotFound(_)) => Ok(()),
                Err(e) => Err(translate(e, "Endpoints", name)),
            }
        })
    }

    fn watch_services<'a>(
        &'a self,
        ctx: &'a Context,
        label: Selector,
        field: Selector,
        resource_version: Option<u64>,
    ) -> RegistryFuture<'a, WatchStream<Service>> {
        Box::pin(async move {
            Ok(self.watch_prefix(SERVICE_PREFIX, ctx, label, field, resource_version))
        })
    }

    fn list_endpoints<'a>(&'a self, ctx: &'a Context) -> RegistryFuture<'a, EndpointsList> {
        Box::pin(async move {
            let (items, index) = self.list_objects(ENDPOINTS_PREFIX, ctx).await?;
            Ok(EndpointsList {
                metadata: ListMeta {
                    resource_version: index,
                },
                items,
            })
        })
    }

    fn get_endpoints<'a>(
        &'a self,
        ctx: &'a Context,
        name: &'a str,
    ) -> RegistryFuture<'a, Endpoints> {
        Box::pin(async move { self.get_object(ENDPOINTS_PREFIX, ctx, name).await })
    }

    fn update_endpoints<'a>(
        &'a self,
        ctx: &'a Context,
        endpoints: Endpoints,
    ) -> RegistryFuture<'a, Endpoints> {
        Box::pin(async move { self.update_object(ENDPOINTS_PREFIX, ctx, endpoints).await })
    }

    fn watch_endpoints<'a>(
        &'a self,
        ctx: &'a Context,
        label: Selector,
        field: Selector,
        resource_version: Option<u64>,
    ) -> RegistryFuture<'a, WatchStream<Endpoints>> {
        Box::pin(async move {
            Ok(self.watch_prefix(ENDPOINTS_PREFIX, ctx, label, field, resource_version))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryKv;
    use std::time::Duration;

    fn registry() -> (Arc<MemoryKv>, KvServiceRegistry) {
        let kv = Arc::new(MemoryKv::new());
        let registry = KvServiceRegistry::new(kv.clone(), ApiVersion::V1beta1);
        (kv, registry)
    }

    fn labelled(name: &str, app: &str) -> Service {
        let mut svc = Service::new(name, 80);
        svc.metadata.labels.insert("app".into(), app.into());
        svc
    }

    async fn next<T>(stream: &mut WatchStream<T>) -> Event<T> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("watch error")
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (kv, registry) = registry();
        let ctx = Context::default();
        let created = registry
            .create_service(&ctx, Service::new("frontend", 80))
            .await
            .unwrap();
        assert!(created.metadata.resource_version > 0);
        assert!(!created.metadata.uid.is_empty());
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(created.metadata.namespace, "default");

        let got = registry.get_service(&ctx, "frontend").await.unwrap();
        assert_eq!(got, created);

        // Stored value carries the storage version and no resource version.
        let raw = kv
            .get("/registry/services/specs/default/frontend")
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw.value).unwrap();
        assert_eq!(json["apiVersion"], "v1beta1");
        assert_eq!(json["kind"], "Service");
        assert!(json["metadata"].get("resourceVersion").is_none());
    }

    #[tokio::test]
    async fn test_create_also_creates_empty_endpoints() {
        let (_, registry) = registry();
        let ctx = Context::default();
        registry
            .create_service(&ctx, Service::new("frontend", 80))
            .await
            .unwrap();
        let e = registry.get_endpoints(&ctx, "frontend").await.unwrap();
        assert!(e.endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let (_, registry) = registry();
        let ctx = Context::default();
        registry
            .create_service(&ctx, Service::new("a", 80))
            .await
            .unwrap();
        let err = registry
            .create_service(&ctx, Service::new("a", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let (_, registry) = registry();
        let prod = Context::new("prod");
        let dev = Context::new("dev");
        registry
            .create_service(&prod, Service::new("a", 80))
            .await
            .unwrap();

        assert_eq!(registry.list_services(&prod).await.unwrap().items.len(), 1);
        assert!(registry.list_services(&dev).await.unwrap().items.is_empty());
        assert!(matches!(
            registry.get_service(&dev, "a").await,
            Err(RegistryError::NotFound { .. })
        ));
        assert!(registry.delete_service(&dev, "a").await.is_err());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (_, registry) = registry();
        let err = registry
            .update_service(&Context::default(), Service::new("ghost", 80))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::not_found("Service", "ghost"));

        let err = registry
            .update_endpoints(&Context::default(), Endpoints::new("ghost", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::not_found("Endpoints", "ghost"));
    }

    #[tokio::test]
    async fn test_update_checks_resource_version() {
        let (_, registry) = registry();
        let ctx = Context::default();
        let created = registry
            .create_service(&ctx, Service::new("a", 80))
            .await
            .unwrap();

        let mut next_version = created.clone();
        next_version.spec.port = 81;
        let updated = registry
            .update_service(&ctx, next_version.clone())
            .await
            .unwrap();
        assert!(updated.metadata.resource_version > created.metadata.resource_version);
        assert_eq!(updated.metadata.uid, created.metadata.uid);

        // Re-using the stale version conflicts.
        let err = registry
            .update_service(&ctx, next_version)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));

        // Zero version means "whatever is current".
        let mut unversioned = Service::new("a", 82);
        unversioned.metadata.resource_version = 0;
        let updated = registry.update_service(&ctx, unversioned).await.unwrap();
        assert_eq!(updated.spec.port, 82);
        assert_eq!(updated.metadata.uid, created.metadata.uid);
    }

    #[tokio::test]
    async fn test_delete_removes_endpoints() {
        let (_, registry) = registry();
        let ctx = Context::default();
        registry
            .create_service(&ctx, Service::new("a", 80))
            .await
            .unwrap();
        registry.delete_service(&ctx, "a").await.unwrap();
        assert!(registry.get_service(&ctx, "a").await.is_err());
        assert!(registry.get_endpoints(&ctx, "a").await.is_err());
        assert_eq!(
            registry.delete_service(&ctx, "a").await,
            Err(RegistryError::not_found("Service", "a"))
        );
    }

    #[tokio::test]
    async fn test_list_resource_version_tracks_store() {
        let (kv, registry) = registry();
        let ctx = Context::default();
        registry
            .create_service(&ctx, Service::new("b", 80))
            .await
            .unwrap();
        registry
            .create_service(&ctx, Service::new("a", 80))
            .await
            .unwrap();
        let list = registry.list_services(&ctx).await.unwrap();
        let names: Vec<_> = list.items.iter().map(|s| s.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(list.metadata.resource_version, kv.index());
    }

    #[tokio::test]
    async fn test_watch_applies_selectors() {
        let (_, registry) = registry();
        let ctx = Context::default();
        let mut stream = registry
            .watch_services(
                &ctx,
                Selector::parse("app=web").unwrap(),
                Selector::everything(),
                None,
            )
            .await
            .unwrap();

        registry.create_service(&ctx, labelled("db", "db")).await.unwrap();
        let web = registry
            .create_service(&ctx, labelled("web", "web"))
            .await
            .unwrap();
        registry.delete_service(&ctx, "web").await.unwrap();

        let ev = next(&mut stream).await;
        assert_eq!(ev.kind, EventType::Added);
        assert_eq!(ev.object.metadata.name, "web");
        assert_eq!(ev.object.metadata.resource_version, web.metadata.resource_version);

        let ev = next(&mut stream).await;
        assert_eq!(ev.kind, EventType::Deleted);
        assert_eq!(ev.object.metadata.name, "web");
        assert!(ev.object.metadata.resource_version > web.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_watch_field_selector() {
        let (_, registry) = registry();
        let ctx = Context::default();
        let mut stream = registry
            .watch_services(
                &ctx,
                Selector::everything(),
                Selector::parse("name=b").unwrap(),
                Some(0),
            )
            .await
            .unwrap();
        registry.create_service(&ctx, Service::new("a", 80)).await.unwrap();
        registry.create_service(&ctx, Service::new("b", 80)).await.unwrap();
        let ev = next(&mut stream).await;
        assert_eq!(ev.object.metadata.name, "b");
    }

    #[tokio::test]
    async fn test_watch_resumes_from_resource_version() {
        let (_, registry) = registry();
        let ctx = Context::default();
        let first = registry
            .create_service(&ctx, Service::new("a", 80))
            .await
            .unwrap();
        let mut changed = first.clone();
        changed.spec.port = 90;
        registry.update_service(&ctx, changed).await.unwrap();

        let mut stream = registry
            .watch_services(
                &ctx,
                Selector::everything(),
                Selector::everything(),
                Some(first.metadata.resource_version),
            )
            .await
            .unwrap();
        let ev = next(&mut stream).await;
        assert_eq!(ev.kind, EventType::Modified);
        assert_eq!(ev.object.spec.port, 90);
    }

    #[tokio::test]
    async fn test_watch_expired_resource_version() {
        let kv = Arc::new(MemoryKv::with_history(1));
        let registry = KvServiceRegistry::new(kv, ApiVersion::V1beta2);
        let ctx = Context::default();
        for name in ["a", "b", "c"] {
            registry
                .create_service(&ctx, Service::new(name, 80))
                .await
                .unwrap();
        }
        let mut stream = registry
            .watch_services(&ctx, Selector::everything(), Selector::everything(), Some(1))
            .await
            .unwrap();
        let item = stream.next().await.unwrap();
        assert!(matches!(item, Err(RegistryError::Expired { .. })));
    }

    #[tokio::test]
    async fn test_endpoints_watch_and_update() {
        let (_, registry) = registry();
        let ctx = Context::default();
        registry
            .create_service(&ctx, Service::new("a", 80))
            .await
            .unwrap();
        let mut stream = registry
            .watch_endpoints(&ctx, Selector::everything(), Selector::everything(), None)
            .await
            .unwrap();

        let updated = registry
            .update_endpoints(&ctx, Endpoints::new("a", vec!["10.0.0.1:8080".into()]))
            .await
            .unwrap();
        assert_eq!(updated.endpoints, vec!["10.0.0.1:8080".to_string()]);

        let ev = next(&mut stream).await;
        assert_eq!(ev.kind, EventType::Modified);
        assert_eq!(ev.object.endpoints, updated.endpoints);

        let list = registry.list_endpoints(&ctx).await.unwrap();
        assert_eq!(list.items.len(), 1);
    }
}
