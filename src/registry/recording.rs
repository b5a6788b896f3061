//! A [`ServiceRegistry`] double that keeps everything in memory and records
//! how it was called.
//!
//! The double holds a canned service, service list, endpoints and endpoints
//! list.  When built with an injected error it still records the call but
//! returns that error, unchanged, from every method.  Tests read the record
//! through [`RecordingServiceRegistry::call_log`], which returns a snapshot
//! value rather than exposing the live fields.

use std::sync::{Mutex, MutexGuard};

use super::{RegistryError, RegistryFuture, ServiceRegistry};
use crate::api::{Context, Endpoints, EndpointsList, Kind, Service, ServiceList};
use crate::labels::Selector;
use crate::watch::{self, WatchStream};

/// What the double has been asked to do so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallLog {
    /// Name passed to the last `delete_service`.
    pub deleted: Option<String>,
    /// Name passed to the last `get_service` or `get_endpoints`.
    pub gotten: Option<String>,
    /// Name carried by the object passed to the last `update_service`.
    pub updated: Option<String>,
    /// Every service passed to `create_service`, in call order.
    pub created: Vec<Service>,
}

#[derive(Default)]
struct State {
    log: CallLog,
    service: Option<Service>,
    services: ServiceList,
    endpoints: Endpoints,
    endpoints_list: EndpointsList,
}

#[derive(Default)]
pub struct RecordingServiceRegistry {
    state: Mutex<State>,
    err: Option<RegistryError>,
}

impl RecordingServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose every call fails with `err`.
    pub fn failing(err: RegistryError) -> Self {
        Self {
            err: Some(err),
            ..Self::default()
        }
    }

    /// Seed the service returned by `get_service`.
    pub fn with_service(self, service: Service) -> Self {
        self.state().service = Some(service);
        self
    }

    /// Seed the list returned by `list_services`.
    pub fn with_services(self, services: Vec<Service>) -> Self {
        self.state().services.items = services;
        self
    }

    /// Seed the endpoints returned by `get_endpoints`.
    pub fn with_endpoints(self, endpoints: Endpoints) -> Self {
        self.state().endpoints = endpoints;
        self
    }

    /// Seed the list returned by `list_endpoints`.
    pub fn with_endpoints_list(self, items: Vec<Endpoints>) -> Self {
        self.state().endpoints_list.items = items;
        self
    }

    /// Snapshot of the calls recorded so far.
    pub fn call_log(&self) -> CallLog {
        self.state().log.clone()
    }

    /// Endpoints most recently stored by `update_endpoints`.
    pub fn endpoints(&self) -> Endpoints {
        self.state().endpoints.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn result<T>(&self, value: T) -> Result<T, RegistryError> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(value),
        }
    }
}

impl ServiceRegistry for RecordingServiceRegistry {
    fn list_services<'a>(&'a self, _ctx: &'a Context) -> RegistryFuture<'a, ServiceList> {
        Box::pin(async move {
            let list = self.state().services.clone();
            self.result(list)
        })
    }

    fn get_service<'a>(&'a self, _ctx: &'a Context, name: &'a str) -> RegistryFuture<'a, Service> {
        Box::pin(async move {
            let service = {
                let mut state = self.state();
                state.log.gotten = Some(name.to_string());
                state.service.clone()
            };
            self.result(())?;
            service.ok_or_else(|| RegistryError::not_found(Service::KIND, name))
        })
    }

    fn create_service<'a>(
        &'a self,
        _ctx: &'a Context,
        service: Service,
    ) -> RegistryFuture<'a, Service> {
        Box::pin(async move {
            {
                let mut state = self.state();
                state.service = Some(service.clone());
                state.services.items.push(service.clone());
                state.log.created.push(service.clone());
            }
            self.result(service)
        })
    }

    fn update_service<'a>(
        &'a self,
        _ctx: &'a Context,
        service: Service,
    ) -> RegistryFuture<'a, Service> {
        Box::pin(async move {
            self.state().log.updated = Some(service.metadata.name.clone());
            self.result(service)
        })
    }

    fn delete_service<'a>(&'a self, _ctx: &'a Context, name: &'a str) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.state().log.deleted = Some(name.to_string());
            self.result(())
        })
    }

    fn watch_services<'a>(
        &'a self,
        _ctx: &'a Context,
        _label: Selector,
        _field: Selector,
        _resource_version: Option<u64>,
    ) -> RegistryFuture<'a, WatchStream<Service>> {
        Box::pin(async move { self.result(watch::empty()) })
    }

    fn list_endpoints<'a>(&'a self, _ctx: &'a Context) -> RegistryFuture<'a, EndpointsList> {
        Box::pin(async move {
            let list = self.state().endpoints_list.clone();
            self.result(list)
        })
    }

    fn get_endpoints<'a>(
        &'a self,
        _ctx: &'a Context,
        name: &'a str,
    ) -> RegistryFuture<'a, Endpoints> {
        Box::pin(async move {
            let endpoints = {
                let mut state = self.state();
                state.log.gotten = Some(name.to_string());
                state.endpoints.clone()
            };
            self.result(endpoints)
        })
    }

    fn update_endpoints<'a>(
        &'a self,
        _ctx: &'a Context,
        endpoints: Endpoints,
    ) -> RegistryFuture<'a, Endpoints> {
        Box::pin(async move {
            self.state().endpoints = endpoints.clone();
            self.result(endpoints)
        })
    }

    fn watch_endpoints<'a>(
        &'a self,
        _ctx: &'a Context,
        _label: Selector,
        _field: Selector,
        _resource_version: Option<u64>,
    ) -> RegistryFuture<'a, WatchStream<Endpoints>> {
        Box::pin(async move { self.result(watch::empty()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn ctx() -> Context {
        Context::default()
    }

    #[tokio::test]
    async fn test_create_appends_to_list() {
        let registry = RecordingServiceRegistry::new();
        let svc = Service::new("frontend", 80);
        registry.create_service(&ctx(), svc.clone()).await.unwrap();

        let list = registry.list_services(&ctx()).await.unwrap();
        assert_eq!(list.items, vec![svc.clone()]);
        assert_eq!(registry.call_log().created, vec![svc]);
    }

    #[tokio::test]
    async fn test_records_names() {
        let registry = RecordingServiceRegistry::new().with_service(Service::new("foo", 80));

        let got = registry.get_service(&ctx(), "foo").await.unwrap();
        assert_eq!(got.metadata.name, "foo");
        registry.delete_service(&ctx(), "bar").await.unwrap();
        registry
            .update_service(&ctx(), Service::new("baz", 81))
            .await
            .unwrap();

        let log = registry.call_log();
        assert_eq!(log.gotten.as_deref(), Some("foo"));
        assert_eq!(log.deleted.as_deref(), Some("bar"));
        assert_eq!(log.updated.as_deref(), Some("baz"));
    }

    #[tokio::test]
    async fn test_get_without_seed_is_not_found() {
        let registry = RecordingServiceRegistry::new();
        let err = registry.get_service(&ctx(), "foo").await.unwrap_err();
        assert_eq!(err, RegistryError::not_found("Service", "foo"));
        assert_eq!(registry.call_log().gotten.as_deref(), Some("foo"));
    }

    #[tokio::test]
    async fn test_endpoints_sub_resource() {
        let registry = RecordingServiceRegistry::new()
            .with_endpoints_list(vec![Endpoints::new("a", vec!["1.2.3.4:80".into()])]);

        let e = Endpoints::new("foo", vec!["10.0.0.1:80".into()]);
        registry.update_endpoints(&ctx(), e.clone()).await.unwrap();
        assert_eq!(registry.endpoints(), e);
        assert_eq!(registry.get_endpoints(&ctx(), "foo").await.unwrap(), e);
        assert_eq!(registry.call_log().gotten.as_deref(), Some("foo"));
        assert_eq!(registry.list_endpoints(&ctx()).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_without_error_is_empty() {
        let registry = RecordingServiceRegistry::new();
        let mut stream = registry
            .watch_services(&ctx(), Selector::everything(), Selector::everything(), None)
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_injected_error_returned_from_every_call() {
        let err = RegistryError::internal("boom");
        let registry = RecordingServiceRegistry::failing(err.clone())
            .with_service(Service::new("foo", 80));
        let c = ctx();
        let everything = Selector::everything;

        assert_eq!(registry.list_services(&c).await.unwrap_err(), err);
        assert_eq!(registry.get_service(&c, "foo").await.unwrap_err(), err);
        assert_eq!(
            registry
                .create_service(&c, Service::new("foo", 80))
                .await
                .unwrap_err(),
            err
        );
        assert_eq!(
            registry
                .update_service(&c, Service::new("foo", 80))
                .await
                .unwrap_err(),
            err
        );
        assert_eq!(registry.delete_service(&c, "foo").await.unwrap_err(), err);
        assert_eq!(
            registry
                .watch_services(&c, everything(), everything(), None)
                .await
                .err(),
            Some(err.clone())
        );
        assert_eq!(registry.list_endpoints(&c).await.unwrap_err(), err);
        assert_eq!(registry.get_endpoints(&c, "foo").await.unwrap_err(), err);
        assert_eq!(
            registry
                .update_endpoints(&c, Endpoints::new("foo", vec![]))
                .await
                .unwrap_err(),
            err
        );
        assert_eq!(
            registry
                .watch_endpoints(&c, everything(), everything(), Some(3))
                .await
                .err(),
            Some(err.clone())
        );
    }
}
