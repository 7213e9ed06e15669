//! Service registry.

use crate::error::ServerError;
use crate::handler::Handler;
use muxrpc_protocol::validate_service_name;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps service names to their handlers.
///
/// Handlers can be swapped while connections are live; calls already
/// dispatched keep running on the handler they were given.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `service`, returning the handler it
    /// replaced, if any.
    pub fn register<H: Handler>(
        &self,
        service: impl Into<String>,
        handler: H,
    ) -> Result<Option<Arc<dyn Handler>>, ServerError> {
        self.register_shared(service, Arc::new(handler))
    }

    /// Like [`ServiceRegistry::register`] for an already shared handler.
    pub fn register_shared(
        &self,
        service: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<Option<Arc<dyn Handler>>, ServerError> {
        let service = service.into();
        validate_service_name(&service)
            .map_err(|_| ServerError::InvalidServiceName(service.clone()))?;

        let previous = self.services.write().insert(service.clone(), handler);
        if previous.is_some() {
            tracing::info!("Replaced handler for service {}", service);
        } else {
            tracing::debug!("Registered service {}", service);
        }
        Ok(previous)
    }

    /// Removes the handler registered under `service`.
    pub fn unregister(&self, service: &str) -> Option<Arc<dyn Handler>> {
        self.services.write().remove(service)
    }

    /// Returns the handler registered under `service`.
    pub fn lookup(&self, service: &str) -> Option<Arc<dyn Handler>> {
        self.services.read().get(service).cloned()
    }

    /// Returns the registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{test_callback, Callback};
    use bytes::Bytes;
    use muxrpc_protocol::Response;

    fn labelled(label: &'static str) -> impl Handler {
        move |_method: String, _param: Bytes, callback: Callback| callback.success(label)
    }

    fn invoke(handler: &Arc<dyn Handler>) -> Response {
        let (callback, mut rx) = test_callback(1);
        handler.handle("m".to_string(), Bytes::new(), callback);
        rx.try_recv().unwrap().response
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ServiceRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.register("hello", labelled("A")).unwrap().is_none());

        let handler = registry.lookup("hello").unwrap();
        assert_eq!(invoke(&handler), Response::success(1, "A"));
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_replaces_and_returns_previous() {
        let registry = ServiceRegistry::new();
        registry.register("svc", labelled("A")).unwrap();

        let previous = registry.register("svc", labelled("B")).unwrap().unwrap();
        assert_eq!(invoke(&previous), Response::success(1, "A"));

        let current = registry.lookup("svc").unwrap();
        assert_eq!(invoke(&current), Response::success(1, "B"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_shared_returns_same_arc() {
        let registry = ServiceRegistry::new();
        let shared: Arc<dyn Handler> = Arc::new(labelled("A"));
        registry.register_shared("svc", shared.clone()).unwrap();

        let previous = registry.register("svc", labelled("B")).unwrap().unwrap();
        assert!(Arc::ptr_eq(&previous, &shared));
    }

    #[test]
    fn test_invalid_service_names() {
        let registry = ServiceRegistry::new();
        for name in ["", "a.b", "nul\0"] {
            assert!(matches!(
                registry.register(name, labelled("A")),
                Err(ServerError::InvalidServiceName(_))
            ));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister() {
        let registry = ServiceRegistry::new();
        registry.register("b", labelled("B")).unwrap();
        registry.register("a", labelled("A")).unwrap();
        assert_eq!(registry.services(), vec!["a".to_string(), "b".to_string()]);

        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert_eq!(registry.services(), vec!["b".to_string()]);
    }
}
