//! In-process routing of populate lookups.
//!
//! A lookup action has the form `<service>.resolve`. The registry resolves
//! the requested ids on the named service with `mapping` enabled, so nested
//! population recurses across services without a message broker.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ConfigurationError, EntityResult};
use crate::tenant::OperationContext;
use crate::transform::{LookupRequest, LookupTransport};

use super::{EntityService, ResolveParams};

type Services = RwLock<HashMap<String, Arc<EntityService>>>;

/// Registered services, by name.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use helios_entity::field::Declarations;
/// use helios_entity::service::{EntityService, ServiceRegistry};
///
/// let registry = ServiceRegistry::new();
/// let users = EntityService::builder("users", Declarations::new().field("name", "string"))
///     .with_transport(registry.transport())
///     .build()
///     .unwrap();
/// registry.register(Arc::new(users));
/// assert!(registry.get("users").is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<Services>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service under its name, returning the one it replaces.
    pub fn register(&self, service: Arc<EntityService>) -> Option<Arc<EntityService>> {
        let name = service.name().to_string();
        debug!(service = %name, "Registered entity service");
        self.services.write().insert(name, service)
    }

    /// Returns the service registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<EntityService>> {
        self.services.read().get(name).cloned()
    }

    /// Returns the registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns a transport routing lookups to the registered services.
    ///
    /// The transport does not keep the services alive, so services may hold
    /// it without forming a reference cycle.
    pub fn transport(&self) -> Arc<dyn LookupTransport> {
        Arc::new(RegistryTransport {
            services: Arc::downgrade(&self.services),
        })
    }
}

#[derive(Debug)]
struct RegistryTransport {
    services: Weak<Services>,
}

impl RegistryTransport {
    fn service(&self, action: &str) -> EntityResult<Arc<EntityService>> {
        let unknown = || ConfigurationError::UnknownAction {
            action: action.to_string(),
        };
        let (name, method) = action.split_once('.').ok_or_else(unknown)?;
        if method != "resolve" {
            return Err(unknown().into());
        }
        let services = self.services.upgrade().ok_or_else(unknown)?;
        let found = services.read().get(name).cloned();
        found.ok_or_else(|| unknown().into())
    }
}

#[async_trait]
impl LookupTransport for RegistryTransport {
    async fn lookup(
        &self,
        action: &str,
        request: LookupRequest,
        ctx: &OperationContext,
    ) -> EntityResult<Map<String, Value>> {
        let service = self.service(action)?;

        let mut params = ResolveParams::new(Value::Array(request.ids)).mapping();
        params.fields = request.fields;
        params.populate = request.populate;
        if let Some(scope) = request.params.get("scope") {
            params.scope = Some(serde_json::from_value(scope.clone())?);
        }

        match service.resolve(params, ctx).await? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::field::Declarations;

    fn users() -> Arc<EntityService> {
        Arc::new(
            EntityService::builder("users", Declarations::new().field("name", "string"))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_register_and_replace() {
        let registry = ServiceRegistry::new();
        assert!(registry.register(users()).is_none());
        assert!(registry.register(users()).is_some());
        assert_eq!(registry.names(), vec!["users"]);
    }

    #[tokio::test]
    async fn test_lookup_routes_to_resolve() {
        let registry = ServiceRegistry::new();
        let service = users();
        registry.register(Arc::clone(&service));
        let ctx = OperationContext::system();
        let ann = service.create(json!({"name": "Ann"}), &ctx).await.unwrap();

        let request = LookupRequest {
            ids: vec![ann["id"].clone(), json!("nobody")],
            ..LookupRequest::default()
        };
        let found = registry
            .transport()
            .lookup("users.resolve", request, &ctx)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[ann["id"].as_str().unwrap()]["name"], json!("Ann"));
    }

    #[tokio::test]
    async fn test_unknown_actions() {
        let registry = ServiceRegistry::new();
        registry.register(users());
        let transport = registry.transport();
        let ctx = OperationContext::system();

        for action in ["posts.resolve", "users.find", "users"] {
            let err = transport
                .lookup(action, LookupRequest::default(), &ctx)
                .await
                .unwrap_err();
            assert!(err.to_string().contains(action));
        }
    }

    #[tokio::test]
    async fn test_dropped_registry_releases_services() {
        let transport = {
            let registry = ServiceRegistry::new();
            registry.register(users());
            registry.transport()
        };
        let err = transport
            .lookup("users.resolve", LookupRequest::default(), &OperationContext::system())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::EntityError::Configuration(ConfigurationError::UnknownAction { .. })
        ));
    }
}
