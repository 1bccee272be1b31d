//! Explicit construction of an [`EntityService`].

use std::sync::Arc;

use tracing::info;

use crate::access::{AccessPolicy, CapabilityPolicy};
use crate::adapter::{AdapterConfig, AdapterFactory, DefaultAdapterFactory};
use crate::config::{self, PoolSettings, ServiceSettings};
use crate::error::ConfigurationError;
use crate::events::{ChangeNotifier, NoopNotifier};
use crate::field::{Declarations, compile_with};
use crate::pool::{AdapterPool, LifecycleListener};
use crate::scope::{ScopeDefinition, ScopeResolver};
use crate::strategy::{TenancyStrategy, TenantResolver};
use crate::transform::{IdCodec, LookupTransport, Transformer};
use crate::validation::Validator;

use super::EntityService;

/// Builder for [`EntityService`].
///
/// Defaults: an unscoped memory adapter for a collection named after the
/// service, the single-tenant strategy, the capability policy, the identity
/// id codec, no lookup transport and no change notifications.
#[derive(Debug)]
pub struct EntityServiceBuilder {
    name: String,
    declarations: Declarations,
    settings: ServiceSettings,
    adapter: AdapterConfig,
    factory: Option<Arc<dyn AdapterFactory>>,
    resolver: Option<Arc<dyn TenantResolver>>,
    pool_settings: PoolSettings,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    policy: Arc<dyn AccessPolicy>,
    scopes: Vec<(String, ScopeDefinition)>,
    codec: Option<Arc<dyn IdCodec>>,
    transport: Option<Arc<dyn LookupTransport>>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl EntityServiceBuilder {
    /// Creates a builder.
    pub fn new(name: impl Into<String>, declarations: Declarations) -> Self {
        let name = name.into();
        Self {
            adapter: AdapterConfig::memory(name.clone()),
            name,
            declarations,
            settings: ServiceSettings::default(),
            factory: None,
            resolver: None,
            pool_settings: PoolSettings::default(),
            listeners: Vec::new(),
            policy: Arc::new(CapabilityPolicy::new()),
            scopes: Vec::new(),
            codec: None,
            transport: None,
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Sets the service settings.
    pub fn with_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the static adapter configuration. Its id column is overwritten
    /// with the primary key column.
    pub fn with_adapter(mut self, adapter: AdapterConfig) -> Self {
        self.adapter = adapter;
        self
    }

    /// Sets the adapter factory.
    pub fn with_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Routes tenants with a built-in strategy.
    pub fn with_strategy(self, strategy: TenancyStrategy) -> Self {
        self.with_resolver(strategy.into_resolver())
    }

    /// Routes tenants with a custom resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn TenantResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the pool settings.
    pub fn with_pool_settings(mut self, settings: PoolSettings) -> Self {
        self.pool_settings = settings;
        self
    }

    /// Adds an adapter lifecycle listener.
    pub fn with_listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Sets the authorization policy.
    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Declares a scope.
    pub fn with_scope(mut self, name: impl Into<String>, definition: ScopeDefinition) -> Self {
        self.scopes.push((name.into(), definition));
        self
    }

    /// Sets the secure id codec.
    pub fn with_codec(mut self, codec: Arc<dyn IdCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Sets the transport used by lookup populate rules.
    pub fn with_transport(mut self, transport: Arc<dyn LookupTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the change notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Compiles the fields and wires the components together.
    pub fn build(self) -> Result<EntityService, ConfigurationError> {
        config::check(self.settings.validate())?;

        let fields = Arc::new(compile_with(&self.declarations, &self.settings.compile_options())?);

        for name in &self.settings.default_populates {
            if fields.field(name).is_none_or(|f| f.populate.is_none()) {
                return Err(ConfigurationError::InvalidPopulate {
                    field: name.clone(),
                    message: "default populate names no field with a populate rule".to_string(),
                });
            }
        }

        let validator = Validator::new(
            Arc::clone(&fields),
            Arc::clone(&self.policy),
            self.settings.strictness,
            self.settings.convert,
        )?;

        let scopes = self
            .scopes
            .into_iter()
            .fold(ScopeResolver::new(Arc::clone(&self.policy)), |resolver, (name, definition)| {
                resolver.with_scope(name, definition)
            })
            .with_default_scopes(self.settings.default_scopes.clone())?;

        let mut base = self.adapter;
        base.id_column = fields.primary().column_name.clone();
        let factory: Arc<dyn AdapterFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(DefaultAdapterFactory::new()),
        };
        let mut pool = AdapterPool::new(base, factory).with_settings(self.pool_settings)?;
        if let Some(resolver) = self.resolver {
            pool = pool.with_resolver(resolver);
        }
        for listener in self.listeners {
            pool = pool.with_listener(listener);
        }

        let mut transformer = Transformer::new(Arc::clone(&fields), self.policy)
            .with_default_populates(self.settings.default_populates.clone())
            .with_populate_max_depth(self.settings.populate_max_depth);
        if let Some(codec) = self.codec {
            transformer = transformer.with_codec(codec);
        }
        if let Some(transport) = self.transport {
            transformer = transformer.with_transport(transport);
        }

        info!(
            service = %self.name,
            fields = fields.fields().len(),
            primary_key = %fields.primary().name,
            soft_delete = fields.soft_delete(),
            "Entity service built"
        );

        Ok(EntityService {
            name: self.name,
            settings: self.settings,
            fields,
            validator,
            scopes,
            pool,
            transformer,
            notifier: self.notifier,
        })
    }
}
