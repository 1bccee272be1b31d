//! Helios Entity Layer
//!
//! This crate mediates between a request-handling layer and pluggable storage
//! backends. A service declares its entities once, as field metadata, and gets
//! consistent create/read/update/replace/remove semantics whichever backend
//! is used.
//!
//! # Features
//!
//! - **Field engine**: declarations compile to immutable descriptors and
//!   per-operation validation schemas
//! - **Validation pipeline**: type checking and conversion, defaults,
//!   lifecycle hooks, readonly/immutable rules, nested objects and arrays
//! - **Scopes**: named, permission-gated filter fragments merged into reads
//! - **Population**: stored ids replaced by the entities they point at
//! - **Multitenancy**: a bounded adapter pool with LRU eviction and four
//!   routing strategies (single, collection, schema and database per tenant)
//!
//! # Backend Features
//!
//! - `sqlite` (default) - SQLite adapter with in-memory and file modes
//!
//! The in-process memory adapter is always available.
//!
//! # Architecture
//!
//! - [`field`] - Declarations, descriptors, hooks and validator schemas
//! - [`validation`] - Per-operation write validation and sanitization
//! - [`params`] - Query parameters accepted from the host
//! - [`access`] - Field and scope authorization hooks
//! - [`scope`] - Scope resolution
//! - [`adapter`] - Backend contract and bundled adapters
//! - [`strategy`] - Tenant routing strategies
//! - [`pool`] - The adapter pool
//! - [`transform`] - Read-path transformation and population
//! - [`events`] - Change notifications
//! - [`service`] - The orchestration layer
//! - [`config`] - Service and pool settings
//! - [`error`] - Error types for all operations
//!
//! # Quick Start
//!
//! ```
//! use helios_entity::field::{Declarations, FieldSpec, FieldType};
//! use helios_entity::service::{EntityService, ResolveParams};
//! use helios_entity::tenant::OperationContext;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let users = EntityService::builder(
//!     "users",
//!     Declarations::new()
//!         .field("name", "string|required|min:2")
//!         .field("email", "email|required")
//!         .field("password", FieldSpec::new(FieldType::String).hidden(helios_entity::field::Hidden::Always))
//!         .field("status", FieldSpec::new(FieldType::String).default_value(json!("active"))),
//! )
//! .build()
//! .unwrap();
//!
//! let ctx = OperationContext::for_tenant("acme");
//! let user = users
//!     .create(json!({"name": "Ann", "email": "ann@example.com", "password": "secret"}), &ctx)
//!     .await
//!     .unwrap();
//! assert_eq!(user["status"], json!("active"));
//! assert!(user.get("password").is_none());
//!
//! let same = users.resolve(ResolveParams::new(user["id"].clone()), &ctx).await.unwrap();
//! assert_eq!(same, user);
//! # });
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod access;
pub mod adapter;
pub mod config;
pub mod error;
pub mod events;
pub mod field;
pub mod params;
pub mod pool;
pub mod scope;
pub mod service;
pub mod strategy;
pub mod tenant;
pub mod transform;
pub mod validation;

// Re-export commonly used types at crate root
pub use error::{EntityError, EntityResult};
pub use params::QueryParams;
pub use tenant::{Capabilities, OperationContext, TenantId};

pub use adapter::{Adapter, AdapterConfig, AdapterFactory, DefaultAdapterFactory, Document};
pub use field::{Declarations, FieldSpec, FieldType, Hook, HookArgs, Operation};
pub use pool::AdapterPool;
pub use service::{EntityService, EntityServiceBuilder, ResolveParams, ServiceRegistry};

// Re-export tenancy strategies
pub use strategy::{
    CollectionPerTenantConfig, DatabasePerTenantConfig, IsolationLevel, SchemaPerTenantConfig,
    TenancyStrategy, TenantResolution, TenantResolver,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
