//! Adapter pool behavior seen through the service: tenant routing,
//! reconnects, eviction and lifecycle callbacks.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;

use common::*;
use helios_entity::adapter::AdapterConfig;
use helios_entity::config::PoolSettings;
use helios_entity::error::{BackendError, EntityError};
use helios_entity::service::EntityService;
use helios_entity::strategy::{
    CollectionPerTenantConfig, FnResolver, SchemaPerTenantConfig, TenancyStrategy,
    TenantResolution,
};
use helios_entity::{DefaultAdapterFactory, QueryParams};

fn flaky_service(attempts: Arc<ConnectAttempts>, settings: PoolSettings) -> EntityService {
    EntityService::builder("posts", posts())
        .with_adapter(AdapterConfig::memory("posts").with_kind("flaky"))
        .with_factory(flaky_factory(attempts))
        .with_pool_settings(settings)
        .build()
        .unwrap()
}

async fn titles(service: &EntityService, ctx: &helios_entity::OperationContext) -> Vec<String> {
    service
        .find(QueryParams::new().with_sort(["title"]), ctx)
        .await
        .unwrap()
        .iter()
        .filter_map(|p| p["title"].as_str().map(str::to_string))
        .collect()
}

// ============================================================================
// Reconnects
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_retries_until_success() {
    let attempts = ConnectAttempts::failing(3);
    let listener = CountingListener::new();
    let service = EntityService::builder("posts", posts())
        .with_adapter(AdapterConfig::memory("posts").with_kind("flaky"))
        .with_factory(flaky_factory(attempts.clone()))
        .with_pool_settings(PoolSettings::new().with_reconnect_delay(Duration::from_secs(5)))
        .with_listener(listener.clone())
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    service
        .create(json!({"title": "Persistent"}), &tenant("acme"))
        .await
        .unwrap();

    assert_eq!(attempts.attempts(), 4);
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert_eq!(listener.connected(), 1);
    assert_eq!(service.pool().len(), 1);
}

#[tokio::test]
async fn test_connect_failure_without_reconnect_propagates() {
    let attempts = ConnectAttempts::failing(1);
    let service = flaky_service(attempts.clone(), PoolSettings::new().with_auto_reconnect(false));
    let ctx = tenant("acme");

    let err = service
        .create(json!({"title": "Too early"}), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EntityError::Backend(BackendError::ConnectionFailed { .. })
    ));
    assert!(!err.is_client_error());
    assert!(service.pool().is_empty());

    // The next call connects afresh.
    service.create(json!({"title": "On time"}), &ctx).await.unwrap();
    assert_eq!(attempts.attempts(), 2);
    assert_eq!(titles(&service, &ctx).await, vec!["On time"]);
}

// ============================================================================
// Sharing and eviction
// ============================================================================

#[tokio::test]
async fn test_concurrent_first_access_connects_once() {
    let listener = CountingListener::new();
    let service = EntityService::builder("posts", posts())
        .with_strategy(TenancyStrategy::CollectionPerTenant(CollectionPerTenantConfig::default()))
        .with_listener(listener.clone())
        .build()
        .unwrap();
    let ctx = tenant("acme");

    let results = join_all(
        (0..8).map(|n| service.create(json!({"title": format!("post {n}")}), &ctx)),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(listener.connected(), 1);
    assert_eq!(service.count(QueryParams::new(), &ctx).await.unwrap(), 8);
}

#[tokio::test]
async fn test_recently_used_tenant_survives_eviction() {
    let listener = CountingListener::new();
    let service = EntityService::builder("posts", posts())
        .with_strategy(TenancyStrategy::CollectionPerTenant(CollectionPerTenantConfig::default()))
        .with_pool_settings(PoolSettings::new().with_max_pool_size(2))
        .with_listener(listener.clone())
        .build()
        .unwrap();

    service.count(QueryParams::new(), &tenant("a")).await.unwrap();
    service.count(QueryParams::new(), &tenant("b")).await.unwrap();
    service.count(QueryParams::new(), &tenant("a")).await.unwrap();
    service.count(QueryParams::new(), &tenant("c")).await.unwrap();

    assert_eq!(
        service.pool().pooled_hashes(),
        vec!["collection:posts_a".to_string(), "collection:posts_c".to_string()]
    );
    assert_eq!(listener.disconnected(), vec!["collection:posts_b".to_string()]);
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let listener = CountingListener::new();
    let service = EntityService::builder("posts", posts())
        .with_strategy(TenancyStrategy::CollectionPerTenant(CollectionPerTenantConfig::default()))
        .with_listener(listener.clone())
        .build()
        .unwrap();
    for name in ["a", "b", "c"] {
        service.count(QueryParams::new(), &tenant(name)).await.unwrap();
    }

    service.shutdown().await.unwrap();
    assert!(service.pool().is_empty());
    assert_eq!(listener.disconnected().len(), 3);
}

// ============================================================================
// Tenant isolation
// ============================================================================

async fn assert_isolated(service: &EntityService) {
    let acme = tenant("acme");
    let globex = tenant("globex");
    service.create(json!({"title": "Acme post"}), &acme).await.unwrap();
    service.create(json!({"title": "Globex post"}), &globex).await.unwrap();

    assert_eq!(titles(service, &acme).await, vec!["Acme post"]);
    assert_eq!(titles(service, &globex).await, vec!["Globex post"]);
}

#[tokio::test]
async fn test_collection_per_tenant_isolates() {
    let service = EntityService::builder("posts", posts())
        .with_strategy(TenancyStrategy::CollectionPerTenant(CollectionPerTenantConfig::default()))
        .build()
        .unwrap();
    assert_isolated(&service).await;
}

#[tokio::test]
async fn test_schema_per_tenant_isolates() {
    let service = EntityService::builder("posts", posts())
        .with_strategy(TenancyStrategy::SchemaPerTenant(SchemaPerTenantConfig::default()))
        .build()
        .unwrap();
    assert_isolated(&service).await;
}

#[tokio::test]
async fn test_database_per_tenant_from_json() {
    let strategy: TenancyStrategy = serde_json::from_value(json!({
        "type": "database_per_tenant",
        "database_prefix": "db_"
    }))
    .unwrap();
    let service = EntityService::builder("posts", posts())
        .with_strategy(strategy)
        .build()
        .unwrap();
    assert_isolated(&service).await;

    let mut hashes = service.pool().pooled_hashes();
    hashes.sort();
    assert_eq!(hashes, vec!["database:db_acme", "database:db_globex"]);
}

#[tokio::test]
async fn test_ids_that_sanitize_alike_stay_isolated() {
    let strategies = [
        TenancyStrategy::DatabasePerTenant(Default::default()),
        TenancyStrategy::SchemaPerTenant(SchemaPerTenantConfig::default()),
        TenancyStrategy::CollectionPerTenant(CollectionPerTenantConfig::default()),
    ];
    for strategy in strategies {
        let service = EntityService::builder("posts", posts())
            .with_strategy(strategy)
            .build()
            .unwrap();
        service
            .create(json!({"title": "secret of acme-corp"}), &tenant("acme-corp"))
            .await
            .unwrap();

        for other in ["ACME_corp", "acme_corp", "acme.corp"] {
            assert!(titles(&service, &tenant(other)).await.is_empty(), "{other} saw acme-corp");
        }
        assert_eq!(titles(&service, &tenant("acme-corp")).await, vec!["secret of acme-corp"]);
        assert_eq!(service.pool().len(), 4);
    }
}

#[tokio::test]
async fn test_single_strategy_shares_data() {
    let service = EntityService::builder("posts", posts()).build().unwrap();
    service.create(json!({"title": "Shared"}), &tenant("acme")).await.unwrap();

    assert_eq!(titles(&service, &tenant("globex")).await, vec!["Shared"]);
    assert_eq!(service.pool().len(), 1);
}

#[tokio::test]
async fn test_custom_resolver_routes_by_meta() {
    let factory = Arc::new(DefaultAdapterFactory::new());
    let resolver = FnResolver::new(|ctx, base: &AdapterConfig| {
        match ctx.meta("region").and_then(|v| v.as_str()) {
            Some(region) => TenantResolution::new(
                format!("region:{region}"),
                base.clone().with_connection(region),
            ),
            None => TenantResolution::shared(base),
        }
    });
    let service = EntityService::builder("posts", posts())
        .with_factory(factory.clone())
        .with_resolver(Arc::new(resolver))
        .build()
        .unwrap();

    let eu = tenant("acme").with_meta("region", json!("eu"));
    let us = tenant("acme").with_meta("region", json!("us"));
    service.create(json!({"title": "Bonjour"}), &eu).await.unwrap();

    assert_eq!(titles(&service, &eu).await, vec!["Bonjour"]);
    assert!(titles(&service, &us).await.is_empty());
    assert_eq!(factory.memory_registry().live_stores(), 2);
}
