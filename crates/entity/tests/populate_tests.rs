//! Cross-service population through the service registry.

mod common;

use std::sync::Arc;

use serde_json::{Map, Value, json};

use common::*;
use helios_entity::adapter::id_key;
use helios_entity::config::ServiceSettings;
use helios_entity::error::{ConfigurationError, EntityError};
use helios_entity::field::{Declarations, FieldSpec, FieldType, Hook, PopulateArgs, PopulateRule};
use helios_entity::service::{EntityService, ResolveParams, ServiceRegistry};
use helios_entity::QueryParams;

struct Blog {
    registry: ServiceRegistry,
    orgs: Arc<EntityService>,
    users: Arc<EntityService>,
    comments: Arc<EntityService>,
}

/// orgs <- users.org <- comments.author, all routed through one registry.
/// A comment's author comes back with its org populated.
fn blog() -> Blog {
    let registry = ServiceRegistry::new();
    let orgs = EntityService::builder("orgs", Declarations::new().field("name", "string|required"))
        .with_transport(registry.transport())
        .build()
        .unwrap();
    let users = EntityService::builder(
        "users",
        users().field(
            "org",
            FieldSpec::new(FieldType::String).populate(PopulateRule::lookup("orgs.resolve")),
        ),
    )
    .with_transport(registry.transport())
    .build()
    .unwrap();
    let comments = EntityService::builder(
        "comments",
        Declarations::new().field("text", "string|required").field(
            "author",
            FieldSpec::new(FieldType::String)
                .populate(PopulateRule::lookup("users.resolve").with_populate(["org"])),
        ),
    )
    .with_transport(registry.transport())
    .build()
    .unwrap();

    let blog = Blog {
        registry,
        orgs: Arc::new(orgs),
        users: Arc::new(users),
        comments: Arc::new(comments),
    };
    for service in [&blog.orgs, &blog.users, &blog.comments] {
        blog.registry.register(Arc::clone(service));
    }
    blog
}

#[tokio::test]
async fn test_lookup_through_registry() {
    let blog = blog();
    let ctx = tenant("acme");
    let ann = blog.users.create(json!({"name": "Ann"}), &ctx).await.unwrap();
    blog.comments
        .create(json!({"text": "hi", "author": ann["id"]}), &ctx)
        .await
        .unwrap();
    blog.comments
        .create(json!({"text": "anon"}), &ctx)
        .await
        .unwrap();

    let rows = blog
        .comments
        .find(QueryParams::new().with_populate(["author"]).with_sort(["text"]), &ctx)
        .await
        .unwrap();
    assert_eq!(rows[0]["text"], json!("anon"));
    assert!(rows[0].get("author").is_none());
    assert_eq!(rows[1]["author"], ann);

    // Without populate the raw id comes back.
    let plain = blog.comments.find(QueryParams::new(), &ctx).await.unwrap();
    assert!(plain.iter().any(|c| c["author"] == ann["id"]));
}

#[tokio::test]
async fn test_nested_populate() {
    let blog = blog();
    let ctx = tenant("acme");
    let org = blog.orgs.create(json!({"name": "Acme"}), &ctx).await.unwrap();
    let ann = blog
        .users
        .create(json!({"name": "Ann", "org": org["id"]}), &ctx)
        .await
        .unwrap();
    let comment = blog
        .comments
        .create(json!({"text": "hi", "author": ann["id"]}), &ctx)
        .await
        .unwrap();

    let resolved = blog
        .comments
        .resolve(ResolveParams::new(comment["id"].clone()).with_populate(["author"]), &ctx)
        .await
        .unwrap();
    assert_eq!(resolved["author"]["name"], json!("Ann"));
    assert_eq!(resolved["author"]["org"], org);

    // The user read on its own keeps the raw org id.
    let user = blog
        .users
        .resolve(ResolveParams::new(ann["id"].clone()), &ctx)
        .await
        .unwrap();
    assert_eq!(user["org"], org["id"]);
}

#[tokio::test]
async fn test_populate_depth_is_bounded() {
    let registry = ServiceRegistry::new();
    let people = EntityService::builder(
        "people",
        Declarations::new().field("name", "string").field(
            "manager",
            FieldSpec::new(FieldType::String)
                .populate(PopulateRule::lookup("people.resolve").with_populate(["manager"])),
        ),
    )
    .with_transport(registry.transport())
    .with_settings(ServiceSettings::default().with_populate_max_depth(1))
    .build()
    .unwrap();
    let people = Arc::new(people);
    registry.register(Arc::clone(&people));
    let ctx = tenant("acme");

    let carl = people.create(json!({"name": "Carl"}), &ctx).await.unwrap();
    let bob = people
        .create(json!({"name": "Bob", "manager": carl["id"]}), &ctx)
        .await
        .unwrap();
    let ann = people
        .create(json!({"name": "Ann", "manager": bob["id"]}), &ctx)
        .await
        .unwrap();

    // Carl has no manager, so the nested read has nothing to populate.
    let bob_view = people
        .resolve(ResolveParams::new(bob["id"].clone()).with_populate(["manager"]), &ctx)
        .await
        .unwrap();
    assert_eq!(bob_view["manager"]["name"], json!("Carl"));

    let err = people
        .resolve(ResolveParams::new(ann["id"].clone()).with_populate(["manager"]), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EntityError::Configuration(ConfigurationError::PopulateDepthExceeded { depth: 2, .. })
    ));
}

#[tokio::test]
async fn test_custom_resolver_with_key_field() {
    let resolver: Hook<Map<String, Value>, PopulateArgs> = Hook::sync(|args: PopulateArgs| {
        Ok(args
            .keys
            .iter()
            .map(|key| (id_key(key), json!({"code": key, "label": format!("Category {}", id_key(key))})))
            .collect())
    });
    let service = EntityService::builder(
        "products",
        Declarations::new()
            .field("name", "string")
            .field("categoryId", "string")
            .field(
                "category",
                FieldSpec::new(FieldType::Object)
                    .virtual_field()
                    .populate(PopulateRule::resolver(resolver).with_key_field("categoryId")),
            ),
    )
    .build()
    .unwrap();
    let ctx = tenant("acme");

    let product = service
        .create(json!({"name": "Kettle", "categoryId": "kitchen"}), &ctx)
        .await
        .unwrap();
    assert!(product.get("category").is_none());

    let populated = service
        .resolve(ResolveParams::new(product["id"].clone()).with_populate(["category"]), &ctx)
        .await
        .unwrap();
    assert_eq!(populated["categoryId"], json!("kitchen"));
    assert_eq!(populated["category"]["label"], json!("Category kitchen"));
}

#[tokio::test]
async fn test_unknown_lookup_action_fails_read() {
    let registry = ServiceRegistry::new();
    let service = EntityService::builder("comments", comments())
        .with_transport(registry.transport())
        .build()
        .unwrap();
    let ctx = tenant("acme");
    service
        .create(json!({"text": "hi", "author": "u1"}), &ctx)
        .await
        .unwrap();

    let err = service
        .find(QueryParams::new().with_populate(["author"]), &ctx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("users.resolve"));
}
