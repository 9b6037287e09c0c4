use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tidewire::data_api::{
    ApiError, ApiResult, DataApiMeta, DataApiRegistry, EditParams, EndpointGuard, GetParams,
    KindValidator, ListParams, MetaBuilder, RequestContext, ValueKind,
};
use tidewire::executor::{MockEngine, QueryExecutor};
use tidewire::query::Conflict;
use tidewire::schema::{SchemaRegistry, TableDescriptor};
use tidewire::{EngineConfig, TidewireError};

/// Rejects anonymous callers. Applied from outside, the operations
/// themselves know nothing about authentication.
struct RequireUser;

#[async_trait]
impl EndpointGuard for RequireUser {
    async fn check(&self, ctx: &RequestContext, endpoint: &str) -> ApiResult<()> {
        if ctx.principal.is_some() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!("`{}` needs a signed-in user", endpoint)))
        }
    }
}

fn article_meta() -> Arc<DataApiMeta> {
    MetaBuilder::new("article")
        .with_model_key("articles")
        .field("id", |f| f.read_only())
        .field("title", |f| {
            f.with_mandatory("new").with_mandatory("edit").with_sortable()
        })
        .field("body", |f| f.with_listable(false))
        .field("views", |f| {
            f.with_sortable()
                .with_validator(KindValidator::new(ValueKind::Num))
        })
        .field("author", |f| f.with_foreign("author", "id"))
        .standard_filter("title")
        .standard_filter("author")
        .guard("new", Arc::new(RequireUser))
        .freeze()
}

fn author_meta() -> Arc<DataApiMeta> {
    MetaBuilder::new("author")
        .with_model_key("authors")
        .field("id", |f| f.read_only())
        .field("name", |f| f)
        .freeze()
}

async fn wired(
    engine: &Arc<MockEngine>,
    config: EngineConfig,
) -> Arc<DataApiRegistry> {
    let schemas = SchemaRegistry::new();
    schemas
        .register("app", TableDescriptor::new("articles"))
        .unwrap();
    schemas
        .register("app", TableDescriptor::new("authors"))
        .unwrap();

    let executor: Arc<dyn QueryExecutor> = engine.clone();
    let registry = Arc::new(DataApiRegistry::with_config(Arc::new(config)));
    registry
        .connect(&schemas, "app", executor.clone(), article_meta())
        .unwrap();
    registry
        .connect(&schemas, "app", executor, author_meta())
        .unwrap();

    for entity in ["article", "author"] {
        registry.entry(entity).unwrap().model.ensure_table().await.unwrap();
    }
    registry
}

async fn seed(registry: &Arc<DataApiRegistry>, articles: usize) {
    let model = registry.entry("article").unwrap().model;
    let mut rows = Vec::new();
    for i in 0..articles {
        rows.push(json!({
            "id": format!("a{:02}", i),
            "title": if i % 2 == 0 { "foo" } else { "bar" },
            "body": format!("body {}", i),
            "views": i,
            "author": "u1",
        }));
    }
    model.insert(rows, Conflict::Error).await.unwrap();
    registry
        .entry("author")
        .unwrap()
        .model
        .insert(vec![json!({"id": "u1", "name": "Ada"})], Conflict::Error)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_list_filters_to_matching_rows_within_the_limit() {
    let engine = Arc::new(MockEngine::new());
    let registry = wired(&engine, EngineConfig::default()).await;
    seed(&registry, 25).await;

    let page = registry
        .api("article")
        .unwrap()
        .list(
            &RequestContext::new(),
            ListParams {
                filters: BTreeMap::from([("title".to_string(), json!(["foo", "eq"]))]),
                limit: Some(10),
                ..ListParams::default()
            },
        )
        .await
        .unwrap();

    assert!(page.results.len() <= 10);
    assert!(page.results.iter().all(|row| row["title"] == json!("foo")));
    assert_eq!(page.total, 13);
    assert_eq!(page.limit, 10);
    assert_eq!(page.offset, 0);
}

#[test]
fn test_list_never_exceeds_the_configured_page_ceiling() {
    tokio_test::block_on(async {
        let engine = Arc::new(MockEngine::new());
        let mut config = EngineConfig::default();
        config.max_page = 5;
        let registry = wired(&engine, config).await;
        seed(&registry, 25).await;

        let page = registry
            .api("article")
            .unwrap()
            .list(
                &RequestContext::new(),
                ListParams {
                    limit: Some(50),
                    max_page: Some(50),
                    ..ListParams::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(page.limit, 5);
        assert_eq!(page.results.len(), 5);
        assert_eq!(page.total, 25);
    });
}

#[tokio::test]
async fn test_list_rejects_unregistered_filter_keys() {
    let engine = Arc::new(MockEngine::new());
    let registry = wired(&engine, EngineConfig::default()).await;
    seed(&registry, 3).await;

    let err = registry
        .api("article")
        .unwrap()
        .list(
            &RequestContext::new(),
            ListParams {
                filters: BTreeMap::from([("genre".to_string(), json!("satire"))]),
                ..ListParams::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TidewireError::Api(ApiError::Validation(_))));
}

#[tokio::test]
async fn test_edit_without_mandatory_fields_needs_the_bypass() {
    let engine = Arc::new(MockEngine::new());
    let registry = wired(&engine, EngineConfig::default()).await;
    seed(&registry, 2).await;
    let api = registry.api("article").unwrap();
    let ctx = RequestContext::new();

    // The body omits `title`, which is mandatory on edit.
    let err = api
        .edit(
            &ctx,
            EditParams {
                id: json!("a00"),
                body: json!({"views": 5}),
                ..EditParams::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TidewireError::Api(ApiError::Validation(_))));

    let report = api
        .edit(
            &ctx,
            EditParams {
                id: json!("a00"),
                body: json!({"views": 5}),
                no_mandatory: true,
                ..EditParams::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.replaced, 1);
}

#[tokio::test]
async fn test_get_projects_and_resolves_the_author() {
    let engine = Arc::new(MockEngine::new());
    let registry = wired(&engine, EngineConfig::default()).await;
    seed(&registry, 2).await;
    let api = registry.api("article").unwrap();

    let row = api
        .get(
            &RequestContext::new(),
            GetParams {
                id: json!("a00"),
                ..GetParams::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(row["title"], json!("foo"));
    assert_eq!(row["author"]["name"], json!("Ada"));

    let err = api
        .get(
            &RequestContext::new(),
            GetParams {
                id: json!("zzz"),
                ..GetParams::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TidewireError::Api(ApiError::NotFound(_))));
}

#[tokio::test]
async fn test_create_validates_types_and_drops_unknown_fields() {
    let engine = Arc::new(MockEngine::new());
    let registry = wired(&engine, EngineConfig::default()).await;
    let api = registry.api("article").unwrap();
    let ctx = RequestContext::new().with_principal("ada");

    let err = api
        .create(&ctx, json!({"title": "ok", "views": "many"}), false)
        .await
        .unwrap_err();
    assert!(matches!(err, TidewireError::Api(ApiError::Validation(_))));

    let report = api
        .create(&ctx, json!({"title": "ok", "views": 1, "smuggled": true}), false)
        .await
        .unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.generated_keys.len(), 1);

    let rows = engine.table_rows("app", "articles").await;
    assert!(rows[0].get("smuggled").is_none());
}

#[tokio::test]
async fn test_guards_wrap_endpoints_without_touching_their_logic() {
    let engine = Arc::new(MockEngine::new());
    let registry = wired(&engine, EngineConfig::default()).await;
    let api = registry.api("article").unwrap();

    let err = api
        .dispatch(
            "new",
            &RequestContext::new(),
            json!({"body": {"title": "anonymous"}}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TidewireError::Api(ApiError::Forbidden(_))));
    assert_eq!(engine.table_rows("app", "articles").await.len(), 0);

    let value = api
        .dispatch(
            "new",
            &RequestContext::new().with_principal("ada"),
            json!({"body": {"title": "signed"}}),
        )
        .await
        .unwrap();
    assert_eq!(value["inserted"], json!(1));
    assert_eq!(engine.table_rows("app", "articles").await.len(), 1);
}

#[tokio::test]
async fn test_extended_metadata_merges_instead_of_overriding() {
    let parent = article_meta();
    let child = MetaBuilder::extending("featured", &parent)
        .with_model_key("articles")
        .field("badge", |f| f)
        .freeze();

    // Ancestor declarations survive untouched alongside the addition.
    let title = child.field("title").unwrap();
    assert!(title.is_mandatory_for("new"));
    assert!(child.filter("title").is_some());
    assert!(child.field("badge").is_some());

    // The merged metadata drives a working API over the same table.
    let engine = Arc::new(MockEngine::new());
    let registry = wired(&engine, EngineConfig::default()).await;
    seed(&registry, 4).await;
    let model = registry.entry("article").unwrap().model;
    registry.register(child, model).unwrap();

    let page = registry
        .api("featured")
        .unwrap()
        .list(
            &RequestContext::new(),
            ListParams {
                filters: BTreeMap::from([("title".to_string(), json!("bar"))]),
                ..ListParams::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert!(page.results.iter().all(|row| row["title"] == json!("bar")));
}

#[tokio::test]
async fn test_dispatch_decodes_routing_parameters() {
    let engine = Arc::new(MockEngine::new());
    let registry = wired(&engine, EngineConfig::default()).await;
    seed(&registry, 6).await;
    let api = registry.api("article").unwrap();
    let ctx = RequestContext::new();

    let value = api
        .dispatch(
            "list",
            &ctx,
            json!({"filters": {"title": ["foo", "eq"]}, "limit": 2, "sortKey": "views", "sortDirection": "desc"}),
        )
        .await
        .unwrap();
    assert_eq!(value["total"], json!(3));
    let results = value["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["views"], json!(4));

    let row = api
        .dispatch("get", &ctx, json!({"id": "a03", "noForeign": true}))
        .await
        .unwrap();
    assert_eq!(row["title"], json!("bar"));
    assert_eq!(row["author"], json!("u1"));

    let report = api
        .dispatch("delete", &ctx, json!({"id": ["a00", "a01"]}))
        .await
        .unwrap();
    assert_eq!(report["deleted"], json!(2));

    let err = api
        .dispatch("warp", &ctx, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TidewireError::Api(ApiError::UnknownEndpoint(_))
    ));
}

#[tokio::test]
async fn test_unknown_entities_are_rejected_at_the_registry() {
    let engine = Arc::new(MockEngine::new());
    let registry = wired(&engine, EngineConfig::default()).await;

    assert!(matches!(
        registry.api("podcast").unwrap_err(),
        ApiError::UnknownEntity(_)
    ));
    assert_eq!(registry.entities(), vec!["article", "author"]);
}
