use serde_json::{json, Value};
use std::sync::Arc;
use tidewire::executor::MockEngine;
use tidewire::model::Model;
use tidewire::modifier::{
    DigestModifier, LocalizedModifier, ModifierError, PasswordModifier, SealedModifier, MODS_KEY,
};
use tidewire::query::Conflict;
use tidewire::schema::TableDescriptor;
use tidewire::TidewireError;

fn model_over(descriptor: TableDescriptor, engine: &Arc<MockEngine>) -> Model {
    Model::new("app", Arc::new(descriptor), engine.clone())
}

#[tokio::test]
async fn test_get_by_unique_index_returns_the_matching_user() {
    let engine = Arc::new(MockEngine::new());
    let users = model_over(TableDescriptor::new("users").with_index("email"), &engine);
    users.ensure_table().await.unwrap();

    users
        .insert(
            vec![
                json!({"id": "u1", "email": "a@x.com", "name": "Ada"}),
                json!({"id": "u2", "email": "b@x.com", "name": "Bert"}),
            ],
            Conflict::Error,
        )
        .await
        .unwrap();

    let matches = users.get_by("email", vec![json!("a@x.com")]).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["email"], json!("a@x.com"));
    assert_eq!(matches[0]["name"], json!("Ada"));
}

#[tokio::test]
async fn test_hashed_passwords_store_opaquely_and_answer_membership() {
    let engine = Arc::new(MockEngine::new());
    let users = model_over(
        TableDescriptor::new("users")
            .with_modifier("password", Arc::new(PasswordModifier::with_seed(7))),
        &engine,
    );
    users.ensure_table().await.unwrap();

    users
        .insert(
            vec![json!({"id": "u1", "password": "secret123"})],
            Conflict::Error,
        )
        .await
        .unwrap();

    let row = users.get("u1").await.unwrap().unwrap();
    assert_ne!(row["password"], json!("secret123"));
    assert!(row["password"].as_str().unwrap().starts_with("$argon2id$"));

    assert!(users
        .test_field(&row, "password", &json!("secret123"), &[])
        .unwrap());
    assert!(!users
        .test_field(&row, "password", &json!("wrong"), &[])
        .unwrap());
    assert!(matches!(
        users.unlock_field(&row, "password", &[]),
        Err(TidewireError::Modifier(
            ModifierError::OperationNotSupported { .. }
        ))
    ));
}

#[tokio::test]
async fn test_updating_a_hashed_field_relocks_it() {
    let engine = Arc::new(MockEngine::new());
    let users = model_over(
        TableDescriptor::new("users")
            .with_modifier("password", Arc::new(DigestModifier::with_seed(3))),
        &engine,
    );
    users.ensure_table().await.unwrap();
    users
        .insert(
            vec![json!({"id": "u1", "password": "first"})],
            Conflict::Error,
        )
        .await
        .unwrap();

    users
        .update("u1", json!({"password": "second"}))
        .await
        .unwrap();

    let row = users.get("u1").await.unwrap().unwrap();
    assert!(users
        .test_field(&row, "password", &json!("second"), &[])
        .unwrap());
    assert!(!users
        .test_field(&row, "password", &json!("first"), &[])
        .unwrap());
}

#[tokio::test]
async fn test_sealed_fields_round_trip_and_keep_their_metadata() {
    let engine = Arc::new(MockEngine::new());
    let patients = model_over(
        TableDescriptor::new("patients")
            .with_modifier("ssn", Arc::new(SealedModifier::with_seed("vault key", 11))),
        &engine,
    );
    patients.ensure_table().await.unwrap();

    patients
        .insert(
            vec![json!({"id": "p1", "ssn": "078-05-1120"})],
            Conflict::Error,
        )
        .await
        .unwrap();

    let row = patients.get("p1").await.unwrap().unwrap();
    assert_ne!(row["ssn"], json!("078-05-1120"));
    let meta = &row[MODS_KEY]["ssn"][0];
    assert!(meta.get("iv").is_some());
    assert!(meta.get("tag").is_some());

    let plain = patients.unlock_field(&row, "ssn", &[]).unwrap();
    assert_eq!(plain, json!("078-05-1120"));
}

#[tokio::test]
async fn test_localized_fields_unlock_in_queries() {
    let engine = Arc::new(MockEngine::new());
    let pages = model_over(
        TableDescriptor::new("pages")
            .with_modifier("greeting", Arc::new(LocalizedModifier::new())),
        &engine,
    );
    pages.ensure_table().await.unwrap();

    pages
        .insert_with_args(
            vec![
                json!({"id": "front", "greeting": "Hallo"}),
                json!({"id": "about", "greeting": "Moin"}),
            ],
            Conflict::Error,
            &[json!("de")],
        )
        .await
        .unwrap();
    pages
        .update_with_args("front", json!({"greeting": "Hello"}), &[json!("en")])
        .await
        .unwrap();

    // The stored value accumulates every locale.
    let row = pages.get("front").await.unwrap().unwrap();
    assert_eq!(row["greeting"]["de"], json!("Hallo"));
    assert_eq!(row["greeting"]["en"], json!("Hello"));

    // The inverse runs remotely, inside the query pipeline.
    let chain = pages.unlock_in_query("greeting", &[json!("de")]).unwrap();
    let values = pages.run(chain).await.unwrap();
    assert_eq!(values, json!(["Moin", "Hallo"]));
}

#[tokio::test]
async fn test_row_conversion_failures_are_reported_not_raised() {
    let engine = Arc::new(MockEngine::new());
    let users = model_over(
        TableDescriptor::new("users")
            .with_modifier("password", Arc::new(PasswordModifier::with_seed(9))),
        &engine,
    );
    users.ensure_table().await.unwrap();

    let report = users
        .insert(
            vec![
                json!({"id": "u1", "password": "fine"}),
                json!({"id": "u2", "password": 42}),
            ],
            Conflict::Error,
        )
        .await
        .unwrap();

    assert_eq!(report.inserted, 1);
    assert_eq!(report.errors, 1);
    assert!(report.first_error.is_some());
    assert_eq!(engine.table_rows("app", "users").await.len(), 1);
}

#[tokio::test]
async fn test_fixtures_seed_only_on_creation() {
    let engine = Arc::new(MockEngine::new());
    let cities = model_over(
        TableDescriptor::new("cities").with_fixture(|| {
            vec![
                json!({"id": "ber", "name": "Berlin"}),
                json!({"id": "ham", "name": "Hamburg"}),
            ]
        }),
        &engine,
    );

    assert!(cities.ensure_table().await.unwrap());
    assert_eq!(engine.table_rows("app", "cities").await.len(), 2);

    // A second ensure neither recreates nor reseeds.
    assert!(!cities.ensure_table().await.unwrap());
    assert_eq!(engine.table_rows("app", "cities").await.len(), 2);

    let berlin = cities.get("ber").await.unwrap().unwrap();
    assert_eq!(berlin["name"], json!("Berlin"));
}

#[tokio::test]
async fn test_stacked_modifiers_test_through_the_outer_layers() {
    let engine = Arc::new(MockEngine::new());
    let vault = model_over(
        TableDescriptor::new("vault")
            .with_modifier("code", Arc::new(DigestModifier::with_seed(1)))
            .with_modifier("code", Arc::new(SealedModifier::with_seed("outer", 2))),
        &engine,
    );
    vault.ensure_table().await.unwrap();

    vault
        .insert(vec![json!({"id": "v1", "code": "open sesame"})], Conflict::Error)
        .await
        .unwrap();

    let row = vault.get("v1").await.unwrap().unwrap();
    // Two layers, two metadata entries, and the membership check still
    // reaches the digest through the sealing layer.
    assert_eq!(row[MODS_KEY]["code"].as_array().unwrap().len(), 2);
    assert!(vault
        .test_field(&row, "code", &json!("open sesame"), &[])
        .unwrap());
    assert!(!vault
        .test_field(&row, "code", &json!("open says me"), &[])
        .unwrap());

    // The sealed layer is reversible, the digest below is not.
    assert!(matches!(
        vault.unlock_field(&row, "code", &[]),
        Err(TidewireError::Modifier(_))
    ));
}
