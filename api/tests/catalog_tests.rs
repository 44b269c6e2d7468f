mod common;

use common::{admin, count, user, TestDb};
use scholia_api::catalog::{self, CatalogKind, CatalogListParams};
use scholia_api::error::ApiError;
use scholia_shared::{CreateCatalogEntry, CreateReview, PublishStatus, UpdateCatalogEntry};
use serde_json::json;

fn entry(name: &str) -> CreateCatalogEntry {
    CreateCatalogEntry {
        name: name.to_string(),
        ..Default::default()
    }
}

#[test]
fn test_slugs_derived_or_claimed() {
    let db = TestDb::new();
    let conn = db.conn();
    let root = admin(&conn, "root");

    let first = catalog::create_entry(&conn, &root, CatalogKind::Tools, &entry("Cargo Watch")).unwrap();
    let second = catalog::create_entry(&conn, &root, CatalogKind::Tools, &entry("Cargo Watch")).unwrap();
    assert_eq!(first.slug, "cargo-watch");
    assert_eq!(second.slug, "cargo-watch-1");

    // Slugs are unique per kind, not across kinds.
    let course = catalog::create_entry(&conn, &root, CatalogKind::Courses, &entry("Cargo Watch")).unwrap();
    assert_eq!(course.slug, "cargo-watch");

    let claimed = CreateCatalogEntry {
        slug: Some("Cargo Watch".into()),
        ..entry("Another")
    };
    assert!(matches!(
        catalog::create_entry(&conn, &root, CatalogKind::Tools, &claimed),
        Err(ApiError::Conflict(_))
    ));
}

#[test]
fn test_patch_keeps_unspecified_fields() {
    let db = TestDb::new();
    let conn = db.conn();
    let root = admin(&conn, "root");

    let created = catalog::create_entry(
        &conn,
        &root,
        CatalogKind::Models,
        &CreateCatalogEntry {
            name: "Tiny Model".into(),
            description: Some("a small one".into()),
            tags: Some(vec!["nlp".into(), " NLP ".into(), "small".into()]),
            details: Some(json!({"parameters": "7B"})),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(created.tags, ["nlp", "small"]);
    assert_eq!(created.status, PublishStatus::Draft);

    let patched = catalog::update_entry(
        &conn,
        &root,
        CatalogKind::Models,
        created.id,
        &UpdateCatalogEntry {
            status: Some("published".into()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(patched.status, PublishStatus::Published);
    assert_eq!(patched.name, "Tiny Model");
    assert_eq!(patched.slug, "tiny-model");
    assert_eq!(patched.description, "a small one");
    assert_eq!(patched.details, json!({"parameters": "7B"}));
    assert_eq!(patched.tags, ["nlp", "small"]);

    assert!(matches!(
        catalog::update_entry(
            &conn,
            &root,
            CatalogKind::Models,
            created.id,
            &UpdateCatalogEntry {
                details: Some(json!("not an object")),
                ..Default::default()
            },
        ),
        Err(ApiError::Validation(_))
    ));
}

#[test]
fn test_writes_are_admin_only_and_drafts_hidden() {
    let db = TestDb::new();
    let conn = db.conn();
    let root = admin(&conn, "root");
    let alice = user(&conn, "alice");

    assert!(matches!(
        catalog::create_entry(&conn, &alice, CatalogKind::Terms, &entry("Borrow")),
        Err(ApiError::Forbidden(_))
    ));

    catalog::create_entry(&conn, &root, CatalogKind::Terms, &entry("Borrow")).unwrap();
    catalog::create_entry(
        &conn,
        &root,
        CatalogKind::Terms,
        &CreateCatalogEntry {
            status: Some("published".into()),
            tags: Some(vec!["memory".into()]),
            ..entry("Lifetime")
        },
    )
    .unwrap();

    let public = catalog::list_entries(&conn, CatalogKind::Terms, None, &CatalogListParams::default())
        .unwrap();
    assert_eq!(public.pagination.total, 1);
    assert_eq!(public.items[0].name, "Lifetime");

    let everything =
        catalog::list_entries(&conn, CatalogKind::Terms, Some(&root), &CatalogListParams::default())
            .unwrap();
    assert_eq!(everything.pagination.total, 2);

    let tagged = catalog::list_entries(
        &conn,
        CatalogKind::Terms,
        Some(&root),
        &CatalogListParams {
            tag: Some("Memory".into()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(tagged.items.len(), 1);

    assert!(matches!(
        catalog::get_by_slug(&conn, CatalogKind::Terms, Some(&alice), "borrow"),
        Err(ApiError::NotFound(_))
    ));
    assert!(catalog::get_by_slug(&conn, CatalogKind::Terms, Some(&alice), "lifetime").is_ok());
}

#[test]
fn test_product_reviews() {
    let db = TestDb::new();
    let conn = db.conn();
    let root = admin(&conn, "root");
    let alice = user(&conn, "alice");

    let product = catalog::create_entry(
        &conn,
        &root,
        CatalogKind::Products,
        &CreateCatalogEntry {
            status: Some("published".into()),
            ..entry("Keyboard")
        },
    )
    .unwrap();

    let review = |rating: i64| CreateReview {
        rating,
        body: "solid".into(),
    };
    assert!(matches!(
        catalog::create_review(&conn, &alice, product.id, &review(6)),
        Err(ApiError::Validation(_))
    ));
    let stored = catalog::create_review(&conn, &alice, product.id, &review(4)).unwrap();
    assert_eq!(stored.user.username, "alice");
    assert!(matches!(
        catalog::create_review(&conn, &alice, product.id, &review(5)),
        Err(ApiError::Conflict(_))
    ));
    assert_eq!(catalog::list_reviews(&conn, product.id).unwrap().len(), 1);

    catalog::delete_entry(&conn, &root, CatalogKind::Products, product.id).unwrap();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM product_reviews", []), 0);
}
