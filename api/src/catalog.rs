//! Content catalog: models, datasets, products, tools, commands, terms and
//! courses. Every kind shares one shape and one set of handlers; only the
//! backing table differs. Products additionally carry user reviews.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use rusqlite::{
    params, params_from_iter,
    types::{Type, Value},
    Connection, OptionalExtension, Row,
};
use scholia_shared::{
    CatalogEntry, CreateCatalogEntry, CreateReview, Paginated, Principal, ProductReview,
    PublishStatus, UpdateCatalogEntry, User,
};
use serde::Deserialize;
use tracing::info;

use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    quiz::quizzes::parse_status,
    slug, users, AppState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Models,
    Datasets,
    Products,
    Tools,
    Commands,
    Terms,
    Courses,
}

impl CatalogKind {
    pub const ALL: [CatalogKind; 7] = [
        CatalogKind::Models,
        CatalogKind::Datasets,
        CatalogKind::Products,
        CatalogKind::Tools,
        CatalogKind::Commands,
        CatalogKind::Terms,
        CatalogKind::Courses,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CatalogKind::Models => "models",
            CatalogKind::Datasets => "datasets",
            CatalogKind::Products => "products",
            CatalogKind::Tools => "tools",
            CatalogKind::Commands => "commands",
            CatalogKind::Terms => "terms",
            CatalogKind::Courses => "courses",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            CatalogKind::Models => "catalog_models",
            CatalogKind::Datasets => "catalog_datasets",
            CatalogKind::Products => "catalog_products",
            CatalogKind::Tools => "catalog_tools",
            CatalogKind::Commands => "catalog_commands",
            CatalogKind::Terms => "catalog_terms",
            CatalogKind::Courses => "catalog_courses",
        }
    }

    /// Unknown kinds are a 404 since the kind is a path segment.
    pub fn parse(segment: &str) -> ApiResult<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == segment)
            .ok_or_else(|| ApiError::not_found(format!("catalog '{segment}'")))
    }
}

const ENTRY_COLUMNS: &str =
    "id, name, slug, description, status, tags, details, created_by, created_at, updated_at";

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn entry_from_row(kind: CatalogKind, row: &Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let status: String = row.get(4)?;
    Ok(CatalogEntry {
        id: row.get(0)?,
        kind: kind.as_str().to_string(),
        name: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        status: PublishStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                Type::Text,
                format!("unknown status '{status}'").into(),
            )
        })?,
        tags: json_column(row, 5)?,
        details: json_column(row, 6)?,
        created_by: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

pub fn load_entry(conn: &Connection, kind: CatalogKind, id: i64) -> ApiResult<CatalogEntry> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM {} WHERE id = ?1", kind.table()),
        [id],
        |row| entry_from_row(kind, row),
    )
    .optional()?
    .ok_or_else(|| ApiError::not_found(kind.as_str().trim_end_matches('s')))
}

fn is_visible(entry: &CatalogEntry, viewer: Option<&Principal>) -> bool {
    entry.status == PublishStatus::Published || viewer.is_some_and(Principal::is_admin)
}

pub fn get_by_slug(
    conn: &Connection,
    kind: CatalogKind,
    viewer: Option<&Principal>,
    slug: &str,
) -> ApiResult<CatalogEntry> {
    let entry = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM {} WHERE slug = ?1", kind.table()),
            [slug],
            |row| entry_from_row(kind, row),
        )
        .optional()?
        .filter(|e| is_visible(e, viewer));
    entry.ok_or_else(|| ApiError::not_found(kind.as_str().trim_end_matches('s')))
}

/// Trimmed, sanitised, non-empty, first occurrence wins.
fn clean_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = ammonia::clean(tag.trim());
        if !tag.is_empty() && !out.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            out.push(tag);
        }
    }
    out
}

fn check_details(details: &serde_json::Value) -> ApiResult<()> {
    if details.is_object() {
        Ok(())
    } else {
        Err(ApiError::validation("details must be a JSON object"))
    }
}

/// A caller-chosen slug must already be free; it is never suffixed.
fn claim_slug(
    conn: &Connection,
    kind: CatalogKind,
    requested: &str,
    exclude_id: Option<i64>,
) -> ApiResult<String> {
    let candidate = slug::slugify(requested);
    if candidate.is_empty() {
        return Err(ApiError::validation("slug must contain letters or digits"));
    }
    let taken: bool = conn.query_row(
        &format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE slug = ?1 AND id != ?2)",
            kind.table()
        ),
        params![candidate, exclude_id.unwrap_or(-1)],
        |row| row.get(0),
    )?;
    if taken {
        return Err(ApiError::conflict(format!("slug '{candidate}' is already in use")));
    }
    Ok(candidate)
}

pub fn create_entry(
    conn: &Connection,
    actor: &Principal,
    kind: CatalogKind,
    input: &CreateCatalogEntry,
) -> ApiResult<CatalogEntry> {
    auth::require_admin(actor)?;
    let name = ammonia::clean(input.name.trim());
    if name.trim().is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    let status = input
        .status
        .as_deref()
        .map(parse_status)
        .transpose()?
        .unwrap_or_default();
    let details = input
        .details
        .clone()
        .unwrap_or_else(|| serde_json::json!({}));
    check_details(&details)?;
    let tags = clean_tags(input.tags.as_deref().unwrap_or_default());

    let slug = match input.slug.as_deref() {
        Some(requested) => claim_slug(conn, kind, requested, None)?,
        None => db::unique_slug(conn, kind.table(), &name, None)?,
    };

    let now = Utc::now();
    conn.execute(
        &format!(
            "INSERT INTO {} (name, slug, description, status, tags, details, created_by,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            kind.table()
        ),
        params![
            name,
            slug,
            input.description.as_deref().map(ammonia::clean).unwrap_or_default(),
            status.as_str(),
            serde_json::to_string(&tags)?,
            serde_json::to_string(&details)?,
            actor.id,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();

    info!(kind = kind.as_str(), id, slug = %slug, "catalog entry created");
    load_entry(conn, kind, id)
}

/// Partial update; fields left out keep their value. The slug only
/// changes when one is supplied.
pub fn update_entry(
    conn: &Connection,
    actor: &Principal,
    kind: CatalogKind,
    id: i64,
    patch: &UpdateCatalogEntry,
) -> ApiResult<CatalogEntry> {
    auth::require_admin(actor)?;
    load_entry(conn, kind, id)?;

    let name = match patch.name.as_deref() {
        Some(name) => {
            let name = ammonia::clean(name.trim());
            if name.trim().is_empty() {
                return Err(ApiError::validation("name is required"));
            }
            Some(name)
        }
        None => None,
    };
    let status = patch.status.as_deref().map(parse_status).transpose()?;
    let slug = patch
        .slug
        .as_deref()
        .map(|s| claim_slug(conn, kind, s, Some(id)))
        .transpose()?;
    let tags = patch
        .tags
        .as_deref()
        .map(|t| serde_json::to_string(&clean_tags(t)))
        .transpose()?;
    let details = match &patch.details {
        Some(details) => {
            check_details(details)?;
            Some(serde_json::to_string(details)?)
        }
        None => None,
    };

    conn.execute(
        &format!(
            "UPDATE {} SET
                name = COALESCE(?1, name),
                slug = COALESCE(?2, slug),
                description = COALESCE(?3, description),
                status = COALESCE(?4, status),
                tags = COALESCE(?5, tags),
                details = COALESCE(?6, details),
                updated_at = ?7
             WHERE id = ?8",
            kind.table()
        ),
        params![
            name,
            slug,
            patch.description.as_deref().map(ammonia::clean),
            status.map(PublishStatus::as_str),
            tags,
            details,
            Utc::now(),
            id
        ],
    )?;

    load_entry(conn, kind, id)
}

pub fn delete_entry(conn: &Connection, actor: &Principal, kind: CatalogKind, id: i64) -> ApiResult<()> {
    auth::require_admin(actor)?;
    let affected = conn.execute(&format!("DELETE FROM {} WHERE id = ?1", kind.table()), [id])?;
    if affected == 0 {
        return Err(ApiError::not_found(kind.as_str().trim_end_matches('s')));
    }
    info!(kind = kind.as_str(), id, "catalog entry deleted");
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct CatalogListParams {
    pub status: Option<String>,
    pub search: Option<String>,
    pub tag: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// Non-admins only see published entries.
pub fn list_entries(
    conn: &Connection,
    kind: CatalogKind,
    viewer: Option<&Principal>,
    params: &CatalogListParams,
) -> ApiResult<Paginated<CatalogEntry>> {
    let (page, limit, offset) = db::page_window(params.page, params.limit);
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    let status = match params.status.as_deref().map(parse_status).transpose()? {
        _ if !viewer.is_some_and(Principal::is_admin) => Some(PublishStatus::Published),
        requested => requested,
    };
    if let Some(status) = status {
        values.push(Value::Text(status.as_str().to_string()));
        conditions.push(format!("status = ?{}", values.len()));
    }
    if let Some(search) = params.search.as_deref().filter(|s| !s.trim().is_empty()) {
        values.push(Value::Text(format!("%{}%", search.trim())));
        let n = values.len();
        conditions.push(format!("(name LIKE ?{n} OR description LIKE ?{n})"));
    }
    if let Some(tag) = params.tag.as_deref().filter(|t| !t.trim().is_empty()) {
        values.push(Value::Text(tag.trim().to_string()));
        conditions.push(format!(
            "EXISTS (SELECT 1 FROM json_each(tags) WHERE value = ?{} COLLATE NOCASE)",
            values.len()
        ));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} {where_clause}", kind.table()),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    values.push(Value::Integer(limit));
    values.push(Value::Integer(offset));
    let n = values.len();
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM {} {where_clause}
         ORDER BY created_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
        kind.table(),
        n - 1,
        n
    ))?;
    let entries = stmt
        .query_map(params_from_iter(values.iter()), |row| entry_from_row(kind, row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Paginated::new(entries, page, limit, total))
}

// ── Product reviews ──

pub fn list_reviews(conn: &Connection, product_id: i64) -> ApiResult<Vec<ProductReview>> {
    load_entry(conn, CatalogKind::Products, product_id)?;
    let mut stmt = conn.prepare(
        "SELECT r.id, r.product_id, r.rating, r.body, r.created_at,
                u.id, u.username, u.avatar_url
         FROM product_reviews r
         JOIN users u ON u.id = r.user_id
         WHERE r.product_id = ?1
         ORDER BY r.created_at DESC, r.id DESC",
    )?;
    let reviews = stmt
        .query_map([product_id], |row| {
            Ok(ProductReview {
                id: row.get(0)?,
                product_id: row.get(1)?,
                rating: row.get(2)?,
                body: row.get(3)?,
                created_at: row.get(4)?,
                user: User {
                    id: row.get(5)?,
                    username: row.get(6)?,
                    avatar_url: row.get(7)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(reviews)
}

/// One review per user per product.
pub fn create_review(
    conn: &Connection,
    actor: &Principal,
    product_id: i64,
    input: &CreateReview,
) -> ApiResult<ProductReview> {
    if !(1..=5).contains(&input.rating) {
        return Err(ApiError::validation("rating must be between 1 and 5"));
    }
    users::ensure_can_participate(conn, actor.id)?;
    let product = load_entry(conn, CatalogKind::Products, product_id)?;
    if !is_visible(&product, Some(actor)) {
        return Err(ApiError::not_found("product"));
    }

    let inserted = conn.execute(
        "INSERT INTO product_reviews (product_id, user_id, rating, body, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            product_id,
            actor.id,
            input.rating,
            ammonia::clean(input.body.trim()),
            Utc::now()
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if db::is_unique_violation(&e) => {
            return Err(ApiError::conflict("you have already reviewed this product"));
        }
        Err(e) => return Err(e.into()),
    }
    let id = conn.last_insert_rowid();

    list_reviews(conn, product_id)?
        .into_iter()
        .find(|r| r.id == id)
        .ok_or_else(|| ApiError::internal("review vanished after insert"))
}

// ── Handlers ──

/// GET /api/catalog/:kind
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    Query(params): Query<CatalogListParams>,
) -> ApiResult<Json<Paginated<CatalogEntry>>> {
    let kind = CatalogKind::parse(&kind)?;
    let viewer = auth::optional_principal(&headers, &state.jwt_secret);
    let entries =
        db::blocking(&state.db, move |conn| list_entries(conn, kind, viewer.as_ref(), &params))
            .await?;
    Ok(Json(entries))
}

/// GET /api/catalog/:kind/:slug
pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((kind, slug)): Path<(String, String)>,
) -> ApiResult<Json<CatalogEntry>> {
    let kind = CatalogKind::parse(&kind)?;
    let viewer = auth::optional_principal(&headers, &state.jwt_secret);
    let entry =
        db::blocking(&state.db, move |conn| get_by_slug(conn, kind, viewer.as_ref(), &slug))
            .await?;
    Ok(Json(entry))
}

/// POST /api/catalog/:kind
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    Json(payload): Json<CreateCatalogEntry>,
) -> ApiResult<Json<CatalogEntry>> {
    let kind = CatalogKind::parse(&kind)?;
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let entry =
        db::blocking(&state.db, move |conn| create_entry(conn, &actor, kind, &payload)).await?;
    Ok(Json(entry))
}

/// PATCH /api/catalog/:kind/:id
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((kind, id)): Path<(String, i64)>,
    Json(payload): Json<UpdateCatalogEntry>,
) -> ApiResult<Json<CatalogEntry>> {
    let kind = CatalogKind::parse(&kind)?;
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let entry =
        db::blocking(&state.db, move |conn| update_entry(conn, &actor, kind, id, &payload))
            .await?;
    Ok(Json(entry))
}

/// DELETE /api/catalog/:kind/:id
pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((kind, id)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    let kind = CatalogKind::parse(&kind)?;
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    db::blocking(&state.db, move |conn| delete_entry(conn, &actor, kind, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn products_only(kind: &str) -> ApiResult<()> {
    match CatalogKind::parse(kind)? {
        CatalogKind::Products => Ok(()),
        _ => Err(ApiError::not_found("reviews")),
    }
}

/// GET /api/catalog/products/:id/reviews
pub async fn reviews(
    State(state): State<AppState>,
    Path((kind, product_id)): Path<(String, i64)>,
) -> ApiResult<Json<Vec<ProductReview>>> {
    products_only(&kind)?;
    let reviews = db::blocking(&state.db, move |conn| list_reviews(conn, product_id)).await?;
    Ok(Json(reviews))
}

/// POST /api/catalog/products/:id/reviews
pub async fn review(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((kind, product_id)): Path<(String, i64)>,
    Json(payload): Json<CreateReview>,
) -> ApiResult<Json<ProductReview>> {
    products_only(&kind)?;
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let review =
        db::blocking(&state.db, move |conn| create_review(conn, &actor, product_id, &payload))
            .await?;
    Ok(Json(review))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_and_tables() {
        for kind in CatalogKind::ALL {
            assert_eq!(CatalogKind::parse(kind.as_str()).unwrap(), kind);
            assert!(kind.table().starts_with("catalog_"));
        }
        assert!(matches!(CatalogKind::parse("widgets"), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn test_clean_tags() {
        let tags = vec![
            " rust ".to_string(),
            "".to_string(),
            "Rust".to_string(),
            "cli".to_string(),
        ];
        assert_eq!(clean_tags(&tags), vec!["rust", "cli"]);
    }

    #[test]
    fn test_details_must_be_object() {
        assert!(check_details(&serde_json::json!({"license": "MIT"})).is_ok());
        assert!(check_details(&serde_json::json!([1, 2])).is_err());
    }
}
