use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use scholia_shared::{CreateCategory, ForumCategory, Principal, UpdateCategory};
use tracing::info;

use super::{allows, clean_required, parse_permissions};
use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    AppState,
};

const CATEGORY_SELECT: &str =
    "SELECT c.id, c.name, c.slug, c.description, c.parent_id, c.permissions, c.display_order,
            (SELECT COUNT(*) FROM threads WHERE category_id = c.id)
     FROM forum_categories c";

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<ForumCategory> {
    Ok(ForumCategory {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        parent_id: row.get(4)?,
        permissions: parse_permissions(&row.get::<_, String>(5)?, 5)?,
        display_order: row.get(6)?,
        thread_count: row.get(7)?,
    })
}

pub fn get_category(conn: &Connection, id: i64) -> ApiResult<ForumCategory> {
    conn.query_row(&format!("{CATEGORY_SELECT} WHERE c.id = ?1"), [id], category_from_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("category"))
}

/// Categories the viewer is allowed to see, in display order.
pub fn list_categories(conn: &Connection, viewer: Option<&Principal>) -> ApiResult<Vec<ForumCategory>> {
    let mut stmt = conn.prepare(&format!(
        "{CATEGORY_SELECT} ORDER BY c.display_order, c.name"
    ))?;
    let rows = stmt
        .query_map([], category_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter(|c| allows(c.permissions.view, viewer))
        .collect())
}

fn ensure_parent_exists(conn: &Connection, parent_id: i64) -> ApiResult<()> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM forum_categories WHERE id = ?1",
            [parent_id],
            |row| row.get(0),
        )
        .optional()?;
    found
        .map(|_| ())
        .ok_or_else(|| ApiError::validation("parent category does not exist"))
}

pub fn create_category(
    conn: &Connection,
    actor: &Principal,
    input: &CreateCategory,
) -> ApiResult<ForumCategory> {
    auth::require_admin(actor)?;
    let name = clean_required(&input.name, "name")?;
    if let Some(parent_id) = input.parent_id {
        ensure_parent_exists(conn, parent_id)?;
    }

    let slug = db::unique_slug(conn, "forum_categories", &name, None)?;
    let permissions = serde_json::to_string(&input.permissions.unwrap_or_default())?;

    conn.execute(
        "INSERT INTO forum_categories
            (name, slug, description, parent_id, permissions, display_order, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            name,
            slug,
            input.description.as_deref().map(ammonia::clean).unwrap_or_default(),
            input.parent_id,
            permissions,
            input.display_order.unwrap_or(0),
            Utc::now()
        ],
    )?;

    get_category(conn, conn.last_insert_rowid())
}

pub fn update_category(
    conn: &Connection,
    actor: &Principal,
    id: i64,
    patch: &UpdateCategory,
) -> ApiResult<ForumCategory> {
    auth::require_admin(actor)?;
    let current = get_category(conn, id)?;

    let parent_id = match patch.parent_id {
        Some(parent) if parent == id => {
            return Err(ApiError::validation("a category cannot be its own parent"));
        }
        Some(parent) => {
            ensure_parent_exists(conn, parent)?;
            Some(parent)
        }
        None if patch.clear_parent => None,
        None => current.parent_id,
    };

    let (name, slug) = match &patch.name {
        Some(name) => {
            let name = clean_required(name, "name")?;
            let slug = db::unique_slug(conn, "forum_categories", &name, Some(id))?;
            (name, slug)
        }
        None => (current.name, current.slug),
    };

    let permissions = serde_json::to_string(&patch.permissions.unwrap_or(current.permissions))?;

    conn.execute(
        "UPDATE forum_categories SET
            name = ?1, slug = ?2, description = COALESCE(?3, description),
            parent_id = ?4, permissions = ?5, display_order = COALESCE(?6, display_order)
         WHERE id = ?7",
        params![
            name,
            slug,
            patch.description.as_deref().map(ammonia::clean),
            parent_id,
            permissions,
            patch.display_order,
            id
        ],
    )?;

    get_category(conn, id)
}

/// Categories are structural: deletion is refused while anything hangs
/// off them, unlike threads which cascade.
pub fn delete_category(conn: &Connection, actor: &Principal, id: i64) -> ApiResult<()> {
    auth::require_admin(actor)?;
    let category = get_category(conn, id)?;

    let children: i64 = conn.query_row(
        "SELECT COUNT(*) FROM forum_categories WHERE parent_id = ?1",
        [id],
        |row| row.get(0),
    )?;
    if children > 0 {
        return Err(ApiError::conflict(format!(
            "category has {children} child categories"
        )));
    }
    if category.thread_count > 0 {
        return Err(ApiError::conflict(format!(
            "category still contains {} threads",
            category.thread_count
        )));
    }

    conn.execute("DELETE FROM forum_categories WHERE id = ?1", [id])?;
    info!(category = id, slug = %category.slug, "category deleted");
    Ok(())
}

// ── Handlers ──

/// GET /api/forum/categories
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ForumCategory>>> {
    let viewer = auth::optional_principal(&headers, &state.jwt_secret);
    let cats = db::blocking(&state.db, move |conn| list_categories(conn, viewer.as_ref())).await?;
    Ok(Json(cats))
}

/// GET /api/forum/categories/:id
pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ForumCategory>> {
    let viewer = auth::optional_principal(&headers, &state.jwt_secret);
    let cat = db::blocking(&state.db, move |conn| {
        let cat = get_category(conn, id)?;
        if !allows(cat.permissions.view, viewer.as_ref()) {
            return Err(ApiError::forbidden("you cannot view this category"));
        }
        Ok(cat)
    })
    .await?;
    Ok(Json(cat))
}

/// POST /api/forum/categories
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateCategory>,
) -> ApiResult<Json<ForumCategory>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let cat = db::blocking(&state.db, move |conn| create_category(conn, &actor, &payload)).await?;
    info!(category = cat.id, slug = %cat.slug, "category created");
    Ok(Json(cat))
}

/// PATCH /api/forum/categories/:id
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateCategory>,
) -> ApiResult<Json<ForumCategory>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let cat =
        db::blocking(&state.db, move |conn| update_category(conn, &actor, id, &payload)).await?;
    Ok(Json(cat))
}

/// DELETE /api/forum/categories/:id
pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    db::blocking(&state.db, move |conn| delete_category(conn, &actor, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
