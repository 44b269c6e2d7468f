use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use rusqlite::{params, params_from_iter, types::Value, Connection};
use scholia_shared::{
    CreateThread, Paginated, Principal, SolveThread, Thread, ThreadCreated, ThreadDetail,
    UpdateThread,
};
use serde::Deserialize;
use tracing::info;

use super::{
    allows, category_permissions, clean_required, ensure_can_view, load_post, load_thread,
    parse_permissions, posts,
    subscriptions::{self, Membership},
    thread_from_row, THREAD_SELECT,
};
use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    users, AppState,
};

// ── Query params ──

#[derive(Debug, Default, Deserialize)]
pub struct ThreadListParams {
    /// Category id or slug.
    pub category: Option<String>,
    pub locked: Option<bool>,
    pub sticky: Option<bool>,
    pub solved: Option<bool>,
    /// latest | newest | views | posts
    pub sort: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

fn sort_clause(sort: Option<&str>) -> ApiResult<&'static str> {
    match sort.unwrap_or("latest") {
        "latest" => Ok("t.last_post_at DESC"),
        "newest" => Ok("t.created_at DESC"),
        "views" => Ok("t.views DESC"),
        "posts" => Ok("t.post_count DESC"),
        other => Err(ApiError::validation(format!("unknown sort field '{other}'"))),
    }
}

fn resolve_category(conn: &Connection, key: &str) -> ApiResult<i64> {
    let by_id = key.parse::<i64>().ok();
    conn.query_row(
        "SELECT id FROM forum_categories WHERE id = ?1 OR slug = ?2",
        params![by_id, key],
        |row| row.get(0),
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => ApiError::not_found("category"),
        other => other.into(),
    })
}

/// Category ids whose threads `viewer` may see.
fn visible_categories(conn: &Connection, viewer: Option<&Principal>) -> ApiResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id, permissions FROM forum_categories")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, parse_permissions(&row.get::<_, String>(1)?, 1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|(_, perms)| allows(perms.view, viewer))
        .map(|(id, _)| id)
        .collect())
}

pub fn list_threads(
    conn: &Connection,
    viewer: Option<&Principal>,
    params: &ThreadListParams,
) -> ApiResult<Paginated<Thread>> {
    let (page, limit, offset) = db::page_window(params.page, params.limit);
    let order = sort_clause(params.sort.as_deref())?;

    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    match &params.category {
        Some(key) => {
            let cat_id = resolve_category(conn, key)?;
            ensure_can_view(conn, cat_id, viewer)?;
            values.push(Value::Integer(cat_id));
            conditions.push(format!("t.category_id = ?{}", values.len()));
        }
        None => {
            let visible = visible_categories(conn, viewer)?;
            if visible.is_empty() {
                return Ok(Paginated::new(Vec::new(), page, limit, 0));
            }
            let ids = visible
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            conditions.push(format!("t.category_id IN ({ids})"));
        }
    }

    for (column, flag) in [
        ("t.is_locked", params.locked),
        ("t.is_sticky", params.sticky),
        ("t.is_solved", params.solved),
    ] {
        if let Some(flag) = flag {
            values.push(Value::Integer(flag as i64));
            conditions.push(format!("{column} = ?{}", values.len()));
        }
    }

    let where_clause = format!("WHERE {}", conditions.join(" AND "));

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM threads t {where_clause}"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    values.push(Value::Integer(limit));
    values.push(Value::Integer(offset));
    let n = values.len();
    let mut stmt = conn.prepare(&format!(
        "{THREAD_SELECT} {where_clause}
         ORDER BY t.is_sticky DESC, {order}, t.id DESC
         LIMIT ?{} OFFSET ?{}",
        n - 1,
        n
    ))?;
    let threads = stmt
        .query_map(params_from_iter(values.iter()), thread_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Paginated::new(threads, page, limit, total))
}

/// Creates the thread and its opening post atomically.
pub fn create_thread(
    conn: &mut Connection,
    actor: &Principal,
    input: &CreateThread,
) -> ApiResult<ThreadCreated> {
    let title = clean_required(&input.title, "title")?;
    let content = clean_required(&input.content, "content")?;

    let perms = category_permissions(conn, input.category_id)?;
    if !allows(perms.post, Some(actor)) {
        return Err(ApiError::forbidden("you cannot start threads in this category"));
    }
    users::ensure_can_participate(conn, actor.id)?;

    let now = Utc::now();
    let tx = conn.transaction()?;
    let slug = db::unique_slug(&tx, "threads", &title, None)?;
    tx.execute(
        "INSERT INTO threads (category_id, user_id, title, slug, created_at, last_post_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![input.category_id, actor.id, title, slug, now],
    )?;
    let thread_id = tx.last_insert_rowid();

    let post_id = posts::record_post(
        &tx,
        &posts::ThreadRef {
            id: thread_id,
            title: &title,
        },
        actor.id,
        &content,
        now,
    )?;
    tx.commit()?;

    info!(thread = thread_id, user = actor.id, slug = %slug, "thread created");
    Ok(ThreadCreated {
        thread: load_thread(conn, thread_id)?,
        post: load_post(conn, post_id)?,
    })
}

/// Bumps the view counter unless the viewer is the thread's author.
pub fn record_view(conn: &Connection, thread: &Thread, viewer: Option<&Principal>) -> ApiResult<bool> {
    if viewer.is_some_and(|v| v.id == thread.user.id) {
        return Ok(false);
    }
    conn.execute("UPDATE threads SET views = views + 1 WHERE id = ?1", [thread.id])?;
    Ok(true)
}

pub fn thread_detail(
    conn: &Connection,
    viewer: Option<&Principal>,
    id: i64,
    page: Option<i64>,
    limit: Option<i64>,
) -> ApiResult<ThreadDetail> {
    let thread = load_thread(conn, id)?;
    ensure_can_view(conn, thread.category_id, viewer)?;
    record_view(conn, &thread, viewer)?;

    let (subscribed, bookmarked) = match viewer {
        Some(v) => (
            subscriptions::is_member(conn, v.id, id, Membership::Subscription)?,
            subscriptions::is_member(conn, v.id, id, Membership::Bookmark)?,
        ),
        None => (false, false),
    };

    Ok(ThreadDetail {
        thread: load_thread(conn, id)?,
        posts: posts::list_posts(conn, id, page, limit)?,
        subscribed,
        bookmarked,
    })
}

fn ensure_owner_or_admin(thread: &Thread, actor: &Principal) -> ApiResult<()> {
    if thread.user.id == actor.id || actor.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("only the thread owner or an admin may do this"))
    }
}

pub fn update_thread(
    conn: &Connection,
    actor: &Principal,
    id: i64,
    patch: &UpdateThread,
) -> ApiResult<Thread> {
    let thread = load_thread(conn, id)?;
    ensure_owner_or_admin(&thread, actor)?;
    if thread.is_locked && !actor.is_admin() {
        return Err(ApiError::forbidden("thread is locked"));
    }
    if (patch.is_locked.is_some() || patch.is_sticky.is_some()) && !actor.is_admin() {
        return Err(ApiError::forbidden("only admins can lock or pin threads"));
    }

    let (title, slug) = match &patch.title {
        Some(title) => {
            let title = clean_required(title, "title")?;
            let slug = db::unique_slug(conn, "threads", &title, Some(id))?;
            (title, slug)
        }
        None => (thread.title, thread.slug),
    };

    conn.execute(
        "UPDATE threads SET title = ?1, slug = ?2,
            is_locked = COALESCE(?3, is_locked), is_sticky = COALESCE(?4, is_sticky)
         WHERE id = ?5",
        params![title, slug, patch.is_locked, patch.is_sticky, id],
    )?;

    load_thread(conn, id)
}

/// Deletes the thread and, through cascades, its posts, likes, mentions,
/// notifications, subscriptions and bookmarks. Authors' post counters
/// are decremented in the same transaction.
pub fn delete_thread(conn: &mut Connection, actor: &Principal, id: i64) -> ApiResult<()> {
    let thread = load_thread(conn, id)?;
    ensure_owner_or_admin(&thread, actor)?;

    let tx = conn.transaction()?;
    {
        let mut stmt =
            tx.prepare("SELECT user_id, COUNT(*) FROM posts WHERE thread_id = ?1 GROUP BY user_id")?;
        let authors = stmt
            .query_map([id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (user_id, count) in authors {
            tx.execute(
                "UPDATE users SET forum_post_count = MAX(forum_post_count - ?1, 0) WHERE id = ?2",
                params![count, user_id],
            )?;
        }
    }
    tx.execute("DELETE FROM threads WHERE id = ?1", [id])?;
    tx.commit()?;

    info!(thread = id, actor = actor.id, "thread deleted");
    Ok(())
}

/// Marks `post_id` as the accepted answer. Owner or admin.
pub fn solve_thread(conn: &Connection, actor: &Principal, id: i64, post_id: i64) -> ApiResult<Thread> {
    let thread = load_thread(conn, id)?;
    ensure_owner_or_admin(&thread, actor)?;
    let post = load_post(conn, post_id)?;
    if post.thread_id != id {
        return Err(ApiError::validation("post does not belong to this thread"));
    }

    conn.execute(
        "UPDATE threads SET is_solved = 1, solved_post_id = ?1 WHERE id = ?2",
        params![post_id, id],
    )?;
    load_thread(conn, id)
}

pub fn unsolve_thread(conn: &Connection, actor: &Principal, id: i64) -> ApiResult<Thread> {
    let thread = load_thread(conn, id)?;
    ensure_owner_or_admin(&thread, actor)?;
    conn.execute(
        "UPDATE threads SET is_solved = 0, solved_post_id = NULL WHERE id = ?1",
        [id],
    )?;
    load_thread(conn, id)
}

// ── Handlers ──

/// GET /api/forum/threads?category=general&sort=latest&page=1
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ThreadListParams>,
) -> ApiResult<Json<Paginated<Thread>>> {
    let viewer = auth::optional_principal(&headers, &state.jwt_secret);
    let result =
        db::blocking(&state.db, move |conn| list_threads(conn, viewer.as_ref(), &params)).await?;
    Ok(Json(result))
}

/// POST /api/forum/threads
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateThread>,
) -> ApiResult<Json<ThreadCreated>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let created = db::blocking(&state.db, move |conn| create_thread(conn, &actor, &payload)).await?;
    Ok(Json(created))
}

#[derive(Deserialize)]
pub struct DetailParams {
    page: Option<i64>,
    limit: Option<i64>,
}

/// GET /api/forum/threads/:id
pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(params): Query<DetailParams>,
) -> ApiResult<Json<ThreadDetail>> {
    let viewer = auth::optional_principal(&headers, &state.jwt_secret);
    let detail = db::blocking(&state.db, move |conn| {
        thread_detail(conn, viewer.as_ref(), id, params.page, params.limit)
    })
    .await?;
    Ok(Json(detail))
}

/// PATCH /api/forum/threads/:id
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateThread>,
) -> ApiResult<Json<Thread>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let thread =
        db::blocking(&state.db, move |conn| update_thread(conn, &actor, id, &payload)).await?;
    Ok(Json(thread))
}

/// DELETE /api/forum/threads/:id
pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    db::blocking(&state.db, move |conn| delete_thread(conn, &actor, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/forum/threads/:id/solve
pub async fn solve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<SolveThread>,
) -> ApiResult<Json<Thread>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let thread =
        db::blocking(&state.db, move |conn| solve_thread(conn, &actor, id, payload.post_id)).await?;
    Ok(Json(thread))
}

/// DELETE /api/forum/threads/:id/solve
pub async fn unsolve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<Thread>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let thread = db::blocking(&state.db, move |conn| unsolve_thread(conn, &actor, id)).await?;
    Ok(Json(thread))
}
