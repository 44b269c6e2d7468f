use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use scholia_shared::{CreatePost, NotificationKind, Paginated, Post, Principal, UpdatePost};
use serde::Deserialize;
use tracing::debug;

use super::{
    allows, category_permissions, clean_required, load_post, load_thread, notifications, username,
    POST_SELECT,
};
use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    mentions, users, AppState,
};

/// The thread a post is being written into.
pub(crate) struct ThreadRef<'a> {
    pub id: i64,
    pub title: &'a str,
}

/// Inserts a post and applies every side effect that must commit with it:
/// counters, `last_post_at`, the author's `last_active`, mention
/// notifications and reply notifications to subscribers.
///
/// Must be called inside a transaction.
pub(crate) fn record_post(
    conn: &Connection,
    thread: &ThreadRef<'_>,
    author_id: i64,
    content: &str,
    now: DateTime<Utc>,
) -> ApiResult<i64> {
    conn.execute(
        "INSERT INTO posts (thread_id, user_id, content, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![thread.id, author_id, content, now],
    )?;
    let post_id = conn.last_insert_rowid();

    conn.execute(
        "UPDATE threads SET post_count = post_count + 1, last_post_at = ?1 WHERE id = ?2",
        params![now, thread.id],
    )?;
    conn.execute(
        "UPDATE users SET forum_post_count = forum_post_count + 1 WHERE id = ?1",
        [author_id],
    )?;
    users::touch_last_active(conn, author_id, now)?;

    let author = username(conn, author_id)?;
    notify_mentions(conn, thread, post_id, author_id, &author, content)?;

    let mut stmt = conn.prepare(
        "SELECT user_id FROM thread_subscriptions WHERE thread_id = ?1 AND user_id != ?2",
    )?;
    let subscribers = stmt
        .query_map(params![thread.id, author_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for subscriber in subscribers {
        notifications::notify(
            conn,
            author_id,
            subscriber,
            NotificationKind::Reply,
            post_id,
            Some(thread.id),
            &format!("{author} replied to \"{}\"", thread.title),
        )?;
    }

    Ok(post_id)
}

/// Maps `@handle` tokens to user ids by username or email. Unknown
/// handles are ignored.
pub fn resolve_handles(conn: &Connection, handles: &[String]) -> ApiResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM users WHERE username = ?1 COLLATE NOCASE OR email = ?1 COLLATE NOCASE",
    )?;
    let mut ids = Vec::new();
    for handle in handles {
        if let Some(id) = stmt.query_row([handle], |row| row.get::<_, i64>(0)).optional()? {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

/// Records a mention and notifies each newly mentioned user. Mentioning
/// the same user again in the same post, or oneself, does nothing.
fn notify_mentions(
    conn: &Connection,
    thread: &ThreadRef<'_>,
    post_id: i64,
    author_id: i64,
    author: &str,
    content: &str,
) -> ApiResult<()> {
    let handles = mentions::extract_handles(content);
    if handles.is_empty() {
        return Ok(());
    }

    for user_id in resolve_handles(conn, &handles)? {
        if user_id == author_id {
            continue;
        }
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO post_mentions (post_id, mentioned_user_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![post_id, user_id, Utc::now()],
        )?;
        if inserted == 0 {
            continue;
        }
        notifications::notify(
            conn,
            author_id,
            user_id,
            NotificationKind::Mention,
            post_id,
            Some(thread.id),
            &format!("{author} mentioned you in \"{}\"", thread.title),
        )?;
    }

    debug!(post = post_id, "mentions processed");
    Ok(())
}

pub fn create_post(
    conn: &mut Connection,
    actor: &Principal,
    thread_id: i64,
    input: &CreatePost,
) -> ApiResult<Post> {
    let content = clean_required(&input.content, "content")?;
    users::ensure_can_participate(conn, actor.id)?;

    let thread = load_thread(conn, thread_id)?;
    if thread.is_locked && !actor.is_admin() {
        return Err(ApiError::forbidden("thread is locked"));
    }
    let perms = category_permissions(conn, thread.category_id)?;
    if !allows(perms.reply, Some(actor)) {
        return Err(ApiError::forbidden("you cannot reply in this category"));
    }

    let tx = conn.transaction()?;
    let post_id = record_post(
        &tx,
        &ThreadRef {
            id: thread.id,
            title: &thread.title,
        },
        actor.id,
        &content,
        Utc::now(),
    )?;
    tx.commit()?;

    load_post(conn, post_id)
}

/// Author or admin; locked threads only accept admin edits. New mentions
/// in the edited text are notified, already-recorded ones are not.
pub fn update_post(
    conn: &mut Connection,
    actor: &Principal,
    post_id: i64,
    input: &UpdatePost,
) -> ApiResult<Post> {
    let content = clean_required(&input.content, "content")?;
    let post = load_post(conn, post_id)?;
    if post.user.id != actor.id && !actor.is_admin() {
        return Err(ApiError::forbidden("only the author can edit this post"));
    }
    let thread = load_thread(conn, post.thread_id)?;
    if thread.is_locked && !actor.is_admin() {
        return Err(ApiError::forbidden("thread is locked"));
    }

    let now = Utc::now();
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE posts SET content = ?1, updated_at = ?2, is_edited = 1, edited_at = ?2
         WHERE id = ?3",
        params![content, now, post_id],
    )?;
    let author = username(&tx, post.user.id)?;
    notify_mentions(
        &tx,
        &ThreadRef {
            id: thread.id,
            title: &thread.title,
        },
        post_id,
        post.user.id,
        &author,
        &content,
    )?;
    tx.commit()?;

    load_post(conn, post_id)
}

/// Author or admin. The opening post goes away only with its thread.
pub fn delete_post(conn: &mut Connection, actor: &Principal, post_id: i64) -> ApiResult<()> {
    let post = load_post(conn, post_id)?;
    if post.user.id != actor.id && !actor.is_admin() {
        return Err(ApiError::forbidden("only the author can delete this post"));
    }

    let first_post: i64 = conn.query_row(
        "SELECT MIN(id) FROM posts WHERE thread_id = ?1",
        [post.thread_id],
        |row| row.get(0),
    )?;
    if first_post == post_id {
        return Err(ApiError::validation(
            "the opening post cannot be deleted; delete the thread instead",
        ));
    }

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM posts WHERE id = ?1", [post_id])?;
    tx.execute(
        "UPDATE threads SET
            post_count = MAX(post_count - 1, 0),
            is_solved = CASE WHEN solved_post_id IS NULL THEN 0 ELSE is_solved END,
            last_post_at = COALESCE(
                (SELECT MAX(created_at) FROM posts WHERE thread_id = ?1), created_at)
         WHERE id = ?1",
        [post.thread_id],
    )?;
    tx.execute(
        "UPDATE users SET forum_post_count = MAX(forum_post_count - 1, 0) WHERE id = ?1",
        [post.user.id],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn list_posts(
    conn: &Connection,
    thread_id: i64,
    page: Option<i64>,
    limit: Option<i64>,
) -> ApiResult<Paginated<Post>> {
    let (page, limit, offset) = db::page_window(page, limit);
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM posts WHERE thread_id = ?1",
        [thread_id],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "{POST_SELECT} WHERE p.thread_id = ?1 ORDER BY p.created_at ASC, p.id ASC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let posts = stmt
        .query_map(params![thread_id, limit, offset], super::post_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Paginated::new(posts, page, limit, total))
}

// ── Handlers ──

#[derive(Deserialize)]
pub struct PostPageParams {
    page: Option<i64>,
    limit: Option<i64>,
}

/// GET /api/forum/threads/:id/posts
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<i64>,
    Query(params): Query<PostPageParams>,
) -> ApiResult<Json<Paginated<Post>>> {
    let viewer = auth::optional_principal(&headers, &state.jwt_secret);
    let posts = db::blocking(&state.db, move |conn| {
        let thread = load_thread(conn, thread_id)?;
        super::ensure_can_view(conn, thread.category_id, viewer.as_ref())?;
        list_posts(conn, thread_id, params.page, params.limit)
    })
    .await?;
    Ok(Json(posts))
}

/// POST /api/forum/threads/:id/posts
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<i64>,
    Json(payload): Json<CreatePost>,
) -> ApiResult<Json<Post>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let post =
        db::blocking(&state.db, move |conn| create_post(conn, &actor, thread_id, &payload)).await?;
    Ok(Json(post))
}

/// PATCH /api/forum/posts/:id
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<UpdatePost>,
) -> ApiResult<Json<Post>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let post = db::blocking(&state.db, move |conn| update_post(conn, &actor, id, &payload)).await?;
    Ok(Json(post))
}

/// DELETE /api/forum/posts/:id
pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    db::blocking(&state.db, move |conn| delete_post(conn, &actor, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
