//! Per-user thread memberships: subscriptions drive reply notifications,
//! bookmarks are a personal reading list. Neither depends on ownership.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use rusqlite::{params, Connection};
use scholia_shared::{Paginated, Principal, Thread};
use serde::Deserialize;

use super::{ensure_can_view, load_thread, thread_from_row, THREAD_SELECT};
use crate::{auth, db, error::ApiResult, AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Subscription,
    Bookmark,
}

impl Membership {
    fn table(self) -> &'static str {
        match self {
            Membership::Subscription => "thread_subscriptions",
            Membership::Bookmark => "thread_bookmarks",
        }
    }
}

/// Adding an existing membership is a no-op.
pub fn add(conn: &Connection, actor: &Principal, thread_id: i64, kind: Membership) -> ApiResult<()> {
    let thread = load_thread(conn, thread_id)?;
    ensure_can_view(conn, thread.category_id, Some(actor))?;
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {} (user_id, thread_id, created_at) VALUES (?1, ?2, ?3)",
            kind.table()
        ),
        params![actor.id, thread_id, Utc::now()],
    )?;
    Ok(())
}

/// Removing a missing membership is a no-op.
pub fn remove(conn: &Connection, actor: &Principal, thread_id: i64, kind: Membership) -> ApiResult<()> {
    load_thread(conn, thread_id)?;
    conn.execute(
        &format!("DELETE FROM {} WHERE user_id = ?1 AND thread_id = ?2", kind.table()),
        params![actor.id, thread_id],
    )?;
    Ok(())
}

pub fn is_member(conn: &Connection, user_id: i64, thread_id: i64, kind: Membership) -> ApiResult<bool> {
    Ok(conn.query_row(
        &format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE user_id = ?1 AND thread_id = ?2)",
            kind.table()
        ),
        params![user_id, thread_id],
        |row| row.get(0),
    )?)
}

pub fn list_bookmarks(
    conn: &Connection,
    user_id: i64,
    page: Option<i64>,
    limit: Option<i64>,
) -> ApiResult<Paginated<Thread>> {
    let (page, limit, offset) = db::page_window(page, limit);
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM thread_bookmarks WHERE user_id = ?1",
        [user_id],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "{THREAD_SELECT} JOIN thread_bookmarks b ON b.thread_id = t.id
         WHERE b.user_id = ?1 ORDER BY b.created_at DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let threads = stmt
        .query_map(params![user_id, limit, offset], thread_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Paginated::new(threads, page, limit, total))
}

// ── Handlers ──

async fn change(
    state: AppState,
    headers: HeaderMap,
    thread_id: i64,
    kind: Membership,
    subscribe: bool,
) -> ApiResult<StatusCode> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    db::blocking(&state.db, move |conn| {
        if subscribe {
            add(conn, &actor, thread_id, kind)
        } else {
            remove(conn, &actor, thread_id, kind)
        }
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/forum/threads/:id/subscribe
pub async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<i64>,
) -> ApiResult<StatusCode> {
    change(state, headers, thread_id, Membership::Subscription, true).await
}

/// DELETE /api/forum/threads/:id/subscribe
pub async fn unsubscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<i64>,
) -> ApiResult<StatusCode> {
    change(state, headers, thread_id, Membership::Subscription, false).await
}

/// POST /api/forum/threads/:id/bookmark
pub async fn bookmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<i64>,
) -> ApiResult<StatusCode> {
    change(state, headers, thread_id, Membership::Bookmark, true).await
}

/// DELETE /api/forum/threads/:id/bookmark
pub async fn unbookmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<i64>,
) -> ApiResult<StatusCode> {
    change(state, headers, thread_id, Membership::Bookmark, false).await
}

#[derive(Deserialize)]
pub struct BookmarkParams {
    page: Option<i64>,
    limit: Option<i64>,
}

/// GET /api/forum/bookmarks
pub async fn bookmarks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<BookmarkParams>,
) -> ApiResult<Json<Paginated<Thread>>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let threads = db::blocking(&state.db, move |conn| {
        list_bookmarks(conn, actor.id, params.page, params.limit)
    })
    .await?;
    Ok(Json(threads))
}
