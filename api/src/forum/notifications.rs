use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use rusqlite::{params, types::Type, Connection, Row};
use scholia_shared::{Notification, NotificationKind, Paginated};
use serde::Deserialize;

use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    AppState,
};

/// Notifies `user_id` of something `actor_id` did. Users are never
/// notified of their own actions.
pub fn notify(
    conn: &Connection,
    actor_id: i64,
    user_id: i64,
    kind: NotificationKind,
    reference_id: i64,
    thread_id: Option<i64>,
    message: &str,
) -> ApiResult<()> {
    if user_id == actor_id {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO notifications (user_id, type, reference_id, thread_id, message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![user_id, kind.as_str(), reference_id, thread_id, message, Utc::now()],
    )?;
    Ok(())
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let kind: String = row.get(2)?;
    let kind = NotificationKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown notification type {kind}").into(),
        )
    })?;

    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind,
        reference_id: row.get(3)?,
        thread_id: row.get(4)?,
        message: row.get(5)?,
        is_read: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub fn list_notifications(
    conn: &Connection,
    user_id: i64,
    unread_only: bool,
    page: Option<i64>,
    limit: Option<i64>,
) -> ApiResult<Paginated<Notification>> {
    let (page, limit, offset) = db::page_window(page, limit);
    let filter = if unread_only { "AND is_read = 0" } else { "" };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM notifications WHERE user_id = ?1 {filter}"),
        [user_id],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT id, user_id, type, reference_id, thread_id, message, is_read, created_at
         FROM notifications WHERE user_id = ?1 {filter}
         ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let items = stmt
        .query_map(params![user_id, limit, offset], notification_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Paginated::new(items, page, limit, total))
}

pub fn mark_read(conn: &Connection, user_id: i64, id: i64) -> ApiResult<()> {
    let affected = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
        params![id, user_id],
    )?;
    if affected == 0 {
        return Err(ApiError::not_found("notification"));
    }
    Ok(())
}

pub fn mark_all_read(conn: &Connection, user_id: i64) -> ApiResult<usize> {
    Ok(conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
        [user_id],
    )?)
}

// ── Handlers ──

#[derive(Deserialize)]
pub struct NotificationParams {
    #[serde(default)]
    unread: bool,
    page: Option<i64>,
    limit: Option<i64>,
}

/// GET /api/notifications?unread=true&page=1
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<NotificationParams>,
) -> ApiResult<Json<Paginated<Notification>>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let items = db::blocking(&state.db, move |conn| {
        list_notifications(conn, actor.id, params.unread, params.page, params.limit)
    })
    .await?;
    Ok(Json(items))
}

/// POST /api/notifications/:id/read
pub async fn read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    db::blocking(&state.db, move |conn| mark_read(conn, actor.id, id)).await?;
    Ok(Json(serde_json::json!({ "id": id, "is_read": true })))
}

/// POST /api/notifications/read-all
pub async fn read_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let updated = db::blocking(&state.db, move |conn| mark_all_read(conn, actor.id)).await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}
