use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use scholia_shared::{LikeResponse, NotificationKind, Principal};

use super::{notifications, username};
use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    users, AppState,
};

struct LikedPost {
    author_id: i64,
    thread_id: i64,
    thread_title: String,
}

fn liked_post(conn: &Connection, post_id: i64) -> ApiResult<LikedPost> {
    conn.query_row(
        "SELECT p.user_id, t.id, t.title FROM posts p JOIN threads t ON p.thread_id = t.id
         WHERE p.id = ?1",
        [post_id],
        |row| {
            Ok(LikedPost {
                author_id: row.get(0)?,
                thread_id: row.get(1)?,
                thread_title: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| ApiError::not_found("post"))
}

pub fn like_count(conn: &Connection, post_id: i64) -> ApiResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM post_likes WHERE post_id = ?1",
        [post_id],
        |row| row.get(0),
    )?)
}

fn has_liked(conn: &Connection, user_id: i64, post_id: i64) -> ApiResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM post_likes WHERE user_id = ?1 AND post_id = ?2)",
        params![user_id, post_id],
        |row| row.get(0),
    )?)
}

/// Idempotent: liking an already-liked post succeeds without a second
/// like row or a second notification.
pub fn like_post(conn: &mut Connection, actor: &Principal, post_id: i64) -> ApiResult<LikeResponse> {
    users::ensure_can_participate(conn, actor.id)?;
    let post = liked_post(conn, post_id)?;

    let tx = conn.transaction()?;
    let inserted = match tx.execute(
        "INSERT INTO post_likes (user_id, post_id, created_at) VALUES (?1, ?2, ?3)",
        params![actor.id, post_id, Utc::now()],
    ) {
        Ok(n) => n > 0,
        // A concurrent like from the same user won the race.
        Err(e) if db::is_unique_violation(&e) => false,
        Err(e) => return Err(e.into()),
    };

    if inserted && actor.id != post.author_id {
        let liker = username(&tx, actor.id)?;
        notifications::notify(
            &tx,
            actor.id,
            post.author_id,
            NotificationKind::Like,
            post_id,
            Some(post.thread_id),
            &format!("{liker} liked your post in \"{}\"", post.thread_title),
        )?;
        users::adjust_reputation(&tx, post.author_id, 1)?;
    }
    tx.commit()?;

    Ok(LikeResponse {
        like_count: like_count(conn, post_id)?,
        liked: true,
    })
}

pub fn unlike_post(conn: &mut Connection, actor: &Principal, post_id: i64) -> ApiResult<LikeResponse> {
    let post = liked_post(conn, post_id)?;

    let tx = conn.transaction()?;
    let removed = tx.execute(
        "DELETE FROM post_likes WHERE user_id = ?1 AND post_id = ?2",
        params![actor.id, post_id],
    )?;
    if removed == 0 {
        return Err(ApiError::not_found("like"));
    }
    if actor.id != post.author_id {
        users::adjust_reputation(&tx, post.author_id, -1)?;
    }
    tx.commit()?;

    Ok(LikeResponse {
        like_count: like_count(conn, post_id)?,
        liked: false,
    })
}

// ── Handlers ──

/// GET /api/forum/posts/:id/likes
pub async fn get_likes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(post_id): Path<i64>,
) -> ApiResult<Json<LikeResponse>> {
    let viewer = auth::optional_principal(&headers, &state.jwt_secret);
    let resp = db::blocking(&state.db, move |conn| {
        liked_post(conn, post_id)?;
        let liked = match viewer {
            Some(v) => has_liked(conn, v.id, post_id)?,
            None => false,
        };
        Ok(LikeResponse {
            like_count: like_count(conn, post_id)?,
            liked,
        })
    })
    .await?;
    Ok(Json(resp))
}

/// POST /api/forum/posts/:id/like
pub async fn like(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(post_id): Path<i64>,
) -> ApiResult<Json<LikeResponse>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let resp = db::blocking(&state.db, move |conn| like_post(conn, &actor, post_id)).await?;
    Ok(Json(resp))
}

/// DELETE /api/forum/posts/:id/like
pub async fn unlike(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(post_id): Path<i64>,
) -> ApiResult<Json<LikeResponse>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let resp = db::blocking(&state.db, move |conn| unlike_post(conn, &actor, post_id)).await?;
    Ok(Json(resp))
}
