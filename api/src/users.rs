use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use scholia_shared::{AdjustReputation, BanUser, NewUser, Principal, Role, UpdateProfile, UserProfile};
use tracing::info;

use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    AppState,
};

const PROFILE_COLUMNS: &str = "id, username, email, role, avatar_url, bio, location, social_links,
     last_active, forum_reputation, forum_post_count, is_banned, ban_expires_at, created_at";

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
    let links: String = row.get(7)?;
    let social_links: BTreeMap<String, String> = serde_json::from_str(&links)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    let role: String = row.get(3)?;

    Ok(UserProfile {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        role: Role::from_db(&role),
        avatar_url: row.get(4)?,
        bio: row.get(5)?,
        location: row.get(6)?,
        social_links,
        last_active: row.get(8)?,
        forum_reputation: row.get(9)?,
        forum_post_count: row.get(10)?,
        is_banned: row.get(11)?,
        ban_expires_at: row.get(12)?,
        created_at: row.get(13)?,
    })
}

/// A ban whose expiry has passed no longer applies.
pub fn ban_in_effect(is_banned: bool, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    is_banned && expires_at.map_or(true, |at| at > now)
}

pub fn get_profile(conn: &Connection, user_id: i64) -> ApiResult<UserProfile> {
    conn.query_row(
        &format!("SELECT {PROFILE_COLUMNS} FROM users WHERE id = ?1"),
        [user_id],
        profile_from_row,
    )
    .optional()?
    .ok_or_else(|| ApiError::not_found("user"))
}

/// Inserts or refreshes a user record on behalf of the auth provider.
pub fn upsert_user(conn: &Connection, new: &NewUser) -> ApiResult<UserProfile> {
    let username = new.username.trim();
    if username.is_empty() || username.contains(|c: char| c.is_whitespace() || c == '@') {
        return Err(ApiError::validation(
            "username must be non-empty without spaces or '@'",
        ));
    }

    conn.execute(
        "INSERT INTO users (username, email, role, avatar_url, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(username) DO UPDATE SET
            email = excluded.email,
            role = excluded.role,
            avatar_url = COALESCE(excluded.avatar_url, users.avatar_url)",
        params![username, new.email, new.role.as_str(), new.avatar_url, Utc::now()],
    )?;

    let id: i64 = conn.query_row(
        "SELECT id FROM users WHERE username = ?1",
        [username],
        |row| row.get(0),
    )?;
    get_profile(conn, id)
}

/// Rejects users under an active ban. Unknown users are unauthenticated.
pub fn ensure_can_participate(conn: &Connection, user_id: i64) -> ApiResult<()> {
    let row: Option<(bool, Option<DateTime<Utc>>)> = conn
        .query_row(
            "SELECT is_banned, ban_expires_at FROM users WHERE id = ?1",
            [user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        None => Err(ApiError::Unauthorized),
        Some((banned, expires)) if ban_in_effect(banned, expires, Utc::now()) => {
            Err(ApiError::forbidden("user is banned from the forum"))
        }
        Some(_) => Ok(()),
    }
}

pub fn touch_last_active(conn: &Connection, user_id: i64, at: DateTime<Utc>) -> ApiResult<()> {
    conn.execute(
        "UPDATE users SET last_active = ?1 WHERE id = ?2",
        params![at, user_id],
    )?;
    Ok(())
}

/// Adds `delta` to the user's forum reputation.
pub fn adjust_reputation(conn: &Connection, user_id: i64, delta: i64) -> ApiResult<i64> {
    let affected = conn.execute(
        "UPDATE users SET forum_reputation = forum_reputation + ?1 WHERE id = ?2",
        params![delta, user_id],
    )?;
    if affected == 0 {
        return Err(ApiError::not_found("user"));
    }
    Ok(conn.query_row(
        "SELECT forum_reputation FROM users WHERE id = ?1",
        [user_id],
        |row| row.get(0),
    )?)
}

pub fn update_profile(conn: &Connection, user_id: i64, patch: &UpdateProfile) -> ApiResult<UserProfile> {
    let links = patch
        .social_links
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let affected = conn.execute(
        "UPDATE users SET
            avatar_url = COALESCE(?1, avatar_url),
            bio = COALESCE(?2, bio),
            location = COALESCE(?3, location),
            social_links = COALESCE(?4, social_links),
            last_active = ?5
         WHERE id = ?6",
        params![
            patch.avatar_url,
            patch.bio.as_deref().map(ammonia::clean),
            patch.location.as_deref().map(ammonia::clean),
            links,
            Utc::now(),
            user_id
        ],
    )?;
    if affected == 0 {
        return Err(ApiError::not_found("user"));
    }
    get_profile(conn, user_id)
}

pub fn set_ban(
    conn: &Connection,
    user_id: i64,
    banned: bool,
    expires_at: Option<DateTime<Utc>>,
) -> ApiResult<UserProfile> {
    let affected = conn.execute(
        "UPDATE users SET is_banned = ?1, ban_expires_at = ?2 WHERE id = ?3",
        params![banned, expires_at.filter(|_| banned), user_id],
    )?;
    if affected == 0 {
        return Err(ApiError::not_found("user"));
    }
    get_profile(conn, user_id)
}

// ── Handlers ──

/// GET /api/users/:id
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<UserProfile>> {
    let mut profile = db::blocking(&state.db, move |conn| get_profile(conn, id)).await?;
    profile.email = None;
    Ok(Json(profile))
}

/// PATCH /api/users/me
pub async fn update_me(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdateProfile>,
) -> ApiResult<Json<UserProfile>> {
    let principal = auth::principal(&headers, &state.jwt_secret)?;
    let profile =
        db::blocking(&state.db, move |conn| update_profile(conn, principal.id, &payload)).await?;
    Ok(Json(profile))
}

/// POST /api/admin/users: sync a user record from the auth provider
pub async fn sync_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewUser>,
) -> ApiResult<Json<UserProfile>> {
    admin(&headers, &state)?;
    let profile = db::blocking(&state.db, move |conn| upsert_user(conn, &payload)).await?;
    Ok(Json(profile))
}

/// POST /api/admin/users/:id/ban
pub async fn ban_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<BanUser>,
) -> ApiResult<Json<UserProfile>> {
    let principal = admin(&headers, &state)?;
    let until = payload.expires_at;
    let profile = db::blocking(&state.db, move |conn| set_ban(conn, id, true, until)).await?;
    info!(admin = principal.id, user = id, until = ?until, "user banned");
    Ok(Json(profile))
}

/// POST /api/admin/users/:id/unban
pub async fn unban_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<UserProfile>> {
    let principal = admin(&headers, &state)?;
    let profile = db::blocking(&state.db, move |conn| set_ban(conn, id, false, None)).await?;
    info!(admin = principal.id, user = id, "user unbanned");
    Ok(Json(profile))
}

/// POST /api/admin/users/:id/reputation
pub async fn change_reputation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<AdjustReputation>,
) -> ApiResult<Json<UserProfile>> {
    admin(&headers, &state)?;
    let profile = db::blocking(&state.db, move |conn| {
        adjust_reputation(conn, id, payload.delta)?;
        get_profile(conn, id)
    })
    .await?;
    Ok(Json(profile))
}

fn admin(headers: &HeaderMap, state: &AppState) -> ApiResult<Principal> {
    let principal = auth::principal(headers, &state.jwt_secret)?;
    auth::require_admin(&principal)?;
    Ok(principal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_ban_expiry() {
        let now = Utc::now();
        assert!(ban_in_effect(true, None, now));
        assert!(ban_in_effect(true, Some(now + Duration::hours(1)), now));
        assert!(!ban_in_effect(true, Some(now - Duration::hours(1)), now));
        assert!(!ban_in_effect(false, None, now));
    }
}
