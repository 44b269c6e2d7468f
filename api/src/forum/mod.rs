//! Categories → threads → posts, with likes, mentions, subscriptions and
//! the notifications they fan out.

pub mod categories;
pub mod likes;
pub mod notifications;
pub mod posts;
pub mod subscriptions;
pub mod threads;

use rusqlite::{types::Type, Connection, OptionalExtension, Row};
use scholia_shared::{Audience, CategoryPermissions, Post, Principal, Thread, User};

use crate::error::{ApiError, ApiResult};

pub(crate) const THREAD_SELECT: &str =
    "SELECT t.id, t.category_id, t.title, t.slug, t.created_at, t.last_post_at, t.views,
            t.post_count, t.is_locked, t.is_sticky, t.is_solved, t.solved_post_id,
            u.id, u.username, u.avatar_url
     FROM threads t JOIN users u ON t.user_id = u.id";

pub(crate) fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        category_id: row.get(1)?,
        title: row.get(2)?,
        slug: row.get(3)?,
        created_at: row.get(4)?,
        last_post_at: row.get(5)?,
        views: row.get(6)?,
        post_count: row.get(7)?,
        is_locked: row.get(8)?,
        is_sticky: row.get(9)?,
        is_solved: row.get(10)?,
        solved_post_id: row.get(11)?,
        user: User {
            id: row.get(12)?,
            username: row.get(13)?,
            avatar_url: row.get(14)?,
        },
    })
}

pub(crate) const POST_SELECT: &str =
    "SELECT p.id, p.thread_id, p.content, p.created_at, p.updated_at, p.is_edited, p.edited_at,
            u.id, u.username, u.avatar_url,
            (SELECT COUNT(*) FROM post_likes WHERE post_id = p.id)
     FROM posts p JOIN users u ON p.user_id = u.id";

pub(crate) fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        content: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        is_edited: row.get(5)?,
        edited_at: row.get(6)?,
        user: User {
            id: row.get(7)?,
            username: row.get(8)?,
            avatar_url: row.get(9)?,
        },
        like_count: row.get(10)?,
    })
}

pub fn load_thread(conn: &Connection, id: i64) -> ApiResult<Thread> {
    conn.query_row(&format!("{THREAD_SELECT} WHERE t.id = ?1"), [id], thread_from_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("thread"))
}

pub fn load_post(conn: &Connection, id: i64) -> ApiResult<Post> {
    conn.query_row(&format!("{POST_SELECT} WHERE p.id = ?1"), [id], post_from_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("post"))
}

/// Whether `viewer` (None = anonymous) belongs to `audience`.
pub fn allows(audience: Audience, viewer: Option<&Principal>) -> bool {
    match audience {
        Audience::All => true,
        Audience::Registered => viewer.is_some(),
        Audience::Admin => viewer.is_some_and(Principal::is_admin),
    }
}

pub(crate) fn parse_permissions(raw: &str, column: usize) -> rusqlite::Result<CategoryPermissions> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

pub fn category_permissions(conn: &Connection, category_id: i64) -> ApiResult<CategoryPermissions> {
    conn.query_row(
        "SELECT permissions FROM forum_categories WHERE id = ?1",
        [category_id],
        |row| parse_permissions(&row.get::<_, String>(0)?, 0),
    )
    .optional()?
    .ok_or_else(|| ApiError::not_found("category"))
}

/// Errors with Forbidden unless `viewer` may view threads of the category.
pub fn ensure_can_view(conn: &Connection, category_id: i64, viewer: Option<&Principal>) -> ApiResult<()> {
    let perms = category_permissions(conn, category_id)?;
    if allows(perms.view, viewer) {
        Ok(())
    } else {
        Err(ApiError::forbidden("you cannot view this category"))
    }
}

pub fn username(conn: &Connection, user_id: i64) -> ApiResult<String> {
    conn.query_row("SELECT username FROM users WHERE id = ?1", [user_id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| ApiError::not_found("user"))
}

/// Sanitises user-supplied text and rejects it when nothing is left.
pub(crate) fn clean_required(value: &str, field: &str) -> ApiResult<String> {
    let cleaned = ammonia::clean(value.trim());
    if cleaned.trim().is_empty() {
        Err(ApiError::validation(format!("{field} is required")))
    } else {
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scholia_shared::Role;

    #[test]
    fn test_audience_checks() {
        let user = Principal { id: 1, role: Role::User };
        let admin = Principal { id: 2, role: Role::Admin };

        assert!(allows(Audience::All, None));
        assert!(!allows(Audience::Registered, None));
        assert!(allows(Audience::Registered, Some(&user)));
        assert!(!allows(Audience::Admin, Some(&user)));
        assert!(allows(Audience::Admin, Some(&admin)));
    }

    #[test]
    fn test_clean_required_rejects_blank() {
        assert!(clean_required("   ", "title").is_err());
        assert!(clean_required("<script>x</script>", "content").is_err());
        assert_eq!(clean_required(" hi ", "content").unwrap(), "hi");
    }
}
