use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode};

use crate::{
    catalog::CatalogKind,
    error::{ApiError, ApiResult},
    slug,
};

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

/// Opens a pooled SQLite database. Foreign keys are enforced on every
/// connection because thread and quiz deletion rely on cascades.
pub fn open_pool(path: &str, max_size: u32) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.pragma_update(None, "foreign_keys", "ON")?;
        c.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    });

    r2d2::Pool::builder().max_size(max_size).build(manager)
}

/// Runs `f` with a pooled connection on the blocking thread pool.
pub async fn blocking<T, F>(pool: &DbPool, f: F) -> ApiResult<T>
where
    F: FnOnce(&mut Connection) -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await
    .map_err(ApiError::internal)?
}

pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

/// Derives a slug from `source` that no other row of `table` uses.
/// `table` is always a compile-time constant.
pub fn unique_slug(
    conn: &Connection,
    table: &str,
    source: &str,
    exclude_id: Option<i64>,
) -> ApiResult<String> {
    let base = slug::slugify(source);
    if base.is_empty() {
        return Err(ApiError::validation(
            "a URL slug cannot be derived from the given text",
        ));
    }

    let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE slug = ?1 AND id != ?2)");
    let mut stmt = conn.prepare(&sql)?;
    slug::unique_slug(&base, |candidate| {
        stmt.query_row(params![candidate, exclude_id.unwrap_or(-1)], |row| {
            row.get::<_, bool>(0)
        })
        .map_err(ApiError::from)
    })
}

pub fn run_migrations(pool: &DbPool) -> Result<(), Box<dyn std::error::Error>> {
    let conn = pool.get()?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            username         TEXT UNIQUE NOT NULL COLLATE NOCASE,
            email            TEXT UNIQUE COLLATE NOCASE,
            role             TEXT NOT NULL DEFAULT 'user',
            avatar_url       TEXT,
            bio              TEXT,
            location         TEXT,
            social_links     TEXT NOT NULL DEFAULT '{}',
            last_active      TEXT,
            forum_reputation INTEGER NOT NULL DEFAULT 0,
            forum_post_count INTEGER NOT NULL DEFAULT 0,
            is_banned        INTEGER NOT NULL DEFAULT 0,
            ban_expires_at   TEXT,
            created_at       TEXT NOT NULL
        );

        -- ── Forum ──

        CREATE TABLE IF NOT EXISTS forum_categories (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            name          TEXT NOT NULL,
            slug          TEXT UNIQUE NOT NULL,
            description   TEXT NOT NULL DEFAULT '',
            parent_id     INTEGER REFERENCES forum_categories(id),
            permissions   TEXT NOT NULL,
            display_order INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_categories_parent ON forum_categories(parent_id);

        CREATE TABLE IF NOT EXISTS threads (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            category_id    INTEGER NOT NULL REFERENCES forum_categories(id),
            user_id        INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            title          TEXT NOT NULL,
            slug           TEXT UNIQUE NOT NULL,
            created_at     TEXT NOT NULL,
            last_post_at   TEXT NOT NULL,
            views          INTEGER NOT NULL DEFAULT 0,
            post_count     INTEGER NOT NULL DEFAULT 0,
            is_locked      INTEGER NOT NULL DEFAULT 0,
            is_sticky      INTEGER NOT NULL DEFAULT 0,
            is_solved      INTEGER NOT NULL DEFAULT 0,
            solved_post_id INTEGER REFERENCES posts(id) ON DELETE SET NULL
        );
        CREATE INDEX IF NOT EXISTS idx_threads_cat ON threads(category_id);

        CREATE TABLE IF NOT EXISTS posts (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id  INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            content    TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            is_edited  INTEGER NOT NULL DEFAULT 0,
            edited_at  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_posts_thread ON posts(thread_id);

        CREATE TABLE IF NOT EXISTS post_likes (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            post_id    INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            UNIQUE(user_id, post_id)
        );
        CREATE INDEX IF NOT EXISTS idx_likes_post ON post_likes(post_id);

        CREATE TABLE IF NOT EXISTS post_mentions (
            post_id           INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            mentioned_user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at        TEXT NOT NULL,
            PRIMARY KEY (post_id, mentioned_user_id)
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id      INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            type         TEXT NOT NULL,
            reference_id INTEGER NOT NULL,
            thread_id    INTEGER REFERENCES threads(id) ON DELETE CASCADE,
            message      TEXT NOT NULL,
            is_read      INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, is_read);

        CREATE TABLE IF NOT EXISTS thread_subscriptions (
            user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            thread_id  INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            PRIMARY KEY (user_id, thread_id)
        );

        CREATE TABLE IF NOT EXISTS thread_bookmarks (
            user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            thread_id  INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            PRIMARY KEY (user_id, thread_id)
        );

        -- ── Quiz ──

        CREATE TABLE IF NOT EXISTS quizzes (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            title               TEXT NOT NULL,
            slug                TEXT UNIQUE NOT NULL,
            description         TEXT NOT NULL DEFAULT '',
            difficulty          TEXT NOT NULL DEFAULT 'beginner',
            passing_score       INTEGER NOT NULL DEFAULT 70,
            time_limit_minutes  INTEGER,
            attempts_allowed    INTEGER,
            randomize_questions INTEGER NOT NULL DEFAULT 0,
            randomize_answers   INTEGER NOT NULL DEFAULT 0,
            status              TEXT NOT NULL DEFAULT 'draft',
            created_by          INTEGER NOT NULL REFERENCES users(id),
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS quiz_categories (
            id   INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            slug TEXT UNIQUE NOT NULL
        );

        CREATE TABLE IF NOT EXISTS quiz_category_assignments (
            quiz_id     INTEGER NOT NULL REFERENCES quizzes(id) ON DELETE CASCADE,
            category_id INTEGER NOT NULL REFERENCES quiz_categories(id) ON DELETE CASCADE,
            PRIMARY KEY (quiz_id, category_id)
        );

        CREATE TABLE IF NOT EXISTS quiz_questions (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            quiz_id             INTEGER NOT NULL REFERENCES quizzes(id) ON DELETE CASCADE,
            question_text       TEXT NOT NULL,
            question_type       TEXT NOT NULL,
            order_in_quiz       INTEGER NOT NULL,
            explanation_text    TEXT,
            related_article_url TEXT,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_questions_quiz ON quiz_questions(quiz_id, order_in_quiz);

        CREATE TABLE IF NOT EXISTS quiz_options (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            question_id       INTEGER NOT NULL REFERENCES quiz_questions(id) ON DELETE CASCADE,
            option_text       TEXT NOT NULL,
            is_correct        INTEGER NOT NULL DEFAULT 0,
            order_in_question INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_options_question ON quiz_options(question_id);

        CREATE TABLE IF NOT EXISTS quiz_attempts (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            quiz_id      INTEGER NOT NULL REFERENCES quizzes(id) ON DELETE CASCADE,
            user_id      INTEGER REFERENCES users(id) ON DELETE SET NULL,
            session_id   TEXT,
            start_time   TEXT NOT NULL,
            end_time     TEXT,
            score        REAL,
            passed       INTEGER,
            is_completed INTEGER NOT NULL DEFAULT 0,
            time_taken   INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_attempts_quiz ON quiz_attempts(quiz_id);

        CREATE TABLE IF NOT EXISTS quiz_responses (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            attempt_id          INTEGER NOT NULL REFERENCES quiz_attempts(id) ON DELETE CASCADE,
            question_id         INTEGER NOT NULL REFERENCES quiz_questions(id) ON DELETE CASCADE,
            selected_option_ids TEXT NOT NULL,
            is_correct          INTEGER NOT NULL,
            time_spent          INTEGER,
            answered_at         TEXT NOT NULL,
            UNIQUE(attempt_id, question_id)
        );
        ",
    )?;

    for kind in CatalogKind::ALL {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                slug        TEXT UNIQUE NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status      TEXT NOT NULL DEFAULT 'draft',
                tags        TEXT NOT NULL DEFAULT '[]',
                details     TEXT NOT NULL DEFAULT '{{}}',
                created_by  INTEGER REFERENCES users(id) ON DELETE SET NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );",
            table = kind.table()
        ))?;
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS product_reviews (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            product_id INTEGER NOT NULL REFERENCES catalog_products(id) ON DELETE CASCADE,
            user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            rating     INTEGER NOT NULL,
            body       TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            UNIQUE(product_id, user_id)
        );
        ",
    )?;

    Ok(())
}

/// Seeds the default forum category on an empty database.
pub fn seed_defaults(pool: &DbPool) -> Result<(), Box<dyn std::error::Error>> {
    let conn = pool.get()?;
    let permissions = serde_json::to_string(&scholia_shared::CategoryPermissions::default())?;
    conn.execute(
        "INSERT OR IGNORE INTO forum_categories
            (id, name, slug, description, permissions, display_order, created_at)
         VALUES (1, 'General', 'general', 'General discussion', ?1, 0, ?2)",
        params![permissions, chrono::Utc::now()],
    )?;
    Ok(())
}

/// Normalises `page`/`limit` query values into `(page, limit, offset)`.
pub fn page_window(page: Option<i64>, limit: Option<i64>) -> (i64, i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(20).clamp(1, 100);
    (page, limit, (page - 1).saturating_mul(limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_window_defaults_and_clamps() {
        assert_eq!(page_window(None, None), (1, 20, 0));
        assert_eq!(page_window(Some(3), Some(10)), (3, 10, 20));
        assert_eq!(page_window(Some(-4), Some(500)), (1, 100, 0));
        assert_eq!(page_window(Some(2), Some(0)), (2, 1, 1));
    }

    #[test]
    fn test_page_window_huge_page_saturates() {
        let (page, limit, offset) = page_window(Some(i64::MAX), Some(100));
        assert_eq!((page, limit), (i64::MAX, 100));
        assert_eq!(offset, i64::MAX);
    }
}
