#![allow(dead_code)]

use rusqlite::Connection;
use scholia_api::{db, users, DbPool};
use scholia_shared::{NewUser, Principal, Role};
use tempfile::TempDir;

/// A migrated, seeded database living in a temporary directory. The
/// directory is removed when this is dropped.
pub struct TestDb {
    pub pool: DbPool,
    _dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("scholia-test.db");
        let pool = db::open_pool(path.to_str().expect("utf-8 path"), 4).expect("pool");
        db::run_migrations(&pool).expect("migrations");
        db::seed_defaults(&pool).expect("seed");
        Self { pool, _dir: dir }
    }

    pub fn conn(&self) -> r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager> {
        self.pool.get().expect("connection")
    }
}

/// The seeded "General" category.
pub const GENERAL: i64 = 1;

pub fn user(conn: &Connection, username: &str) -> Principal {
    create_user(conn, username, Role::User)
}

pub fn admin(conn: &Connection, username: &str) -> Principal {
    create_user(conn, username, Role::Admin)
}

fn create_user(conn: &Connection, username: &str, role: Role) -> Principal {
    let profile = users::upsert_user(
        conn,
        &NewUser {
            username: username.to_string(),
            email: Some(format!("{username}@example.com")),
            role,
            avatar_url: None,
        },
    )
    .expect("user");
    Principal {
        id: profile.id,
        role,
    }
}

pub fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> i64 {
    conn.query_row(sql, params, |row| row.get(0)).expect("count query")
}

pub fn notifications_of(conn: &Connection, user_id: i64, kind: &str) -> i64 {
    count(
        conn,
        "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND type = ?2",
        rusqlite::params![user_id, kind],
    )
}
