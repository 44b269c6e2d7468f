pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod forum;
pub mod mentions;
pub mod quiz;
pub mod slug;
pub mod users;

use axum::{
    http::{header::InvalidHeaderValue, HeaderValue},
    routing::{get, patch, post},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    trace::TraceLayer,
};

pub use db::DbPool;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub jwt_secret: String,
}

/// Builds the full HTTP surface over `state`.
pub fn router(state: AppState, cors_origin: &str) -> Result<Router, InvalidHeaderValue> {
    let cors = CorsLayer::new()
        .allow_origin(cors_origin.parse::<HeaderValue>()?)
        .allow_methods(AllowMethods::any())
        .allow_headers(AllowHeaders::any());

    let app = Router::new()
        .route("/api/health", get(|| async { "ok" }))
        // Auth & users
        .route("/api/auth/me", get(auth::me))
        .route("/api/users/me", patch(users::update_me))
        .route("/api/users/{id}", get(users::get_user))
        .route("/api/admin/users", post(users::sync_user))
        .route("/api/admin/users/{id}/ban", post(users::ban_user))
        .route("/api/admin/users/{id}/unban", post(users::unban_user))
        .route("/api/admin/users/{id}/reputation", post(users::change_reputation))
        // Forum
        .route(
            "/api/forum/categories",
            get(forum::categories::list).post(forum::categories::create),
        )
        .route(
            "/api/forum/categories/{id}",
            get(forum::categories::get)
                .patch(forum::categories::update)
                .delete(forum::categories::delete),
        )
        .route(
            "/api/forum/threads",
            get(forum::threads::list).post(forum::threads::create),
        )
        .route(
            "/api/forum/threads/{id}",
            get(forum::threads::get)
                .patch(forum::threads::update)
                .delete(forum::threads::delete),
        )
        .route(
            "/api/forum/threads/{id}/solve",
            post(forum::threads::solve).delete(forum::threads::unsolve),
        )
        .route(
            "/api/forum/threads/{id}/posts",
            get(forum::posts::list).post(forum::posts::create),
        )
        .route(
            "/api/forum/threads/{id}/subscribe",
            post(forum::subscriptions::subscribe).delete(forum::subscriptions::unsubscribe),
        )
        .route(
            "/api/forum/threads/{id}/bookmark",
            post(forum::subscriptions::bookmark).delete(forum::subscriptions::unbookmark),
        )
        .route("/api/forum/bookmarks", get(forum::subscriptions::bookmarks))
        .route(
            "/api/forum/posts/{id}",
            patch(forum::posts::update).delete(forum::posts::delete),
        )
        .route("/api/forum/posts/{id}/likes", get(forum::likes::get_likes))
        .route(
            "/api/forum/posts/{id}/like",
            post(forum::likes::like).delete(forum::likes::unlike),
        )
        // Notifications
        .route("/api/notifications", get(forum::notifications::list))
        .route("/api/notifications/read-all", post(forum::notifications::read_all))
        .route("/api/notifications/{id}/read", post(forum::notifications::read))
        // Quiz
        .route(
            "/api/quiz/categories",
            get(quiz::list_categories).post(quiz::create_category),
        )
        .route(
            "/api/quiz/quizzes",
            get(quiz::quizzes::list).post(quiz::quizzes::create),
        )
        .route(
            "/api/quiz/quizzes/{id}",
            get(quiz::quizzes::get)
                .patch(quiz::quizzes::update)
                .delete(quiz::quizzes::delete),
        )
        .route("/api/quiz/quizzes/{id}/questions", post(quiz::questions::create))
        .route(
            "/api/quiz/quizzes/{id}/attempts",
            get(quiz::attempts::list_mine).post(quiz::attempts::start),
        )
        .route(
            "/api/quiz/questions/{id}",
            get(quiz::questions::get)
                .put(quiz::questions::update)
                .delete(quiz::questions::delete),
        )
        .route("/api/quiz/attempts/{id}", get(quiz::attempts::get))
        .route("/api/quiz/attempts/{id}/responses", post(quiz::attempts::submit))
        .route("/api/quiz/attempts/{id}/complete", post(quiz::attempts::complete))
        // Catalog
        .route(
            "/api/catalog/{kind}",
            get(catalog::list).post(catalog::create),
        )
        .route(
            "/api/catalog/{kind}/{key}",
            get(catalog::get)
                .patch(catalog::update)
                .delete(catalog::delete),
        )
        .route(
            "/api/catalog/{kind}/{key}/reviews",
            get(catalog::reviews).post(catalog::review),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    Ok(app)
}
