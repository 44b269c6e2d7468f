use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use rusqlite::{params, params_from_iter, types::Value, Connection};
use scholia_shared::{
    CreateQuiz, Difficulty, Paginated, Principal, PublishStatus, Quiz, QuizDetail, UpdateQuiz,
};
use serde::Deserialize;
use tracing::info;

use super::{category_ids, ensure_visible, load_questions, load_quiz, quiz_from_row, QUIZ_SELECT};
use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    AppState,
};

fn parse_difficulty(value: &str) -> ApiResult<Difficulty> {
    Difficulty::parse(value)
        .ok_or_else(|| ApiError::validation(format!("invalid difficulty '{value}'")))
}

pub(crate) fn parse_status(value: &str) -> ApiResult<PublishStatus> {
    PublishStatus::parse(value)
        .ok_or_else(|| ApiError::validation(format!("invalid status '{value}'")))
}

fn check_passing_score(score: i64) -> ApiResult<()> {
    if (0..=100).contains(&score) {
        Ok(())
    } else {
        Err(ApiError::validation("passing_score must be between 0 and 100"))
    }
}

fn check_positive(value: Option<i64>, field: &str) -> ApiResult<()> {
    match value {
        Some(v) if v <= 0 => Err(ApiError::validation(format!("{field} must be positive"))),
        _ => Ok(()),
    }
}

/// Replace-all: the quiz ends up assigned to exactly `ids`.
fn replace_categories(conn: &Connection, quiz_id: i64, ids: &[i64]) -> ApiResult<()> {
    conn.execute(
        "DELETE FROM quiz_category_assignments WHERE quiz_id = ?1",
        [quiz_id],
    )?;
    let mut exists = conn.prepare("SELECT EXISTS(SELECT 1 FROM quiz_categories WHERE id = ?1)")?;
    for &category_id in ids {
        if !exists.query_row([category_id], |row| row.get::<_, bool>(0))? {
            return Err(ApiError::validation(format!(
                "quiz category {category_id} does not exist"
            )));
        }
        conn.execute(
            "INSERT OR IGNORE INTO quiz_category_assignments (quiz_id, category_id) VALUES (?1, ?2)",
            params![quiz_id, category_id],
        )?;
    }
    Ok(())
}

pub fn create_quiz(conn: &mut Connection, actor: &Principal, input: &CreateQuiz) -> ApiResult<Quiz> {
    auth::require_admin(actor)?;
    let title = ammonia::clean(input.title.trim());
    if title.trim().is_empty() {
        return Err(ApiError::validation("title is required"));
    }
    let difficulty = input
        .difficulty
        .as_deref()
        .map(parse_difficulty)
        .transpose()?
        .unwrap_or_default();
    let status = input
        .status
        .as_deref()
        .map(parse_status)
        .transpose()?
        .unwrap_or_default();
    let passing_score = input.passing_score.unwrap_or(70);
    check_passing_score(passing_score)?;
    check_positive(input.time_limit_minutes, "time_limit_minutes")?;
    check_positive(input.attempts_allowed, "attempts_allowed")?;

    let now = Utc::now();
    let tx = conn.transaction()?;
    let slug = db::unique_slug(&tx, "quizzes", &title, None)?;
    tx.execute(
        "INSERT INTO quizzes (title, slug, description, difficulty, passing_score,
            time_limit_minutes, attempts_allowed, randomize_questions, randomize_answers,
            status, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            title,
            slug,
            input.description.as_deref().map(ammonia::clean).unwrap_or_default(),
            difficulty.as_str(),
            passing_score,
            input.time_limit_minutes,
            input.attempts_allowed,
            input.randomize_questions.unwrap_or(false),
            input.randomize_answers.unwrap_or(false),
            status.as_str(),
            actor.id,
            now
        ],
    )?;
    let id = tx.last_insert_rowid();
    if let Some(ids) = &input.category_ids {
        replace_categories(&tx, id, ids)?;
    }
    tx.commit()?;

    info!(quiz = id, slug = %slug, "quiz created");
    load_quiz(conn, id)
}

/// Partial update; unspecified fields keep their value. A supplied
/// `category_ids` replaces the whole assignment set.
pub fn update_quiz(
    conn: &mut Connection,
    actor: &Principal,
    id: i64,
    patch: &UpdateQuiz,
) -> ApiResult<Quiz> {
    auth::require_admin(actor)?;
    let current = load_quiz(conn, id)?;

    let difficulty = patch.difficulty.as_deref().map(parse_difficulty).transpose()?;
    let status = patch.status.as_deref().map(parse_status).transpose()?;
    if let Some(score) = patch.passing_score {
        check_passing_score(score)?;
    }
    check_positive(patch.time_limit_minutes, "time_limit_minutes")?;
    check_positive(patch.attempts_allowed, "attempts_allowed")?;

    let tx = conn.transaction()?;
    let (title, slug) = match &patch.title {
        Some(title) => {
            let title = ammonia::clean(title.trim());
            if title.trim().is_empty() {
                return Err(ApiError::validation("title is required"));
            }
            let slug = db::unique_slug(&tx, "quizzes", &title, Some(id))?;
            (title, slug)
        }
        None => (current.title, current.slug),
    };

    tx.execute(
        "UPDATE quizzes SET
            title = ?1, slug = ?2,
            description = COALESCE(?3, description),
            difficulty = COALESCE(?4, difficulty),
            passing_score = COALESCE(?5, passing_score),
            time_limit_minutes = COALESCE(?6, time_limit_minutes),
            attempts_allowed = COALESCE(?7, attempts_allowed),
            randomize_questions = COALESCE(?8, randomize_questions),
            randomize_answers = COALESCE(?9, randomize_answers),
            status = COALESCE(?10, status),
            updated_at = ?11
         WHERE id = ?12",
        params![
            title,
            slug,
            patch.description.as_deref().map(ammonia::clean),
            difficulty.map(Difficulty::as_str),
            patch.passing_score,
            patch.time_limit_minutes,
            patch.attempts_allowed,
            patch.randomize_questions,
            patch.randomize_answers,
            status.map(PublishStatus::as_str),
            Utc::now(),
            id
        ],
    )?;
    if let Some(ids) = &patch.category_ids {
        replace_categories(&tx, id, ids)?;
    }
    tx.commit()?;

    load_quiz(conn, id)
}

/// Cascades to questions, options, attempts, responses and category
/// assignments.
pub fn delete_quiz(conn: &Connection, actor: &Principal, id: i64) -> ApiResult<()> {
    auth::require_admin(actor)?;
    let affected = conn.execute("DELETE FROM quizzes WHERE id = ?1", [id])?;
    if affected == 0 {
        return Err(ApiError::not_found("quiz"));
    }
    info!(quiz = id, "quiz deleted");
    Ok(())
}

pub fn quiz_detail(conn: &Connection, viewer: Option<&Principal>, id: i64) -> ApiResult<QuizDetail> {
    let quiz = load_quiz(conn, id)?;
    ensure_visible(&quiz, viewer)?;
    let reveal = viewer.is_some_and(Principal::is_admin);
    Ok(QuizDetail {
        questions: load_questions(conn, id, reveal)?,
        quiz,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct QuizListParams {
    pub status: Option<String>,
    pub difficulty: Option<String>,
    pub category: Option<i64>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// Non-admins only ever see published quizzes.
pub fn list_quizzes(
    conn: &Connection,
    viewer: Option<&Principal>,
    params: &QuizListParams,
) -> ApiResult<Paginated<Quiz>> {
    let (page, limit, offset) = db::page_window(params.page, params.limit);
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    let status = match params.status.as_deref().map(parse_status).transpose()? {
        _ if !viewer.is_some_and(Principal::is_admin) => Some(PublishStatus::Published),
        requested => requested,
    };
    if let Some(status) = status {
        values.push(Value::Text(status.as_str().to_string()));
        conditions.push(format!("q.status = ?{}", values.len()));
    }
    if let Some(difficulty) = params.difficulty.as_deref() {
        values.push(Value::Text(parse_difficulty(difficulty)?.as_str().to_string()));
        conditions.push(format!("q.difficulty = ?{}", values.len()));
    }
    if let Some(category) = params.category {
        values.push(Value::Integer(category));
        conditions.push(format!(
            "q.id IN (SELECT quiz_id FROM quiz_category_assignments WHERE category_id = ?{})",
            values.len()
        ));
    }
    if let Some(search) = params.search.as_deref().filter(|s| !s.trim().is_empty()) {
        values.push(Value::Text(format!("%{}%", search.trim())));
        let n = values.len();
        conditions.push(format!("(q.title LIKE ?{n} OR q.description LIKE ?{n})"));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM quizzes q {where_clause}"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    values.push(Value::Integer(limit));
    values.push(Value::Integer(offset));
    let n = values.len();
    let mut stmt = conn.prepare(&format!(
        "{QUIZ_SELECT} {where_clause} ORDER BY q.created_at DESC, q.id DESC LIMIT ?{} OFFSET ?{}",
        n - 1,
        n
    ))?;
    let mut quizzes = stmt
        .query_map(params_from_iter(values.iter()), quiz_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for quiz in &mut quizzes {
        quiz.category_ids = category_ids(conn, quiz.id)?;
    }

    Ok(Paginated::new(quizzes, page, limit, total))
}

// ── Handlers ──

/// GET /api/quiz/quizzes?status=published&difficulty=beginner&search=rust
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<QuizListParams>,
) -> ApiResult<Json<Paginated<Quiz>>> {
    let viewer = auth::optional_principal(&headers, &state.jwt_secret);
    let quizzes =
        db::blocking(&state.db, move |conn| list_quizzes(conn, viewer.as_ref(), &params)).await?;
    Ok(Json(quizzes))
}

/// GET /api/quiz/quizzes/:id
pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<QuizDetail>> {
    let viewer = auth::optional_principal(&headers, &state.jwt_secret);
    let detail = db::blocking(&state.db, move |conn| quiz_detail(conn, viewer.as_ref(), id)).await?;
    Ok(Json(detail))
}

/// POST /api/quiz/quizzes
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateQuiz>,
) -> ApiResult<Json<Quiz>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let quiz = db::blocking(&state.db, move |conn| create_quiz(conn, &actor, &payload)).await?;
    Ok(Json(quiz))
}

/// PATCH /api/quiz/quizzes/:id
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateQuiz>,
) -> ApiResult<Json<Quiz>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let quiz = db::blocking(&state.db, move |conn| update_quiz(conn, &actor, id, &payload)).await?;
    Ok(Json(quiz))
}

/// DELETE /api/quiz/quizzes/:id
pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    db::blocking(&state.db, move |conn| delete_quiz(conn, &actor, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
