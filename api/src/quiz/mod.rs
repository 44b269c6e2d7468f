//! Quizzes → questions → options, plus attempts and graded responses.

pub mod attempts;
pub mod grading;
pub mod questions;
pub mod quizzes;

use axum::{extract::State, http::HeaderMap, Json};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use scholia_shared::{
    CreateQuizCategory, Difficulty, Principal, PublishStatus, Question, QuestionType, Quiz,
    QuizCategory, QuizOption,
};

use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    AppState,
};

fn conversion_error(column: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        Type::Text,
        format!("unknown {what} '{value}'").into(),
    )
}

pub(crate) const QUIZ_SELECT: &str =
    "SELECT q.id, q.title, q.slug, q.description, q.difficulty, q.passing_score,
            q.time_limit_minutes, q.attempts_allowed, q.randomize_questions,
            q.randomize_answers, q.status, q.created_by, q.created_at, q.updated_at,
            (SELECT COUNT(*) FROM quiz_questions WHERE quiz_id = q.id)
     FROM quizzes q";

/// Maps a quiz row; `category_ids` is filled in by [`load_quiz`].
pub(crate) fn quiz_from_row(row: &Row<'_>) -> rusqlite::Result<Quiz> {
    let difficulty: String = row.get(4)?;
    let status: String = row.get(10)?;
    Ok(Quiz {
        id: row.get(0)?,
        title: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        difficulty: Difficulty::parse(&difficulty)
            .ok_or_else(|| conversion_error(4, "difficulty", &difficulty))?,
        passing_score: row.get(5)?,
        time_limit_minutes: row.get(6)?,
        attempts_allowed: row.get(7)?,
        randomize_questions: row.get(8)?,
        randomize_answers: row.get(9)?,
        status: PublishStatus::parse(&status)
            .ok_or_else(|| conversion_error(10, "status", &status))?,
        created_by: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        question_count: row.get(14)?,
        category_ids: Vec::new(),
    })
}

pub(crate) fn category_ids(conn: &Connection, quiz_id: i64) -> ApiResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT category_id FROM quiz_category_assignments WHERE quiz_id = ?1 ORDER BY category_id",
    )?;
    let ids = stmt
        .query_map([quiz_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn load_quiz(conn: &Connection, id: i64) -> ApiResult<Quiz> {
    let mut quiz = conn
        .query_row(&format!("{QUIZ_SELECT} WHERE q.id = ?1"), [id], quiz_from_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("quiz"))?;
    quiz.category_ids = category_ids(conn, id)?;
    Ok(quiz)
}

/// Drafts and archived quizzes are invisible to everyone but admins.
pub(crate) fn ensure_visible(quiz: &Quiz, viewer: Option<&Principal>) -> ApiResult<()> {
    if quiz.status == PublishStatus::Published || viewer.is_some_and(Principal::is_admin) {
        Ok(())
    } else {
        Err(ApiError::not_found("quiz"))
    }
}

pub(crate) const QUESTION_SELECT: &str =
    "SELECT id, quiz_id, question_text, question_type, order_in_quiz, explanation_text,
            related_article_url
     FROM quiz_questions";

fn question_from_row(row: &Row<'_>) -> rusqlite::Result<Question> {
    let kind: String = row.get(3)?;
    Ok(Question {
        id: row.get(0)?,
        quiz_id: row.get(1)?,
        question_text: row.get(2)?,
        question_type: QuestionType::parse(&kind)
            .ok_or_else(|| conversion_error(3, "question type", &kind))?,
        order_in_quiz: row.get(4)?,
        explanation_text: row.get(5)?,
        related_article_url: row.get(6)?,
        options: Vec::new(),
    })
}

fn load_options(conn: &Connection, question_id: i64, reveal: bool) -> ApiResult<Vec<QuizOption>> {
    let mut stmt = conn.prepare(
        "SELECT id, question_id, option_text, is_correct, order_in_question
         FROM quiz_options WHERE question_id = ?1 ORDER BY order_in_question, id",
    )?;
    let options = stmt
        .query_map([question_id], |row| {
            Ok(QuizOption {
                id: row.get(0)?,
                question_id: row.get(1)?,
                option_text: row.get(2)?,
                is_correct: if reveal { Some(row.get(3)?) } else { None },
                order_in_question: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(options)
}

/// With `reveal` off, correctness flags and explanations are stripped.
fn with_options(conn: &Connection, mut question: Question, reveal: bool) -> ApiResult<Question> {
    question.options = load_options(conn, question.id, reveal)?;
    if !reveal {
        question.explanation_text = None;
    }
    Ok(question)
}

pub fn load_question(conn: &Connection, id: i64, reveal: bool) -> ApiResult<Question> {
    let question = conn
        .query_row(&format!("{QUESTION_SELECT} WHERE id = ?1"), [id], question_from_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("question"))?;
    with_options(conn, question, reveal)
}

/// Questions of a quiz in `order_in_quiz` order.
pub fn load_questions(conn: &Connection, quiz_id: i64, reveal: bool) -> ApiResult<Vec<Question>> {
    let mut stmt = conn.prepare(&format!(
        "{QUESTION_SELECT} WHERE quiz_id = ?1 ORDER BY order_in_quiz, id"
    ))?;
    let questions = stmt
        .query_map([quiz_id], question_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    questions
        .into_iter()
        .map(|q| with_options(conn, q, reveal))
        .collect()
}

// ── Quiz categories ──

pub fn list_quiz_categories(conn: &Connection) -> ApiResult<Vec<QuizCategory>> {
    let mut stmt = conn.prepare("SELECT id, name, slug FROM quiz_categories ORDER BY name")?;
    let cats = stmt
        .query_map([], |row| {
            Ok(QuizCategory {
                id: row.get(0)?,
                name: row.get(1)?,
                slug: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cats)
}

pub fn create_quiz_category(
    conn: &Connection,
    actor: &Principal,
    input: &CreateQuizCategory,
) -> ApiResult<QuizCategory> {
    auth::require_admin(actor)?;
    let name = ammonia::clean(input.name.trim());
    if name.trim().is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    let slug = db::unique_slug(conn, "quiz_categories", &name, None)?;
    conn.execute(
        "INSERT INTO quiz_categories (name, slug) VALUES (?1, ?2)",
        params![name, slug],
    )?;
    Ok(QuizCategory {
        id: conn.last_insert_rowid(),
        name,
        slug,
    })
}

/// GET /api/quiz/categories
pub async fn list_categories(State(state): State<AppState>) -> ApiResult<Json<Vec<QuizCategory>>> {
    let cats = db::blocking(&state.db, |conn| list_quiz_categories(conn)).await?;
    Ok(Json(cats))
}

/// POST /api/quiz/categories
pub async fn create_category(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateQuizCategory>,
) -> ApiResult<Json<QuizCategory>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let cat =
        db::blocking(&state.db, move |conn| create_quiz_category(conn, &actor, &payload)).await?;
    Ok(Json(cat))
}
