use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use rand::seq::SliceRandom;
use rusqlite::{
    params,
    types::{Type, Value},
    Connection, OptionalExtension, Row,
};
use scholia_shared::{
    Attempt, AttemptCaller, AttemptResult, AttemptStarted, Principal, QuestionResponse,
    SubmitResponse,
};
use tracing::info;

use super::{ensure_visible, grading, load_questions, load_quiz};
use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    AppState,
};

const ATTEMPT_SELECT: &str =
    "SELECT id, quiz_id, user_id, session_id, start_time, end_time, score, passed,
            is_completed, time_taken
     FROM quiz_attempts";

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<Attempt> {
    Ok(Attempt {
        id: row.get(0)?,
        quiz_id: row.get(1)?,
        user_id: row.get(2)?,
        session_id: row.get(3)?,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        score: row.get(6)?,
        passed: row.get(7)?,
        is_completed: row.get(8)?,
        time_taken: row.get(9)?,
    })
}

fn response_from_row(row: &Row<'_>) -> rusqlite::Result<QuestionResponse> {
    let raw: String = row.get(3)?;
    let selected = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(QuestionResponse {
        id: row.get(0)?,
        attempt_id: row.get(1)?,
        question_id: row.get(2)?,
        selected_option_ids: selected,
        is_correct: row.get(4)?,
        time_spent: row.get(5)?,
    })
}

pub fn load_attempt(conn: &Connection, id: i64) -> ApiResult<Attempt> {
    conn.query_row(&format!("{ATTEMPT_SELECT} WHERE id = ?1"), [id], attempt_from_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("attempt"))
}

/// Who is calling an attempt operation: a signed-in user, or an
/// anonymous caller identified by the session id they started with.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub principal: Option<Principal>,
    pub session_id: Option<String>,
}

impl Caller {
    pub fn new(principal: Option<Principal>, session_id: Option<String>) -> Self {
        let session_id = session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            principal,
            session_id,
        }
    }

    fn owns(&self, attempt: &Attempt) -> bool {
        match (attempt.user_id, &attempt.session_id) {
            (Some(user_id), _) => self.principal.is_some_and(|p| p.id == user_id),
            (None, Some(session)) => self.session_id.as_deref() == Some(session.as_str()),
            (None, None) => false,
        }
    }
}

fn ensure_owner(caller: &Caller, attempt: &Attempt) -> ApiResult<()> {
    if caller.owns(attempt) {
        Ok(())
    } else {
        Err(ApiError::forbidden("this attempt belongs to someone else"))
    }
}

/// Opens a new attempt. Questions come back without answers, shuffled
/// when the quiz asks for it.
pub fn start_attempt(conn: &Connection, caller: &Caller, quiz_id: i64) -> ApiResult<AttemptStarted> {
    let quiz = load_quiz(conn, quiz_id)?;
    ensure_visible(&quiz, caller.principal.as_ref())?;
    if quiz.question_count == 0 {
        return Err(ApiError::validation("this quiz has no questions yet"));
    }

    let user_id = caller.principal.map(|p| p.id);
    if user_id.is_none() && caller.session_id.is_none() {
        return Err(ApiError::validation("anonymous attempts need a session_id"));
    }

    conn.execute(
        "INSERT INTO quiz_attempts (quiz_id, user_id, session_id, start_time)
         VALUES (?1, ?2, ?3, ?4)",
        params![quiz_id, user_id, caller.session_id, Utc::now()],
    )?;
    let attempt = load_attempt(conn, conn.last_insert_rowid())?;

    let mut questions = load_questions(conn, quiz_id, false)?;
    let mut rng = rand::thread_rng();
    if quiz.randomize_questions {
        questions.shuffle(&mut rng);
    }
    if quiz.randomize_answers {
        for question in &mut questions {
            question.options.shuffle(&mut rng);
        }
    }

    info!(attempt = attempt.id, quiz = quiz_id, "attempt started");
    Ok(AttemptStarted { attempt, questions })
}

/// Grades and stores the answer to one question. Answering the same
/// question again replaces the earlier answer.
pub fn submit_response(
    conn: &Connection,
    caller: &Caller,
    attempt_id: i64,
    input: &SubmitResponse,
) -> ApiResult<QuestionResponse> {
    let attempt = load_attempt(conn, attempt_id)?;
    ensure_owner(caller, &attempt)?;
    if attempt.is_completed {
        return Err(ApiError::conflict("attempt is already completed"));
    }
    if input.time_spent.is_some_and(|t| t < 0) {
        return Err(ApiError::validation("time_spent cannot be negative"));
    }

    let question_quiz: i64 = conn
        .query_row(
            "SELECT quiz_id FROM quiz_questions WHERE id = ?1",
            [input.question_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| ApiError::not_found("question"))?;
    if question_quiz != attempt.quiz_id {
        return Err(ApiError::validation("question does not belong to this quiz"));
    }

    let mut stmt = conn.prepare("SELECT id, is_correct FROM quiz_options WHERE question_id = ?1")?;
    let options = stmt
        .query_map([input.question_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut selected = input.selected_option_ids.clone();
    selected.sort_unstable();
    selected.dedup();
    if selected.is_empty() {
        return Err(ApiError::validation("select at least one option"));
    }
    if let Some(stray) = selected.iter().find(|id| !options.iter().any(|(o, _)| o == *id)) {
        return Err(ApiError::validation(format!(
            "option {stray} does not belong to question {}",
            input.question_id
        )));
    }

    let correct: Vec<i64> = options.iter().filter(|(_, c)| *c).map(|(id, _)| *id).collect();
    let is_correct = grading::is_correct(&selected, &correct);

    // Writes nothing once the attempt has been completed.
    let written = conn.execute(
        "INSERT INTO quiz_responses
            (attempt_id, question_id, selected_option_ids, is_correct, time_spent, answered_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6
         WHERE EXISTS (SELECT 1 FROM quiz_attempts WHERE id = ?1 AND is_completed = 0)
         ON CONFLICT(attempt_id, question_id) DO UPDATE SET
            selected_option_ids = excluded.selected_option_ids,
            is_correct = excluded.is_correct,
            time_spent = excluded.time_spent,
            answered_at = excluded.answered_at",
        params![
            attempt_id,
            input.question_id,
            serde_json::to_string(&selected)?,
            is_correct,
            input.time_spent,
            Utc::now()
        ],
    )?;
    if written == 0 {
        return Err(ApiError::conflict("attempt is already completed"));
    }

    let response = conn.query_row(
        "SELECT id, attempt_id, question_id, selected_option_ids, is_correct, time_spent
         FROM quiz_responses WHERE attempt_id = ?1 AND question_id = ?2",
        params![attempt_id, input.question_id],
        response_from_row,
    )?;
    Ok(response)
}

/// Scores the attempt over every question in the quiz; unanswered
/// questions count as wrong. Completed attempts never change again.
pub fn complete_attempt(
    conn: &mut Connection,
    caller: &Caller,
    attempt_id: i64,
) -> ApiResult<AttemptResult> {
    let attempt = load_attempt(conn, attempt_id)?;
    ensure_owner(caller, &attempt)?;
    if attempt.is_completed {
        return Err(ApiError::conflict("attempt is already completed"));
    }
    let quiz = load_quiz(conn, attempt.quiz_id)?;

    let tx = conn.transaction()?;
    let total: i64 = tx.query_row(
        "SELECT COUNT(*) FROM quiz_questions WHERE quiz_id = ?1",
        [quiz.id],
        |row| row.get(0),
    )?;
    if total == 0 {
        return Err(ApiError::validation("this quiz has no questions"));
    }
    let correct: i64 = tx.query_row(
        "SELECT COUNT(*) FROM quiz_responses r
         JOIN quiz_questions q ON q.id = r.question_id
         WHERE r.attempt_id = ?1 AND q.quiz_id = ?2 AND r.is_correct = 1",
        params![attempt_id, quiz.id],
        |row| row.get(0),
    )?;

    let score = grading::score(correct, total);
    let passed = grading::passed(score, quiz.passing_score);
    let now = Utc::now();
    let time_taken = (now - attempt.start_time).num_seconds().max(0);

    let updated = tx.execute(
        "UPDATE quiz_attempts SET end_time = ?1, score = ?2, passed = ?3, is_completed = 1,
            time_taken = ?4
         WHERE id = ?5 AND is_completed = 0",
        params![now, score, passed, time_taken, attempt_id],
    )?;
    if updated == 0 {
        return Err(ApiError::conflict("attempt is already completed"));
    }
    tx.commit()?;

    info!(attempt = attempt_id, score, passed, "attempt completed");
    attempt_result(conn, caller, attempt_id)
}

/// The attempt with its responses. Once completed, the questions are
/// included with answers and explanations.
pub fn attempt_result(conn: &Connection, caller: &Caller, attempt_id: i64) -> ApiResult<AttemptResult> {
    let attempt = load_attempt(conn, attempt_id)?;
    if !caller.principal.is_some_and(|p| p.is_admin()) {
        ensure_owner(caller, &attempt)?;
    }

    let mut stmt = conn.prepare(
        "SELECT r.id, r.attempt_id, r.question_id, r.selected_option_ids, r.is_correct, r.time_spent
         FROM quiz_responses r
         JOIN quiz_questions q ON q.id = r.question_id
         WHERE r.attempt_id = ?1
         ORDER BY q.order_in_quiz, q.id",
    )?;
    let responses = stmt
        .query_map([attempt_id], response_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let total_questions: i64 = conn.query_row(
        "SELECT COUNT(*) FROM quiz_questions WHERE quiz_id = ?1",
        [attempt.quiz_id],
        |row| row.get(0),
    )?;
    let questions = if attempt.is_completed {
        load_questions(conn, attempt.quiz_id, true)?
    } else {
        Vec::new()
    };

    Ok(AttemptResult {
        correct_count: responses.iter().filter(|r| r.is_correct).count() as i64,
        total_questions,
        responses,
        questions,
        attempt,
    })
}

/// The caller's own attempts at a quiz, newest first.
pub fn list_my_attempts(conn: &Connection, caller: &Caller, quiz_id: i64) -> ApiResult<Vec<Attempt>> {
    load_quiz(conn, quiz_id)?;
    let (sql, owner) = match (&caller.principal, &caller.session_id) {
        (Some(p), _) => (
            format!("{ATTEMPT_SELECT} WHERE quiz_id = ?1 AND user_id = ?2 ORDER BY start_time DESC, id DESC"),
            Value::Integer(p.id),
        ),
        (None, Some(session)) => (
            format!(
                "{ATTEMPT_SELECT} WHERE quiz_id = ?1 AND user_id IS NULL AND session_id = ?2
                 ORDER BY start_time DESC, id DESC"
            ),
            Value::Text(session.clone()),
        ),
        (None, None) => return Err(ApiError::Unauthorized),
    };

    let mut stmt = conn.prepare(&sql)?;
    let attempts = stmt
        .query_map(params![quiz_id, owner], attempt_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(attempts)
}

// ── Handlers ──

/// POST /api/quiz/quizzes/:id/attempts
pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(quiz_id): Path<i64>,
    Json(payload): Json<AttemptCaller>,
) -> ApiResult<Json<AttemptStarted>> {
    let caller = Caller::new(
        auth::optional_principal(&headers, &state.jwt_secret),
        payload.session_id,
    );
    let started = db::blocking(&state.db, move |conn| start_attempt(conn, &caller, quiz_id)).await?;
    Ok(Json(started))
}

/// POST /api/quiz/attempts/:id/responses
pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(attempt_id): Path<i64>,
    Json(payload): Json<SubmitResponse>,
) -> ApiResult<Json<QuestionResponse>> {
    let caller = Caller::new(
        auth::optional_principal(&headers, &state.jwt_secret),
        payload.session_id.clone(),
    );
    let response = db::blocking(&state.db, move |conn| {
        submit_response(conn, &caller, attempt_id, &payload)
    })
    .await?;
    Ok(Json(response))
}

/// POST /api/quiz/attempts/:id/complete
pub async fn complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(attempt_id): Path<i64>,
    Json(payload): Json<AttemptCaller>,
) -> ApiResult<Json<AttemptResult>> {
    let caller = Caller::new(
        auth::optional_principal(&headers, &state.jwt_secret),
        payload.session_id,
    );
    let result =
        db::blocking(&state.db, move |conn| complete_attempt(conn, &caller, attempt_id)).await?;
    Ok(Json(result))
}

/// GET /api/quiz/attempts/:id?session_id=...
pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(attempt_id): Path<i64>,
    Query(params): Query<AttemptCaller>,
) -> ApiResult<Json<AttemptResult>> {
    let caller = Caller::new(
        auth::optional_principal(&headers, &state.jwt_secret),
        params.session_id,
    );
    let result =
        db::blocking(&state.db, move |conn| attempt_result(conn, &caller, attempt_id)).await?;
    Ok(Json(result))
}

/// GET /api/quiz/quizzes/:id/attempts?session_id=...
pub async fn list_mine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(quiz_id): Path<i64>,
    Query(params): Query<AttemptCaller>,
) -> ApiResult<Json<Vec<Attempt>>> {
    let caller = Caller::new(
        auth::optional_principal(&headers, &state.jwt_secret),
        params.session_id,
    );
    let attempts =
        db::blocking(&state.db, move |conn| list_my_attempts(conn, &caller, quiz_id)).await?;
    Ok(Json(attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scholia_shared::Role;

    fn attempt(user_id: Option<i64>, session_id: Option<&str>) -> Attempt {
        Attempt {
            id: 1,
            quiz_id: 1,
            user_id,
            session_id: session_id.map(str::to_string),
            start_time: Utc::now(),
            end_time: None,
            score: None,
            passed: None,
            is_completed: false,
            time_taken: None,
        }
    }

    #[test]
    fn test_user_attempt_ownership() {
        let owner = Principal { id: 4, role: Role::User };
        let other = Principal { id: 5, role: Role::Admin };
        let a = attempt(Some(4), None);
        assert!(Caller::new(Some(owner), None).owns(&a));
        assert!(!Caller::new(Some(other), None).owns(&a));
        assert!(!Caller::new(None, Some("s".into())).owns(&a));
    }

    #[test]
    fn test_session_attempt_ownership() {
        let a = attempt(None, Some("abc"));
        assert!(Caller::new(None, Some(" abc ".into())).owns(&a));
        assert!(!Caller::new(None, Some("xyz".into())).owns(&a));
        assert!(!Caller::new(None, Some("   ".into())).owns(&a));
        assert!(!Caller::new(None, None).owns(&attempt(None, None)));
    }
}
