use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use rusqlite::{params, Connection};
use scholia_shared::{AddQuestion, NewOption, Principal, Question, QuestionType};

use super::{load_question, load_quiz};
use crate::{
    auth, db,
    error::{ApiError, ApiResult},
    forum::clean_required,
    AppState,
};

/// Validates and normalises the option set for a question type.
///
/// A true/false question supplied without exactly two options gets the
/// stock "True"/"False" pair, both unmarked, for an editor to fix up.
/// Everything else needs at least two options and one marked correct.
pub fn prepare_options(kind: QuestionType, options: &[NewOption]) -> ApiResult<Vec<NewOption>> {
    if kind == QuestionType::TrueFalse && options.len() != 2 {
        return Ok(["True", "False"]
            .into_iter()
            .map(|text| NewOption {
                option_text: text.to_string(),
                is_correct: false,
            })
            .collect());
    }

    if options.len() < 2 {
        return Err(ApiError::validation("a question needs at least two options"));
    }
    let prepared = options
        .iter()
        .map(|o| {
            Ok(NewOption {
                option_text: clean_required(&o.option_text, "option_text")?,
                is_correct: o.is_correct,
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;

    let correct = prepared.iter().filter(|o| o.is_correct).count();
    if correct == 0 {
        return Err(ApiError::validation("at least one option must be marked correct"));
    }
    if kind != QuestionType::MultipleSelect && correct > 1 {
        return Err(ApiError::validation(format!(
            "{} questions are graded against a single answer: mark exactly one option \
             correct, or use multiple_select",
            kind.as_str()
        )));
    }
    Ok(prepared)
}

struct PreparedQuestion {
    text: String,
    kind: QuestionType,
    options: Vec<NewOption>,
    explanation: Option<String>,
    article_url: Option<String>,
}

fn prepare(input: &AddQuestion) -> ApiResult<PreparedQuestion> {
    let text = clean_required(&input.question_text, "question_text")?;
    let kind = QuestionType::parse(&input.question_type).ok_or_else(|| {
        ApiError::validation(format!("invalid question_type '{}'", input.question_type))
    })?;
    let options = prepare_options(kind, &input.options)?;
    let optional = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ammonia::clean)
    };
    Ok(PreparedQuestion {
        text,
        kind,
        options,
        explanation: optional(&input.explanation_text),
        article_url: optional(&input.related_article_url),
    })
}

fn insert_options(conn: &Connection, question_id: i64, options: &[NewOption]) -> ApiResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO quiz_options (question_id, option_text, is_correct, order_in_question)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (i, option) in options.iter().enumerate() {
        stmt.execute(params![question_id, option.option_text, option.is_correct, i as i64])?;
    }
    Ok(())
}

fn question_count(conn: &Connection, quiz_id: i64) -> ApiResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM quiz_questions WHERE quiz_id = ?1",
        [quiz_id],
        |row| row.get(0),
    )?)
}

/// Appends a question, or inserts it at `order_in_quiz` and pushes the
/// questions at or after that position down by one.
pub fn add_question(
    conn: &mut Connection,
    actor: &Principal,
    quiz_id: i64,
    input: &AddQuestion,
) -> ApiResult<Question> {
    auth::require_admin(actor)?;
    let prepared = prepare(input)?;
    load_quiz(conn, quiz_id)?;

    let tx = conn.transaction()?;
    let next = question_count(&tx, quiz_id)?;
    let order = match input.order_in_quiz {
        Some(position) => {
            let position = position.clamp(0, next);
            tx.execute(
                "UPDATE quiz_questions SET order_in_quiz = order_in_quiz + 1
                 WHERE quiz_id = ?1 AND order_in_quiz >= ?2",
                params![quiz_id, position],
            )?;
            position
        }
        None => tx.query_row(
            "SELECT COALESCE(MAX(order_in_quiz), -1) + 1 FROM quiz_questions WHERE quiz_id = ?1",
            [quiz_id],
            |row| row.get(0),
        )?,
    };

    tx.execute(
        "INSERT INTO quiz_questions (quiz_id, question_text, question_type, order_in_quiz,
            explanation_text, related_article_url, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            quiz_id,
            prepared.text,
            prepared.kind.as_str(),
            order,
            prepared.explanation,
            prepared.article_url,
            Utc::now()
        ],
    )?;
    let question_id = tx.last_insert_rowid();
    insert_options(&tx, question_id, &prepared.options)?;
    tx.execute(
        "UPDATE quizzes SET updated_at = ?1 WHERE id = ?2",
        params![Utc::now(), quiz_id],
    )?;
    tx.commit()?;

    load_question(conn, question_id, true)
}

/// Replaces a question's text, type, explanation and option set. A new
/// `order_in_quiz` moves it within the quiz, keeping the order dense.
pub fn update_question(
    conn: &mut Connection,
    actor: &Principal,
    id: i64,
    input: &AddQuestion,
) -> ApiResult<Question> {
    auth::require_admin(actor)?;
    let prepared = prepare(input)?;
    let current = load_question(conn, id, true)?;

    let tx = conn.transaction()?;
    let last = question_count(&tx, current.quiz_id)? - 1;
    let old = current.order_in_quiz;
    let new = input.order_in_quiz.unwrap_or(old).clamp(0, last.max(0));
    if new < old {
        tx.execute(
            "UPDATE quiz_questions SET order_in_quiz = order_in_quiz + 1
             WHERE quiz_id = ?1 AND order_in_quiz >= ?2 AND order_in_quiz < ?3",
            params![current.quiz_id, new, old],
        )?;
    } else if new > old {
        tx.execute(
            "UPDATE quiz_questions SET order_in_quiz = order_in_quiz - 1
             WHERE quiz_id = ?1 AND order_in_quiz > ?2 AND order_in_quiz <= ?3",
            params![current.quiz_id, old, new],
        )?;
    }

    tx.execute(
        "UPDATE quiz_questions SET question_text = ?1, question_type = ?2, order_in_quiz = ?3,
            explanation_text = ?4, related_article_url = ?5
         WHERE id = ?6",
        params![
            prepared.text,
            prepared.kind.as_str(),
            new,
            prepared.explanation,
            prepared.article_url,
            id
        ],
    )?;
    tx.execute("DELETE FROM quiz_options WHERE question_id = ?1", [id])?;
    insert_options(&tx, id, &prepared.options)?;
    tx.commit()?;

    load_question(conn, id, true)
}

/// Options go with the question through the cascade; later questions
/// move up one place so the order has no gap. Refused once the quiz has
/// completed attempts, whose scores were computed over the current set.
pub fn delete_question(conn: &mut Connection, actor: &Principal, id: i64) -> ApiResult<()> {
    auth::require_admin(actor)?;
    let question = load_question(conn, id, false)?;

    let tx = conn.transaction()?;
    let graded: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM quiz_attempts WHERE quiz_id = ?1 AND is_completed = 1)",
        [question.quiz_id],
        |row| row.get(0),
    )?;
    if graded {
        return Err(ApiError::conflict(
            "the quiz has completed attempts; its questions can no longer be deleted",
        ));
    }
    tx.execute("DELETE FROM quiz_questions WHERE id = ?1", [id])?;
    tx.execute(
        "UPDATE quiz_questions SET order_in_quiz = order_in_quiz - 1
         WHERE quiz_id = ?1 AND order_in_quiz > ?2",
        params![question.quiz_id, question.order_in_quiz],
    )?;
    tx.commit()?;
    Ok(())
}

// ── Handlers ──

/// POST /api/quiz/quizzes/:id/questions
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(quiz_id): Path<i64>,
    Json(payload): Json<AddQuestion>,
) -> ApiResult<Json<Question>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let question =
        db::blocking(&state.db, move |conn| add_question(conn, &actor, quiz_id, &payload)).await?;
    Ok(Json(question))
}

/// GET /api/quiz/questions/:id (admin, answers included)
pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<Question>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    auth::require_admin(&actor)?;
    let question = db::blocking(&state.db, move |conn| load_question(conn, id, true)).await?;
    Ok(Json(question))
}

/// PUT /api/quiz/questions/:id
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<AddQuestion>,
) -> ApiResult<Json<Question>> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    let question =
        db::blocking(&state.db, move |conn| update_question(conn, &actor, id, &payload)).await?;
    Ok(Json(question))
}

/// DELETE /api/quiz/questions/:id
pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let actor = auth::principal(&headers, &state.jwt_secret)?;
    db::blocking(&state.db, move |conn| delete_question(conn, &actor, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(text: &str, is_correct: bool) -> NewOption {
        NewOption {
            option_text: text.to_string(),
            is_correct,
        }
    }

    #[test]
    fn test_true_false_defaults() {
        let options = prepare_options(QuestionType::TrueFalse, &[]).unwrap();
        let texts: Vec<_> = options.iter().map(|o| o.option_text.as_str()).collect();
        assert_eq!(texts, ["True", "False"]);
        assert!(options.iter().all(|o| !o.is_correct));
    }

    #[test]
    fn test_true_false_keeps_supplied_pair() {
        let options =
            prepare_options(QuestionType::TrueFalse, &[opt("Yes", false), opt("No", true)]).unwrap();
        assert_eq!(options[0].option_text, "Yes");
        assert!(options[1].is_correct);
    }

    #[test]
    fn test_requires_two_options_and_a_correct_one() {
        assert!(prepare_options(QuestionType::MultipleChoice, &[opt("a", true)]).is_err());
        assert!(
            prepare_options(QuestionType::MultipleChoice, &[opt("a", false), opt("b", false)])
                .is_err()
        );
        assert!(
            prepare_options(QuestionType::MultipleSelect, &[opt("a", true), opt("b", true)]).is_ok()
        );
    }

    #[test]
    fn test_single_answer_types_reject_two_correct() {
        let err = prepare_options(QuestionType::MultipleChoice, &[opt("a", true), opt("b", true)])
            .unwrap_err();
        match err {
            ApiError::Validation(message) => {
                assert!(message.contains("single answer"));
                assert!(message.contains("multiple_select"));
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_blank_option_text_rejected() {
        assert!(
            prepare_options(QuestionType::MultipleChoice, &[opt("  ", true), opt("b", false)])
                .is_err()
        );
    }
}
