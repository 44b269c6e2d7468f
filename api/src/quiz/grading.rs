//! Exact-match grading. No partial credit: a response is correct only
//! when the selected set equals the correct set.

use std::collections::BTreeSet;

pub fn is_correct(selected: &[i64], correct: &[i64]) -> bool {
    let selected: BTreeSet<i64> = selected.iter().copied().collect();
    let correct: BTreeSet<i64> = correct.iter().copied().collect();
    !correct.is_empty() && selected == correct
}

/// Percentage of questions answered correctly. Unanswered questions
/// count against the score because `total` is the quiz's question count.
pub fn score(correct: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    100.0 * correct as f64 / total as f64
}

pub fn passed(score: f64, passing_score: i64) -> bool {
    score >= passing_score as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_select_exact_match() {
        let (a, b, c) = (1, 2, 3);
        let correct = [a, c];
        assert!(is_correct(&[a, c], &correct));
        assert!(is_correct(&[c, a], &correct));
        assert!(!is_correct(&[a], &correct));
        assert!(!is_correct(&[a, b, c], &correct));
        assert!(!is_correct(&[], &correct));
    }

    #[test]
    fn test_single_answer_is_singleton_set() {
        assert!(is_correct(&[7], &[7]));
        assert!(is_correct(&[7, 7], &[7]));
        assert!(!is_correct(&[8], &[7]));
    }

    #[test]
    fn test_no_correct_option_never_matches() {
        assert!(!is_correct(&[], &[]));
    }

    #[test]
    fn test_score_and_pass() {
        let s = score(7, 10);
        assert!((s - 70.0).abs() < f64::EPSILON);
        assert!(passed(s, 70));
        assert!(!passed(s, 71));
        assert_eq!(score(0, 0), 0.0);
        assert_eq!(score(3, 3), 100.0);
    }
}
