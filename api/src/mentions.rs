//! Lexical step of mention handling: pulls candidate `@handle` tokens out
//! of post content. Resolving handles to users and notifying them lives
//! in `forum::posts`.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

// A handle is a username, or an email address. The leading character
// class keeps `me@example.com` in running text from reading as a mention.
static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w@.])@(\w[\w.+\-]*(?:@[\w\-]+(?:\.[\w\-]+)+)?)")
        .expect("mention pattern is valid")
});

/// Candidate handles in order of first appearance, deduplicated
/// case-insensitively.
pub fn extract_handles(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut handles = Vec::new();

    for caps in MENTION_RE.captures_iter(content) {
        let handle = caps[1].trim_end_matches(['.', '-', '+']);
        if handle.is_empty() {
            continue;
        }
        if seen.insert(handle.to_lowercase()) {
            handles.push(handle.to_string());
        }
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::extract_handles;

    #[test]
    fn test_simple_mentions() {
        assert_eq!(extract_handles("Hi @bob"), vec!["bob"]);
        assert_eq!(extract_handles("@alice and @bob_2"), vec!["alice", "bob_2"]);
    }

    #[test]
    fn test_trailing_punctuation_trimmed() {
        assert_eq!(extract_handles("thanks @carol."), vec!["carol"]);
        assert_eq!(extract_handles("(@dave)"), vec!["dave"]);
    }

    #[test]
    fn test_duplicates_suppressed() {
        assert_eq!(extract_handles("@Bob @bob @BOB"), vec!["Bob"]);
    }

    #[test]
    fn test_email_handle() {
        assert_eq!(
            extract_handles("ping @erin@example.com please"),
            vec!["erin@example.com"]
        );
    }

    #[test]
    fn test_plain_email_is_not_a_mention() {
        assert!(extract_handles("write to frank@example.com").is_empty());
        assert!(extract_handles("no mentions here").is_empty());
    }
}
