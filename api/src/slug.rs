//! URL slugs for categories, threads, quizzes and catalog entries.

/// Lowercases `input`, drops anything that is not alphanumeric, and joins
/// the remaining words with single hyphens.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_hyphen = false;

    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() || ch == '-' || ch == '_' {
            pending_hyphen = true;
        }
    }

    out
}

/// Returns `base` if free, otherwise the first free `base-1`, `base-2`, ...
pub fn unique_slug<E, F>(base: &str, mut exists: F) -> Result<String, E>
where
    F: FnMut(&str) -> Result<bool, E>,
{
    if !exists(base)? {
        return Ok(base.to_string());
    }

    let mut n = 1u64;
    loop {
        let candidate = format!("{base}-{n}");
        if !exists(&candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("  Rust: the   Book! "), "rust-the-book");
        assert_eq!(slugify("already-slugged"), "already-slugged");
        assert_eq!(slugify("snake_case title"), "snake-case-title");
    }

    #[test]
    fn test_slugify_strips_symbols() {
        assert_eq!(slugify("C++ & Go?"), "c-go");
        assert_eq!(slugify("--lead and trail--"), "lead-and-trail");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_unique_slug_suffixes_in_sequence() {
        let mut taken: HashSet<String> = HashSet::new();
        for expected in ["hello", "hello-1", "hello-2"] {
            let slug =
                unique_slug::<(), _>("hello", |s| Ok(taken.contains(s))).unwrap();
            assert_eq!(slug, expected);
            taken.insert(slug);
        }
    }

    #[test]
    fn test_unique_slug_propagates_errors() {
        let result = unique_slug("x", |_| Err::<bool, _>("db down"));
        assert_eq!(result, Err("db down"));
    }
}
