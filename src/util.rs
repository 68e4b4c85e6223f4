//! Shared utility functions for the runweave crate.

use uuid::Uuid;

/// Generate a prefixed identifier, e.g. `run-9f8c2a…`.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

/// Clamp a string to at most `max` characters, respecting char boundaries.
pub fn clamp_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Collapse internal whitespace runs to single spaces and trim the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_has_prefix_and_is_unique() {
        let a = new_id("run");
        let b = new_id("run");
        assert!(a.starts_with("run-"));
        assert_ne!(a, b);
        assert!(a.len() > 10);
    }

    #[test]
    fn test_clamp_chars_short_string_unchanged() {
        assert_eq!(clamp_chars("hello", 10), "hello");
    }

    #[test]
    fn test_clamp_chars_truncates() {
        assert_eq!(clamp_chars("hello world", 5), "hello");
    }

    #[test]
    fn test_clamp_chars_multibyte_boundary() {
        let s = "héllo wörld";
        let clamped = clamp_chars(s, 4);
        assert_eq!(clamped, "héll");
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a\t b\n\nc  "), "a b c");
    }
}
