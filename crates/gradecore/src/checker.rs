//! Output checker: whitespace-normalized equality between expected and
//! actual program output.
//!
//! No locale handling, no Unicode normalization, no special treatment of
//! trailing newlines beyond what whitespace collapsing already does.

/// Collapse runs of ASCII whitespace to a single space and trim both ends.
pub fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for c in s.trim().chars() {
        if c.is_ascii_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

/// `match(expected, actual) -> bool` from the output checker design.
pub fn matches(expected: &str, actual: &str) -> bool {
    collapse_whitespace(expected) == collapse_whitespace(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_internal_runs_of_whitespace() {
        assert_eq!(collapse_whitespace("a   b\t\tc"), "a b c");
    }

    #[test]
    fn trims_leading_and_trailing_whitespace() {
        assert_eq!(collapse_whitespace("  \n hello \n\n"), "hello");
    }

    #[test]
    fn idempotent_under_repeated_collapsing() {
        let once = collapse_whitespace("a \n\t b   c\n");
        let twice = collapse_whitespace(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn matches_ignores_whitespace_differences() {
        assert!(matches("1 2 3\n", "1  2\t3"));
        assert!(!matches("1 2 3", "1 2 4"));
    }

    #[test]
    fn trailing_newline_does_not_distinguish() {
        assert!(matches("answer", "answer\n"));
    }
}
