//! Input sanitization for classifier and AI prompt strings.
//!
//! Runner-reported text is untrusted: collapse all whitespace (including
//! newlines, which would otherwise let a log line smuggle structure into
//! the prompt) and truncate to a bound.

/// Collapse whitespace runs to single spaces, strip control characters,
/// and truncate to `max_len` bytes on a char boundary.
pub fn sanitize(input: &str, max_len: usize) -> String {
    let collapsed: String = input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .filter(|c| !c.is_control())
        .collect();

    if collapsed.len() <= max_len {
        return collapsed;
    }

    let mut cut = max_len;
    while cut > 0 && !collapsed.is_char_boundary(cut) {
        cut -= 1;
    }
    collapsed[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_newlines() {
        assert_eq!(
            sanitize("error:\n  connection \t refused\r\n", 100),
            "error: connection refused"
        );
    }

    #[test]
    fn truncates_to_bound() {
        let long = "x".repeat(500);
        assert_eq!(sanitize(&long, 10).len(), 10);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo wörld";
        let out = sanitize(s, 2);
        assert!(out.len() <= 2);
        // Must not panic and must be valid UTF-8 (guaranteed by String).
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(sanitize("", 10), "");
        assert_eq!(sanitize("   \n\t  ", 10), "");
    }
}
