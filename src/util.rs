//! Shared utility functions.

/// Longest prefix of `s` holding at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &s[..byte_index],
        None => s,
    }
}

/// Rough token footprint of some texts taken together: one token per four
/// characters.
pub fn estimate_tokens(texts: &[&str]) -> u64 {
    let chars: usize = texts.iter().map(|t| t.chars().count()).sum();
    (chars as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_short_input() {
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_truncate_chars_cuts_on_char_boundary() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(&[]), 0);
        assert_eq!(estimate_tokens(&["abcd"]), 1);
        assert_eq!(estimate_tokens(&["abcde"]), 2);
        assert_eq!(estimate_tokens(&["ab", "cd"]), 1);
    }
}
