//! Log-safe secret redaction and timing-safe comparison.

/// Number of `*` characters between the visible prefix and suffix.
const MASK_WIDTH: usize = 8;

/// Redacts a secret for display.
///
/// Keeps the first and last `visible` characters and replaces the middle with a
/// fixed run of `*`, so the output length does not depend on the input length.
/// Values too short to keep both ends (`<= 2 * visible`) are fully masked.
///
/// ```
/// use conduit::credentials::mask;
///
/// assert_eq!(mask("sk_live_abcdef123456", 4), "sk_l********3456");
/// assert_eq!(mask("short", 4), "********");
/// ```
pub fn mask(value: &str, visible: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if visible == 0 || chars.len() <= visible * 2 {
        return "*".repeat(MASK_WIDTH);
    }

    let head: String = chars[..visible].iter().collect();
    let tail: String = chars[chars.len() - visible..].iter().collect();
    format!("{}{}{}", head, "*".repeat(MASK_WIDTH), tail)
}

/// Compares two byte strings without leaking where they differ.
///
/// Inputs of different length compare unequal; that is the only information
/// leaked through timing.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_keeps_ends() {
        let masked = mask("sk_live_abcdef123456", 4);
        assert!(masked.starts_with("sk_l"));
        assert!(masked.ends_with("3456"));

        let middle = &masked[4..masked.len() - 4];
        assert!(!middle.is_empty());
        assert!(middle.chars().all(|c| c == '*'));
    }

    #[test]
    fn test_mask_length_independent_of_input() {
        let a = mask("sk_live_abcdef123456", 4);
        let b = mask("sk_live_abcdef123456sk_live_abcdef123456", 4);
        assert_eq!(a.len(), b.len());
        assert_eq!(a.len(), 4 + MASK_WIDTH + 4);
    }

    #[test]
    fn test_mask_short_values_fully_hidden() {
        assert_eq!(mask("abcdefgh", 4), "********");
        assert_eq!(mask("", 4), "********");
        assert_eq!(mask("anything", 0), "********");
    }

    #[test]
    fn test_mask_multibyte() {
        let masked = mask("päss-wörd-sécret", 2);
        assert!(masked.starts_with("pä"));
        assert!(masked.ends_with("et"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"token-abc", b"token-abc"));
        assert!(!constant_time_eq(b"token-abc", b"token-abd"));
        assert!(!constant_time_eq(b"xoken-abc", b"token-abc"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_constant_time_eq_length_mismatch_is_false() {
        assert!(!constant_time_eq(b"short", b"longer-value"));
        assert!(!constant_time_eq(b"", b"x"));
    }
}
