//! Log-safe rendering of credentials

/// Keep the first 3 and last 4 characters of a secret, star the rest.
///
/// Values too short to keep both ends are starred completely.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 7 {
        return "*".repeat(chars.len());
    }

    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 7), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_keeps_prefix_and_suffix() {
        assert_eq!(mask_secret("hf_abcdefgh1234"), "hf_********1234");
    }

    #[test]
    fn test_mask_short_values_completely() {
        assert_eq!(mask_secret("hf_1234"), "*******");
        assert_eq!(mask_secret(""), "");
    }
}
