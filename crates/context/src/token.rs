//! Token estimation.
//!
//! Uses a character-based heuristic: ~4 bytes per token, rounded up. It is
//! not a tokenizer and can be off by a wide margin for non-English text, but
//! every budget check and cost estimate in StoryLoom goes through the same
//! estimator, so the numbers stay comparable. Swap in another
//! [`TokenEstimator`] rather than changing this one.

/// Estimates how many tokens a piece of text occupies.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Fixed bytes-per-token ratio estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharRatioEstimator {
    bytes_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(bytes_per_token: usize) -> Self {
        Self {
            bytes_per_token: bytes_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.len().div_ceil(self.bytes_per_token)
    }
}

/// Estimate tokens with the default 4-bytes-per-token ratio.
pub fn estimate_tokens(text: &str) -> usize {
    CharRatioEstimator::default().estimate(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn hundred_chars() {
        assert_eq!(estimate_tokens(&"a".repeat(100)), 25);
    }

    #[test]
    fn custom_ratio() {
        let est = CharRatioEstimator::new(2);
        assert_eq!(est.estimate("abcde"), 3);
        // zero ratio is clamped instead of dividing by zero
        assert_eq!(CharRatioEstimator::new(0).estimate("abc"), 3);
    }
}
