//! Canonical text form for dedup.
//!
//! Normalization belongs to the upstream stage; the engine only sees the
//! result. [`Normalizer`] is the seam, and [`CanonicalNormalizer`] is a
//! small reference implementation:
//! - Control character removal
//! - Case folding
//! - Punctuation stripping
//! - Whitespace collapsing

/// Produces the canonical form of a text that the engine dedups on.
pub trait Normalizer {
    fn normalize(&self, text: &str) -> String;
}

/// Configurable canonicalizer.
#[derive(Debug, Clone)]
pub struct CanonicalNormalizer {
    /// Lowercase everything
    pub fold_case: bool,
    /// Replace punctuation and symbols with whitespace
    pub strip_punctuation: bool,
}

impl Default for CanonicalNormalizer {
    fn default() -> Self {
        Self {
            fold_case: true,
            strip_punctuation: true,
        }
    }
}

impl Normalizer for CanonicalNormalizer {
    fn normalize(&self, text: &str) -> String {
        let mut result = String::with_capacity(text.len());
        let mut last_was_space = true;

        for ch in text.chars() {
            if ch.is_control() && !ch.is_whitespace() {
                continue;
            }
            let is_gap = ch.is_whitespace() || (self.strip_punctuation && is_punctuation(ch));
            if is_gap {
                if !last_was_space {
                    result.push(' ');
                    last_was_space = true;
                }
                continue;
            }

            if self.fold_case {
                result.extend(ch.to_lowercase());
            } else {
                result.push(ch);
            }
            last_was_space = false;
        }

        if result.ends_with(' ') {
            result.pop();
        }
        result
    }
}

/// Anything that is neither alphanumeric nor whitespace counts as punctuation.
fn is_punctuation(ch: char) -> bool {
    !ch.is_alphanumeric() && !ch.is_whitespace()
}

impl<F> Normalizer for F
where
    F: Fn(&str) -> String,
{
    fn normalize(&self, text: &str) -> String {
        self(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folds_case_and_strips_punctuation() {
        let n = CanonicalNormalizer::default();
        assert_eq!(n.normalize("Hello, World!"), "hello world");
    }

    #[test]
    fn test_collapses_whitespace() {
        let n = CanonicalNormalizer::default();
        assert_eq!(n.normalize("  hello \n\n\t world  "), "hello world");
    }

    #[test]
    fn test_removes_control_chars() {
        let n = CanonicalNormalizer::default();
        assert_eq!(n.normalize("hello\x00world\x01"), "helloworld");
    }

    #[test]
    fn test_surface_variants_collapse_to_same_form() {
        let n = CanonicalNormalizer::default();
        let a = n.normalize("The quick brown fox -- jumps!");
        let b = n.normalize("the QUICK brown fox jumps");
        assert_eq!(a, b);
    }

    #[test]
    fn test_keeps_case_and_punctuation_when_disabled() {
        let n = CanonicalNormalizer {
            fold_case: false,
            strip_punctuation: false,
        };
        assert_eq!(n.normalize("Tom &  Jerry"), "Tom & Jerry");
    }

    #[test]
    fn test_closure_normalizer() {
        let upper = |s: &str| s.to_uppercase();
        assert_eq!(upper.normalize("abc"), "ABC");
    }
}
