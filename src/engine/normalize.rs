//! Utterance normalization
//!
//! Every piece of free text that is matched against input handlers goes
//! through the same folding: lowercase, punctuation replaced by spaces,
//! whitespace runs collapsed. Script-side utterances are normalized at load
//! time so matching stays symmetric.

use regex::Regex;
use std::sync::LazyLock;

static FOLDED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[\s.,`~!@#$%^&*()\-=+\[\]{}\\|:;'"<>?]+"#).expect("normalization pattern")
});

/// Fold an utterance into its canonical matching form.
pub fn normalize(text: &str) -> String {
    FOLDED
        .replace_all(&text.to_lowercase(), " ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_punctuation() {
        assert_eq!(normalize("Hello, World!"), "hello world");
        assert_eq!(normalize("  YES  "), "yes");
        assert_eq!(normalize("what's up?"), "what s up");
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(normalize("a   b\t\nc"), "a b c");
    }

    #[test]
    fn keeps_unicode_letters() {
        assert_eq!(normalize("Привет!"), "привет");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("?!."), "");
    }
}
