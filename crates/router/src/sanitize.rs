//! Prompt sanitization applied on the final safety-block retry (§4.3 step
//! 6.b.c, glossary "Sanitization"): strips code blocks and softens a
//! denylist of trigger words, carried over verbatim from the original
//! `_sanitize_prompt` (§2 supplemented feature) rather than invented fresh.

use once_cell::sync::Lazy;
use regex::Regex;

static FENCED_CODE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[^`]+`").unwrap());

/// `(pattern, replacement)` pairs applied in this order, matched
/// case-insensitively on a word boundary except the last (a prefix match,
/// so `manipulating`/`manipulation` etc. are all caught).
static TRIGGER_WORDS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)\bkill\b").unwrap(), "close"),
        (Regex::new(r"(?i)\bexploit\b").unwrap(), "use"),
        (Regex::new(r"(?i)\battack\b").unwrap(), "strategy"),
        (Regex::new(r"(?i)\baggressive\b").unwrap(), "active"),
        (Regex::new(r"(?i)\bhft\b").unwrap(), "high-frequency trading"),
        (Regex::new(r"(?i)manipulat").unwrap(), "optimiz"),
    ]
});

pub fn sanitize_prompt(prompt: &str) -> String {
    let without_fences = FENCED_CODE_BLOCK.replace_all(prompt, "[CODE_BLOCK_REMOVED]");
    let without_inline = INLINE_CODE.replace_all(&without_fences, "[CODE]");
    let mut out = without_inline.into_owned();
    for (pattern, replacement) in TRIGGER_WORDS.iter() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_fenced_code_blocks_with_a_placeholder() {
        let input = "before\n```python\nprint('x')\n```\nafter";
        assert_eq!(sanitize_prompt(input), "before\n[CODE_BLOCK_REMOVED]\nafter");
    }

    #[test]
    fn replaces_inline_code_with_a_placeholder() {
        assert_eq!(sanitize_prompt("run `rm -rf /` now"), "run [CODE] now");
    }

    #[test]
    fn swaps_kill_for_close_case_insensitively() {
        assert_eq!(sanitize_prompt("Kill the position when SL hits"), "close the position when SL hits");
    }

    #[test]
    fn does_not_match_kill_as_a_substring_of_a_longer_word() {
        assert_eq!(sanitize_prompt("the killer whale strategy"), "the killer whale strategy");
    }

    #[test]
    fn softens_the_full_trigger_word_table() {
        let input = "exploit the attack via an aggressive hft strategy, manipulating the book";
        assert_eq!(sanitize_prompt(input), "use the strategy via an active high-frequency trading strategy, optimizing the book");
    }

    proptest::proptest! {
        /// None of the replacement words ("close", "use", "strategy", "active",
        /// "high-frequency trading", "optimiz...") appear in the trigger-word
        /// table themselves, so a second pass is always a no-op.
        #[test]
        fn sanitizing_twice_is_the_same_as_sanitizing_once(input in ".{0,200}") {
            let once = sanitize_prompt(&input);
            let twice = sanitize_prompt(&once);
            proptest::prop_assert_eq!(once, twice);
        }
    }
}
