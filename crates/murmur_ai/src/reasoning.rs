//! Detection and extraction of inline reasoning tags.
//!
//! Some local models emit their reasoning inside `<think>`-style tags in
//! the visible content instead of a separate stream channel. These helpers
//! split that out so reasoning never lands in conversation history as
//! answer text.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static TAG_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?is)<think>(.*?)</think>").expect("valid regex"),
            "think",
        ),
        (
            Regex::new(r"(?is)<reasoning>(.*?)</reasoning>").expect("valid regex"),
            "reasoning",
        ),
        (
            Regex::new(r"(?is)<thought>(.*?)</thought>").expect("valid regex"),
            "thought",
        ),
    ]
});

static OPEN_TAG_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    ["<think>", "<reasoning>", "<thought>"]
        .iter()
        .map(|tag| Regex::new(&format!("(?i){tag}")).expect("valid regex"))
        .collect()
});

/// Extract reasoning from the first recognized tag pair.
///
/// Returns the reasoning content (if any) and the text with the tag pair
/// removed and trimmed.
pub fn extract_reasoning_tags(text: &str) -> (Option<String>, String) {
    for (pattern, tag_name) in TAG_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            let reasoning = captures
                .get(1)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            let cleaned = pattern.replace_all(text, "").trim().to_string();
            debug!("Extracted {} chars from <{tag_name}> tags", reasoning.len());
            return (Some(reasoning), cleaned);
        }
    }
    (None, text.trim().to_string())
}

/// Whether the text contains any recognized reasoning tag.
pub fn has_reasoning_tags(text: &str) -> bool {
    OPEN_TAG_PATTERNS.iter().any(|pattern| pattern.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_think_tags() {
        let (reasoning, cleaned) =
            extract_reasoning_tags("<think>Let me work this out.</think>The answer is 4.");
        assert_eq!(reasoning.as_deref(), Some("Let me work this out."));
        assert_eq!(cleaned, "The answer is 4.");
    }

    #[test]
    fn extracts_reasoning_tags_case_insensitive() {
        let (reasoning, cleaned) =
            extract_reasoning_tags("<REASONING>step one</REASONING>Done.");
        assert_eq!(reasoning.as_deref(), Some("step one"));
        assert_eq!(cleaned, "Done.");
    }

    #[test]
    fn extracts_multiline_reasoning() {
        let text = "<think>line one\nline two\nline three</think>\n\nAnswer.";
        let (reasoning, cleaned) = extract_reasoning_tags(text);
        assert_eq!(reasoning.as_deref(), Some("line one\nline two\nline three"));
        assert_eq!(cleaned, "Answer.");
    }

    #[test]
    fn text_without_tags_passes_through() {
        let (reasoning, cleaned) = extract_reasoning_tags("  Just an answer.  ");
        assert!(reasoning.is_none());
        assert_eq!(cleaned, "Just an answer.");
    }

    #[test]
    fn thought_tags_supported() {
        let (reasoning, _) = extract_reasoning_tags("<thought>hm</thought>ok");
        assert_eq!(reasoning.as_deref(), Some("hm"));
    }

    #[test]
    fn repeated_tags_are_all_removed() {
        let text = "<think>a</think>middle<think>b</think>end";
        let (reasoning, cleaned) = extract_reasoning_tags(text);
        // First pair wins for extraction; all pairs are stripped from the text.
        assert_eq!(reasoning.as_deref(), Some("a"));
        assert_eq!(cleaned, "middleend");
    }

    #[test]
    fn detection() {
        assert!(has_reasoning_tags("<think>x</think>"));
        assert!(has_reasoning_tags("prefix <Reasoning>"));
        assert!(!has_reasoning_tags("no tags here"));
    }
}
