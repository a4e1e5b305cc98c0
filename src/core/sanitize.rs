//! The trust boundary: every piece of untrusted text is cleaned and
//! validated here before it may be persisted.
//!
//! Cleaning is two passes. The first strips characters that render invisibly
//! or reorder display (control characters except newline/tab, plus a fixed
//! set of zero-width and directional code points used for visual spoofing).
//! The second replaces known prompt-injection signatures with a fixed
//! `[FILTERED]` marker, case-insensitively, re-applying each pattern until it
//! no longer matches so a signature cannot survive by straddling a removed
//! span. Length limits are checked after cleaning; primary fields reject
//! rather than truncate.

use crate::core::error::TandemError;
use regex::Regex;
use std::sync::LazyLock;

pub const FILTERED_MARKER: &str = "[FILTERED]";
pub const TRUNCATED_MARKER: &str = " [truncated]";

pub const MAX_TEXT_LEN: usize = 1000;
pub const MAX_NOTES_LEN: usize = 5000;
pub const MAX_TAG_LEN: usize = 50;

/// Zero-width and directional code points stripped outright.
const INVISIBLE_CODEPOINTS: &[char] = &[
    '\u{200B}', // zero width space
    '\u{200C}', // zero width non-joiner
    '\u{200D}', // zero width joiner
    '\u{200E}', // left-to-right mark
    '\u{200F}', // right-to-left mark
    '\u{202A}', // left-to-right embedding
    '\u{202B}', // right-to-left embedding
    '\u{202C}', // pop directional formatting
    '\u{202D}', // left-to-right override
    '\u{202E}', // right-to-left override
    '\u{2060}', // word joiner
    '\u{2066}', // left-to-right isolate
    '\u{2067}', // right-to-left isolate
    '\u{2068}', // first strong isolate
    '\u{2069}', // pop directional isolate
    '\u{FEFF}', // byte order mark
];

/// Curated injection signatures: role hijack, instruction override,
/// code-execution verbs, tool-invocation markup, credential exfiltration.
static INJECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // role hijack
        r"you\s+are\s+now\s+(?:a|an|the)\b",
        r"act\s+as\s+(?:a|an|the)\s+(?:system|admin|root)\b",
        r"pretend\s+to\s+be\b",
        // instruction override
        r"ignore\s+(?:all\s+|any\s+)?(?:previous|prior|above)\s+(?:instructions|context|rules)",
        r"disregard\s+(?:all\s+|any\s+)?(?:previous|prior|above)\s+(?:instructions|context|rules)",
        r"system\s*prompt",
        r"new\s+instructions?\s*:",
        // code execution
        r"\b(?:eval|exec|execute|spawn)\s*\(",
        r"\bos\.system\b",
        r"\bsubprocess\.(?:run|call|Popen)\b",
        r"rm\s+-rf\s+\S+",
        r"curl\s+\S+\s*\|\s*(?:ba|z)?sh",
        // tool invocation markup
        r"<\s*/?\s*tool_(?:use|call|result)\s*>",
        r"<\s*/?\s*function_(?:calls|results)\s*>",
        // credential exfiltration
        r"(?:api[_-]?key|access[_-]?token|password|secret)s?\s*[:=]\s*\S+",
        r"(?:send|post|upload|exfiltrate)\s+(?:me\s+)?(?:your|the|all)\s+(?:api[_-]?keys?|credentials|passwords|secrets|tokens)",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("injection pattern compiles"))
    .collect()
});

static TAG_BODY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("tag pattern compiles"));

fn strip_unprintable(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            if *c == '\n' || *c == '\t' {
                return true;
            }
            if c.is_control() {
                return false;
            }
            !INVISIBLE_CODEPOINTS.contains(c)
        })
        .collect()
}

fn strip_injection(input: &str) -> String {
    let mut out = input.to_string();
    for re in INJECTION_PATTERNS.iter() {
        // Re-apply until fixpoint; bounded in case a replacement ever
        // exposes a fresh match.
        for _ in 0..8 {
            if !re.is_match(&out) {
                break;
            }
            out = re.replace_all(&out, FILTERED_MARKER).into_owned();
        }
    }
    out
}

/// Full cleaning pass. Pure and idempotent: `clean_text(clean_text(x)) ==
/// clean_text(x)`.
pub fn clean_text(input: &str) -> String {
    strip_injection(&strip_unprintable(input))
}

/// Clean and validate a primary task text field. Hard failure on empty or
/// over-length input; never truncates.
pub fn validate_task_text(input: &str) -> Result<String, TandemError> {
    let cleaned = clean_text(input);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return Err(TandemError::Validation(
            "task text is empty after sanitization".to_string(),
        ));
    }
    let len = trimmed.chars().count();
    if len > MAX_TEXT_LEN {
        return Err(TandemError::Validation(format!(
            "task text is {len} characters; the limit is {MAX_TEXT_LEN}"
        )));
    }
    Ok(trimmed.to_string())
}

/// Clean a note body. Length is enforced by the caller against the combined
/// notes field, because the limit applies to the concatenation.
pub fn clean_note(input: &str) -> Result<String, TandemError> {
    let cleaned = clean_text(input);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return Err(TandemError::Validation(
            "note is empty after sanitization".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Validate a tag field against `^[marker][a-z0-9-]+$`. The marker may be
/// omitted on input and is normalized in; anything else is a hard failure.
pub fn validate_tag(input: &str, marker: char) -> Result<String, TandemError> {
    let cleaned = clean_text(input);
    let trimmed = cleaned.trim();
    let body = trimmed.strip_prefix(marker).unwrap_or(trimmed);
    if body.is_empty() || !TAG_BODY_RE.is_match(body) {
        return Err(TandemError::Validation(format!(
            "tag '{input}' must match {marker}[a-z0-9-]+"
        )));
    }
    let tag = format!("{marker}{body}");
    if tag.chars().count() > MAX_TAG_LEN {
        return Err(TandemError::Validation(format!(
            "tag '{tag}' exceeds {MAX_TAG_LEN} characters"
        )));
    }
    Ok(tag)
}

/// Validate an optional due date as a real `YYYY-MM-DD` calendar date.
pub fn validate_due_date(input: &str) -> Result<String, TandemError> {
    let parsed = chrono::NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").map_err(|_| {
        TandemError::Validation(format!("due date '{input}' is not a YYYY-MM-DD calendar date"))
    })?;
    Ok(parsed.format("%Y-%m-%d").to_string())
}

/// Bound a low-stakes free-text field (failure reasons, reject notes) with
/// an explicit marker instead of rejecting. Primary fields never use this.
pub fn truncate_with_marker(input: &str, max_chars: usize) -> String {
    let mut chars = input.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}{TRUNCATED_MARKER}")
    } else {
        head
    }
}
