//! Post-processing: deterministic cleanup of converter output.
//!
//! Nougat-style servers answer with the Markdown wrapped in a JSON string,
//! so the body arrives quoted with `\n` escapes. Older deployments return it
//! half-decoded (quotes kept, escapes literal). [`clean_output`] accepts both
//! and then applies a handful of cheap string rules that fix formatting
//! quirks without touching content.
//!
//! ## Rule Order
//!
//! Decode first so every later rule sees real newlines. Normalise line
//! endings before trimming, and strip fences before collapsing blank lines so
//! the fence's own padding is collapsed too.

use once_cell::sync::Lazy;
use regex::Regex;

/// Turn a raw backend response body into the Markdown that gets written.
///
/// Rules (applied in order):
/// 1. Decode the JSON string body (or unquote/unescape legacy bodies)
/// 2. Strip outer markdown fences
/// 3. Normalise line endings (CRLF → LF)
/// 4. Trim trailing whitespace per line
/// 5. Collapse 3+ consecutive newlines down to one blank line
/// 6. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens, etc.)
/// 7. Ensure the text ends with exactly one newline
///
/// An empty or whitespace-only body yields an empty string, not `"\n"`, so
/// the minimum-length check sees zero characters.
pub fn clean_output(raw: &str) -> String {
    let s = decode_body(raw);
    let s = strip_markdown_fences(&s);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

/// Characters counted by the minimum-length check (Unicode scalar values,
/// surrounding whitespace excluded).
pub fn char_count(cleaned: &str) -> usize {
    cleaned.trim().chars().count()
}

// ── Rule 1: Decode the response body ─────────────────────────────────────────

fn decode_body(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(serde_json::Value::String(s)) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return s;
    }
    legacy_unescape(trimmed)
}

/// Strip one pair of surrounding double quotes and turn literal `\n` into
/// newlines.
fn legacy_unescape(input: &str) -> String {
    let unquoted = input
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(input);
    unquoted.replace("\\n", "\n")
}

// ── Rule 2: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```(?:markdown|md)?\r?\n(.*)\r?\n```\s*$").expect("static regex")
});

fn strip_markdown_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 3: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("static regex"));

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 6: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 7: Ensure text ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", input.trim_end())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_json_string_body() {
        let raw = r##""# Title\n\nBody with \"quotes\"""##;
        assert_eq!(decode_body(raw), "# Title\n\nBody with \"quotes\"");
    }

    #[test]
    fn test_legacy_body_is_unquoted_and_unescaped() {
        // Not valid JSON: a bare backslash-x escape.
        let raw = r#""line one\nline \x two""#;
        assert_eq!(decode_body(raw), "line one\nline \\x two");
    }

    #[test]
    fn test_plain_body_passthrough() {
        assert_eq!(decode_body("# Plain\nText"), "# Plain\nText");
    }

    #[test]
    fn test_strip_fences() {
        let input = "```markdown\n# Hello\nWorld\n```";
        assert_eq!(strip_markdown_fences(input), "# Hello\nWorld");
    }

    #[test]
    fn test_no_fences_passthrough() {
        let input = "# Hello\nWorld";
        assert_eq!(strip_markdown_fences(input), "# Hello\nWorld");
    }

    #[test]
    fn test_normalise_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_trim_trailing_whitespace() {
        assert_eq!(
            trim_trailing_whitespace("  hello   \nworld  "),
            "  hello\nworld"
        );
    }

    #[test]
    fn test_collapse_blank_lines() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(collapse_blank_lines("a\n\nb"), "a\n\nb");
    }

    #[test]
    fn test_remove_invisible() {
        let input = "hello\u{200B}world\u{FEFF}foo\u{00AD}bar";
        assert_eq!(remove_invisible_chars(input), "helloworldfoobar");
    }

    #[test]
    fn test_ensure_final_newline() {
        assert_eq!(ensure_final_newline("hello"), "hello\n");
        assert_eq!(ensure_final_newline("hello\n\n\n"), "hello\n");
        assert_eq!(ensure_final_newline("  \n"), "");
    }

    #[test]
    fn test_empty_body_counts_zero() {
        assert_eq!(char_count(&clean_output("\"\"")), 0);
        assert_eq!(char_count(&clean_output("")), 0);
    }

    #[test]
    fn test_char_count_uses_scalar_values() {
        assert_eq!(char_count("héllo wörld\n"), 11);
    }

    #[test]
    fn test_clean_output_full_pipeline() {
        let raw = "\"```markdown\\n# Title\\r\\n\\r\\nSome text   \\n\\n\\n\\n\\n## Section\\n```\"";
        let result = clean_output(raw);
        assert!(result.starts_with("# Title\n\nSome text\n\n## Section"), "got: {result:?}");
        assert!(result.ends_with('\n'));
        assert!(!result.contains("\n\n\n"));
    }
}
