//! Truncation helpers for process output embedded in error messages.

use std::borrow::Cow;

pub(super) const OUTPUT_CHAR_LIMIT: usize = 2_048;
const TRUNCATION_SUFFIX: &str = "… [truncated]";
const TRUNCATION_PREFIX: &str = "[truncated] …";

/// Keeps the first [`OUTPUT_CHAR_LIMIT`] characters of `text`.
pub(super) fn truncate_output(text: Cow<'_, str>) -> String {
    let mut out = String::with_capacity(OUTPUT_CHAR_LIMIT + TRUNCATION_SUFFIX.len());
    let mut chars = text.chars();
    for _ in 0..OUTPUT_CHAR_LIMIT {
        match chars.next() {
            Some(ch) => out.push(ch),
            None => return text.into_owned(),
        }
    }

    if chars.next().is_none() {
        return text.into_owned();
    }

    out.push_str(TRUNCATION_SUFFIX);
    out
}

/// Keeps the last [`OUTPUT_CHAR_LIMIT`] characters of `text`.
///
/// Server error logs put the fatal lines last, so the tail is the part
/// worth reporting.
pub(super) fn tail_output(text: &str) -> String {
    let total = text.chars().count();
    let Some(skip) = total.checked_sub(OUTPUT_CHAR_LIMIT).filter(|skip| *skip > 0) else {
        return text.to_owned();
    };
    let mut out = String::with_capacity(OUTPUT_CHAR_LIMIT + TRUNCATION_PREFIX.len());
    out.push_str(TRUNCATION_PREFIX);
    out.extend(text.chars().skip(skip));
    out
}

/// Formats the error log and stderr of a failed server for an error message.
pub(super) fn render_server_output(error_log: &str, stderr: &str) -> String {
    let log = tail_output(error_log.trim_end());
    let err = tail_output(stderr.trim_end());
    match (log.is_empty(), err.is_empty()) {
        (true, true) => "the server produced no output".to_owned(),
        (false, true) => format!("error log:\n{log}"),
        (true, false) => format!("stderr:\n{err}"),
        (false, false) => format!("error log:\n{log}\nstderr:\n{err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_output(Cow::Borrowed("boom")), "boom");
        assert_eq!(tail_output("boom"), "boom");
    }

    #[test]
    fn long_text_keeps_head_or_tail() {
        let text = format!("{}END", "x".repeat(OUTPUT_CHAR_LIMIT));

        let head = truncate_output(Cow::Borrowed(&text));
        let tail = tail_output(&text);

        assert!(head.ends_with(TRUNCATION_SUFFIX));
        assert!(!head.contains("END"));
        assert!(tail.starts_with(TRUNCATION_PREFIX));
        assert!(tail.ends_with("END"));
    }

    #[test]
    fn renders_both_sources() {
        let rendered = render_server_output("[ERROR] Aborting\n", "libfoo missing\n");
        assert_eq!(
            rendered,
            "error log:\n[ERROR] Aborting\nstderr:\nlibfoo missing"
        );
        assert_eq!(render_server_output("", " \n"), "the server produced no output");
    }
}
