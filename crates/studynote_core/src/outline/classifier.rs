//! Heading classifier.
//!
//! # Responsibility
//! - Map raw line text to `(level, display_text)`.
//!
//! # Invariants
//! - Classification is total and deterministic: every input maps to exactly
//!   one result, and level `0` means "not a heading".
//! - A heading is 1 to 6 `#` markers, required whitespace, then at least one
//!   non-whitespace character. Anything else is level `0`.

use once_cell::sync::Lazy;
use regex::Regex;

/// Marker character of the heading grammar.
pub const HEADING_MARKER: char = '#';
/// Deepest supported heading level.
pub const MAX_HEADING_LEVEL: u8 = 6;

static HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^(#{1,6})\s+(\S.*)$").expect("valid heading regex"));

/// Result of classifying one line of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Heading level `1..=6`, or `0` for non-headings.
    pub level: u8,
    /// Text with marker and separating whitespace stripped.
    pub display_text: String,
}

impl Classification {
    pub fn is_heading(&self) -> bool {
        self.level > 0
    }
}

/// Classifies raw line text.
pub fn classify(text: &str) -> Classification {
    match HEADING_RE.captures(text) {
        Some(caps) => Classification {
            level: caps[1].len() as u8,
            display_text: caps[2].to_string(),
        },
        None => Classification {
            level: 0,
            display_text: text.to_string(),
        },
    }
}

/// Renders canonical heading text for `level` and `title`.
///
/// Used to rebuild raw text for categories loaded from storage, which keep
/// only title and level. `level` is clamped into `1..=6`.
pub fn format_heading(level: u8, title: &str) -> String {
    let level = level.clamp(1, MAX_HEADING_LEVEL) as usize;
    format!(
        "{} {}",
        HEADING_MARKER.to_string().repeat(level),
        title.trim_start()
    )
}

#[cfg(test)]
mod tests {
    use super::{classify, format_heading, Classification};

    #[test]
    fn classifies_marker_depth_as_level() {
        for level in 1..=6u8 {
            let text = format!("{} Title", "#".repeat(level as usize));
            let result = classify(&text);
            assert_eq!(result.level, level);
            assert_eq!(result.display_text, "Title");
        }
    }

    #[test]
    fn seven_markers_is_not_a_heading() {
        let result = classify("####### too deep");
        assert_eq!(result.level, 0);
        assert_eq!(result.display_text, "####### too deep");
    }

    #[test]
    fn marker_requires_whitespace_and_text() {
        assert_eq!(classify("#nospace").level, 0);
        assert_eq!(classify("# ").level, 0);
        assert_eq!(classify("##   ").level, 0);
        assert_eq!(classify("#").level, 0);
        assert_eq!(classify("").level, 0);
        assert_eq!(classify(" # indented").level, 0);
    }

    #[test]
    fn strips_all_separating_whitespace() {
        let result = classify("##  \t Spaced out");
        assert_eq!(
            result,
            Classification {
                level: 2,
                display_text: "Spaced out".to_string(),
            }
        );
    }

    #[test]
    fn inner_markers_are_kept_in_display_text() {
        let result = classify("# C# notes ## part");
        assert_eq!(result.level, 1);
        assert_eq!(result.display_text, "C# notes ## part");
    }

    #[test]
    fn heading_round_trips_through_canonical_rendering() {
        for input in ["# A", "###   Deep title", "###### x y z", "## #hashtag"] {
            let first = classify(input);
            let second = classify(&format_heading(first.level, &first.display_text));
            assert_eq!(first, second, "round trip failed for {input:?}");
        }
    }

    #[test]
    fn classification_is_idempotent_for_plain_text() {
        let text = "just a sentence";
        assert_eq!(classify(text), classify(&classify(text).display_text));
    }
}
