//! Deterministic cleanup of recognized Markdown.
//!
//! Two entry points:
//!
//! * [`clean_chunk`] runs on every tile's raw OCR output before it is split
//!   into blocks. It fixes model quirks (outer fences, CRLF, invisible
//!   characters, placeholder images, malformed tables) without touching
//!   the words.
//! * [`finish_document`] runs once on the rendered document: blank-line
//!   collapsing, heading spacing, one trailing newline. It leaves HTML
//!   comments (provenance, seam markers) alone.

use once_cell::sync::Lazy;
use regex::Regex;

/// Normalise one tile's raw OCR Markdown.
pub fn clean_chunk(raw: &str) -> String {
    let s = strip_outer_fence(raw);
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = s.replace(INVISIBLE, "");
    let s = s.lines().map(str::trim_end).collect::<Vec<_>>().join("\n");
    let s = drop_placeholder_images(&s);
    let s = repair_tables(&s);
    s.trim_matches('\n').to_string()
}

/// Final layout pass over a whole rendered document.
pub fn finish_document(markdown: &str) -> String {
    let s = space_headings(markdown);
    let s = RE_BLANK_RUN.replace_all(&s, "\n\n").to_string();
    let trimmed = s.trim();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}

const INVISIBLE: [char; 6] = ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'];

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```\s*$").unwrap());

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

/// Images on a screenshot have no recoverable URL; a link that is not
/// absolute http(s) was invented by the model. Keep the alt text.
fn drop_placeholder_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            let url = caps[2].trim();
            let real = (url.starts_with("https://") || url.starts_with("http://"))
                && !["example.com", "placeholder.com", "placehold.it", "dummyimage.com"]
                    .iter()
                    .any(|d| url.contains(d));
            if real {
                caps[0].to_string()
            } else if alt.is_empty() {
                String::new()
            } else {
                format!("*{alt}*")
            }
        })
        .to_string()
}

pub(crate) fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

pub(crate) fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.contains('-') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Insert a missing header separator and drop separators below row two.
fn repair_tables(input: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut row_in_table = 0usize;
    for line in input.lines() {
        if !is_table_row(line) {
            row_in_table = 0;
            out.push(line.to_string());
            continue;
        }
        row_in_table += 1;
        if is_separator_row(line) {
            if row_in_table == 2 {
                out.push(line.to_string());
            } else {
                row_in_table -= 1;
            }
            continue;
        }
        if row_in_table == 2 {
            let cols = out
                .last()
                .map(|h| h.matches('|').count().saturating_sub(1).max(1))
                .unwrap_or(1);
            out.push(format!("|{}", " --- |".repeat(cols)));
            row_in_table += 1;
        }
        out.push(line.to_string());
    }
    out.join("\n")
}

fn space_headings(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 64);
    for line in input.lines() {
        let heading = line.starts_with('#') && line.trim_start_matches('#').starts_with(' ');
        if heading && !out.is_empty() && !out.ends_with("\n\n") {
            out.push('\n');
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_outer_fence() {
        assert_eq!(clean_chunk("```markdown\n# Hi\nthere\n```"), "# Hi\nthere");
        assert_eq!(clean_chunk("```\nplain\n```"), "plain");
        assert_eq!(clean_chunk("no fence"), "no fence");
    }

    #[test]
    fn normalises_line_endings_and_invisibles() {
        assert_eq!(clean_chunk("a\r\nb\u{200B}c  \rd"), "a\nbc\nd");
    }

    #[test]
    fn placeholder_images_become_captions() {
        let out = clean_chunk("see ![Revenue chart](chart.png) and ![](img)");
        assert_eq!(out, "see *Revenue chart* and ");
        let kept = clean_chunk("![Logo](https://cdn.site.org/logo.png)");
        assert!(kept.starts_with("![Logo]"));
    }

    #[test]
    fn tables_get_one_separator() {
        assert_eq!(
            clean_chunk("| A | B |\n| 1 | 2 |"),
            "| A | B |\n| --- | --- |\n| 1 | 2 |"
        );
        assert_eq!(
            clean_chunk("| A | B |\n| --- | --- |\n| 1 | 2 |\n| --- | --- |\n| 3 | 4 |"),
            "| A | B |\n| --- | --- |\n| 1 | 2 |\n| 3 | 4 |"
        );
    }

    #[test]
    fn finish_keeps_comments_and_spaces_headings() {
        let doc = "<!-- source: tile_0000 -->\ntext\n# Title\n\n\n\nbody";
        let out = finish_document(doc);
        assert_eq!(out, "<!-- source: tile_0000 -->\ntext\n\n# Title\n\nbody\n");
    }

    #[test]
    fn finish_empty_is_single_newline() {
        assert_eq!(finish_document("  \n\n"), "\n");
    }
}
