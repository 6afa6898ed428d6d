//! DOM-derived links, headings and text overlays.
//!
//! The DOM snapshot taken at the end of the sweep is the authority for what
//! OCR is bad at: link targets (invisible on a screenshot), the heading
//! outline, and the exact wording of short labels such as captions and table
//! cells. [`DomOutline`] extracts all of them; [`blend_links`] merges DOM
//! anchors with links the OCR text happens to spell out, and
//! [`links_appendix`] renders the result as a Markdown table.

use crate::similarity::normalize_text;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use url::Url;

static ANCHORS: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static FORMS: Lazy<Selector> = Lazy::new(|| Selector::parse("form[action]").unwrap());
static HEADINGS: Lazy<Selector> = Lazy::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").unwrap());
static OVERLAY_SOURCES: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("h1, h2, h3, h4, h5, h6, figcaption, caption, th, td, li, label, dt, dd, p").unwrap()
});
static MD_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\((https?://[^)\s]+)\)").unwrap());

/// A heading as the page's markup declares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomHeading {
    pub level: u8,
    pub text: String,
    /// Comparison form (see [`normalize_text`]).
    pub normalized: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomLink {
    pub text: String,
    pub href: String,
}

/// Short DOM text that can stand in for a garbled OCR line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomTextOverlay {
    pub text: String,
    /// Lookup form (see [`overlay_key`]).
    pub normalized: String,
    /// Tag the text came from, e.g. `figcaption`.
    pub source: String,
}

/// Links, headings and text overlays harvested from a DOM snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomOutline {
    pub links: Vec<DomLink>,
    pub headings: Vec<DomHeading>,
    #[serde(default)]
    pub overlays: Vec<DomTextOverlay>,
}

/// Overlay texts longer than this are paragraphs, not labels.
const MAX_OVERLAY_CHARS: usize = 160;

/// Lowercased letters and digits, one space between words.
///
/// Punctuation is dropped so `Revenue Q4???` and `Revenue Q4` share a key.
pub fn overlay_key(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn resolve(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match base {
        Some(base) => base.join(href).ok().map(|u| u.to_string()),
        None => Some(href.to_string()),
    }
}

impl DomOutline {
    /// Parse a serialised DOM. Relative hrefs are resolved against `base`.
    pub fn from_html(html: &str, base: Option<&Url>) -> Self {
        let doc = Html::parse_document(html);
        let mut outline = DomOutline::default();

        for el in doc.select(&ANCHORS) {
            let Some(href) = el.value().attr("href").and_then(|h| resolve(h, base)) else {
                continue;
            };
            outline.links.push(DomLink {
                text: element_text(&el),
                href,
            });
        }

        for el in doc.select(&FORMS) {
            let Some(action) = el.value().attr("action").and_then(|a| resolve(a, base)) else {
                continue;
            };
            let label = el
                .value()
                .attr("aria-label")
                .or_else(|| el.value().attr("name"))
                .unwrap_or("[form]");
            outline.links.push(DomLink {
                text: label.to_string(),
                href: action,
            });
        }

        for el in doc.select(&HEADINGS) {
            let level = el.value().name()[1..].parse::<u8>().unwrap_or(2);
            let text = element_text(&el);
            let normalized = normalize_text(&text);
            if normalized.is_empty() {
                continue;
            }
            outline.headings.push(DomHeading {
                level,
                text,
                normalized,
            });
        }

        // First occurrence of a key wins.
        let mut seen = HashSet::new();
        for el in doc.select(&OVERLAY_SOURCES) {
            let text = element_text(&el);
            if text.chars().count() > MAX_OVERLAY_CHARS {
                continue;
            }
            let normalized = overlay_key(&text);
            if normalized.is_empty() || !seen.insert(normalized.clone()) {
                continue;
            }
            outline.overlays.push(DomTextOverlay {
                text,
                normalized,
                source: el.value().name().to_string(),
            });
        }

        outline
    }
}

/// Where a link was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkSource {
    #[serde(rename = "DOM")]
    Dom,
    #[serde(rename = "OCR")]
    Ocr,
    #[serde(rename = "DOM+OCR")]
    DomOcr,
}

impl fmt::Display for LinkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkSource::Dom => "DOM",
            LinkSource::Ocr => "OCR",
            LinkSource::DomOcr => "DOM+OCR",
        })
    }
}

/// One row of the links appendix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub text: String,
    pub href: String,
    pub source: LinkSource,
    /// `✓`, `text mismatch`, `DOM only` or `OCR only`.
    pub delta: String,
}

/// Absolute links spelled out in recognized Markdown.
pub fn links_in_markdown(markdown: &str) -> Vec<DomLink> {
    MD_LINK
        .captures_iter(markdown)
        .map(|c| DomLink {
            text: c[1].trim().to_string(),
            href: c[2].trim().to_string(),
        })
        .collect()
}

/// Merge DOM anchors with OCR-visible links, keyed by href, first-seen order.
pub fn blend_links(dom: &[DomLink], ocr_markdown: &str) -> Vec<LinkRecord> {
    let mut records: Vec<LinkRecord> = Vec::new();
    let mut by_href: HashMap<String, usize> = HashMap::new();

    for link in dom {
        if by_href.contains_key(&link.href) {
            continue;
        }
        by_href.insert(link.href.clone(), records.len());
        records.push(LinkRecord {
            text: link.text.clone(),
            href: link.href.clone(),
            source: LinkSource::Dom,
            delta: "DOM only".into(),
        });
    }

    for link in links_in_markdown(ocr_markdown) {
        match by_href.get(&link.href) {
            Some(&i) => {
                let rec = &mut records[i];
                if rec.source == LinkSource::Ocr {
                    continue;
                }
                rec.source = LinkSource::DomOcr;
                if rec.text.is_empty() {
                    rec.text = link.text.clone();
                }
                rec.delta = if !link.text.is_empty() && rec.text != link.text {
                    "text mismatch".into()
                } else {
                    "✓".into()
                };
            }
            None => {
                by_href.insert(link.href.clone(), records.len());
                records.push(LinkRecord {
                    text: link.text,
                    href: link.href,
                    source: LinkSource::Ocr,
                    delta: "OCR only".into(),
                });
            }
        }
    }
    records
}

fn cell(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ")
}

/// Render link records as a `## Links` section; empty input renders nothing.
pub fn links_appendix(records: &[LinkRecord]) -> String {
    if records.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Links\n\n| Text | Href | Source | Delta |\n| --- | --- | --- | --- |\n");
    for r in records {
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            cell(&r.text),
            cell(&r.href),
            r.source,
            cell(&r.delta)
        ));
    }
    out
}
