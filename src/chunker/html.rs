//! HTML chunker
//!
//! Splits on structural elements (`<section>`, `<article>`, headings) and
//! strips markup so the stored text is clean prose. Script and style blocks
//! are dropped entirely.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{first_line_name, Chunk, ChunkType, Chunker, ChunkerError};

/// Elements that open a new section.
static SPLIT_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(section|article|h[1-6])\b[^>]*>").expect("valid regex"));

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

static HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<h[1-6]\b[^>]*>(.*?)</h[1-6]>").expect("valid regex"));

static SCRIPT_STYLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").expect("valid regex")
});

const NAME_MAX: usize = 80;

pub struct HtmlChunker;

impl HtmlChunker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HtmlChunker {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip tags and decode the common entities, collapsing runs of blank space.
fn strip_tags(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    // Collapse horizontal whitespace per line, drop empty lines runs
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank_run > 0 {
                out.push('\n');
            }
        }
        blank_run = 0;
        out.push_str(&collapsed);
    }
    out
}

impl Chunker for HtmlChunker {
    fn chunk(&self, path: &Path, source: &str) -> Result<Vec<Chunk>, ChunkerError> {
        if source.trim().is_empty() {
            return Ok(vec![]);
        }

        // Drop script/style bodies but keep line structure so line numbers
        // still point into the original source
        let cleaned = SCRIPT_STYLE_RE.replace_all(source, |caps: &regex::Captures| {
            caps[0].chars().filter(|&c| c == '\n').collect::<String>()
        });
        let lines: Vec<&str> = cleaned.lines().collect();

        // 0-indexed lines where a new section starts
        let mut splits: Vec<usize> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if SPLIT_TAG_RE.is_match(line) {
                splits.push(i);
            }
        }

        let mut chunks = Vec::new();
        let mut emit = |start: usize, end: usize| {
            let raw = lines[start..end].join("\n");
            let text = strip_tags(&raw);
            if text.trim().is_empty() {
                return;
            }
            let name = HEADING_RE
                .captures(&raw)
                .map(|c| strip_tags(&c[1]).trim().to_string())
                .filter(|n| !n.is_empty())
                .map(|n| {
                    if n.len() > NAME_MAX {
                        let mut e = NAME_MAX;
                        while !n.is_char_boundary(e) {
                            e -= 1;
                        }
                        n[..e].to_string()
                    } else {
                        n
                    }
                })
                .unwrap_or_else(|| first_line_name(&text, NAME_MAX));
            chunks.push(Chunk::build(
                path,
                ChunkType::Section,
                name,
                "",
                start as u32 + 1,
                end as u32,
                text,
                "html",
            ));
        };

        if splits.is_empty() {
            emit(0, lines.len());
            return Ok(chunks);
        }

        if splits[0] > 0 {
            emit(0, splits[0]);
        }
        for (i, &start) in splits.iter().enumerate() {
            let end = if i + 1 < splits.len() {
                splits[i + 1]
            } else {
                lines.len()
            };
            emit(start, end);
        }

        Ok(chunks)
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["html", "htm", "xhtml"]
    }

    fn name(&self) -> &'static str {
        "html"
    }
}
