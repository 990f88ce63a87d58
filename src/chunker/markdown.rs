//! Markdown chunker: heading-based splitting
//!
//! Scans lines for ATX headings and splits at headings of level <= the
//! configured depth. Each section runs from its heading line through the last
//! line before the next split heading. Fenced code blocks are atomic: heading
//! lookalikes inside a fence are ignored, so no section boundary can bisect a
//! fence.

use std::path::Path;

use super::{Chunk, ChunkType, Chunker, ChunkerError};

/// Headings at this level or shallower start a new section.
pub const DEFAULT_SPLIT_DEPTH: u32 = 2;

pub struct MarkdownChunker {
    split_depth: u32,
}

impl Default for MarkdownChunker {
    fn default() -> Self {
        Self::new(DEFAULT_SPLIT_DEPTH)
    }
}

/// A detected heading in the markdown source
#[derive(Debug, Clone)]
struct Heading {
    level: u32,
    text: String,
    /// 0-indexed
    line: usize,
}

impl MarkdownChunker {
    pub fn new(split_depth: u32) -> Self {
        Self {
            split_depth: split_depth.clamp(1, 6),
        }
    }
}

impl Chunker for MarkdownChunker {
    fn chunk(&self, path: &Path, source: &str) -> Result<Vec<Chunk>, ChunkerError> {
        if source.trim().is_empty() {
            return Ok(vec![]);
        }

        let lines: Vec<&str> = source.lines().collect();
        let headings = extract_headings(&lines);
        let title = headings
            .iter()
            .min_by_key(|h| (h.level, h.line))
            .map(|h| h.text.clone());

        // Split points: headings at or above the configured depth
        let splits: Vec<&Heading> = headings
            .iter()
            .filter(|h| h.level <= self.split_depth)
            .collect();

        let file_stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled");

        // No split headings: the whole file is one section
        if splits.is_empty() {
            let name = headings
                .first()
                .map(|h| h.text.clone())
                .unwrap_or_else(|| file_stem.to_string());
            return Ok(vec![section_chunk(
                path,
                &lines,
                0,
                lines.len(),
                &name,
                title.as_deref(),
            )]);
        }

        let mut chunks = Vec::with_capacity(splits.len() + 1);

        // Preamble before the first split heading
        if splits[0].line > 0 {
            let has_content = lines[..splits[0].line].iter().any(|l| !l.trim().is_empty());
            if has_content {
                chunks.push(section_chunk(
                    path,
                    &lines,
                    0,
                    splits[0].line,
                    file_stem,
                    title.as_deref(),
                ));
            }
        }

        for (i, heading) in splits.iter().enumerate() {
            let end = if i + 1 < splits.len() {
                splits[i + 1].line
            } else {
                lines.len()
            };
            chunks.push(section_chunk(
                path,
                &lines,
                heading.line,
                end,
                &heading.text,
                title.as_deref(),
            ));
        }

        Ok(chunks)
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["md", "mdx", "markdown"]
    }

    fn name(&self) -> &'static str {
        "markdown"
    }
}

/// Build a section chunk from a 0-indexed, end-exclusive line range.
fn section_chunk(
    path: &Path,
    lines: &[&str],
    start: usize,
    end: usize,
    name: &str,
    title: Option<&str>,
) -> Chunk {
    let content = lines[start..end].join("\n");
    let signature = match title {
        Some(t) if t != name => format!("{} > {}", t, name),
        _ => name.to_string(),
    };
    Chunk::build(
        path,
        ChunkType::Section,
        name,
        signature,
        start as u32 + 1,
        end as u32,
        content,
        "markdown",
    )
}

/// Scan lines for ATX headings, respecting fenced code blocks
fn extract_headings(lines: &[&str]) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut in_code_block = false;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();

        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_code_block = !in_code_block;
            continue;
        }
        if in_code_block {
            continue;
        }

        if let Some(level) = atx_heading_level(trimmed) {
            let text = trimmed[level as usize..]
                .trim_start_matches(' ')
                .trim_end_matches(|c| c == '#' || c == ' ')
                .to_string();
            if !text.is_empty() {
                headings.push(Heading {
                    level,
                    text,
                    line: i,
                });
            }
        }
    }

    headings
}

/// Return ATX heading level (1-6) or None
fn atx_heading_level(line: &str) -> Option<u32> {
    let bytes = line.as_bytes();
    let mut count = 0u32;
    for &b in bytes {
        if b == b'#' {
            count += 1;
        } else {
            break;
        }
    }
    if (1..=6).contains(&count) && bytes.get(count as usize) == Some(&b' ') {
        Some(count)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::assert_source_order;

    fn chunk(source: &str) -> Vec<Chunk> {
        MarkdownChunker::default()
            .chunk(Path::new("doc.md"), source)
            .unwrap()
    }

    #[test]
    fn test_atx_heading_level() {
        assert_eq!(atx_heading_level("# Title"), Some(1));
        assert_eq!(atx_heading_level("## Section"), Some(2));
        assert_eq!(atx_heading_level("###### Deep"), Some(6));
        assert_eq!(atx_heading_level("####### Too deep"), None);
        assert_eq!(atx_heading_level("#NoSpace"), None);
        assert_eq!(atx_heading_level("plain"), None);
    }

    #[test]
    fn test_splits_on_h2() {
        let source = "# Title\n\nintro\n\n## Intro\n\nbody a\n\n## Usage\n\nbody b\n";
        let chunks = chunk(source);
        let names: Vec<&str> = chunks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Title", "Intro", "Usage"]);
        assert_source_order(&chunks);

        let intro = &chunks[1];
        assert_eq!(intro.chunk_type, ChunkType::Section);
        assert!(intro.content.starts_with("## Intro"));
        assert!(intro.content.contains("body a"));
        assert!(!intro.content.contains("body b"));
        assert_eq!(intro.signature, "Title > Intro");
    }

    #[test]
    fn test_single_section_file() {
        let chunks = chunk("## Intro\n\njust one section\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name, "Intro");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
    }

    #[test]
    fn test_deep_headings_stay_in_section() {
        let source = "## Top\n\n### Sub a\n\ntext\n\n#### Deeper\n\nmore\n\n## Next\n";
        let chunks = chunk(source);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.contains("### Sub a"));
        assert!(chunks[0].content.contains("#### Deeper"));
    }

    #[test]
    fn test_no_headings_whole_file() {
        let chunks = MarkdownChunker::default()
            .chunk(Path::new("notes.md"), "plain text\nno headings\n")
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name, "notes");
    }

    #[test]
    fn test_code_fence_is_atomic() {
        let source = "## Real\n\n```\n## Not a heading\n# Also not\n```\n\ntail\n\n## Second\n";
        let chunks = chunk(source);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.contains("## Not a heading"));
        assert!(chunks[0].content.contains("tail"));
        assert_eq!(chunks[1].name, "Second");
    }

    #[test]
    fn test_configurable_depth() {
        let source = "# A\n\n## B\n\n### C\n\ntext\n";
        let deep = MarkdownChunker::new(3)
            .chunk(Path::new("d.md"), source)
            .unwrap();
        assert_eq!(deep.len(), 3);
        let shallow = MarkdownChunker::new(1)
            .chunk(Path::new("d.md"), source)
            .unwrap();
        assert_eq!(shallow.len(), 1);
    }

    #[test]
    fn test_preamble_before_first_heading() {
        let source = "leading prose\n\n## First\n\nbody\n";
        let chunks = chunk(source);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].name, "doc");
        assert!(chunks[0].content.contains("leading prose"));
        assert_eq!(chunks[1].name, "First");
    }

    #[test]
    fn test_trailing_hashes_stripped() {
        let chunks = chunk("## Closed heading ##\n\nbody\n");
        assert_eq!(chunks[0].name, "Closed heading");
    }

    #[test]
    fn test_line_ranges_cover_sections() {
        let source = "## A\na1\na2\n## B\nb1\n";
        let chunks = chunk(source);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
        assert_eq!(chunks[1].start_line, 4);
        assert_eq!(chunks[1].end_line, 5);
    }
}
