//! Generic sliding-window chunker
//!
//! Fallback for file types with no structural splitter. Cuts windows of
//! roughly `window_bytes`, breaking preferentially at blank lines, then
//! newlines, then any whitespace, then a hard cut on a char boundary.
//!
//! Window bodies are contiguous and non-overlapping, so line ranges satisfy
//! the per-file ordering invariant; the ~10% overlap is carried as a context
//! prefix prepended to each window's content (snapped to a line start).

use std::path::Path;

use super::{first_line_name, Chunk, ChunkType, Chunker, ChunkerError};

/// Default window size in bytes.
pub const DEFAULT_WINDOW_BYTES: usize = 2000;
/// Fraction of the window carried into the next chunk as context.
const OVERLAP_FRACTION: f32 = 0.10;
/// Maximum chunk-name length.
const NAME_MAX: usize = 80;

pub struct GenericChunker {
    window_bytes: usize,
    overlap_bytes: usize,
}

impl Default for GenericChunker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_BYTES)
    }
}

impl GenericChunker {
    pub fn new(window_bytes: usize) -> Self {
        let window_bytes = window_bytes.max(64);
        Self {
            window_bytes,
            overlap_bytes: ((window_bytes as f32) * OVERLAP_FRACTION) as usize,
        }
    }

    /// Pick the cut position inside `[min_cut, limit]`, preferring blank
    /// lines, then newlines, then whitespace. Returns an exclusive offset.
    fn find_cut(source: &str, min_cut: usize, limit: usize) -> usize {
        let mut min_cut = min_cut;
        while min_cut < limit && !source.is_char_boundary(min_cut) {
            min_cut += 1;
        }
        let mut limit = limit;
        while limit > min_cut && !source.is_char_boundary(limit) {
            limit -= 1;
        }
        let region = &source[min_cut..limit];

        // Blank line: cut after the double newline
        if let Some(rel) = region.rfind("\n\n") {
            return min_cut + rel + 2;
        }
        // Newline: cut after it
        if let Some(rel) = region.rfind('\n') {
            return min_cut + rel + 1;
        }
        // Any whitespace: cut after it
        if let Some(rel) = region.rfind(|c: char| c.is_whitespace()) {
            let ws_end = min_cut + rel + region[rel..].chars().next().map_or(1, char::len_utf8);
            return ws_end;
        }
        // Hard cut at the limit, snapped back to a char boundary
        let mut cut = limit;
        while cut > min_cut && !source.is_char_boundary(cut) {
            cut -= 1;
        }
        cut
    }
}

impl Chunker for GenericChunker {
    fn chunk(&self, path: &Path, source: &str) -> Result<Vec<Chunk>, ChunkerError> {
        if source.trim().is_empty() {
            return Ok(vec![]);
        }

        let language = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "text".to_string());

        // Byte offset of the start of each line, for offset -> line lookups
        let mut line_starts = vec![0usize];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        let line_of = |offset: usize| -> u32 {
            match line_starts.binary_search(&offset) {
                Ok(i) => i as u32 + 1,
                Err(i) => i as u32,
            }
        };

        let mut chunks = Vec::new();
        let mut pos = 0usize;

        while pos < source.len() {
            let remaining = source.len() - pos;
            let cut = if remaining <= self.window_bytes {
                source.len()
            } else {
                let limit = pos + self.window_bytes;
                // Search the trailing portion of the window for a good break
                let min_cut = pos + self.window_bytes.saturating_sub(self.overlap_bytes * 2).max(1);
                let mut cut = Self::find_cut(source, min_cut, limit);
                if cut <= pos {
                    cut = limit.min(source.len());
                }
                cut
            };

            let body = &source[pos..cut];
            if body.trim().is_empty() {
                pos = cut;
                continue;
            }

            // Context prefix from the previous body, preferring a line start
            // inside the overlap region (never longer than the overlap)
            let content = if pos == 0 || self.overlap_bytes == 0 {
                body.to_string()
            } else {
                let mut raw = pos.saturating_sub(self.overlap_bytes);
                while !source.is_char_boundary(raw) {
                    raw += 1;
                }
                let ctx_start = match source[raw..pos].find('\n') {
                    Some(rel) => raw + rel + 1,
                    None => raw,
                };
                source[ctx_start..cut].to_string()
            };

            let start_line = line_of(pos);
            // end: line containing the last byte of the body
            let end_line = line_of(cut - 1).max(start_line);

            chunks.push(Chunk::build(
                path,
                ChunkType::Block,
                first_line_name(body, NAME_MAX),
                "",
                start_line,
                end_line,
                content,
                language.clone(),
            ));

            pos = cut;
        }

        Ok(chunks)
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[]
    }

    fn name(&self) -> &'static str {
        "generic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::assert_source_order;

    fn chunk(source: &str) -> Vec<Chunk> {
        GenericChunker::default()
            .chunk(Path::new("notes.txt"), source)
            .unwrap()
    }

    #[test]
    fn test_small_file_single_chunk() {
        let chunks = chunk("short text\nsecond line\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::Block);
        assert_eq!(chunks[0].name, "short text");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 2);
    }

    #[test]
    fn test_empty_and_blank_input() {
        assert!(chunk("").is_empty());
        assert!(chunk("   \n \n").is_empty());
    }

    #[test]
    fn test_large_file_splits_at_blank_lines() {
        let mut source = String::new();
        for i in 0..200 {
            source.push_str(&format!("paragraph {} with some filler text here\n", i));
            if i % 5 == 4 {
                source.push('\n');
            }
        }
        let chunks = chunk(&source);
        assert!(chunks.len() > 1);
        assert_source_order(&chunks);
        // Every boundary except the last body should land right after a
        // newline, because the source is full of them
        for c in &chunks {
            assert!(c.content.ends_with('\n') || c.end_line == chunks.last().unwrap().end_line);
        }
    }

    #[test]
    fn test_window_respects_size_bound() {
        let source = "word ".repeat(3000);
        let chunks = GenericChunker::new(500)
            .chunk(Path::new("big.txt"), &source)
            .unwrap();
        assert!(chunks.len() > 1);
        for c in &chunks {
            // Body plus overlap prefix can exceed the window, but not by much
            assert!(c.content.len() <= 500 + 150, "chunk too large: {}", c.content.len());
        }
    }

    #[test]
    fn test_overlap_prefix_carried() {
        let mut source = String::new();
        for i in 0..400 {
            source.push_str(&format!("line number {} with padding text\n", i));
        }
        let chunks = GenericChunker::new(600)
            .chunk(Path::new("big.txt"), &source)
            .unwrap();
        assert!(chunks.len() > 2);
        // Second chunk's content should start before its own body (context
        // from the previous window), so its first line differs from the
        // line at start_line only by being earlier.
        let second = &chunks[1];
        let body_first_line = source
            .lines()
            .nth(second.start_line as usize - 1)
            .unwrap();
        assert!(second.content.contains(body_first_line));
        assert!(!second.content.starts_with(body_first_line));
    }

    #[test]
    fn test_hard_cut_on_unbroken_text() {
        let source = "x".repeat(5000);
        let chunks = GenericChunker::new(1000)
            .chunk(Path::new("blob.txt"), &source)
            .unwrap();
        assert!(chunks.len() >= 5);
        assert_source_order(&chunks);
    }

    #[test]
    fn test_multibyte_text_never_panics() {
        let source = "héllo wörld ünïcode ".repeat(500);
        let chunks = GenericChunker::new(256)
            .chunk(Path::new("uni.txt"), &source)
            .unwrap();
        assert!(!chunks.is_empty());
    }

    #[test]
    fn test_language_from_extension() {
        let chunks = GenericChunker::default()
            .chunk(Path::new("conf.toml"), "key = 1\n")
            .unwrap();
        assert_eq!(chunks[0].language, "toml");
        let chunks = GenericChunker::default()
            .chunk(Path::new("LICENSE"), "MIT License\n")
            .unwrap();
        assert_eq!(chunks[0].language, "text");
    }
}
