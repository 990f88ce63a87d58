//! Declaration-based code chunker
//!
//! A per-language table of declaration patterns drives a line scanner: each
//! top-level declaration becomes one chunk spanning its syntactic body
//! (brace-matched, or indentation-delimited for Python), with immediately
//! preceding comment and attribute lines attached. Regions between
//! declarations that carry enough content fall back to the generic
//! sliding-window splitter so module-level code is still indexed.

use std::path::Path;

use regex::Regex;

use super::generic::GenericChunker;
use super::{chunk_id, Chunk, ChunkType, Chunker, ChunkerError};

/// Gap regions with at least this many bytes of non-blank content are
/// routed through the generic splitter instead of being dropped.
const GAP_MIN_BYTES: usize = 400;
/// Signature lines are truncated to this length.
const SIGNATURE_MAX: usize = 160;

/// How a declaration's body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyStyle {
    /// `{ ... }` matched with a quote-aware brace counter
    Braces,
    /// Lines indented deeper than the declaration line (Python)
    Indent,
}

/// One declaration pattern: regex with the name in capture group 1.
struct DeclPattern {
    regex: Regex,
    chunk_type: ChunkType,
}

/// Static description of one language's declaration grammar.
pub struct LanguageSpec {
    name: &'static str,
    extensions: &'static [&'static str],
    patterns: Vec<DeclPattern>,
    body: BodyStyle,
    /// Line prefixes that count as attached comments/attributes
    comment_prefixes: &'static [&'static str],
    /// `#` starts a line comment inside bodies (PHP)
    hash_comments: bool,
    /// `'` is a lifetime marker unless it closes as a char literal (Rust)
    tick_is_lifetime: bool,
}

pub struct CodeChunker {
    spec: LanguageSpec,
    generic: GenericChunker,
}

fn decl(pattern: &str, chunk_type: ChunkType) -> DeclPattern {
    DeclPattern {
        regex: Regex::new(pattern).expect("valid declaration regex"),
        chunk_type,
    }
}

impl CodeChunker {
    pub fn go() -> Self {
        Self::from_spec(LanguageSpec {
            name: "go",
            extensions: &["go"],
            patterns: vec![
                decl(r"^func\s+\([^)]*\)\s+(\w+)", ChunkType::Method),
                decl(r"^func\s+(\w+)", ChunkType::Function),
                decl(r"^type\s+(\w+)\s+struct\b", ChunkType::Struct),
                decl(r"^type\s+(\w+)\s+interface\b", ChunkType::Interface),
                decl(r"^type\s+(\w+)\b", ChunkType::Generic),
            ],
            body: BodyStyle::Braces,
            comment_prefixes: &["//"],
            hash_comments: false,
            tick_is_lifetime: false,
        })
    }

    pub fn rust() -> Self {
        Self::from_spec(LanguageSpec {
            name: "rust",
            extensions: &["rs"],
            patterns: vec![
                decl(
                    r"^(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+\S+\s+)?fn\s+(\w+)",
                    ChunkType::Function,
                ),
                decl(r"^(?:pub(?:\([^)]*\))?\s+)?struct\s+(\w+)", ChunkType::Struct),
                decl(r"^(?:pub(?:\([^)]*\))?\s+)?enum\s+(\w+)", ChunkType::Struct),
                decl(
                    r"^(?:pub(?:\([^)]*\))?\s+)?(?:unsafe\s+)?trait\s+(\w+)",
                    ChunkType::Interface,
                ),
                decl(r"^impl(?:<[^>]*>)?\s+(?:\w+(?:::\w+)*\s+for\s+)?([\w:]+)", ChunkType::Module),
                decl(r"^(?:pub(?:\([^)]*\))?\s+)?mod\s+(\w+)", ChunkType::Module),
            ],
            body: BodyStyle::Braces,
            comment_prefixes: &["///", "//!", "//", "#["],
            hash_comments: false,
            tick_is_lifetime: true,
        })
    }

    pub fn python() -> Self {
        Self::from_spec(LanguageSpec {
            name: "python",
            extensions: &["py", "pyi"],
            patterns: vec![
                decl(r"^(?:async\s+)?def\s+(\w+)", ChunkType::Function),
                decl(r"^class\s+(\w+)", ChunkType::Class),
            ],
            body: BodyStyle::Indent,
            comment_prefixes: &["#", "@"],
            hash_comments: true,
            tick_is_lifetime: false,
        })
    }

    pub fn javascript() -> Self {
        Self::from_spec(LanguageSpec {
            name: "javascript",
            extensions: &["js", "jsx", "ts", "tsx", "mjs", "cjs"],
            patterns: vec![
                decl(
                    r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*(\w+)",
                    ChunkType::Function,
                ),
                decl(r"^(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+(\w+)", ChunkType::Class),
                decl(r"^(?:export\s+)?interface\s+(\w+)", ChunkType::Interface),
                decl(r"^(?:export\s+)?(?:const\s+)?enum\s+(\w+)", ChunkType::Struct),
                decl(
                    r"^(?:export\s+)?(?:const|let|var)\s+(\w+)\s*=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*(?::[^=]+)?=>|\w+\s*=>)",
                    ChunkType::Function,
                ),
            ],
            body: BodyStyle::Braces,
            comment_prefixes: &["//", "/*", "*"],
            hash_comments: false,
            tick_is_lifetime: false,
        })
    }

    pub fn php() -> Self {
        Self::from_spec(LanguageSpec {
            name: "php",
            extensions: &["php"],
            patterns: vec![
                decl(
                    r"^(?:final\s+|abstract\s+)?(?:public\s+|private\s+|protected\s+|static\s+)*function\s+&?(\w+)",
                    ChunkType::Function,
                ),
                decl(r"^(?:final\s+|abstract\s+)?class\s+(\w+)", ChunkType::Class),
                decl(r"^interface\s+(\w+)", ChunkType::Interface),
                decl(r"^trait\s+(\w+)", ChunkType::Interface),
            ],
            body: BodyStyle::Braces,
            comment_prefixes: &["//", "#", "/*", "*", "#["],
            hash_comments: true,
            tick_is_lifetime: false,
        })
    }

    fn from_spec(spec: LanguageSpec) -> Self {
        Self {
            spec,
            generic: GenericChunker::default(),
        }
    }

    /// Match a trimmed line against the declaration table.
    fn match_decl<'a>(&self, line: &'a str) -> Option<(ChunkType, &'a str)> {
        for pattern in &self.spec.patterns {
            if let Some(caps) = pattern.regex.captures(line) {
                if let Some(name) = caps.get(1) {
                    return Some((pattern.chunk_type, name.as_str()));
                }
            }
        }
        None
    }

    /// End line (0-indexed, inclusive) of a brace-delimited body starting at
    /// `decl_line`. Falls back to the declaration line itself for bodyless
    /// declarations (`type Foo = Bar;`).
    fn brace_span(&self, lines: &[&str], decl_line: usize) -> usize {
        let mut depth = 0i32;
        let mut seen_open = false;

        for (i, line) in lines.iter().enumerate().skip(decl_line) {
            let mut chars = line.chars().peekable();
            let mut in_str: Option<char> = None;
            while let Some(c) = chars.next() {
                match in_str {
                    Some(q) => {
                        if c == '\\' {
                            chars.next();
                        } else if c == q {
                            in_str = None;
                        }
                    }
                    None => match c {
                        '"' | '`' => in_str = Some(c),
                        '\'' if self.spec.tick_is_lifetime => {
                            // Char literal ('x' or '\n') closes within two
                            // chars; anything else is a lifetime marker
                            let mut ahead = chars.clone();
                            match (ahead.next(), ahead.next(), ahead.next()) {
                                (Some('\\'), _, Some('\'')) | (Some(_), Some('\''), _) => {
                                    in_str = Some('\'');
                                }
                                _ => {}
                            }
                        }
                        '\'' => in_str = Some('\''),
                        '/' if chars.peek() == Some(&'/') => break,
                        '#' if self.spec.hash_comments => break,
                        '{' => {
                            depth += 1;
                            seen_open = true;
                        }
                        '}' => depth -= 1,
                        ';' if !seen_open => return i,
                        _ => {}
                    },
                }
            }
            if seen_open && depth <= 0 {
                return i;
            }
            // A declaration with no body within a few lines is single-line
            if !seen_open && i > decl_line + 4 {
                return decl_line;
            }
        }
        lines.len().saturating_sub(1)
    }

    /// End line of an indentation-delimited body (Python).
    fn indent_span(lines: &[&str], decl_line: usize) -> usize {
        let decl_indent = indent_width(lines[decl_line]);
        let mut last = decl_line;
        for (i, line) in lines.iter().enumerate().skip(decl_line + 1) {
            if line.trim().is_empty() {
                continue;
            }
            if indent_width(line) <= decl_indent {
                break;
            }
            last = i;
        }
        last
    }

    /// First line of the comment/attribute block immediately above
    /// `decl_line` (returns `decl_line` when there is none).
    fn attach_preceding(&self, lines: &[&str], decl_line: usize) -> usize {
        let mut start = decl_line;
        while start > 0 {
            let above = lines[start - 1].trim_start();
            let attached = !above.is_empty()
                && self
                    .spec
                    .comment_prefixes
                    .iter()
                    .any(|p| above.starts_with(p));
            if attached {
                start -= 1;
            } else {
                break;
            }
        }
        start
    }

    /// Generic-split a gap region, offsetting line numbers into file space.
    fn chunk_gap(
        &self,
        path: &Path,
        lines: &[&str],
        start: usize,
        end: usize,
        out: &mut Vec<Chunk>,
    ) {
        let text = lines[start..end].join("\n");
        let solid: usize = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.len())
            .sum();
        if solid < GAP_MIN_BYTES {
            return;
        }
        if let Ok(sub) = self.generic.chunk(path, &text) {
            for mut chunk in sub {
                chunk.start_line += start as u32;
                chunk.end_line += start as u32;
                chunk.id = chunk_id(path, chunk.start_line, &chunk.content_hash);
                chunk.language = self.spec.name.to_string();
                out.push(chunk);
            }
        }
    }
}

fn indent_width(line: &str) -> usize {
    line.chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

fn signature_of(line: &str) -> String {
    let sig = line
        .trim()
        .trim_end_matches(|c| c == '{' || c == ':' || c == ' ');
    let mut end = sig.len().min(SIGNATURE_MAX);
    while !sig.is_char_boundary(end) {
        end -= 1;
    }
    sig[..end].to_string()
}

impl Chunker for CodeChunker {
    fn chunk(&self, path: &Path, source: &str) -> Result<Vec<Chunk>, ChunkerError> {
        if source.trim().is_empty() {
            return Ok(vec![]);
        }

        let lines: Vec<&str> = source.lines().collect();
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut cursor = 0usize; // first line not yet consumed
        let mut i = 0usize;

        while i < lines.len() {
            let trimmed = lines[i].trim_start();
            // Only top-level declarations split; indented ones belong to the
            // enclosing declaration's span (already consumed below)
            let top_level = indent_width(lines[i]) == 0;
            let matched = if top_level {
                self.match_decl(trimmed)
            } else {
                None
            };

            let Some((chunk_type, name)) = matched else {
                i += 1;
                continue;
            };

            let body_end = match self.spec.body {
                BodyStyle::Braces => self.brace_span(&lines, i),
                BodyStyle::Indent => Self::indent_span(&lines, i),
            };
            let attach_start = self.attach_preceding(&lines, i).max(cursor);

            // Anything between the previous chunk and this one is a gap
            if attach_start > cursor {
                self.chunk_gap(path, &lines, cursor, attach_start, &mut chunks);
            }

            let content = lines[attach_start..=body_end].join("\n");
            chunks.push(Chunk::build(
                path,
                chunk_type,
                name,
                signature_of(lines[i]),
                attach_start as u32 + 1,
                body_end as u32 + 1,
                content,
                self.spec.name,
            ));

            cursor = body_end + 1;
            i = body_end + 1;
        }

        // Trailing gap
        if cursor < lines.len() {
            self.chunk_gap(path, &lines, cursor, lines.len(), &mut chunks);
        }

        if chunks.is_empty() {
            // No declarations found anywhere: size-bounded generic fallback
            let mut fallback = self.generic.chunk(path, source)?;
            for chunk in &mut fallback {
                chunk.language = self.spec.name.to_string();
            }
            return Ok(fallback);
        }

        Ok(chunks)
    }

    fn extensions(&self) -> &'static [&'static str] {
        self.spec.extensions
    }

    fn name(&self) -> &'static str {
        self.spec.name
    }
}
