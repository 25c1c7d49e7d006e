//! Deterministic document chunkers.
//!
//! Two strategies, both pure functions of their input — downstream vector
//! ids depend on chunk position, so identical text must always produce the
//! identical chunk sequence:
//!
//! - **Section-aware** ([`ChunkingEngine::chunk_document`]'s first pass):
//!   scans lines; a heading (Markdown `#` or `N.`/`N.N.` numbering) starts a
//!   new chunk once the current one has passed the MIN size, and any chunk
//!   past the MAX size flushes regardless. Falls back to overlap chunking
//!   when the result is degenerate.
//! - **Overlap-based**: splits on blank-line paragraph boundaries,
//!   accumulates up to MAX, and seeds each following chunk with a
//!   sentence-trimmed tail of the previous one. Oversized stragglers are
//!   re-cut with fixed-width windows.
//!
//! All slicing is snapped to UTF-8 char boundaries.

use crate::config::ChunkingConfig;
use crate::models::DocumentChunk;

/// Deterministic splitter for document text.
#[derive(Debug, Clone)]
pub struct ChunkingEngine {
    config: ChunkingConfig,
}

impl ChunkingEngine {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Split a document, preferring section boundaries.
    ///
    /// The section pass is used unless it degenerates (no chunks, or a
    /// single chunk beyond MAX), in which case the overlap pass runs
    /// instead.
    pub fn chunk_document(&self, file_path: &str, text: &str) -> Vec<DocumentChunk> {
        let max = self.config.max_chunk_chars;
        let mut pieces = self.section_chunks(text);

        let degenerate =
            pieces.is_empty() || (pieces.len() == 1 && pieces[0].len() > max);
        if degenerate {
            pieces = self.overlap_chunks(text);
        }

        let total = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, content)| DocumentChunk {
                content,
                file_path: file_path.to_string(),
                chunk_index: i,
                chunk_total: total,
            })
            .collect()
    }

    /// Line-scanning pass that flushes at section headings.
    pub fn section_chunks(&self, text: &str) -> Vec<String> {
        let min = self.config.min_section_chars;
        let max = self.config.max_chunk_chars;

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();

        for line in text.lines() {
            if is_heading(line) && current.len() > min {
                chunks.push(current.trim().to_string());
                current = String::new();
            }

            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);

            // Oversized chunks flush even without a heading
            if current.len() > max {
                chunks.push(current.trim().to_string());
                current = String::new();
            }
        }

        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }

        chunks.retain(|c| !c.is_empty());
        chunks
    }

    /// Paragraph-accumulating pass with a sentence-trimmed overlap tail.
    pub fn overlap_chunks(&self, text: &str) -> Vec<String> {
        let max = self.config.max_chunk_chars;
        let overlap = self.config.overlap_chars;

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();

        for para in text.split("\n\n") {
            let trimmed = para.trim();
            if trimmed.is_empty() {
                continue;
            }

            let would_be = if current.is_empty() {
                trimmed.len()
            } else {
                current.len() + 2 + trimmed.len()
            };

            if would_be > max && !current.is_empty() {
                let tail = overlap_tail(&current, overlap);
                chunks.push(std::mem::take(&mut current));
                current = tail;
            }

            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }

        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }

        // Anything the paragraph pass could not keep under control gets
        // re-cut with fixed-width windows.
        let hard_limit = max + max / 5;
        if chunks.iter().any(|c| c.len() > hard_limit) {
            let mut windowed = Vec::new();
            for chunk in &chunks {
                if chunk.len() > hard_limit {
                    windowed.extend(self.window_chunks(chunk));
                } else {
                    windowed.push(chunk.clone());
                }
            }
            chunks = windowed;
        }

        chunks
    }

    /// Fixed-width character windows with the configured overlap, breaking
    /// near sentence boundaries when one is close enough.
    fn window_chunks(&self, text: &str) -> Vec<String> {
        let max = self.config.max_chunk_chars;
        let overlap = self.config.overlap_chars.min(max / 2);

        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < text.len() {
            let mut end = snap_to_char_boundary(text, (start + max).min(text.len()));

            if end < text.len() {
                // Prefer a sentence break inside the final fifth of the window
                let search_from = snap_to_char_boundary(text, end.saturating_sub(max / 5));
                if let Some(pos) = last_sentence_end(&text[search_from..end]) {
                    end = search_from + pos;
                }
            }

            if end <= start {
                end = (start + max).min(text.len());
                while end < text.len() && !text.is_char_boundary(end) {
                    end += 1;
                }
            }

            let piece = text[start..end].trim();
            if !piece.is_empty() {
                chunks.push(piece.to_string());
            }

            if end >= text.len() {
                break;
            }
            // Forward-snap so multibyte input always makes progress
            let mut next = end.saturating_sub(overlap).max(start + 1);
            while next < text.len() && !text.is_char_boundary(next) {
                next += 1;
            }
            start = next;
        }

        chunks
    }
}

/// True for Markdown headers (`#`–`######` + space) and decimal section
/// numbering (`3. Title`, `3.2. Title`).
fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start();

    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ') {
        return true;
    }

    numbered_heading(trimmed)
}

/// Matches `N.` or `N.N.` followed by whitespace and a title.
fn numbered_heading(line: &str) -> bool {
    let mut rest = line;
    let mut groups = 0;

    loop {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 || !rest[digits..].starts_with('.') {
            break;
        }
        groups += 1;
        rest = &rest[digits + 1..];
        if groups == 2 {
            break;
        }
    }

    groups >= 1
        && (1..=2).contains(&groups)
        && rest.starts_with(' ')
        && !rest.trim().is_empty()
}

/// Tail of `chunk` used to seed the next one: roughly `overlap` characters,
/// trimmed forward to the start of the last one or two sentences.
fn overlap_tail(chunk: &str, overlap: usize) -> String {
    if overlap == 0 || chunk.is_empty() {
        return String::new();
    }

    let from = snap_to_char_boundary(chunk, chunk.len().saturating_sub(overlap));
    let tail = &chunk[from..];

    let mut starts: Vec<usize> = Vec::new();
    let bytes = tail.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') && bytes.get(i + 1) == Some(&b' ') {
            starts.push(i + 2);
        }
    }

    let begin = match starts.len() {
        0 => 0,
        1 => starts[0],
        n => starts[n - 2],
    };

    tail[snap_to_char_boundary(tail, begin)..].trim().to_string()
}

/// Byte offset of the character after the last sentence terminator, if any.
fn last_sentence_end(window: &str) -> Option<usize> {
    let bytes = window.as_bytes();
    (0..bytes.len())
        .rev()
        .find(|&i| {
            matches!(bytes[i], b'.' | b'!' | b'?')
                && bytes.get(i + 1).map_or(true, |b| *b == b' ' || *b == b'\n')
        })
        .map(|i| i + 1)
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
