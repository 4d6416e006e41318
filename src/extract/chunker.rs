pub const DEFAULT_MAX_CHARS: usize = 16_000;
pub const DEFAULT_OVERLAP_CHARS: usize = 800;

/// One slice of a document handed to the LLM. Positions are code-point
/// offsets into the full document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// Splits document text into overlapping chunks, preferring paragraph
/// breaks that fall within the last 20% of a proposed chunk.
pub struct DocumentChunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl DocumentChunker {
    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
            overlap_chars,
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();

        if total <= self.max_chars {
            return vec![TextChunk {
                text: text.to_string(),
                start_char: 0,
                end_char: total,
                chunk_index: 0,
                total_chunks: 1,
            }];
        }

        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut start = 0usize;
        loop {
            let proposed_end = (start + self.max_chars).min(total);
            let end = if proposed_end < total {
                self.paragraph_break(&chars, start, proposed_end)
                    .unwrap_or(proposed_end)
            } else {
                proposed_end
            };
            spans.push((start, end));

            if end >= total {
                break;
            }
            // Overlap the next chunk with the tail of this one, while always
            // making forward progress even when overlap >= chunk size.
            let next = end.saturating_sub(self.overlap_chars);
            start = if next > start { next } else { end };
        }

        let total_chunks = spans.len();
        spans
            .into_iter()
            .enumerate()
            .map(|(chunk_index, (start_char, end_char))| TextChunk {
                text: chars[start_char..end_char].iter().collect(),
                start_char,
                end_char,
                chunk_index,
                total_chunks,
            })
            .collect()
    }

    /// Find the last `\n\n` whose break point lands within the final 20% of
    /// the proposed chunk; returns the position just past the break.
    fn paragraph_break(&self, chars: &[char], start: usize, proposed_end: usize) -> Option<usize> {
        let window = self.max_chars / 5;
        let window_start = proposed_end.saturating_sub(window).max(start);
        let mut found = None;
        let mut i = window_start;
        while i + 1 < proposed_end {
            if chars[i] == '\n' && chars[i + 1] == '\n' {
                found = Some(i + 2);
            }
            i += 1;
        }
        found
    }
}

impl Default for DocumentChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS, DEFAULT_OVERLAP_CHARS)
    }
}
