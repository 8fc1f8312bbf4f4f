//! Chunk Segmenter: splits a word stream into bounded, sentence-aligned
//! slices, each small enough for one synthesis call.

use serde::{Deserialize, Serialize};

pub const MIN_CHUNK_WORDS: usize = 15;
pub const MAX_CHUNK_WORDS: usize = 80;

/// Bounds for chunk sizes. `min_words` keeps network calls from becoming
/// pathologically tiny, `max_words` caps payload size and prosody span.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkPolicy {
    #[serde(default = "default_min_words")]
    pub min_words: usize,
    #[serde(default = "default_max_words")]
    pub max_words: usize,
}

fn default_min_words() -> usize {
    MIN_CHUNK_WORDS
}
fn default_max_words() -> usize {
    MAX_CHUNK_WORDS
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            min_words: MIN_CHUNK_WORDS,
            max_words: MAX_CHUNK_WORDS,
        }
    }
}

impl ChunkPolicy {
    /// Keep `1 <= min <= max`.
    pub fn normalized(self) -> Self {
        let max_words = self.max_words.max(1);
        Self {
            min_words: self.min_words.clamp(1, max_words),
            max_words,
        }
    }

    /// Number of words the chunk starting at `from` should contain.
    /// Returns 0 only when `from` is at or past the end of `words`.
    pub fn next_chunk_length(&self, words: &[String], from: usize) -> usize {
        let remaining = words.len().saturating_sub(from);
        if remaining <= self.min_words {
            return remaining;
        }

        let scan = remaining.min(self.max_words);
        let mut latest_boundary = None;
        for (offset, word) in words[from..from + scan].iter().enumerate() {
            if ends_sentence(word) {
                let length = offset + 1;
                if length >= self.min_words {
                    return length;
                }
                latest_boundary = Some(length);
            }
        }

        latest_boundary.unwrap_or(scan)
    }

    /// Lazily partition `words[from..]` into `(start, length)` chunks.
    pub fn chunks<'a>(&'a self, words: &'a [String], from: usize) -> Chunks<'a> {
        Chunks {
            policy: self,
            words,
            next: from,
        }
    }
}

/// `next_chunk_length` with the default bounds.
pub fn next_chunk_length(words: &[String], from: usize) -> usize {
    ChunkPolicy::default().next_chunk_length(words, from)
}

/// A word ends a sentence if its last character, after any closing quotes or
/// brackets, is `.`, `!` or `?`.
pub fn ends_sentence(word: &str) -> bool {
    let trimmed = word.trim_end_matches(|c: char| CLOSERS.contains(&c));
    matches!(trimmed.chars().last(), Some('.' | '!' | '?'))
}

const CLOSERS: &[char] = &['"', '\'', ')', ']', '}', '”', '’', '»', '」', '』'];

pub struct Chunks<'a> {
    policy: &'a ChunkPolicy,
    words: &'a [String],
    next: usize,
}

impl Iterator for Chunks<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let length = self.policy.next_chunk_length(self.words, self.next);
        if length == 0 {
            return None;
        }
        let start = self.next;
        self.next += length;
        Some((start, length))
    }
}
