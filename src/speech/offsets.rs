//! Character-offset bookkeeping shared by every provider adapter.
//!
//! Backends report progress as a character offset into the text they were
//! given (or as a word they have reached). Each adapter builds the request
//! text through [`OffsetTable::build`], which records where every word
//! starts, and maps reports back to global word indices with
//! [`OffsetTable::word_at`].
//!
//! All offsets here count Unicode scalar values, not bytes.

use std::borrow::Cow;

use super::interface::TimingEntry;

#[derive(Debug, Clone)]
pub struct OffsetTable {
    /// Char offset of each word's first character, ascending.
    starts: Vec<usize>,
    /// Global index of the first word in the table.
    base_index: usize,
}

impl OffsetTable {
    /// Join `words` with single spaces after passing each through `escape`,
    /// recording word starts as if the joined text began at `prefix_chars`.
    ///
    /// Returns the joined text and the table.
    pub fn build<F>(words: &[String], base_index: usize, prefix_chars: usize, escape: F) -> (String, Self)
    where
        F: Fn(&str) -> Cow<'_, str>,
    {
        let mut text = String::new();
        let mut starts = Vec::with_capacity(words.len());
        let mut cursor = prefix_chars;
        for (i, word) in words.iter().enumerate() {
            if i > 0 {
                text.push(' ');
                cursor += 1;
            }
            let escaped = escape(word);
            starts.push(cursor);
            cursor += escaped.chars().count();
            text.push_str(&escaped);
        }
        (text, Self { starts, base_index })
    }

    /// Plain join, no escaping, offsets relative to the joined text.
    pub fn plain(words: &[String], base_index: usize) -> (String, Self) {
        Self::build(words, base_index, 0, |w| Cow::Borrowed(w))
    }

    /// Global index of the word with the greatest start offset `<= offset`.
    /// `None` for offsets before the first word.
    pub fn word_at(&self, offset: usize) -> Option<usize> {
        let idx = self.starts.partition_point(|&start| start <= offset);
        if idx == 0 {
            None
        } else {
            Some(self.base_index + idx - 1)
        }
    }

    pub fn start_of(&self, word_index: usize) -> Option<usize> {
        word_index
            .checked_sub(self.base_index)
            .and_then(|local| self.starts.get(local).copied())
    }

    pub fn base_index(&self) -> usize {
        self.base_index
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}

/// Accumulates a chunk's timing table from backend reports, keeping word
/// indices strictly increasing and audio offsets non-decreasing.
pub struct TimingBuilder<'a> {
    table: &'a OffsetTable,
    entries: Vec<TimingEntry>,
}

impl<'a> TimingBuilder<'a> {
    pub fn new(table: &'a OffsetTable) -> Self {
        Self {
            table,
            entries: Vec::with_capacity(table.len()),
        }
    }

    /// Record that the word containing char `offset` starts at `audio_offset_ms`.
    /// Reports for an already-recorded (or earlier) word are skipped.
    pub fn push_char_offset(&mut self, offset: usize, audio_offset_ms: u64) -> bool {
        match self.table.word_at(offset) {
            Some(word_index) => self.push_word(word_index, audio_offset_ms),
            None => false,
        }
    }

    pub fn push_word(&mut self, word_index: usize, audio_offset_ms: u64) -> bool {
        if let Some(last) = self.entries.last() {
            if word_index <= last.word_index {
                return false;
            }
        }
        let floor = self.entries.last().map(|e| e.audio_offset_ms).unwrap_or(0);
        self.entries.push(TimingEntry {
            word_index,
            audio_offset_ms: audio_offset_ms.max(floor),
        });
        true
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self) -> Vec<TimingEntry> {
        self.entries
    }
}

/// Spread `length` words evenly across `duration_ms`. Used when a backend
/// returns audio without any usable timing information.
pub fn evenly_spaced(start_index: usize, length: usize, duration_ms: u64) -> Vec<TimingEntry> {
    if length == 0 {
        return Vec::new();
    }
    let step = duration_ms as f64 / length as f64;
    (0..length)
        .map(|i| TimingEntry {
            word_index: start_index + i,
            audio_offset_ms: (i as f64 * step).round() as u64,
        })
        .collect()
}

/// Char offset of `needle` in `haystack`, searching from char offset `from`.
pub fn find_chars(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let byte_from = haystack
        .char_indices()
        .nth(from)
        .map(|(b, _)| b)
        .unwrap_or(haystack.len());
    let found = haystack[byte_from..].find(needle)?;
    Some(from + haystack[byte_from..byte_from + found].chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn plain_table_maps_offsets_to_words() {
        let (text, table) = OffsetTable::plain(&words("The cat sat."), 10);
        assert_eq!(text, "The cat sat.");
        assert_eq!(table.word_at(0), Some(10));
        assert_eq!(table.word_at(3), Some(10)); // the space belongs to the previous word
        assert_eq!(table.word_at(4), Some(11));
        assert_eq!(table.word_at(8), Some(12));
        assert_eq!(table.word_at(500), Some(12));
    }

    #[test]
    fn prefix_and_escaping_shift_offsets() {
        fn escape(w: &str) -> Cow<'_, str> {
            if w.contains('&') {
                Cow::Owned(w.replace('&', "&amp;"))
            } else {
                Cow::Borrowed(w)
            }
        }
        let (text, table) = OffsetTable::build(&words("salt & pepper"), 0, 5, escape);
        assert_eq!(text, "salt &amp; pepper");
        assert_eq!(table.start_of(0), Some(5));
        assert_eq!(table.start_of(1), Some(10));
        assert_eq!(table.start_of(2), Some(16));
        assert_eq!(table.word_at(4), None);
        assert_eq!(table.word_at(12), Some(1));
    }

    #[test]
    fn multibyte_words_count_chars() {
        let (_, table) = OffsetTable::plain(&words("café über naïve"), 0);
        assert_eq!(table.start_of(1), Some(5));
        assert_eq!(table.start_of(2), Some(10));
    }

    #[test]
    fn builder_skips_duplicates_and_regressions() {
        let (_, table) = OffsetTable::plain(&words("one two three"), 0);
        let mut b = TimingBuilder::new(&table);
        assert!(b.push_char_offset(0, 0));
        assert!(!b.push_char_offset(1, 50));
        assert!(b.push_char_offset(8, 400));
        assert!(!b.push_char_offset(4, 300));
        let entries = b.finish();
        assert_eq!(
            entries,
            vec![
                TimingEntry { word_index: 0, audio_offset_ms: 0 },
                TimingEntry { word_index: 2, audio_offset_ms: 400 },
            ]
        );
    }

    #[test]
    fn builder_keeps_offsets_non_decreasing() {
        let (_, table) = OffsetTable::plain(&words("a b c"), 0);
        let mut b = TimingBuilder::new(&table);
        b.push_word(0, 300);
        b.push_word(1, 200);
        let entries = b.finish();
        assert_eq!(entries[1].audio_offset_ms, 300);
    }

    #[test]
    fn evenly_spaced_covers_every_word() {
        let t = evenly_spaced(4, 4, 1000);
        assert_eq!(t.len(), 4);
        assert_eq!(t[0], TimingEntry { word_index: 4, audio_offset_ms: 0 });
        assert_eq!(t[3], TimingEntry { word_index: 7, audio_offset_ms: 750 });
    }

    #[test]
    fn find_chars_respects_cursor() {
        let hay = "é a é a";
        assert_eq!(find_chars(hay, "a", 0), Some(2));
        assert_eq!(find_chars(hay, "a", 3), Some(6));
        assert_eq!(find_chars(hay, "z", 0), None);
        assert_eq!(find_chars(hay, "a", 99), None);
    }
}
