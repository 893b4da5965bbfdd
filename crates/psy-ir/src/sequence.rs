//! Play order: which pattern plays at each song position.

use heapless::Vec as FixedVec;

use crate::pattern::MAX_PATTERNS;

pub const MAX_SONG_POSITIONS: usize = 256;
/// Sequences stored per song.
pub const MAX_SEQUENCES: usize = 1;

/// One song position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeqEntry {
    pub pattern: u8,
    /// Editor selection only.
    pub selected: bool,
}

/// Ordered list of pattern indices. Never shorter than one entry.
#[derive(Clone, Debug)]
pub struct SequenceStore {
    entries: FixedVec<SeqEntry, MAX_SONG_POSITIONS>,
}

impl Default for SequenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceStore {
    pub fn new() -> Self {
        let mut s = Self { entries: FixedVec::new() };
        s.reset();
        s
    }

    /// One position playing pattern 0, selected.
    pub fn reset(&mut self) {
        self.entries.clear();
        let _ = self.entries.push(SeqEntry { pattern: 0, selected: true });
    }

    pub fn play_length(&self) -> usize {
        self.entries.len()
    }

    /// Grow with pattern 0 or cut off at the end.
    pub fn set_play_length(&mut self, length: usize) {
        let length = length.clamp(1, MAX_SONG_POSITIONS);
        let _ = self.entries.resize(length, SeqEntry::default());
    }

    pub fn entries(&self) -> &[SeqEntry] {
        &self.entries
    }

    pub fn pattern_at(&self, position: usize) -> Option<usize> {
        self.entries.get(position).map(|e| e.pattern as usize)
    }

    pub fn set_pattern_at(&mut self, position: usize, pattern: usize) -> bool {
        if pattern >= MAX_PATTERNS {
            return false;
        }
        match self.entries.get_mut(position) {
            Some(e) => {
                e.pattern = pattern as u8;
                true
            }
            None => false,
        }
    }

    /// Insert a position before `position`. Fails when full.
    pub fn insert(&mut self, position: usize, pattern: usize) -> bool {
        if pattern >= MAX_PATTERNS || position > self.entries.len() {
            return false;
        }
        let entry = SeqEntry { pattern: pattern as u8, selected: false };
        self.entries.insert(position, entry).is_ok()
    }

    /// Remove a position. The last remaining one stays.
    pub fn remove(&mut self, position: usize) -> bool {
        if self.entries.len() <= 1 || position >= self.entries.len() {
            return false;
        }
        self.entries.remove(position);
        true
    }

    pub fn select(&mut self, position: usize, selected: bool) {
        if let Some(e) = self.entries.get_mut(position) {
            e.selected = selected;
        }
    }

    pub fn contains(&self, pattern: usize) -> bool {
        self.entries.iter().any(|e| e.pattern as usize == pattern)
    }

    /// Highest pattern index referenced by the play order.
    pub fn highest_pattern_index(&self) -> usize {
        self.entries.iter().map(|e| e.pattern as usize).max().unwrap_or(0)
    }
}
