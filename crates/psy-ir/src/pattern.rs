//! Patterns: fixed-width event grids plus their names and track names.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use arrayvec::ArrayString;

/// Allocation width of every pattern, in tracks.
pub const MAX_TRACKS: usize = 64;
/// Upper bound on the line count of a pattern.
pub const MAX_LINES: usize = 1024;
pub const MAX_PATTERNS: usize = 256;
/// Bytes per event cell on disk.
pub const EVENT_SIZE: usize = 5;
/// Bytes per full-width pattern line.
pub const MULTIPLY: usize = MAX_TRACKS * EVENT_SIZE;
pub const DEFAULT_PATTERN_LINES: usize = 64;
pub const DEFAULT_SONG_TRACKS: usize = 16;

pub const NOTE_OFF: u8 = 120;
/// Parameter tweak: `instrument` holds the parameter, command and
/// parameter bytes hold the 16-bit value.
pub const NOTE_TWEAK: u8 = 121;
pub const NOTE_EMPTY: u8 = 255;

const UNTITLED: &str = "Untitled";

/// A single event cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cell {
    pub note: u8,
    pub instrument: u8,
    pub machine: u8,
    pub command: u8,
    pub parameter: u8,
}

impl Default for Cell {
    fn default() -> Self {
        Self::BLANK
    }
}

impl Cell {
    pub const BLANK: Cell = Cell {
        note: NOTE_EMPTY,
        instrument: 255,
        machine: 255,
        command: 0,
        parameter: 0,
    };

    pub fn is_blank(&self) -> bool {
        *self == Self::BLANK
    }

    pub fn to_bytes(self) -> [u8; EVENT_SIZE] {
        [self.note, self.instrument, self.machine, self.command, self.parameter]
    }

    pub fn from_bytes(b: [u8; EVENT_SIZE]) -> Self {
        Self {
            note: b[0],
            instrument: b[1],
            machine: b[2],
            command: b[3],
            parameter: b[4],
        }
    }

    /// 16-bit value of a tweak event.
    pub fn tweak_value(&self) -> u16 {
        u16::from_be_bytes([self.command, self.parameter])
    }

    pub fn set_tweak_value(&mut self, value: u16) {
        [self.command, self.parameter] = value.to_be_bytes();
    }
}

/// One pattern slot.
#[derive(Clone, Debug)]
pub struct Pattern {
    pub lines: usize,
    pub name: ArrayString<32>,
    pub track_names: Vec<String>,
    /// `lines * MAX_TRACKS` cells, row major. `None` until first written.
    data: Option<Vec<Cell>>,
}

impl Pattern {
    fn new(lines: usize) -> Self {
        Self {
            lines,
            name: crate::fixed_name(UNTITLED),
            track_names: vec![String::new(); MAX_TRACKS],
            data: None,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    pub fn cells(&self) -> Option<&[Cell]> {
        self.data.as_deref()
    }

    pub fn cell(&self, line: usize, track: usize) -> Cell {
        if line >= self.lines || track >= MAX_TRACKS {
            return Cell::BLANK;
        }
        self.data
            .as_ref()
            .and_then(|d| d.get(line * MAX_TRACKS + track).copied())
            .unwrap_or(Cell::BLANK)
    }

    /// Mutable cell access, allocating the buffer on first write.
    pub fn cell_mut(&mut self, line: usize, track: usize) -> Option<&mut Cell> {
        if line >= self.lines || track >= MAX_TRACKS {
            return None;
        }
        let lines = self.lines;
        let data = self.data.get_or_insert_with(|| vec![Cell::BLANK; lines * MAX_TRACKS]);
        data.get_mut(line * MAX_TRACKS + track)
    }

    /// True if no buffer exists or every cell within `lines` is blank.
    pub fn is_empty(&self) -> bool {
        self.data
            .as_ref()
            .map_or(true, |d| d.iter().take(self.lines * MAX_TRACKS).all(Cell::is_blank))
    }

    fn row_mut(data: &mut [Cell], line: usize) -> &mut [Cell] {
        &mut data[line * MAX_TRACKS..(line + 1) * MAX_TRACKS]
    }
}

/// All pattern slots plus the settings shared between them.
#[derive(Clone, Debug)]
pub struct PatternStore {
    patterns: Vec<Pattern>,
    song_tracks: usize,
    share_track_names: bool,
    default_lines: usize,
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternStore {
    pub fn new() -> Self {
        Self {
            patterns: (0..MAX_PATTERNS).map(|_| Pattern::new(DEFAULT_PATTERN_LINES)).collect(),
            song_tracks: DEFAULT_SONG_TRACKS,
            share_track_names: true,
            default_lines: DEFAULT_PATTERN_LINES,
        }
    }

    pub fn pattern(&self, index: usize) -> Option<&Pattern> {
        self.patterns.get(index)
    }

    pub fn pattern_mut(&mut self, index: usize) -> Option<&mut Pattern> {
        self.patterns.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Pattern)> + '_ {
        self.patterns.iter().enumerate()
    }

    pub fn lines(&self, index: usize) -> usize {
        self.patterns.get(index).map_or(0, |p| p.lines)
    }

    /// Number of tracks in use.
    pub fn song_tracks(&self) -> usize {
        self.song_tracks
    }

    pub fn set_song_tracks(&mut self, tracks: usize) {
        self.song_tracks = tracks.clamp(1, MAX_TRACKS);
    }

    pub fn default_lines(&self) -> usize {
        self.default_lines
    }

    pub fn set_default_lines(&mut self, lines: usize) {
        self.default_lines = lines.clamp(1, MAX_LINES);
    }

    pub fn share_track_names(&self) -> bool {
        self.share_track_names
    }

    /// Switch name sharing. Turning it on copies pattern 0's names to all.
    pub fn set_track_name_share_mode(&mut self, shared: bool) {
        self.share_track_names = shared;
        if shared {
            for dst in 1..MAX_PATTERNS {
                self.copy_names_from(0, dst);
            }
        }
    }

    pub fn track_name(&self, pattern: usize, track: usize) -> &str {
        self.patterns
            .get(pattern)
            .and_then(|p| p.track_names.get(track))
            .map_or("", String::as_str)
    }

    /// Rename a track. With shared names every pattern's track changes.
    pub fn change_track_name(&mut self, pattern: usize, track: usize, name: &str) {
        if track >= MAX_TRACKS || pattern >= MAX_PATTERNS {
            return;
        }
        if self.share_track_names {
            for p in &mut self.patterns {
                p.track_names[track] = String::from(name);
            }
        } else {
            self.patterns[pattern].track_names[track] = String::from(name);
        }
    }

    pub fn copy_names_from(&mut self, src: usize, dst: usize) {
        if src == dst || src >= MAX_PATTERNS || dst >= MAX_PATTERNS {
            return;
        }
        let names = self.patterns[src].track_names.clone();
        self.patterns[dst].track_names = names;
    }

    /// Give `index` a fresh blank buffer with the default line count.
    pub fn create_new_pattern(&mut self, index: usize) -> bool {
        let lines = self.default_lines;
        match self.patterns.get_mut(index) {
            Some(p) => {
                p.lines = lines;
                p.data = Some(vec![Cell::BLANK; lines * MAX_TRACKS]);
                true
            }
            None => false,
        }
    }

    pub fn remove_pattern(&mut self, index: usize) {
        if let Some(p) = self.patterns.get_mut(index) {
            p.data = None;
        }
    }

    /// Free every buffer and go back to the default track count.
    pub fn delete_all_patterns(&mut self) {
        for p in &mut self.patterns {
            p.data = None;
        }
        self.song_tracks = DEFAULT_SONG_TRACKS;
    }

    /// Default line counts, names and empty track names everywhere.
    pub fn reset(&mut self) {
        let lines = self.default_lines;
        for p in &mut self.patterns {
            p.lines = lines;
            // the buffer only grows; lines past the new length are kept
            if let Some(data) = p.data.as_mut() {
                if data.len() < lines * MAX_TRACKS {
                    data.resize(lines * MAX_TRACKS, Cell::BLANK);
                }
            }
            p.name = crate::fixed_name(UNTITLED);
            for name in &mut p.track_names {
                name.clear();
            }
        }
    }

    pub fn is_pattern_empty(&self, index: usize) -> bool {
        self.patterns.get(index).map_or(true, Pattern::is_empty)
    }

    /// Number of patterns holding at least one event.
    pub fn num_patterns(&self) -> usize {
        self.patterns.iter().filter(|p| !p.is_empty()).count()
    }

    /// Change the line count of `index` and rename it.
    ///
    /// With `adapt` the used tracks are resampled to the new length: line
    /// `l` of the result comes from line `round(l * old / new)`. Without it
    /// lines are appended blank or cut off at the end.
    pub fn alloc_new_pattern(&mut self, index: usize, name: &str, lines: usize, adapt: bool) -> bool {
        let tracks = self.song_tracks;
        let Some(pattern) = self.patterns.get_mut(index) else {
            return false;
        };
        let lines = lines.clamp(1, MAX_LINES);
        let old = pattern.lines;
        let data = pattern
            .data
            .get_or_insert_with(|| vec![Cell::BLANK; old * MAX_TRACKS]);
        if adapt || data.len() < old * MAX_TRACKS {
            data.resize(old * MAX_TRACKS, Cell::BLANK);
        }

        if adapt && lines < old {
            let step = old as f32 / lines as f32;
            for l in 1..lines {
                let from = (libm::roundf(l as f32 * step) as usize).min(old - 1);
                let start = from * MAX_TRACKS;
                data.copy_within(start..start + tracks, l * MAX_TRACKS);
            }
            data.truncate(lines * MAX_TRACKS);
        } else if adapt && lines > old {
            let step = lines as f32 / old as f32;
            data.resize(lines * MAX_TRACKS, Cell::BLANK);
            for l in (1..old).rev() {
                let to = (libm::roundf(l as f32 * step) as usize).min(lines - 1);
                let start = l * MAX_TRACKS;
                data.copy_within(start..start + tracks, to * MAX_TRACKS);
                let mut tz = to as i64 - 1;
                while tz >= 0 && tz as f32 > (l - 1) as f32 * step {
                    Pattern::row_mut(data, tz as usize)[..tracks].fill(Cell::BLANK);
                    tz -= 1;
                }
            }
        } else if !adapt {
            data.resize(lines * MAX_TRACKS, Cell::BLANK);
        }

        pattern.lines = lines;
        pattern.name = crate::fixed_name(name);
        true
    }

    /// Insert a blank column at `track` in `index`, shifting later tracks
    /// one to the right. The last column falls off.
    pub fn insert_track(&mut self, index: usize, track: usize) {
        if track >= MAX_TRACKS {
            return;
        }
        let Some(data) = self.patterns.get_mut(index).and_then(|p| p.data.as_mut()) else {
            return;
        };
        for row in data.chunks_exact_mut(MAX_TRACKS) {
            row.copy_within(track..MAX_TRACKS - 1, track + 1);
            row[track] = Cell::BLANK;
        }
    }

    /// The first `tracks` columns of `lines` lines as raw event bytes.
    pub fn pattern_bytes(&self, index: usize, tracks: usize) -> Vec<u8> {
        let lines = self.lines(index);
        let tracks = tracks.min(MAX_TRACKS);
        let mut out = Vec::with_capacity(lines * tracks * EVENT_SIZE);
        let Some(p) = self.patterns.get(index) else {
            return out;
        };
        for line in 0..lines {
            for track in 0..tracks {
                out.extend_from_slice(&p.cell(line, track).to_bytes());
            }
        }
        out
    }

    /// Fill `index` from raw event bytes laid out `lines x tracks`.
    /// Columns beyond `tracks` are blank.
    pub fn set_pattern_bytes(&mut self, index: usize, lines: usize, tracks: usize, bytes: &[u8]) -> bool {
        let Some(p) = self.patterns.get_mut(index) else {
            return false;
        };
        let lines = lines.clamp(1, MAX_LINES);
        let stored_tracks = tracks.min(MAX_TRACKS);
        let mut data = vec![Cell::BLANK; lines * MAX_TRACKS];
        for (i, chunk) in bytes.chunks_exact(EVENT_SIZE).enumerate() {
            let (line, track) = (i / tracks.max(1), i % tracks.max(1));
            if line >= lines {
                break;
            }
            if track < stored_tracks {
                let cell = Cell::from_bytes([chunk[0], chunk[1], chunk[2], chunk[3], chunk[4]]);
                data[line * MAX_TRACKS + track] = cell;
            }
        }
        p.lines = lines;
        p.data = Some(data);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(n: u8) -> Cell {
        Cell { note: n, instrument: 0, machine: 1, command: 0, parameter: 0 }
    }

    fn numbered(store: &mut PatternStore, index: usize, lines: usize) {
        store.create_new_pattern(index);
        store.alloc_new_pattern(index, "p", lines, false);
        let p = store.pattern_mut(index).unwrap();
        for l in 0..lines {
            *p.cell_mut(l, 0).unwrap() = note(l as u8);
        }
    }

    #[test]
    fn fresh_pattern_is_empty_until_written() {
        let mut store = PatternStore::new();
        assert!(store.is_pattern_empty(3));
        store.create_new_pattern(3);
        assert!(store.is_pattern_empty(3));
        *store.pattern_mut(3).unwrap().cell_mut(63, 15).unwrap() = note(60);
        assert!(!store.is_pattern_empty(3));
    }

    #[test]
    fn buffer_is_full_width() {
        let mut store = PatternStore::new();
        store.create_new_pattern(0);
        assert_eq!(store.pattern(0).unwrap().cells().unwrap().len(), 64 * MAX_TRACKS);
        store.alloc_new_pattern(0, "x", 100, true);
        assert_eq!(store.pattern(0).unwrap().cells().unwrap().len(), 100 * MAX_TRACKS);
    }

    #[test]
    fn resample_noop_leaves_buffer_unchanged() {
        let mut store = PatternStore::new();
        numbered(&mut store, 0, 16);
        let before = store.pattern(0).unwrap().cells().unwrap().to_vec();
        store.alloc_new_pattern(0, "same", 16, true);
        assert_eq!(store.pattern(0).unwrap().cells().unwrap(), &before[..]);
        assert_eq!(store.pattern(0).unwrap().name.as_str(), "same");
    }

    #[test]
    fn shrink_picks_scaled_lines() {
        let mut store = PatternStore::new();
        numbered(&mut store, 0, 16);
        store.alloc_new_pattern(0, "half", 8, true);
        let p = store.pattern(0).unwrap();
        assert_eq!(p.lines, 8);
        for l in 0..8 {
            assert_eq!(p.cell(l, 0).note, (l * 2) as u8);
        }
    }

    #[test]
    fn grow_spreads_lines_and_blanks_gaps() {
        let mut store = PatternStore::new();
        numbered(&mut store, 0, 8);
        store.alloc_new_pattern(0, "double", 16, true);
        let p = store.pattern(0).unwrap();
        assert_eq!(p.lines, 16);
        for l in 0..8 {
            assert_eq!(p.cell(l * 2, 0).note, l as u8);
            assert!(p.cell(l * 2 + 1, 0).is_blank());
        }
    }

    #[test]
    fn shrink_then_grow_keeps_line_zero() {
        let mut store = PatternStore::new();
        numbered(&mut store, 0, 12);
        store.alloc_new_pattern(0, "a", 5, true);
        store.alloc_new_pattern(0, "b", 12, true);
        assert_eq!(store.pattern(0).unwrap().cell(0, 0).note, 0);

        let mut again = PatternStore::new();
        numbered(&mut again, 0, 12);
        again.alloc_new_pattern(0, "a", 5, true);
        again.alloc_new_pattern(0, "b", 12, true);
        assert_eq!(again.pattern(0).unwrap().cells(), store.pattern(0).unwrap().cells());
    }

    #[test]
    fn pad_mode_appends_blank_lines() {
        let mut store = PatternStore::new();
        numbered(&mut store, 0, 4);
        store.alloc_new_pattern(0, "pad", 6, false);
        let p = store.pattern(0).unwrap();
        assert_eq!(p.cell(3, 0).note, 3);
        assert!(p.cell(4, 0).is_blank());
        assert!(p.cell(5, 0).is_blank());
    }

    #[test]
    fn insert_track_shifts_right() {
        let mut store = PatternStore::new();
        store.create_new_pattern(0);
        {
            let p = store.pattern_mut(0).unwrap();
            *p.cell_mut(2, 1).unwrap() = note(10);
            *p.cell_mut(2, 2).unwrap() = note(11);
        }
        store.insert_track(0, 1);
        let p = store.pattern(0).unwrap();
        assert!(p.cell(2, 1).is_blank());
        assert_eq!(p.cell(2, 2).note, 10);
        assert_eq!(p.cell(2, 3).note, 11);
    }

    #[test]
    fn shared_track_names_propagate() {
        let mut store = PatternStore::new();
        store.change_track_name(4, 2, "Kick");
        assert_eq!(store.track_name(0, 2), "Kick");
        assert_eq!(store.track_name(200, 2), "Kick");

        store.set_track_name_share_mode(false);
        store.change_track_name(4, 2, "Snare");
        assert_eq!(store.track_name(4, 2), "Snare");
        assert_eq!(store.track_name(0, 2), "Kick");

        store.copy_names_from(4, 9);
        assert_eq!(store.track_name(9, 2), "Snare");
    }

    #[test]
    fn pattern_bytes_round_trip_used_tracks() {
        let mut store = PatternStore::new();
        store.set_song_tracks(4);
        numbered(&mut store, 1, 8);
        let bytes = store.pattern_bytes(1, 4);
        assert_eq!(bytes.len(), 8 * 4 * EVENT_SIZE);

        let mut other = PatternStore::new();
        assert!(other.set_pattern_bytes(1, 8, 4, &bytes));
        assert_eq!(other.pattern(1).unwrap().cells(), store.pattern(1).unwrap().cells());
    }

    #[test]
    fn tweak_value_uses_command_as_high_byte() {
        let mut c = Cell::BLANK;
        c.set_tweak_value(0x1234);
        assert_eq!((c.command, c.parameter), (0x12, 0x34));
        assert_eq!(c.tweak_value(), 0x1234);
    }
}
