//! The song aggregate: global settings plus the graph, pattern, sequence and
//! instrument stores.

use alloc::string::String;

use crate::edit::Edit;
use crate::graph::{GraphError, MachineGraph};
use crate::instrument::InstrumentStore;
use crate::machine::{MachineFactory, MachineType};
use crate::pattern::{PatternStore, MAX_PATTERNS, MAX_TRACKS};
use crate::sequence::SequenceStore;

pub const DEFAULT_BPM: f32 = 125.0;
pub const DEFAULT_LINES_PER_BEAT: u32 = 4;
pub const DEFAULT_OCTAVE: u8 = 4;
/// Where `new_song` places the master.
pub const MASTER_POSITION: (i32, i32) = (320, 200);

/// A complete song.
pub struct Song {
    pub name: String,
    pub author: String,
    pub comments: String,
    /// Beats per minute, two decimals significant.
    pub bpm: f32,
    pub lines_per_beat: u32,
    /// Octave used by the note entry keys.
    pub octave: u8,
    pub track_soloed: Option<usize>,

    // Editor selection
    pub seq_bus: usize,
    pub param_selected: usize,
    pub aux_col_selected: usize,
    pub inst_selected: usize,

    track_muted: [bool; MAX_TRACKS],
    track_armed: [bool; MAX_TRACKS],
    armed_count: usize,

    pub file_name: String,
    /// Cleared by every load or new; set by the caller after a save.
    pub saved: bool,

    pub graph: MachineGraph,
    pub patterns: PatternStore,
    pub sequence: SequenceStore,
    pub instruments: InstrumentStore,
}

impl Default for Song {
    fn default() -> Self {
        Self::new()
    }
}

impl Song {
    /// Empty song without machines. Pattern 0 is allocated.
    pub fn new() -> Self {
        let mut song = Self {
            name: String::from("Untitled"),
            author: String::from("Unnamed"),
            comments: String::new(),
            bpm: DEFAULT_BPM,
            lines_per_beat: DEFAULT_LINES_PER_BEAT,
            octave: DEFAULT_OCTAVE,
            track_soloed: None,
            seq_bus: 0,
            param_selected: 0,
            aux_col_selected: 0,
            inst_selected: 0,
            track_muted: [false; MAX_TRACKS],
            track_armed: [false; MAX_TRACKS],
            armed_count: 0,
            file_name: String::from("Untitled.psy"),
            saved: false,
            graph: MachineGraph::new(),
            patterns: PatternStore::new(),
            sequence: SequenceStore::new(),
            instruments: InstrumentStore::new(),
        };
        song.patterns.create_new_pattern(0);
        song
    }

    /// Start a new song: defaults everywhere, every store cleared, and a
    /// master machine at [`MASTER_POSITION`].
    pub fn new_song(&mut self, factory: &dyn MachineFactory) -> Result<(), GraphError> {
        self.name = String::from("Untitled");
        self.author = String::from("Unnamed");
        self.comments.clear();
        self.octave = DEFAULT_OCTAVE;
        self.bpm = DEFAULT_BPM;
        self.lines_per_beat = DEFAULT_LINES_PER_BEAT;
        self.graph.destroy_all();
        self.instruments.delete_all();
        self.patterns.delete_all_patterns();
        self.reset();
        self.patterns.create_new_pattern(0);
        self.patterns.set_track_name_share_mode(true);
        self.seq_bus = 0;
        self.inst_selected = 0;
        self.param_selected = 0;
        self.aux_col_selected = 0;
        self.saved = false;
        self.file_name = String::from("Untitled.psy");
        let (x, y) = MASTER_POSITION;
        self.graph.create_machine(factory, MachineType::Master, x, y, None, None, 0)?;
        log::debug!("[SONG] new song");
        Ok(())
    }

    /// Drop machines and waveforms, reset pattern names and lengths,
    /// the play order and all track state. Pattern data is kept.
    pub fn reset(&mut self) {
        self.graph.destroy_all();
        for i in 0..crate::instrument::MAX_INSTRUMENTS {
            self.instruments.delete_layer(i);
        }
        self.instruments.extended.reset();
        self.patterns.reset();
        self.track_muted = [false; MAX_TRACKS];
        self.track_armed = [false; MAX_TRACKS];
        self.armed_count = 0;
        self.track_soloed = None;
        self.sequence.reset();
    }

    // -----------------------------------------------------------------------
    // Tracks
    // -----------------------------------------------------------------------

    pub fn song_tracks(&self) -> usize {
        self.patterns.song_tracks()
    }

    pub fn is_track_muted(&self, track: usize) -> bool {
        self.track_muted.get(track).copied().unwrap_or(false)
    }

    pub fn set_track_muted(&mut self, track: usize, muted: bool) {
        if let Some(m) = self.track_muted.get_mut(track) {
            *m = muted;
        }
    }

    pub fn is_track_armed(&self, track: usize) -> bool {
        self.track_armed.get(track).copied().unwrap_or(false)
    }

    /// Arm or disarm a track, keeping the armed count in step.
    pub fn set_track_armed(&mut self, track: usize, armed: bool) {
        let Some(a) = self.track_armed.get_mut(track) else {
            return;
        };
        match (*a, armed) {
            (false, true) => self.armed_count += 1,
            (true, false) => self.armed_count -= 1,
            _ => {}
        }
        *a = armed;
    }

    pub fn toggle_track_armed(&mut self, track: usize) {
        let armed = self.is_track_armed(track);
        self.set_track_armed(track, !armed);
    }

    pub fn armed_count(&self) -> usize {
        self.armed_count
    }

    /// Insert a blank track at `track` in one pattern, or in every pattern
    /// up to the last used one when `pattern` is `None`.
    pub fn add_new_track(&mut self, pattern: Option<usize>, track: usize) {
        let (first, last) = match pattern {
            Some(p) => (p, p),
            None => {
                let last = (0..MAX_PATTERNS).rev().find(|&i| self.is_pattern_used(i)).unwrap_or(0);
                (0, last)
            }
        };
        let tracks = self.patterns.song_tracks();
        if tracks < MAX_TRACKS {
            self.patterns.set_song_tracks(tracks + 1);
        }
        for p in first..=last.min(MAX_PATTERNS - 1) {
            self.patterns.insert_track(p, track);
        }
    }

    // -----------------------------------------------------------------------
    // Pattern queries
    // -----------------------------------------------------------------------

    /// Allocated, and either in the play order or holding events.
    pub fn is_pattern_used(&self, index: usize) -> bool {
        let allocated = self.patterns.pattern(index).is_some_and(|p| p.is_allocated());
        allocated && (self.sequence.contains(index) || !self.patterns.is_pattern_empty(index))
    }

    /// Index of a pattern that can be handed out as new.
    ///
    /// Prefers any unused index. Otherwise searches upward from `start` for
    /// a pattern outside the play order whose content is blank. Falls back
    /// to the lowest index missing from the play order.
    pub fn get_blank_pattern_unused(&self, start: usize) -> usize {
        if let Some(i) = (0..MAX_PATTERNS).find(|&i| !self.is_pattern_used(i)) {
            return i;
        }
        let last = MAX_PATTERNS - 1;
        let mut candidate = start;
        let mut again = true;
        while again && candidate < last {
            while self.sequence.contains(candidate) {
                candidate += 1;
            }
            again = candidate < last && !self.patterns.is_pattern_empty(candidate);
            if again {
                candidate += 1;
            }
        }
        if candidate > last {
            candidate = (0..MAX_PATTERNS).find(|&i| !self.sequence.contains(i)).unwrap_or(last);
        }
        candidate.min(last)
    }

    pub fn highest_pattern_index_in_sequence(&self) -> usize {
        self.sequence.highest_pattern_index()
    }

    // -----------------------------------------------------------------------
    // Instruments and edits
    // -----------------------------------------------------------------------

    pub fn exchange_instruments(&mut self, a: usize, b: usize) -> bool {
        self.instruments.exchange(a, b)
    }

    /// Apply one editor change. Returns `false` if it addressed nothing.
    pub fn apply_edit(&mut self, edit: Edit) -> bool {
        match edit {
            Edit::SetCell { pattern, line, track, cell } => {
                let Some(p) = self.patterns.pattern_mut(pattern as usize) else {
                    return false;
                };
                match p.cell_mut(line as usize, track as usize) {
                    Some(c) => {
                        *c = cell;
                        true
                    }
                    None => false,
                }
            }
            Edit::SetTrackName { pattern, track, name } => {
                if track as usize >= MAX_TRACKS {
                    return false;
                }
                self.patterns.change_track_name(pattern as usize, track as usize, &name);
                true
            }
            Edit::SetSequence { position, pattern } => {
                self.sequence.set_pattern_at(position as usize, pattern as usize)
            }
            Edit::SetTrackMuted { track, muted } => {
                self.set_track_muted(track as usize, muted);
                (track as usize) < MAX_TRACKS
            }
            Edit::SetTrackArmed { track, armed } => {
                self.set_track_armed(track as usize, armed);
                (track as usize) < MAX_TRACKS
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MASTER_INDEX;
    use crate::machines::BuiltinFactory;
    use crate::pattern::{Cell, DEFAULT_PATTERN_LINES};

    fn note_cell(note: u8) -> Cell {
        Cell { note, instrument: 0, machine: 1, command: 0, parameter: 0 }
    }

    #[test]
    fn new_song_creates_master() {
        let mut song = Song::new();
        song.name = String::from("old");
        song.set_track_armed(3, true);
        song.new_song(&BuiltinFactory::new()).unwrap();
        let master = song.graph.machine(MASTER_INDEX).unwrap();
        assert_eq!(master.kind, MachineType::Master);
        assert_eq!((master.x, master.y), MASTER_POSITION);
        assert_eq!(song.name, "Untitled");
        assert_eq!(song.armed_count(), 0);
        assert_eq!(song.sequence.play_length(), 1);
    }

    #[test]
    fn armed_count_follows_flags() {
        let mut song = Song::new();
        song.set_track_armed(1, true);
        song.set_track_armed(1, true);
        song.toggle_track_armed(2);
        assert_eq!(song.armed_count(), 2);
        song.toggle_track_armed(1);
        assert_eq!(song.armed_count(), 1);
        song.set_track_armed(MAX_TRACKS, true);
        assert_eq!(song.armed_count(), 1);
    }

    #[test]
    fn pattern_use_needs_allocation() {
        let mut song = Song::new();
        assert!(song.is_pattern_used(0));
        assert!(!song.is_pattern_used(5));
        assert!(song.apply_edit(Edit::SetCell { pattern: 5, line: 2, track: 0, cell: note_cell(48) }));
        assert!(song.is_pattern_used(5));
        song.patterns.create_new_pattern(6);
        assert!(!song.is_pattern_used(6));
        song.sequence.insert(1, 6);
        assert!(song.is_pattern_used(6));
    }

    #[test]
    fn blank_pattern_search_skips_used() {
        let mut song = Song::new();
        song.apply_edit(Edit::SetCell { pattern: 1, line: 0, track: 0, cell: note_cell(60) });
        assert_eq!(song.get_blank_pattern_unused(0), 2);
    }

    #[test]
    fn blank_pattern_search_when_everything_is_used() {
        let mut song = Song::new();
        for i in 0..MAX_PATTERNS {
            song.apply_edit(Edit::SetCell { pattern: i as u8, line: 0, track: 0, cell: note_cell(60) });
        }
        assert_eq!(song.get_blank_pattern_unused(0), MAX_PATTERNS - 1);
        // blank but referenced by the play order, so still used
        song.patterns.create_new_pattern(9);
        song.sequence.insert(1, 9);
        assert_eq!(song.get_blank_pattern_unused(5), MAX_PATTERNS - 1);
        song.sequence.remove(1);
        assert_eq!(song.get_blank_pattern_unused(5), 9);
    }

    #[test]
    fn add_new_track_shifts_cells_right() {
        let mut song = Song::new();
        song.apply_edit(Edit::SetCell { pattern: 0, line: 0, track: 2, cell: note_cell(50) });
        song.add_new_track(None, 1);
        assert_eq!(song.song_tracks(), 17);
        let p = song.patterns.pattern(0).unwrap();
        assert!(p.cell(0, 1).is_blank());
        assert_eq!(p.cell(0, 3).note, 50);
    }

    #[test]
    fn edits_outside_bounds_are_rejected() {
        let mut song = Song::new();
        assert!(!song.apply_edit(Edit::SetCell { pattern: 0, line: 999, track: 0, cell: note_cell(1) }));
        assert!(!song.apply_edit(Edit::SetSequence { position: 4, pattern: 1 }));
        assert!(song.apply_edit(Edit::SetSequence { position: 0, pattern: 3 }));
        assert_eq!(song.sequence.pattern_at(0), Some(3));
        assert!(song.apply_edit(Edit::SetTrackName { pattern: 0, track: 4, name: String::from("bass") }));
        assert_eq!(song.patterns.track_name(7, 4), "bass");
    }

    #[test]
    fn reset_keeps_pattern_data() {
        let mut song = Song::new();
        song.new_song(&BuiltinFactory::new()).unwrap();
        song.apply_edit(Edit::SetCell { pattern: 0, line: 0, track: 0, cell: note_cell(1) });
        song.patterns.alloc_new_pattern(1, "long", 128, false);
        song.apply_edit(Edit::SetCell { pattern: 1, line: 100, track: 0, cell: note_cell(2) });
        song.instruments.wav_alloc(0, false, 16, "x");
        song.reset();
        assert_eq!(song.graph.machine_count(), 0);
        assert!(song.instruments.is_empty(0));
        assert!(!song.patterns.is_pattern_empty(0));

        // the long pattern is cut back to the default length, its tail survives
        assert_eq!(song.patterns.lines(1), DEFAULT_PATTERN_LINES);
        assert_eq!(song.patterns.pattern(1).unwrap().cells().unwrap().len(), 128 * MAX_TRACKS);
        song.patterns.alloc_new_pattern(1, "long", 128, false);
        assert_eq!(song.patterns.pattern(1).unwrap().cell(100, 0).note, 2);
    }
}
