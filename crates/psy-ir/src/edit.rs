//! Edit commands applied to a song by [`Song::apply_edit`](crate::Song::apply_edit).

use alloc::string::String;

use crate::pattern::Cell;

/// A single editor change to song data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Edit {
    /// Set a single cell in a pattern.
    SetCell {
        pattern: u8,
        line: u16,
        track: u8,
        cell: Cell,
    },
    /// Rename a track. Follows the song's name sharing mode.
    SetTrackName {
        pattern: u8,
        track: u8,
        name: String,
    },
    /// Point a song position at another pattern.
    SetSequence { position: u16, pattern: u8 },
    SetTrackMuted { track: u8, muted: bool },
    SetTrackArmed { track: u8, armed: bool },
}
