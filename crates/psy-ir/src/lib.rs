//! Core song model for the psycore music host.
//!
//! This crate defines the in-memory project model: the machine graph,
//! patterns and their play order, instruments, and the `Song` aggregate
//! that ties them together. The file format crates populate these types
//! and the controller mutates them.
//!
//! Designed to be `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod edit;
mod graph;
mod instrument;
mod machine;
pub mod machines;
mod pattern;
mod sample;
mod sequence;
pub mod song;
mod topology;

pub use edit::Edit;
pub use graph::{
    GraphError, InputHalfEdge, MachineGraph, OutputHalfEdge, Port, PortKind, Wire, WireKey,
    WireTable, MASTER_INDEX, MAX_BUSES, MAX_CONNECTIONS, MAX_MACHINES,
};
pub use instrument::{
    Adsr, FilterEnvelope, ImportError, ImportedWave, Instrument, InstrumentStore,
    NewNoteAction, WaveformImporter, MAX_INSTRUMENTS,
};
pub use machine::{
    FactoryError, Machine, MachineBehavior, MachineFactory, MachineInfo, MachineMode,
    MachineType, ParamInfo, NATIVE_AUDIO_RANGE,
};
pub use pattern::{
    Cell, Pattern, PatternStore, DEFAULT_PATTERN_LINES, DEFAULT_SONG_TRACKS, EVENT_SIZE,
    MAX_LINES, MAX_PATTERNS, MAX_TRACKS, MULTIPLY, NOTE_EMPTY, NOTE_OFF, NOTE_TWEAK,
};
pub use sample::{ExtendedBank, SampleData, XmInstrument, XmSample, MAX_XM_INSTRUMENTS};
pub use sequence::{SeqEntry, SequenceStore, MAX_SEQUENCES, MAX_SONG_POSITIONS};
pub use song::Song;
pub use topology::ReconcileReport;

/// Copy `s` into a fixed-capacity name, dropping whatever does not fit.
pub fn fixed_name<const N: usize>(s: &str) -> arrayvec::ArrayString<N> {
    let mut name = arrayvec::ArrayString::new();
    for ch in s.chars() {
        if name.try_push(ch).is_err() {
            break;
        }
    }
    name
}
