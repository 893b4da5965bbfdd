//! Sampler instruments: one waveform layer plus playback parameters.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use arrayvec::ArrayString;

use crate::sample::{ExtendedBank, SampleData};

pub const MAX_INSTRUMENTS: usize = 256;

/// What happens to a playing note when a new one arrives on its track.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NewNoteAction {
    #[default]
    Cut,
    Release,
    None,
}

impl NewNoteAction {
    pub fn code(self) -> u8 {
        match self {
            NewNoteAction::Cut => 0,
            NewNoteAction::Release => 1,
            NewNoteAction::None => 2,
        }
    }

    /// Unknown codes fall back to `Cut`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => NewNoteAction::Release,
            2 => NewNoteAction::None,
            _ => NewNoteAction::Cut,
        }
    }
}

/// Amplitude envelope, times in samples, sustain in percent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Adsr {
    pub attack: i32,
    pub decay: i32,
    pub sustain: i32,
    pub release: i32,
}

impl Default for Adsr {
    fn default() -> Self {
        Self { attack: 1, decay: 1, sustain: 100, release: 220 }
    }
}

/// Filter envelope and filter settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterEnvelope {
    pub attack: i32,
    pub decay: i32,
    pub sustain: i32,
    pub release: i32,
    pub cutoff: i32,
    pub resonance: i32,
    pub amount: i32,
    /// Filter type; 4 disables the filter.
    pub filter_type: i32,
}

impl Default for FilterEnvelope {
    fn default() -> Self {
        Self {
            attack: 1,
            decay: 16384,
            sustain: 100,
            release: 16384,
            cutoff: 91,
            resonance: 11,
            amount: 0,
            filter_type: 4,
        }
    }
}

/// A sampler instrument slot.
#[derive(Clone, Debug, PartialEq)]
pub struct Instrument {
    pub name: ArrayString<32>,
    /// When set, the sample length follows `lines`.
    pub looped: bool,
    pub lines: i32,
    pub nna: NewNoteAction,
    pub amp_env: Adsr,
    pub filter_env: FilterEnvelope,
    /// 0..=128, 64 is centre.
    pub pan: i32,
    pub random_pan: bool,
    pub random_cutoff: bool,
    pub random_resonance: bool,

    // Wave layer
    pub wave_name: ArrayString<32>,
    pub wave: SampleData,
    pub wave_volume: i32,
    pub wave_finetune: i32,
    pub wave_tune: i32,
    pub wave_loop_start: u32,
    pub wave_loop_end: u32,
    pub wave_looped: bool,
}

impl Default for Instrument {
    fn default() -> Self {
        let mut inst = Self {
            name: ArrayString::new(),
            looped: false,
            lines: 16,
            nna: NewNoteAction::Cut,
            amp_env: Adsr::default(),
            filter_env: FilterEnvelope::default(),
            pan: 64,
            random_pan: false,
            random_cutoff: false,
            random_resonance: false,
            wave_name: ArrayString::new(),
            wave: SampleData::default(),
            wave_volume: 100,
            wave_finetune: 0,
            wave_tune: 0,
            wave_loop_start: 0,
            wave_loop_end: 0,
            wave_looped: false,
        };
        let _ = inst.name.try_push_str("empty");
        let _ = inst.wave_name.try_push_str("empty");
        inst
    }
}

impl Instrument {
    /// No waveform loaded.
    pub fn is_empty(&self) -> bool {
        self.wave.is_empty()
    }

    pub fn wave_len(&self) -> usize {
        self.wave.len()
    }

    /// Drop the waveform and its layer settings. Instrument parameters stay.
    pub fn delete_layer(&mut self) {
        let fresh = Self::default();
        self.wave_name = fresh.wave_name;
        self.wave = fresh.wave;
        self.wave_volume = fresh.wave_volume;
        self.wave_finetune = fresh.wave_finetune;
        self.wave_tune = fresh.wave_tune;
        self.wave_loop_start = 0;
        self.wave_loop_end = 0;
        self.wave_looped = false;
    }

    /// Back to defaults.
    pub fn delete(&mut self) {
        *self = Self::default();
    }
}

/// A decoded sample file.
#[derive(Clone, Debug)]
pub struct ImportedWave {
    pub name: String,
    pub data: SampleData,
    /// Loop start and end, if the file defines a loop.
    pub loop_range: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportError {
    #[error("unsupported sample file format")]
    Unsupported,
    #[error("malformed sample file: {0}")]
    Malformed(String),
    #[error("sample has no frames")]
    Empty,
}

/// Decoder for external sample files (WAV, IFF, ...).
pub trait WaveformImporter {
    fn import(&self, data: &[u8]) -> Result<ImportedWave, ImportError>;
}

/// All instrument slots plus the extended bank.
#[derive(Clone, Debug)]
pub struct InstrumentStore {
    slots: Vec<Instrument>,
    pub extended: ExtendedBank,
}

impl Default for InstrumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentStore {
    pub fn new() -> Self {
        Self {
            slots: vec![Instrument::default(); MAX_INSTRUMENTS],
            extended: ExtendedBank::default(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Instrument> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Instrument> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Instrument)> {
        self.slots.iter().enumerate()
    }

    pub fn is_empty(&self, index: usize) -> bool {
        self.slots.get(index).map_or(true, Instrument::is_empty)
    }

    /// Allocate a silent waveform of `frames` frames, replacing the old layer.
    /// Sets both the wave name and the instrument name.
    pub fn wav_alloc(&mut self, index: usize, stereo: bool, frames: usize, name: &str) -> bool {
        let Some(inst) = self.slots.get_mut(index) else {
            return false;
        };
        if frames >= 1 << 30 {
            return false;
        }
        inst.delete_layer();
        inst.wave = SampleData::silent(frames, stereo);
        inst.wave_name = crate::fixed_name(name);
        inst.name = crate::fixed_name(name);
        true
    }

    /// Decode `data` with `importer` into slot `index`.
    pub fn import(
        &mut self,
        index: usize,
        importer: &dyn WaveformImporter,
        data: &[u8],
    ) -> Result<(), ImportError> {
        let wave = importer.import(data)?;
        if wave.data.is_empty() {
            return Err(ImportError::Empty);
        }
        let Some(inst) = self.slots.get_mut(index) else {
            return Err(ImportError::Malformed(alloc::format!("slot {index} out of range")));
        };
        inst.delete_layer();
        inst.wave_name = crate::fixed_name(&wave.name);
        inst.name = crate::fixed_name(&wave.name);
        if let Some((start, end)) = wave.loop_range {
            let len = wave.data.len() as u32;
            inst.wave_loop_start = start.min(len);
            inst.wave_loop_end = end.min(len);
            inst.wave_looped = start < end;
        }
        inst.wave = wave.data;
        log::debug!("[INST] imported {} frames into slot {index}", inst.wave_len());
        Ok(())
    }

    pub fn delete(&mut self, index: usize) {
        if let Some(inst) = self.slots.get_mut(index) {
            inst.delete();
        }
    }

    pub fn delete_layer(&mut self, index: usize) {
        if let Some(inst) = self.slots.get_mut(index) {
            inst.delete_layer();
        }
    }

    pub fn delete_all(&mut self) {
        self.slots.iter_mut().for_each(Instrument::delete);
        self.extended.reset();
    }

    pub fn exchange(&mut self, a: usize, b: usize) -> bool {
        if a >= MAX_INSTRUMENTS || b >= MAX_INSTRUMENTS {
            return false;
        }
        self.slots.swap(a, b);
        true
    }

    /// Copy an occupied slot into an empty one. The arguments may be given
    /// in either order.
    pub fn clone_instrument(&mut self, src: usize, dst: usize) -> bool {
        if src >= MAX_INSTRUMENTS || dst >= MAX_INSTRUMENTS || src == dst {
            return false;
        }
        let (src, dst) = if self.slots[dst].is_empty() { (src, dst) } else { (dst, src) };
        if self.slots[src].is_empty() || !self.slots[dst].is_empty() {
            return false;
        }
        self.slots[dst] = self.slots[src].clone();
        true
    }

    /// Highest non-empty slot, or `None` for an empty bank.
    pub fn highest_index(&self) -> Option<usize> {
        self.slots.iter().rposition(|i| !i.is_empty())
    }

    pub fn num_used(&self) -> usize {
        self.slots.iter().filter(|i| !i.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeWav;

    impl WaveformImporter for FakeWav {
        fn import(&self, data: &[u8]) -> Result<ImportedWave, ImportError> {
            if data.len() % 2 != 0 {
                return Err(ImportError::Malformed("odd length".into()));
            }
            let frames = data.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
            Ok(ImportedWave {
                name: "kick.wav".into(),
                data: SampleData::Mono16(frames),
                loop_range: Some((1, 100)),
            })
        }
    }

    #[test]
    fn defaults_match_factory_values() {
        let inst = Instrument::default();
        assert!(inst.is_empty());
        assert_eq!(inst.name.as_str(), "empty");
        assert_eq!(inst.amp_env, Adsr { attack: 1, decay: 1, sustain: 100, release: 220 });
        assert_eq!(inst.filter_env.cutoff, 91);
        assert_eq!(inst.filter_env.filter_type, 4);
        assert_eq!(inst.pan, 64);
    }

    #[test]
    fn wav_alloc_replaces_layer() {
        let mut store = InstrumentStore::new();
        assert!(store.wav_alloc(3, true, 100, "pad"));
        assert_eq!(store.get(3).map(Instrument::wave_len), Some(100));
        assert!(store.get(3).is_some_and(|i| i.wave.is_stereo()));
        assert!(store.wav_alloc(3, false, 10, "short"));
        let inst = store.get(3).unwrap();
        assert_eq!(inst.wave_len(), 10);
        assert!(!inst.wave.is_stereo());
        assert_eq!(inst.name.as_str(), "short");
        assert!(!store.wav_alloc(MAX_INSTRUMENTS, false, 1, "x"));
    }

    #[test]
    fn import_clamps_loop() {
        let mut store = InstrumentStore::new();
        store.import(0, &FakeWav, &[1, 0, 2, 0, 3, 0]).unwrap();
        let inst = store.get(0).unwrap();
        assert_eq!(inst.wave.left(), &[1, 2, 3]);
        assert_eq!((inst.wave_loop_start, inst.wave_loop_end), (1, 3));
        assert!(inst.wave_looped);
        assert_eq!(store.import(1, &FakeWav, &[]).unwrap_err(), ImportError::Empty);
        assert!(store.is_empty(1));
    }

    #[test]
    fn delete_layer_keeps_envelope() {
        let mut store = InstrumentStore::new();
        store.wav_alloc(2, false, 8, "x");
        store.get_mut(2).unwrap().amp_env.release = 5;
        store.delete_layer(2);
        assert!(store.is_empty(2));
        assert_eq!(store.get(2).unwrap().amp_env.release, 5);
        store.delete(2);
        assert_eq!(store.get(2).unwrap().amp_env.release, 220);
    }

    #[test]
    fn clone_accepts_reversed_arguments() {
        let mut store = InstrumentStore::new();
        store.wav_alloc(5, false, 4, "snare");
        assert!(store.clone_instrument(9, 5));
        assert_eq!(store.get(9).unwrap().name.as_str(), "snare");
        // both occupied now
        assert!(!store.clone_instrument(5, 9));
        // both empty
        assert!(!store.clone_instrument(0, 1));
    }

    #[test]
    fn counts_and_highest_index() {
        let mut store = InstrumentStore::new();
        assert_eq!(store.highest_index(), None);
        store.wav_alloc(1, false, 4, "a");
        store.wav_alloc(40, false, 4, "b");
        assert_eq!(store.highest_index(), Some(40));
        assert_eq!(store.num_used(), 2);
        assert!(store.exchange(40, 41));
        assert_eq!(store.highest_index(), Some(41));
        store.delete_all();
        assert_eq!(store.num_used(), 0);
    }
}
