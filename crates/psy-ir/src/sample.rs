//! Waveform data and the extended (XM style) instrument bank.

use alloc::vec;
use alloc::vec::Vec;
use arrayvec::ArrayString;

/// Instruments and samples of the extended bank.
pub const MAX_XM_INSTRUMENTS: usize = 256;
/// Notes covered by an extended instrument's note map.
pub const NOTE_MAP_SIZE: usize = 120;

/// 16-bit waveform, mono or stereo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SampleData {
    Mono16(Vec<i16>),
    /// Left, right.
    Stereo16(Vec<i16>, Vec<i16>),
}

impl Default for SampleData {
    fn default() -> Self {
        SampleData::Mono16(Vec::new())
    }
}

impl SampleData {
    /// Silent buffer of `frames` frames.
    pub fn silent(frames: usize, stereo: bool) -> Self {
        if stereo {
            SampleData::Stereo16(vec![0; frames], vec![0; frames])
        } else {
            SampleData::Mono16(vec![0; frames])
        }
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        match self {
            SampleData::Mono16(v) => v.len(),
            SampleData::Stereo16(l, _) => l.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stereo(&self) -> bool {
        matches!(self, SampleData::Stereo16(..))
    }

    pub fn left(&self) -> &[i16] {
        match self {
            SampleData::Mono16(v) | SampleData::Stereo16(v, _) => v,
        }
    }

    pub fn right(&self) -> Option<&[i16]> {
        match self {
            SampleData::Mono16(_) => None,
            SampleData::Stereo16(_, r) => Some(r),
        }
    }
}

/// A sample of the extended bank.
#[derive(Clone, Debug, PartialEq)]
pub struct XmSample {
    pub name: ArrayString<32>,
    pub data: SampleData,
    pub loop_start: u32,
    pub loop_end: u32,
    /// 0 off, 1 forward, 2 ping-pong.
    pub loop_mode: u8,
    /// 0..=128
    pub default_volume: u8,
    /// -1.0 left .. 1.0 right
    pub panning: f32,
    pub tune: i16,
    pub fine_tune: i16,
}

impl Default for XmSample {
    fn default() -> Self {
        Self {
            name: ArrayString::new(),
            data: SampleData::default(),
            loop_start: 0,
            loop_end: 0,
            loop_mode: 0,
            default_volume: 128,
            panning: 0.0,
            tune: 0,
            fine_tune: 0,
        }
    }
}

/// An instrument of the extended bank.
#[derive(Clone, Debug, PartialEq)]
pub struct XmInstrument {
    pub enabled: bool,
    pub name: ArrayString<32>,
    pub global_volume: f32,
    /// Per note: (note to play, sample index).
    pub note_map: Vec<(u8, u8)>,
}

impl Default for XmInstrument {
    fn default() -> Self {
        Self {
            enabled: false,
            name: ArrayString::new(),
            global_volume: 1.0,
            note_map: (0..NOTE_MAP_SIZE as u8).map(|n| (n, 0)).collect(),
        }
    }
}

/// Extended instruments and their samples.
#[derive(Clone, Debug)]
pub struct ExtendedBank {
    pub instruments: Vec<XmInstrument>,
    pub samples: Vec<XmSample>,
}

impl Default for ExtendedBank {
    fn default() -> Self {
        Self {
            instruments: vec![XmInstrument::default(); MAX_XM_INSTRUMENTS],
            samples: vec![XmSample::default(); MAX_XM_INSTRUMENTS],
        }
    }
}

impl ExtendedBank {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn enabled_instruments(&self) -> usize {
        self.instruments.iter().filter(|i| i.enabled).count()
    }

    pub fn used_samples(&self) -> usize {
        self.samples.iter().filter(|s| !s.data.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_buffers_have_requested_shape() {
        let s = SampleData::silent(10, true);
        assert_eq!(s.len(), 10);
        assert!(s.is_stereo());
        assert_eq!(s.right().map(<[i16]>::len), Some(10));
        assert!(SampleData::default().is_empty());
    }

    #[test]
    fn new_bank_is_disabled() {
        let mut bank = ExtendedBank::default();
        assert_eq!(bank.enabled_instruments(), 0);
        bank.instruments[3].enabled = true;
        bank.samples[1].data = SampleData::silent(4, false);
        assert_eq!(bank.enabled_instruments(), 1);
        assert_eq!(bank.used_samples(), 1);
        bank.reset();
        assert_eq!(bank.enabled_instruments(), 0);
    }
}
