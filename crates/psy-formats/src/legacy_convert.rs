//! Mapping of the internal effects of old songs onto plugins.
//!
//! Early songs stored a handful of effects as built-in machine types with
//! their own numeric codes. Those types no longer exist; the converter
//! turns each of them into the equivalent native plugin, translating the
//! stored parameters, and afterwards rescales pattern tweaks aimed at the
//! converted machines.

use psy_ir::{MachineMode, MachineType, Song, NOTE_TWEAK};

use crate::FormatError;

/// Replacement chosen for a legacy machine.
#[derive(Clone, Debug, PartialEq)]
pub struct Redirect {
    pub kind: MachineType,
    pub plugin: Option<String>,
    pub mode: MachineMode,
    /// Parameters in the replacement's ranges.
    pub params: Vec<i32>,
    /// Bytes of the legacy payload that belonged to this machine.
    pub consumed: usize,
}

/// Hook for machine type codes the current model does not know.
pub trait LegacyConverter {
    fn exists(&self, code: i32) -> bool;

    /// Decode the type-specific tail of a legacy machine block. `payload`
    /// starts right after the common header and may run past the machine.
    fn redirect(&self, slot: usize, code: i32, payload: &[u8]) -> Result<Redirect, FormatError>;

    /// Fix pattern data after loading. `converted` lists the final slot and
    /// the legacy code of every redirected machine.
    fn retweak(&self, song: &mut Song, converted: &[(usize, i32)]);
}

struct Param {
    old_max: i32,
    new_max: i32,
}

const fn p(old_max: i32, new_max: i32) -> Param {
    Param { old_max, new_max }
}

struct Legacy {
    code: i32,
    plugin: &'static str,
    params: &'static [Param],
}

static LEGACY: &[Legacy] = &[
    Legacy { code: 1, plugin: "ring_modulator.dll", params: &[p(256, 1024), p(256, 1024), p(256, 1024), p(256, 1024)] },
    Legacy { code: 2, plugin: "distortion.dll", params: &[p(32768, 32768), p(32768, 32768), p(32768, 32768), p(32768, 32768)] },
    Legacy {
        code: 4,
        plugin: "delay.dll",
        params: &[p(44100, 2048), p(44100, 2048), p(256, 1024), p(256, 1024), p(256, 1024), p(256, 1024)],
    },
    Legacy {
        code: 5,
        plugin: "filter_2_poles.dll",
        params: &[p(256, 1024), p(256, 1024), p(256, 1024), p(256, 1024), p(256, 1024), p(4, 4)],
    },
    Legacy { code: 6, plugin: "gainer.dll", params: &[p(256, 1024)] },
    Legacy {
        code: 7,
        plugin: "flanger.dll",
        params: &[p(2048, 2048), p(256, 1024), p(256, 1024), p(256, 1024), p(256, 1024), p(256, 1024), p(256, 1024)],
    },
    Legacy { code: 11, plugin: "scope.dll", params: &[] },
];

fn lookup(code: i32) -> Option<&'static Legacy> {
    LEGACY.iter().find(|l| l.code == code)
}

fn rescale(value: i32, param: &Param) -> i32 {
    if param.old_max == param.new_max || param.old_max == 0 {
        return value.clamp(0, param.new_max);
    }
    let scaled = i64::from(value) * i64::from(param.new_max) / i64::from(param.old_max);
    scaled.clamp(0, i64::from(param.new_max)) as i32
}

/// Converter for the internal effects shipped with old versions.
#[derive(Clone, Copy, Debug, Default)]
pub struct InternalMachineConverter;

impl LegacyConverter for InternalMachineConverter {
    fn exists(&self, code: i32) -> bool {
        lookup(code).is_some()
    }

    fn redirect(&self, slot: usize, code: i32, payload: &[u8]) -> Result<Redirect, FormatError> {
        let legacy = lookup(code)
            .ok_or_else(|| FormatError::Corrupt(format!("machine {slot}: no conversion for type {code}")))?;
        let consumed = legacy.params.len() * 4;
        let raw = payload.get(..consumed).ok_or(FormatError::UnexpectedEof)?;
        let params = raw
            .chunks_exact(4)
            .zip(legacy.params)
            .map(|(b, param)| rescale(i32::from_le_bytes([b[0], b[1], b[2], b[3]]), param))
            .collect();
        log::debug!("[CONVERT] machine {slot}: legacy type {code} -> {}", legacy.plugin);
        Ok(Redirect {
            kind: MachineType::Plugin,
            plugin: Some(String::from(legacy.plugin)),
            mode: MachineMode::Effect,
            params,
            consumed,
        })
    }

    fn retweak(&self, song: &mut Song, converted: &[(usize, i32)]) {
        let tracks = song.song_tracks();
        let mut changed = 0usize;
        for index in 0..psy_ir::MAX_PATTERNS {
            let Some(pattern) = song.patterns.pattern_mut(index) else {
                continue;
            };
            if !pattern.is_allocated() {
                continue;
            }
            for line in 0..pattern.lines {
                for track in 0..tracks {
                    let Some(cell) = pattern.cell_mut(line, track) else {
                        continue;
                    };
                    if cell.note != NOTE_TWEAK {
                        continue;
                    }
                    let Some(legacy) = converted
                        .iter()
                        .find(|(slot, _)| *slot == usize::from(cell.machine))
                        .and_then(|&(_, code)| lookup(code))
                    else {
                        continue;
                    };
                    let Some(param) = legacy.params.get(usize::from(cell.instrument)) else {
                        continue;
                    };
                    let value = rescale(i32::from(cell.tweak_value()), param);
                    cell.set_tweak_value(value.clamp(0, i32::from(u16::MAX)) as u16);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            log::debug!("[CONVERT] rescaled {changed} tweaks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psy_ir::Cell;

    fn payload(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn known_codes() {
        let c = InternalMachineConverter;
        for code in [1, 2, 4, 5, 6, 7, 11] {
            assert!(c.exists(code), "code {code}");
        }
        assert!(!c.exists(3));
        assert!(!c.exists(255));
    }

    #[test]
    fn gainer_redirects_to_plugin_with_scaled_gain() {
        let mut data = payload(&[128]);
        data.extend_from_slice(&[0xAA; 8]);
        let r = InternalMachineConverter.redirect(9, 6, &data).unwrap();
        assert_eq!(r.kind, MachineType::Plugin);
        assert_eq!(r.plugin.as_deref(), Some("gainer.dll"));
        assert_eq!(r.params, vec![512]);
        assert_eq!(r.consumed, 4);
    }

    #[test]
    fn short_payload_is_an_error() {
        let err = InternalMachineConverter.redirect(1, 4, &payload(&[1, 2])).unwrap_err();
        assert!(matches!(err, FormatError::UnexpectedEof));
    }

    #[test]
    fn retweak_touches_only_converted_machines() {
        let mut song = Song::new();
        let mut tweak = Cell { note: NOTE_TWEAK, instrument: 0, machine: 3, command: 0, parameter: 0 };
        tweak.set_tweak_value(64);
        let other = Cell { machine: 4, ..tweak };
        let p = song.patterns.pattern_mut(0).unwrap();
        *p.cell_mut(0, 0).unwrap() = tweak;
        *p.cell_mut(1, 0).unwrap() = other;

        InternalMachineConverter.retweak(&mut song, &[(3, 6)]);
        let p = song.patterns.pattern(0).unwrap();
        assert_eq!(p.cell(0, 0).tweak_value(), 256);
        assert_eq!(p.cell(1, 0).tweak_value(), 64);
    }
}
