//! Legacy PSY2 loader.
//!
//! PSY2 is one monolithic little-endian record: header, patterns,
//! instrument tables stored column by column, waves, a cache of VST
//! parameters, then 128 raw machine slots and a few optional patches that
//! later versions appended. Machines were addressed through two bus tables
//! (generators and effects) instead of a flat array, so the slots are
//! remapped onto the current layout after reading.

use std::io::Cursor;

use binrw::BinRead;
use psy_ir::{
    Adsr, FilterEnvelope, InputHalfEdge, Machine, MachineMode, MachineType, NewNoteAction,
    OutputHalfEdge, Song, WireTable, DEFAULT_PATTERN_LINES, EVENT_SIZE, MASTER_INDEX, MAX_BUSES,
    MAX_CONNECTIONS, MAX_LINES, MAX_PATTERNS, MAX_TRACKS,
};

use crate::psy3_format::synthesize_master;
use crate::reader::{fixed_str, PsyReader};
use crate::records::{create_or_dummy, read_wave};
use crate::writer::PsyWriter;
use crate::{FormatError, LoadEnv, LoadReport, SongFormat};

pub const PSY2_MAGIC: &[u8; 8] = b"PSY2SONG";

const OLD_MAX_TRACKS: usize = 32;
const OLD_MAX_INSTRUMENTS: usize = 255;
const OLD_MAX_WAVES: usize = 16;
const OLD_MAX_PLUGINS: usize = 256;
const OLD_MAX_MACHINES: usize = 128;
const OLD_MAX_POSITIONS: usize = 128;
const NO_BUS: u8 = 255;

/// First final slot of the generator range; effects follow the generators.
const FIRST_GENERATOR: usize = 1;
const FIRST_EFFECT: usize = FIRST_GENERATOR + MAX_BUSES;

// ---------------------------------------------------------------------------
// Fixed layout records
// ---------------------------------------------------------------------------

#[derive(BinRead)]
#[br(little)]
struct SongHeader {
    name: [u8; 32],
    author: [u8; 32],
    comments: [u8; 128],
    bpm: i32,
    sample_rate: i32,
    octave: u8,
    bus_machine: [u8; MAX_BUSES],
    play_order: [u8; OLD_MAX_POSITIONS],
    play_length: i32,
    tracks: i32,
}

#[derive(BinRead)]
#[br(little)]
struct PatternHeader {
    lines: i32,
    name: [u8; 32],
}

#[derive(BinRead)]
#[br(little)]
struct InstrumentTables {
    selected: i32,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    names: Vec<[u8; 32]>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    nna: Vec<u8>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    env_attack: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    env_decay: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    env_sustain: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    env_release: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    filter_attack: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    filter_decay: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    filter_sustain: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    filter_release: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    filter_cutoff: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    filter_resonance: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    filter_amount: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    filter_type: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    pan: Vec<i32>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    random_pan: Vec<u8>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    random_cutoff: Vec<u8>,
    #[br(count = OLD_MAX_INSTRUMENTS)]
    random_resonance: Vec<u8>,
}

#[derive(BinRead)]
#[br(little)]
struct WaveHeader {
    name: [u8; 32],
    volume: i32,
    finetune: i16,
    loop_start: u32,
    loop_end: u32,
    loop_type: u8,
    stereo: u8,
}

#[derive(BinRead)]
#[br(little)]
struct VstCacheEntry {
    valid: u8,
    #[br(if(valid != 0))]
    body: Option<VstParams>,
}

#[derive(BinRead)]
#[br(little)]
struct VstParams {
    dll: [u8; 128],
    #[br(assert((0..=65536).contains(&num_params), "bad VST parameter count {}", num_params))]
    num_params: i32,
    #[br(count = num_params as usize)]
    params: Vec<f32>,
}

/// Part shared by every raw machine slot.
#[derive(BinRead)]
#[br(little)]
struct NodeHeader {
    x: i32,
    y: i32,
    type_code: i32,
    edit_name: [u8; 16],
    input_machines: [i32; MAX_CONNECTIONS],
    output_machines: [i32; MAX_CONNECTIONS],
    /// Volumes of the *outputs*, despite the name.
    input_con_vol: [f32; MAX_CONNECTIONS],
    connection: [u8; MAX_CONNECTIONS],
    input_con: [u8; MAX_CONNECTIONS],
    _num_inputs: i32,
    _num_outputs: i32,
    panning: i32,
}

#[derive(BinRead)]
#[br(little)]
struct PluginTail {
    dll: [u8; 256],
    #[br(assert((0..=65536).contains(&num_params), "bad plugin parameter count {}", num_params))]
    num_params: i32,
    #[br(count = num_params as usize)]
    params: Vec<i32>,
}

#[derive(BinRead)]
#[br(little)]
struct VstTail {
    _program: u8,
    instance: i32,
}

fn read_struct<T>(r: &mut PsyReader<'_>) -> Result<T, FormatError>
where
    T: for<'b> BinRead<Args<'b> = ()>,
{
    let mut cursor = Cursor::new(r.rest());
    let value = T::read_le(&mut cursor).map_err(|e| {
        if e.is_eof() {
            FormatError::UnexpectedEof
        } else {
            FormatError::Binary(e)
        }
    })?;
    r.skip(cursor.position() as usize)?;
    Ok(value)
}

/// Parameter list in the layout hosted machines restore from.
fn params_state(params: &[i32]) -> Vec<u8> {
    let mut w = PsyWriter::new();
    w.write_u32_le(params.len() as u32);
    for &v in params {
        w.write_i32_le(v);
    }
    w.into_inner()
}

/// Stored wire volumes were sometimes off by a factor of 32768 in either
/// direction.
pub(crate) fn repair_volume(val: f32) -> f32 {
    if val > 4.1 {
        val * 0.000030517578125
    } else if val < 0.00004 {
        val * 32768.0
    } else {
        val
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

struct RawMachine {
    machine: Machine,
    node: NodeHeader,
    was_vst: bool,
}

struct Loader<'e, 'a> {
    env: &'e mut LoadEnv<'a>,
    song: Song,
    report: LoadReport,
    raw: Vec<Option<RawMachine>>,
    /// Raw slot and legacy code of every converted machine.
    converted: Vec<(usize, i32)>,
    bus_machine: [u8; MAX_BUSES],
    bus_effect: [u8; MAX_BUSES],
}

/// Decode a PSY2 song.
pub fn load_psy2(data: &[u8], env: &mut LoadEnv<'_>) -> Result<(Song, LoadReport), FormatError> {
    let mut r = PsyReader::new(data);
    if r.read_bytes(8)? != PSY2_MAGIC {
        return Err(FormatError::InvalidHeader);
    }
    let header: SongHeader = read_struct(&mut r)?;

    let mut song = Song::new();
    song.patterns.delete_all_patterns();
    song.patterns.set_default_lines(env.options.default_pattern_lines);
    song.patterns.reset();
    let mut loader = Loader {
        env,
        song,
        report: LoadReport::new(SongFormat::Psy2, 0),
        raw: (0..OLD_MAX_MACHINES).map(|_| None).collect(),
        converted: Vec::new(),
        bus_machine: header.bus_machine,
        bus_effect: [NO_BUS; MAX_BUSES],
    };
    loader.apply_header(&header);

    loader.patterns(&mut r)?;
    loader.env.report_progress(r.pos(), r.len());
    let tables: InstrumentTables = read_struct(&mut r)?;
    loader.apply_instruments(&tables);
    loader.waves(&mut r)?;
    loader.env.report_progress(r.pos(), r.len());

    let mut vst_cache = Vec::with_capacity(OLD_MAX_PLUGINS);
    for _ in 0..OLD_MAX_PLUGINS {
        let entry: VstCacheEntry = read_struct(&mut r)?;
        vst_cache.push(entry.body);
    }
    let active = r.read_bytes(OLD_MAX_MACHINES)?.to_vec();

    let complete = match loader.machines(&mut r, &active, &vst_cache) {
        Ok(()) => true,
        Err(e) => {
            loader.report.warn(format!("machine data unreadable ({e}), later machines dropped"));
            false
        }
    };
    loader.env.report_progress(r.pos(), r.len());

    if complete {
        loader.instrument_patch(&mut r);
    }
    if complete && r.remaining() >= MAX_BUSES {
        if let Ok(bytes) = r.read_bytes(MAX_BUSES) {
            loader.bus_effect.copy_from_slice(bytes);
        }
    } else {
        loader.infer_bus_effects();
    }
    loader.validate_buses();
    if complete {
        loader.vst_chunks(&mut r);
    }

    let tables = loader.wire_tables();
    loader.install(tables);
    Ok(loader.finish())
}

impl Loader<'_, '_> {
    fn apply_header(&mut self, h: &SongHeader) {
        let song = &mut self.song;
        song.name = fixed_str(&h.name);
        song.author = fixed_str(&h.author);
        song.comments = fixed_str(&h.comments);
        song.bpm = h.bpm as f32;
        // ticks were counted at 44100 Hz
        song.lines_per_beat = if h.sample_rate <= 0 || h.bpm <= 0 {
            4
        } else {
            (44100 * 60 / (i64::from(h.sample_rate) * i64::from(h.bpm))).clamp(1, 31) as u32
        };
        song.octave = h.octave.min(8);
        song.patterns.set_song_tracks(h.tracks.clamp(1, MAX_TRACKS as i32) as usize);

        let length = h.play_length.clamp(1, OLD_MAX_POSITIONS as i32) as usize;
        song.sequence.set_play_length(length);
        for (position, &pattern) in h.play_order.iter().take(length).enumerate() {
            song.sequence.set_pattern_at(position, usize::from(pattern));
        }
    }

    fn patterns(&mut self, r: &mut PsyReader<'_>) -> Result<(), FormatError> {
        let count = r.read_i32_le()?.max(0) as usize;
        for index in 0..count {
            let h: PatternHeader = read_struct(r)?;
            if h.lines <= 0 {
                self.song.patterns.remove_pattern(index);
                if let Some(p) = self.song.patterns.pattern_mut(index) {
                    p.lines = DEFAULT_PATTERN_LINES;
                }
                continue;
            }
            let lines = h.lines as usize;
            let data = r.read_bytes(lines * OLD_MAX_TRACKS * EVENT_SIZE)?;
            if index >= MAX_PATTERNS {
                self.report.warn(format!("pattern {index} is out of range, dropped"));
                continue;
            }
            if lines > MAX_LINES {
                self.report.warn(format!("pattern {index}: {lines} lines cut to {MAX_LINES}"));
            }
            let mut bytes = data.to_vec();
            // bus indices become slot indices
            for cell in bytes.chunks_exact_mut(EVENT_SIZE) {
                if cell[2] < 128 {
                    cell[2] += FIRST_GENERATOR as u8;
                }
            }
            let patterns = &mut self.song.patterns;
            patterns.set_pattern_bytes(index, lines, OLD_MAX_TRACKS, &bytes);
            if let Some(p) = patterns.pattern_mut(index) {
                p.name = psy_ir::fixed_name(&fixed_str(&h.name));
            }
        }
        Ok(())
    }

    fn apply_instruments(&mut self, t: &InstrumentTables) {
        self.song.inst_selected = usize::try_from(t.selected).unwrap_or(0);
        for i in 0..OLD_MAX_INSTRUMENTS {
            let Some(inst) = self.song.instruments.get_mut(i) else {
                break;
            };
            inst.name = psy_ir::fixed_name(&fixed_str(&t.names[i]));
            inst.nna = NewNoteAction::from_code(t.nna[i]);
            inst.amp_env = Adsr {
                attack: t.env_attack[i],
                decay: t.env_decay[i],
                sustain: t.env_sustain[i],
                release: t.env_release[i],
            };
            inst.filter_env = FilterEnvelope {
                attack: t.filter_attack[i],
                decay: t.filter_decay[i],
                sustain: t.filter_sustain[i],
                release: t.filter_release[i],
                cutoff: t.filter_cutoff[i],
                resonance: t.filter_resonance[i],
                amount: t.filter_amount[i],
                filter_type: t.filter_type[i],
            };
            inst.pan = t.pan[i].clamp(0, 128);
            inst.random_pan = t.random_pan[i] != 0;
            inst.random_cutoff = t.random_cutoff[i] != 0;
            inst.random_resonance = t.random_resonance[i] != 0;
        }
    }

    /// Every layer uses the layout of layer 0; only layer 0 is kept.
    fn waves(&mut self, r: &mut PsyReader<'_>) -> Result<(), FormatError> {
        // total wave count, unused
        r.read_i32_le()?;
        for i in 0..OLD_MAX_INSTRUMENTS {
            for layer in 0..OLD_MAX_WAVES {
                let frames = r.read_i32_le()?;
                if frames <= 0 {
                    continue;
                }
                let h: WaveHeader = read_struct(r)?;
                let wave = read_wave(r, frames as usize, h.stereo != 0)?;
                if layer > 0 {
                    continue;
                }
                if let Some(inst) = self.song.instruments.get_mut(i) {
                    inst.wave_name = psy_ir::fixed_name(&fixed_str(&h.name));
                    inst.wave_volume = h.volume;
                    inst.wave_finetune = i32::from(h.finetune);
                    inst.wave_loop_start = h.loop_start;
                    inst.wave_loop_end = h.loop_end;
                    inst.wave_looped = h.loop_type != 0;
                    inst.wave = wave;
                }
            }
        }
        Ok(())
    }

    fn machines(
        &mut self,
        r: &mut PsyReader<'_>,
        active: &[u8],
        vst_cache: &[Option<VstParams>],
    ) -> Result<(), FormatError> {
        for slot in 0..OLD_MAX_MACHINES {
            if active[slot] == 0 {
                continue;
            }
            let node: NodeHeader = read_struct(r)?;
            let (mut machine, was_vst) = self.machine_body(r, slot, node.type_code, vst_cache)?;
            machine.x = node.x;
            machine.y = node.y;
            machine.panning = node.panning.clamp(0, 128);
            let name = fixed_str(&node.edit_name);
            if !name.is_empty() {
                machine.edit_name = psy_ir::fixed_name(&name);
            }

            let is_master = machine.kind == MachineType::Master;
            if is_master != (slot == MASTER_INDEX) {
                self.report.warn(format!("raw slot {slot}: {:?} in the wrong slot, dropped", machine.kind));
                continue;
            }
            self.raw[slot] = Some(RawMachine { machine, node, was_vst });
        }
        Ok(())
    }

    fn machine_body(
        &mut self,
        r: &mut PsyReader<'_>,
        slot: usize,
        code: i32,
        vst_cache: &[Option<VstParams>],
    ) -> Result<(Machine, bool), FormatError> {
        let env: &LoadEnv<'_> = self.env;
        let report = &mut self.report;

        if env.converter.exists(code) {
            let redirect = env.converter.redirect(slot, code, r.rest())?;
            r.skip(redirect.consumed)?;
            self.converted.push((slot, code));
            let machine = create_or_dummy(
                env,
                slot,
                Some(redirect.kind),
                redirect.plugin.as_deref(),
                0,
                redirect.mode,
                params_state(&redirect.params),
                report,
            );
            return Ok((machine, false));
        }

        let kind = MachineType::from_code(code);
        let machine = match kind {
            Some(MachineType::Master) => {
                let out_dry = r.read_i32_le()?;
                let mut m = create_or_dummy(env, slot, kind, None, 0, MachineMode::Effect, Vec::new(), report);
                m.behavior_mut().set_param(0, out_dry);
                m
            }
            Some(MachineType::Sampler | MachineType::XmSampler) => {
                let voices = r.read_i32_le()?;
                let resampler = r.read_i32_le()?;
                let mut m =
                    create_or_dummy(env, slot, kind, None, 0, MachineMode::Generator, Vec::new(), report);
                m.behavior_mut().set_param(0, voices);
                m.behavior_mut().set_param(1, resampler);
                m
            }
            Some(MachineType::Plugin) => {
                let tail: PluginTail = read_struct(r)?;
                let dll = fixed_str(&tail.dll).to_lowercase();
                // a missing plugin's mode is settled by the bus tables
                let mut m = create_or_dummy(
                    env,
                    slot,
                    kind,
                    Some(&dll),
                    0,
                    MachineMode::Generator,
                    params_state(&tail.params),
                    report,
                );
                m.plugin = Some(dll);
                m
            }
            Some(k @ (MachineType::Vst | MachineType::VstFx)) => {
                let tail: VstTail = read_struct(r)?;
                let mode = if k == MachineType::VstFx { MachineMode::Effect } else { MachineMode::Generator };
                let cached = usize::try_from(tail.instance)
                    .ok()
                    .and_then(|i| vst_cache.get(i))
                    .and_then(Option::as_ref);
                let m = match cached {
                    Some(entry) => {
                        let dll = fixed_str(&entry.dll).to_lowercase();
                        // normalized floats, kept at 16 bits
                        let params: Vec<i32> = entry
                            .params
                            .iter()
                            .map(|v| (v.clamp(0.0, 1.0) * 65535.0).round() as i32)
                            .collect();
                        let mut m =
                            create_or_dummy(env, slot, kind, Some(&dll), 0, mode, params_state(&params), report);
                        m.plugin = Some(dll);
                        m
                    }
                    None => {
                        report.warn(format!(
                            "raw slot {slot}: VST instance {} has no cached data, replaced by a dummy",
                            tail.instance
                        ));
                        create_or_dummy(env, slot, None, None, 0, mode, Vec::new(), report)
                    }
                };
                return Ok((m, true));
            }
            Some(other) => create_or_dummy(env, slot, Some(other), None, 0, MachineMode::Effect, Vec::new(), report),
            None => {
                report.warn(format!("raw slot {slot}: unknown machine type {code}, replaced by a dummy"));
                create_or_dummy(env, slot, None, None, 0, MachineMode::Effect, Vec::new(), report)
            }
        };
        Ok((machine, false))
    }

    /// Per-instrument loop flags and line counts added around 1.0.
    fn instrument_patch(&mut self, r: &mut PsyReader<'_>) {
        if r.remaining() < OLD_MAX_INSTRUMENTS * 5 {
            self.report.warn(String::from("instrument loop data missing"));
            return;
        }
        let mut loops = [false; OLD_MAX_INSTRUMENTS];
        for l in &mut loops {
            *l = r.read_bool().unwrap_or(false);
        }
        for (i, looped) in loops.into_iter().enumerate() {
            let lines = r.read_i32_le().unwrap_or(16);
            if let Some(inst) = self.song.instruments.get_mut(i) {
                inst.looped = looped;
                inst.lines = lines;
            }
        }
    }

    /// Effect bus table of files that predate it: every active machine
    /// missing from the generator table, in slot order.
    fn infer_bus_effects(&mut self) {
        let mut in_generators = [false; OLD_MAX_MACHINES];
        for &b in &self.bus_machine {
            if let Some(flag) = in_generators.get_mut(usize::from(b)) {
                *flag = true;
            }
        }
        let effects = (1..OLD_MAX_MACHINES)
            .filter(|&i| self.raw[i].is_some() && !in_generators[i])
            .take(MAX_BUSES);
        self.bus_effect = [NO_BUS; MAX_BUSES];
        for (bus, slot) in effects.enumerate() {
            self.bus_effect[bus] = slot as u8;
        }
    }

    /// Drop duplicates and dangling entries, and put every machine in the
    /// table matching its mode. Dummies take the mode of their table.
    fn validate_buses(&mut self) {
        let (bm, be) = (&mut self.bus_machine, &mut self.bus_effect);
        for i in 0..MAX_BUSES {
            for j in i + 1..MAX_BUSES {
                if bm[i] == bm[j] {
                    bm[j] = NO_BUS;
                }
                if be[i] == be[j] {
                    be[j] = NO_BUS;
                }
            }
            for j in 0..MAX_BUSES {
                if bm[i] == be[j] {
                    be[j] = NO_BUS;
                }
            }
        }

        for i in 0..MAX_BUSES {
            if self.bus_effect[i] != NO_BUS {
                let slot = usize::from(self.bus_effect[i]);
                match self.raw.get_mut(slot).and_then(Option::as_mut) {
                    Some(m) if slot != MASTER_INDEX => {
                        if m.machine.kind == MachineType::Dummy {
                            m.machine.mode = MachineMode::Effect;
                        } else if m.machine.mode == MachineMode::Generator {
                            let free = self.bus_machine.iter().position(|&b| b == NO_BUS);
                            if let Some(k) = free {
                                self.bus_machine[k] = self.bus_effect[i];
                            }
                            self.bus_effect[i] = NO_BUS;
                        }
                    }
                    _ => self.bus_effect[i] = NO_BUS,
                }
            }
            if self.bus_machine[i] != NO_BUS {
                let slot = usize::from(self.bus_machine[i]);
                match self.raw.get_mut(slot).and_then(Option::as_mut) {
                    Some(m) if slot != MASTER_INDEX => {
                        if m.machine.kind == MachineType::Dummy {
                            m.machine.mode = MachineMode::Generator;
                        } else if m.machine.mode != MachineMode::Generator {
                            let free = self.bus_effect.iter().position(|&b| b == NO_BUS);
                            if let Some(k) = free {
                                self.bus_effect[k] = self.bus_machine[i];
                            }
                            self.bus_machine[i] = NO_BUS;
                        }
                    }
                    _ => self.bus_machine[i] = NO_BUS,
                }
            }
        }
    }

    /// Opaque VST chunks. Only read on a full open; nothing can use them
    /// here, so they are skipped.
    fn vst_chunks(&mut self, r: &mut PsyReader<'_>) {
        let present = r.remaining() > 0 && r.read_bool().unwrap_or(false);
        if !present || !self.env.options.full_open {
            return;
        }
        for slot in 0..OLD_MAX_MACHINES {
            let Some(m) = self.raw[slot].as_ref().filter(|m| m.was_vst) else {
                continue;
            };
            if m.machine.kind == MachineType::Dummy {
                self.report.warn(format!("raw slot {slot}: VST chunk of a missing plugin skipped"));
            }
            let skipped = r.read_u32_le().and_then(|len| r.skip(len as usize));
            if skipped.is_err() {
                self.report.warn(String::from("VST chunk data truncated"));
                return;
            }
        }
    }

    /// Half-edge tables in raw slot numbers. The legacy file kept wire
    /// volumes on the source's output side; they move to the input side,
    /// repaired, with the gain stored before the multiplier.
    fn wire_tables(&self) -> Vec<WireTable> {
        let mut tables = vec![WireTable::default(); OLD_MAX_MACHINES];
        let raw_at = |s: i32| usize::try_from(s).ok().filter(|&s| s < OLD_MAX_MACHINES);

        for (dst, entry) in self.raw.iter().enumerate() {
            let Some(dst_raw) = entry else {
                continue;
            };
            let node = &dst_raw.node;
            for c in 0..MAX_CONNECTIONS {
                if node.input_con[c] == 0 {
                    continue;
                }
                let Some(src) = raw_at(node.input_machines[c]).filter(|&s| s != dst) else {
                    continue;
                };
                let Some(src_raw) = self.raw[src].as_ref() else {
                    continue;
                };
                let back = (0..MAX_CONNECTIONS).find(|&d| {
                    src_raw.node.connection[d] != 0 && src_raw.node.output_machines[d] == dst as i32
                });
                let Some(d) = back else {
                    continue;
                };
                let volume = repair_volume(src_raw.node.input_con_vol[d]);
                let multiplier = src_raw.machine.audio_range() / dst_raw.machine.audio_range();
                tables[dst].inputs[c] = InputHalfEdge {
                    source: src as i32,
                    active: true,
                    gain: volume / multiplier,
                    multiplier,
                };
            }
            for c in 0..MAX_CONNECTIONS {
                let target = raw_at(node.output_machines[c]).filter(|&t| self.raw[t].is_some());
                if let (true, Some(target)) = (node.connection[c] != 0, target) {
                    tables[dst].outputs[c] = OutputHalfEdge { target: target as i32, active: true };
                }
            }
        }
        tables
    }

    /// Raw slot to final slot. Bus entries go to their fixed slots, the
    /// rest to the first free slot of their mode's range.
    fn remap(&mut self) -> [Option<usize>; OLD_MAX_MACHINES] {
        let mut map = [None; OLD_MAX_MACHINES];
        let mut taken = [false; FIRST_EFFECT + MAX_BUSES];

        if self.raw[MASTER_INDEX].is_some() {
            map[MASTER_INDEX] = Some(MASTER_INDEX);
            taken[MASTER_INDEX] = true;
        }
        for bus in 0..MAX_BUSES {
            for (raw, slot) in [
                (self.bus_machine[bus], FIRST_GENERATOR + bus),
                (self.bus_effect[bus], FIRST_EFFECT + bus),
            ] {
                if raw != NO_BUS {
                    map[usize::from(raw)] = Some(slot);
                    taken[slot] = true;
                }
            }
        }

        for raw in 1..OLD_MAX_MACHINES {
            let Some(m) = self.raw[raw].as_ref() else {
                continue;
            };
            if map[raw].is_some() {
                continue;
            }
            let mut range = if m.machine.mode == MachineMode::Generator {
                FIRST_GENERATOR..FIRST_EFFECT
            } else {
                FIRST_EFFECT..FIRST_EFFECT + MAX_BUSES
            };
            match range.find(|&s| !taken[s]) {
                Some(slot) => {
                    map[raw] = Some(slot);
                    taken[slot] = true;
                }
                None => self.report.warn(format!("raw slot {raw}: no free slot left, machine dropped")),
            }
        }
        map
    }

    fn install(&mut self, tables: Vec<WireTable>) {
        let map = self.remap();
        let to_final = |v: i32| -> Option<i32> {
            usize::try_from(v).ok().and_then(|s| map.get(s).copied().flatten()).map(|s| s as i32)
        };

        for (raw, mut table) in tables.into_iter().enumerate() {
            let Some(slot) = map[raw] else {
                continue;
            };
            let Some(entry) = self.raw[raw].take() else {
                continue;
            };
            for e in &mut table.inputs {
                match to_final(e.source).filter(|_| e.active) {
                    Some(s) => e.source = s,
                    None => *e = InputHalfEdge::default(),
                }
            }
            for e in &mut table.outputs {
                match to_final(e.target).filter(|_| e.active) {
                    Some(t) => e.target = t,
                    None => *e = OutputHalfEdge::default(),
                }
            }
            if let Err(e) = self.song.graph.install_loaded(slot, entry.machine, table) {
                self.report.warn(format!("raw slot {raw}: {e}"));
            }
        }

        self.converted = self
            .converted
            .iter()
            .filter_map(|&(raw, code)| map[raw].map(|slot| (slot, code)))
            .collect();
    }

    fn finish(mut self) -> (Song, LoadReport) {
        self.report.reconcile = self.song.graph.post_load_reconcile();
        if self.env.options.full_open && !self.converted.is_empty() {
            self.env.converter.retweak(&mut self.song, &self.converted);
        }
        self.song.graph.post_load();
        self.song.seq_bus = 0;
        if !self.song.graph.is_occupied(MASTER_INDEX) {
            self.report.warn(String::from("song has no master, a default one was created"));
            synthesize_master(&mut self.song, self.env);
        }
        (self.song, self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_repair_thresholds() {
        assert_eq!(repair_volume(5.0), 5.0 * 0.000030517578125);
        assert_eq!(repair_volume(0.00001), 0.00001 * 32768.0);
        assert_eq!(repair_volume(1.0), 1.0);
        assert_eq!(repair_volume(4.1), 4.1);
        assert_eq!(repair_volume(0.00004), 0.00004);
    }

    #[test]
    fn header_struct_has_legacy_size() {
        let bytes = vec![0u8; 32 + 32 + 128 + 4 + 4 + 1 + 64 + 128 + 4 + 4];
        let mut r = PsyReader::new(&bytes);
        let _: SongHeader = read_struct(&mut r).unwrap();
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_struct_reports_eof() {
        let bytes = [0u8; 10];
        let mut r = PsyReader::new(&bytes);
        let err = read_struct::<PatternHeader>(&mut r).err();
        assert!(matches!(err, Some(FormatError::UnexpectedEof)));
        assert_eq!(r.pos(), 0);
    }
}
