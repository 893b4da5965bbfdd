//! Payload codecs shared by the chunk readers and writers: machines,
//! instruments, waveforms and the extended bank.

use psy_ir::machines::DummyMachine;
use psy_ir::{
    Adsr, FilterEnvelope, InputHalfEdge, Instrument, Machine, MachineMode, MachineType,
    NewNoteAction, OutputHalfEdge, SampleData, WireTable, XmInstrument, XmSample,
    MAX_CONNECTIONS,
};

use crate::reader::PsyReader;
use crate::writer::PsyWriter;
use crate::{FormatError, LoadEnv, LoadReport};

/// Longest name field accepted in any record.
const NAME_MAX: usize = 256;
/// Waveforms longer than this are treated as corrupt.
const MAX_WAVE_FRAMES: usize = 1 << 30;

// ---------------------------------------------------------------------------
// Machine construction
// ---------------------------------------------------------------------------

/// Build a machine through the factory, or a Dummy holding `state` and
/// `mode` when that is not possible. Preview loads never touch plugins.
#[allow(clippy::too_many_arguments)]
pub(crate) fn create_or_dummy(
    env: &LoadEnv<'_>,
    slot: usize,
    kind: Option<MachineType>,
    plugin: Option<&str>,
    shell_index: u32,
    mode: MachineMode,
    state: Vec<u8>,
    report: &mut LoadReport,
) -> Machine {
    let behavior = match kind {
        None | Some(MachineType::Dummy) => None,
        Some(k) if k.is_hosted() && !env.options.full_open => None,
        Some(k) if k.is_hosted() && !plugin.is_some_and(|p| env.factory.test_filename(p, shell_index)) => {
            report.warn(format!(
                "machine {slot}: plugin {:?} is missing or disabled, replaced by a dummy",
                plugin.unwrap_or_default()
            ));
            None
        }
        Some(k) => match env.factory.try_create(k, plugin, shell_index) {
            Ok(b) => Some((k, b)),
            Err(e) => {
                report.warn(format!("machine {slot}: {e}, replaced by a dummy"));
                None
            }
        },
    };

    match behavior {
        Some((kind, behavior)) => {
            let mut machine = Machine::new(kind, behavior);
            machine.behavior_mut().init();
            if !state.is_empty() && !machine.behavior_mut().load_state(&state) {
                report.warn(format!("machine {slot}: stored state not understood"));
            }
            machine
        }
        None => Machine::new(MachineType::Dummy, Box::new(DummyMachine::preserving(mode, state))),
    }
}

// ---------------------------------------------------------------------------
// MACD
// ---------------------------------------------------------------------------

fn read_inputs(r: &mut PsyReader<'_>) -> Result<[InputHalfEdge; MAX_CONNECTIONS], FormatError> {
    let mut edges = [InputHalfEdge::default(); MAX_CONNECTIONS];
    for e in &mut edges {
        e.source = r.read_i32_le()?;
        e.active = r.read_bool()?;
        e.gain = r.read_f32_le()?;
        e.multiplier = r.read_f32_le()?;
    }
    Ok(edges)
}

fn write_inputs(w: &mut PsyWriter, edges: &[InputHalfEdge; MAX_CONNECTIONS]) {
    for e in edges {
        w.write_i32_le(e.source);
        w.write_bool(e.active);
        w.write_f32_le(e.gain);
        w.write_f32_le(e.multiplier);
    }
}

/// Decode a machine record (everything after the slot index).
pub(crate) fn read_machine(
    r: &mut PsyReader<'_>,
    env: &LoadEnv<'_>,
    slot: usize,
    report: &mut LoadReport,
) -> Result<(Machine, WireTable), FormatError> {
    let code = r.read_i32_le()?;
    let plugin = r.read_cstring(NAME_MAX);
    let shell_index = r.read_u32_le()?;
    let mode = MachineMode::from_code(r.read_u8()?);
    let bypass = r.read_bool()?;
    let mute = r.read_bool()?;
    let panning = r.read_i32_le()?;
    let x = r.read_i32_le()?;
    let y = r.read_i32_le()?;
    let edit_name = r.read_cstring(32);

    let kind = MachineType::from_code(code);
    if kind.is_none() {
        report.warn(format!("machine {slot}: unknown type code {code}"));
    }

    let mut table = WireTable { inputs: read_inputs(r)?, ..WireTable::default() };
    for out in &mut table.outputs {
        *out = OutputHalfEdge { target: r.read_i32_le()?, active: r.read_bool()? };
    }
    if kind == Some(MachineType::Mixer) {
        table.returns = read_inputs(r)?;
    }

    let state_len = r.read_u32_le()? as usize;
    let state = r.read_bytes(state_len)?.to_vec();

    let plugin = (!plugin.is_empty()).then_some(plugin);
    let mut machine =
        create_or_dummy(env, slot, kind, plugin.as_deref(), shell_index, mode, state, report);
    machine.x = x;
    machine.y = y;
    machine.bypass = bypass;
    machine.mute = mute;
    machine.panning = panning.clamp(0, 128);
    machine.edit_name = psy_ir::fixed_name(&edit_name);
    machine.shell_index = shell_index;
    machine.plugin = plugin;
    Ok((machine, table))
}

/// Encode a machine record (everything after the slot index).
pub(crate) fn write_machine(w: &mut PsyWriter, machine: &Machine, table: &WireTable) {
    w.write_i32_le(machine.kind.code());
    w.write_cstring(machine.plugin.as_deref().unwrap_or(""));
    w.write_u32_le(machine.shell_index);
    w.write_u8(machine.mode.code());
    w.write_bool(machine.bypass);
    w.write_bool(machine.mute);
    w.write_i32_le(machine.panning);
    w.write_i32_le(machine.x);
    w.write_i32_le(machine.y);
    w.write_cstring(&machine.edit_name);
    write_inputs(w, &table.inputs);
    for out in &table.outputs {
        w.write_i32_le(out.target);
        w.write_bool(out.active);
    }
    if machine.kind == MachineType::Mixer {
        write_inputs(w, &table.returns);
    }
    let mut state = Vec::new();
    machine.behavior().save_state(&mut state);
    w.write_u32_le(state.len() as u32);
    w.write_bytes(&state);
}

// ---------------------------------------------------------------------------
// Waveforms
// ---------------------------------------------------------------------------

fn read_frames(r: &mut PsyReader<'_>, frames: usize) -> Result<Vec<i16>, FormatError> {
    let bytes = r.read_bytes(frames.checked_mul(2).ok_or(FormatError::UnexpectedEof)?)?;
    Ok(bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect())
}

pub(crate) fn read_wave(r: &mut PsyReader<'_>, frames: usize, stereo: bool) -> Result<SampleData, FormatError> {
    if frames > MAX_WAVE_FRAMES {
        return Err(FormatError::Corrupt(format!("wave of {frames} frames")));
    }
    let left = read_frames(r, frames)?;
    Ok(if stereo {
        SampleData::Stereo16(left, read_frames(r, frames)?)
    } else {
        SampleData::Mono16(left)
    })
}

fn write_wave(w: &mut PsyWriter, wave: &SampleData) {
    for channel in [Some(wave.left()), wave.right()].into_iter().flatten() {
        for v in channel {
            w.write_i16_le(*v);
        }
    }
}

// ---------------------------------------------------------------------------
// INSD
// ---------------------------------------------------------------------------

/// Decode an instrument record (everything after the slot index).
pub(crate) fn read_instrument(r: &mut PsyReader<'_>) -> Result<Instrument, FormatError> {
    let mut inst = Instrument {
        looped: r.read_bool()?,
        lines: r.read_i32_le()?,
        nna: NewNoteAction::from_code(r.read_u8()?),
        amp_env: Adsr {
            attack: r.read_i32_le()?,
            decay: r.read_i32_le()?,
            sustain: r.read_i32_le()?,
            release: r.read_i32_le()?,
        },
        filter_env: FilterEnvelope {
            attack: r.read_i32_le()?,
            decay: r.read_i32_le()?,
            sustain: r.read_i32_le()?,
            release: r.read_i32_le()?,
            cutoff: r.read_i32_le()?,
            resonance: r.read_i32_le()?,
            amount: r.read_i32_le()?,
            filter_type: r.read_i32_le()?,
        },
        pan: r.read_i32_le()?,
        random_pan: r.read_bool()?,
        random_cutoff: r.read_bool()?,
        random_resonance: r.read_bool()?,
        ..Instrument::default()
    };
    inst.name = psy_ir::fixed_name(&r.read_cstring(32));

    let layers = r.read_u32_le()?;
    for layer in 0..layers {
        let frames = r.read_u32_le()? as usize;
        let volume = r.read_i32_le()?;
        let finetune = r.read_i32_le()?;
        let tune = r.read_i32_le()?;
        let loop_start = r.read_u32_le()?;
        let loop_end = r.read_u32_le()?;
        let looped = r.read_bool()?;
        let stereo = r.read_bool()?;
        let name = r.read_cstring(32);
        let wave = read_wave(r, frames, stereo)?;
        // only one layer is kept
        if layer == 0 {
            inst.wave_volume = volume;
            inst.wave_finetune = finetune;
            inst.wave_tune = tune;
            inst.wave_loop_start = loop_start;
            inst.wave_loop_end = loop_end;
            inst.wave_looped = looped;
            inst.wave_name = psy_ir::fixed_name(&name);
            inst.wave = wave;
        }
    }
    Ok(inst)
}

/// Encode an instrument record (everything after the slot index).
pub(crate) fn write_instrument(w: &mut PsyWriter, inst: &Instrument) {
    w.write_bool(inst.looped);
    w.write_i32_le(inst.lines);
    w.write_u8(inst.nna.code());
    let a = &inst.amp_env;
    for v in [a.attack, a.decay, a.sustain, a.release] {
        w.write_i32_le(v);
    }
    let f = &inst.filter_env;
    for v in [f.attack, f.decay, f.sustain, f.release, f.cutoff, f.resonance, f.amount, f.filter_type] {
        w.write_i32_le(v);
    }
    w.write_i32_le(inst.pan);
    w.write_bool(inst.random_pan);
    w.write_bool(inst.random_cutoff);
    w.write_bool(inst.random_resonance);
    w.write_cstring(&inst.name);

    w.write_u32_le(u32::from(!inst.is_empty()));
    if inst.is_empty() {
        return;
    }
    w.write_u32_le(inst.wave_len() as u32);
    w.write_i32_le(inst.wave_volume);
    w.write_i32_le(inst.wave_finetune);
    w.write_i32_le(inst.wave_tune);
    w.write_u32_le(inst.wave_loop_start);
    w.write_u32_le(inst.wave_loop_end);
    w.write_bool(inst.wave_looped);
    w.write_bool(inst.wave.is_stereo());
    w.write_cstring(&inst.wave_name);
    write_wave(w, &inst.wave);
}

// ---------------------------------------------------------------------------
// EINS
// ---------------------------------------------------------------------------

pub(crate) fn read_xm_instrument(r: &mut PsyReader<'_>) -> Result<XmInstrument, FormatError> {
    let mut inst = XmInstrument {
        enabled: r.read_bool()?,
        name: psy_ir::fixed_name(&r.read_cstring(32)),
        global_volume: r.read_f32_le()?,
        ..XmInstrument::default()
    };
    for entry in &mut inst.note_map {
        *entry = (r.read_u8()?, r.read_u8()?);
    }
    Ok(inst)
}

pub(crate) fn write_xm_instrument(w: &mut PsyWriter, inst: &XmInstrument) {
    w.write_bool(inst.enabled);
    w.write_cstring(&inst.name);
    w.write_f32_le(inst.global_volume);
    for &(note, sample) in &inst.note_map {
        w.write_u8(note);
        w.write_u8(sample);
    }
}

pub(crate) fn read_xm_sample(r: &mut PsyReader<'_>) -> Result<XmSample, FormatError> {
    let name = psy_ir::fixed_name(&r.read_cstring(32));
    let frames = r.read_u32_le()? as usize;
    let stereo = r.read_bool()?;
    Ok(XmSample {
        name,
        loop_start: r.read_u32_le()?,
        loop_end: r.read_u32_le()?,
        loop_mode: r.read_u8()?,
        default_volume: r.read_u8()?,
        panning: r.read_f32_le()?,
        tune: r.read_i16_le()?,
        fine_tune: r.read_i16_le()?,
        data: read_wave(r, frames, stereo)?,
    })
}

pub(crate) fn write_xm_sample(w: &mut PsyWriter, sample: &XmSample) {
    w.write_cstring(&sample.name);
    w.write_u32_le(sample.data.len() as u32);
    w.write_bool(sample.data.is_stereo());
    w.write_u32_le(sample.loop_start);
    w.write_u32_le(sample.loop_end);
    w.write_u8(sample.loop_mode);
    w.write_u8(sample.default_volume);
    w.write_f32_le(sample.panning);
    w.write_i16_le(sample.tune);
    w.write_i16_le(sample.fine_tune);
    write_wave(w, &sample.data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SongFormat;
    use psy_ir::machines::{BuiltinFactory, PluginDescriptor};
    use psy_ir::MachineFactory;

    fn report() -> LoadReport {
        LoadReport::new(SongFormat::Psy3, 0)
    }

    fn encode(machine: &Machine, table: &WireTable) -> Vec<u8> {
        let mut w = PsyWriter::new();
        write_machine(&mut w, machine, table);
        w.into_inner()
    }

    #[test]
    fn machine_record_keeps_wires_and_placement() {
        let factory = BuiltinFactory::new();
        let env = LoadEnv::new(&factory);
        let mut machine = Machine::new(
            MachineType::Sampler,
            factory.try_create(MachineType::Sampler, None, 0).unwrap(),
        );
        machine.x = 40;
        machine.y = -7;
        machine.edit_name = psy_ir::fixed_name("Drums");
        machine.behavior_mut().set_param(0, 12);
        let mut table = WireTable::default();
        table.outputs[0] = OutputHalfEdge { target: 0, active: true };

        let bytes = encode(&machine, &table);
        let mut rep = report();
        let (back, back_table) = read_machine(&mut PsyReader::new(&bytes), &env, 3, &mut rep).unwrap();
        assert!(rep.warnings.is_empty());
        assert_eq!(back.kind, MachineType::Sampler);
        assert_eq!((back.x, back.y), (40, -7));
        assert_eq!(back.edit_name.as_str(), "Drums");
        assert_eq!(back.behavior().param(0), 12);
        assert_eq!(back_table, table);
    }

    #[test]
    fn missing_plugin_becomes_dummy_with_state() {
        let with_plugin = BuiltinFactory::new()
            .with_plugin(PluginDescriptor::new("phantom.dll", MachineMode::Generator, 2));
        let mut machine = Machine::new(
            MachineType::Plugin,
            with_plugin.try_create(MachineType::Plugin, Some("phantom.dll"), 0).unwrap(),
        );
        machine.plugin = Some("phantom.dll".into());
        let bytes = encode(&machine, &WireTable::default());
        let mut state = Vec::new();
        machine.behavior().save_state(&mut state);

        let bare = BuiltinFactory::new();
        let env = LoadEnv::new(&bare);
        let mut rep = report();
        let (back, _) = read_machine(&mut PsyReader::new(&bytes), &env, 5, &mut rep).unwrap();
        assert_eq!(back.kind, MachineType::Dummy);
        assert_eq!(back.mode, MachineMode::Generator);
        assert_eq!(rep.warnings.len(), 1);
        let mut kept = Vec::new();
        back.behavior().save_state(&mut kept);
        assert_eq!(kept, state);
    }

    #[test]
    fn truncated_machine_record_is_an_error() {
        let factory = BuiltinFactory::new();
        let env = LoadEnv::new(&factory);
        let machine = Machine::new(
            MachineType::Mixer,
            factory.try_create(MachineType::Mixer, None, 0).unwrap(),
        );
        let bytes = encode(&machine, &WireTable::default());
        let cut = &bytes[..bytes.len() - 3];
        let result = read_machine(&mut PsyReader::new(cut), &env, 1, &mut report());
        assert!(matches!(result, Err(FormatError::UnexpectedEof)));
    }

    #[test]
    fn instrument_record_keeps_stereo_wave() {
        let mut inst = Instrument::default();
        inst.name = psy_ir::fixed_name("Pad");
        inst.filter_env.cutoff = 33;
        inst.nna = NewNoteAction::Release;
        inst.wave = SampleData::Stereo16(vec![1, -2, 3], vec![-4, 5, -6]);
        inst.wave_loop_end = 3;
        inst.wave_looped = true;
        let mut w = PsyWriter::new();
        write_instrument(&mut w, &inst);
        let bytes = w.into_inner();
        let back = read_instrument(&mut PsyReader::new(&bytes)).unwrap();
        assert_eq!(back, inst);
    }

    #[test]
    fn empty_instrument_has_no_layer() {
        let mut w = PsyWriter::new();
        write_instrument(&mut w, &Instrument::default());
        let bytes = w.into_inner();
        let mut r = PsyReader::new(&bytes);
        assert!(read_instrument(&mut r).unwrap().is_empty());
        assert_eq!(r.remaining(), 0);
    }
}
