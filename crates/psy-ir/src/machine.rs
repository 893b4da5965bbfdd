//! Machine nodes and the capability set their behaviours implement.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use arrayvec::ArrayString;

/// Sample scale used by native machines. Hosted VSTs work in [-1, 1].
pub const NATIVE_AUDIO_RANGE: f32 = 32768.0;

/// Whether a machine generates or processes audio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineMode {
    /// Produces audio; accepts no input wires.
    Generator,
    /// Processes audio coming in over its input wires.
    Effect,
}

impl MachineMode {
    pub fn code(self) -> u8 {
        match self {
            MachineMode::Generator => 0,
            MachineMode::Effect => 1,
        }
    }

    pub fn from_code(code: u8) -> Self {
        if code == 0 {
            MachineMode::Generator
        } else {
            MachineMode::Effect
        }
    }
}

/// Type tag of a machine, with the numeric codes used on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MachineType {
    Master,
    Sampler,
    XmSampler,
    Duplicator,
    Mixer,
    Recorder,
    Plugin,
    Vst,
    VstFx,
    Dummy,
}

impl MachineType {
    pub fn code(self) -> i32 {
        match self {
            MachineType::Master => 0,
            MachineType::Sampler => 3,
            MachineType::Plugin => 8,
            MachineType::Vst => 9,
            MachineType::VstFx => 10,
            MachineType::XmSampler => 12,
            MachineType::Duplicator => 13,
            MachineType::Mixer => 14,
            MachineType::Recorder => 15,
            MachineType::Dummy => 255,
        }
    }

    /// Map a stored type code. Codes that only exist in legacy songs
    /// (the old internal effects and the scope) return `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => MachineType::Master,
            3 => MachineType::Sampler,
            8 => MachineType::Plugin,
            9 => MachineType::Vst,
            10 => MachineType::VstFx,
            12 => MachineType::XmSampler,
            13 => MachineType::Duplicator,
            14 => MachineType::Mixer,
            15 => MachineType::Recorder,
            255 => MachineType::Dummy,
            _ => return None,
        })
    }

    /// Types whose behaviour lives in an external plugin library.
    pub fn is_hosted(self) -> bool {
        matches!(self, MachineType::Plugin | MachineType::Vst | MachineType::VstFx)
    }

    pub fn label(self) -> &'static str {
        match self {
            MachineType::Master => "Master",
            MachineType::Sampler => "Sampler",
            MachineType::XmSampler => "Sampulse",
            MachineType::Duplicator => "Note Duplicator",
            MachineType::Mixer => "Send/Return Mixer",
            MachineType::Recorder => "Wave Recorder",
            MachineType::Plugin => "Plugin",
            MachineType::Vst => "VST Instrument",
            MachineType::VstFx => "VST Effect",
            MachineType::Dummy => "Dummy",
        }
    }
}

/// Metadata describing a machine parameter.
pub struct ParamInfo {
    pub name: &'static str,
    pub min: i32,
    pub max: i32,
    pub default: i32,
}

/// Static metadata about a machine behaviour.
pub struct MachineInfo {
    pub name: &'static str,
    pub short_name: &'static str,
    pub mode: MachineMode,
    pub params: &'static [ParamInfo],
}

/// Capability set every machine behaviour provides to the graph.
///
/// Audio processing is not part of this model; the graph only needs the
/// behaviour's mode, its audio range for wire normalization, its parameters,
/// and a way to persist whatever private state it carries.
pub trait MachineBehavior: Send + Sync {
    fn info(&self) -> &MachineInfo;

    fn mode(&self) -> MachineMode {
        self.info().mode
    }

    /// Internal sample scale, used to compute wire multipliers.
    fn audio_range(&self) -> f32 {
        NATIVE_AUDIO_RANGE
    }

    fn init(&mut self) {}

    /// Called once after a whole song finished loading.
    fn post_load(&mut self) {}

    fn num_params(&self) -> usize {
        self.info().params.len()
    }

    fn param(&self, index: usize) -> i32;

    fn set_param(&mut self, index: usize, value: i32);

    /// Append the private state to `out`.
    fn save_state(&self, out: &mut Vec<u8>);

    /// Restore private state written by `save_state`. Returns `false` if the
    /// data was not understood; the behaviour keeps its defaults then.
    fn load_state(&mut self, data: &[u8]) -> bool;
}

/// Failure reported by a [`MachineFactory`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FactoryError {
    #[error("machine type {0:?} cannot be created by this factory")]
    UnsupportedType(MachineType),
    #[error("plugin reference missing")]
    MissingPlugin,
    #[error("plugin `{0}` is not available")]
    PluginUnavailable(String),
    #[error("plugin construction failed: {0}")]
    Construction(String),
}

/// Source of machine behaviours. Plugin hosting sits behind this trait.
pub trait MachineFactory {
    /// Whether `plugin` is present and enabled. Checked before construction.
    fn test_filename(&self, plugin: &str, shell_index: u32) -> bool;

    fn try_create(
        &self,
        kind: MachineType,
        plugin: Option<&str>,
        shell_index: u32,
    ) -> Result<Box<dyn MachineBehavior>, FactoryError>;
}

/// A node of the machine graph.
pub struct Machine {
    pub kind: MachineType,
    pub mode: MachineMode,
    pub x: i32,
    pub y: i32,
    pub edit_name: ArrayString<32>,
    /// Library reference of hosted machines.
    pub plugin: Option<String>,
    pub shell_index: u32,
    pub bypass: bool,
    pub mute: bool,
    /// 0..=128, 64 is centre.
    pub panning: i32,
    /// Feeds a mixer return, directly or through a send chain.
    pub is_mixer_send: bool,
    behavior: Box<dyn MachineBehavior>,
}

impl Machine {
    pub fn new(kind: MachineType, behavior: Box<dyn MachineBehavior>) -> Self {
        let mode = behavior.mode();
        Self {
            kind,
            mode,
            x: 0,
            y: 0,
            edit_name: crate::fixed_name(behavior.info().name),
            plugin: None,
            shell_index: 0,
            bypass: false,
            mute: false,
            panning: 64,
            is_mixer_send: false,
            behavior,
        }
    }

    pub fn behavior(&self) -> &dyn MachineBehavior {
        self.behavior.as_ref()
    }

    pub fn behavior_mut(&mut self) -> &mut dyn MachineBehavior {
        self.behavior.as_mut()
    }

    pub fn audio_range(&self) -> f32 {
        self.behavior.audio_range()
    }

    pub fn is_generator(&self) -> bool {
        self.mode == MachineMode::Generator
    }

    pub fn is_mixer(&self) -> bool {
        self.kind == MachineType::Mixer
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("edit_name", &self.edit_name.as_str())
            .field("plugin", &self.plugin)
            .field("is_mixer_send", &self.is_mixer_send)
            .finish()
    }
}
