//! Internal machines: master, samplers, duplicator, mixer, recorder.
//!
//! Only their parameter sets matter to the song model.

use alloc::vec::Vec;

use super::{load_params, save_params};
use crate::machine::{MachineBehavior, MachineInfo, MachineMode, MachineType, ParamInfo};

static MASTER_INFO: MachineInfo = MachineInfo {
    name: "Master",
    short_name: "Master",
    mode: MachineMode::Effect,
    params: &[ParamInfo { name: "Output", min: 0, max: 1024, default: 256 }],
};

static SAMPLER_INFO: MachineInfo = MachineInfo {
    name: "Sampler",
    short_name: "Smp",
    mode: MachineMode::Generator,
    params: &[
        ParamInfo { name: "Voices", min: 2, max: 16, default: 8 },
        ParamInfo { name: "Resampler", min: 0, max: 3, default: 1 },
    ],
};

static XM_SAMPLER_INFO: MachineInfo = MachineInfo {
    name: "Sampulse",
    short_name: "Xms",
    mode: MachineMode::Generator,
    params: &[
        ParamInfo { name: "Voices", min: 2, max: 64, default: 16 },
        ParamInfo { name: "Resampler", min: 0, max: 3, default: 1 },
        ParamInfo { name: "Amiga slides", min: 0, max: 1, default: 0 },
    ],
};

static DUPLICATOR_INFO: MachineInfo = MachineInfo {
    name: "Note Duplicator",
    short_name: "Dup",
    mode: MachineMode::Generator,
    params: &[
        ParamInfo { name: "Output 1", min: -1, max: 255, default: -1 },
        ParamInfo { name: "Output 2", min: -1, max: 255, default: -1 },
        ParamInfo { name: "Output 3", min: -1, max: 255, default: -1 },
        ParamInfo { name: "Output 4", min: -1, max: 255, default: -1 },
        ParamInfo { name: "Offset 1", min: -48, max: 48, default: 0 },
        ParamInfo { name: "Offset 2", min: -48, max: 48, default: 0 },
        ParamInfo { name: "Offset 3", min: -48, max: 48, default: 0 },
        ParamInfo { name: "Offset 4", min: -48, max: 48, default: 0 },
    ],
};

static MIXER_INFO: MachineInfo = MachineInfo {
    name: "Send/Return Mixer",
    short_name: "Mix",
    mode: MachineMode::Effect,
    params: &[
        ParamInfo { name: "Master", min: 0, max: 1024, default: 1024 },
        ParamInfo { name: "Solo", min: -1, max: 11, default: -1 },
    ],
};

static RECORDER_INFO: MachineInfo = MachineInfo {
    name: "Wave Recorder",
    short_name: "Rec",
    mode: MachineMode::Effect,
    params: &[ParamInfo { name: "Gain", min: 0, max: 1024, default: 256 }],
};

fn info_for(kind: MachineType) -> &'static MachineInfo {
    match kind {
        MachineType::Master => &MASTER_INFO,
        MachineType::Sampler => &SAMPLER_INFO,
        MachineType::XmSampler => &XM_SAMPLER_INFO,
        MachineType::Duplicator => &DUPLICATOR_INFO,
        MachineType::Mixer => &MIXER_INFO,
        _ => &RECORDER_INFO,
    }
}

/// Parameter-only stand-in for an internal machine type.
pub struct InternalMachine {
    info: &'static MachineInfo,
    params: Vec<i32>,
}

impl InternalMachine {
    pub fn new(kind: MachineType) -> Self {
        let info = info_for(kind);
        Self {
            info,
            params: info.params.iter().map(|p| p.default).collect(),
        }
    }
}

impl MachineBehavior for InternalMachine {
    fn info(&self) -> &MachineInfo {
        self.info
    }

    fn param(&self, index: usize) -> i32 {
        self.params.get(index).copied().unwrap_or(0)
    }

    fn set_param(&mut self, index: usize, value: i32) {
        if let (Some(slot), Some(p)) = (self.params.get_mut(index), self.info.params.get(index)) {
            *slot = value.clamp(p.min, p.max);
        }
    }

    fn save_state(&self, out: &mut Vec<u8>) {
        save_params(&self.params, out);
    }

    fn load_state(&mut self, data: &[u8]) -> bool {
        load_params(&mut self.params, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_come_from_param_info() {
        let m = InternalMachine::new(MachineType::Sampler);
        assert_eq!(m.param(0), 8);
        assert_eq!(m.param(1), 1);
    }

    #[test]
    fn set_param_clamps_to_range() {
        let mut m = InternalMachine::new(MachineType::Sampler);
        m.set_param(0, 99);
        assert_eq!(m.param(0), 16);
    }

    #[test]
    fn state_survives_save_and_load() {
        let mut m = InternalMachine::new(MachineType::Duplicator);
        m.set_param(0, 5);
        m.set_param(4, -12);
        let mut state = Vec::new();
        m.save_state(&mut state);

        let mut restored = InternalMachine::new(MachineType::Duplicator);
        assert!(restored.load_state(&state));
        assert_eq!(restored.param(0), 5);
        assert_eq!(restored.param(4), -12);
    }
}
