//! Proxy for a plugin listed in the factory catalogue.

use alloc::vec;
use alloc::vec::Vec;

use super::{load_params, save_params, PluginDescriptor};
use crate::machine::{MachineBehavior, MachineInfo, MachineMode, MachineType, NATIVE_AUDIO_RANGE};

static NATIVE_INFO: MachineInfo = MachineInfo {
    name: "Plugin",
    short_name: "Plug",
    mode: MachineMode::Effect,
    params: &[],
};

static VST_INFO: MachineInfo = MachineInfo {
    name: "VST",
    short_name: "Vst",
    mode: MachineMode::Effect,
    params: &[],
};

pub struct HostedPlugin {
    mode: MachineMode,
    vst: bool,
    params: Vec<i32>,
}

impl HostedPlugin {
    pub fn new(descriptor: &PluginDescriptor, kind: MachineType) -> Self {
        let mode = match kind {
            MachineType::Vst => MachineMode::Generator,
            MachineType::VstFx => MachineMode::Effect,
            _ => descriptor.mode,
        };
        Self {
            mode,
            vst: matches!(kind, MachineType::Vst | MachineType::VstFx),
            params: vec![0; descriptor.num_params],
        }
    }
}

impl MachineBehavior for HostedPlugin {
    fn info(&self) -> &MachineInfo {
        if self.vst {
            &VST_INFO
        } else {
            &NATIVE_INFO
        }
    }

    fn mode(&self) -> MachineMode {
        self.mode
    }

    fn audio_range(&self) -> f32 {
        if self.vst {
            1.0
        } else {
            NATIVE_AUDIO_RANGE
        }
    }

    fn num_params(&self) -> usize {
        self.params.len()
    }

    fn param(&self, index: usize) -> i32 {
        self.params.get(index).copied().unwrap_or(0)
    }

    fn set_param(&mut self, index: usize, value: i32) {
        if let Some(slot) = self.params.get_mut(index) {
            *slot = value;
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
    fn vst_works_in_unit_range() {
        let d = PluginDescriptor::new("synth.dll", MachineMode::Effect, 2);
        let vst = HostedPlugin::new(&d, MachineType::Vst);
        assert_eq!(vst.audio_range(), 1.0);
        assert_eq!(vst.mode(), MachineMode::Generator);
        let native = HostedPlugin::new(&d, MachineType::Plugin);
        assert_eq!(native.audio_range(), NATIVE_AUDIO_RANGE);
        assert_eq!(native.num_params(), 2);
    }
}
