//! Dummy machine: placeholder for machines that could not be created.
//!
//! Keeps the slot, the generator/effect mode and the stored private state
//! of the machine it replaces, so saving the song again loses nothing.

use alloc::vec::Vec;

use crate::machine::{MachineBehavior, MachineInfo, MachineMode};

static INFO: MachineInfo = MachineInfo {
    name: "Dummy",
    short_name: "Dummy",
    mode: MachineMode::Effect,
    params: &[],
};

pub struct DummyMachine {
    mode: MachineMode,
    state: Vec<u8>,
}

impl DummyMachine {
    pub fn new(mode: MachineMode) -> Self {
        Self { mode, state: Vec::new() }
    }

    /// Placeholder carrying the opaque state of the machine it stands for.
    pub fn preserving(mode: MachineMode, state: Vec<u8>) -> Self {
        Self { mode, state }
    }
}

impl MachineBehavior for DummyMachine {
    fn info(&self) -> &MachineInfo {
        &INFO
    }

    fn mode(&self) -> MachineMode {
        self.mode
    }

    fn param(&self, _index: usize) -> i32 {
        0
    }

    fn set_param(&mut self, _index: usize, _value: i32) {}

    fn save_state(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.state);
    }

    fn load_state(&mut self, data: &[u8]) -> bool {
        self.state = data.to_vec();
        true
    }
}
