//! Machine graph: a slot arena of machines plus a single wire list.
//!
//! Machines are addressed by slot index. Slot [`MASTER_INDEX`] is reserved
//! for the master sink. Wires are stored once, keyed by a stable
//! [`WireKey`]; the per-machine half-edge tables and input/output counts
//! of the file formats are computed views over that list.

use alloc::string::String;
use alloc::vec::Vec;

use slotmap::{new_key_type, SlotMap};

use crate::machine::{FactoryError, Machine, MachineFactory, MachineType};

/// Number of machine slots.
pub const MAX_MACHINES: usize = 256;
/// Slot of the master sink.
pub const MASTER_INDEX: usize = 0;
/// Width of each legacy bus range (generators, effects).
pub const MAX_BUSES: usize = 64;
/// Wire ports per side per machine.
pub const MAX_CONNECTIONS: usize = 12;

new_key_type! {
    /// Stable identity of a wire.
    pub struct WireKey;
}

/// Which kind of destination port a wire lands on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortKind {
    /// Regular input.
    Input,
    /// Return (side chain) input of a send/return mixer.
    Return,
}

/// A destination port: kind plus index within that kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Port {
    Input(usize),
    Return(usize),
}

impl Port {
    pub fn new(kind: PortKind, index: usize) -> Self {
        match kind {
            PortKind::Input => Port::Input(index),
            PortKind::Return => Port::Return(index),
        }
    }

    pub fn kind(self) -> PortKind {
        match self {
            Port::Input(_) => PortKind::Input,
            Port::Return(_) => PortKind::Return,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Port::Input(i) | Port::Return(i) => i,
        }
    }
}

/// A directed connection between two machines.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Wire {
    pub src: usize,
    /// Output port on the source.
    pub src_port: usize,
    pub dst: usize,
    pub dst_port: Port,
    /// Gain as stored, before the multiplier is applied.
    pub gain: f32,
    /// `source audio range / destination audio range`.
    pub multiplier: f32,
}

impl Wire {
    /// Gain as the user sees it.
    pub fn volume(&self) -> f32 {
        self.gain * self.multiplier
    }

    fn touches(&self, slot: usize) -> bool {
        self.src == slot || self.dst == slot
    }
}

/// Input half-edge as stored per machine in song files.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InputHalfEdge {
    pub source: i32,
    pub active: bool,
    pub gain: f32,
    pub multiplier: f32,
}

impl Default for InputHalfEdge {
    fn default() -> Self {
        Self { source: -1, active: false, gain: 1.0, multiplier: 1.0 }
    }
}

/// Output half-edge as stored per machine in song files.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputHalfEdge {
    pub target: i32,
    pub active: bool,
}

impl Default for OutputHalfEdge {
    fn default() -> Self {
        Self { target: -1, active: false }
    }
}

/// Per-machine half-edge tables, the raw form wires take in song files.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WireTable {
    pub inputs: [InputHalfEdge; MAX_CONNECTIONS],
    pub outputs: [OutputHalfEdge; MAX_CONNECTIONS],
    /// Only meaningful on mixers.
    pub returns: [InputHalfEdge; MAX_CONNECTIONS],
}

/// Why a graph edit was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("slot {0} is out of range")]
    SlotOutOfRange(usize),
    #[error("slot {0} is empty")]
    EmptySlot(usize),
    #[error("slot {0} is reserved for the master")]
    SlotReserved(usize),
    #[error("no free machine slot")]
    NoFreeSlot,
    #[error("the master slot is already occupied")]
    MasterOccupied,
    #[error("plugin `{0}` was rejected by the machine factory")]
    PluginRejected(String),
    #[error(transparent)]
    Factory(#[from] FactoryError),
    #[error("machine {0} is a generator and accepts no inputs")]
    GeneratorInput(usize),
    #[error("a machine cannot be wired to itself")]
    SelfConnection,
    #[error("machines {0} and {1} are already connected")]
    AlreadyConnected(usize, usize),
    #[error("mixers cannot feed the returns of another mixer")]
    MixerToMixer,
    #[error("machine {0} is a mixer send and cannot take another output")]
    SourceIsMixerSend(usize),
    #[error("machine {0} cannot feed a mixer send")]
    InvalidMixerSend(usize),
    #[error("machine {0} has no return ports")]
    NotAMixer(usize),
    #[error("no free wire port")]
    NoFreeWire,
    #[error("no such wire")]
    NoSuchWire,
    #[error("machine {0} cannot be exchanged")]
    ExchangeForbidden(usize),
    #[error("cannot clone machine {0} into slot {1}")]
    CloneForbidden(usize, usize),
}

/// The machine arena and its wires.
pub struct MachineGraph {
    slots: Vec<Option<Machine>>,
    wires: SlotMap<WireKey, Wire>,
    /// Raw half-edge tables of freshly loaded machines, consumed by
    /// `post_load_reconcile`.
    pub(crate) pending: Vec<(usize, WireTable)>,
    soloed: Option<usize>,
}

impl Default for MachineGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineGraph {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_MACHINES).map(|_| None).collect(),
            wires: SlotMap::with_key(),
            pending: Vec::new(),
            soloed: None,
        }
    }

    // -----------------------------------------------------------------------
    // Slots
    // -----------------------------------------------------------------------

    pub fn machine(&self, slot: usize) -> Option<&Machine> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn machine_mut(&mut self, slot: usize) -> Option<&mut Machine> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn is_occupied(&self, slot: usize) -> bool {
        self.machine(slot).is_some()
    }

    /// Occupied slots in index order.
    pub fn machines(&self) -> impl Iterator<Item = (usize, &Machine)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.as_ref().map(|m| (i, m)))
    }

    pub fn machine_count(&self) -> usize {
        self.slots.iter().filter(|m| m.is_some()).count()
    }

    pub fn soloed(&self) -> Option<usize> {
        self.soloed
    }

    /// Solo a machine. Ignored for empty slots.
    pub fn set_soloed(&mut self, slot: Option<usize>) {
        self.soloed = slot.filter(|&s| self.is_occupied(s));
    }

    /// Lowest free slot usable by a non-master machine.
    pub fn free_machine(&self) -> Option<usize> {
        (MASTER_INDEX + 1..MAX_MACHINES).find(|&s| !self.is_occupied(s))
    }

    /// Lowest free slot of the generator bus range.
    pub fn free_bus(&self) -> Option<usize> {
        (1..=MAX_BUSES).find(|&s| !self.is_occupied(s))
    }

    /// Lowest free slot of the effect bus range.
    pub fn free_fx_bus(&self) -> Option<usize> {
        (MAX_BUSES + 1..=2 * MAX_BUSES).find(|&s| !self.is_occupied(s))
    }

    fn check_slot(slot: usize) -> Result<(), GraphError> {
        if slot >= MAX_MACHINES {
            return Err(GraphError::SlotOutOfRange(slot));
        }
        Ok(())
    }

    fn occupied(&self, slot: usize) -> Result<&Machine, GraphError> {
        Self::check_slot(slot)?;
        self.machine(slot).ok_or(GraphError::EmptySlot(slot))
    }

    /// Create a machine through `factory` and install it.
    ///
    /// The master always goes to [`MASTER_INDEX`]. Other types take `slot`,
    /// or the lowest free slot when `slot` is `None`. Nothing is mutated
    /// unless construction succeeds; an occupied target slot is then
    /// cleared first.
    #[allow(clippy::too_many_arguments)]
    pub fn create_machine(
        &mut self,
        factory: &dyn MachineFactory,
        kind: MachineType,
        x: i32,
        y: i32,
        plugin: Option<&str>,
        slot: Option<usize>,
        shell_index: u32,
    ) -> Result<usize, GraphError> {
        let slot = if kind == MachineType::Master {
            if self.is_occupied(MASTER_INDEX) {
                return Err(GraphError::MasterOccupied);
            }
            MASTER_INDEX
        } else {
            match slot {
                Some(MASTER_INDEX) => return Err(GraphError::SlotReserved(MASTER_INDEX)),
                Some(s) => {
                    Self::check_slot(s)?;
                    s
                }
                None => self.free_machine().ok_or(GraphError::NoFreeSlot)?,
            }
        };

        if kind.is_hosted() {
            let name = plugin.ok_or(GraphError::Factory(FactoryError::MissingPlugin))?;
            if !factory.test_filename(name, shell_index) {
                return Err(GraphError::PluginRejected(String::from(name)));
            }
        }

        let behavior = factory.try_create(kind, plugin, shell_index).map_err(|e| {
            log::warn!("[GRAPH] creating {:?} in slot {} failed: {}", kind, slot, e);
            GraphError::from(e)
        })?;

        let mut machine = Machine::new(kind, behavior);
        machine.x = x;
        machine.y = y;
        if let Some(name) = plugin {
            machine.plugin = Some(String::from(name));
            machine.shell_index = shell_index;
            machine.edit_name = crate::fixed_name(plugin_display_name(name));
        }
        machine.behavior_mut().init();

        self.destroy_machine(slot);
        self.slots[slot] = Some(machine);
        log::debug!("[GRAPH] created {:?} in slot {}", kind, slot);
        Ok(slot)
    }

    /// Put an already built machine into `slot`, replacing any occupant.
    pub fn install(&mut self, slot: usize, machine: Machine) -> Result<(), GraphError> {
        Self::check_slot(slot)?;
        self.destroy_machine(slot);
        self.slots[slot] = Some(machine);
        Ok(())
    }

    /// Remove a machine with all its wires. Empty slots are ignored.
    pub fn destroy_machine(&mut self, slot: usize) {
        if !self.is_occupied(slot) {
            return;
        }
        self.delete_wires(slot);
        if self.soloed == Some(slot) {
            self.soloed = None;
        }
        self.slots[slot] = None;
    }

    pub fn destroy_all(&mut self) {
        for slot in 0..MAX_MACHINES {
            self.destroy_machine(slot);
        }
        self.wires.clear();
        self.pending.clear();
        self.soloed = None;
    }

    pub(crate) fn swap_slots(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
    }

    pub(crate) fn take_slot(&mut self, slot: usize) -> Option<Machine> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    // -----------------------------------------------------------------------
    // Wire views
    // -----------------------------------------------------------------------

    pub fn wire(&self, key: WireKey) -> Option<&Wire> {
        self.wires.get(key)
    }

    pub fn wires(&self) -> impl Iterator<Item = (WireKey, &Wire)> + '_ {
        self.wires.iter()
    }

    pub(crate) fn wire_mut(&mut self, key: WireKey) -> Option<&mut Wire> {
        self.wires.get_mut(key)
    }

    pub(crate) fn wires_mut(&mut self) -> impl Iterator<Item = (WireKey, &mut Wire)> + '_ {
        self.wires.iter_mut()
    }

    pub fn wire_count(&self) -> usize {
        self.wires.len()
    }

    /// Wires leaving `slot`.
    pub fn outputs(&self, slot: usize) -> impl Iterator<Item = (WireKey, &Wire)> + '_ {
        self.wires.iter().filter(move |(_, w)| w.src == slot)
    }

    /// Wires arriving at `slot`, regular inputs and returns.
    pub fn inputs(&self, slot: usize) -> impl Iterator<Item = (WireKey, &Wire)> + '_ {
        self.wires.iter().filter(move |(_, w)| w.dst == slot)
    }

    pub fn num_outputs(&self, slot: usize) -> usize {
        self.outputs(slot).count()
    }

    pub fn num_inputs(&self, slot: usize) -> usize {
        self.inputs(slot)
            .filter(|(_, w)| w.dst_port.kind() == PortKind::Input)
            .count()
    }

    pub fn num_returns(&self, slot: usize) -> usize {
        self.inputs(slot)
            .filter(|(_, w)| w.dst_port.kind() == PortKind::Return)
            .count()
    }

    pub fn wire_between(&self, src: usize, dst: usize) -> Option<WireKey> {
        self.wires
            .iter()
            .find(|(_, w)| w.src == src && w.dst == dst)
            .map(|(k, _)| k)
    }

    /// Output port of `src` that feeds `dst`.
    pub fn find_output_wire(&self, src: usize, dst: usize) -> Option<usize> {
        self.wire_between(src, dst).map(|k| self.wires[k].src_port)
    }

    /// Port of `dst` fed by `src`.
    pub fn find_input_wire(&self, dst: usize, src: usize) -> Option<Port> {
        self.wire_between(src, dst).map(|k| self.wires[k].dst_port)
    }

    fn wire_at_output(&self, src: usize, src_port: usize) -> Option<WireKey> {
        self.wires
            .iter()
            .find(|(_, w)| w.src == src && w.src_port == src_port)
            .map(|(k, _)| k)
    }

    fn wire_at_input(&self, dst: usize, port: Port) -> Option<WireKey> {
        self.wires
            .iter()
            .find(|(_, w)| w.dst == dst && w.dst_port == port)
            .map(|(k, _)| k)
    }

    pub fn free_output_port(&self, slot: usize) -> Option<usize> {
        (0..MAX_CONNECTIONS).find(|&p| self.wire_at_output(slot, p).is_none())
    }

    pub fn free_input_port(&self, slot: usize, kind: PortKind) -> Option<usize> {
        (0..MAX_CONNECTIONS).find(|&p| self.wire_at_input(slot, Port::new(kind, p)).is_none())
    }

    /// User-visible volume of the wire landing on `port` of `dst`.
    pub fn wire_volume(&self, dst: usize, port: Port) -> Option<f32> {
        self.wire_at_input(dst, port).map(|k| self.wires[k].volume())
    }

    pub fn set_wire_volume(&mut self, dst: usize, port: Port, volume: f32) -> bool {
        match self.wire_at_input(dst, port) {
            Some(k) => {
                let w = &mut self.wires[k];
                w.gain = volume / w.multiplier;
                true
            }
            None => false,
        }
    }

    /// Half-edge tables of `slot` as they are written to song files.
    pub fn wire_table(&self, slot: usize) -> WireTable {
        let mut table = WireTable::default();
        for (_, w) in self.wires.iter() {
            if w.src == slot && w.src_port < MAX_CONNECTIONS {
                table.outputs[w.src_port] = OutputHalfEdge { target: w.dst as i32, active: true };
            }
            if w.dst == slot {
                let entry = InputHalfEdge {
                    source: w.src as i32,
                    active: true,
                    gain: w.gain,
                    multiplier: w.multiplier,
                };
                match w.dst_port {
                    Port::Input(i) if i < MAX_CONNECTIONS => table.inputs[i] = entry,
                    Port::Return(i) if i < MAX_CONNECTIONS => table.returns[i] = entry,
                    _ => {}
                }
            }
        }
        table
    }

    // -----------------------------------------------------------------------
    // Wire edits
    // -----------------------------------------------------------------------

    fn multiplier(&self, src: usize, dst: usize) -> f32 {
        match (self.machine(src), self.machine(dst)) {
            (Some(s), Some(d)) if d.audio_range() != 0.0 => s.audio_range() / d.audio_range(),
            _ => 1.0,
        }
    }

    pub(crate) fn link(
        &mut self,
        src: usize,
        src_port: usize,
        dst: usize,
        dst_port: Port,
        gain: f32,
        multiplier: f32,
    ) -> WireKey {
        self.wires.insert(Wire { src, src_port, dst, dst_port, gain, multiplier })
    }

    /// Feeding a return or a send chain turns the source into a mixer send.
    fn mark_send_source(&mut self, src: usize, dst: usize, port: Port) {
        let feeds_send = port.kind() == PortKind::Return
            || self.machine(dst).is_some_and(|m| m.is_mixer_send);
        if feeds_send {
            if let Some(m) = self.machine_mut(src) {
                m.is_mixer_send = true;
            }
        }
    }

    /// Shared checks of connection and rewiring edits.
    fn check_connection(
        &self,
        src: usize,
        dst: usize,
        kind: PortKind,
        rewiring: bool,
    ) -> Result<(), GraphError> {
        let src_m = self.occupied(src)?;
        let dst_m = self.occupied(dst)?;
        if src == dst {
            return Err(GraphError::SelfConnection);
        }
        if dst_m.is_generator() {
            return Err(GraphError::GeneratorInput(dst));
        }
        if self.wire_between(src, dst).is_some() || self.wire_between(dst, src).is_some() {
            return Err(GraphError::AlreadyConnected(src, dst));
        }
        if kind == PortKind::Return && !dst_m.is_mixer() {
            return Err(GraphError::NotAMixer(dst));
        }
        if src_m.is_mixer() && dst_m.is_mixer() && kind != PortKind::Input {
            return Err(GraphError::MixerToMixer);
        }
        if src_m.is_mixer_send && !rewiring {
            return Err(GraphError::SourceIsMixerSend(src));
        }
        let into_send = dst_m.is_mixer_send || (kind == PortKind::Return && dst_m.is_mixer());
        if into_send && !self.validate_mixer_send_candidate(src, rewiring) {
            return Err(GraphError::InvalidMixerSend(src));
        }
        Ok(())
    }

    /// Wire `src` into `dst` with the given user-visible volume.
    ///
    /// Performs no locking. Returns the destination port index.
    pub fn insert_connection(
        &mut self,
        src: usize,
        dst: usize,
        kind: PortKind,
        volume: f32,
    ) -> Result<usize, GraphError> {
        self.check_connection(src, dst, kind, false)?;
        let src_port = self.free_output_port(src).ok_or(GraphError::NoFreeWire)?;
        let dst_index = self.free_input_port(dst, kind).ok_or(GraphError::NoFreeWire)?;
        let port = Port::new(kind, dst_index);
        let multiplier = self.multiplier(src, dst);
        self.link(src, src_port, dst, port, volume / multiplier, multiplier);
        self.mark_send_source(src, dst, port);
        log::debug!("[GRAPH] wired {} -> {} ({:?})", src, dst, port);
        Ok(dst_index)
    }

    pub fn delete_wire(&mut self, key: WireKey) -> Option<Wire> {
        let wire = self.wires.remove(key)?;
        let fed_send = wire.dst_port.kind() == PortKind::Return
            || self.machine(wire.dst).is_some_and(|m| m.is_mixer_send);
        if fed_send {
            if let Some(m) = self.machine_mut(wire.src) {
                m.is_mixer_send = false;
            }
        }
        Some(wire)
    }

    /// Remove the wire from `src` to `dst`, if any.
    pub fn disconnect(&mut self, src: usize, dst: usize) -> bool {
        match self.wire_between(src, dst) {
            Some(k) => self.delete_wire(k).is_some(),
            None => false,
        }
    }

    /// Remove every wire touching `slot`, in both directions.
    pub fn delete_wires(&mut self, slot: usize) {
        let keys: Vec<WireKey> = self
            .wires
            .iter()
            .filter(|(_, w)| w.touches(slot))
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            self.delete_wire(key);
        }
    }

    /// Move the wire on output `src_port` of `src` over to `new_dst`,
    /// keeping its volume. Returns the new destination port index.
    pub fn change_wire_dest(
        &mut self,
        src: usize,
        new_dst: usize,
        src_port: usize,
        kind: PortKind,
    ) -> Result<usize, GraphError> {
        let key = self.wire_at_output(src, src_port).ok_or(GraphError::NoSuchWire)?;
        self.check_connection(src, new_dst, kind, true)?;
        let dst_index = self.free_input_port(new_dst, kind).ok_or(GraphError::NoFreeWire)?;

        let old = self.delete_wire(key).ok_or(GraphError::NoSuchWire)?;
        let port = Port::new(kind, dst_index);
        let multiplier = self.multiplier(src, new_dst);
        self.link(src, src_port, new_dst, port, old.volume() / multiplier, multiplier);
        self.mark_send_source(src, new_dst, port);
        Ok(dst_index)
    }

    /// Move the wire landing on `port` of `dst` so that it comes from
    /// `new_src`, keeping its volume. Returns the new source port index.
    pub fn change_wire_source(
        &mut self,
        new_src: usize,
        dst: usize,
        port: Port,
    ) -> Result<usize, GraphError> {
        let key = self.wire_at_input(dst, port).ok_or(GraphError::NoSuchWire)?;
        self.check_connection(new_src, dst, port.kind(), false)?;
        let src_port = self.free_output_port(new_src).ok_or(GraphError::NoFreeWire)?;

        let old = self.delete_wire(key).ok_or(GraphError::NoSuchWire)?;
        let multiplier = self.multiplier(new_src, dst);
        self.link(new_src, src_port, dst, port, old.volume() / multiplier, multiplier);
        self.mark_send_source(new_src, dst, port);
        Ok(src_port)
    }

    /// Whether `slot` may feed a mixer send.
    ///
    /// No generator may sit anywhere upstream, and no upstream machine may
    /// have more than one output. `rewiring` allows the single output the
    /// candidate already has.
    pub fn validate_mixer_send_candidate(&self, slot: usize, rewiring: bool) -> bool {
        let mut visited = [false; MAX_MACHINES];
        self.send_candidate(slot, rewiring, &mut visited)
    }

    fn send_candidate(&self, slot: usize, rewiring: bool, visited: &mut [bool]) -> bool {
        let Some(m) = self.machine(slot) else {
            return false;
        };
        if m.is_generator() || visited[slot] {
            return false;
        }
        visited[slot] = true;
        let outputs = self.num_outputs(slot);
        if outputs > 1 || (outputs > 0 && !rewiring) {
            return false;
        }
        let upstream: Vec<usize> = self
            .inputs(slot)
            .filter(|(_, w)| w.dst_port.kind() == PortKind::Input)
            .map(|(_, w)| w.src)
            .collect();
        upstream.into_iter().all(|src| self.send_candidate(src, true, visited))
    }
}

/// Display name of a plugin reference: file stem without directories.
fn plugin_display_name(reference: &str) -> &str {
    let file = reference.rsplit(['/', '\\']).next().unwrap_or(reference);
    match file.rfind('.') {
        Some(dot) if dot > 0 => &file[..dot],
        _ => file,
    }
}
