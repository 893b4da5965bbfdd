//! Whole-machine graph edits: exchange, replace, clone, and the post-load
//! pass that turns raw half-edge tables into wires.

use alloc::format;
use alloc::vec::Vec;

use crate::graph::{
    GraphError, MachineGraph, Port, PortKind, WireKey, WireTable, MASTER_INDEX, MAX_MACHINES,
};
use crate::machine::{Machine, MachineFactory, MachineType};

/// Offset of a cloned machine from its original.
pub const CLONE_OFFSET: (i32, i32) = (32, 8);

/// Outcome of [`MachineGraph::post_load_reconcile`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Wires present after the pass.
    pub wires: usize,
    /// Half-edges thrown away because they did not pair up.
    pub dropped_half_edges: usize,
}

impl MachineGraph {
    /// Swap the machines of two slots.
    ///
    /// Positions and wires stay with the slots; only the behaviours move.
    /// With one side empty this is a move, and the machine takes its
    /// wires and position along. Mixers, mixer sends and the master
    /// cannot be exchanged.
    pub fn exchange_machines(&mut self, a: usize, b: usize) -> Result<(), GraphError> {
        for slot in [a, b] {
            if slot >= MAX_MACHINES {
                return Err(GraphError::SlotOutOfRange(slot));
            }
            if slot == MASTER_INDEX {
                return Err(GraphError::ExchangeForbidden(slot));
            }
            if let Some(m) = self.machine(slot) {
                if m.is_mixer() || m.is_mixer_send || m.kind == MachineType::Master {
                    return Err(GraphError::ExchangeForbidden(slot));
                }
            }
        }
        if a == b {
            return Ok(());
        }

        match (self.is_occupied(a), self.is_occupied(b)) {
            (true, true) => {
                let pa = self.machine(a).map(|m| (m.x, m.y));
                let pb = self.machine(b).map(|m| (m.x, m.y));
                self.swap_slots(a, b);
                if let (Some((ax, ay)), Some(m)) = (pa, self.machine_mut(a)) {
                    m.x = ax;
                    m.y = ay;
                }
                if let (Some((bx, by)), Some(m)) = (pb, self.machine_mut(b)) {
                    m.x = bx;
                    m.y = by;
                }
                self.rescale_wires(&[a, b]);
            }
            (true, false) => self.move_machine(a, b),
            (false, true) => self.move_machine(b, a),
            (false, false) => return Ok(()),
        }

        let soloed = self.soloed().map(|s| match s {
            s if s == a => b,
            s if s == b => a,
            s => s,
        });
        self.set_soloed(soloed);
        Ok(())
    }

    fn move_machine(&mut self, from: usize, to: usize) {
        self.swap_slots(from, to);
        for (_, w) in self.wires_mut() {
            if w.src == from {
                w.src = to;
            }
            if w.dst == from {
                w.dst = to;
            }
        }
    }

    /// Recompute multipliers of wires touching `slots`, keeping volumes.
    fn rescale_wires(&mut self, slots: &[usize]) {
        let range = |g: &MachineGraph, s: usize| g.machine(s).map_or(1.0, Machine::audio_range);
        let updates: Vec<(WireKey, f32)> = self
            .wires()
            .filter(|(_, w)| slots.contains(&w.src) || slots.contains(&w.dst))
            .map(|(k, w)| {
                let dst_range = range(self, w.dst);
                let m = if dst_range != 0.0 { range(self, w.src) / dst_range } else { 1.0 };
                (k, m)
            })
            .collect();
        for (key, multiplier) in updates {
            if let Some(w) = self.wire_mut(key) {
                if w.multiplier != multiplier {
                    let volume = w.volume();
                    w.multiplier = multiplier;
                    w.gain = volume / multiplier;
                }
            }
        }
    }

    /// Replace the machine in `slot` with a new one of `kind`, replaying
    /// its connections with their volumes onto the new machine.
    #[allow(clippy::too_many_arguments)]
    pub fn replace_machine(
        &mut self,
        factory: &dyn MachineFactory,
        slot: usize,
        kind: MachineType,
        x: i32,
        y: i32,
        plugin: Option<&str>,
        shell_index: u32,
    ) -> Result<usize, GraphError> {
        let inputs: Vec<(usize, PortKind, f32)> = self
            .inputs(slot)
            .map(|(_, w)| (w.src, w.dst_port.kind(), w.volume()))
            .collect();
        let outputs: Vec<(usize, PortKind, f32)> = self
            .outputs(slot)
            .map(|(_, w)| (w.dst, w.dst_port.kind(), w.volume()))
            .collect();

        let slot = self.create_machine(factory, kind, x, y, plugin, Some(slot), shell_index)?;

        for (src, port, volume) in inputs {
            if let Err(e) = self.insert_connection(src, slot, port, volume) {
                log::debug!("[GRAPH] replace: input from {} not restored: {}", src, e);
            }
        }
        for (dst, port, volume) in outputs {
            if let Err(e) = self.insert_connection(slot, dst, port, volume) {
                log::debug!("[GRAPH] replace: output to {} not restored: {}", dst, e);
            }
        }
        Ok(slot)
    }

    /// Copy the machine in `src` into the empty slot `dst`.
    ///
    /// Arguments given the other way round are swapped. Wires are not
    /// copied; the copy is offset by [`CLONE_OFFSET`] and gets a numbered
    /// edit name.
    pub fn clone_machine(
        &mut self,
        factory: &dyn MachineFactory,
        src: usize,
        dst: usize,
    ) -> Result<usize, GraphError> {
        let (src, dst) = if !self.is_occupied(src) && self.is_occupied(dst) {
            (dst, src)
        } else {
            (src, dst)
        };
        if src >= MAX_MACHINES || dst >= MAX_MACHINES {
            return Err(GraphError::SlotOutOfRange(src.max(dst)));
        }
        if src == dst || dst == MASTER_INDEX || src == MASTER_INDEX || self.is_occupied(dst) {
            return Err(GraphError::CloneForbidden(src, dst));
        }
        let original = self.machine(src).ok_or(GraphError::EmptySlot(src))?;

        let mut behavior =
            factory.try_create(original.kind, original.plugin.as_deref(), original.shell_index)?;
        let mut state = Vec::new();
        original.behavior().save_state(&mut state);
        if !behavior.load_state(&state) {
            log::warn!("[GRAPH] clone of slot {} rejected the stored state, keeping defaults", src);
        }

        let mut copy = Machine::new(original.kind, behavior);
        copy.mode = original.mode;
        copy.x = original.x + CLONE_OFFSET.0;
        copy.y = original.y + CLONE_OFFSET.1;
        copy.plugin = original.plugin.clone();
        copy.shell_index = original.shell_index;
        copy.bypass = original.bypass;
        copy.mute = original.mute;
        copy.panning = original.panning;
        copy.edit_name = self.numbered_name(original.edit_name.as_str());
        copy.behavior_mut().init();

        self.install(dst, copy)?;
        Ok(dst)
    }

    /// `"base N"` with the lowest N >= 2 not used by any machine.
    fn numbered_name(&self, name: &str) -> arrayvec::ArrayString<32> {
        let base = match name.rsplit_once(' ') {
            Some((head, tail)) if !head.is_empty() && tail.parse::<u32>().is_ok() => head,
            _ => name,
        };
        let mut n = 2u32;
        loop {
            let candidate = crate::fixed_name::<32>(&format!("{} {}", base, n));
            if !self.machines().any(|(_, m)| m.edit_name == candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Install a machine read from a song file together with its raw
    /// half-edge tables. Wires appear in [`post_load_reconcile`].
    ///
    /// [`post_load_reconcile`]: MachineGraph::post_load_reconcile
    pub fn install_loaded(
        &mut self,
        slot: usize,
        machine: Machine,
        table: WireTable,
    ) -> Result<(), GraphError> {
        self.install(slot, machine)?;
        self.pending.retain(|(s, _)| *s != slot);
        self.pending.push((slot, table));
        Ok(())
    }

    /// Turn the pending half-edge tables into wires.
    ///
    /// Existing wires pointing at empty slots are removed. A pending output
    /// half-edge becomes a wire only if the target holds a matching active
    /// input (or return) half-edge pointing back; everything else is
    /// dropped: out-of-range indices, empty slots, self loops, duplicates
    /// and half-edges without a partner.
    pub fn post_load_reconcile(&mut self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let stale: Vec<_> = self
            .wires()
            .filter(|(_, w)| !self.is_occupied(w.src) || !self.is_occupied(w.dst) || w.src == w.dst)
            .map(|(k, _)| k)
            .collect();
        for key in stale {
            self.delete_wire(key);
            report.dropped_half_edges += 2;
        }

        let mut pending = core::mem::take(&mut self.pending);
        pending.sort_by_key(|(slot, _)| *slot);
        let valid = |graph: &MachineGraph, owner: usize, other: i32| -> Option<usize> {
            let other = usize::try_from(other).ok()?;
            (other < MAX_MACHINES && other != owner && graph.is_occupied(other)).then_some(other)
        };

        // Claimed input / return entries, per pending table.
        let mut claimed: Vec<([bool; crate::MAX_CONNECTIONS], [bool; crate::MAX_CONNECTIONS])> =
            pending.iter().map(|_| Default::default()).collect();

        for i in 0..pending.len() {
            let (src, table) = pending[i];
            if !self.is_occupied(src) {
                continue;
            }
            for (port, out) in table.outputs.iter().enumerate() {
                if !out.active {
                    continue;
                }
                let Some(dst) = valid(self, src, out.target) else {
                    report.dropped_half_edges += 1;
                    continue;
                };
                if self.wire_between(src, dst).is_some() || self.wire_between(dst, src).is_some() {
                    report.dropped_half_edges += 1;
                    continue;
                }
                let Some(j) = pending.iter().position(|(s, _)| *s == dst) else {
                    report.dropped_half_edges += 1;
                    continue;
                };
                let target = &pending[j].1;
                let partner = target
                    .inputs
                    .iter()
                    .enumerate()
                    .find(|(k, e)| e.active && e.source == src as i32 && !claimed[j].0[*k])
                    .map(|(k, e)| (Port::Input(k), *e))
                    .or_else(|| {
                        target
                            .returns
                            .iter()
                            .enumerate()
                            .find(|(k, e)| e.active && e.source == src as i32 && !claimed[j].1[*k])
                            .map(|(k, e)| (Port::Return(k), *e))
                    });
                let Some((dst_port, entry)) = partner else {
                    report.dropped_half_edges += 1;
                    continue;
                };
                match dst_port {
                    Port::Input(k) => claimed[j].0[k] = true,
                    Port::Return(k) => claimed[j].1[k] = true,
                }
                let multiplier = if entry.multiplier.is_finite() && entry.multiplier != 0.0 {
                    entry.multiplier
                } else {
                    1.0
                };
                self.link(src, port, dst, dst_port, entry.gain, multiplier);
            }
        }

        for (i, (_, table)) in pending.iter().enumerate() {
            let unpaired_inputs = table
                .inputs
                .iter()
                .enumerate()
                .filter(|(k, e)| e.active && !claimed[i].0[*k])
                .count();
            let unpaired_returns = table
                .returns
                .iter()
                .enumerate()
                .filter(|(k, e)| e.active && !claimed[i].1[*k])
                .count();
            report.dropped_half_edges += unpaired_inputs + unpaired_returns;
        }

        report.wires = self.wire_count();
        if report.dropped_half_edges > 0 {
            log::warn!(
                "[GRAPH] reconcile dropped {} dangling half-edges",
                report.dropped_half_edges
            );
        }
        report
    }

    /// Flag every machine feeding a mixer return as a mixer send. Machines
    /// further upstream are left alone.
    pub fn restore_mixer_send_flags(&mut self) {
        let senders: Vec<usize> = self
            .wires()
            .filter(|(_, w)| {
                w.dst_port.kind() == PortKind::Return
                    && self.machine(w.dst).is_some_and(Machine::is_mixer)
            })
            .map(|(_, w)| w.src)
            .collect();
        for slot in senders {
            if let Some(m) = self.machine_mut(slot) {
                m.is_mixer_send = true;
            }
        }
    }

    /// Run the per-machine post-load hooks.
    pub fn post_load(&mut self) {
        for slot in 0..MAX_MACHINES {
            if let Some(m) = self.machine_mut(slot) {
                m.behavior_mut().post_load();
            }
        }
    }

    /// Remove a machine without touching the wires. Loaders use this while
    /// moving raw slots around before any wire exists.
    pub fn take_machine(&mut self, slot: usize) -> Option<Machine> {
        self.pending.retain(|(s, _)| *s != slot);
        self.take_slot(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InputHalfEdge, OutputHalfEdge};
    use alloc::boxed::Box;
    use alloc::string::String;
    use crate::machine::{MachineBehavior, MachineInfo, MachineMode};
    use crate::machines::{BuiltinFactory, PluginDescriptor};

    fn factory() -> BuiltinFactory {
        BuiltinFactory::new()
            .with_plugin(PluginDescriptor::new("delay.dll", MachineMode::Effect, 4))
            .with_plugin(PluginDescriptor::new("reverb.dll", MachineMode::Effect, 4))
            .with_plugin(PluginDescriptor::new("vfx.dll", MachineMode::Effect, 0))
    }

    /// master <- fx(65) <- gen(1), master <- gen(2)
    fn small_graph(f: &BuiltinFactory) -> MachineGraph {
        let mut g = MachineGraph::new();
        g.create_machine(f, MachineType::Master, 320, 200, None, None, 0).unwrap();
        g.create_machine(f, MachineType::Sampler, 10, 20, None, Some(1), 0).unwrap();
        g.create_machine(f, MachineType::Sampler, 30, 40, None, Some(2), 0).unwrap();
        g.create_machine(f, MachineType::Plugin, 50, 60, Some("delay.dll"), Some(65), 0)
            .unwrap();
        g.insert_connection(1, 65, PortKind::Input, 0.5).unwrap();
        g.insert_connection(65, MASTER_INDEX, PortKind::Input, 0.75).unwrap();
        g.insert_connection(2, MASTER_INDEX, PortKind::Input, 1.0).unwrap();
        g
    }

    type Snapshot = (usize, MachineType, Option<String>, i32, i32, WireTable);

    fn snapshot(g: &MachineGraph) -> Vec<Snapshot> {
        g.machines()
            .map(|(s, m)| (s, m.kind, m.plugin.clone(), m.x, m.y, g.wire_table(s)))
            .collect()
    }

    #[test]
    fn exchange_twice_is_identity() {
        let f = factory();
        let mut g = small_graph(&f);
        g.create_machine(&f, MachineType::Plugin, 70, 80, Some("reverb.dll"), Some(66), 0)
            .unwrap();
        g.insert_connection(2, 66, PortKind::Input, 0.3).unwrap();
        let before = snapshot(&g);

        g.exchange_machines(65, 66).unwrap();
        assert_ne!(snapshot(&g), before);
        g.exchange_machines(65, 66).unwrap();
        assert_eq!(snapshot(&g), before);
    }

    #[test]
    fn exchange_keeps_positions_and_wires_with_slots() {
        let f = factory();
        let mut g = small_graph(&f);
        g.exchange_machines(1, 2).unwrap();
        assert_eq!((g.machine(1).unwrap().x, g.machine(1).unwrap().y), (10, 20));
        assert_eq!(g.find_output_wire(1, 65), Some(0));
        assert_eq!(g.find_output_wire(2, MASTER_INDEX), Some(0));
    }

    #[test]
    fn exchange_with_empty_slot_moves_wires() {
        let f = factory();
        let mut g = small_graph(&f);
        g.exchange_machines(65, 90).unwrap();
        assert!(!g.is_occupied(65));
        assert_eq!(g.machine(90).unwrap().x, 50);
        assert_eq!(g.find_output_wire(1, 90), Some(0));
        assert_eq!(g.find_output_wire(90, MASTER_INDEX), Some(0));
        assert_eq!(g.wire_volume(90, Port::Input(0)), Some(0.5));

        g.exchange_machines(65, 90).unwrap();
        assert_eq!(g.find_output_wire(1, 65), Some(0));
    }

    #[test]
    fn exchange_refuses_mixers_and_master() {
        let f = factory();
        let mut g = small_graph(&f);
        g.create_machine(&f, MachineType::Mixer, 0, 0, None, Some(80), 0).unwrap();
        assert_eq!(g.exchange_machines(80, 1), Err(GraphError::ExchangeForbidden(80)));
        assert_eq!(g.exchange_machines(0, 1), Err(GraphError::ExchangeForbidden(0)));
    }

    #[test]
    fn exchange_preserves_volume_across_audio_ranges() {
        let f = factory();
        let mut g = small_graph(&f);
        g.create_machine(&f, MachineType::VstFx, 0, 0, Some("vfx.dll"), Some(66), 0)
            .unwrap();
        g.exchange_machines(65, 66).unwrap();
        let key = g.wire_between(1, 65).unwrap();
        let w = *g.wire(key).unwrap();
        assert_eq!(w.multiplier, 32768.0);
        assert_eq!(w.volume(), 0.5);
    }

    #[test]
    fn replace_replays_connections() {
        let f = factory();
        let mut g = small_graph(&f);
        g.replace_machine(&f, 65, MachineType::Plugin, 50, 60, Some("reverb.dll"), 0)
            .unwrap();
        let m = g.machine(65).unwrap();
        assert_eq!(m.plugin.as_deref(), Some("reverb.dll"));
        assert_eq!(g.wire_volume(65, Port::Input(0)), Some(0.5));
        assert_eq!(g.find_output_wire(65, MASTER_INDEX), Some(0));
        let port = g.find_input_wire(MASTER_INDEX, 65).unwrap();
        assert_eq!(g.wire_volume(MASTER_INDEX, port), Some(0.75));
    }

    #[test]
    fn failed_replace_keeps_old_machine() {
        let f = factory();
        let mut g = small_graph(&f);
        let r = g.replace_machine(&f, 65, MachineType::Plugin, 0, 0, Some("gone.dll"), 0);
        assert!(r.is_err());
        assert_eq!(g.machine(65).unwrap().plugin.as_deref(), Some("delay.dll"));
        assert_eq!(g.num_inputs(65), 1);
    }

    #[test]
    fn clone_copies_state_but_not_wires() {
        let f = factory();
        let mut g = small_graph(&f);
        g.machine_mut(65).unwrap().behavior_mut().set_param(2, 99);

        // Given reversed on purpose.
        let slot = g.clone_machine(&f, 70, 65).unwrap();
        assert_eq!(slot, 70);
        let copy = g.machine(70).unwrap();
        assert_eq!(copy.kind, MachineType::Plugin);
        assert_eq!(copy.behavior().param(2), 99);
        assert_eq!((copy.x, copy.y), (50 + CLONE_OFFSET.0, 60 + CLONE_OFFSET.1));
        assert_eq!(copy.edit_name.as_str(), "delay 2");
        assert_eq!(g.num_inputs(70) + g.num_outputs(70), 0);

        g.clone_machine(&f, 70, 71).unwrap();
        assert_eq!(g.machine(71).unwrap().edit_name.as_str(), "delay 3");
    }

    /// Behaviour that never accepts a stored state.
    struct Forgetful;

    static FORGETFUL: MachineInfo =
        MachineInfo { name: "Forgetful", short_name: "fgt", mode: MachineMode::Effect, params: &[] };

    impl MachineBehavior for Forgetful {
        fn info(&self) -> &MachineInfo {
            &FORGETFUL
        }
        fn param(&self, _index: usize) -> i32 {
            0
        }
        fn set_param(&mut self, _index: usize, _value: i32) {}
        fn save_state(&self, out: &mut Vec<u8>) {
            out.push(7);
        }
        fn load_state(&mut self, _data: &[u8]) -> bool {
            false
        }
    }

    struct ForgetfulFactory;

    impl MachineFactory for ForgetfulFactory {
        fn test_filename(&self, _plugin: &str, _shell_index: u32) -> bool {
            true
        }
        fn try_create(
            &self,
            _kind: MachineType,
            _plugin: Option<&str>,
            _shell_index: u32,
        ) -> Result<Box<dyn MachineBehavior>, crate::machine::FactoryError> {
            Ok(Box::new(Forgetful))
        }
    }

    #[test]
    fn clone_survives_a_rejected_state() {
        let mut g = MachineGraph::new();
        g.install(5, Machine::new(MachineType::Duplicator, Box::new(Forgetful))).unwrap();
        assert_eq!(g.clone_machine(&ForgetfulFactory, 5, 6), Ok(6));
        assert_eq!(g.machine(6).unwrap().kind, MachineType::Duplicator);
    }

    #[test]
    fn clone_into_occupied_slot_fails() {
        let f = factory();
        let mut g = small_graph(&f);
        assert_eq!(g.clone_machine(&f, 1, 2), Err(GraphError::CloneForbidden(1, 2)));
    }

    fn table_with(inputs: &[(usize, i32)], outputs: &[(usize, i32)]) -> WireTable {
        let mut t = WireTable::default();
        for &(port, source) in inputs {
            t.inputs[port] = InputHalfEdge { source, active: true, gain: 0.5, multiplier: 1.0 };
        }
        for &(port, target) in outputs {
            t.outputs[port] = OutputHalfEdge { target, active: true };
        }
        t
    }

    fn loaded(f: &BuiltinFactory, kind: MachineType) -> Machine {
        Machine::new(kind, f.try_create(kind, None, 0).unwrap())
    }

    #[test]
    fn reconcile_pairs_half_edges_and_drops_the_rest() {
        let f = factory();
        let mut g = MachineGraph::new();
        g.install_loaded(0, loaded(&f, MachineType::Master), table_with(&[(0, 1), (1, 9)], &[]))
            .unwrap();
        // Output to master (paired), to itself, to an empty slot, out of range.
        g.install_loaded(
            1,
            loaded(&f, MachineType::Sampler),
            table_with(&[], &[(0, 0), (1, 1), (2, 40), (3, 999)]),
        )
        .unwrap();

        let report = g.post_load_reconcile();
        assert_eq!(report.wires, 1);
        // self loop, empty slot, out of range, master input from empty slot 9
        assert_eq!(report.dropped_half_edges, 4);
        assert_eq!(g.find_output_wire(1, 0), Some(0));
        assert_eq!(g.wire_volume(0, Port::Input(0)), Some(0.5));
        assert_eq!(g.num_outputs(1), 1);
        assert_eq!(g.num_inputs(0), 1);
    }

    #[test]
    fn reconcile_requires_matching_input() {
        let f = factory();
        let mut g = MachineGraph::new();
        g.install_loaded(0, loaded(&f, MachineType::Master), WireTable::default())
            .unwrap();
        g.install_loaded(1, loaded(&f, MachineType::Sampler), table_with(&[], &[(0, 0)]))
            .unwrap();
        let report = g.post_load_reconcile();
        assert_eq!(report.wires, 0);
        assert_eq!(report.dropped_half_edges, 1);
    }

    #[test]
    fn mixer_send_flags_are_restored_from_returns() {
        let f = factory();
        let mut g = MachineGraph::new();
        let mut mixer_table = WireTable::default();
        mixer_table.returns[0] = InputHalfEdge { source: 66, active: true, gain: 1.0, multiplier: 1.0 };
        let mixer = Machine::new(MachineType::Mixer, f.try_create(MachineType::Mixer, None, 0).unwrap());
        g.install_loaded(80, mixer, mixer_table).unwrap();
        let send = Machine::new(
            MachineType::Plugin,
            f.try_create(MachineType::Plugin, Some("reverb.dll"), 0).unwrap(),
        );
        g.install_loaded(66, send, table_with(&[], &[(0, 80)])).unwrap();

        g.post_load_reconcile();
        assert_eq!(g.find_input_wire(80, 66), Some(Port::Return(0)));
        assert!(!g.machine(66).unwrap().is_mixer_send);
        g.restore_mixer_send_flags();
        assert!(g.machine(66).unwrap().is_mixer_send);
    }
}
