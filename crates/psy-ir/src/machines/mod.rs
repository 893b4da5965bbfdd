//! Built-in machine behaviours and the default factory.

mod dummy;
mod hosted;
mod internal;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::machine::{FactoryError, MachineBehavior, MachineFactory, MachineMode, MachineType};

pub use dummy::DummyMachine;
pub use hosted::HostedPlugin;
pub use internal::InternalMachine;

/// Entry of the plugin catalogue known to [`BuiltinFactory`].
#[derive(Clone, Debug, PartialEq)]
pub struct PluginDescriptor {
    pub name: String,
    pub mode: MachineMode,
    pub num_params: usize,
    pub enabled: bool,
}

impl PluginDescriptor {
    pub fn new(name: &str, mode: MachineMode, num_params: usize) -> Self {
        Self {
            name: String::from(name),
            mode,
            num_params,
            enabled: true,
        }
    }
}

/// Create the behaviour of a built-in machine type.
///
/// Hosted types have no built-in behaviour and return `None`.
pub fn create_builtin(kind: MachineType) -> Option<Box<dyn MachineBehavior>> {
    Some(match kind {
        MachineType::Dummy => Box::new(DummyMachine::new(MachineMode::Effect)),
        MachineType::Plugin | MachineType::Vst | MachineType::VstFx => return None,
        _ => Box::new(InternalMachine::new(kind)),
    })
}

/// Factory for the internal machines plus a catalogue of proxy plugins.
#[derive(Clone, Debug, Default)]
pub struct BuiltinFactory {
    plugins: Vec<PluginDescriptor>,
}

impl BuiltinFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, descriptor: PluginDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn register(&mut self, descriptor: PluginDescriptor) {
        if let Some(existing) = self
            .plugins
            .iter_mut()
            .find(|d| d.name.eq_ignore_ascii_case(&descriptor.name))
        {
            *existing = descriptor;
        } else {
            self.plugins.push(descriptor);
        }
    }

    pub fn plugins(&self) -> &[PluginDescriptor] {
        &self.plugins
    }

    fn find(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }
}

impl MachineFactory for BuiltinFactory {
    fn test_filename(&self, plugin: &str, _shell_index: u32) -> bool {
        self.find(plugin).is_some_and(|d| d.enabled)
    }

    fn try_create(
        &self,
        kind: MachineType,
        plugin: Option<&str>,
        _shell_index: u32,
    ) -> Result<Box<dyn MachineBehavior>, FactoryError> {
        if !kind.is_hosted() {
            return create_builtin(kind).ok_or(FactoryError::UnsupportedType(kind));
        }
        let name = plugin.ok_or(FactoryError::MissingPlugin)?;
        let descriptor = self
            .find(name)
            .filter(|d| d.enabled)
            .ok_or_else(|| FactoryError::PluginUnavailable(String::from(name)))?;
        Ok(Box::new(HostedPlugin::new(descriptor, kind)))
    }
}

/// Encode a parameter list as `u32 count` followed by `i32` values.
pub(crate) fn save_params(params: &[i32], out: &mut Vec<u8>) {
    out.extend_from_slice(&(params.len() as u32).to_le_bytes());
    for v in params {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Decode a list written by [`save_params`] into `params`. Extra stored
/// values are ignored, missing ones keep their current value.
pub(crate) fn load_params(params: &mut [i32], data: &[u8]) -> bool {
    let Some(count) = data.get(..4) else {
        return false;
    };
    let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]) as usize;
    let body = &data[4..];
    if body.len() < count * 4 {
        return false;
    }
    for (slot, chunk) in params.iter_mut().zip(body.chunks_exact(4).take(count)) {
        *slot = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_types_create_without_plugins() {
        let factory = BuiltinFactory::new();
        let m = factory.try_create(MachineType::Sampler, None, 0).unwrap();
        assert_eq!(m.mode(), MachineMode::Generator);
        let m = factory.try_create(MachineType::Mixer, None, 0).unwrap();
        assert_eq!(m.mode(), MachineMode::Effect);
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let factory = BuiltinFactory::new();
        assert!(!factory.test_filename("missing.dll", 0));
        let err = factory.try_create(MachineType::Plugin, Some("missing.dll"), 0);
        assert!(matches!(err, Err(FactoryError::PluginUnavailable(_))));
    }

    #[test]
    fn disabled_plugin_fails_filename_test() {
        let mut d = PluginDescriptor::new("delay.dll", MachineMode::Effect, 4);
        d.enabled = false;
        let factory = BuiltinFactory::new().with_plugin(d);
        assert!(!factory.test_filename("delay.dll", 0));
    }

    #[test]
    fn plugin_lookup_ignores_case() {
        let factory = BuiltinFactory::new()
            .with_plugin(PluginDescriptor::new("Flanger.dll", MachineMode::Effect, 3));
        assert!(factory.test_filename("flanger.dll", 0));
    }

    #[test]
    fn params_decode_tolerates_short_lists() {
        let mut out = Vec::new();
        save_params(&[7, -3], &mut out);
        let mut params = [0, 0, 42];
        assert!(load_params(&mut params, &out));
        assert_eq!(params, [7, -3, 42]);
        assert!(!load_params(&mut params, &out[..6]));
    }
}
