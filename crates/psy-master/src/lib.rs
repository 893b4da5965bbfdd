//! Headless controller for the psycore music host.
//!
//! Owns the current song behind a readers-writer lock and offers the
//! structural operations an editor needs, plus file loading and saving.
//! The render side holds a [`SongHandle`] and never blocks on editors.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};
use psy_formats::{LoadEnv, LoadReport, NoProgress};
use psy_ir::machines::BuiltinFactory;
use psy_ir::{MachineFactory, MachineType, PortKind};

// Re-export common types so callers don't need psy-ir/psy-formats directly.
pub use psy_formats::{FormatError, LoadOptions, SongFormat};
pub use psy_ir::{Edit, GraphError, Song};

/// How long the render side waits for a shared hold before giving up.
pub const RENDER_LOCK_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Machine factory usable from any thread.
pub type SharedFactory = Box<dyn MachineFactory + Send + Sync>;

/// Owns a song and serializes structural edits against rendering.
pub struct Controller {
    song: Arc<RwLock<Song>>,
    factory: SharedFactory,
    options: LoadOptions,
}

/// Render-side view of the controller's song.
#[derive(Clone)]
pub struct SongHandle {
    song: Arc<RwLock<Song>>,
}

impl SongHandle {
    /// Run `f` on the song if a shared hold is available within
    /// [`RENDER_LOCK_TIMEOUT`]. `None` means the caller should output silence.
    pub fn try_render<R>(&self, f: impl FnOnce(&Song) -> R) -> Option<R> {
        let song = self.song.try_read_for(RENDER_LOCK_TIMEOUT)?;
        Some(f(&song))
    }
}

impl Controller {
    /// Controller with an empty song made by `factory`.
    pub fn new(factory: SharedFactory) -> Self {
        let mut song = Song::new();
        if let Err(e) = song.new_song(factory.as_ref()) {
            log::warn!("[CTRL] initial song has no master: {e}");
        }
        Self { song: Arc::new(RwLock::new(song)), factory, options: LoadOptions::default() }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> LoadOptions {
        self.options
    }

    pub fn set_options(&mut self, options: LoadOptions) {
        self.options = options;
    }

    pub fn factory(&self) -> &dyn MachineFactory {
        self.factory.as_ref()
    }

    pub fn handle(&self) -> SongHandle {
        SongHandle { song: Arc::clone(&self.song) }
    }

    // --- Song management ---

    /// Shared hold on the song. Blocks while an edit is in progress.
    pub fn song(&self) -> RwLockReadGuard<'_, Song> {
        self.song.read()
    }

    /// Decode `data` and make it the current song.
    ///
    /// Decoding runs without the lock; the swap happens under one exclusive
    /// hold, so readers see either the old song or the new one.
    pub fn load(&self, data: &[u8]) -> Result<LoadReport, ControllerError> {
        let mut env = LoadEnv::new(self.factory.as_ref()).with_options(self.options);
        let (song, report) = psy_formats::load_song(data, &mut env)?;
        *self.song.write() = song;
        Ok(report)
    }

    pub fn load_file(&self, path: &Path) -> Result<LoadReport, ControllerError> {
        let data = std::fs::read(path)?;
        let mut env = LoadEnv::new(self.factory.as_ref()).with_options(self.options);
        let (mut song, report) = psy_formats::load_song(&data, &mut env)?;
        song.file_name = file_name(path);
        *self.song.write() = song;
        log::info!("[CTRL] opened {}", path.display());
        Ok(report)
    }

    /// Encode the current song as PSY3.
    pub fn save(&self) -> Vec<u8> {
        psy_formats::save_song(&self.song.read(), &mut NoProgress)
    }

    pub fn save_file(&self, path: &Path) -> Result<(), ControllerError> {
        let bytes = self.save();
        std::fs::write(path, &bytes)?;
        let mut song = self.song.write();
        song.file_name = file_name(path);
        song.saved = true;
        log::info!("[CTRL] saved {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    pub fn new_song(&self) -> Result<(), ControllerError> {
        self.song.write().new_song(self.factory.as_ref())?;
        Ok(())
    }

    // --- Graph edits ---

    pub fn create_machine(
        &self,
        kind: MachineType,
        x: i32,
        y: i32,
        plugin: Option<&str>,
        slot: Option<usize>,
        shell_index: u32,
    ) -> Result<usize, ControllerError> {
        let mut song = self.song.write();
        Ok(song.graph.create_machine(self.factory.as_ref(), kind, x, y, plugin, slot, shell_index)?)
    }

    pub fn destroy_machine(&self, slot: usize) {
        self.song.write().graph.destroy_machine(slot);
    }

    pub fn exchange_machines(&self, a: usize, b: usize) -> Result<(), ControllerError> {
        self.song.write().graph.exchange_machines(a, b)?;
        Ok(())
    }

    pub fn replace_machine(
        &self,
        slot: usize,
        kind: MachineType,
        x: i32,
        y: i32,
        plugin: Option<&str>,
        shell_index: u32,
    ) -> Result<usize, ControllerError> {
        let mut song = self.song.write();
        Ok(song.graph.replace_machine(self.factory.as_ref(), slot, kind, x, y, plugin, shell_index)?)
    }

    pub fn clone_machine(&self, src: usize, dst: usize) -> Result<usize, ControllerError> {
        Ok(self.song.write().graph.clone_machine(self.factory.as_ref(), src, dst)?)
    }

    pub fn insert_connection(
        &self,
        src: usize,
        dst: usize,
        kind: PortKind,
        volume: f32,
    ) -> Result<usize, ControllerError> {
        Ok(self.song.write().graph.insert_connection(src, dst, kind, volume)?)
    }

    // --- Song data edits ---

    pub fn exchange_instruments(&self, a: usize, b: usize) -> bool {
        self.song.write().exchange_instruments(a, b)
    }

    pub fn apply_edit(&self, edit: Edit) -> bool {
        self.song.write().apply_edit(edit)
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(Box::new(BuiltinFactory::new()))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use psy_ir::{Cell, MASTER_INDEX};
    use std::sync::mpsc;

    #[test]
    fn default_controller_has_a_master() {
        let ctrl = Controller::default();
        let song = ctrl.song();
        assert_eq!(song.graph.machine(MASTER_INDEX).unwrap().kind, MachineType::Master);
        assert_eq!(song.graph.machine_count(), 1);
    }

    #[test]
    fn edits_go_through_the_lock() {
        let ctrl = Controller::default();
        let sampler = ctrl.create_machine(MachineType::Sampler, 0, 0, None, None, 0).unwrap();
        ctrl.insert_connection(sampler, MASTER_INDEX, PortKind::Input, 1.0).unwrap();
        assert_eq!(ctrl.song().graph.wire_count(), 1);

        let copy = ctrl.clone_machine(sampler, sampler + 1).unwrap();
        assert_eq!(ctrl.song().graph.machine(copy).unwrap().kind, MachineType::Sampler);

        let cell = Cell { note: 60, instrument: 0, machine: sampler as u8, command: 0, parameter: 0 };
        assert!(ctrl.apply_edit(Edit::SetCell { pattern: 0, line: 0, track: 0, cell }));
        assert_eq!(ctrl.song().patterns.pattern(0).unwrap().cell(0, 0).note, 60);

        ctrl.destroy_machine(sampler);
        assert_eq!(ctrl.song().graph.wire_count(), 0);
    }

    #[test]
    fn graph_errors_surface() {
        let ctrl = Controller::default();
        let err = ctrl.create_machine(MachineType::Master, 0, 0, None, None, 0).unwrap_err();
        assert!(matches!(err, ControllerError::Graph(GraphError::MasterOccupied)));
    }

    #[test]
    fn failed_load_keeps_the_current_song() {
        let ctrl = Controller::default();
        ctrl.song.write().name = String::from("Keep me");
        let err = ctrl.load(b"not a song at all").unwrap_err();
        assert!(matches!(err, ControllerError::Format(FormatError::InvalidHeader)));
        assert_eq!(ctrl.song().name, "Keep me");
    }

    #[test]
    fn save_and_load_replace_the_song() {
        let ctrl = Controller::default();
        ctrl.song.write().name = String::from("Round");
        let bytes = ctrl.save();

        ctrl.new_song().unwrap();
        assert_eq!(ctrl.song().name, "Untitled");
        let report = ctrl.load(&bytes).unwrap();
        assert_eq!(report.format, SongFormat::Psy3);
        assert_eq!(ctrl.song().name, "Round");
    }

    #[test]
    fn render_gives_up_while_an_edit_holds_the_lock() {
        let ctrl = Controller::default();
        let handle = ctrl.handle();
        assert_eq!(handle.try_render(|s| s.graph.machine_count()), Some(1));

        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let song = Arc::clone(&ctrl.song);
        let writer = std::thread::spawn(move || {
            let _guard = song.write();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        held_rx.recv().unwrap();
        assert_eq!(handle.try_render(|s| s.graph.machine_count()), None);
        release_tx.send(()).unwrap();
        writer.join().unwrap();
        assert_eq!(handle.try_render(|s| s.graph.machine_count()), Some(1));
    }
}
