//! Song file formats for psycore.
//!
//! Reads the chunked PSY3 container and the legacy PSY2 layout into the
//! song model, and writes PSY3. Loading never mutates a live song: the
//! decoders build a fresh [`Song`] that the caller swaps in.

mod beerz77;
mod legacy_convert;
mod psy2_format;
mod psy3_format;
mod psy3_save;
mod reader;
mod records;
mod writer;

use psy_ir::{MachineFactory, ReconcileReport, Song};

pub use beerz77::{compress, decompress, CompressionError, BEERZ77_TYPE};
pub use legacy_convert::{InternalMachineConverter, LegacyConverter, Redirect};
pub use psy2_format::{load_psy2, PSY2_MAGIC};
pub use psy3_format::{load_psy3, PSY3_MAGIC};
pub use psy3_save::{save_song, write_song};

/// Error type for song loading and saving.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// Magic bytes name no known format.
    #[error("incorrect file format")]
    InvalidHeader,
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("unsupported file version {0:#x}")]
    UnsupportedVersion(u32),
    #[error("corrupt song data: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error(transparent)]
    Binary(#[from] binrw::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Knobs of a load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    /// A full open instantiates plugins and restores mixer-send flags. A
    /// preview open (`false`) puts placeholders where plugins would go.
    pub full_open: bool,
    /// Line count given to patterns the file does not define.
    pub default_pattern_lines: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { full_open: true, default_pattern_lines: psy_ir::DEFAULT_PATTERN_LINES }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SongFormat {
    Psy3,
    Psy2,
}

/// What a load had to repair or skip.
#[derive(Clone, Debug)]
pub struct LoadReport {
    pub format: SongFormat,
    /// Container version from the file header.
    pub version: u32,
    pub warnings: Vec<String>,
    /// Chunks announced in the header but never found.
    pub unread_chunks: i32,
    pub reconcile: ReconcileReport,
}

impl LoadReport {
    pub(crate) fn new(format: SongFormat, version: u32) -> Self {
        Self {
            format,
            version,
            warnings: Vec::new(),
            unread_chunks: 0,
            reconcile: ReconcileReport::default(),
        }
    }

    pub(crate) fn warn(&mut self, message: String) {
        log::warn!("[{:?}] {}", self.format, message);
        self.warnings.push(message);
    }
}

/// Observer of long loads and saves.
pub trait ProgressSink {
    fn progress(&mut self, done: usize, total: usize);
}

/// Progress sink that ignores everything.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&mut self, _done: usize, _total: usize) {}
}

/// Collaborators and options of a load.
pub struct LoadEnv<'a> {
    pub factory: &'a dyn MachineFactory,
    pub converter: &'a dyn LegacyConverter,
    pub options: LoadOptions,
    pub progress: Option<&'a mut dyn ProgressSink>,
}

impl<'a> LoadEnv<'a> {
    pub fn new(factory: &'a dyn MachineFactory) -> Self {
        Self {
            factory,
            converter: &InternalMachineConverter,
            options: LoadOptions::default(),
            progress: None,
        }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_converter(mut self, converter: &'a dyn LegacyConverter) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_progress(mut self, progress: &'a mut dyn ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    pub(crate) fn report_progress(&mut self, done: usize, total: usize) {
        if let Some(p) = self.progress.as_deref_mut() {
            p.progress(done, total);
        }
    }
}

/// Load a song, picking the decoder from the first eight bytes.
///
/// Fails only when the data is not a song file at all or its header is
/// unreadable; damage further in is repaired and listed in the report.
pub fn load_song(data: &[u8], env: &mut LoadEnv<'_>) -> Result<(Song, LoadReport), FormatError> {
    let magic = data.get(..8).ok_or(FormatError::InvalidHeader)?;
    let (song, report) = if magic == PSY3_MAGIC {
        load_psy3(data, env)?
    } else if magic == PSY2_MAGIC {
        load_psy2(data, env)?
    } else {
        return Err(FormatError::InvalidHeader);
    };
    log::info!(
        "[{:?}] loaded \"{}\": {} machines, {} wires, {} patterns, {} warnings",
        report.format,
        song.name,
        song.graph.machine_count(),
        song.graph.wire_count(),
        song.patterns.num_patterns(),
        report.warnings.len()
    );
    Ok((song, report))
}
