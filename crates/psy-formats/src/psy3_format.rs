//! PSY3 song loader.
//!
//! A PSY3 file is the magic `PSY3SONG`, a header (`version`, `size`,
//! `chunkcount`) and a run of chunks `{tag[4], version u32, size u32,
//! payload}`. Every chunk reader ends by seeking to `begin + size`, so
//! unknown data inside a chunk is skipped. When four bytes do not form a
//! known tag the cursor backs up three bytes and tries again.

use psy_ir::machines::create_builtin;
use psy_ir::{
    Machine, MachineType, Song, MASTER_INDEX, MAX_INSTRUMENTS, MAX_LINES, MAX_MACHINES,
    MAX_PATTERNS, MAX_SEQUENCES, MAX_TRACKS, MAX_XM_INSTRUMENTS,
};

use crate::reader::PsyReader;
use crate::records;
use crate::{decompress, FormatError, LoadEnv, LoadReport, SongFormat};

pub const PSY3_MAGIC: &[u8; 8] = b"PSY3SONG";

/// Container version written by this crate.
pub(crate) const FILE_VERSION: u32 = 0;
pub(crate) const VERSION_INFO: u32 = 0;
pub(crate) const VERSION_SNGI: u32 = 1;
pub(crate) const VERSION_SEQD: u32 = 0;
pub(crate) const VERSION_PATD: u32 = 1;
pub(crate) const VERSION_MACD: u32 = 1;
pub(crate) const VERSION_INSD: u32 = 1;
/// Extended bank chunks carry their family in the upper 16 bits.
pub(crate) const VERSION_EINS: u32 = XM_VERSION_ONE | 1;
const XM_VERSION_ONE: u32 = 0x0001_0000;

const MAJOR_MASK: u32 = 0xFF00;

fn major_zero(version: u32) -> bool {
    version & MAJOR_MASK == 0
}

/// Optional i32 index: negative means none.
fn opt_index(v: i32) -> Option<usize> {
    usize::try_from(v).ok()
}

struct Loader<'e, 'a> {
    env: &'e mut LoadEnv<'a>,
    song: Song,
    report: LoadReport,
    solo: Option<usize>,
}

/// Decode a PSY3 song.
pub fn load_psy3(data: &[u8], env: &mut LoadEnv<'_>) -> Result<(Song, LoadReport), FormatError> {
    let mut r = PsyReader::new(data);
    if r.read_bytes(8)? != PSY3_MAGIC {
        return Err(FormatError::InvalidHeader);
    }
    let version = r.read_u32_le()?;
    let size = r.read_u32_le()? as usize;
    let mut chunkcount = r.read_i32_le()?;
    // bytes of the header beyond the chunk count
    if size > 4 {
        r.skip(size - 4)?;
    }

    let mut song = Song::new();
    song.patterns.delete_all_patterns();
    song.patterns.set_default_lines(env.options.default_pattern_lines);
    song.patterns.reset();
    let mut loader = Loader {
        env,
        song,
        report: LoadReport::new(SongFormat::Psy3, version),
        solo: None,
    };
    log::debug!("[PSY3] version {version:#x}, {chunkcount} chunks");
    if !major_zero(version) {
        loader
            .report
            .warn(format!("file version {version:#x} is newer than this reader, loading what it understands"));
    }

    while chunkcount > 0 {
        let Some(tag) = r.read_tag() else {
            break;
        };
        let known = matches!(&tag, b"INFO" | b"SNGI" | b"SEQD" | b"PATD" | b"MACD" | b"INSD" | b"EINS");
        if !known {
            r.seek(r.pos() - 3);
            continue;
        }
        chunkcount -= 1;
        let (Ok(version), Ok(size)) = (r.read_u32_le(), r.read_u32_le()) else {
            loader.report.warn(format!("{} chunk header is cut short", String::from_utf8_lossy(&tag)));
            break;
        };
        let size = size as usize;
        let begins = r.pos();
        if let Err(e) = loader.chunk(&mut r, &tag, version, size) {
            loader.report.warn(format!(
                "{} chunk at byte {begins} is unreadable ({e}), skipped",
                String::from_utf8_lossy(&tag)
            ));
            r.seek(begins + size);
        }
        loader.env.report_progress(r.pos(), r.len());
    }

    loader.report.unread_chunks = chunkcount;
    if chunkcount > 0 {
        loader.report.warn(format!("{chunkcount} announced chunks were not found"));
    }
    Ok(loader.finish())
}

impl Loader<'_, '_> {
    fn chunk(&mut self, r: &mut PsyReader<'_>, tag: &[u8; 4], version: u32, size: usize) -> Result<(), FormatError> {
        let mut size = size;
        let begins = r.pos();
        log::debug!("[PSY3] {} v{version:#x} {size} bytes at {begins}", String::from_utf8_lossy(tag));
        match tag {
            b"EINS" => {
                if version & 0xFFFF_0000 == XM_VERSION_ONE {
                    self.extended(r, version, begins + size)?;
                }
            }
            _ if !major_zero(version) => {
                self.report.warn(format!(
                    "skipping {} chunk of unknown version {version:#x}",
                    String::from_utf8_lossy(tag)
                ));
            }
            b"INFO" => {
                self.song.name = r.read_cstring(129);
                self.song.author = r.read_cstring(65);
                self.song.comments = r.read_cstring(65536);
                // early writers stored a wrong size
                if version == 0 {
                    size = r.pos() - begins;
                }
            }
            b"SNGI" => size = self.song_info(r, version, size)?,
            b"SEQD" => self.sequence(r)?,
            b"PATD" => size = self.pattern(r, version, begins, size)?,
            b"MACD" => self.machine(r)?,
            b"INSD" => {
                let index = r.read_u32_le()? as usize;
                if index < MAX_INSTRUMENTS {
                    let inst = records::read_instrument(r)?;
                    if let Some(slot) = self.song.instruments.get_mut(index) {
                        *slot = inst;
                    }
                }
            }
            _ => {}
        }
        r.seek(begins + size);
        Ok(())
    }

    fn song_info(&mut self, r: &mut PsyReader<'_>, version: u32, size: usize) -> Result<usize, FormatError> {
        let song = &mut self.song;
        let tracks = r.read_i32_le()?.clamp(1, MAX_TRACKS as i32) as usize;
        song.patterns.set_song_tracks(tracks);
        let coarse = r.read_i16_le()?;
        let fine = r.read_i16_le()?;
        song.bpm = f32::from(coarse) + f32::from(fine) / 100.0;
        song.lines_per_beat = r.read_i32_le()?.max(1) as u32;
        song.octave = r.read_i32_le()?.clamp(0, 8) as u8;
        // buffered: machines loaded later would clear it
        self.solo = opt_index(r.read_i32_le()?);
        song.track_soloed = opt_index(r.read_i32_le()?);
        song.seq_bus = opt_index(r.read_i32_le()?).unwrap_or(0);
        song.param_selected = opt_index(r.read_i32_le()?).unwrap_or(0);
        song.aux_col_selected = opt_index(r.read_i32_le()?).unwrap_or(0);
        song.inst_selected = opt_index(r.read_i32_le()?).unwrap_or(0);
        // sequence width
        r.read_i32_le()?;
        for t in 0..tracks {
            song.set_track_muted(t, r.read_bool()?);
            song.set_track_armed(t, r.read_bool()?);
        }

        if version == 0 {
            // the old writer got the size wrong
            return Ok(11 * 4 + tracks * 2);
        }
        let shared = r.read_bool()?;
        song.patterns.set_track_name_share_mode(shared);
        if shared {
            for t in 0..tracks {
                let name = r.read_cstring(256);
                song.patterns.change_track_name(0, t, &name);
            }
        }
        Ok(size)
    }

    fn sequence(&mut self, r: &mut PsyReader<'_>) -> Result<(), FormatError> {
        let index = r.read_u32_le()? as usize;
        if index >= MAX_SEQUENCES {
            return Ok(());
        }
        let length = r.read_i32_le()?.max(0) as usize;
        // sequence name, unused
        r.read_cstring(256);
        let seq = &mut self.song.sequence;
        seq.set_play_length(length);
        for position in 0..length {
            let pattern = r.read_i32_le()?;
            let stored = usize::try_from(pattern).is_ok_and(|p| seq.set_pattern_at(position, p));
            if !stored && position < psy_ir::MAX_SONG_POSITIONS {
                self.report.warn(format!("sequence position {position}: bad pattern {pattern}"));
            }
        }
        Ok(())
    }

    fn pattern(
        &mut self,
        r: &mut PsyReader<'_>,
        version: u32,
        begins: usize,
        mut size: usize,
    ) -> Result<usize, FormatError> {
        let index = r.read_u32_le()? as usize;
        if index < MAX_PATTERNS {
            let lines = r.read_i32_le()?;
            let tracks = r.read_i32_le()?;
            let name = r.read_cstring(32);
            let packed_len = r.read_u32_le()? as usize;
            let packed = r.read_bytes(packed_len)?;

            let patterns = &mut self.song.patterns;
            patterns.remove_pattern(index);
            if let Some(p) = patterns.pattern_mut(index) {
                p.name = psy_ir::fixed_name(&name);
            }
            let shape = usize::try_from(lines)
                .ok()
                .filter(|l| (1..=MAX_LINES).contains(l))
                .zip(usize::try_from(tracks).ok().filter(|t| (1..=MAX_TRACKS).contains(t)));
            match (shape, decompress(packed)) {
                (Some((lines, tracks)), Ok(bytes)) if bytes.len() == lines * tracks * psy_ir::EVENT_SIZE => {
                    patterns.set_pattern_bytes(index, lines, tracks, &bytes);
                }
                (None, _) => {
                    self.report.warn(format!("pattern {index}: bad shape {lines}x{tracks}, dropped"));
                }
                (_, Err(e)) => self.report.warn(format!("pattern {index}: {e}, dropped")),
                (Some(_), Ok(bytes)) => self.report.warn(format!(
                    "pattern {index}: {} decoded bytes do not fit {lines}x{tracks}, dropped",
                    bytes.len()
                )),
            }
        }

        if version == 0 && r.pos() == begins + size + 4 {
            size += 4;
        }
        if version > 0 && !self.song.patterns.share_track_names() {
            for t in 0..self.song.song_tracks() {
                let name = r.read_cstring(256);
                self.song.patterns.change_track_name(index, t, &name);
            }
        }
        Ok(size)
    }

    fn machine(&mut self, r: &mut PsyReader<'_>) -> Result<(), FormatError> {
        let index = r.read_u32_le()? as usize;
        if index >= MAX_MACHINES {
            return Ok(());
        }
        let (machine, table) = records::read_machine(r, self.env, index, &mut self.report)?;
        if (machine.kind == MachineType::Master) != (index == MASTER_INDEX) {
            self.report.warn(format!("machine {index}: {:?} in the wrong slot, dropped", machine.kind));
            return Ok(());
        }
        self.song
            .graph
            .install_loaded(index, machine, table)
            .map_err(|e| FormatError::Corrupt(e.to_string()))
    }

    fn extended(&mut self, r: &mut PsyReader<'_>, version: u32, end: usize) -> Result<(), FormatError> {
        // minor version 0 wrote wrong record sizes
        let sized = version & 0xFFFF > 0;
        let bank = &mut self.song.instruments.extended;

        let count = r.read_i32_le()?;
        for _ in 0..count {
            if r.pos() >= end {
                break;
            }
            let index = r.read_i32_le()?;
            let record_len = r.read_u32_le()? as usize;
            let start = r.pos();
            let inst = records::read_xm_instrument(r)?;
            match usize::try_from(index).ok().filter(|&i| i < MAX_XM_INSTRUMENTS) {
                Some(i) => bank.instruments[i] = inst,
                None => self.report.warn(format!("extended instrument index {index} out of range")),
            }
            if sized {
                r.seek(start + record_len);
            }
        }

        let count = r.read_i32_le()?;
        for _ in 0..count {
            if r.pos() >= end {
                break;
            }
            let index = r.read_i32_le()?;
            let record_len = r.read_u32_le()? as usize;
            let start = r.pos();
            let sample = records::read_xm_sample(r)?;
            match usize::try_from(index).ok().filter(|&i| i < MAX_XM_INSTRUMENTS) {
                Some(i) => bank.samples[i] = sample,
                None => self.report.warn(format!("extended sample index {index} out of range")),
            }
            if sized {
                r.seek(start + record_len);
            }
        }
        Ok(())
    }

    /// Wires, mixer flags, post-load hooks, solo and a guaranteed master.
    fn finish(mut self) -> (Song, LoadReport) {
        let graph = &mut self.song.graph;
        self.report.reconcile = graph.post_load_reconcile();
        if self.env.options.full_open {
            graph.restore_mixer_send_flags();
        }
        graph.post_load();
        graph.set_soloed(self.solo);

        if !graph.is_occupied(MASTER_INDEX) {
            self.report.warn(String::from("song has no master, a default one was created"));
            synthesize_master(&mut self.song, self.env);
        }
        (self.song, self.report)
    }
}

/// Put a master into slot 0, through the factory if it cooperates.
pub(crate) fn synthesize_master(song: &mut Song, env: &LoadEnv<'_>) {
    let (x, y) = psy_ir::song::MASTER_POSITION;
    if song
        .graph
        .create_machine(env.factory, MachineType::Master, x, y, None, None, 0)
        .is_ok()
    {
        return;
    }
    if let Some(behavior) = create_builtin(MachineType::Master) {
        let mut master = Machine::new(MachineType::Master, behavior);
        master.behavior_mut().init();
        master.x = x;
        master.y = y;
        if let Err(e) = song.graph.install(MASTER_INDEX, master) {
            log::error!("[PSY3] could not install a master: {e}");
        }
    }
}
