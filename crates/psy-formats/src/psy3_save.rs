//! PSY3 song writer.

use std::io::Write;

use psy_ir::{Song, MAX_PATTERNS, MAX_SEQUENCES};

use crate::psy3_format::{
    FILE_VERSION, PSY3_MAGIC, VERSION_EINS, VERSION_INFO, VERSION_INSD, VERSION_MACD,
    VERSION_PATD, VERSION_SEQD, VERSION_SNGI,
};
use crate::records;
use crate::writer::PsyWriter;
use crate::{compress, FormatError, ProgressSink};

/// Offset of the chunk count in the file header.
const CHUNKCOUNT_POS: usize = 16;

struct Saver<'p> {
    w: PsyWriter,
    chunks: i32,
    progress: &'p mut dyn ProgressSink,
    done: usize,
    total: usize,
}

impl Saver<'_> {
    fn chunk(&mut self, tag: &[u8; 4], version: u32, body: impl FnOnce(&mut PsyWriter)) {
        let mark = self.w.begin_chunk(tag, version);
        body(&mut self.w);
        self.w.patch_size(mark);
        self.chunks += 1;
        self.done += 1;
        self.progress.progress(self.done, self.total);
    }
}

/// Encode `song` as a PSY3 file.
///
/// Chunks come in a fixed order: INFO, SNGI, SEQD, one PATD per used
/// pattern, one MACD per machine, one INSD per non-empty instrument and an
/// EINS when the extended bank holds anything.
pub fn save_song(song: &Song, progress: &mut dyn ProgressSink) -> Vec<u8> {
    let patterns: Vec<usize> = (0..MAX_PATTERNS).filter(|&i| song.is_pattern_used(i)).collect();
    let instruments: Vec<usize> = song
        .instruments
        .iter()
        .filter(|(_, inst)| !inst.is_empty())
        .map(|(i, _)| i)
        .collect();
    let bank = &song.instruments.extended;
    let extended = bank.enabled_instruments() > 0 || bank.used_samples() > 0;
    let total = 3 + patterns.len() + song.graph.machine_count() + instruments.len() + usize::from(extended);

    let mut s = Saver { w: PsyWriter::new(), chunks: 0, progress, done: 0, total };
    s.w.write_bytes(PSY3_MAGIC);
    s.w.write_u32_le(FILE_VERSION);
    let header = s.w.size_placeholder();
    s.w.write_i32_le(0);
    s.w.patch_size(header);

    s.chunk(b"INFO", VERSION_INFO, |w| {
        w.write_cstring(&song.name);
        w.write_cstring(&song.author);
        w.write_cstring(&song.comments);
    });

    s.chunk(b"SNGI", VERSION_SNGI, |w| write_song_info(w, song));

    for index in 0..MAX_SEQUENCES {
        s.chunk(b"SEQD", VERSION_SEQD, |w| {
            w.write_u32_le(index as u32);
            let seq = &song.sequence;
            w.write_i32_le(seq.play_length() as i32);
            w.write_cstring("seq0");
            for e in seq.entries() {
                w.write_i32_le(i32::from(e.pattern));
            }
        });
    }

    let tracks = song.song_tracks();
    let shared = song.patterns.share_track_names();
    for &index in &patterns {
        s.chunk(b"PATD", VERSION_PATD, |w| {
            let p = &song.patterns;
            let lines = p.lines(index);
            w.write_u32_le(index as u32);
            w.write_i32_le(lines as i32);
            w.write_i32_le(tracks as i32);
            w.write_cstring(p.pattern(index).map_or("", |pat| pat.name.as_str()));
            let packed = compress(&p.pattern_bytes(index, tracks));
            w.write_u32_le(packed.len() as u32);
            w.write_bytes(&packed);
            if !shared {
                for t in 0..tracks {
                    w.write_cstring(p.track_name(index, t));
                }
            }
        });
    }

    for (slot, machine) in song.graph.machines() {
        let table = song.graph.wire_table(slot);
        s.chunk(b"MACD", VERSION_MACD, |w| {
            w.write_u32_le(slot as u32);
            records::write_machine(w, machine, &table);
        });
    }

    for &index in &instruments {
        if let Some(inst) = song.instruments.get(index) {
            s.chunk(b"INSD", VERSION_INSD, |w| {
                w.write_u32_le(index as u32);
                records::write_instrument(w, inst);
            });
        }
    }

    if extended {
        s.chunk(b"EINS", VERSION_EINS, |w| write_extended(w, song));
    }

    let chunks = s.chunks;
    let mut out = s.w.into_inner();
    out[CHUNKCOUNT_POS..CHUNKCOUNT_POS + 4].copy_from_slice(&chunks.to_le_bytes());
    log::debug!("[PSY3] saved {chunks} chunks, {} bytes", out.len());
    out
}

/// Encode `song` and write it to `out`.
pub fn write_song<W: Write>(out: &mut W, song: &Song, progress: &mut dyn ProgressSink) -> Result<(), FormatError> {
    let bytes = save_song(song, progress);
    out.write_all(&bytes)?;
    out.flush()?;
    Ok(())
}

fn write_song_info(w: &mut PsyWriter, song: &Song) {
    let tracks = song.song_tracks();
    w.write_i32_le(tracks as i32);
    let coarse = song.bpm.trunc();
    w.write_i16_le(coarse as i16);
    w.write_i16_le(((song.bpm - coarse) * 100.0).round() as i16);
    w.write_i32_le(song.lines_per_beat as i32);
    w.write_i32_le(i32::from(song.octave));
    let index = |v: Option<usize>| v.map_or(-1, |v| v as i32);
    w.write_i32_le(index(song.graph.soloed()));
    w.write_i32_le(index(song.track_soloed));
    w.write_i32_le(song.seq_bus as i32);
    w.write_i32_le(song.param_selected as i32);
    w.write_i32_le(song.aux_col_selected as i32);
    w.write_i32_le(song.inst_selected as i32);
    // sequence width
    w.write_i32_le(1);
    for t in 0..tracks {
        w.write_bool(song.is_track_muted(t));
        w.write_bool(song.is_track_armed(t));
    }
    let shared = song.patterns.share_track_names();
    w.write_bool(shared);
    if shared {
        for t in 0..tracks {
            w.write_cstring(song.patterns.track_name(0, t));
        }
    }
}

fn write_extended(w: &mut PsyWriter, song: &Song) {
    let bank = &song.instruments.extended;

    let instruments: Vec<usize> = (0..bank.instruments.len()).filter(|&i| bank.instruments[i].enabled).collect();
    w.write_i32_le(instruments.len() as i32);
    for i in instruments {
        w.write_i32_le(i as i32);
        let mark = w.size_placeholder();
        records::write_xm_instrument(w, &bank.instruments[i]);
        w.patch_size(mark);
    }

    let samples: Vec<usize> = (0..bank.samples.len()).filter(|&i| !bank.samples[i].data.is_empty()).collect();
    w.write_i32_le(samples.len() as i32);
    for i in samples {
        w.write_i32_le(i as i32);
        let mark = w.size_placeholder();
        records::write_xm_sample(w, &bank.samples[i]);
        w.patch_size(mark);
    }
}
