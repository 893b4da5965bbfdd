//! psycore CLI: inspect and resave songs.
//!
//! Usage:
//!   cargo run --bin psy-cli -- path/to/song.psy
//!   cargo run --bin psy-cli -- path/to/old.psy --resave new.psy

use std::path::PathBuf;

use clap::Parser;
use psy_master::{Controller, LoadOptions};

#[derive(Parser)]
#[command(name = "psy-cli")]
#[command(version, about = "Inspect and convert psycore song files", long_about = None)]
struct Cli {
    /// Song file (PSY3 or PSY2)
    path: PathBuf,

    /// Write the loaded song back out as PSY3
    #[arg(long, value_name = "OUT")]
    resave: Option<PathBuf>,

    /// Open without instantiating plugins
    #[arg(long)]
    preview: bool,

    /// Log every repair and chunk
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let options = LoadOptions { full_open: !cli.preview, ..LoadOptions::default() };
    let ctrl = Controller::default().with_options(options);
    let report = ctrl.load_file(&cli.path).unwrap_or_else(|e| {
        eprintln!("Failed to open {}: {}", cli.path.display(), e);
        std::process::exit(1);
    });

    {
        let song = ctrl.song();
        println!("Title:    {}", song.name);
        println!("Author:   {}", song.author);
        println!("Format:   {:?} (version {:#x})", report.format, report.version);
        println!("Tempo:    {} BPM, {} lines per beat", song.bpm, song.lines_per_beat);
        println!("Tracks:   {}", song.song_tracks());
        println!("Sequence: {} positions", song.sequence.play_length());
        println!("Patterns: {}", song.patterns.num_patterns());
        let instruments = song.instruments.iter().filter(|(_, i)| !i.is_empty()).count();
        println!("Instruments: {}", instruments);
        println!();

        println!("Machines: {} ({} wires)", song.graph.machine_count(), song.graph.wire_count());
        for (slot, m) in song.graph.machines() {
            let plugin = m.plugin.as_deref().unwrap_or("-");
            let kind = format!("{:?}", m.kind);
            let mode = format!("{:?}", m.mode);
            println!("  {:3}  {:<10} {:<10} {:<24} {}", slot, kind, mode, m.edit_name.as_str(), plugin);
        }

        if !report.warnings.is_empty() {
            println!();
            println!("Repairs:");
            for w in &report.warnings {
                println!("  {}", w);
            }
        }
        if report.unread_chunks > 0 {
            println!("{} chunks missing", report.unread_chunks);
        }
    }

    if let Some(out) = cli.resave {
        if let Err(e) = ctrl.save_file(&out) {
            eprintln!("Failed to save {}: {}", out.display(), e);
            std::process::exit(1);
        }
        println!();
        println!("Saved {}", out.display());
    }
}
