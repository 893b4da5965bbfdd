//! Integration test: build a song → save PSY3 → load through the controller.

use psy_formats::{load_song, save_song, LoadEnv, NoProgress};
use psy_ir::machines::{BuiltinFactory, PluginDescriptor};
use psy_ir::{Edit, MachineMode, MachineType, PortKind, Song, MASTER_INDEX};
use psy_master::{Controller, LoadOptions};
use std::path::PathBuf;

fn factory() -> BuiltinFactory {
    BuiltinFactory::new().with_plugin(PluginDescriptor::new("gainer.dll", MachineMode::Effect, 1))
}

/// Two patterns in a three-position sequence, with per-pattern track names.
fn arranged_song(factory: &BuiltinFactory) -> Song {
    let mut song = Song::new();
    song.new_song(factory).unwrap();
    song.name = String::from("Arranged");

    song.patterns.alloc_new_pattern(1, "Verse", 32, false);
    song.sequence.set_play_length(3);
    song.sequence.set_pattern_at(1, 1);
    song.sequence.set_pattern_at(2, 0);

    song.patterns.set_track_name_share_mode(false);
    song.patterns.change_track_name(0, 0, "drums");
    song.patterns.change_track_name(1, 0, "lead");

    let sampler = song
        .graph
        .create_machine(factory, MachineType::Sampler, 0, 0, None, None, 0)
        .unwrap();
    let fx = song
        .graph
        .create_machine(factory, MachineType::Plugin, 0, 0, Some("gainer.dll"), Some(65), 0)
        .unwrap();
    song.graph.insert_connection(sampler, fx, PortKind::Input, 0.25).unwrap();
    song.graph.insert_connection(fx, MASTER_INDEX, PortKind::Input, 1.0).unwrap();
    song
}

fn scratch_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("psycore-{}-{}.psy", name, std::process::id()))
}

#[test]
fn sequence_and_track_names_survive_a_save() {
    let factory = factory();
    let bytes = save_song(&arranged_song(&factory), &mut NoProgress);
    let mut env = LoadEnv::new(&factory);
    let (song, report) = load_song(&bytes, &mut env).unwrap();

    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(song.sequence.play_length(), 3);
    assert_eq!(song.sequence.pattern_at(0), Some(0));
    assert_eq!(song.sequence.pattern_at(1), Some(1));
    assert_eq!(song.sequence.pattern_at(2), Some(0));

    assert!(!song.patterns.share_track_names());
    assert_eq!(song.patterns.track_name(0, 0), "drums");
    assert_eq!(song.patterns.track_name(1, 0), "lead");
    assert_eq!(song.patterns.lines(1), 32);
    assert_eq!(song.patterns.pattern(1).unwrap().name.as_str(), "Verse");
}

#[test]
fn controller_file_roundtrip() {
    let path = scratch_file("roundtrip");
    let ctrl = Controller::new(Box::new(factory()));
    ctrl.load(&save_song(&arranged_song(&factory()), &mut NoProgress)).unwrap();
    assert!(ctrl.apply_edit(Edit::SetTrackMuted { track: 2, muted: true }));
    ctrl.save_file(&path).unwrap();
    assert!(ctrl.song().saved);

    let other = Controller::new(Box::new(factory()));
    other.load_file(&path).unwrap();
    let _ = std::fs::remove_file(&path);

    let song = other.song();
    assert_eq!(song.name, "Arranged");
    assert_eq!(song.file_name, path.file_name().unwrap().to_string_lossy());
    assert!(song.is_track_muted(2));
    assert_eq!(song.graph.machine_count(), 3);
    let key = song.graph.wire_between(1, 65).unwrap();
    assert!((song.graph.wire(key).unwrap().volume() - 0.25).abs() < 1e-6);
}

#[test]
fn preview_open_through_the_controller() {
    let bytes = save_song(&arranged_song(&factory()), &mut NoProgress);
    let ctrl = Controller::new(Box::new(factory()))
        .with_options(LoadOptions { full_open: false, ..LoadOptions::default() });
    ctrl.load(&bytes).unwrap();

    let song = ctrl.song();
    let fx = song.graph.machine(65).unwrap();
    assert_eq!(fx.kind, MachineType::Dummy);
    assert_eq!(fx.plugin.as_deref(), Some("gainer.dll"));
    // wires survive even though the plugin was never built
    assert!(song.graph.wire_between(65, MASTER_INDEX).is_some());
}

#[test]
fn missing_file_is_an_io_error() {
    let ctrl = Controller::default();
    let err = ctrl.load_file(&scratch_file("does-not-exist")).unwrap_err();
    assert!(matches!(err, psy_master::ControllerError::Io(_)));
}
