//! Action-pipeline invariants: undo restores the pre-action snapshot
//! exactly, redo restores the post-action snapshot, failures are atomic.

mod helpers;

use helpers::*;
use ostinato::prelude::*;
use ostinato::{Binding, BindingTarget, Connection, Error};

fn engine() -> (ostinato::OstinatoEngine, ostinato::AudioProcessor) {
    OstinatoEngine::builder().sample_rate(SR).build().unwrap()
}

fn snapshot_bytes(engine: &ostinato::OstinatoEngine) -> String {
    serde_json::to_string(&engine.snapshot()).unwrap()
}

#[test]
fn test_undo_restores_snapshot_byte_for_byte() {
    let (engine, _processor) = engine();
    let clip = dc_clip(&engine.clip_pool(), 1.0, 4800);

    let s0 = snapshot_bytes(&engine);

    let track = engine.add_audio_track("one").unwrap();
    engine
        .add_audio_region(track, AudioRegion::new(clip, 0, 4800))
        .unwrap();
    let s1 = snapshot_bytes(&engine);
    assert_ne!(s0, s1);

    engine.undo().unwrap();
    engine.undo().unwrap();
    assert_eq!(snapshot_bytes(&engine), s0);

    engine.redo().unwrap();
    engine.redo().unwrap();
    assert_eq!(snapshot_bytes(&engine), s1);
}

#[test]
fn test_undo_underflow_is_an_error() {
    let (engine, _processor) = engine();
    assert!(matches!(engine.undo(), Err(Error::UndoStackUnderflow)));
    assert!(matches!(engine.redo(), Err(Error::UndoStackUnderflow)));
}

#[test]
fn test_remove_track_round_trip_restores_connections() {
    let (engine, _processor) = engine();
    let a = engine.add_audio_track("a").unwrap();
    let b = engine.add_audio_track("b").unwrap();
    let a_ports = engine.track_ports(a).unwrap();
    let b_ports = engine.track_ports(b).unwrap();
    engine
        .connect(Connection::new(a_ports.out_l, b_ports.in_l).with_multiplier(0.75))
        .unwrap();

    let before = snapshot_bytes(&engine);
    engine.remove_track(a).unwrap();
    assert!(engine.snapshot().connections.is_empty());

    engine.undo().unwrap();
    assert_eq!(snapshot_bytes(&engine), before);
}

#[test]
fn test_failed_action_leaves_model_unchanged() {
    let (engine, _processor) = engine();
    let a = engine.add_audio_track("a").unwrap();
    let b = engine.add_audio_track("b").unwrap();
    let a_ports = engine.track_ports(a).unwrap();
    let b_ports = engine.track_ports(b).unwrap();

    let before = snapshot_bytes(&engine);

    // Kind mismatch: audio out into a MIDI in.
    let err = engine
        .connect(Connection::new(a_ports.out_l, b_ports.midi_in))
        .unwrap_err();
    assert!(matches!(err, Error::BadConnection(_)));
    assert_eq!(snapshot_bytes(&engine), before);
    assert_eq!(engine.undo_depth(), (2, 0));
}

#[test]
fn test_cyclic_connect_rolls_back_atomically() {
    let (engine, _processor) = engine();
    let a = engine.add_audio_track("a").unwrap();
    let b = engine.add_audio_track("b").unwrap();
    let a_ports = engine.track_ports(a).unwrap();
    let b_ports = engine.track_ports(b).unwrap();

    engine
        .connect(Connection::new(a_ports.out_l, b_ports.in_l))
        .unwrap();
    let before = snapshot_bytes(&engine);

    // This edge closes a cycle; the rebuild rejects it and the model
    // rolls back.
    let err = engine
        .connect(Connection::new(b_ports.out_l, a_ports.in_l))
        .unwrap_err();
    assert!(matches!(err, Error::BadConnection(_)));
    assert_eq!(snapshot_bytes(&engine), before);
}

#[test]
fn test_tempo_undo_round_trip() {
    let (engine, mut processor) = engine();
    engine.set_tempo(60.0).unwrap();
    run_cycle(&mut processor, 64);
    assert_eq!(engine.transport().bpm(), 60.0);

    engine.undo().unwrap();
    run_cycle(&mut processor, 64);
    assert_eq!(engine.transport().bpm(), 120.0);

    engine.redo().unwrap();
    run_cycle(&mut processor, 64);
    assert_eq!(engine.transport().bpm(), 60.0);
}

#[test]
fn test_fader_gain_undo_round_trip() {
    let (engine, mut processor) = engine();
    let clip = dc_clip(&engine.clip_pool(), 1.0, 48000);
    let track = engine.add_audio_track("dc").unwrap();
    engine
        .add_audio_region(track, AudioRegion::new(clip, 0, 48000))
        .unwrap();
    engine.set_fader_gain(track, 0.5).unwrap();
    engine.transport().play();

    let out = run_cycle(&mut processor, 64);
    assert!((out.left[0] - 0.5).abs() < 1e-6);

    engine.undo().unwrap();
    let out = run_cycle(&mut processor, 64);
    assert!((out.left[0] - 1.0).abs() < 1e-6);
}

#[test]
fn test_undo_depth_bounded_with_fifo_eviction() {
    let (engine, _processor) = OstinatoEngine::builder()
        .sample_rate(SR)
        .undo_depth(4)
        .build()
        .unwrap();
    for i in 0..10 {
        engine.set_tempo(60.0 + i as f32).unwrap();
    }
    assert_eq!(engine.undo_depth().0, 4);
    // Only four undos are available.
    for _ in 0..4 {
        engine.undo().unwrap();
    }
    assert!(engine.undo().is_err());
}

#[test]
fn test_binding_undo_round_trip() {
    let (engine, _processor) = engine();
    let track = engine.add_audio_track("a").unwrap();
    let fader = engine.track_ports(track).unwrap().fader_gain;

    let before = snapshot_bytes(&engine);
    engine
        .add_cc_binding(Binding::new(
            [0xB0, 7, 0],
            BindingTarget::SetControl {
                port_key: fader.key(),
            },
        ))
        .unwrap();
    let with_binding = snapshot_bytes(&engine);

    engine.undo().unwrap();
    assert_eq!(snapshot_bytes(&engine), before);
    engine.redo().unwrap();
    assert_eq!(snapshot_bytes(&engine), with_binding);
}

#[test]
fn test_region_move_undo() {
    let (engine, _processor) = engine();
    let clip = dc_clip(&engine.clip_pool(), 1.0, 4800);
    let track = engine.add_audio_track("a").unwrap();
    engine
        .add_audio_region(track, AudioRegion::new(clip, 0, 4800))
        .unwrap();
    let before = snapshot_bytes(&engine);

    engine.move_audio_region(track, 0, 1000, 5800).unwrap();
    let region = engine.snapshot().tracks[1].audio_regions[0].clone();
    assert_eq!((region.start, region.end), (1000, 5800));

    engine.undo().unwrap();
    assert_eq!(snapshot_bytes(&engine), before);
}
