//! End-to-end scenarios: a fake host drives the processor cycle by cycle
//! while the engine is edited from the "UI" side.

mod helpers;

use approx::assert_abs_diff_eq;
use helpers::*;
use ostinato::prelude::*;
use ostinato::{ChangeEvent, Connection, EnginePorts, Position};

fn engine() -> (ostinato::OstinatoEngine, ostinato::AudioProcessor) {
    OstinatoEngine::builder().sample_rate(SR).build().unwrap()
}

#[test]
fn test_empty_graph_paused_cycle() {
    let (engine, mut processor) = engine();
    let consumer = engine.take_change_consumer().unwrap();

    let out = run_cycle(&mut processor, 256);

    assert!(out.left.iter().all(|&v| v == 0.0));
    assert!(out.right.iter().all(|&v| v == 0.0));
    assert!(out.midi.is_empty());
    assert_eq!(engine.transport().playhead(), 0);
    assert!(consumer.drain().is_empty());
}

#[test]
fn test_single_track_renders_clip_verbatim() {
    let (engine, mut processor) = engine();
    let clip = import_sine(&engine.clip_pool());
    let track = engine.add_audio_track("sine").unwrap();
    engine
        .add_audio_region(track, AudioRegion::new(clip, 0, 48000))
        .unwrap();
    engine.transport().play();

    let reference = sine_samples();
    let first = run_cycle(&mut processor, 1024);
    let second = run_cycle(&mut processor, 1024);

    for i in 0..1024 {
        assert_abs_diff_eq!(first.left[i], reference[i], epsilon = 1e-6);
        assert_abs_diff_eq!(first.right[i], reference[i], epsilon = 1e-6);
        assert_abs_diff_eq!(second.left[i], reference[1024 + i], epsilon = 1e-6);
    }
    assert_eq!(engine.transport().playhead(), 2048);
}

#[test]
fn test_linear_fade_in_scales_first_samples() {
    let (engine, mut processor) = engine();
    let clip = import_sine(&engine.clip_pool());
    let track = engine.add_audio_track("sine").unwrap();
    let mut region = AudioRegion::new(clip, 0, 48000);
    region.fade_in_end = 32;
    engine.add_audio_region(track, region).unwrap();
    engine.transport().play();

    let reference = sine_samples();
    let first = run_cycle(&mut processor, 1024);
    let second = run_cycle(&mut processor, 1024);

    for i in 0..32 {
        let expected = reference[i] * (i as f32 / 32.0);
        assert_abs_diff_eq!(first.left[i], expected, epsilon = 1e-6);
    }
    for i in 32..1024 {
        assert_abs_diff_eq!(first.left[i], reference[i], epsilon = 1e-6);
    }
    for i in 0..1024 {
        assert_abs_diff_eq!(second.left[i], reference[1024 + i], epsilon = 1e-6);
    }
}

#[test]
fn test_midi_region_emits_note_on_at_offset() {
    let (engine, mut processor) = engine();
    let track = engine.add_midi_track("keys").unwrap();
    let mut region = MidiRegion::new(0, 48000);
    region.notes.push(MidiNote {
        start: 500,
        length: 1000,
        pitch: 60,
        velocity: 100,
        channel: 0,
    });
    engine.add_midi_region(track, region).unwrap();

    let ports = engine.track_ports(track).unwrap();
    engine
        .connect(Connection::new(ports.midi_out, EnginePorts::midi_out()))
        .unwrap();
    engine.transport().play();

    let out = run_cycle(&mut processor, 1024);
    assert_eq!(out.midi.len(), 1);
    assert_eq!(out.midi[0].frame_offset, 500);
    assert_eq!(out.midi[0].data, [0x90, 60, 100]);

    // The note-off at local 1500 belongs to the next cycle.
    let next = run_cycle(&mut processor, 1024);
    assert_eq!(next.midi.len(), 1);
    assert!(next.midi[0].is_note_off());
    assert_eq!(next.midi[0].frame_offset, 1500 - 1024);
}

#[test]
fn test_gain_connected_ports_sum_with_multiplier() {
    let (engine, mut processor) = engine();
    let clip = dc_clip(&engine.clip_pool(), 1.0, 48000);
    let a = engine.add_audio_track("a").unwrap();
    engine
        .add_audio_region(a, AudioRegion::new(clip, 0, 48000))
        .unwrap();
    let b = engine.add_audio_track("b").unwrap();

    let a_ports = engine.track_ports(a).unwrap();
    let b_ports = engine.track_ports(b).unwrap();
    engine
        .connect(Connection::new(a_ports.out_l, b_ports.in_l).with_multiplier(0.5))
        .unwrap();
    engine
        .connect(Connection::new(a_ports.out_r, b_ports.in_r).with_multiplier(0.5))
        .unwrap();
    engine.transport().play();

    let out = run_cycle(&mut processor, 64);
    // Master sums A directly (1.0) plus A through B's strip (0.5).
    for &v in &out.left {
        assert_abs_diff_eq!(v, 1.5, epsilon = 1e-6);
    }
}

#[test]
fn test_bpm_change_via_control_port() {
    let (engine, mut processor) = engine();
    let consumer = engine.take_change_consumer().unwrap();

    let tick = Position::from_ticks(960);
    let before = processor.transport().position_to_frames(tick);

    engine.send_control(EnginePorts::bpm(), 60.0, false);
    run_cycle(&mut processor, 256);

    let after = processor.transport().position_to_frames(tick);
    assert_eq!(after, before * 2);

    let bpm_events: Vec<_> = consumer
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ChangeEvent::TransportBpmChanged(_)))
        .collect();
    assert_eq!(bpm_events.len(), 1);
    assert_eq!(bpm_events[0], ChangeEvent::TransportBpmChanged(60.0));
}

#[test]
fn test_pause_takes_effect_at_cycle_boundary() {
    let (engine, mut processor) = engine();
    let clip = dc_clip(&engine.clip_pool(), 0.5, 48000);
    let track = engine.add_audio_track("dc").unwrap();
    engine
        .add_audio_region(track, AudioRegion::new(clip, 0, 48000))
        .unwrap();

    engine.transport().play();
    run_cycle(&mut processor, 512);
    assert_eq!(engine.transport().playhead(), 512);

    engine.transport().pause();
    // The pause is applied at the top of the next cycle; that whole cycle
    // is already silent and the playhead holds.
    let out = run_cycle(&mut processor, 512);
    assert_eq!(engine.transport().playhead(), 512);
    assert!(out.left.iter().all(|&v| v.abs() < 1e-12));
}

#[test]
fn test_transport_loop_is_sample_accurate() {
    let (engine, mut processor) = engine();
    let frames: Vec<f32> = (0..48000).map(|i| i as f32 / 48000.0).collect();
    let clip = engine.clip_pool().insert("ramp", 48000, 1, frames).unwrap();
    let track = engine.add_audio_track("ramp").unwrap();
    engine
        .add_audio_region(track, AudioRegion::new(clip, 0, 48000))
        .unwrap();

    engine.transport().set_loop(0, 1000, true);
    engine.transport().play();

    // 4 cycles of 300 frames: wraps at frame 1000 into the second repeat.
    let mut all = Vec::new();
    for _ in 0..4 {
        all.extend(run_cycle(&mut processor, 300).left);
    }
    assert_abs_diff_eq!(all[999], 999.0 / 48000.0, epsilon = 1e-6);
    assert_abs_diff_eq!(all[1000], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(all[1001], 1.0 / 48000.0, epsilon = 1e-6);
    assert_eq!(engine.transport().playhead(), 200);
}

#[test]
fn test_reconfigure_sample_rate() {
    let (engine, mut processor) = engine();
    let clip = dc_clip(&engine.clip_pool(), 1.0, 48000);
    let track = engine.add_audio_track("dc").unwrap();
    engine
        .add_audio_region(track, AudioRegion::new(clip, 0, 48000))
        .unwrap();

    let tick = Position::from_ticks(960);
    assert_eq!(processor.transport().position_to_frames(tick), 24000);

    engine.reconfigure(44100.0, 1024).unwrap();
    engine.transport().play();
    run_cycle(&mut processor, 256);

    // One beat at 120 BPM is now 22050 frames, and audio still flows.
    assert_eq!(processor.transport().position_to_frames(tick), 22050);
    assert_eq!(engine.sample_rate(), 44100.0);
    let out = run_cycle(&mut processor, 256);
    assert!((out.left[0] - 1.0).abs() < 1e-6);

    // An invalid format is rejected and nothing changes.
    assert!(engine.reconfigure(1000.0, 1024).is_err());
    assert_eq!(engine.sample_rate(), 44100.0);
}

#[test]
fn test_transport_trigger_ports() {
    let (engine, mut processor) = engine();
    assert!(!engine.transport().is_rolling());

    engine.send_control(EnginePorts::transport_roll(), 1.0, false);
    run_cycle(&mut processor, 128);
    assert!(engine.transport().is_rolling());

    engine.send_control(EnginePorts::transport_stop(), 1.0, false);
    run_cycle(&mut processor, 128);
    assert!(!engine.transport().is_rolling());
}

#[test]
fn test_worker_pool_matches_inline_processing() {
    let build = |workers: usize| {
        let (engine, processor) = OstinatoEngine::builder()
            .sample_rate(SR)
            .worker_threads(workers)
            .build()
            .unwrap();
        let clip = import_sine(&engine.clip_pool());
        for name in ["a", "b", "c"] {
            let track = engine.add_audio_track(name).unwrap();
            engine
                .add_audio_region(track, AudioRegion::new(clip, 0, 48000))
                .unwrap();
        }
        engine.transport().play();
        (engine, processor)
    };

    let (_e1, mut inline) = build(0);
    let (_e2, mut pooled) = build(2);

    for _ in 0..8 {
        let a = run_cycle(&mut inline, 512);
        let b = run_cycle(&mut pooled, 512);
        for i in 0..512 {
            assert_abs_diff_eq!(a.left[i], b.left[i], epsilon = 1e-6);
        }
    }
}
