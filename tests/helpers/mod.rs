//! Shared helpers for the integration suite: manual cycle driving with a
//! fake host, plus deterministic test content.

#![allow(dead_code)]

use ostinato::prelude::*;
use ostinato::{AudioProcessor, ClipPool, HostIo};

pub const SR: f64 = 48000.0;

/// Everything one host callback produced.
pub struct CycleOutput {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    pub midi: Vec<MidiEvent>,
}

/// Drive one callback with silent input.
pub fn run_cycle(processor: &mut AudioProcessor, n: usize) -> CycleOutput {
    run_cycle_io(processor, n, &[], &[])
}

/// Drive one callback with explicit host input.
pub fn run_cycle_io(
    processor: &mut AudioProcessor,
    n: usize,
    audio_in: &[&[f32]],
    midi_in: &[MidiEvent],
) -> CycleOutput {
    let mut left = vec![0.0f32; n];
    let mut right = vec![0.0f32; n];
    let mut midi_out = Vec::new();
    {
        let mut outs: Vec<&mut [f32]> = vec![&mut left, &mut right];
        let mut io = HostIo {
            audio_in,
            midi_in,
            audio_out: &mut outs,
            midi_out: &mut midi_out,
        };
        processor.process(&mut io, n);
    }
    CycleOutput {
        left,
        right,
        midi: midi_out,
    }
}

/// One second of a 440 Hz sine at 48 kHz.
pub fn sine_samples() -> Vec<f32> {
    (0..48000)
        .map(|i| (std::f32::consts::TAU * 440.0 * i as f32 / 48000.0).sin())
        .collect()
}

pub fn import_sine(pool: &ClipPool) -> ClipId {
    pool.insert("sine440", 48000, 1, sine_samples()).unwrap()
}

pub fn dc_clip(pool: &ClipPool, level: f32, frames: usize) -> ClipId {
    pool.insert("dc", 48000, 1, vec![level; frames]).unwrap()
}
