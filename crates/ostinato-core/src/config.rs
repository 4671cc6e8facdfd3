//! Engine configuration.

use crate::error::{Error, Result};

/// Configuration snapshot the engine is built from.
#[derive(Debug, Clone)]
pub struct OstinatoConfig {
    pub sample_rate: f64,
    /// Largest cycle the host will request.
    pub max_block: usize,
    /// DSP worker threads besides the audio thread. 0 processes inline.
    pub worker_threads: usize,
    pub host_audio_inputs: usize,
    pub host_audio_outputs: usize,
    pub midi_ring_capacity: usize,
    pub change_bus_capacity: usize,
    pub undo_depth: usize,
    /// Frames of pre-roll before the transport starts rolling.
    pub preroll_frames: u64,
    pub initial_bpm: f32,
}

impl Default for OstinatoConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            max_block: 2048,
            worker_threads: 0,
            host_audio_inputs: 2,
            host_audio_outputs: 2,
            midi_ring_capacity: 1024,
            change_bus_capacity: 256,
            undo_depth: 128,
            preroll_frames: 0,
            initial_bpm: 120.0,
        }
    }
}

impl OstinatoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate < 8000.0 || self.sample_rate > 384_000.0 {
            return Err(Error::InvalidConfig(format!(
                "sample_rate {} out of range (8000-384000 Hz)",
                self.sample_rate
            )));
        }
        if self.max_block < 16 || self.max_block > 16_384 {
            return Err(Error::InvalidConfig(format!(
                "max_block {} out of range (16-16384 frames)",
                self.max_block
            )));
        }
        if self.host_audio_outputs == 0 {
            return Err(Error::InvalidConfig("no host output channels".into()));
        }
        if self.undo_depth == 0 {
            return Err(Error::InvalidConfig("undo_depth must be at least 1".into()));
        }
        if !(20.0..=999.0).contains(&self.initial_bpm) {
            return Err(Error::InvalidConfig(format!(
                "initial_bpm {} out of range (20-999)",
                self.initial_bpm
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(OstinatoConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_sample_rate_rejected() {
        let config = OstinatoConfig {
            sample_rate: 1000.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_outputs_rejected() {
        let config = OstinatoConfig {
            host_audio_outputs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
