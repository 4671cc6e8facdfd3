//! Clip storage and region playback for the Ostinato engine.
//!
//! - [`ClipPool`]: content-addressed store of decoded audio clips
//! - [`AudioRegion`] / [`MidiRegion`]: timeline regions over clips and notes
//! - [`StereoStretcher`]: real-time grain stretcher for musical mode
//! - [`render_audio_region`] / [`render_midi_region`]: per-cycle rendering

pub mod error;
pub use error::{ClipError, RenderError, Result};

mod pool;
pub use pool::{AudioClip, ClipId, ClipPool};

mod region;
pub use region::{AudioRegion, FadeCurve, MidiNote, MidiRegion, RegionKind};

mod stretch;
pub use stretch::{GrainStretcher, StereoStretcher};

mod playback;
pub use playback::{render_audio_region, render_midi_region, RegionPlayer, STRETCH_BPM_EPSILON};
