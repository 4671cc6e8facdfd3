//! Timeline regions: audio clips and MIDI note containers.
//!
//! Positions are resolved to timeline frames by the arrangement layer;
//! everything here works in frames so the hot path never touches musical
//! time.

use serde::{Deserialize, Serialize};

use crate::pool::ClipId;

/// Region kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    Audio,
    Midi,
}

/// Fade envelope shapes. `shape(t)` maps rising `t ∈ [0,1]` to a gain in
/// `[0,1]`; fade-outs evaluate the mirrored curve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FadeCurve {
    #[default]
    Linear,
    Exponential,
    SCurve,
}

impl FadeCurve {
    #[inline]
    pub fn shape(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => t,
            FadeCurve::Exponential => t * t,
            FadeCurve::SCurve => t * t * (3.0 - 2.0 * t),
        }
    }

    /// Fade-in gain at `pos` of `len` frames.
    #[inline]
    pub fn fade_in(&self, pos: u64, len: u64) -> f32 {
        if len == 0 {
            return 1.0;
        }
        self.shape(pos as f32 / len as f32)
    }

    /// Fade-out gain at `pos` of `len` frames (1 at the start, 0 at the end).
    #[inline]
    pub fn fade_out(&self, pos: u64, len: u64) -> f32 {
        if len == 0 {
            return 1.0;
        }
        self.shape(1.0 - pos as f32 / len as f32)
    }
}

/// An audio region placed on the timeline.
///
/// `start`/`end` are global timeline frames. All other offsets are local
/// frames relative to the region start. Invariants (checked by
/// [`AudioRegion::validate`]):
/// `0 ≤ fade_in_end ≤ fade_out_start ≤ length`, and when looping,
/// `loop_end − loop_start ≤ clip length` with `loop_start < loop_end`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioRegion {
    pub start: u64,
    pub end: u64,
    pub clip: ClipId,
    /// Offset into the clip at the region start.
    pub clip_start: u64,
    /// Loop window in clip-local frames; `loop_end == 0` disables looping.
    pub loop_start: u64,
    pub loop_end: u64,
    /// Fade-in ends this many frames after the region start.
    pub fade_in_end: u64,
    /// Fade-out starts this many frames after the region start.
    pub fade_out_start: u64,
    pub fade_in_curve: FadeCurve,
    pub fade_out_curve: FadeCurve,
    /// Linear gain.
    pub gain: f32,
    /// Stretch the clip to the project tempo.
    pub musical_mode: bool,
    /// Cached source tempo; falls back to the clip's tag.
    pub source_bpm: Option<f32>,
}

impl AudioRegion {
    /// A plain region covering `[start, end)` with no loop, no fades,
    /// unity gain.
    pub fn new(clip: ClipId, start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            clip,
            clip_start: 0,
            loop_start: 0,
            loop_end: 0,
            fade_in_end: 0,
            fade_out_start: end.saturating_sub(start),
            fade_in_curve: FadeCurve::Linear,
            fade_out_curve: FadeCurve::Linear,
            gain: 1.0,
            musical_mode: false,
            source_bpm: None,
        }
    }

    #[inline]
    pub fn length(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn looped(&self) -> bool {
        self.loop_end > self.loop_start
    }

    #[inline]
    pub fn loop_length(&self) -> u64 {
        self.loop_end.saturating_sub(self.loop_start)
    }

    /// Map a region-local frame to a clip frame, honoring the loop window.
    #[inline]
    pub fn clip_frame(&self, local: u64) -> u64 {
        let raw = self.clip_start + local;
        if self.looped() && raw >= self.loop_end {
            self.loop_start + (raw - self.loop_start) % self.loop_length()
        } else {
            raw
        }
    }

    /// Next region-local frame (at or after `local`) where the loop wraps,
    /// if the region loops. Cycle callers split their windows here.
    pub fn next_loop_boundary(&self, local: u64) -> Option<u64> {
        if !self.looped() {
            return None;
        }
        let raw = self.clip_start + local;
        if raw < self.loop_end {
            return Some(local + (self.loop_end - raw));
        }
        let into = (raw - self.loop_start) % self.loop_length();
        Some(local + (self.loop_length() - into))
    }

    pub fn validate(&self, clip_length: u64) -> bool {
        let len = self.length();
        self.start <= self.end
            && self.fade_in_end <= self.fade_out_start
            && self.fade_out_start <= len
            && (!self.looped()
                || (self.loop_length() <= clip_length && self.loop_end <= clip_length))
            && self.gain.is_finite()
            && self.gain >= 0.0
    }

    /// Combined fade envelope at a region-local frame.
    #[inline]
    pub fn fade_gain(&self, local: u64) -> f32 {
        let mut g = 1.0;
        if local < self.fade_in_end {
            g *= self.fade_in_curve.fade_in(local, self.fade_in_end);
        }
        if local >= self.fade_out_start {
            let tail = self.length() - self.fade_out_start;
            g *= self
                .fade_out_curve
                .fade_out(local - self.fade_out_start, tail);
        }
        g
    }
}

/// A note inside a MIDI region. Offsets are region-local frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiNote {
    pub start: u64,
    pub length: u64,
    pub pitch: u8,
    pub velocity: u8,
    pub channel: u8,
}

impl MidiNote {
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// A MIDI region placed on the timeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiRegion {
    pub start: u64,
    pub end: u64,
    pub notes: Vec<MidiNote>,
}

impl MidiRegion {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            notes: Vec::new(),
        }
    }

    #[inline]
    pub fn length(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn validate(&self) -> bool {
        self.start <= self.end && self.notes.iter().all(|n| n.end() <= self.length())
    }
}
