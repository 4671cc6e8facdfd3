//! Per-cycle region rendering.
//!
//! Audio regions render into stereo cycle buffers (summing with whatever is
//! already there); MIDI regions append events with cycle-relative offsets.
//! Rendering never panics on the audio thread: clip overruns substitute
//! silence and surface as a [`RenderError`] for the caller to report.

use std::sync::Arc;

use ostinato_midi::MidiEvent;

use crate::error::RenderError;
use crate::pool::AudioClip;
use crate::region::{AudioRegion, MidiRegion};
use crate::stretch::StereoStretcher;

/// Musical mode engages the stretcher only when project and source tempo
/// differ by more than this.
pub const STRETCH_BPM_EPSILON: f32 = 0.01;

/// Stretcher feed chunk.
const FEED_CHUNK: usize = 256;

/// Read one clip frame as a stereo pair; mono clips fan out to both sides.
#[inline]
fn clip_stereo(clip: &AudioClip, frame: u64) -> (f32, f32) {
    if clip.channels >= 2 {
        (clip.sample(0, frame), clip.sample(1, frame))
    } else {
        let mono = clip.sample(0, frame);
        (mono, mono)
    }
}

/// Render the unstretched audio path for one window.
///
/// The window `[cycle_global_start + cycle_offset, +n_frames)` must not
/// cross a loop boundary of `region`; [`RegionPlayer`] splits windows
/// before calling in here. Frames outside the region are left untouched.
/// On clip overrun the remainder stays silent and the overrun is returned.
pub fn render_audio_region(
    region: &AudioRegion,
    clip: &AudioClip,
    cycle_global_start: u64,
    cycle_offset: usize,
    n_frames: usize,
    out_left: &mut [f32],
    out_right: &mut [f32],
) -> Result<(), RenderError> {
    let g0 = cycle_global_start + cycle_offset as u64;
    let rs = g0.max(region.start);
    let re = (g0 + n_frames as u64).min(region.end);
    if rs >= re {
        return Ok(());
    }

    let local0 = rs - region.start;
    let count = (re - rs) as usize;
    let base = cycle_offset + (rs - g0) as usize;

    if let Some(boundary) = region.next_loop_boundary(local0) {
        if boundary < local0 + count as u64 {
            return Err(RenderError::LoopWrapInWindow);
        }
    }

    let clip_len = clip.length_frames();
    let first = region.clip_frame(local0);
    // Within a split window clip frames are contiguous.
    let renderable = if first >= clip_len {
        0
    } else {
        count.min((clip_len - first) as usize)
    };

    for i in 0..renderable {
        let (l, r) = clip_stereo(clip, first + i as u64);
        let g = region.gain * region.fade_gain(local0 + i as u64);
        out_left[base + i] += l * g;
        out_right[base + i] += r * g;
    }

    if renderable < count {
        return Err(RenderError::BufferIndexOutOfRange {
            index: first + renderable as u64,
            length: clip_len,
        });
    }
    Ok(())
}

/// Render the MIDI path for one window, appending events with
/// cycle-relative frame offsets.
///
/// Notes starting inside the window emit note-on; notes ending inside it
/// emit note-off. With `chase` set (first cycle after a locate), notes
/// already sounding at the window start are retriggered at offset zero.
pub fn render_midi_region(
    region: &MidiRegion,
    cycle_global_start: u64,
    cycle_offset: usize,
    n_frames: usize,
    chase: bool,
    out: &mut Vec<MidiEvent>,
) {
    let g0 = cycle_global_start + cycle_offset as u64;
    let rs = g0.max(region.start);
    let re = (g0 + n_frames as u64).min(region.end);
    if rs >= re {
        return;
    }

    let win_start = rs - region.start;
    let win_end = re - region.start;
    let count = (win_end - win_start) as u32;
    let base = (cycle_offset + (rs - g0) as usize) as u32;
    let region_ends_here = re == region.end;

    for note in &region.notes {
        let on = note.start;
        let off = note.end();
        if off < win_start || on >= win_end {
            // No overlap with this window at all; a chase retrigger also
            // needs the note to still be sounding.
            if !(chase && on < win_start && off > win_start) {
                continue;
            }
        }

        if on >= win_start && on < win_end {
            out.push(MidiEvent::note_on(
                base + (on - win_start) as u32,
                note.channel,
                note.pitch,
                note.velocity,
            ));
        } else if chase && on < win_start && off > win_start {
            out.push(MidiEvent::note_on(base, note.channel, note.pitch, note.velocity));
        }

        if off >= win_start && off < win_end {
            out.push(MidiEvent::note_off(
                base + (off - win_start) as u32,
                note.channel,
                note.pitch,
                0,
            ));
        } else if off == win_end && region_ends_here {
            // The region finishes inside this cycle; close the note on its
            // last frame instead of leaking it.
            out.push(MidiEvent::note_off(base + count - 1, note.channel, note.pitch, 0));
        }
    }
}

/// Stateful audio-region renderer.
///
/// Owns the region's stretcher (allocated up front; the render path never
/// allocates) and splits cycle windows at loop boundaries so the inner
/// renderer can assume contiguous clip reads.
pub struct RegionPlayer {
    region: AudioRegion,
    clip: Arc<AudioClip>,
    stretcher: Option<StereoStretcher>,
    scratch_left: Vec<f32>,
    scratch_right: Vec<f32>,
    feed_left: Vec<f32>,
    feed_right: Vec<f32>,
    /// Region-local input frames fed to the stretcher so far, in clip pace.
    feed_pos: f64,
    /// Region-local output frame the next render is expected to start at;
    /// a mismatch means the transport jumped and stretch state is stale.
    expect_local: u64,
    primed: bool,
    /// Clip ran out while feeding; remainder renders silent.
    feed_exhausted: bool,
}

impl RegionPlayer {
    /// `max_block` is the largest cycle the host will request.
    pub fn new(region: AudioRegion, clip: Arc<AudioClip>, sample_rate: f64, max_block: usize) -> Self {
        let stretcher = region.musical_mode.then(|| StereoStretcher::new(sample_rate));
        Self {
            region,
            clip,
            stretcher,
            scratch_left: vec![0.0; max_block],
            scratch_right: vec![0.0; max_block],
            feed_left: vec![0.0; FEED_CHUNK],
            feed_right: vec![0.0; FEED_CHUNK],
            feed_pos: 0.0,
            expect_local: 0,
            primed: false,
            feed_exhausted: false,
        }
    }

    pub fn region(&self) -> &AudioRegion {
        &self.region
    }

    /// Stretch ratio against the current project tempo, when engaged.
    fn stretch_speed(&self, project_bpm: f32) -> Option<f64> {
        if !self.region.musical_mode {
            return None;
        }
        let source = self.region.source_bpm.or(self.clip.source_bpm)?;
        if source <= 0.0 || (project_bpm - source).abs() <= STRETCH_BPM_EPSILON {
            return None;
        }
        Some(f64::from(project_bpm) / f64::from(source))
    }

    /// Render one cycle window, accumulating into the stereo buffers.
    pub fn render(
        &mut self,
        project_bpm: f32,
        cycle_global_start: u64,
        cycle_offset: usize,
        n_frames: usize,
        out_left: &mut [f32],
        out_right: &mut [f32],
    ) -> Result<(), RenderError> {
        if let Some(speed) = self.stretch_speed(project_bpm) {
            return self.render_stretched(
                speed,
                cycle_global_start,
                cycle_offset,
                n_frames,
                out_left,
                out_right,
            );
        }

        // Unstretched path: split the window at loop boundaries and render
        // each contiguous piece.
        let mut offset = cycle_offset;
        let mut remaining = n_frames;
        let mut result = Ok(());
        while remaining > 0 {
            let g0 = cycle_global_start + offset as u64;
            if g0 >= self.region.end {
                break;
            }
            let local = g0.saturating_sub(self.region.start);
            let chunk = match self.region.next_loop_boundary(local) {
                Some(boundary) if g0 >= self.region.start => {
                    remaining.min((boundary - local) as usize)
                }
                _ => remaining,
            };
            let r = render_audio_region(
                &self.region,
                &self.clip,
                cycle_global_start,
                offset,
                chunk,
                out_left,
                out_right,
            );
            if r.is_err() && result.is_ok() {
                result = r;
            }
            offset += chunk;
            remaining -= chunk;
        }
        result
    }

    fn render_stretched(
        &mut self,
        speed: f64,
        cycle_global_start: u64,
        cycle_offset: usize,
        n_frames: usize,
        out_left: &mut [f32],
        out_right: &mut [f32],
    ) -> Result<(), RenderError> {
        let g0 = cycle_global_start + cycle_offset as u64;
        let rs = g0.max(self.region.start);
        let re = (g0 + n_frames as u64).min(self.region.end);
        if rs >= re {
            return Ok(());
        }

        let local0 = rs - self.region.start;
        let count = (re - rs) as usize;
        let base = cycle_offset + (rs - g0) as usize;

        let stretcher = self
            .stretcher
            .as_mut()
            .expect("musical mode region always owns a stretcher");

        if local0 != self.expect_local {
            // Transport jumped; restart stretch state at the new position.
            stretcher.reset();
            self.feed_pos = local0 as f64 * speed;
            self.primed = false;
            self.feed_exhausted = false;
        }

        if !self.primed {
            // Swallow the stretcher's ramp-in so output aligns with the
            // window start.
            let latency = stretcher.latency();
            Self::feed_until(
                stretcher,
                &self.region,
                &self.clip,
                &mut self.feed_pos,
                &mut self.feed_exhausted,
                &mut self.feed_left,
                &mut self.feed_right,
                speed,
                latency,
            );
            let mut skipped = 0;
            while skipped < latency {
                let n = (latency - skipped).min(self.scratch_left.len());
                let got = stretcher.pop_output(
                    &mut self.scratch_left[..n],
                    &mut self.scratch_right[..n],
                );
                if got == 0 {
                    break;
                }
                skipped += got;
            }
            self.primed = true;
        }

        Self::feed_until(
            stretcher,
            &self.region,
            &self.clip,
            &mut self.feed_pos,
            &mut self.feed_exhausted,
            &mut self.feed_left,
            &mut self.feed_right,
            speed,
            count,
        );

        let got = stretcher.pop_output(
            &mut self.scratch_left[..count],
            &mut self.scratch_right[..count],
        );
        for i in 0..got {
            let g = self.region.gain * self.region.fade_gain(local0 + i as u64);
            out_left[base + i] += self.scratch_left[i] * g;
            out_right[base + i] += self.scratch_right[i] * g;
        }

        self.expect_local = local0 + count as u64;

        if self.feed_exhausted && got < count {
            return Err(RenderError::BufferIndexOutOfRange {
                index: self.clip.length_frames(),
                length: self.clip.length_frames(),
            });
        }
        Ok(())
    }

    /// Feed clip frames until `needed` output frames are available or the
    /// clip runs dry. The feed cursor advances in clip pace (`speed` input
    /// frames per output frame) and follows the region's loop mapping.
    #[allow(clippy::too_many_arguments)]
    fn feed_until(
        stretcher: &mut StereoStretcher,
        region: &AudioRegion,
        clip: &AudioClip,
        feed_pos: &mut f64,
        feed_exhausted: &mut bool,
        feed_left: &mut [f32],
        feed_right: &mut [f32],
        speed: f64,
        needed: usize,
    ) {
        let clip_len = clip.length_frames();
        while stretcher.available() < needed && !*feed_exhausted {
            let chunk = feed_left.len();
            for i in 0..chunk {
                let input_local = (*feed_pos + i as f64) as u64;
                let frame = region.clip_frame(input_local);
                if frame >= clip_len {
                    *feed_exhausted = true;
                    feed_left[i..].fill(0.0);
                    feed_right[i..].fill(0.0);
                    break;
                }
                let (l, r) = clip_stereo(clip, frame);
                feed_left[i] = l;
                feed_right[i] = r;
            }
            stretcher.push_input(feed_left, feed_right);
            stretcher.process(speed);
            *feed_pos += chunk as f64;
        }
    }
}
