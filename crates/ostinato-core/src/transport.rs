//! Transport: play state, playhead, loop range, tempo publication.
//!
//! All fields crossing threads are atomics or `ArcSwap` snapshots. The
//! audio thread is the only writer of the playhead; UI mutations arrive as
//! commands and take effect at cycle boundaries, never mid-cycle.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::commands::{CommandSender, EngineCommand};
use crate::lockfree::{AtomicDouble, AtomicFlag, AtomicFloat, AtomicFrames};
use crate::position::{Position, TICKS_PER_BEAT};
use crate::tempo_map::{TempoMap, TempoMapSnapshot, MAX_BPM, MIN_BPM};

/// Transport play state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayState {
    Paused = 0,
    Rolling = 1,
    PreRoll = 2,
}

impl PlayState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PlayState::Rolling,
            2 => PlayState::PreRoll,
            _ => PlayState::Paused,
        }
    }
}

/// One contiguous run of frames within a cycle. Cycles are split at
/// transport-loop wraps so region playback never sees a wrap inside a
/// segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Global frame of the segment's first sample.
    pub global_start: u64,
    /// Offset of that sample within the cycle.
    pub offset: usize,
    pub len: usize,
    /// Notes already sounding at the segment start should be retriggered
    /// (set after seeks and loop wraps).
    pub chase: bool,
}

/// The transport's plan for one cycle.
#[derive(Clone, Debug)]
pub struct CycleWindow {
    pub rolling: bool,
    pub segments: SmallVec<[Segment; 2]>,
    pub end_playhead: u64,
    pub wrapped: bool,
}

/// Shared transport state.
pub struct Transport {
    state: AtomicU8,
    playhead: AtomicFrames,
    loop_enabled: AtomicFlag,
    loop_start: AtomicFrames,
    loop_end: AtomicFrames,
    preroll_frames: u64,
    preroll_remaining: AtomicFrames,
    bpm: AtomicFloat,
    /// Constant-tempo fast path for tick conversion on the audio thread.
    frames_per_tick: AtomicDouble,
    time_sig_num: AtomicU32,
    time_sig_den: AtomicU32,
    tempo_map: ArcSwap<TempoMapSnapshot>,
    /// Follows the applied tempo snapshot; changes on host reconfiguration.
    sample_rate: AtomicDouble,
}

impl Transport {
    pub fn new(snapshot: Arc<TempoMapSnapshot>, preroll_frames: u64) -> Self {
        let sample_rate = snapshot.sample_rate();
        let bpm = snapshot.bpm();
        let (num, den) = snapshot.time_signature_at(0);
        Self {
            state: AtomicU8::new(PlayState::Paused as u8),
            playhead: AtomicFrames::new(0),
            loop_enabled: AtomicFlag::new(false),
            loop_start: AtomicFrames::new(0),
            loop_end: AtomicFrames::new(0),
            preroll_frames,
            preroll_remaining: AtomicFrames::new(0),
            bpm: AtomicFloat::new(bpm),
            frames_per_tick: AtomicDouble::new(Self::derive_frames_per_tick(bpm, sample_rate)),
            time_sig_num: AtomicU32::new(num),
            time_sig_den: AtomicU32::new(den),
            tempo_map: ArcSwap::new(snapshot),
            sample_rate: AtomicDouble::new(sample_rate),
        }
    }

    #[inline]
    fn derive_frames_per_tick(bpm: f32, sample_rate: f64) -> f64 {
        sample_rate * 60.0 / (f64::from(bpm) * TICKS_PER_BEAT as f64)
    }

    #[inline]
    pub fn state(&self) -> PlayState {
        PlayState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_rolling(&self) -> bool {
        self.state() == PlayState::Rolling
    }

    #[inline]
    pub fn playhead(&self) -> u64 {
        self.playhead.get()
    }

    #[inline]
    pub fn bpm(&self) -> f32 {
        self.bpm.get()
    }

    pub fn time_signature(&self) -> (u32, u32) {
        (
            self.time_sig_num.load(Ordering::Acquire),
            self.time_sig_den.load(Ordering::Acquire),
        )
    }

    pub fn loop_range(&self) -> Option<(u64, u64)> {
        self.loop_enabled
            .get()
            .then(|| (self.loop_start.get(), self.loop_end.get()))
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate.get()
    }

    /// Current tick-to-frame factor.
    #[inline]
    pub fn frames_per_tick(&self) -> f64 {
        self.frames_per_tick.get()
    }

    /// Frame position of `p` under the current tempo (constant-tempo fast
    /// path; segment integration lives on the snapshot).
    #[inline]
    pub fn position_to_frames(&self, p: Position) -> i64 {
        (p.as_ticks_f64() * self.frames_per_tick.get()).round() as i64
    }

    pub fn tempo_snapshot(&self) -> Arc<TempoMapSnapshot> {
        self.tempo_map.load_full()
    }

    // Appliers, run on the audio thread at cycle boundaries.

    pub(crate) fn apply_play(&self) {
        if self.state() != PlayState::Paused {
            return;
        }
        if self.preroll_frames > 0 {
            self.preroll_remaining.set(self.preroll_frames);
            self.state.store(PlayState::PreRoll as u8, Ordering::Release);
        } else {
            self.state.store(PlayState::Rolling as u8, Ordering::Release);
        }
    }

    pub(crate) fn apply_pause(&self) {
        self.state.store(PlayState::Paused as u8, Ordering::Release);
    }

    pub(crate) fn apply_toggle(&self) {
        match self.state() {
            PlayState::Paused => self.apply_play(),
            _ => self.apply_pause(),
        }
    }

    pub(crate) fn apply_seek(&self, frame: u64) {
        self.playhead.set(frame);
    }

    pub(crate) fn apply_loop(&self, start: u64, end: u64, enabled: bool) {
        self.loop_start.set(start);
        self.loop_end.set(end);
        self.loop_enabled.set(enabled && end > start);
    }

    pub(crate) fn apply_tempo_snapshot(&self, snapshot: Arc<TempoMapSnapshot>, bpm: f32) {
        let bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        let sample_rate = snapshot.sample_rate();
        let (num, den) = snapshot.time_signature_at(0);
        self.time_sig_num.store(num, Ordering::Release);
        self.time_sig_den.store(den, Ordering::Release);
        self.tempo_map.store(snapshot);
        self.sample_rate.set(sample_rate);
        self.bpm.set(bpm);
        self.frames_per_tick
            .set(Self::derive_frames_per_tick(bpm, sample_rate));
    }

    /// Constant-tempo change from a control port. The full map snapshot is
    /// refreshed by the UI when it observes the change event; frame
    /// conversion switches immediately.
    pub(crate) fn apply_bpm_rt(&self, bpm: f32) -> f32 {
        let bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        self.bpm.set(bpm);
        self.frames_per_tick
            .set(Self::derive_frames_per_tick(bpm, self.sample_rate.get()));
        bpm
    }

    /// Plan the coming cycle: where each frame run starts and whether the
    /// transport advances. Splits at loop wraps; tiny loops may wrap more
    /// than once per cycle.
    pub fn plan_cycle(&self, n_frames: usize, chase_pending: bool) -> CycleWindow {
        let rolling = self.state() == PlayState::Rolling;
        let start = self.playhead.get();
        let mut segments: SmallVec<[Segment; 2]> = SmallVec::new();

        if !rolling {
            segments.push(Segment {
                global_start: start,
                offset: 0,
                len: n_frames,
                chase: false,
            });
            return CycleWindow {
                rolling: false,
                segments,
                end_playhead: start,
                wrapped: false,
            };
        }

        let loop_range = self.loop_range();
        let mut pos = start;
        let mut offset = 0usize;
        let mut remaining = n_frames;
        let mut wrapped = false;
        let mut chase = chase_pending;

        while remaining > 0 {
            let len = match loop_range {
                Some((_, le)) if pos < le && pos + remaining as u64 > le => (le - pos) as usize,
                _ => remaining,
            };
            segments.push(Segment {
                global_start: pos,
                offset,
                len,
                chase,
            });
            offset += len;
            remaining -= len;
            pos += len as u64;
            if let Some((ls, le)) = loop_range {
                if pos == le && remaining > 0 {
                    pos = ls;
                    wrapped = true;
                    chase = true;
                    continue;
                }
            }
            chase = false;
        }

        CycleWindow {
            rolling: true,
            segments,
            end_playhead: pos,
            wrapped,
        }
    }

    /// Advance state at the end of a cycle.
    pub fn commit_cycle(&self, window: &CycleWindow, n_frames: usize) {
        match self.state() {
            PlayState::Rolling => self.playhead.set(window.end_playhead),
            PlayState::PreRoll => {
                let remaining = self.preroll_remaining.get();
                let step = (n_frames as u64).min(remaining);
                self.preroll_remaining.set(remaining - step);
                if remaining <= n_frames as u64 {
                    self.state.store(PlayState::Rolling as u8, Ordering::Release);
                }
            }
            PlayState::Paused => {}
        }
    }
}

/// Fluent UI-side transport handle. Mutations travel through the command
/// queue; tempo edits additionally rebuild the canonical tempo map and ship
/// the new snapshot along.
#[derive(Clone)]
pub struct TransportHandle {
    transport: Arc<Transport>,
    commands: CommandSender,
    tempo: Arc<Mutex<TempoMap>>,
}

impl TransportHandle {
    pub(crate) fn new(
        transport: Arc<Transport>,
        commands: CommandSender,
        tempo: Arc<Mutex<TempoMap>>,
    ) -> Self {
        Self {
            transport,
            commands,
            tempo,
        }
    }

    pub fn play(&self) {
        self.commands.send(EngineCommand::Play);
    }

    pub fn pause(&self) {
        self.commands.send(EngineCommand::Pause);
    }

    pub fn toggle_play(&self) {
        self.commands.send(EngineCommand::TogglePlay);
    }

    pub fn set_position(&self, frame: u64) {
        self.commands.send(EngineCommand::SetPosition(frame));
    }

    /// Seek by musical position under the canonical tempo map.
    pub fn set_musical_position(&self, p: Position) {
        let frame = self.tempo.lock().to_frames(p).max(0) as u64;
        self.set_position(frame);
    }

    pub fn return_to_start(&self) {
        self.set_position(0);
    }

    pub fn set_loop(&self, start: u64, end: u64, enabled: bool) {
        self.commands.send(EngineCommand::SetLoop {
            start,
            end,
            enabled,
        });
    }

    pub fn set_bpm(&self, bpm: f32) {
        let snapshot = {
            let mut tempo = self.tempo.lock();
            tempo.set_bpm(bpm);
            tempo.snapshot()
        };
        self.commands.send(EngineCommand::ApplyTempoMap {
            bpm: snapshot.bpm(),
            snapshot,
        });
    }

    pub fn set_time_signature(&self, numerator: u32, denominator: u32) -> crate::Result<()> {
        let snapshot = {
            let mut tempo = self.tempo.lock();
            tempo.set_time_signature(numerator, denominator)?;
            tempo.snapshot()
        };
        self.commands.send(EngineCommand::ApplyTimeSignature {
            snapshot,
            numerator,
            denominator,
        });
        Ok(())
    }

    pub fn play_state(&self) -> PlayState {
        self.transport.state()
    }

    pub fn is_rolling(&self) -> bool {
        self.transport.is_rolling()
    }

    pub fn playhead(&self) -> u64 {
        self.transport.playhead()
    }

    pub fn bpm(&self) -> f32 {
        self.transport.bpm()
    }

    pub fn time_signature(&self) -> (u32, u32) {
        self.transport.time_signature()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Transport {
        let map = TempoMap::new(120.0, 48000.0);
        Transport::new(map.snapshot(), 0)
    }

    #[test]
    fn test_initial_state() {
        let t = transport();
        assert_eq!(t.state(), PlayState::Paused);
        assert_eq!(t.playhead(), 0);
        assert_eq!(t.bpm(), 120.0);
        assert_eq!(t.time_signature(), (4, 4));
    }

    #[test]
    fn test_paused_cycle_does_not_advance() {
        let t = transport();
        let w = t.plan_cycle(256, false);
        assert!(!w.rolling);
        assert_eq!(w.segments.len(), 1);
        t.commit_cycle(&w, 256);
        assert_eq!(t.playhead(), 0);
    }

    #[test]
    fn test_rolling_advances_exactly_n_frames() {
        let t = transport();
        t.apply_play();
        for i in 0..4u64 {
            let w = t.plan_cycle(1024, false);
            assert_eq!(w.segments[0].global_start, i * 1024);
            t.commit_cycle(&w, 1024);
        }
        assert_eq!(t.playhead(), 4096);
    }

    #[test]
    fn test_loop_wrap_splits_cycle() {
        let t = transport();
        t.apply_play();
        t.apply_loop(0, 1000, true);
        t.apply_seek(900);

        let w = t.plan_cycle(256, false);
        assert!(w.wrapped);
        assert_eq!(w.segments.len(), 2);
        assert_eq!(w.segments[0].global_start, 900);
        assert_eq!(w.segments[0].len, 100);
        assert_eq!(w.segments[1].global_start, 0);
        assert_eq!(w.segments[1].offset, 100);
        assert_eq!(w.segments[1].len, 156);
        assert!(w.segments[1].chase);
        assert_eq!(w.end_playhead, 156);
    }

    #[test]
    fn test_tiny_loop_wraps_repeatedly() {
        let t = transport();
        t.apply_play();
        t.apply_loop(0, 100, true);

        let w = t.plan_cycle(256, false);
        assert_eq!(w.segments.len(), 3);
        let total: usize = w.segments.iter().map(|s| s.len).sum();
        assert_eq!(total, 256);
        assert_eq!(w.end_playhead, 56);
    }

    #[test]
    fn test_degenerate_loop_disabled() {
        let t = transport();
        t.apply_loop(500, 100, true);
        assert_eq!(t.loop_range(), None);
    }

    #[test]
    fn test_preroll_counts_down_then_rolls() {
        let map = TempoMap::new(120.0, 48000.0);
        let t = Transport::new(map.snapshot(), 512);
        t.apply_play();
        assert_eq!(t.state(), PlayState::PreRoll);

        let w = t.plan_cycle(256, false);
        assert!(!w.rolling);
        t.commit_cycle(&w, 256);
        assert_eq!(t.state(), PlayState::PreRoll);
        assert_eq!(t.playhead(), 0);

        let w = t.plan_cycle(256, false);
        t.commit_cycle(&w, 256);
        assert_eq!(t.state(), PlayState::Rolling);
        assert_eq!(t.playhead(), 0);

        let w = t.plan_cycle(256, false);
        t.commit_cycle(&w, 256);
        assert_eq!(t.playhead(), 256);
    }

    #[test]
    fn test_bpm_rt_change_scales_frames_per_tick() {
        let t = transport();
        let p = Position::from_ticks(1000);
        let before = t.position_to_frames(p);
        t.apply_bpm_rt(60.0);
        assert_eq!(t.position_to_frames(p), before * 2);
    }

    #[test]
    fn test_tempo_snapshot_swap() {
        let t = transport();
        let mut map = TempoMap::new(120.0, 48000.0);
        map.set_bpm(90.0);
        t.apply_tempo_snapshot(map.snapshot(), 90.0);
        assert_eq!(t.bpm(), 90.0);
        assert_eq!(t.tempo_snapshot().bpm(), 90.0);
    }

    #[test]
    fn test_chase_pending_marks_first_segment() {
        let t = transport();
        t.apply_play();
        let w = t.plan_cycle(128, true);
        assert!(w.segments[0].chase);
        let w = t.plan_cycle(128, false);
        assert!(!w.segments[0].chase);
    }
}
