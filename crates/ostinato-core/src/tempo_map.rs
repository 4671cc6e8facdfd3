//! Tempo and time-signature maps with tick-to-frame conversion.
//!
//! The mutable [`TempoMap`] lives on the main thread; every mutation
//! rebuilds an immutable [`TempoMapSnapshot`] that is published to the
//! audio thread through `ArcSwap` (held by the transport). Conversions
//! integrate segment by segment across tempo changes, with a fast path for
//! the common constant-tempo case.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::position::{Position, TICKS_PER_BEAT};

pub const MIN_BPM: f32 = 20.0;
pub const MAX_BPM: f32 = 999.0;

/// A tempo change taking effect at `tick`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TempoPoint {
    pub tick: i64,
    pub bpm: f32,
}

/// A time-signature change taking effect at `tick`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSigPoint {
    pub tick: i64,
    pub numerator: u32,
    pub denominator: u32,
}

/// Bar/beat/tick display position (1-indexed bar and beat).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Bbt {
    pub bar: u32,
    pub beat: u32,
    pub tick: u32,
}

#[inline]
fn frames_per_tick(bpm: f32, sample_rate: f64) -> f64 {
    sample_rate * 60.0 / (f64::from(bpm) * TICKS_PER_BEAT as f64)
}

/// Immutable conversion table.
#[derive(Clone, Debug)]
pub struct TempoMapSnapshot {
    points: Vec<TempoPoint>,
    sigs: Vec<TimeSigPoint>,
    /// Cumulative frame offset of each tempo point.
    frame_offsets: Vec<f64>,
    sample_rate: f64,
}

impl TempoMapSnapshot {
    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Tempo in effect at the map origin.
    #[inline]
    pub fn bpm(&self) -> f32 {
        self.points[0].bpm
    }

    pub fn bpm_at(&self, tick: i64) -> f32 {
        let idx = match self.points.binary_search_by_key(&tick, |p| p.tick) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        self.points[idx].bpm
    }

    pub fn time_signature_at(&self, tick: i64) -> (u32, u32) {
        let idx = match self.sigs.binary_search_by_key(&tick, |p| p.tick) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        (self.sigs[idx].numerator, self.sigs[idx].denominator)
    }

    /// Unrounded frame position of `p`.
    pub fn to_frames_f64(&self, p: Position) -> f64 {
        let ticks = p.as_ticks_f64();
        if self.points.len() == 1 {
            return ticks * frames_per_tick(self.points[0].bpm, self.sample_rate);
        }
        let idx = match self
            .points
            .binary_search_by_key(&p.ticks, |point| point.tick)
        {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        let point = self.points[idx];
        self.frame_offsets[idx]
            + (ticks - point.tick as f64) * frames_per_tick(point.bpm, self.sample_rate)
    }

    /// Frame position of `p`, rounded to the nearest frame.
    #[inline]
    pub fn to_frames(&self, p: Position) -> i64 {
        self.to_frames_f64(p).round() as i64
    }

    /// Position of frame `n`. Total: any frame maps to a position.
    pub fn from_frames(&self, n: i64) -> Position {
        let frames = n as f64;
        if self.points.len() == 1 {
            let ticks = frames / frames_per_tick(self.points[0].bpm, self.sample_rate);
            return Position::new(0, ticks);
        }
        // Find the segment containing `frames`.
        let mut idx = 0;
        for (i, offset) in self.frame_offsets.iter().enumerate() {
            if *offset <= frames {
                idx = i;
            } else {
                break;
            }
        }
        let point = self.points[idx];
        let ticks = point.tick as f64
            + (frames - self.frame_offsets[idx]) / frames_per_tick(point.bpm, self.sample_rate);
        Position::new(0, ticks)
    }

    /// Display position under the time-signature map.
    pub fn bbt(&self, p: Position) -> Bbt {
        let target = p.ticks.max(0);
        let mut bars = 0i64;
        for (i, sig) in self.sigs.iter().enumerate() {
            let ticks_per_beat_here = TICKS_PER_BEAT * 4 / i64::from(sig.denominator);
            let ticks_per_bar = i64::from(sig.numerator) * ticks_per_beat_here;
            match self.sigs.get(i + 1) {
                Some(next) if target >= next.tick => {
                    bars += (next.tick - sig.tick) / ticks_per_bar;
                }
                _ => {
                    let into = target - sig.tick;
                    bars += into / ticks_per_bar;
                    let rem = into % ticks_per_bar;
                    return Bbt {
                        bar: bars as u32 + 1,
                        beat: (rem / ticks_per_beat_here) as u32 + 1,
                        tick: (rem % ticks_per_beat_here) as u32,
                    };
                }
            }
        }
        Bbt {
            bar: bars as u32 + 1,
            beat: 1,
            tick: 0,
        }
    }
}

/// Main-thread tempo map.
#[derive(Clone, Debug)]
pub struct TempoMap {
    points: Vec<TempoPoint>,
    sigs: Vec<TimeSigPoint>,
    sample_rate: f64,
    snapshot: Arc<TempoMapSnapshot>,
}

impl TempoMap {
    pub fn new(initial_bpm: f32, sample_rate: f64) -> Self {
        let points = vec![TempoPoint {
            tick: 0,
            bpm: initial_bpm.clamp(MIN_BPM, MAX_BPM),
        }];
        let sigs = vec![TimeSigPoint {
            tick: 0,
            numerator: 4,
            denominator: 4,
        }];
        let snapshot = Arc::new(Self::build_snapshot(&points, &sigs, sample_rate));
        Self {
            points,
            sigs,
            sample_rate,
            snapshot,
        }
    }

    fn build_snapshot(
        points: &[TempoPoint],
        sigs: &[TimeSigPoint],
        sample_rate: f64,
    ) -> TempoMapSnapshot {
        let mut frame_offsets = Vec::with_capacity(points.len());
        let mut acc = 0.0f64;
        for (i, point) in points.iter().enumerate() {
            frame_offsets.push(acc);
            if let Some(next) = points.get(i + 1) {
                acc += (next.tick - point.tick) as f64 * frames_per_tick(point.bpm, sample_rate);
            }
        }
        TempoMapSnapshot {
            points: points.to_vec(),
            sigs: sigs.to_vec(),
            frame_offsets,
            sample_rate,
        }
    }

    fn rebuild(&mut self) {
        self.snapshot = Arc::new(Self::build_snapshot(
            &self.points,
            &self.sigs,
            self.sample_rate,
        ));
    }

    pub fn snapshot(&self) -> Arc<TempoMapSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn bpm(&self) -> f32 {
        self.points[0].bpm
    }

    pub fn time_signature(&self) -> (u32, u32) {
        (self.sigs[0].numerator, self.sigs[0].denominator)
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Replace the whole map with a single tempo.
    pub fn set_bpm(&mut self, bpm: f32) {
        let bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        self.points.clear();
        self.points.push(TempoPoint { tick: 0, bpm });
        self.rebuild();
    }

    pub fn add_tempo_point(&mut self, tick: i64, bpm: f32) -> Result<()> {
        if tick < 0 {
            return Err(Error::TempoMapInconsistent(format!(
                "tempo point at negative tick {tick}"
            )));
        }
        let bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        self.points.retain(|p| p.tick != tick);
        self.points.push(TempoPoint { tick, bpm });
        self.points.sort_by_key(|p| p.tick);
        if self.points[0].tick != 0 {
            let first_bpm = self.points[0].bpm;
            self.points.insert(
                0,
                TempoPoint {
                    tick: 0,
                    bpm: first_bpm,
                },
            );
        }
        self.rebuild();
        Ok(())
    }

    pub fn remove_tempo_point(&mut self, tick: i64) {
        if tick == 0 {
            return;
        }
        self.points.retain(|p| p.tick != tick);
        self.rebuild();
    }

    pub fn set_time_signature(&mut self, numerator: u32, denominator: u32) -> Result<()> {
        if numerator == 0 || !denominator.is_power_of_two() {
            return Err(Error::TempoMapInconsistent(format!(
                "invalid time signature {numerator}/{denominator}"
            )));
        }
        self.sigs.clear();
        self.sigs.push(TimeSigPoint {
            tick: 0,
            numerator,
            denominator,
        });
        self.rebuild();
        Ok(())
    }

    pub fn add_time_signature_point(
        &mut self,
        tick: i64,
        numerator: u32,
        denominator: u32,
    ) -> Result<()> {
        if numerator == 0 || !denominator.is_power_of_two() {
            return Err(Error::TempoMapInconsistent(format!(
                "invalid time signature {numerator}/{denominator}"
            )));
        }
        self.sigs.retain(|s| s.tick != tick);
        self.sigs.push(TimeSigPoint {
            tick,
            numerator,
            denominator,
        });
        self.sigs.sort_by_key(|s| s.tick);
        if self.sigs[0].tick != 0 {
            let first = self.sigs[0];
            self.sigs.insert(
                0,
                TimeSigPoint {
                    tick: 0,
                    numerator: first.numerator,
                    denominator: first.denominator,
                },
            );
        }
        self.rebuild();
        Ok(())
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.rebuild();
    }

    pub fn tempo_points(&self) -> &[TempoPoint] {
        &self.points
    }

    pub fn time_signature_points(&self) -> &[TimeSigPoint] {
        &self.sigs
    }

    #[inline]
    pub fn to_frames(&self, p: Position) -> i64 {
        self.snapshot.to_frames(p)
    }

    #[inline]
    pub fn from_frames(&self, n: i64) -> Position {
        self.snapshot.from_frames(n)
    }
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::new(120.0, 48000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_constant_tempo_conversion() {
        // 120 BPM at 48 kHz: 25 frames per tick exactly.
        let map = TempoMap::new(120.0, 48000.0);
        assert_eq!(map.to_frames(Position::from_ticks(TICKS_PER_BEAT)), 24000);
        assert_eq!(map.from_frames(24000), Position::from_ticks(TICKS_PER_BEAT));
    }

    #[test]
    fn test_roundtrip_exact_at_integral_frames_per_tick() {
        let map = TempoMap::new(120.0, 48000.0);
        for ticks in [0i64, 1, 7, 960, 12345, 1_000_000] {
            let p = Position::from_ticks(ticks);
            assert_eq!(map.from_frames(map.to_frames(p)), p);
        }
    }

    #[test]
    fn test_tempo_change_integration() {
        let mut map = TempoMap::new(120.0, 48000.0);
        // Slow to 60 BPM at beat 4.
        map.add_tempo_point(4 * TICKS_PER_BEAT, 60.0).unwrap();

        // Beats 0-4 at 120 BPM: 2 s = 96000 frames.
        assert_eq!(map.to_frames(Position::from_beats(4.0)), 96000);
        // Beats 4-8 at 60 BPM: 4 s more = 288000 total.
        assert_eq!(map.to_frames(Position::from_beats(8.0)), 288_000);

        // Inverse lands inside the second segment.
        let p = map.from_frames(288_000);
        assert!((p.as_beats() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_bpm_at() {
        let mut map = TempoMap::new(120.0, 48000.0);
        map.add_tempo_point(1000, 90.0).unwrap();
        let snap = map.snapshot();
        assert_eq!(snap.bpm_at(0), 120.0);
        assert_eq!(snap.bpm_at(999), 120.0);
        assert_eq!(snap.bpm_at(1000), 90.0);
        assert_eq!(snap.bpm_at(5000), 90.0);
    }

    #[test]
    fn test_halving_bpm_doubles_frames() {
        let mut map = TempoMap::new(120.0, 48000.0);
        let p = Position::from_ticks(4321);
        let before = map.to_frames(p);
        map.set_bpm(60.0);
        assert_eq!(map.to_frames(p), before * 2);
    }

    #[test]
    fn test_bpm_clamped() {
        let mut map = TempoMap::new(120.0, 48000.0);
        map.set_bpm(5000.0);
        assert_eq!(map.bpm(), MAX_BPM);
        map.set_bpm(1.0);
        assert_eq!(map.bpm(), MIN_BPM);
    }

    #[test]
    fn test_snapshot_isolation() {
        let mut map = TempoMap::new(120.0, 48000.0);
        let snap = map.snapshot();
        map.set_bpm(60.0);
        assert_eq!(snap.bpm(), 120.0);
        assert_eq!(map.snapshot().bpm(), 60.0);
    }

    #[test]
    fn test_invalid_time_signature_rejected() {
        let mut map = TempoMap::new(120.0, 48000.0);
        assert!(map.set_time_signature(0, 4).is_err());
        assert!(map.set_time_signature(4, 3).is_err());
        assert!(map.set_time_signature(7, 8).is_ok());
    }

    #[test]
    fn test_bbt_default_meter() {
        let map = TempoMap::new(120.0, 48000.0);
        let snap = map.snapshot();
        let bbt = snap.bbt(Position::from_beats(0.0));
        assert_eq!((bbt.bar, bbt.beat, bbt.tick), (1, 1, 0));
        let bbt = snap.bbt(Position::from_beats(4.0));
        assert_eq!((bbt.bar, bbt.beat), (2, 1));
        let bbt = snap.bbt(Position::from_ticks(5 * TICKS_PER_BEAT + 480));
        assert_eq!((bbt.bar, bbt.beat, bbt.tick), (2, 2, 480));
    }

    #[test]
    fn test_bbt_waltz() {
        let mut map = TempoMap::new(120.0, 48000.0);
        map.set_time_signature(3, 4).unwrap();
        let snap = map.snapshot();
        let bbt = snap.bbt(Position::from_beats(6.0));
        assert_eq!((bbt.bar, bbt.beat), (3, 1));
    }

    #[test]
    fn test_sample_rate_change_recomputes() {
        let mut map = TempoMap::new(120.0, 44100.0);
        let p = Position::from_beats(2.0);
        assert_eq!(map.to_frames(p), 44100);
        map.set_sample_rate(48000.0);
        assert_eq!(map.to_frames(p), 48000);
    }

    proptest! {
        #[test]
        fn prop_from_frames_is_right_inverse(frames in 0i64..100_000_000) {
            // from_frames(n) then to_frames recovers n for any frame at any
            // tempo where frames-per-tick is representable.
            let map = TempoMap::new(120.0, 48000.0);
            let p = map.from_frames(frames);
            prop_assert_eq!(map.to_frames(p), frames);
        }

        #[test]
        fn prop_roundtrip_with_tempo_changes(frames in 0i64..50_000_000) {
            let mut map = TempoMap::new(120.0, 48000.0);
            map.add_tempo_point(4 * TICKS_PER_BEAT, 60.0).unwrap();
            map.add_tempo_point(16 * TICKS_PER_BEAT, 180.0).unwrap();
            let p = map.from_frames(frames);
            let back = map.to_frames(p);
            prop_assert!((back - frames).abs() <= 1);
        }

        #[test]
        fn prop_to_frames_monotonic(a in 0i64..10_000_000, b in 0i64..10_000_000) {
            let mut map = TempoMap::new(120.0, 48000.0);
            map.add_tempo_point(8 * TICKS_PER_BEAT, 75.0).unwrap();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(
                map.to_frames(Position::from_ticks(lo))
                    <= map.to_frames(Position::from_ticks(hi))
            );
        }
    }
}
