//! Musical positions: whole ticks plus a fractional part.
//!
//! Tick arithmetic is integer; the fraction is carried separately so long
//! projects do not drift. Converting to and from frames is the tempo map's
//! job ([`crate::tempo_map::TempoMapSnapshot`]).

use serde::{Deserialize, Serialize};

/// Ticks per quarter note.
pub const TICKS_PER_BEAT: i64 = 960;

/// An immutable musical position.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Position {
    pub ticks: i64,
    /// Fraction of a tick in `[0, 1)`.
    pub sub_tick: f64,
}

impl Position {
    pub const ZERO: Position = Position {
        ticks: 0,
        sub_tick: 0.0,
    };

    /// Build a normalized position; the fraction is folded into whole
    /// ticks.
    pub fn new(ticks: i64, sub_tick: f64) -> Self {
        let carry = sub_tick.floor();
        Self {
            ticks: ticks + carry as i64,
            sub_tick: sub_tick - carry,
        }
    }

    pub fn from_ticks(ticks: i64) -> Self {
        Self {
            ticks,
            sub_tick: 0.0,
        }
    }

    pub fn from_beats(beats: f64) -> Self {
        let total = beats * TICKS_PER_BEAT as f64;
        Self::new(0, total)
    }

    #[inline]
    pub fn as_ticks_f64(&self) -> f64 {
        self.ticks as f64 + self.sub_tick
    }

    #[inline]
    pub fn as_beats(&self) -> f64 {
        self.as_ticks_f64() / TICKS_PER_BEAT as f64
    }

    pub fn add_ticks(&self, ticks: i64) -> Self {
        Self {
            ticks: self.ticks + ticks,
            sub_tick: self.sub_tick,
        }
    }

    #[inline]
    pub fn is_tick_aligned(&self) -> bool {
        self.sub_tick == 0.0
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.ticks == other.ticks && self.sub_tick == other.sub_tick
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(
            self.ticks
                .cmp(&other.ticks)
                .then(self.sub_tick.total_cmp(&other.sub_tick)),
        )
    }
}

/// Snap policy for grid operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapPolicy {
    Nearest,
    Previous,
    Next,
    /// Keep the reference position's offset from its grid line.
    KeepOffset,
}

/// A snap grid with a fixed spacing in ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapGrid {
    pub ticks: i64,
}

impl SnapGrid {
    pub fn new(ticks: i64) -> Self {
        Self { ticks: ticks.max(1) }
    }

    /// One grid line per beat.
    pub fn beats() -> Self {
        Self::new(TICKS_PER_BEAT)
    }

    /// Snap `p` to the grid. `reference` supplies the offset to preserve
    /// for [`SnapPolicy::KeepOffset`]; without one, KeepOffset returns `p`
    /// unchanged.
    pub fn snap(&self, p: Position, policy: SnapPolicy, reference: Option<Position>) -> Position {
        let g = self.ticks;
        match policy {
            SnapPolicy::Previous => Position::from_ticks(p.ticks.div_euclid(g) * g),
            SnapPolicy::Next => {
                let floor = p.ticks.div_euclid(g) * g;
                if floor == p.ticks && p.sub_tick == 0.0 {
                    p
                } else {
                    Position::from_ticks(floor + g)
                }
            }
            SnapPolicy::Nearest => {
                let floor = p.ticks.div_euclid(g) * g;
                let into = p.as_ticks_f64() - floor as f64;
                if into * 2.0 < g as f64 {
                    Position::from_ticks(floor)
                } else {
                    Position::from_ticks(floor + g)
                }
            }
            SnapPolicy::KeepOffset => match reference {
                Some(r) => {
                    let offset = r.ticks.rem_euclid(g);
                    let base = self
                        .snap(p, SnapPolicy::Nearest, None)
                        .ticks;
                    Position::new(base + offset, r.sub_tick)
                }
                None => p,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_carries_fraction() {
        let p = Position::new(10, 2.25);
        assert_eq!(p.ticks, 12);
        assert!((p.sub_tick - 0.25).abs() < 1e-12);

        let p = Position::new(10, -0.25);
        assert_eq!(p.ticks, 9);
        assert!((p.sub_tick - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_from_beats() {
        let p = Position::from_beats(2.5);
        assert_eq!(p.ticks, 2 * TICKS_PER_BEAT + TICKS_PER_BEAT / 2);
        assert_eq!(p.sub_tick, 0.0);
        assert!((p.as_beats() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_ordering() {
        let a = Position::new(10, 0.5);
        let b = Position::new(10, 0.6);
        let c = Position::new(11, 0.0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, Position::new(10, 0.5));
    }

    #[test]
    fn test_snap_previous_next() {
        let grid = SnapGrid::beats();
        let p = Position::from_ticks(TICKS_PER_BEAT + 100);
        assert_eq!(
            grid.snap(p, SnapPolicy::Previous, None).ticks,
            TICKS_PER_BEAT
        );
        assert_eq!(
            grid.snap(p, SnapPolicy::Next, None).ticks,
            2 * TICKS_PER_BEAT
        );
    }

    #[test]
    fn test_snap_next_on_grid_is_identity() {
        let grid = SnapGrid::beats();
        let p = Position::from_ticks(TICKS_PER_BEAT);
        assert_eq!(grid.snap(p, SnapPolicy::Next, None), p);
    }

    #[test]
    fn test_snap_nearest() {
        let grid = SnapGrid::beats();
        let low = Position::from_ticks(TICKS_PER_BEAT / 4);
        let high = Position::from_ticks(3 * TICKS_PER_BEAT / 4);
        assert_eq!(grid.snap(low, SnapPolicy::Nearest, None).ticks, 0);
        assert_eq!(
            grid.snap(high, SnapPolicy::Nearest, None).ticks,
            TICKS_PER_BEAT
        );
    }

    #[test]
    fn test_snap_keep_offset() {
        let grid = SnapGrid::beats();
        // Reference sits 100 ticks after a grid line.
        let reference = Position::from_ticks(TICKS_PER_BEAT + 100);
        // Dragged near beat 3; the 100-tick offset is preserved.
        let dragged = Position::from_ticks(3 * TICKS_PER_BEAT - 20);
        let snapped = grid.snap(dragged, SnapPolicy::KeepOffset, Some(reference));
        assert_eq!(snapped.ticks, 3 * TICKS_PER_BEAT + 100);
    }

    #[test]
    fn test_snap_negative_positions() {
        let grid = SnapGrid::new(100);
        let p = Position::from_ticks(-150);
        assert_eq!(grid.snap(p, SnapPolicy::Previous, None).ticks, -200);
        assert_eq!(grid.snap(p, SnapPolicy::Next, None).ticks, -100);
    }
}
