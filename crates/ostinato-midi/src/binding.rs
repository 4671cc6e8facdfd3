//! CC binding engine: maps incoming control-change events to destinations.
//!
//! The table itself lives on the main thread; an immutable snapshot is
//! published through `ArcSwap` and scanned by the audio thread each cycle.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use crate::error::{BindingError, Result};
use crate::event::MidiEvent;

/// Bound size of the binding table.
pub const MAX_BINDINGS: usize = 128;

/// Named transport commands a binding may fire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportAction {
    Play,
    Pause,
    TogglePlay,
    ReturnToStart,
}

/// What a matched binding does.
///
/// Port destinations carry the engine's opaque 64-bit port key; the engine
/// resolves it back to a concrete control port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingTarget {
    /// Write the scaled CC value to a control port.
    SetControl { port_key: u64 },
    /// Flip a toggle port when the CC value crosses the on threshold.
    Toggle { port_key: u64 },
    /// Fire a named transport command.
    Transport(TransportAction),
}

/// One CC binding. `key` holds the learned 3-byte message; matching uses the
/// status byte and controller number, the captured value byte is kept for
/// display only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub key: [u8; 3],
    pub target: BindingTarget,
    pub enabled: bool,
}

impl Binding {
    pub fn new(key: [u8; 3], target: BindingTarget) -> Self {
        Self {
            key,
            target,
            enabled: true,
        }
    }

    #[inline]
    fn matches(&self, event: &MidiEvent) -> bool {
        self.enabled && self.key[0] == event.data[0] && self.key[1] == event.data[1]
    }
}

/// A binding that fired, with the incoming 7-bit value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingFire {
    pub target: BindingTarget,
    pub value: u8,
}

impl BindingFire {
    /// CC value mapped to the unit range.
    #[inline]
    pub fn normalized(&self) -> f32 {
        f32::from(self.value) / 127.0
    }

    /// Toggle threshold per the MIDI switch-controller convention.
    #[inline]
    pub fn is_on(&self) -> bool {
        self.value >= 64
    }
}

/// Immutable binding set scanned on the audio thread.
#[derive(Clone, Debug, Default)]
pub struct BindingSnapshot {
    bindings: SmallVec<[Binding; 16]>,
}

impl BindingSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Scan the table for an incoming event. Only control-change messages
    /// can match; everything else returns an empty set.
    pub fn fires_for(&self, event: &MidiEvent) -> SmallVec<[BindingFire; 4]> {
        let mut fired = SmallVec::new();
        if !event.is_control_change() {
            return fired;
        }
        for binding in &self.bindings {
            if binding.matches(event) {
                fired.push(BindingFire {
                    target: binding.target,
                    value: event.data[2],
                });
            }
        }
        fired
    }
}

/// Main-thread binding table. Mutations go through the action pipeline;
/// every mutation republishes the snapshot.
pub struct BindingTable {
    bindings: Vec<Binding>,
    snapshot: Arc<ArcSwap<BindingSnapshot>>,
}

impl Default for BindingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingTable {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            snapshot: Arc::new(ArcSwap::from_pointee(BindingSnapshot::empty())),
        }
    }

    /// Shareable snapshot handle for the audio thread.
    pub fn snapshot_handle(&self) -> Arc<ArcSwap<BindingSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Append a binding. Rejects duplicates (same match key and target) and
    /// enforces the bounded-table limit.
    pub fn add(&mut self, binding: Binding) -> Result<usize> {
        if self.bindings.len() >= MAX_BINDINGS {
            return Err(BindingError::TableFull(MAX_BINDINGS));
        }
        let duplicate = self.bindings.iter().any(|b| {
            b.key[0] == binding.key[0] && b.key[1] == binding.key[1] && b.target == binding.target
        });
        if duplicate {
            return Err(BindingError::Duplicate(binding.key));
        }
        self.bindings.push(binding);
        self.publish();
        debug!(key = ?binding.key, "cc binding added");
        Ok(self.bindings.len() - 1)
    }

    /// Insert at a specific position (undo restoring a removed binding in
    /// place). Same validation as [`BindingTable::add`].
    pub fn insert_at(&mut self, index: usize, binding: Binding) -> Result<()> {
        if self.bindings.len() >= MAX_BINDINGS {
            return Err(BindingError::TableFull(MAX_BINDINGS));
        }
        let duplicate = self.bindings.iter().any(|b| {
            b.key[0] == binding.key[0] && b.key[1] == binding.key[1] && b.target == binding.target
        });
        if duplicate {
            return Err(BindingError::Duplicate(binding.key));
        }
        let index = index.min(self.bindings.len());
        self.bindings.insert(index, binding);
        self.publish();
        Ok(())
    }

    /// Remove the binding at `index`, returning it for undo.
    pub fn remove(&mut self, index: usize) -> Result<Binding> {
        if index >= self.bindings.len() {
            return Err(BindingError::NoSuchBinding(index));
        }
        let removed = self.bindings.remove(index);
        self.publish();
        debug!(key = ?removed.key, "cc binding removed");
        Ok(removed)
    }

    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> Result<()> {
        let binding = self
            .bindings
            .get_mut(index)
            .ok_or(BindingError::NoSuchBinding(index))?;
        binding.enabled = enabled;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        let snapshot = BindingSnapshot {
            bindings: self.bindings.iter().copied().collect(),
        };
        self.snapshot.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cc(control: u8, value: u8) -> MidiEvent {
        MidiEvent::control_change(0, 0, control, value)
    }

    #[test]
    fn test_add_and_fire() {
        let mut table = BindingTable::new();
        table
            .add(Binding::new(
                [0xB0, 7, 0],
                BindingTarget::SetControl { port_key: 42 },
            ))
            .unwrap();

        let snap = table.snapshot_handle();
        let fires = snap.load().fires_for(&cc(7, 100));
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].target, BindingTarget::SetControl { port_key: 42 });
        assert_eq!(fires[0].value, 100);
        assert!((fires[0].normalized() - 100.0 / 127.0).abs() < 1e-6);
    }

    #[test]
    fn test_only_cc_matches() {
        let mut table = BindingTable::new();
        table
            .add(Binding::new(
                [0xB0, 7, 0],
                BindingTarget::Transport(TransportAction::TogglePlay),
            ))
            .unwrap();

        let snap = table.snapshot_handle();
        let note = MidiEvent::note_on(0, 0, 7, 100);
        assert!(snap.load().fires_for(&note).is_empty());
    }

    #[test]
    fn test_disabled_binding_does_not_fire() {
        let mut table = BindingTable::new();
        let idx = table
            .add(Binding::new(
                [0xB0, 20, 0],
                BindingTarget::Toggle { port_key: 9 },
            ))
            .unwrap();
        table.set_enabled(idx, false).unwrap();

        let snap = table.snapshot_handle();
        assert!(snap.load().fires_for(&cc(20, 127)).is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut table = BindingTable::new();
        let binding = Binding::new([0xB0, 1, 0], BindingTarget::SetControl { port_key: 1 });
        table.add(binding).unwrap();
        assert_eq!(table.add(binding), Err(BindingError::Duplicate(binding.key)));
    }

    #[test]
    fn test_table_bounded() {
        let mut table = BindingTable::new();
        for i in 0..MAX_BINDINGS {
            table
                .add(Binding::new(
                    [0xB0, (i % 120) as u8, 0],
                    BindingTarget::SetControl { port_key: i as u64 },
                ))
                .unwrap();
        }
        let overflow = Binding::new([0xB1, 1, 0], BindingTarget::SetControl { port_key: 999 });
        assert_eq!(table.add(overflow), Err(BindingError::TableFull(MAX_BINDINGS)));
    }

    #[test]
    fn test_remove_returns_binding() {
        let mut table = BindingTable::new();
        let binding = Binding::new([0xB0, 5, 0], BindingTarget::Transport(TransportAction::Play));
        let idx = table.add(binding).unwrap();
        let removed = table.remove(idx).unwrap();
        assert_eq!(removed, binding);
        assert!(table.snapshot_handle().load().is_empty());
    }

    #[test]
    fn test_toggle_threshold() {
        let fire = BindingFire {
            target: BindingTarget::Toggle { port_key: 0 },
            value: 64,
        };
        assert!(fire.is_on());
        let fire = BindingFire { value: 63, ..fire };
        assert!(!fire.is_on());
    }
}
