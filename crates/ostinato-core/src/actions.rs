//! The undoable-action pipeline.
//!
//! Every model mutation is a tagged [`UndoableAction`] carrying enough to
//! apply and to invert itself. `perform`/`undo`/`redo` are serialized by
//! one mutex that the audio thread never touches; graph-affecting actions
//! trigger a hard rebuild, parameter actions ride the command queue.

use std::collections::VecDeque;

use ostinato_clips::{AudioRegion, MidiRegion};
use ostinato_midi::Binding;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::commands::{CommandSender, EngineCommand};
use crate::connections::Connection;
use crate::error::{Error, Result};
use crate::ids::{PluginId, PortId, TrackId};
use crate::model::{ProjectModel, Track};
use crate::plugin::SharedPluginHost;
use crate::tempo_map::TempoMap;

/// Everything the pipeline can do and undo.
pub enum UndoableAction {
    AddTrack {
        index: usize,
        track: Track,
    },
    RemoveTrack {
        track_id: TrackId,
        /// Filled on apply so the inverse can restore in place.
        index: usize,
        track: Option<Track>,
        edges: Vec<Connection>,
    },
    AddAudioRegion {
        track: TrackId,
        region: AudioRegion,
    },
    RemoveAudioRegion {
        track: TrackId,
        index: usize,
        region: Option<AudioRegion>,
    },
    MoveAudioRegion {
        track: TrackId,
        index: usize,
        from: RegionSpan,
        to: RegionSpan,
    },
    AddMidiRegion {
        track: TrackId,
        region: MidiRegion,
    },
    RemoveMidiRegion {
        track: TrackId,
        index: usize,
        region: Option<MidiRegion>,
    },
    Connect {
        connection: Connection,
    },
    Disconnect {
        src: PortId,
        dst: PortId,
        /// Filled on apply (preserves multiplier and flags for undo).
        removed: Option<Connection>,
    },
    SetConnectionMultiplier {
        src: PortId,
        dst: PortId,
        before: f32,
        after: f32,
    },
    SetFaderGain {
        track: TrackId,
        before: f32,
        after: f32,
    },
    SetTempo {
        before: f32,
        after: f32,
    },
    SetTimeSignature {
        before: (u32, u32),
        after: (u32, u32),
    },
    AddPlugin {
        track: TrackId,
        slot: usize,
        plugin: SharedPluginHost,
    },
    RemovePlugin {
        track: TrackId,
        slot: usize,
        plugin: Option<SharedPluginHost>,
        edges: Vec<Connection>,
    },
    SetPluginEnabled {
        plugin: PluginId,
        before: bool,
        after: bool,
    },
    AddBinding {
        binding: Binding,
        index: usize,
    },
    RemoveBinding {
        index: usize,
        binding: Option<Binding>,
    },
}

/// Timeline span of a region, in frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpan {
    pub start: u64,
    pub end: u64,
}

impl UndoableAction {
    /// Does this action change graph topology?
    pub fn needs_rebuild(&self) -> bool {
        matches!(
            self,
            UndoableAction::AddTrack { .. }
                | UndoableAction::RemoveTrack { .. }
                | UndoableAction::AddAudioRegion { .. }
                | UndoableAction::RemoveAudioRegion { .. }
                | UndoableAction::MoveAudioRegion { .. }
                | UndoableAction::AddMidiRegion { .. }
                | UndoableAction::RemoveMidiRegion { .. }
                | UndoableAction::Connect { .. }
                | UndoableAction::Disconnect { .. }
                | UndoableAction::AddPlugin { .. }
                | UndoableAction::RemovePlugin { .. }
        )
    }
}

/// Apply (or invert) one action against the model. On error the model is
/// unchanged: validation happens before any mutation.
pub(crate) fn apply_action(
    model: &mut ProjectModel,
    tempo: &Mutex<TempoMap>,
    commands: &CommandSender,
    action: &mut UndoableAction,
    invert: bool,
) -> Result<()> {
    match action {
        UndoableAction::AddTrack { index, track } => {
            if invert {
                model.remove_track(track.id)?;
            } else {
                model.insert_track(track.clone(), *index);
            }
        }
        UndoableAction::RemoveTrack {
            track_id,
            index,
            track,
            edges,
        } => {
            if invert {
                let restored = track
                    .clone()
                    .ok_or_else(|| Error::UnknownTrack(*track_id))?;
                model.restore_track(*index, restored, edges.clone());
            } else {
                let (i, t, e) = model.remove_track(*track_id)?;
                *index = i;
                *track = Some(t);
                *edges = e;
            }
        }
        UndoableAction::AddAudioRegion { track, region } => {
            if invert {
                let t = model.track_mut(*track)?;
                if let Some(pos) = t.audio_regions.iter().position(|r| r == region) {
                    let removed = t.audio_regions.remove(pos);
                    model.pool.release(removed.clip);
                }
            } else {
                let clip = model
                    .pool
                    .get(region.clip)
                    .ok_or(Error::Clip(ostinato_clips::ClipError::UnknownClip(
                        region.clip,
                    )))?;
                if !region.validate(clip.length_frames()) {
                    return Err(Error::InvalidRegion(format!(
                        "region bounds invalid against clip of {} frames",
                        clip.length_frames()
                    )));
                }
                model.pool.retain(region.clip)?;
                model.track_mut(*track)?.audio_regions.push(region.clone());
            }
        }
        UndoableAction::RemoveAudioRegion {
            track,
            index,
            region,
        } => {
            if invert {
                let restored = region
                    .clone()
                    .ok_or_else(|| Error::InvalidRegion("nothing to restore".into()))?;
                model.pool.retain(restored.clip)?;
                let t = model.track_mut(*track)?;
                let at = (*index).min(t.audio_regions.len());
                t.audio_regions.insert(at, restored);
            } else {
                let t = model.track_mut(*track)?;
                if *index >= t.audio_regions.len() {
                    return Err(Error::InvalidRegion(format!("no region at {index}")));
                }
                let removed = t.audio_regions.remove(*index);
                model.pool.release(removed.clip);
                *region = Some(removed);
            }
        }
        UndoableAction::MoveAudioRegion {
            track,
            index,
            from,
            to,
        } => {
            let t = model.track_mut(*track)?;
            let region = t
                .audio_regions
                .get_mut(*index)
                .ok_or_else(|| Error::InvalidRegion(format!("no region at {index}")))?;
            let span = if invert { from } else { to };
            region.start = span.start;
            region.end = span.end;
        }
        UndoableAction::AddMidiRegion { track, region } => {
            if invert {
                let t = model.track_mut(*track)?;
                if let Some(pos) = t.midi_regions.iter().position(|r| r == region) {
                    t.midi_regions.remove(pos);
                }
            } else {
                if !region.validate() {
                    return Err(Error::InvalidRegion("midi region bounds invalid".into()));
                }
                model.track_mut(*track)?.midi_regions.push(region.clone());
            }
        }
        UndoableAction::RemoveMidiRegion {
            track,
            index,
            region,
        } => {
            if invert {
                let restored = region
                    .clone()
                    .ok_or_else(|| Error::InvalidRegion("nothing to restore".into()))?;
                let t = model.track_mut(*track)?;
                let at = (*index).min(t.midi_regions.len());
                t.midi_regions.insert(at, restored);
            } else {
                let t = model.track_mut(*track)?;
                if *index >= t.midi_regions.len() {
                    return Err(Error::InvalidRegion(format!("no region at {index}")));
                }
                *region = Some(t.midi_regions.remove(*index));
            }
        }
        UndoableAction::Connect { connection } => {
            if invert {
                model
                    .connections
                    .disconnect(connection.src, connection.dst, true)?;
            } else {
                model.connections.connect(*connection, &model.ports)?;
            }
        }
        UndoableAction::Disconnect { src, dst, removed } => {
            if invert {
                let conn = removed
                    .ok_or_else(|| Error::BadConnection("nothing to restore".into()))?;
                model.connections.connect(conn, &model.ports)?;
            } else {
                *removed = Some(model.connections.disconnect(*src, *dst, false)?);
            }
        }
        UndoableAction::SetConnectionMultiplier {
            src,
            dst,
            before,
            after,
        } => {
            let value = if invert { *before } else { *after };
            model.connections.set_multiplier(*src, *dst, value)?;
            commands.send(EngineCommand::SetConnectionGain {
                src: *src,
                dst: *dst,
                multiplier: value,
            });
        }
        UndoableAction::SetFaderGain {
            track,
            before,
            after,
        } => {
            let value = if invert { *before } else { *after };
            let port = {
                let t = model.track_mut(*track)?;
                t.fader_gain = value;
                t.fader_gain_port()
            };
            commands.send(EngineCommand::SetControl {
                port,
                value,
                normalized: false,
            });
        }
        UndoableAction::SetTempo { before, after } => {
            let value = if invert { *before } else { *after };
            let snapshot = {
                let mut map = tempo.lock();
                map.set_bpm(value);
                map.snapshot()
            };
            commands.send(EngineCommand::ApplyTempoMap {
                bpm: snapshot.bpm(),
                snapshot,
            });
        }
        UndoableAction::SetTimeSignature { before, after } => {
            let (num, den) = if invert { *before } else { *after };
            let snapshot = {
                let mut map = tempo.lock();
                map.set_time_signature(num, den)?;
                map.snapshot()
            };
            commands.send(EngineCommand::ApplyTimeSignature {
                snapshot,
                numerator: num,
                denominator: den,
            });
        }
        UndoableAction::AddPlugin {
            track,
            slot,
            plugin,
        } => {
            if invert {
                let owner = plugin.owner();
                let t = model.track_mut(*track)?;
                if *slot < t.chain.len() {
                    t.chain.remove(*slot);
                }
                model.connections.disconnect_owner(owner);
                model.ports.remove_owner(owner);
            } else {
                let plugin = SharedPluginHost::clone(plugin);
                model.register_plugin_ports(&plugin);
                let t = model.track_mut(*track)?;
                let at = (*slot).min(t.chain.len());
                t.chain.insert(at, plugin);
            }
        }
        UndoableAction::RemovePlugin {
            track,
            slot,
            plugin,
            edges,
        } => {
            if invert {
                let cell = plugin
                    .as_ref()
                    .map(SharedPluginHost::clone)
                    .ok_or_else(|| Error::PluginInstantiationFailed("nothing to restore".into()))?;
                model.register_plugin_ports(&cell);
                let t = model.track_mut(*track)?;
                let at = (*slot).min(t.chain.len());
                t.chain.insert(at, cell);
                for edge in edges.iter() {
                    let _ = model.connections.connect(*edge, &model.ports);
                }
            } else {
                let t = model.track_mut(*track)?;
                if *slot >= t.chain.len() {
                    return Err(Error::PluginInstantiationFailed(format!(
                        "no plugin in slot {slot}"
                    )));
                }
                let cell = t.chain.remove(*slot);
                let owner = cell.owner();
                *edges = model.connections.disconnect_owner(owner);
                model.ports.remove_owner(owner);
                *plugin = Some(cell);
            }
        }
        UndoableAction::SetPluginEnabled {
            plugin,
            before,
            after,
        } => {
            let value = if invert { *before } else { *after };
            let cell = model
                .find_plugin(*plugin)
                .ok_or_else(|| Error::PluginInstantiationFailed(format!("{plugin:?} not found")))?;
            cell.set_enabled(value);
        }
        UndoableAction::AddBinding { binding, index } => {
            if invert {
                model.bindings.remove(*index)?;
            } else {
                *index = model.bindings.add(*binding)?;
            }
        }
        UndoableAction::RemoveBinding { index, binding } => {
            if invert {
                let b = binding
                    .ok_or(Error::Binding(ostinato_midi::BindingError::NoSuchBinding(
                        *index,
                    )))?;
                model.bindings.insert_at(*index, b)?;
            } else {
                *binding = Some(model.bindings.remove(*index)?);
            }
        }
    }
    Ok(())
}

/// Bounded undo/redo storage. One lock serializes `perform`, `undo` and
/// `redo`; the audio thread never takes it.
pub struct ActionPipeline {
    stacks: Mutex<Stacks>,
    depth: usize,
}

pub(crate) struct Stacks {
    pub undo: VecDeque<UndoableAction>,
    pub redo: Vec<UndoableAction>,
}

impl ActionPipeline {
    pub fn new(depth: usize) -> Self {
        Self {
            stacks: Mutex::new(Stacks {
                undo: VecDeque::new(),
                redo: Vec::new(),
            }),
            depth: depth.max(1),
        }
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Stacks> {
        self.stacks.lock()
    }

    pub(crate) fn push_performed(&self, stacks: &mut Stacks, action: UndoableAction) {
        stacks.redo.clear();
        stacks.undo.push_back(action);
        while stacks.undo.len() > self.depth {
            stacks.undo.pop_front();
        }
    }

    pub fn undo_len(&self) -> usize {
        self.stacks.lock().undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.stacks.lock().redo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action() -> UndoableAction {
        UndoableAction::SetTempo {
            before: 120.0,
            after: 90.0,
        }
    }

    #[test]
    fn test_stack_depth_bounded_fifo() {
        let pipeline = ActionPipeline::new(3);
        for _ in 0..5 {
            let mut stacks = pipeline.lock();
            pipeline.push_performed(&mut stacks, action());
        }
        assert_eq!(pipeline.undo_len(), 3);
    }

    #[test]
    fn test_perform_clears_redo() {
        let pipeline = ActionPipeline::new(8);
        {
            let mut stacks = pipeline.lock();
            pipeline.push_performed(&mut stacks, action());
            let undone = stacks.undo.pop_back().unwrap();
            stacks.redo.push(undone);
        }
        assert_eq!(pipeline.redo_len(), 1);
        {
            let mut stacks = pipeline.lock();
            pipeline.push_performed(&mut stacks, action());
        }
        assert_eq!(pipeline.redo_len(), 0);
    }

    #[test]
    fn test_rebuild_classification() {
        assert!(UndoableAction::Connect {
            connection: Connection::new(
                PortId::new(crate::ids::OwnerHandle(1), 0),
                PortId::new(crate::ids::OwnerHandle(2), 0),
            ),
        }
        .needs_rebuild());
        assert!(!action().needs_rebuild());
        assert!(!UndoableAction::SetFaderGain {
            track: TrackId(0),
            before: 1.0,
            after: 0.5,
        }
        .needs_rebuild());
    }
}
