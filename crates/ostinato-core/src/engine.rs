//! The engine façade: one value owning the whole core.
//!
//! `OstinatoEngine::builder().build()` yields the engine (main-thread
//! handle) and its [`AudioProcessor`] (the realtime handle the host
//! callback drives). Nothing is global; everything the callback needs
//! travels inside the processor.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use ostinato_clips::{AudioRegion, ClipId, ClipPool, MidiRegion};
use ostinato_midi::{Binding, MidiRing, MidiRingProducer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::actions::{apply_action, ActionPipeline, RegionSpan, UndoableAction};
use crate::commands::{command_queue, CommandSender, EngineCommand};
use crate::config::OstinatoConfig;
use crate::connections::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{change_bus, ChangeConsumer, ChangeEvent, ChangePublisher};
use crate::graph::{build_graph, ProcessGraph};
use crate::ids::{PluginId, PortId, TrackId};
use crate::metering::CycleMeter;
use crate::model::{ProjectModel, TrackKind, TrackSend};
use crate::plugin::PluginInstance;
use crate::scheduler::{AudioProcessor, PauseHandshake, PAUSE_TIMEOUT};
use crate::tempo_map::{TempoMap, TempoPoint, TimeSigPoint};
use crate::transport::{Transport, TransportHandle};
use crate::workers::WorkerPool;

/// Plain-data project state for the persistence collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub tracks: Vec<TrackSnapshot>,
    pub connections: Vec<Connection>,
    pub transport: TransportSnapshot,
    pub tempo_points: Vec<TempoPoint>,
    pub time_signature_points: Vec<TimeSigPoint>,
    pub bindings: Vec<Binding>,
    pub clip_ids: Vec<ClipId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub name: String,
    pub kind: TrackKind,
    pub fader_gain: f32,
    pub muted: bool,
    pub audio_regions: Vec<AudioRegion>,
    pub midi_regions: Vec<MidiRegion>,
    pub sends: Vec<TrackSend>,
    pub plugins: Vec<PluginSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginSnapshot {
    pub id: PluginId,
    pub name: String,
    pub enabled: bool,
    pub gain: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportSnapshot {
    pub playhead: u64,
    pub bpm: f32,
    pub time_signature: (u32, u32),
    pub loop_range: Option<(u64, u64)>,
}

/// The stable port identities of one track, for wiring and automation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackPorts {
    pub out_l: PortId,
    pub out_r: PortId,
    pub fader_gain: PortId,
    pub midi_in: PortId,
    pub midi_out: PortId,
    pub in_l: PortId,
    pub in_r: PortId,
}

/// Builder for [`OstinatoEngine`].
#[derive(Default)]
pub struct OstinatoEngineBuilder {
    config: OstinatoConfig,
}

impl OstinatoEngineBuilder {
    pub fn sample_rate(mut self, sample_rate: f64) -> Self {
        self.config.sample_rate = sample_rate;
        self
    }

    pub fn max_block(mut self, max_block: usize) -> Self {
        self.config.max_block = max_block;
        self
    }

    pub fn worker_threads(mut self, workers: usize) -> Self {
        self.config.worker_threads = workers;
        self
    }

    pub fn initial_bpm(mut self, bpm: f32) -> Self {
        self.config.initial_bpm = bpm;
        self
    }

    pub fn preroll_frames(mut self, frames: u64) -> Self {
        self.config.preroll_frames = frames;
        self
    }

    pub fn undo_depth(mut self, depth: usize) -> Self {
        self.config.undo_depth = depth;
        self
    }

    pub fn config(mut self, config: OstinatoConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the config and assemble the engine/processor pair.
    pub fn build(self) -> Result<(OstinatoEngine, AudioProcessor)> {
        self.config.validate()?;
        let config = self.config;

        let model = ProjectModel::new(&config);
        let tempo = Arc::new(Mutex::new(TempoMap::new(
            config.initial_bpm,
            config.sample_rate,
        )));
        let transport = Arc::new(Transport::new(tempo.lock().snapshot(), config.preroll_frames));

        let (commands, command_rx) = command_queue();
        let (graph_tx, graph_rx) = unbounded();
        let (retire_tx, retire_rx) = unbounded();
        let (changes, consumer) = change_bus(config.change_bus_capacity);
        let (midi_tx, midi_rx) = MidiRing::with_capacity(config.midi_ring_capacity);
        let handshake = PauseHandshake::new();
        let meter = Arc::new(CycleMeter::new());

        let initial_graph = build_graph(&model, config.sample_rate, config.max_block)?;
        let bindings = model.bindings.snapshot_handle();
        let workers = WorkerPool::new(config.worker_threads);

        let processor = AudioProcessor::new(
            initial_graph,
            graph_rx,
            retire_tx,
            command_rx,
            Arc::clone(&transport),
            midi_rx,
            bindings,
            changes.clone(),
            Arc::clone(&handshake),
            workers,
            Arc::clone(&meter),
        );

        let engine = OstinatoEngine {
            actions: ActionPipeline::new(config.undo_depth),
            model: Mutex::new(model),
            tempo,
            transport,
            commands,
            graph_tx,
            retire_rx,
            handshake,
            changes,
            consumer: Mutex::new(Some(consumer)),
            midi_producer: Mutex::new(Some(midi_tx)),
            meter,
            plugin_latencies: Mutex::new(HashMap::new()),
            config,
        };

        info!(
            sample_rate = engine.config.sample_rate,
            max_block = engine.config.max_block,
            "engine built"
        );
        Ok((engine, processor))
    }
}

/// Main-thread handle to the processing core.
pub struct OstinatoEngine {
    config: OstinatoConfig,
    model: Mutex<ProjectModel>,
    tempo: Arc<Mutex<TempoMap>>,
    transport: Arc<Transport>,
    actions: ActionPipeline,
    commands: CommandSender,
    graph_tx: Sender<ProcessGraph>,
    retire_rx: Receiver<ProcessGraph>,
    handshake: Arc<PauseHandshake>,
    changes: ChangePublisher,
    consumer: Mutex<Option<ChangeConsumer>>,
    midi_producer: Mutex<Option<MidiRingProducer>>,
    meter: Arc<CycleMeter>,
    plugin_latencies: Mutex<HashMap<PluginId, u32>>,
}

impl OstinatoEngine {
    pub fn builder() -> OstinatoEngineBuilder {
        OstinatoEngineBuilder::default()
    }

    pub fn config(&self) -> &OstinatoConfig {
        &self.config
    }

    /// Current sample rate (follows host reconfiguration).
    pub fn sample_rate(&self) -> f64 {
        self.model.lock().sample_rate
    }

    /// Fluent transport handle.
    pub fn transport(&self) -> TransportHandle {
        TransportHandle::new(
            Arc::clone(&self.transport),
            self.commands.clone(),
            Arc::clone(&self.tempo),
        )
    }

    /// The change-bus consumer; can be taken once.
    pub fn take_change_consumer(&self) -> Option<ChangeConsumer> {
        self.consumer.lock().take()
    }

    /// The MIDI-input producer for the host driver; can be taken once.
    pub fn take_midi_producer(&self) -> Option<MidiRingProducer> {
        self.midi_producer.lock().take()
    }

    pub fn clip_pool(&self) -> Arc<ClipPool> {
        Arc::clone(&self.model.lock().pool)
    }

    pub fn cycle_meter(&self) -> &Arc<CycleMeter> {
        &self.meter
    }

    pub fn master_track(&self) -> TrackId {
        self.model.lock().master
    }

    /// Port identities of a track, for connections and control targeting.
    pub fn track_ports(&self, id: TrackId) -> Result<TrackPorts> {
        let model = self.model.lock();
        let t = model.track(id)?;
        Ok(TrackPorts {
            out_l: t.out_l(),
            out_r: t.out_r(),
            fader_gain: t.fader_gain_port(),
            midi_in: t.midi_in(),
            midi_out: t.midi_out(),
            in_l: t.in_l(),
            in_r: t.in_r(),
        })
    }

    /// Port identities of a plugin's adapter controls.
    pub fn plugin_ports(&self, id: PluginId) -> Result<(PortId, PortId)> {
        let model = self.model.lock();
        let cell = model
            .find_plugin(id)
            .ok_or_else(|| Error::PluginInstantiationFailed(format!("{id:?} not found")))?;
        let owner = cell.owner();
        Ok((
            crate::model::PluginPorts::enabled(owner),
            crate::model::PluginPorts::gain(owner),
        ))
    }

    /// Fine-grained, non-undoable control change (live tweaking,
    /// automation playback). Undoable edits go through the actions.
    pub fn send_control(&self, port: PortId, value: f32, normalized: bool) {
        self.commands.send(EngineCommand::SetControl {
            port,
            value,
            normalized,
        });
    }

    // ---- undoable operations ----

    /// Run an action through the pipeline: mutate, record the inverse,
    /// rebuild if topology changed. A failure leaves the model unchanged.
    pub fn perform(&self, mut action: UndoableAction) -> Result<()> {
        let mut stacks = self.actions.lock();
        self.apply_with_rebuild(&mut action, false)?;
        self.actions.push_performed(&mut stacks, action);
        Ok(())
    }

    pub fn undo(&self) -> Result<()> {
        let mut stacks = self.actions.lock();
        let mut action = stacks.undo.pop_back().ok_or(Error::UndoStackUnderflow)?;
        let result = self.apply_with_rebuild(&mut action, true);
        match result {
            Ok(()) => {
                stacks.redo.push(action);
                Ok(())
            }
            Err(e) => {
                // Failed undos stay undoable.
                stacks.undo.push_back(action);
                Err(e)
            }
        }
    }

    pub fn redo(&self) -> Result<()> {
        let mut stacks = self.actions.lock();
        let mut action = stacks.redo.pop().ok_or(Error::UndoStackUnderflow)?;
        let result = self.apply_with_rebuild(&mut action, false);
        match result {
            Ok(()) => {
                stacks.undo.push_back(action);
                Ok(())
            }
            Err(e) => {
                stacks.redo.push(action);
                Err(e)
            }
        }
    }

    /// Apply one direction of an action atomically: a rebuild failure rolls
    /// the model back before returning.
    fn apply_with_rebuild(&self, action: &mut UndoableAction, invert: bool) -> Result<()> {
        let mut model = self.model.lock();
        apply_action(&mut model, &self.tempo, &self.commands, action, invert)?;
        if action.needs_rebuild() {
            if let Err(e) = self.rebuild_locked(&model) {
                let _ = apply_action(&mut model, &self.tempo, &self.commands, action, !invert);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn undo_depth(&self) -> (usize, usize) {
        (self.actions.undo_len(), self.actions.redo_len())
    }

    pub fn add_audio_track(&self, name: impl Into<String>) -> Result<TrackId> {
        self.add_track(name, TrackKind::Audio)
    }

    pub fn add_midi_track(&self, name: impl Into<String>) -> Result<TrackId> {
        self.add_track(name, TrackKind::Midi)
    }

    fn add_track(&self, name: impl Into<String>, kind: TrackKind) -> Result<TrackId> {
        let (track, index) = {
            let mut model = self.model.lock();
            let track = model.create_track(name, kind);
            let index = model.tracks.len();
            (track, index)
        };
        let id = track.id;
        self.perform(UndoableAction::AddTrack { index, track })?;
        self.changes.publish(ChangeEvent::TrackAdded(id));
        Ok(id)
    }

    pub fn remove_track(&self, id: TrackId) -> Result<()> {
        self.perform(UndoableAction::RemoveTrack {
            track_id: id,
            index: 0,
            track: None,
            edges: Vec::new(),
        })?;
        self.changes.publish(ChangeEvent::TrackRemoved(id));
        Ok(())
    }

    pub fn add_audio_region(&self, track: TrackId, region: AudioRegion) -> Result<()> {
        self.perform(UndoableAction::AddAudioRegion { track, region })?;
        self.changes.publish(ChangeEvent::ArrangerObjectChanged(track));
        Ok(())
    }

    pub fn remove_audio_region(&self, track: TrackId, index: usize) -> Result<()> {
        self.perform(UndoableAction::RemoveAudioRegion {
            track,
            index,
            region: None,
        })?;
        self.changes.publish(ChangeEvent::ArrangerObjectChanged(track));
        Ok(())
    }

    pub fn move_audio_region(
        &self,
        track: TrackId,
        index: usize,
        start: u64,
        end: u64,
    ) -> Result<()> {
        let from = {
            let model = self.model.lock();
            let t = model.track(track)?;
            let region = t
                .audio_regions
                .get(index)
                .ok_or_else(|| Error::InvalidRegion(format!("no region at {index}")))?;
            RegionSpan {
                start: region.start,
                end: region.end,
            }
        };
        self.perform(UndoableAction::MoveAudioRegion {
            track,
            index,
            from,
            to: RegionSpan { start, end },
        })?;
        self.changes.publish(ChangeEvent::ArrangerObjectChanged(track));
        Ok(())
    }

    pub fn add_midi_region(&self, track: TrackId, region: MidiRegion) -> Result<()> {
        self.perform(UndoableAction::AddMidiRegion { track, region })?;
        self.changes.publish(ChangeEvent::ArrangerObjectChanged(track));
        Ok(())
    }

    pub fn connect(&self, connection: Connection) -> Result<()> {
        self.perform(UndoableAction::Connect { connection })
    }

    pub fn disconnect(&self, src: PortId, dst: PortId) -> Result<()> {
        self.perform(UndoableAction::Disconnect {
            src,
            dst,
            removed: None,
        })
    }

    pub fn set_connection_multiplier(&self, src: PortId, dst: PortId, multiplier: f32) -> Result<()> {
        let before = {
            let model = self.model.lock();
            model
                .connections
                .get(src, dst)
                .ok_or_else(|| Error::BadConnection("no such edge".into()))?
                .multiplier
        };
        self.perform(UndoableAction::SetConnectionMultiplier {
            src,
            dst,
            before,
            after: multiplier.clamp(0.0, 1.0),
        })
    }

    pub fn set_fader_gain(&self, track: TrackId, gain: f32) -> Result<()> {
        let before = self.model.lock().track(track)?.fader_gain;
        self.perform(UndoableAction::SetFaderGain {
            track,
            before,
            after: gain.clamp(0.0, 2.0),
        })
    }

    pub fn set_tempo(&self, bpm: f32) -> Result<()> {
        let before = self.tempo.lock().bpm();
        self.perform(UndoableAction::SetTempo { before, after: bpm })
    }

    pub fn set_time_signature(&self, numerator: u32, denominator: u32) -> Result<()> {
        let before = self.tempo.lock().time_signature();
        self.perform(UndoableAction::SetTimeSignature {
            before,
            after: (numerator, denominator),
        })
    }

    /// Instantiate and append a plugin to a track's chain.
    pub fn add_plugin(
        &self,
        track: TrackId,
        name: impl Into<String>,
        instance: Box<dyn PluginInstance>,
    ) -> Result<PluginId> {
        let (plugin, slot) = {
            let mut model = self.model.lock();
            model.track(track)?;
            let plugin = model.create_plugin(name, instance)?;
            let slot = model.track(track)?.chain.len();
            (plugin, slot)
        };
        let id = plugin.id();
        self.perform(UndoableAction::AddPlugin {
            track,
            slot,
            plugin,
        })?;
        Ok(id)
    }

    pub fn remove_plugin(&self, track: TrackId, slot: usize) -> Result<()> {
        self.perform(UndoableAction::RemovePlugin {
            track,
            slot,
            plugin: None,
            edges: Vec::new(),
        })
    }

    pub fn set_plugin_enabled(&self, plugin: PluginId, enabled: bool) -> Result<()> {
        let before = {
            let model = self.model.lock();
            model
                .find_plugin(plugin)
                .ok_or_else(|| Error::PluginInstantiationFailed(format!("{plugin:?} not found")))?
                .is_enabled()
        };
        self.perform(UndoableAction::SetPluginEnabled {
            plugin,
            before,
            after: enabled,
        })
    }

    pub fn add_cc_binding(&self, binding: Binding) -> Result<()> {
        self.perform(UndoableAction::AddBinding { binding, index: 0 })
    }

    pub fn remove_cc_binding(&self, index: usize) -> Result<()> {
        self.perform(UndoableAction::RemoveBinding {
            index,
            binding: None,
        })
    }

    /// Plugin state blob; parks the audio thread while the instance is
    /// touched.
    pub fn plugin_state(&self, plugin: PluginId) -> Result<Vec<u8>> {
        let model = self.model.lock();
        let cell = model
            .find_plugin(plugin)
            .ok_or_else(|| Error::PluginInstantiationFailed(format!("{plugin:?} not found")))?;
        let _guard = self.handshake.request(PAUSE_TIMEOUT)?;
        // SAFETY: audio thread parked by the guard.
        Ok(unsafe { cell.host() }.save_state())
    }

    pub fn load_plugin_state(&self, plugin: PluginId, blob: &[u8]) -> Result<()> {
        let model = self.model.lock();
        let cell = model
            .find_plugin(plugin)
            .ok_or_else(|| Error::PluginInstantiationFailed(format!("{plugin:?} not found")))?;
        let _guard = self.handshake.request(PAUSE_TIMEOUT)?;
        // SAFETY: audio thread parked by the guard.
        unsafe { cell.host_mut() }.load_state(blob)
    }

    // ---- graph rebuild ----

    /// Build a fresh graph from the model and hand it to the audio thread
    /// under the pause handshake.
    fn rebuild_locked(&self, model: &ProjectModel) -> Result<()> {
        // Park first: the builder reads plugin instances the audio thread
        // would otherwise be processing.
        let guard = self.handshake.request(PAUSE_TIMEOUT)?;
        self.rebuild_parked(model)?;
        drop(guard);
        self.finish_rebuild();
        Ok(())
    }

    /// The rebuild body; the caller holds the pause guard.
    fn rebuild_parked(&self, model: &ProjectModel) -> Result<()> {
        let graph = build_graph(model, model.sample_rate, model.max_block).map_err(|e| {
            self.changes
                .publish(ChangeEvent::EngineError(ErrorKind::BadConnection));
            e
        })?;
        self.update_plugin_latencies(model);
        self.graph_tx
            .send(graph)
            .map_err(|_| Error::BadConnection("audio processor gone".into()))
    }

    fn finish_rebuild(&self) {
        // Retired graphs deallocate here, never on the audio thread.
        while self.retire_rx.try_recv().is_ok() {}
        self.changes.publish(ChangeEvent::GraphRebuilt);
    }

    fn update_plugin_latencies(&self, model: &ProjectModel) {
        let mut latencies = self.plugin_latencies.lock();
        for cell in model.plugins() {
            // SAFETY: descriptor read; latency is derived from atomics and
            // instance state that only changes under the handshake.
            let host = unsafe { cell.host() };
            let latency = host.latency_frames();
            let id = host.id();
            if latencies.insert(id, latency) != Some(latency) {
                self.changes.publish(ChangeEvent::PluginLatencyChanged(id));
            }
        }
    }

    /// Force a graph rebuild (external edits).
    pub fn rebuild_graph(&self) -> Result<()> {
        let model = self.model.lock();
        self.rebuild_locked(&model)
    }

    /// Out-of-band host reconfiguration: new sample rate and/or maximum
    /// block size, applied before the next cycle. On failure the previous
    /// configuration stays in effect.
    pub fn reconfigure(&self, sample_rate: f64, max_block: usize) -> Result<()> {
        let probe = OstinatoConfig {
            sample_rate,
            max_block,
            ..self.config.clone()
        };
        probe.validate()?;

        let mut model = self.model.lock();
        let previous = (model.sample_rate, model.max_block);
        model.sample_rate = sample_rate;
        model.max_block = max_block;
        let snapshot = {
            let mut tempo = self.tempo.lock();
            tempo.set_sample_rate(sample_rate);
            tempo.snapshot()
        };

        let guard = match self.handshake.request(PAUSE_TIMEOUT) {
            Ok(guard) => guard,
            Err(e) => {
                model.sample_rate = previous.0;
                model.max_block = previous.1;
                self.tempo.lock().set_sample_rate(previous.0);
                return Err(e);
            }
        };
        Self::reactivate_plugins(&model, sample_rate, max_block);

        match self.rebuild_parked(&model) {
            Ok(()) => {
                drop(guard);
                self.commands.send(EngineCommand::ApplyTempoMap {
                    bpm: snapshot.bpm(),
                    snapshot,
                });
                self.finish_rebuild();
                info!(sample_rate, max_block, "engine reconfigured");
                Ok(())
            }
            Err(e) => {
                // Revert to the previous configuration.
                model.sample_rate = previous.0;
                model.max_block = previous.1;
                self.tempo.lock().set_sample_rate(previous.0);
                Self::reactivate_plugins(&model, previous.0, previous.1);
                let _ = self.rebuild_parked(&model);
                drop(guard);
                Err(e)
            }
        }
    }

    fn reactivate_plugins(model: &ProjectModel, sample_rate: f64, max_block: usize) {
        for cell in model.plugins() {
            // SAFETY: the audio thread is parked by the caller's guard.
            let host = unsafe { cell.host_mut() };
            host.deactivate();
            let _ = host.activate(sample_rate, max_block);
        }
    }

    /// Attach auxiliary DSP to the monitor path (auditioner, click).
    /// Not project state: it is outside the snapshot and the undo stack.
    pub fn set_monitor_processor(
        &self,
        unit: Box<dyn crate::graph::SampleProcessorUnit>,
    ) -> Result<()> {
        let mut model = self.model.lock();
        model.monitor_processor = Some(Arc::new(parking_lot::Mutex::new(unit)));
        self.rebuild_locked(&model)
    }

    pub fn clear_monitor_processor(&self) -> Result<()> {
        let mut model = self.model.lock();
        model.monitor_processor = None;
        self.rebuild_locked(&model)
    }

    // ---- snapshot ----

    /// Plain-data snapshot of everything the persistence collaborator
    /// stores. The core never serializes this itself.
    pub fn snapshot(&self) -> ProjectSnapshot {
        let model = self.model.lock();
        let tempo = self.tempo.lock();

        let tracks = model
            .tracks
            .iter()
            .map(|track| TrackSnapshot {
                id: track.id,
                name: track.name.clone(),
                kind: track.kind,
                fader_gain: track.fader_gain,
                muted: track.muted,
                audio_regions: track.audio_regions.clone(),
                midi_regions: track.midi_regions.clone(),
                sends: track.sends.clone(),
                plugins: track
                    .chain
                    .iter()
                    .map(|cell| {
                        // SAFETY: name/id are immutable, enabled/gain are
                        // atomic.
                        let host = unsafe { cell.host() };
                        PluginSnapshot {
                            id: host.id(),
                            name: host.name().to_owned(),
                            enabled: host.is_enabled(),
                            gain: host.gain(),
                        }
                    })
                    .collect(),
            })
            .collect();

        ProjectSnapshot {
            tracks,
            connections: model.connections.iter().copied().collect(),
            transport: TransportSnapshot {
                playhead: self.transport.playhead(),
                bpm: self.transport.bpm(),
                time_signature: self.transport.time_signature(),
                loop_range: self.transport.loop_range(),
            },
            tempo_points: tempo.tempo_points().to_vec(),
            time_signature_points: tempo.time_signature_points().to_vec(),
            bindings: model.bindings.bindings().to_vec(),
            clip_ids: model.pool.ids(),
        }
    }
}
