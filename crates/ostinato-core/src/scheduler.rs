//! The per-cycle scheduler and router, driven by the host callback.
//!
//! One `process` call ingests host input, drains the command queue and the
//! MIDI ring, advances the transport, walks the graph level by level, and
//! writes host output. Structural edits park this thread between cycles
//! through the pause handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};
use ostinato_midi::{BindingFire, BindingSnapshot, BindingTarget, MidiEvent, MidiRingConsumer, TransportAction};
use smallvec::SmallVec;

use crate::commands::EngineCommand;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{ChangeEvent, ChangePublisher};
use crate::graph::{ControlRoute, CycleCtx, ProcessGraph};
use crate::metering::CycleMeter;
use crate::transport::{PlayState, Transport};
use crate::workers::WorkerPool;

/// How long the action pipeline waits for the audio thread to park.
pub const PAUSE_TIMEOUT: Duration = Duration::from_millis(200);

/// The coarse pause handshake. The UI side raises `requested` and waits for
/// the audio thread to be between cycles; while raised, the audio thread
/// emits silence without touching the graph.
#[derive(Debug)]
pub struct PauseHandshake {
    requested: AtomicBool,
    in_cycle: AtomicBool,
}

impl PauseHandshake {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requested: AtomicBool::new(false),
            in_cycle: AtomicBool::new(false),
        })
    }

    /// Park the audio thread. Returns a guard that releases on drop.
    pub fn request(self: &Arc<Self>, timeout: Duration) -> Result<PauseGuard> {
        if self.requested.swap(true, Ordering::AcqRel) {
            return Err(Error::RebuildRequestedWhileRebuilding);
        }
        let deadline = Instant::now() + timeout;
        while self.in_cycle.load(Ordering::Acquire) {
            if Instant::now() > deadline {
                self.requested.store(false, Ordering::Release);
                return Err(Error::PauseHandshakeTimeout);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        Ok(PauseGuard {
            handshake: Arc::clone(self),
        })
    }

    /// Audio side, top of cycle: true means "stay parked this cycle".
    fn enter_cycle(&self) -> bool {
        if self.requested.load(Ordering::Acquire) {
            return false;
        }
        self.in_cycle.store(true, Ordering::Release);
        // Double-check: a request that landed between the load and the
        // store must not wait on us mid-cycle.
        if self.requested.load(Ordering::Acquire) {
            self.in_cycle.store(false, Ordering::Release);
            return false;
        }
        true
    }

    fn exit_cycle(&self) {
        self.in_cycle.store(false, Ordering::Release);
    }
}

/// Holds the audio thread parked; dropping releases it.
#[derive(Debug)]
pub struct PauseGuard {
    handshake: Arc<PauseHandshake>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.handshake.requested.store(false, Ordering::Release);
    }
}

/// Host-side I/O for one cycle. Channel slices must each hold at least
/// `n_frames` samples.
pub struct HostIo<'a, 'b> {
    pub audio_in: &'a [&'a [f32]],
    pub midi_in: &'a [MidiEvent],
    pub audio_out: &'a mut [&'b mut [f32]],
    pub midi_out: &'a mut Vec<MidiEvent>,
}

/// The realtime processor handed to the host callback. Owns the current
/// graph; never allocates, locks, or blocks inside `process`.
pub struct AudioProcessor {
    graph: ProcessGraph,
    graph_rx: Receiver<ProcessGraph>,
    retire_tx: Sender<ProcessGraph>,
    commands: Receiver<EngineCommand>,
    transport: Arc<Transport>,
    midi_in: MidiRingConsumer,
    bindings: Arc<ArcSwap<BindingSnapshot>>,
    changes: ChangePublisher,
    handshake: Arc<PauseHandshake>,
    workers: WorkerPool,
    meter: Arc<CycleMeter>,
    max_block: usize,
    last_ring_dropped: u64,
    chase_pending: bool,
}

impl AudioProcessor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        graph: ProcessGraph,
        graph_rx: Receiver<ProcessGraph>,
        retire_tx: Sender<ProcessGraph>,
        commands: Receiver<EngineCommand>,
        transport: Arc<Transport>,
        midi_in: MidiRingConsumer,
        bindings: Arc<ArcSwap<BindingSnapshot>>,
        changes: ChangePublisher,
        handshake: Arc<PauseHandshake>,
        workers: WorkerPool,
        meter: Arc<CycleMeter>,
    ) -> Self {
        let max_block = graph.max_block();
        Self {
            graph,
            graph_rx,
            retire_tx,
            commands,
            transport,
            midi_in,
            bindings,
            changes,
            handshake,
            workers,
            meter,
            max_block,
            last_ring_dropped: 0,
            chase_pending: false,
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn graph_latency(&self) -> u32 {
        self.graph.max_latency()
    }

    fn silence(io: &mut HostIo, n_frames: usize) {
        for out in io.audio_out.iter_mut() {
            out[..n_frames].fill(0.0);
        }
    }

    /// Swap in the newest pending graph, retiring old ones to the main
    /// thread for deallocation.
    fn adopt_pending_graph(&mut self) {
        while let Ok(new_graph) = self.graph_rx.try_recv() {
            self.max_block = new_graph.max_block();
            let old = std::mem::replace(&mut self.graph, new_graph);
            let _ = self.retire_tx.send(old);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                EngineCommand::SetControl {
                    port,
                    value,
                    normalized,
                } => match self.graph.control_route(port) {
                    Some(ControlRoute::TransportBpm) => {
                        let applied = self.transport.apply_bpm_rt(value);
                        self.changes
                            .publish(ChangeEvent::TransportBpmChanged(applied));
                    }
                    Some(ControlRoute::TransportRoll) => self.apply_transport_action(
                        TransportAction::Play,
                    ),
                    Some(ControlRoute::TransportStop) => self.apply_transport_action(
                        TransportAction::Pause,
                    ),
                    Some(ControlRoute::TransportSigNum) | Some(ControlRoute::TransportSigDen) => {
                        // Time-signature edits arrive with a prebuilt map
                        // via ApplyTimeSignature; the bare control port is
                        // accepted but has no frame-rate effect.
                    }
                    Some(route) => self.graph.apply_control(route, value, normalized),
                    None => {}
                },
                EngineCommand::SetConnectionGain {
                    src,
                    dst,
                    multiplier,
                } => self.graph.set_edge_multiplier(src, dst, multiplier),
                EngineCommand::Play => {
                    self.transport.apply_play();
                    self.changes
                        .publish(ChangeEvent::TransportStateChanged(self.transport.state()));
                }
                EngineCommand::Pause => {
                    self.transport.apply_pause();
                    self.changes
                        .publish(ChangeEvent::TransportStateChanged(PlayState::Paused));
                }
                EngineCommand::TogglePlay => {
                    self.transport.apply_toggle();
                    self.changes
                        .publish(ChangeEvent::TransportStateChanged(self.transport.state()));
                }
                EngineCommand::SetPosition(frame) => {
                    self.transport.apply_seek(frame);
                    self.chase_pending = true;
                    self.changes.publish(ChangeEvent::TransportPositionJumped);
                }
                EngineCommand::SetLoop {
                    start,
                    end,
                    enabled,
                } => self.transport.apply_loop(start, end, enabled),
                EngineCommand::ApplyTempoMap { snapshot, bpm } => {
                    self.transport.apply_tempo_snapshot(snapshot, bpm);
                    self.changes.publish(ChangeEvent::TransportBpmChanged(bpm));
                }
                EngineCommand::ApplyTimeSignature {
                    snapshot,
                    numerator,
                    denominator,
                } => {
                    let bpm = self.transport.bpm();
                    self.transport.apply_tempo_snapshot(snapshot, bpm);
                    self.changes.publish(ChangeEvent::TransportTimeSignatureChanged(
                        numerator,
                        denominator,
                    ));
                }
            }
        }
    }

    fn apply_transport_action(&mut self, action: TransportAction) {
        match action {
            TransportAction::Play => self.transport.apply_play(),
            TransportAction::Pause => self.transport.apply_pause(),
            TransportAction::TogglePlay => self.transport.apply_toggle(),
            TransportAction::ReturnToStart => {
                self.transport.apply_seek(0);
                self.chase_pending = true;
            }
        }
        self.changes
            .publish(ChangeEvent::TransportStateChanged(self.transport.state()));
    }

    fn apply_binding_fire(&mut self, fire: BindingFire) {
        match fire.target {
            BindingTarget::SetControl { port_key } => {
                let port = crate::ids::PortId::from_key(port_key);
                if let Some(route) = self.graph.control_route(port) {
                    match route {
                        ControlRoute::TransportBpm => {
                            let applied = self.transport.apply_bpm_rt(
                                20.0 + (999.0 - 20.0) * fire.normalized(),
                            );
                            self.changes
                                .publish(ChangeEvent::TransportBpmChanged(applied));
                        }
                        _ => self.graph.apply_control(route, fire.normalized(), true),
                    }
                }
            }
            BindingTarget::Toggle { port_key } => {
                if fire.is_on() {
                    let port = crate::ids::PortId::from_key(port_key);
                    match self.graph.control_route(port) {
                        Some(ControlRoute::PluginEnabled { node }) => {
                            let on = self.graph.plugin_enabled(node).unwrap_or(false);
                            self.graph.apply_control(
                                ControlRoute::PluginEnabled { node },
                                if on { 0.0 } else { 1.0 },
                                false,
                            );
                        }
                        Some(route) => self.graph.apply_control(route, 1.0, false),
                        None => {}
                    }
                }
            }
            BindingTarget::Transport(action) => {
                if fire.is_on() {
                    self.apply_transport_action(action);
                }
            }
        }
    }

    /// Drain the MIDI ring and merge host-delivered events, sorted by
    /// `(frame_offset, sequence)`; fire CC bindings along the way.
    fn collect_midi(&mut self, host_events: &[MidiEvent]) -> SmallVec<[MidiEvent; 64]> {
        let mut events = self.midi_in.drain_sorted();
        if !host_events.is_empty() {
            events.extend_from_slice(host_events);
            events.sort_unstable_by_key(MidiEvent::sort_key);
        }

        let dropped = self.midi_in.dropped();
        if dropped != self.last_ring_dropped {
            self.changes.publish(ChangeEvent::MidiRingOverflow {
                dropped: dropped - self.last_ring_dropped,
            });
            self.changes
                .publish(ChangeEvent::EngineError(ErrorKind::MidiRingOverflow));
            self.last_ring_dropped = dropped;
        }

        let bindings = self.bindings.load();
        if !bindings.is_empty() {
            let mut fires: SmallVec<[BindingFire; 8]> = SmallVec::new();
            for event in &events {
                fires.extend(bindings.fires_for(event));
            }
            drop(bindings);
            for fire in fires {
                self.apply_binding_fire(fire);
            }
        }
        events
    }

    /// One host callback: produce exactly `n_frames` frames.
    pub fn process(&mut self, io: &mut HostIo, n_frames: usize) {
        let started = Instant::now();
        let n_frames = n_frames.min(self.max_block);

        if !self.handshake.enter_cycle() {
            // Parked for a structural edit: silence, no state change.
            Self::silence(io, n_frames);
            return;
        }

        self.adopt_pending_graph();
        self.drain_commands();
        let midi = self.collect_midi(io.midi_in);

        let chase = std::mem::take(&mut self.chase_pending);
        let window = self.transport.plan_cycle(n_frames, chase);

        {
            let ctx = CycleCtx {
                n_frames,
                window: &window,
                project_bpm: self.transport.bpm(),
                audio_in: io.audio_in,
                midi_in: &midi,
                changes: &self.changes,
            };
            for level in self.graph.levels() {
                self.workers.process_level(&self.graph, level, &ctx);
            }
        }

        self.graph
            .write_host_output(io.audio_out, io.midi_out, n_frames);
        self.graph.end_cycle();
        self.transport.commit_cycle(&window, n_frames);

        self.handshake.exit_cycle();
        self.meter.record(started.elapsed().as_secs_f64());
    }
}
