//! The processing graph: an immutable, topologically levelled DAG.
//!
//! Built on the main thread from the live model, then handed to the audio
//! thread whole. Nodes at the same level have no mutual dependency and may
//! run in parallel; every buffer has exactly one writer per cycle (fan-in
//! is gathered by the consuming node).

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::Arc;

use ostinato_clips::{MidiRegion, RegionPlayer};
use ostinato_midi::MidiEvent;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::connections::Connection;
use crate::delay::DelayLine;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{ChangeEvent, ChangePublisher};
use crate::ids::{PortId, TrackId};
use crate::model::{EnginePorts, PluginPorts, ProjectModel, Track, TrackKind};
use crate::plugin::SharedPluginHost;
use crate::port::{AudioBuffer, ControlRange, ControlState, EventBuffer, PortKind};
use crate::transport::CycleWindow;

/// Context shared by every node during one cycle.
pub struct CycleCtx<'a> {
    pub n_frames: usize,
    pub window: &'a CycleWindow,
    pub project_bpm: f32,
    pub audio_in: &'a [&'a [f32]],
    pub midi_in: &'a [MidiEvent],
    pub changes: &'a ChangePublisher,
}

/// Where a `SetControl` command lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRoute {
    NodeControl { node: u32, index: u16 },
    PluginEnabled { node: u32 },
    PluginGain { node: u32 },
    PluginParam { node: u32, index: u16 },
    TransportBpm,
    TransportSigNum,
    TransportSigDen,
    TransportRoll,
    TransportStop,
}

/// A processor that transforms a stereo pair in place; the graph's escape
/// hatch for auxiliary DSP on the monitor path (auditioning, metronome
/// click, test signals).
pub trait SampleProcessorUnit: Send {
    fn process(&mut self, left: &mut [f32], right: &mut [f32], n_frames: usize);
}

/// Shared handle to a monitor processor. The audio thread `try_lock`s it
/// per cycle and passes audio through unchanged when the main thread holds
/// the lock.
pub type SharedSampleProcessor = Arc<parking_lot::Mutex<Box<dyn SampleProcessorUnit>>>;

/// Region playback state for one track.
pub struct ProducerState {
    pub track: TrackId,
    pub kind: TrackKind,
    pub muted: bool,
    pub players: Vec<RegionPlayer>,
    pub midi_regions: Vec<MidiRegion>,
    scratch_events: Vec<MidiEvent>,
}

/// Node variants.
pub enum NodeKind {
    TrackProducer(ProducerState),
    Plugin(SharedPluginHost),
    PreFader,
    Fader,
    Send,
    MonitorOut,
    InputEndpoint { midi: bool },
    OutputEndpoint { midi: bool },
    SampleProcessor(SharedSampleProcessor),
}

/// An incoming edge, resolved to indices.
pub struct GraphEdge {
    pub src_node: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub kind: PortKind,
    pub multiplier: f32,
    pub delay: Option<DelayLine>,
}

/// One graph node with its staging and output buffers.
pub struct GraphNode {
    pub name: String,
    pub kind: NodeKind,
    pub in_audio: Vec<AudioBuffer>,
    pub out_audio: Vec<AudioBuffer>,
    pub in_events: Vec<EventBuffer>,
    pub out_events: Vec<EventBuffer>,
    pub controls: Vec<ControlState>,
    pub in_edges: Vec<GraphEdge>,
    /// Intrinsic processing latency.
    pub latency: u32,
    /// Latency of the longest path ending at this node.
    pub total_latency: u32,
    pub level: u32,
}

impl GraphNode {
    fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            in_audio: Vec::new(),
            out_audio: Vec::new(),
            in_events: Vec::new(),
            out_events: Vec::new(),
            controls: Vec::new(),
            in_edges: Vec::new(),
            latency: 0,
            total_latency: 0,
            level: 0,
        }
    }

    fn with_audio(mut self, inputs: usize, outputs: usize, max_block: usize) -> Self {
        self.in_audio = (0..inputs).map(|_| AudioBuffer::new(max_block)).collect();
        self.out_audio = (0..outputs).map(|_| AudioBuffer::new(max_block)).collect();
        self
    }

    fn with_events(mut self, inputs: usize, outputs: usize) -> Self {
        self.in_events = (0..inputs).map(|_| EventBuffer::new()).collect();
        self.out_events = (0..outputs).map(|_| EventBuffer::new()).collect();
        self
    }

    fn with_control(mut self, value: f32, range: ControlRange) -> Self {
        self.controls.push(ControlState::from_value(value, range));
        self
    }
}

#[derive(Debug)]
struct NodeCell(UnsafeCell<GraphNode>);

// SAFETY: node access is scheduled: within a level every node is processed
// by exactly one worker, and a node only reads output buffers of
// lower-level nodes, which were sealed at the previous barrier.
unsafe impl Sync for NodeCell {}
unsafe impl Send for NodeCell {}

/// The immutable levelled graph plus its per-cycle working state.
#[derive(Debug)]
pub struct ProcessGraph {
    nodes: Vec<NodeCell>,
    levels: Vec<Vec<u32>>,
    control_routes: HashMap<u64, ControlRoute>,
    edge_routes: HashMap<(u64, u64), (u32, u32)>,
    audio_out_node: Option<u32>,
    midi_out_node: Option<u32>,
    max_latency: u32,
    max_block: usize,
}

impl ProcessGraph {
    /// A graph with no nodes; the scheduler's starting state.
    pub fn empty(max_block: usize) -> Self {
        Self {
            nodes: Vec::new(),
            levels: Vec::new(),
            control_routes: HashMap::new(),
            edge_routes: HashMap::new(),
            audio_out_node: None,
            midi_out_node: None,
            max_latency: 0,
            max_block,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn levels(&self) -> &[Vec<u32>] {
        &self.levels
    }

    pub fn max_latency(&self) -> u32 {
        self.max_latency
    }

    pub fn max_block(&self) -> usize {
        self.max_block
    }

    pub fn control_route(&self, port: PortId) -> Option<ControlRoute> {
        self.control_routes.get(&port.key()).copied()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn node_mut(&self, idx: u32) -> &mut GraphNode {
        &mut *self.nodes[idx as usize].0.get()
    }

    unsafe fn node(&self, idx: u32) -> &GraphNode {
        &*self.nodes[idx as usize].0.get()
    }

    /// Apply a routed control change. Runs on the audio thread at the top
    /// of a cycle.
    pub fn apply_control(&self, route: ControlRoute, value: f32, normalized: bool) {
        match route {
            ControlRoute::NodeControl { node, index } => {
                // SAFETY: called between levels/cycles, single writer.
                let node = unsafe { self.node_mut(node) };
                if let Some(control) = node.controls.get_mut(index as usize) {
                    control.set(value, normalized);
                }
            }
            ControlRoute::PluginEnabled { node } => {
                let node = unsafe { self.node_mut(node) };
                if let NodeKind::Plugin(cell) = &node.kind {
                    cell.set_enabled(value >= 0.5);
                }
            }
            ControlRoute::PluginGain { node } => {
                let node = unsafe { self.node_mut(node) };
                if let NodeKind::Plugin(cell) = &node.kind {
                    cell.set_gain(value);
                }
            }
            ControlRoute::PluginParam { node, index } => {
                let node = unsafe { self.node_mut(node) };
                if let NodeKind::Plugin(cell) = &node.kind {
                    // SAFETY: audio thread, inside the cycle boundary.
                    unsafe { cell.host_mut() }.set_control(index as usize, value);
                }
            }
            // Transport routes are applied by the scheduler itself.
            _ => {}
        }
    }

    /// Current enabled state of a plugin node (atomic read).
    pub fn plugin_enabled(&self, node: u32) -> Option<bool> {
        if node as usize >= self.nodes.len() {
            return None;
        }
        // SAFETY: only the atomic enabled flag is read.
        let node = unsafe { self.node(node) };
        match &node.kind {
            NodeKind::Plugin(cell) => Some(cell.is_enabled()),
            _ => None,
        }
    }

    /// Update a user edge's multiplier in place (soft rebuild).
    pub fn set_edge_multiplier(&self, src: PortId, dst: PortId, multiplier: f32) {
        if let Some(&(node, edge)) = self.edge_routes.get(&(src.key(), dst.key())) {
            // SAFETY: cycle-boundary single writer.
            let node = unsafe { self.node_mut(node) };
            if let Some(edge) = node.in_edges.get_mut(edge as usize) {
                edge.multiplier = multiplier.clamp(0.0, 1.0);
            }
        }
    }

    /// Process one node: gather its inputs, then run its kind. Safe to call
    /// concurrently for distinct nodes of the same level.
    ///
    /// # Safety contract (enforced by the scheduler)
    /// `idx` is processed by exactly one thread this level, and all of its
    /// upstream nodes were completed in earlier levels.
    pub fn process_node(&self, idx: u32, ctx: &CycleCtx) {
        let n = ctx.n_frames;
        // SAFETY: per the scheduling contract above.
        let node = unsafe { self.node_mut(idx) };
        let GraphNode {
            kind,
            in_audio,
            out_audio,
            in_events,
            out_events,
            controls,
            in_edges,
            ..
        } = node;

        for buf in in_audio.iter_mut() {
            buf.clear();
        }
        for buf in in_events.iter_mut() {
            buf.clear();
        }
        let mut multi_event_fan_in = false;
        for edge in in_edges.iter_mut() {
            // SAFETY: upstream node, sealed at an earlier barrier.
            let src = unsafe { self.node(edge.src_node) };
            match edge.kind {
                PortKind::Audio | PortKind::Cv => {
                    let Some(src_buf) = src.out_audio.get(edge.src_port as usize) else {
                        continue;
                    };
                    let Some(dst_buf) = in_audio.get_mut(edge.dst_port as usize) else {
                        continue;
                    };
                    let src_slice = src_buf.read_slice(0, n);
                    match edge.delay.as_mut() {
                        Some(delay) => {
                            let dst = &mut dst_buf.as_mut_slice()[..n];
                            for (d, &s) in dst.iter_mut().zip(src_slice) {
                                *d += delay.push_pop(s) * edge.multiplier;
                            }
                        }
                        None => dst_buf.add_slice(0, src_slice, edge.multiplier),
                    }
                }
                PortKind::MidiEvents => {
                    let Some(src_buf) = src.out_events.get(edge.src_port as usize) else {
                        continue;
                    };
                    let Some(dst_buf) = in_events.get_mut(edge.dst_port as usize) else {
                        continue;
                    };
                    if !dst_buf.events().is_empty() {
                        multi_event_fan_in = true;
                    }
                    dst_buf.extend_from(src_buf.events());
                }
                PortKind::Control => {
                    // Control/CV modulation: last sample drives the value.
                    let Some(src_buf) = src.out_audio.get(edge.src_port as usize) else {
                        continue;
                    };
                    if let Some(control) = controls.get_mut(edge.dst_port as usize) {
                        control.set(src_buf.read_slice(0, n)[n - 1] * edge.multiplier, false);
                    }
                }
            }
        }
        if multi_event_fan_in {
            for buf in in_events.iter_mut() {
                buf.sort();
            }
        }

        match kind {
            NodeKind::TrackProducer(state) => {
                Self::process_producer(state, in_audio, out_audio, in_events, out_events, ctx)
            }
            NodeKind::Plugin(cell) => {
                // SAFETY: audio thread inside the cycle.
                let host = unsafe { cell.host_mut() };
                let channels_in = host.io.audio_in.len().min(in_audio.len());
                for ch in 0..channels_in {
                    host.io.audio_in[ch][..n].copy_from_slice(in_audio[ch].read_slice(0, n));
                }
                for extra in host.io.audio_in.iter_mut().skip(channels_in) {
                    extra[..n].fill(0.0);
                }
                host.io.events_in.clear();
                if let Some(events) = in_events.first() {
                    host.io.events_in.extend_from_slice(events.events());
                }
                host.process_cycle(n);
                let channels_out = host.io.audio_out.len().min(out_audio.len());
                for ch in 0..channels_out {
                    out_audio[ch].write_slice(0, &host.io.audio_out[ch][..n]);
                }
                for extra in out_audio.iter_mut().skip(channels_out) {
                    extra.clear();
                }
                if let Some(events) = out_events.first_mut() {
                    events.clear();
                    events.extend_from(&host.io.events_out);
                }
                if host.take_just_failed() {
                    ctx.changes.publish(ChangeEvent::PluginFailed(host.id()));
                    ctx.changes
                        .publish(ChangeEvent::EngineError(ErrorKind::PluginProcessFailed));
                }
            }
            NodeKind::PreFader | NodeKind::MonitorOut | NodeKind::OutputEndpoint { midi: false } => {
                for (dst, src) in out_audio.iter_mut().zip(in_audio.iter()) {
                    dst.write_slice(0, src.read_slice(0, n));
                }
            }
            NodeKind::Fader | NodeKind::Send => {
                let gain = controls.first().map(|c| c.value).unwrap_or(1.0);
                for (dst, src) in out_audio.iter_mut().zip(in_audio.iter()) {
                    dst.clear();
                    dst.add_slice(0, src.read_slice(0, n), gain);
                }
            }
            NodeKind::InputEndpoint { midi: false } => {
                for (ch, dst) in out_audio.iter_mut().enumerate() {
                    dst.clear();
                    if let Some(src) = ctx.audio_in.get(ch) {
                        dst.write_slice(0, &src[..n.min(src.len())]);
                    }
                }
            }
            NodeKind::InputEndpoint { midi: true } => {
                if let Some(events) = out_events.first_mut() {
                    events.clear();
                    events.extend_from(ctx.midi_in);
                }
            }
            NodeKind::OutputEndpoint { midi: true } => {
                if let Some(events) = out_events.first_mut() {
                    events.clear();
                    if let Some(input) = in_events.first() {
                        events.extend_from(input.events());
                    }
                }
            }
            NodeKind::SampleProcessor(cell) => {
                for (dst, src) in out_audio.iter_mut().zip(in_audio.iter()) {
                    dst.write_slice(0, src.read_slice(0, n));
                }
                if out_audio.len() >= 2 {
                    // Contended only while the main thread swaps processors;
                    // then this cycle passes through unchanged.
                    if let Some(mut unit) = cell.try_lock() {
                        let (left, right) = out_audio.split_at_mut(1);
                        unit.process(
                            &mut left[0].as_mut_slice()[..n],
                            &mut right[0].as_mut_slice()[..n],
                            n,
                        );
                    }
                }
            }
        }
    }

    fn process_producer(
        state: &mut ProducerState,
        in_audio: &mut [AudioBuffer],
        out_audio: &mut [AudioBuffer],
        in_events: &mut [EventBuffer],
        out_events: &mut [EventBuffer],
        ctx: &CycleCtx,
    ) {
        let n = ctx.n_frames;
        for buf in out_audio.iter_mut() {
            buf.clear();
        }
        for buf in out_events.iter_mut() {
            buf.clear();
        }
        if state.muted {
            return;
        }

        // Monitor-through: audio and MIDI arriving at the track inputs.
        for (dst, src) in out_audio.iter_mut().zip(in_audio.iter()) {
            dst.add_slice(0, src.read_slice(0, n), 1.0);
        }
        if let (Some(dst), Some(src)) = (out_events.first_mut(), in_events.first()) {
            dst.extend_from(src.events());
        }

        if !ctx.window.rolling {
            return;
        }

        for segment in &ctx.window.segments {
            if out_audio.len() >= 2 && !state.players.is_empty() {
                let (left, right) = out_audio.split_at_mut(1);
                let left = &mut left[0].as_mut_slice()[segment.offset..segment.offset + segment.len];
                let right =
                    &mut right[0].as_mut_slice()[segment.offset..segment.offset + segment.len];
                for player in &mut state.players {
                    if let Err(e) = player.render(
                        ctx.project_bpm,
                        segment.global_start,
                        0,
                        segment.len,
                        left,
                        right,
                    ) {
                        debug!(track = ?state.track, error = %e, "region render error");
                        ctx.changes
                            .publish(ChangeEvent::EngineError(ErrorKind::BufferIndexOutOfRange));
                    }
                }
            }
            if let Some(events) = out_events.first_mut() {
                for region in &state.midi_regions {
                    state.scratch_events.clear();
                    ostinato_clips::render_midi_region(
                        region,
                        segment.global_start,
                        0,
                        segment.len,
                        segment.chase,
                        &mut state.scratch_events,
                    );
                    for ev in &state.scratch_events {
                        events.push(ev.with_offset(ev.frame_offset + segment.offset as u32));
                    }
                }
            }
        }
        if let Some(events) = out_events.first_mut() {
            events.sort();
        }
    }

    /// Copy the terminal mix to the host buffers.
    pub fn write_host_output(
        &self,
        audio_out: &mut [&mut [f32]],
        midi_out: &mut Vec<MidiEvent>,
        n: usize,
    ) {
        match self.audio_out_node {
            Some(idx) => {
                // SAFETY: called after the final barrier; no node is running.
                let node = unsafe { self.node(idx) };
                for (ch, out) in audio_out.iter_mut().enumerate() {
                    match node.out_audio.get(ch) {
                        Some(buf) => out[..n].copy_from_slice(buf.read_slice(0, n)),
                        None => out[..n].fill(0.0),
                    }
                }
            }
            None => {
                for out in audio_out.iter_mut() {
                    out[..n].fill(0.0);
                }
            }
        }
        if let Some(idx) = self.midi_out_node {
            let node = unsafe { self.node(idx) };
            if let Some(events) = node.out_events.first() {
                midi_out.extend_from_slice(events.events());
            }
        }
    }

    /// End-of-cycle bookkeeping: trigger ports auto-reset.
    pub fn end_cycle(&self) {
        for idx in 0..self.nodes.len() as u32 {
            // SAFETY: after the final barrier, single-threaded.
            let node = unsafe { self.node_mut(idx) };
            for control in &mut node.controls {
                control.end_of_cycle();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn node_out_audio(&self, idx: u32, port: usize, n: usize) -> Vec<f32> {
        let node = unsafe { self.node(idx) };
        node.out_audio[port].read_slice(0, n).to_vec()
    }

    #[cfg(test)]
    pub(crate) fn find_node(&self, name: &str) -> Option<u32> {
        (0..self.nodes.len() as u32).find(|&i| unsafe { self.node(i) }.name == name)
    }
}

/// Builds a [`ProcessGraph`] from the model. Main thread only.
pub fn build_graph(model: &ProjectModel, sample_rate: f64, max_block: usize) -> Result<ProcessGraph> {
    GraphBuilder::new(model, sample_rate, max_block).build()
}

struct GraphBuilder<'a> {
    model: &'a ProjectModel,
    sample_rate: f64,
    max_block: usize,
    nodes: Vec<GraphNode>,
    /// Model output port -> (node, out index).
    out_map: HashMap<u64, (u32, u16)>,
    /// Model input port -> (node, in index).
    in_map: HashMap<u64, (u32, u16)>,
    control_routes: HashMap<u64, ControlRoute>,
    edge_routes: HashMap<(u64, u64), (u32, u32)>,
    /// Send delivery edges wired once every strip exists.
    pending_sends: Vec<(u32, TrackId)>,
    master_prefader: Option<u32>,
    audio_out_node: Option<u32>,
    midi_out_node: Option<u32>,
}

impl<'a> GraphBuilder<'a> {
    fn new(model: &'a ProjectModel, sample_rate: f64, max_block: usize) -> Self {
        Self {
            model,
            sample_rate,
            max_block,
            nodes: Vec::new(),
            out_map: HashMap::new(),
            in_map: HashMap::new(),
            control_routes: HashMap::new(),
            edge_routes: HashMap::new(),
            pending_sends: Vec::new(),
            master_prefader: None,
            audio_out_node: None,
            midi_out_node: None,
        }
    }

    fn push(&mut self, node: GraphNode) -> u32 {
        self.nodes.push(node);
        (self.nodes.len() - 1) as u32
    }

    fn implicit_edge(&mut self, src: u32, src_port: u16, dst: u32, dst_port: u16, kind: PortKind) {
        self.nodes[dst as usize].in_edges.push(GraphEdge {
            src_node: src,
            src_port,
            dst_port,
            kind,
            multiplier: 1.0,
            delay: None,
        });
    }

    fn build(mut self) -> Result<ProcessGraph> {
        self.add_endpoints();

        for track in &self.model.tracks {
            if track.kind == TrackKind::Master {
                let (prefader, _fader) = self.add_master(track);
                self.master_prefader = Some(prefader);
            }
        }
        let master_prefader = self
            .master_prefader
            .ok_or_else(|| Error::BadConnection("model has no master track".into()))?;

        for track in &self.model.tracks {
            if track.kind != TrackKind::Master {
                self.add_track(track, master_prefader)?;
            }
        }
        self.wire_pending_sends()?;

        self.add_user_connections();
        self.register_transport_routes();

        let levels = self.assign_levels()?;
        self.compensate_latency();
        let max_latency = self
            .nodes
            .iter()
            .map(|n| n.total_latency)
            .max()
            .unwrap_or(0);

        debug!(
            nodes = self.nodes.len(),
            levels = levels.len(),
            max_latency,
            "graph built"
        );

        Ok(ProcessGraph {
            nodes: self
                .nodes
                .into_iter()
                .map(|n| NodeCell(UnsafeCell::new(n)))
                .collect(),
            levels,
            control_routes: self.control_routes,
            edge_routes: self.edge_routes,
            audio_out_node: self.audio_out_node,
            midi_out_node: self.midi_out_node,
            max_latency,
            max_block: self.max_block,
        })
    }

    fn add_endpoints(&mut self) {
        let audio_in = self.push(
            GraphNode::new("host audio in", NodeKind::InputEndpoint { midi: false })
                .with_audio(0, 2, self.max_block),
        );
        self.out_map
            .insert(EnginePorts::host_in_l().key(), (audio_in, 0));
        self.out_map
            .insert(EnginePorts::host_in_r().key(), (audio_in, 1));

        let midi_in = self.push(
            GraphNode::new("host midi in", NodeKind::InputEndpoint { midi: true })
                .with_events(0, 1),
        );
        self.out_map.insert(EnginePorts::midi_in().key(), (midi_in, 0));

        let audio_out = self.push(
            GraphNode::new("host audio out", NodeKind::OutputEndpoint { midi: false })
                .with_audio(2, 2, self.max_block),
        );
        self.in_map
            .insert(EnginePorts::master_out_l().key(), (audio_out, 0));
        self.in_map
            .insert(EnginePorts::master_out_r().key(), (audio_out, 1));
        self.audio_out_node = Some(audio_out);

        let midi_out = self.push(
            GraphNode::new("host midi out", NodeKind::OutputEndpoint { midi: true })
                .with_events(1, 1),
        );
        self.in_map
            .insert(EnginePorts::midi_out().key(), (midi_out, 0));
        self.midi_out_node = Some(midi_out);
    }

    fn add_master(&mut self, track: &Track) -> (u32, u32) {
        let prefader = self.push(
            GraphNode::new("master prefader", NodeKind::PreFader).with_audio(
                2,
                2,
                self.max_block,
            ),
        );
        let fader = self.push(
            GraphNode::new("master fader", NodeKind::Fader)
                .with_audio(2, 2, self.max_block)
                .with_control(track.fader_gain, ControlRange::new(0.0, 2.0, 1.0)),
        );
        let monitor = self.push(
            GraphNode::new("monitor out", NodeKind::MonitorOut).with_audio(2, 2, self.max_block),
        );
        self.implicit_edge(prefader, 0, fader, 0, PortKind::Audio);
        self.implicit_edge(prefader, 1, fader, 1, PortKind::Audio);

        // Optional auxiliary processor on the monitor path.
        let monitor_src = match &self.model.monitor_processor {
            Some(cell) => {
                let sp = self.push(
                    GraphNode::new(
                        "monitor processor",
                        NodeKind::SampleProcessor(Arc::clone(cell)),
                    )
                    .with_audio(2, 2, self.max_block),
                );
                self.implicit_edge(fader, 0, sp, 0, PortKind::Audio);
                self.implicit_edge(fader, 1, sp, 1, PortKind::Audio);
                sp
            }
            None => fader,
        };
        self.implicit_edge(monitor_src, 0, monitor, 0, PortKind::Audio);
        self.implicit_edge(monitor_src, 1, monitor, 1, PortKind::Audio);

        let audio_out = self.audio_out_node.expect("endpoints added first");
        self.implicit_edge(fader, 0, audio_out, 0, PortKind::Audio);
        self.implicit_edge(fader, 1, audio_out, 1, PortKind::Audio);

        // Model identity of the master strip.
        self.out_map.insert(track.out_l().key(), (fader, 0));
        self.out_map.insert(track.out_r().key(), (fader, 1));
        self.control_routes.insert(
            track.fader_gain_port().key(),
            ControlRoute::NodeControl {
                node: fader,
                index: 0,
            },
        );
        (prefader, fader)
    }

    /// Add a non-master strip; returns its fader node.
    fn add_track(&mut self, track: &Track, master_prefader: u32) -> Result<u32> {
        let players = track
            .audio_regions
            .iter()
            .filter_map(|region| match self.model.pool.get(region.clip) {
                Some(clip) => Some(RegionPlayer::new(
                    region.clone(),
                    clip,
                    self.sample_rate,
                    self.max_block,
                )),
                None => {
                    warn!(clip = ?region.clip, "region references unknown clip");
                    None
                }
            })
            .collect();

        let producer = self.push(
            GraphNode::new(
                format!("{} producer", track.name),
                NodeKind::TrackProducer(ProducerState {
                    track: track.id,
                    kind: track.kind,
                    muted: track.muted,
                    players,
                    midi_regions: track.midi_regions.clone(),
                    scratch_events: Vec::with_capacity(EventBuffer::DEFAULT_CAPACITY),
                }),
            )
            .with_audio(2, 2, self.max_block)
            .with_events(1, 1),
        );
        self.in_map.insert(track.in_l().key(), (producer, 0));
        self.in_map.insert(track.in_r().key(), (producer, 1));
        self.in_map.insert(track.midi_in().key(), (producer, 0));
        self.out_map.insert(track.midi_out().key(), (producer, 0));

        // MIDI tracks implicitly listen to the host MIDI input.
        if track.kind == TrackKind::Midi {
            if let Some(&(midi_in, port)) = self.out_map.get(&EnginePorts::midi_in().key()) {
                self.implicit_edge(midi_in, port, producer, 0, PortKind::MidiEvents);
            }
        }

        // Plugin chain.
        let mut prev_audio: (u32, u16, u16) = (producer, 0, 1);
        for cell in &track.chain {
            // SAFETY: main thread, graph not yet published; the audio
            // thread still runs the previous graph which also shares these
            // cells, but only descriptor fields are read here.
            let host = unsafe { cell.host() };
            let layout = host.layout().clone();
            let owner = host.owner();
            let id = host.id();
            let node = self.push(
                GraphNode::new(
                    format!("{} [{}]", host.name(), id.0),
                    NodeKind::Plugin(SharedPluginHost::clone(cell)),
                )
                .with_audio(layout.audio_in.max(2), layout.audio_out.max(2), self.max_block)
                .with_events(usize::from(layout.midi_in), usize::from(layout.midi_out)),
            );
            self.nodes[node as usize].latency = host.latency_frames();

            self.implicit_edge(prev_audio.0, prev_audio.1, node, 0, PortKind::Audio);
            self.implicit_edge(prev_audio.0, prev_audio.2, node, 1, PortKind::Audio);
            if layout.midi_in {
                self.implicit_edge(producer, 0, node, 0, PortKind::MidiEvents);
            }
            prev_audio = (node, 0, 1);

            self.control_routes.insert(
                PluginPorts::enabled(owner).key(),
                ControlRoute::PluginEnabled { node },
            );
            self.control_routes.insert(
                PluginPorts::gain(owner).key(),
                ControlRoute::PluginGain { node },
            );
            for (i, _) in layout.controls.iter().enumerate() {
                self.control_routes.insert(
                    PluginPorts::control(owner, i).key(),
                    ControlRoute::PluginParam {
                        node,
                        index: i as u16,
                    },
                );
            }
        }

        let prefader = self.push(
            GraphNode::new(format!("{} prefader", track.name), NodeKind::PreFader).with_audio(
                2,
                2,
                self.max_block,
            ),
        );
        let fader = self.push(
            GraphNode::new(format!("{} fader", track.name), NodeKind::Fader)
                .with_audio(2, 2, self.max_block)
                .with_control(track.fader_gain, ControlRange::new(0.0, 2.0, 1.0)),
        );
        self.implicit_edge(prev_audio.0, prev_audio.1, prefader, 0, PortKind::Audio);
        self.implicit_edge(prev_audio.0, prev_audio.2, prefader, 1, PortKind::Audio);
        self.implicit_edge(prefader, 0, fader, 0, PortKind::Audio);
        self.implicit_edge(prefader, 1, fader, 1, PortKind::Audio);
        self.implicit_edge(fader, 0, master_prefader, 0, PortKind::Audio);
        self.implicit_edge(fader, 1, master_prefader, 1, PortKind::Audio);

        self.out_map.insert(track.out_l().key(), (fader, 0));
        self.out_map.insert(track.out_r().key(), (fader, 1));
        self.control_routes.insert(
            track.fader_gain_port().key(),
            ControlRoute::NodeControl {
                node: fader,
                index: 0,
            },
        );

        // Sends tap pre- or post-fader.
        for (slot, send) in track.sends.iter().enumerate() {
            let target = self.model.track(send.target)?;
            let send_node = self.push(
                GraphNode::new(format!("{} send {}", track.name, slot), NodeKind::Send)
                    .with_audio(2, 2, self.max_block)
                    .with_control(send.amount, ControlRange::UNIT),
            );
            let tap = if send.pre_fader { prefader } else { fader };
            self.implicit_edge(tap, 0, send_node, 0, PortKind::Audio);
            self.implicit_edge(tap, 1, send_node, 1, PortKind::Audio);
            self.control_routes.insert(
                track.send_amount_port(slot).key(),
                ControlRoute::NodeControl {
                    node: send_node,
                    index: 0,
                },
            );
            // Delivery edge: resolved once the target's producer exists;
            // record it for the user-connection pass instead when the
            // target comes later in the tracklist.
            self.pending_sends.push((send_node, target.id));
        }

        Ok(fader)
    }

    /// Deliver each send into its target strip (producer inputs, or the
    /// master prefader for sends to the master bus).
    fn wire_pending_sends(&mut self) -> Result<()> {
        for (send_node, target) in std::mem::take(&mut self.pending_sends) {
            if target == self.model.master {
                let prefader = self.master_prefader.expect("master built before sends");
                self.implicit_edge(send_node, 0, prefader, 0, PortKind::Audio);
                self.implicit_edge(send_node, 1, prefader, 1, PortKind::Audio);
                continue;
            }
            let track = self.model.track(target)?;
            let l = self.in_map.get(&track.in_l().key()).copied();
            let r = self.in_map.get(&track.in_r().key()).copied();
            match (l, r) {
                (Some((dst, p0)), Some((_, p1))) => {
                    self.implicit_edge(send_node, 0, dst, p0, PortKind::Audio);
                    self.implicit_edge(send_node, 1, dst, p1, PortKind::Audio);
                }
                _ => warn!(target = ?target, "send target has no inputs"),
            }
        }
        Ok(())
    }

    fn add_user_connections(&mut self) {
        for conn in self.model.connections.iter() {
            if !conn.enabled {
                continue;
            }
            self.add_user_edge(conn);
        }
    }

    fn add_user_edge(&mut self, conn: &Connection) {
        let Some(&(src_node, src_port)) = self.out_map.get(&conn.src.key()) else {
            warn!(src = ?conn.src, "connection source not in graph");
            return;
        };
        let (dst_node, dst_port, control_dst) = match self.in_map.get(&conn.dst.key()) {
            Some(&(node, port)) => (node, port, false),
            // Modulation edges land on a node control instead of a buffer.
            None => match self.control_routes.get(&conn.dst.key()) {
                Some(&ControlRoute::NodeControl { node, index }) => (node, index, true),
                _ => {
                    warn!(dst = ?conn.dst, "connection destination not in graph");
                    return;
                }
            },
        };
        let kind = if control_dst {
            PortKind::Control
        } else {
            self.model
                .ports
                .get(conn.src)
                .map(|s| s.kind)
                .unwrap_or(PortKind::Audio)
        };
        let edge_idx = self.nodes[dst_node as usize].in_edges.len() as u32;
        self.nodes[dst_node as usize].in_edges.push(GraphEdge {
            src_node,
            src_port,
            dst_port,
            kind,
            multiplier: conn.multiplier,
            delay: None,
        });
        self.edge_routes
            .insert((conn.src.key(), conn.dst.key()), (dst_node, edge_idx));
    }

    fn register_transport_routes(&mut self) {
        self.control_routes
            .insert(EnginePorts::bpm().key(), ControlRoute::TransportBpm);
        self.control_routes.insert(
            EnginePorts::time_sig_num().key(),
            ControlRoute::TransportSigNum,
        );
        self.control_routes.insert(
            EnginePorts::time_sig_den().key(),
            ControlRoute::TransportSigDen,
        );
        self.control_routes.insert(
            EnginePorts::transport_roll().key(),
            ControlRoute::TransportRoll,
        );
        self.control_routes.insert(
            EnginePorts::transport_stop().key(),
            ControlRoute::TransportStop,
        );
    }

    /// Kahn's algorithm: topological levels, cycle detection.
    fn assign_levels(&mut self) -> Result<Vec<Vec<u32>>> {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let mut successors: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); n];
        for (dst, node) in self.nodes.iter().enumerate() {
            for edge in &node.in_edges {
                indegree[dst] += 1;
                successors[edge.src_node as usize].push(dst as u32);
            }
        }

        let mut level_of = vec![0u32; n];
        let mut frontier: Vec<u32> = (0..n as u32).filter(|&i| indegree[i as usize] == 0).collect();
        let mut processed = 0usize;
        let mut levels: Vec<Vec<u32>> = Vec::new();

        while !frontier.is_empty() {
            let current_level = levels.len() as u32;
            let mut next: Vec<u32> = Vec::new();
            for &idx in &frontier {
                level_of[idx as usize] = current_level;
                processed += 1;
                for &succ in &successors[idx as usize] {
                    indegree[succ as usize] -= 1;
                    if indegree[succ as usize] == 0 {
                        next.push(succ);
                    }
                }
            }
            levels.push(std::mem::take(&mut frontier));
            frontier = next;
        }

        if processed != n {
            return Err(Error::BadConnection(
                "connection graph contains a cycle".into(),
            ));
        }
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.level = level_of[i];
        }
        Ok(levels)
    }

    /// Propagate path latency and insert integer-frame delays on audio
    /// edges so parallel paths stay aligned.
    fn compensate_latency(&mut self) {
        // Nodes indexed in level order: iterate levels ascending.
        let order: Vec<u32> = {
            let mut order: Vec<u32> = (0..self.nodes.len() as u32).collect();
            order.sort_by_key(|&i| self.nodes[i as usize].level);
            order
        };
        for idx in order {
            let upstream_max = self.nodes[idx as usize]
                .in_edges
                .iter()
                .map(|e| self.nodes[e.src_node as usize].total_latency)
                .max()
                .unwrap_or(0);
            let node = &mut self.nodes[idx as usize];
            node.total_latency = upstream_max + node.latency;

            // Borrow dance: collect delays first.
            let delays: Vec<Option<usize>> = self.nodes[idx as usize]
                .in_edges
                .iter()
                .map(|e| {
                    let src_latency = self.nodes[e.src_node as usize].total_latency;
                    let needed = (upstream_max - src_latency) as usize;
                    (needed > 0 && matches!(e.kind, PortKind::Audio | PortKind::Cv))
                        .then_some(needed)
                })
                .collect();
            for (edge, delay) in self.nodes[idx as usize]
                .in_edges
                .iter_mut()
                .zip(delays)
            {
                if let Some(frames) = delay {
                    edge.delay = Some(DelayLine::new(frames));
                }
            }
        }
    }
}
