//! Plugin host adapter: one processing contract over heterogeneous
//! plugin instances.
//!
//! The adapter owns two mandatory controls per instance, `Enabled`
//! (toggle) and `Gain` (0-8 linear). Bypassed or failed instances route
//! inputs to outputs one-for-one; repeated process failures park the
//! instance in the terminal `Failed` state, keeping its connections.

use std::cell::UnsafeCell;
use std::sync::Arc;

use ostinato_midi::MidiEvent;
use tracing::warn;

use crate::error::{Error, Result};
use crate::ids::{OwnerHandle, PluginId};
use crate::lockfree::{AtomicFlag, AtomicFloat};
use crate::port::ControlRange;

/// Consecutive `process` failures before an instance is parked.
pub const MAX_PROCESS_FAILURES: u32 = 3;

/// Upper bound of the adapter's gain control.
pub const PLUGIN_GAIN_MAX: f32 = 8.0;

/// Gain within this of unity skips the output scaling pass.
const GAIN_UNITY_EPSILON: f32 = 1e-3;

/// A control parameter a plugin exposes.
#[derive(Clone, Debug)]
pub struct PluginControlSpec {
    pub name: String,
    pub range: ControlRange,
}

/// Typed port layout a plugin reports at instantiation.
#[derive(Clone, Debug, Default)]
pub struct PluginLayout {
    pub audio_in: usize,
    pub audio_out: usize,
    pub midi_in: bool,
    pub midi_out: bool,
    pub controls: Vec<PluginControlSpec>,
}

/// Per-instance processing buffers, allocated once at activation.
#[derive(Debug, Default)]
pub struct PluginIo {
    pub audio_in: Vec<Vec<f32>>,
    pub audio_out: Vec<Vec<f32>>,
    pub events_in: Vec<MidiEvent>,
    pub events_out: Vec<MidiEvent>,
    pub n_frames: usize,
}

impl PluginIo {
    fn configure(&mut self, layout: &PluginLayout, max_block: usize) {
        self.audio_in = vec![vec![0.0; max_block]; layout.audio_in];
        self.audio_out = vec![vec![0.0; max_block]; layout.audio_out];
        self.events_in = Vec::with_capacity(crate::port::EventBuffer::DEFAULT_CAPACITY);
        self.events_out = Vec::with_capacity(crate::port::EventBuffer::DEFAULT_CAPACITY);
    }
}

/// The contract every hosted plugin satisfies, whatever its native format.
pub trait PluginInstance: Send {
    fn layout(&self) -> PluginLayout;

    fn activate(&mut self, sample_rate: f64, max_block: usize) -> Result<()>;

    fn deactivate(&mut self);

    /// Read `io.audio_in`/`io.events_in`, write `io.audio_out`/
    /// `io.events_out` for `io.n_frames` frames.
    fn process(&mut self, io: &mut PluginIo) -> Result<()>;

    fn set_control(&mut self, index: usize, value: f32);

    fn latency_frames(&self) -> u32 {
        0
    }

    fn save_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn load_state(&mut self, _blob: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Instance lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginLifecycle {
    Uninstantiated,
    Instantiated,
    Activated,
    Deactivated,
    /// Terminal: scheduled as passthrough, never invoked again.
    Failed,
    Destroyed,
}

/// Adapter around one plugin instance.
pub struct PluginHost {
    id: PluginId,
    name: String,
    owner: OwnerHandle,
    instance: Option<Box<dyn PluginInstance>>,
    lifecycle: PluginLifecycle,
    layout: PluginLayout,
    pub io: PluginIo,
    enabled: AtomicFlag,
    gain: AtomicFloat,
    failures: u32,
    /// Set when the last `process_cycle` parked the instance; the
    /// scheduler reports it and clears the flag.
    just_failed: bool,
}

impl PluginHost {
    pub fn new(
        id: PluginId,
        owner: OwnerHandle,
        name: impl Into<String>,
        instance: Box<dyn PluginInstance>,
    ) -> Self {
        let layout = instance.layout();
        Self {
            id,
            name: name.into(),
            owner,
            instance: Some(instance),
            lifecycle: PluginLifecycle::Instantiated,
            layout,
            io: PluginIo::default(),
            enabled: AtomicFlag::new(true),
            gain: AtomicFloat::new(1.0),
            failures: 0,
            just_failed: false,
        }
    }

    /// Placeholder for an instantiation failure: permanently bypassed but
    /// keeps its slot and connections.
    pub fn failed(id: PluginId, owner: OwnerHandle, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            owner,
            instance: None,
            lifecycle: PluginLifecycle::Failed,
            layout: PluginLayout {
                audio_in: 2,
                audio_out: 2,
                ..Default::default()
            },
            io: PluginIo::default(),
            enabled: AtomicFlag::new(true),
            gain: AtomicFloat::new(1.0),
            failures: 0,
            just_failed: false,
        }
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn owner(&self) -> OwnerHandle {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &PluginLayout {
        &self.layout
    }

    pub fn lifecycle(&self) -> PluginLifecycle {
        self.lifecycle
    }

    pub fn is_failed(&self) -> bool {
        self.lifecycle == PluginLifecycle::Failed
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.set(gain.clamp(0.0, PLUGIN_GAIN_MAX));
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    pub fn activate(&mut self, sample_rate: f64, max_block: usize) -> Result<()> {
        match self.lifecycle {
            PluginLifecycle::Instantiated | PluginLifecycle::Deactivated => {}
            PluginLifecycle::Activated => return Ok(()),
            PluginLifecycle::Failed => return Ok(()),
            state => {
                return Err(Error::PluginInstantiationFailed(format!(
                    "cannot activate '{}' from {state:?}",
                    self.name
                )))
            }
        }
        self.io.configure(&self.layout, max_block);
        if let Some(instance) = self.instance.as_mut() {
            if let Err(e) = instance.activate(sample_rate, max_block) {
                warn!(plugin = %self.name, error = %e, "activation failed");
                self.lifecycle = PluginLifecycle::Failed;
                self.just_failed = true;
                return Err(e);
            }
        }
        self.lifecycle = PluginLifecycle::Activated;
        Ok(())
    }

    pub fn deactivate(&mut self) {
        if self.lifecycle == PluginLifecycle::Activated {
            if let Some(instance) = self.instance.as_mut() {
                instance.deactivate();
            }
            self.lifecycle = PluginLifecycle::Deactivated;
        }
    }

    pub fn destroy(&mut self) {
        self.deactivate();
        self.instance = None;
        self.lifecycle = PluginLifecycle::Destroyed;
    }

    pub fn latency_frames(&self) -> u32 {
        if self.is_failed() || !self.is_enabled() {
            return 0;
        }
        self.instance
            .as_ref()
            .map(|i| i.latency_frames())
            .unwrap_or(0)
    }

    pub fn set_control(&mut self, index: usize, value: f32) {
        if self.is_failed() {
            return;
        }
        if let Some(instance) = self.instance.as_mut() {
            instance.set_control(index, value);
        }
    }

    pub fn save_state(&self) -> Vec<u8> {
        self.instance
            .as_ref()
            .map(|i| i.save_state())
            .unwrap_or_default()
    }

    pub fn load_state(&mut self, blob: &[u8]) -> Result<()> {
        match self.instance.as_mut() {
            Some(instance) => instance.load_state(blob),
            None => Ok(()),
        }
    }

    /// Scheduler hook: did the last cycle park this instance?
    pub fn take_just_failed(&mut self) -> bool {
        std::mem::take(&mut self.just_failed)
    }

    /// Run one cycle. The caller fills `io.audio_in`/`io.events_in`
    /// beforehand and reads `io.audio_out`/`io.events_out` afterwards.
    pub fn process_cycle(&mut self, n_frames: usize) {
        self.io.n_frames = n_frames;
        self.io.events_out.clear();

        let bypass = !self.is_enabled()
            || self.is_failed()
            || self.lifecycle != PluginLifecycle::Activated;

        if bypass {
            self.passthrough(n_frames);
            return;
        }

        let instance = self
            .instance
            .as_mut()
            .expect("activated plugin always has an instance");
        if let Err(e) = instance.process(&mut self.io) {
            self.failures += 1;
            warn!(
                plugin = %self.name,
                failures = self.failures,
                error = %e,
                "plugin process failed"
            );
            if self.failures >= MAX_PROCESS_FAILURES {
                self.lifecycle = PluginLifecycle::Failed;
                self.just_failed = true;
            }
            self.passthrough(n_frames);
            return;
        }
        self.failures = 0;

        let gain = self.gain.get();
        if (gain - 1.0).abs() > GAIN_UNITY_EPSILON {
            for channel in &mut self.io.audio_out {
                for sample in &mut channel[..n_frames] {
                    *sample *= gain;
                }
            }
        }
    }

    /// Route inputs to outputs by matching channels and ports one-for-one.
    fn passthrough(&mut self, n_frames: usize) {
        let channels = self.io.audio_in.len().min(self.io.audio_out.len());
        for ch in 0..channels {
            let (ins, outs) = (&self.io.audio_in[ch], &mut self.io.audio_out[ch]);
            outs[..n_frames].copy_from_slice(&ins[..n_frames]);
        }
        for extra in self.io.audio_out.iter_mut().skip(channels) {
            extra[..n_frames].fill(0.0);
        }
        let PluginIo {
            events_in,
            events_out,
            ..
        } = &mut self.io;
        events_out.extend_from_slice(events_in);
    }
}

/// Shared ownership of a plugin host between the model and the graph.
///
/// The audio thread has exclusive access during cycles; the main thread
/// touches the instance only under the pause handshake (or through the
/// atomic enabled/gain setters, which are always safe).
pub struct PluginCell(UnsafeCell<PluginHost>);

// SAFETY: access is serialized by protocol. During cycles only the audio
// thread dereferences the cell; structural access from the main thread
// happens with the audio thread parked by the pause handshake. Atomic
// fields (enabled, gain) are safe from any thread through &self methods
// that never touch the rest of the host.
unsafe impl Send for PluginCell {}
unsafe impl Sync for PluginCell {}

pub type SharedPluginHost = Arc<PluginCell>;

impl PluginCell {
    pub fn new(host: PluginHost) -> SharedPluginHost {
        Arc::new(Self(UnsafeCell::new(host)))
    }

    /// Exclusive access to the host.
    ///
    /// # Safety
    /// Callers must hold cycle-exclusivity: either be the audio thread
    /// inside a cycle, or the main thread with the pause handshake held
    /// (or before the cell was ever shared with a graph).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn host_mut(&self) -> &mut PluginHost {
        &mut *self.0.get()
    }

    /// Read-only view under the same exclusivity rules.
    ///
    /// # Safety
    /// See [`PluginCell::host_mut`].
    pub unsafe fn host(&self) -> &PluginHost {
        &*self.0.get()
    }

    /// Atomic controls, safe from any thread.
    pub fn set_enabled(&self, enabled: bool) {
        // SAFETY: only the atomic field is touched.
        unsafe { &*self.0.get() }.set_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        unsafe { &*self.0.get() }.is_enabled()
    }

    pub fn set_gain(&self, gain: f32) {
        unsafe { &*self.0.get() }.set_gain(gain);
    }

    pub fn gain(&self) -> f32 {
        unsafe { &*self.0.get() }.gain()
    }

    pub fn id(&self) -> PluginId {
        unsafe { &*self.0.get() }.id
    }

    pub fn owner(&self) -> OwnerHandle {
        unsafe { &*self.0.get() }.owner
    }
}
