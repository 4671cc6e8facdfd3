//! Typed ports and per-cycle buffers.
//!
//! The model side keeps [`PortSpec`] descriptors in a [`PortRegistry`];
//! the graph builder resolves specs into concrete [`AudioBuffer`] /
//! [`EventBuffer`] / [`ControlState`] storage on graph nodes, so the hot
//! path works with indices only.

use std::collections::HashMap;

use ostinato_midi::MidiEvent;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::{OwnerHandle, PortId};

/// Written instead of a clean zero when a gain is effectively silent, so
/// downstream plugins do not stall on denormals.
pub const DENORMAL_GUARD: f32 = 1e-20;

/// Gains below this are treated as silent.
pub const SILENT_GAIN: f32 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortKind {
    Audio,
    Cv,
    Control,
    MidiEvents,
}

impl PortKind {
    /// Whether a `src -> dst` edge between these kinds is allowed.
    /// CV may modulate control inputs.
    pub fn connects_to(self, dst: PortKind) -> bool {
        matches!(
            (self, dst),
            (PortKind::Audio, PortKind::Audio)
                | (PortKind::Cv, PortKind::Cv)
                | (PortKind::Control, PortKind::Control)
                | (PortKind::Cv, PortKind::Control)
                | (PortKind::MidiEvents, PortKind::MidiEvents)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

/// Port role flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFlags {
    pub generic_plugin_port: bool,
    pub stereo_left: bool,
    pub stereo_right: bool,
    pub plugin_enabled: bool,
    pub plugin_gain: bool,
    pub toggle: bool,
    pub trigger: bool,
    pub transport_roll: bool,
    pub transport_stop: bool,
    pub bpm: bool,
    pub time_sig_num: bool,
    pub time_sig_den: bool,
}

/// Value range and default for control ports.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlRange {
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl ControlRange {
    pub const UNIT: ControlRange = ControlRange {
        min: 0.0,
        max: 1.0,
        default: 0.0,
    };

    pub const fn new(min: f32, max: f32, default: f32) -> Self {
        Self { min, max, default }
    }

    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }

    #[inline]
    pub fn denormalize(&self, normalized: f32) -> f32 {
        self.min + (self.max - self.min) * normalized.clamp(0.0, 1.0)
    }

    #[inline]
    pub fn normalize(&self, value: f32) -> f32 {
        if (self.max - self.min).abs() < f32::EPSILON {
            0.0
        } else {
            ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
        }
    }
}

impl Default for ControlRange {
    fn default() -> Self {
        Self::UNIT
    }
}

/// Model-side port descriptor. Created with its owner, destroyed with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub id: PortId,
    pub name: String,
    pub kind: PortKind,
    pub direction: PortDirection,
    pub flags: PortFlags,
    pub range: ControlRange,
    /// Sibling grouping for stereo pairing.
    pub port_group: Option<String>,
}

impl PortSpec {
    pub fn audio_out(id: PortId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: PortKind::Audio,
            direction: PortDirection::Output,
            flags: PortFlags::default(),
            range: ControlRange::UNIT,
            port_group: None,
        }
    }

    pub fn audio_in(id: PortId, name: impl Into<String>) -> Self {
        Self {
            direction: PortDirection::Input,
            ..Self::audio_out(id, name)
        }
    }

    pub fn control_in(id: PortId, name: impl Into<String>, range: ControlRange) -> Self {
        Self {
            id,
            name: name.into(),
            kind: PortKind::Control,
            direction: PortDirection::Input,
            flags: PortFlags::default(),
            range,
            port_group: None,
        }
    }

    pub fn events_out(id: PortId, name: impl Into<String>) -> Self {
        Self {
            kind: PortKind::MidiEvents,
            ..Self::audio_out(id, name)
        }
    }

    pub fn events_in(id: PortId, name: impl Into<String>) -> Self {
        Self {
            kind: PortKind::MidiEvents,
            direction: PortDirection::Input,
            ..Self::audio_out(id, name)
        }
    }

    pub fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.port_group = Some(group.into());
        self
    }
}

/// Registry of all live port descriptors, keyed by identity.
#[derive(Default, Debug, Clone)]
pub struct PortRegistry {
    specs: HashMap<u64, PortSpec>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: PortSpec) {
        self.specs.insert(spec.id.key(), spec);
    }

    pub fn get(&self, id: PortId) -> Option<&PortSpec> {
        self.specs.get(&id.key())
    }

    pub fn require(&self, id: PortId) -> Result<&PortSpec> {
        self.get(id).ok_or(Error::UnknownPort(id))
    }

    /// Drop every port belonging to `owner` (the owner is going away).
    pub fn remove_owner(&mut self, owner: OwnerHandle) {
        self.specs.retain(|_, spec| spec.id.owner != owner);
    }

    pub fn ports_of(&self, owner: OwnerHandle) -> Vec<&PortSpec> {
        let mut ports: Vec<&PortSpec> = self
            .specs
            .values()
            .filter(|s| s.id.owner == owner)
            .collect();
        ports.sort_by_key(|s| s.id.index);
        ports
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// One cycle's worth of audio or CV samples.
#[derive(Clone, Debug)]
pub struct AudioBuffer {
    samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(max_block: usize) -> Self {
        Self {
            samples: vec![0.0; max_block],
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.samples.fill(0.0);
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    #[inline]
    pub fn read_slice(&self, offset: usize, n: usize) -> &[f32] {
        &self.samples[offset..offset + n]
    }

    pub fn write_slice(&mut self, offset: usize, src: &[f32]) {
        self.samples[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Accumulate `src * gain`, writing the denormal guard when the gain is
    /// effectively zero.
    pub fn add_slice(&mut self, offset: usize, src: &[f32], gain: f32) {
        let dst = &mut self.samples[offset..offset + src.len()];
        if gain.abs() < SILENT_GAIN {
            for d in dst.iter_mut() {
                *d += DENORMAL_GUARD;
            }
        } else {
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s * gain;
            }
        }
    }
}

/// One cycle's worth of MIDI events. Capacity is reserved up front; a push
/// past capacity on the audio thread drops the event rather than allocate.
#[derive(Clone, Debug)]
pub struct EventBuffer {
    events: Vec<MidiEvent>,
}

impl EventBuffer {
    pub const DEFAULT_CAPACITY: usize = 512;

    pub fn new() -> Self {
        Self {
            events: Vec::with_capacity(Self::DEFAULT_CAPACITY),
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.events.clear();
    }

    #[inline]
    pub fn push(&mut self, event: MidiEvent) {
        if self.events.len() < self.events.capacity() {
            self.events.push(event);
        }
    }

    pub fn extend_from(&mut self, events: &[MidiEvent]) {
        let room = self.events.capacity() - self.events.len();
        self.events.extend_from_slice(&events[..events.len().min(room)]);
    }

    #[inline]
    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut Vec<MidiEvent> {
        &mut self.events
    }

    /// Restore `(frame_offset, sequence)` order after merging sources.
    pub fn sort(&mut self) {
        self.events.sort_unstable_by_key(MidiEvent::sort_key);
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime state of a control port.
#[derive(Clone, Debug)]
pub struct ControlState {
    /// Raw incoming value, before quantisation.
    pub unsnapped_value: f32,
    /// Effective value after toggle quantisation.
    pub value: f32,
    pub range: ControlRange,
    pub toggle: bool,
    pub trigger: bool,
}

impl ControlState {
    pub fn new(range: ControlRange, flags: PortFlags) -> Self {
        Self {
            unsnapped_value: range.default,
            value: range.default,
            range,
            toggle: flags.toggle,
            trigger: flags.trigger,
        }
    }

    pub fn from_value(value: f32, range: ControlRange) -> Self {
        let mut state = Self::new(range, PortFlags::default());
        state.set(value, false);
        state
    }

    /// Set the control. `normalized` maps through the port range first.
    pub fn set(&mut self, value: f32, normalized: bool) {
        let raw = if normalized {
            self.range.denormalize(value)
        } else {
            value
        };
        self.unsnapped_value = raw;
        self.value = if self.toggle {
            if raw >= 0.5 * (self.range.min + self.range.max) {
                self.range.max
            } else {
                self.range.min
            }
        } else {
            self.range.clamp(raw)
        };
    }

    /// Trigger ports auto-reset at the end of a cycle.
    #[inline]
    pub fn end_of_cycle(&mut self) {
        if self.trigger {
            self.value = self.range.min;
            self.unsnapped_value = self.range.min;
        }
    }

    #[inline]
    pub fn is_on(&self) -> bool {
        self.value >= 0.5 * (self.range.min + self.range.max)
    }
}
