//! The arrangement model: tracks, chains, regions, and the port/connection
//! bookkeeping around them.
//!
//! The model lives on the main thread behind the engine's mutex. The graph
//! builder reads it to produce the immutable process graph.

use std::sync::Arc;

use ostinato_clips::{AudioRegion, ClipPool, MidiRegion};
use ostinato_midi::BindingTable;
use serde::{Deserialize, Serialize};

use crate::config::OstinatoConfig;
use crate::connections::{Connection, ConnectionTable};
use crate::error::{Error, Result};
use crate::ids::{OwnerHandle, PluginId, PortId, TrackId};
use crate::plugin::{PluginCell, PluginHost, PluginInstance, SharedPluginHost};
use crate::port::{ControlRange, PortFlags, PortRegistry, PortSpec};

/// Track kinds. Master is the terminal mix bus; exactly one exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Midi,
    Master,
}

/// A send from a track to another track's input.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackSend {
    pub target: TrackId,
    pub amount: f32,
    pub pre_fader: bool,
}

/// One mixer strip: region producer, plugin chain, fader, sends.
#[derive(Clone)]
pub struct Track {
    pub id: TrackId,
    pub owner: OwnerHandle,
    pub name: String,
    pub kind: TrackKind,
    pub audio_regions: Vec<AudioRegion>,
    pub midi_regions: Vec<MidiRegion>,
    pub chain: Vec<SharedPluginHost>,
    pub fader_gain: f32,
    pub muted: bool,
    pub sends: Vec<TrackSend>,
}

impl Track {
    // Owner-local port indices.
    pub const PORT_OUT_L: u16 = 0;
    pub const PORT_OUT_R: u16 = 1;
    pub const PORT_FADER_GAIN: u16 = 2;
    pub const PORT_MIDI_IN: u16 = 3;
    pub const PORT_MIDI_OUT: u16 = 4;
    pub const PORT_IN_L: u16 = 5;
    pub const PORT_IN_R: u16 = 6;
    /// Send amount controls start here, one per send slot.
    pub const PORT_SEND_BASE: u16 = 16;

    pub fn out_l(&self) -> PortId {
        PortId::new(self.owner, Self::PORT_OUT_L)
    }

    pub fn out_r(&self) -> PortId {
        PortId::new(self.owner, Self::PORT_OUT_R)
    }

    pub fn fader_gain_port(&self) -> PortId {
        PortId::new(self.owner, Self::PORT_FADER_GAIN)
    }

    pub fn midi_in(&self) -> PortId {
        PortId::new(self.owner, Self::PORT_MIDI_IN)
    }

    pub fn midi_out(&self) -> PortId {
        PortId::new(self.owner, Self::PORT_MIDI_OUT)
    }

    pub fn in_l(&self) -> PortId {
        PortId::new(self.owner, Self::PORT_IN_L)
    }

    pub fn in_r(&self) -> PortId {
        PortId::new(self.owner, Self::PORT_IN_R)
    }

    pub fn send_amount_port(&self, slot: usize) -> PortId {
        PortId::new(self.owner, Self::PORT_SEND_BASE + slot as u16)
    }
}

/// Engine-owned port indices (owner handle 0).
pub struct EnginePorts;

impl EnginePorts {
    pub const BPM: u16 = 0;
    pub const TIME_SIG_NUM: u16 = 1;
    pub const TIME_SIG_DEN: u16 = 2;
    pub const TRANSPORT_ROLL: u16 = 3;
    pub const TRANSPORT_STOP: u16 = 4;
    pub const HOST_IN_L: u16 = 5;
    pub const HOST_IN_R: u16 = 6;
    pub const MASTER_OUT_L: u16 = 7;
    pub const MASTER_OUT_R: u16 = 8;
    pub const MIDI_IN: u16 = 9;
    pub const MIDI_OUT: u16 = 10;

    pub fn bpm() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::BPM)
    }

    pub fn time_sig_num() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::TIME_SIG_NUM)
    }

    pub fn time_sig_den() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::TIME_SIG_DEN)
    }

    pub fn transport_roll() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::TRANSPORT_ROLL)
    }

    pub fn transport_stop() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::TRANSPORT_STOP)
    }

    pub fn host_in_l() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::HOST_IN_L)
    }

    pub fn host_in_r() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::HOST_IN_R)
    }

    pub fn master_out_l() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::MASTER_OUT_L)
    }

    pub fn master_out_r() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::MASTER_OUT_R)
    }

    pub fn midi_in() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::MIDI_IN)
    }

    pub fn midi_out() -> PortId {
        PortId::new(OwnerHandle::ENGINE, Self::MIDI_OUT)
    }
}

/// Plugin owner-local port indices: the adapter's two mandatory controls,
/// then the plugin's own controls, then audio and event ports.
pub struct PluginPorts;

impl PluginPorts {
    pub const ENABLED: u16 = 0;
    pub const GAIN: u16 = 1;
    pub const CONTROL_BASE: u16 = 2;

    pub fn enabled(owner: OwnerHandle) -> PortId {
        PortId::new(owner, Self::ENABLED)
    }

    pub fn gain(owner: OwnerHandle) -> PortId {
        PortId::new(owner, Self::GAIN)
    }

    pub fn control(owner: OwnerHandle, index: usize) -> PortId {
        PortId::new(owner, Self::CONTROL_BASE + index as u16)
    }
}

/// The whole mutable project state.
pub struct ProjectModel {
    pub tracks: Vec<Track>,
    pub master: TrackId,
    pub connections: ConnectionTable,
    pub ports: PortRegistry,
    pub bindings: BindingTable,
    pub pool: Arc<ClipPool>,
    /// Auxiliary DSP on the monitor path (auditioner, click).
    pub monitor_processor: Option<crate::graph::SharedSampleProcessor>,
    pub sample_rate: f64,
    pub max_block: usize,
    next_track: u32,
    next_plugin: u32,
    next_owner: u32,
}

impl ProjectModel {
    pub fn new(config: &OstinatoConfig) -> Self {
        let mut model = Self {
            tracks: Vec::new(),
            master: TrackId(0),
            connections: ConnectionTable::new(),
            ports: PortRegistry::new(),
            bindings: BindingTable::new(),
            pool: Arc::new(ClipPool::new()),
            monitor_processor: None,
            sample_rate: config.sample_rate,
            max_block: config.max_block,
            next_track: 0,
            next_plugin: 0,
            next_owner: 1,
        };
        model.register_engine_ports();

        let master = model.create_track("Master", TrackKind::Master);
        model.master = master.id;
        model.insert_track(master, usize::MAX);
        model
    }

    fn register_engine_ports(&mut self) {
        let bpm_flags = PortFlags {
            bpm: true,
            ..Default::default()
        };
        self.ports.register(
            PortSpec::control_in(EnginePorts::bpm(), "bpm", ControlRange::new(20.0, 999.0, 120.0))
                .with_flags(bpm_flags),
        );
        self.ports.register(
            PortSpec::control_in(
                EnginePorts::time_sig_num(),
                "time_sig_num",
                ControlRange::new(1.0, 32.0, 4.0),
            )
            .with_flags(PortFlags {
                time_sig_num: true,
                ..Default::default()
            }),
        );
        self.ports.register(
            PortSpec::control_in(
                EnginePorts::time_sig_den(),
                "time_sig_den",
                ControlRange::new(1.0, 32.0, 4.0),
            )
            .with_flags(PortFlags {
                time_sig_den: true,
                ..Default::default()
            }),
        );
        self.ports.register(
            PortSpec::control_in(
                EnginePorts::transport_roll(),
                "transport_roll",
                ControlRange::UNIT,
            )
            .with_flags(PortFlags {
                trigger: true,
                transport_roll: true,
                ..Default::default()
            }),
        );
        self.ports.register(
            PortSpec::control_in(
                EnginePorts::transport_stop(),
                "transport_stop",
                ControlRange::UNIT,
            )
            .with_flags(PortFlags {
                trigger: true,
                transport_stop: true,
                ..Default::default()
            }),
        );
        self.ports.register(
            PortSpec::audio_out(EnginePorts::host_in_l(), "host_in_l")
                .with_flags(PortFlags {
                    stereo_left: true,
                    ..Default::default()
                })
                .with_group("host_in"),
        );
        self.ports.register(
            PortSpec::audio_out(EnginePorts::host_in_r(), "host_in_r")
                .with_flags(PortFlags {
                    stereo_right: true,
                    ..Default::default()
                })
                .with_group("host_in"),
        );
        self.ports.register(
            PortSpec::audio_in(EnginePorts::master_out_l(), "master_out_l")
                .with_flags(PortFlags {
                    stereo_left: true,
                    ..Default::default()
                })
                .with_group("master_out"),
        );
        self.ports.register(
            PortSpec::audio_in(EnginePorts::master_out_r(), "master_out_r")
                .with_flags(PortFlags {
                    stereo_right: true,
                    ..Default::default()
                })
                .with_group("master_out"),
        );
        self.ports
            .register(PortSpec::events_out(EnginePorts::midi_in(), "midi_in"));
        self.ports
            .register(PortSpec::events_in(EnginePorts::midi_out(), "midi_out"));
    }

    pub fn allocate_owner(&mut self) -> OwnerHandle {
        let handle = OwnerHandle(self.next_owner);
        self.next_owner += 1;
        handle
    }

    /// Build a track value with fresh ids. The track is not live until
    /// [`ProjectModel::insert_track`] runs (the action pipeline separates
    /// the two for undo).
    pub fn create_track(&mut self, name: impl Into<String>, kind: TrackKind) -> Track {
        let id = TrackId(self.next_track);
        self.next_track += 1;
        let owner = self.allocate_owner();
        Track {
            id,
            owner,
            name: name.into(),
            kind,
            audio_regions: Vec::new(),
            midi_regions: Vec::new(),
            chain: Vec::new(),
            fader_gain: 1.0,
            muted: false,
            sends: Vec::new(),
        }
    }

    /// Register the track's ports and splice it into the tracklist.
    pub fn insert_track(&mut self, track: Track, index: usize) {
        self.register_track_ports(&track);
        let index = index.min(self.tracks.len());
        self.tracks.insert(index, track);
    }

    fn register_track_ports(&mut self, track: &Track) {
        let stereo_l = PortFlags {
            stereo_left: true,
            ..Default::default()
        };
        let stereo_r = PortFlags {
            stereo_right: true,
            ..Default::default()
        };
        let group = format!("track{}", track.id.0);
        self.ports.register(
            PortSpec::audio_out(track.out_l(), format!("{} out L", track.name))
                .with_flags(stereo_l)
                .with_group(group.clone()),
        );
        self.ports.register(
            PortSpec::audio_out(track.out_r(), format!("{} out R", track.name))
                .with_flags(stereo_r)
                .with_group(group.clone()),
        );
        self.ports.register(PortSpec::control_in(
            track.fader_gain_port(),
            format!("{} fader", track.name),
            ControlRange::new(0.0, 2.0, 1.0),
        ));
        if track.kind != TrackKind::Master {
            self.ports.register(
                PortSpec::audio_in(track.in_l(), format!("{} in L", track.name))
                    .with_flags(stereo_l)
                    .with_group(group.clone()),
            );
            self.ports.register(
                PortSpec::audio_in(track.in_r(), format!("{} in R", track.name))
                    .with_flags(stereo_r)
                    .with_group(group),
            );
            self.ports.register(PortSpec::events_in(
                track.midi_in(),
                format!("{} midi in", track.name),
            ));
            self.ports.register(PortSpec::events_out(
                track.midi_out(),
                format!("{} midi out", track.name),
            ));
        }
        for (slot, _) in track.sends.iter().enumerate() {
            self.ports.register(PortSpec::control_in(
                track.send_amount_port(slot),
                format!("{} send {}", track.name, slot),
                ControlRange::UNIT,
            ));
        }
        for plugin in &track.chain {
            self.register_plugin_ports(plugin);
        }
    }

    pub(crate) fn register_plugin_ports(&mut self, plugin: &SharedPluginHost) {
        // SAFETY: model mutations run on the main thread with the plugin
        // either unshared or the audio thread parked; only descriptors are
        // read here.
        let host = unsafe { plugin.host() };
        let owner = host.owner();
        let name = host.name().to_owned();
        self.ports.register(
            PortSpec::control_in(
                PluginPorts::enabled(owner),
                format!("{name} enabled"),
                ControlRange::new(0.0, 1.0, 1.0),
            )
            .with_flags(PortFlags {
                toggle: true,
                plugin_enabled: true,
                generic_plugin_port: true,
                ..Default::default()
            }),
        );
        self.ports.register(
            PortSpec::control_in(
                PluginPorts::gain(owner),
                format!("{name} gain"),
                ControlRange::new(0.0, crate::plugin::PLUGIN_GAIN_MAX, 1.0),
            )
            .with_flags(PortFlags {
                plugin_gain: true,
                generic_plugin_port: true,
                ..Default::default()
            }),
        );
        for (i, control) in host.layout().controls.iter().enumerate() {
            self.ports.register(
                PortSpec::control_in(
                    PluginPorts::control(owner, i),
                    format!("{name} {}", control.name),
                    control.range,
                )
                .with_flags(PortFlags {
                    generic_plugin_port: true,
                    ..Default::default()
                }),
            );
        }
    }

    /// Remove a track, dropping its ports and every edge touching them.
    /// Returns everything needed to restore it for undo.
    pub fn remove_track(&mut self, id: TrackId) -> Result<(usize, Track, Vec<Connection>)> {
        if id == self.master {
            return Err(Error::BadConnection("cannot remove the master track".into()));
        }
        let index = self
            .tracks
            .iter()
            .position(|t| t.id == id)
            .ok_or(Error::UnknownTrack(id))?;
        let track = self.tracks.remove(index);

        let mut dropped = self.connections.disconnect_owner(track.owner);
        for plugin in &track.chain {
            dropped.extend(self.connections.disconnect_owner(plugin.owner()));
            self.ports.remove_owner(plugin.owner());
        }
        self.ports.remove_owner(track.owner);
        Ok((index, track, dropped))
    }

    /// Restore a previously removed track (undo).
    pub fn restore_track(&mut self, index: usize, track: Track, edges: Vec<Connection>) {
        self.insert_track(track, index);
        for edge in edges {
            // Edges were valid when captured; the registry has the ports
            // back now.
            let _ = self.connections.connect(edge, &self.ports);
        }
    }

    pub fn track(&self, id: TrackId) -> Result<&Track> {
        self.tracks
            .iter()
            .find(|t| t.id == id)
            .ok_or(Error::UnknownTrack(id))
    }

    pub fn track_mut(&mut self, id: TrackId) -> Result<&mut Track> {
        self.tracks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(Error::UnknownTrack(id))
    }

    /// Instantiate a plugin host for insertion into a chain.
    pub fn create_plugin(
        &mut self,
        name: impl Into<String>,
        instance: Box<dyn PluginInstance>,
    ) -> Result<SharedPluginHost> {
        let id = PluginId(self.next_plugin);
        self.next_plugin += 1;
        let owner = self.allocate_owner();
        let mut host = PluginHost::new(id, owner, name, instance);
        host.activate(self.sample_rate, self.max_block)
            .map_err(|e| Error::PluginInstantiationFailed(e.to_string()))?;
        Ok(PluginCell::new(host))
    }

    /// All plugins across all chains.
    pub fn plugins(&self) -> impl Iterator<Item = &SharedPluginHost> {
        self.tracks.iter().flat_map(|t| t.chain.iter())
    }

    pub fn find_plugin(&self, id: PluginId) -> Option<&SharedPluginHost> {
        self.plugins().find(|p| p.id() == id)
    }
}
