//! Realtime processing core for the Ostinato engine.
//!
//! # Primary API
//!
//! - [`OstinatoEngine`] / [`OstinatoEngineBuilder`]: main entry point
//! - [`AudioProcessor`]: the handle the host audio callback drives
//! - [`TransportHandle`]: playback control (play/pause/seek/loop/tempo)
//! - [`UndoableAction`] + `perform`/`undo`/`redo`: every model mutation
//! - [`ChangeConsumer`]: coarse change notifications for the UI layer
//!
//! # Threading model
//!
//! One realtime thread runs [`AudioProcessor::process`]; a fixed worker
//! pool fans out graph levels behind a barrier. Everything crossing from
//! the main thread is either a lock-free command, a published snapshot, or
//! a structural edit made under the pause handshake.
//!
//! # Example
//!
//! ```no_run
//! use ostinato_core::prelude::*;
//!
//! # fn main() -> ostinato_core::Result<()> {
//! let (engine, mut processor) = OstinatoEngine::builder()
//!     .sample_rate(48000.0)
//!     .build()?;
//!
//! let track = engine.add_audio_track("Guitar")?;
//! engine.transport().play();
//! # let _ = (track, &mut processor);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{Error, ErrorKind, Result};

mod ids;
pub use ids::{OwnerHandle, PluginId, PortId, TrackId};

pub(crate) mod lockfree;
pub use lockfree::{AtomicDouble, AtomicFlag, AtomicFloat, AtomicFrames};

mod config;
pub use config::OstinatoConfig;

pub mod position;
pub use position::{Position, SnapGrid, SnapPolicy, TICKS_PER_BEAT};

pub mod tempo_map;
pub use tempo_map::{Bbt, TempoMap, TempoMapSnapshot, TempoPoint, TimeSigPoint};

pub mod port;
pub use port::{
    AudioBuffer, ControlRange, ControlState, EventBuffer, PortDirection, PortFlags, PortKind,
    PortRegistry, PortSpec, DENORMAL_GUARD,
};

pub mod connections;
pub use connections::{Connection, ConnectionTable};

mod delay;
pub use delay::DelayLine;

pub mod plugin;
pub use plugin::{
    PluginCell, PluginControlSpec, PluginHost, PluginInstance, PluginIo, PluginLayout,
    PluginLifecycle, SharedPluginHost, MAX_PROCESS_FAILURES, PLUGIN_GAIN_MAX,
};

pub mod events;
pub use events::{change_bus, ChangeConsumer, ChangeEvent, ChangePublisher};

pub mod commands;
pub use commands::{CommandSender, EngineCommand};

pub mod transport;
pub use transport::{CycleWindow, PlayState, Segment, Transport, TransportHandle};

pub mod model;
pub use model::{EnginePorts, PluginPorts, ProjectModel, Track, TrackKind, TrackSend};

pub mod graph;
pub use graph::{
    build_graph, ControlRoute, CycleCtx, GraphNode, NodeKind, ProcessGraph, SampleProcessorUnit,
    SharedSampleProcessor,
};

mod workers;
pub use workers::WorkerPool;

pub mod scheduler;
pub use scheduler::{AudioProcessor, HostIo, PauseHandshake, PAUSE_TIMEOUT};

mod metering;
pub use metering::CycleMeter;

pub mod actions;
pub use actions::{ActionPipeline, RegionSpan, UndoableAction};

mod engine;
pub use engine::{
    OstinatoEngine, OstinatoEngineBuilder, PluginSnapshot, ProjectSnapshot, TrackPorts,
    TrackSnapshot, TransportSnapshot,
};

/// Convenience imports for engine users.
pub mod prelude {
    pub use crate::engine::{OstinatoEngine, OstinatoEngineBuilder, ProjectSnapshot};
    pub use crate::error::{Error, Result};
    pub use crate::ids::{PluginId, PortId, TrackId};
    pub use crate::scheduler::{AudioProcessor, HostIo};
    pub use crate::transport::{PlayState, TransportHandle};
    pub use crate::OstinatoConfig;
}
