//! # Ostinato - Realtime DAW Processing Core
//!
//! The audio/MIDI engine behind a digital audio workstation: a levelled
//! processing graph driven by the host audio callback, with a typed
//! port/connection model, sample-accurate region playback, lock-free MIDI
//! plumbing, an undoable action pipeline and a change-event bus.
//!
//! ## Architecture
//!
//! Ostinato is an umbrella crate coordinating:
//! - **ostinato-core** - graph scheduler, ports/connections, transport,
//!   plugin hosting, actions, change bus
//! - **ostinato-midi** - raw MIDI events, the lock-free event ring, CC
//!   bindings
//! - **ostinato-clips** - the audio clip pool, regions, fades and
//!   real-time time-stretch
//!
//! ## Quick start
//!
//! ```no_run
//! use ostinato::prelude::*;
//!
//! # fn main() -> ostinato::Result<()> {
//! let (engine, mut processor) = OstinatoEngine::builder()
//!     .sample_rate(48000.0)
//!     .build()?;
//!
//! // Arrange: one audio track playing a pool clip.
//! let clip = engine.clip_pool().insert("tone", 48000, 1, vec![0.0; 48000])?;
//! let track = engine.add_audio_track("Audio 1")?;
//! engine.add_audio_region(track, AudioRegion::new(clip, 0, 48000))?;
//! engine.transport().play();
//!
//! // The host driver calls processor.process(&mut io, n_frames) from its
//! // realtime callback; everything above stays on the main thread.
//! # let _ = processor;
//! # Ok(())
//! # }
//! ```
//!
//! The engine owns the model; the processor owns the running graph. The
//! two meet only through lock-free queues and the pause handshake.

pub use ostinato_clips::{
    AudioClip, AudioRegion, ClipId, ClipPool, FadeCurve, MidiNote, MidiRegion, RegionPlayer,
    StereoStretcher,
};
pub use ostinato_core::prelude::*;
pub use ostinato_core::{
    actions::UndoableAction, build_graph, change_bus, AudioProcessor, ChangeConsumer, ChangeEvent,
    Connection, ConnectionTable, ControlRange, CycleMeter, EnginePorts, ErrorKind, HostIo,
    OstinatoConfig, OwnerHandle, PluginHost, PluginInstance, PluginIo, PluginLayout,
    PluginLifecycle, PluginPorts, Position, ProcessGraph, ProjectSnapshot, SnapGrid, SnapPolicy,
    TempoMap, Track, TrackKind, Transport,
};
pub use ostinato_midi::{Binding, BindingTable, BindingTarget, MidiEvent, MidiRing, TransportAction};

/// Convenience imports for applications embedding the engine.
pub mod prelude {
    pub use ostinato_clips::{AudioRegion, ClipId, FadeCurve, MidiNote, MidiRegion};
    pub use ostinato_core::prelude::*;
    pub use ostinato_midi::MidiEvent;
}
