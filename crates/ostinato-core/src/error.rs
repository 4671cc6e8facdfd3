//! Error types for ostinato-core.

use thiserror::Error;

use crate::ids::{PortId, TrackId};

/// Error type for core operations. Main-thread entry points return these;
/// the audio thread never propagates errors upward.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Bad connection: {0}")]
    BadConnection(String),

    #[error("Plugin instantiation failed: {0}")]
    PluginInstantiationFailed(String),

    #[error("Plugin process failed: {0}")]
    PluginProcessFailed(String),

    #[error("Buffer index out of range: index {index}, length {length}")]
    BufferIndexOutOfRange { index: u64, length: u64 },

    #[error("Tempo map inconsistent: {0}")]
    TempoMapInconsistent(String),

    #[error("Pause handshake timed out")]
    PauseHandshakeTimeout,

    #[error("Undo stack underflow")]
    UndoStackUnderflow,

    #[error("Rebuild requested while rebuilding")]
    RebuildRequestedWhileRebuilding,

    #[error("Unknown track {0:?}")]
    UnknownTrack(TrackId),

    #[error("Unknown port {0:?}")]
    UnknownPort(PortId),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error(transparent)]
    Clip(#[from] ostinato_clips::ClipError),

    #[error(transparent)]
    Binding(#[from] ostinato_midi::BindingError),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Coarse error kinds reported on the change bus by the audio thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    BadConnection,
    PluginInstantiationFailed,
    PluginProcessFailed,
    BufferIndexOutOfRange,
    MidiRingOverflow,
    TempoMapInconsistent,
    PauseHandshakeTimeout,
    UndoStackUnderflow,
    RebuildRequestedWhileRebuilding,
}
