//! Error types for ostinato-clips.

use thiserror::Error;

use crate::pool::ClipId;

/// Errors from clip-pool operations (main thread only).
#[derive(Error, Debug)]
pub enum ClipError {
    #[error("Unknown clip {0:?}")]
    UnknownClip(ClipId),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Decode failed: {0}")]
    Decode(#[from] hound::Error),

    #[error("Empty clip rejected")]
    EmptyClip,
}

/// Errors from region rendering. These are never propagated upward on the
/// audio thread; the renderer substitutes silence and the caller reports
/// the error on the change bus.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderError {
    #[error("Buffer index out of range: clip frame {index} beyond length {length}")]
    BufferIndexOutOfRange { index: u64, length: u64 },

    #[error("Cycle window not split at loop boundary")]
    LoopWrapInWindow,
}

/// Result type alias.
pub type Result<T, E = ClipError> = core::result::Result<T, E>;
