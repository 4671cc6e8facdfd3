//! Error types for ostinato-midi.

use thiserror::Error;

/// Errors from binding-table operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    #[error("Binding table full ({0} entries max)")]
    TableFull(usize),

    #[error("Duplicate binding for key {0:02X?}")]
    Duplicate([u8; 3]),

    #[error("No binding at index {0}")]
    NoSuchBinding(usize),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, BindingError>;
