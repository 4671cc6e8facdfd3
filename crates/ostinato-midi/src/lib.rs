//! MIDI plumbing for the Ostinato engine.
//!
//! - [`MidiEvent`]: raw 3-byte event with sample-accurate cycle offset
//! - [`MidiRing`]: lock-free SPSC event ring with drop-oldest overflow
//! - [`BindingTable`]: CC-to-destination bindings with an RT-safe snapshot

pub mod error;
pub use error::{BindingError, Result};

mod event;
pub use event::{MidiEvent, status};

mod ring;
pub use ring::{MidiRing, MidiRingConsumer, MidiRingProducer, DEFAULT_RING_CAPACITY};

mod binding;
pub use binding::{
    Binding, BindingFire, BindingSnapshot, BindingTable, BindingTarget, TransportAction,
    MAX_BINDINGS,
};
