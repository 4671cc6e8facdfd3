//! Stable integer identifiers.
//!
//! All cross-references between tracks, plugins, ports and regions are ids;
//! the graph builder resolves them to indices so the hot path never does a
//! keyed lookup.

use serde::{Deserialize, Serialize};

/// Handle of a port owner (the engine itself, a track, a plugin instance).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerHandle(pub u32);

impl OwnerHandle {
    /// The engine's own ports (transport controls, host endpoints).
    pub const ENGINE: OwnerHandle = OwnerHandle(0);
}

/// Stable port identity: owner handle plus the owner-local port index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId {
    pub owner: OwnerHandle,
    pub index: u16,
}

impl PortId {
    pub const fn new(owner: OwnerHandle, index: u16) -> Self {
        Self { owner, index }
    }

    /// Opaque 64-bit key, used where ids cross crate boundaries (CC
    /// bindings) and as the hash key on the hot path.
    #[inline]
    pub fn key(&self) -> u64 {
        (u64::from(self.owner.0) << 16) | u64::from(self.index)
    }

    #[inline]
    pub fn from_key(key: u64) -> Self {
        Self {
            owner: OwnerHandle((key >> 16) as u32),
            index: (key & 0xFFFF) as u16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_key_roundtrip() {
        let id = PortId::new(OwnerHandle(7), 42);
        assert_eq!(PortId::from_key(id.key()), id);

        let max = PortId::new(OwnerHandle(u32::MAX), u16::MAX);
        assert_eq!(PortId::from_key(max.key()), max);
    }
}
