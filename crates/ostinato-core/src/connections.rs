//! The connection table: typed source-to-destination edges.
//!
//! Append-only log with per-endpoint indexes for O(1) fan-in/out lookup.
//! All mutations run on the main thread under the pause handshake; the
//! structural cycle check happens at graph-rebuild time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::PortId;
use crate::port::{PortDirection, PortRegistry};

/// A directed edge between two ports.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub src: PortId,
    pub dst: PortId,
    pub enabled: bool,
    /// Locked edges refuse user removal (implicit engine wiring).
    pub locked: bool,
    /// Constant gain, audio/CV edges only. Range `[0, 1]`.
    pub multiplier: f32,
}

impl Connection {
    pub fn new(src: PortId, dst: PortId) -> Self {
        Self {
            src,
            dst,
            enabled: true,
            locked: false,
            multiplier: 1.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f32) -> Self {
        self.multiplier = multiplier.clamp(0.0, 1.0);
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }
}

/// Ordered set of connections with endpoint indexes.
#[derive(Default, Debug, Clone)]
pub struct ConnectionTable {
    log: Vec<Connection>,
    by_src: HashMap<u64, Vec<usize>>,
    by_dst: HashMap<u64, Vec<usize>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.log.iter()
    }

    pub fn get(&self, src: PortId, dst: PortId) -> Option<&Connection> {
        self.index_of(src, dst).map(|i| &self.log[i])
    }

    fn index_of(&self, src: PortId, dst: PortId) -> Option<usize> {
        self.by_src
            .get(&src.key())?
            .iter()
            .copied()
            .find(|&i| self.log[i].dst == dst)
    }

    /// Validate and append an edge.
    pub fn connect(&mut self, connection: Connection, registry: &PortRegistry) -> Result<()> {
        let src = registry.require(connection.src)?;
        let dst = registry.require(connection.dst)?;

        if src.direction != PortDirection::Output {
            return Err(Error::BadConnection(format!(
                "source port '{}' is not an output",
                src.name
            )));
        }
        if dst.direction != PortDirection::Input {
            return Err(Error::BadConnection(format!(
                "destination port '{}' is not an input",
                dst.name
            )));
        }
        if !src.kind.connects_to(dst.kind) {
            return Err(Error::BadConnection(format!(
                "kind mismatch: {:?} -> {:?}",
                src.kind, dst.kind
            )));
        }
        if self.index_of(connection.src, connection.dst).is_some() {
            return Err(Error::BadConnection(format!(
                "duplicate edge '{}' -> '{}'",
                src.name, dst.name
            )));
        }

        let idx = self.log.len();
        self.by_src
            .entry(connection.src.key())
            .or_default()
            .push(idx);
        self.by_dst
            .entry(connection.dst.key())
            .or_default()
            .push(idx);
        self.log.push(connection);
        Ok(())
    }

    /// Remove an edge. `forced` bypasses the lock (engine-internal
    /// teardown); user actions pass `false`.
    pub fn disconnect(&mut self, src: PortId, dst: PortId, forced: bool) -> Result<Connection> {
        let idx = self
            .index_of(src, dst)
            .ok_or_else(|| Error::BadConnection("no such edge".into()))?;
        if self.log[idx].locked && !forced {
            return Err(Error::BadConnection("edge is locked".into()));
        }
        let removed = self.log.remove(idx);
        self.reindex();
        Ok(removed)
    }

    /// Drop every edge touching a port of `owner` (owner teardown).
    pub fn disconnect_owner(&mut self, owner: crate::ids::OwnerHandle) -> Vec<Connection> {
        let (kept, dropped): (Vec<Connection>, Vec<Connection>) = self
            .log
            .drain(..)
            .partition(|c| c.src.owner != owner && c.dst.owner != owner);
        self.log = kept;
        self.reindex();
        dropped
    }

    pub fn set_multiplier(&mut self, src: PortId, dst: PortId, multiplier: f32) -> Result<f32> {
        let idx = self
            .index_of(src, dst)
            .ok_or_else(|| Error::BadConnection("no such edge".into()))?;
        let before = self.log[idx].multiplier;
        self.log[idx].multiplier = multiplier.clamp(0.0, 1.0);
        Ok(before)
    }

    pub fn set_enabled(&mut self, src: PortId, dst: PortId, enabled: bool) -> Result<bool> {
        let idx = self
            .index_of(src, dst)
            .ok_or_else(|| Error::BadConnection("no such edge".into()))?;
        let before = self.log[idx].enabled;
        self.log[idx].enabled = enabled;
        Ok(before)
    }

    /// Enabled edges arriving at `dst`.
    pub fn fan_in(&self, dst: PortId) -> Vec<&Connection> {
        self.by_dst
            .get(&dst.key())
            .map(|v| {
                v.iter()
                    .map(|&i| &self.log[i])
                    .filter(|c| c.enabled)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Enabled edges leaving `src`.
    pub fn fan_out(&self, src: PortId) -> Vec<&Connection> {
        self.by_src
            .get(&src.key())
            .map(|v| {
                v.iter()
                    .map(|&i| &self.log[i])
                    .filter(|c| c.enabled)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn reindex(&mut self) {
        self.by_src.clear();
        self.by_dst.clear();
        for (i, c) in self.log.iter().enumerate() {
            self.by_src.entry(c.src.key()).or_default().push(i);
            self.by_dst.entry(c.dst.key()).or_default().push(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::OwnerHandle;
    use crate::port::PortSpec;

    fn registry() -> PortRegistry {
        let mut reg = PortRegistry::new();
        let a = OwnerHandle(1);
        let b = OwnerHandle(2);
        reg.register(PortSpec::audio_out(PortId::new(a, 0), "a out"));
        reg.register(PortSpec::audio_in(PortId::new(b, 0), "b in"));
        reg.register(PortSpec::events_out(PortId::new(a, 1), "a midi out"));
        reg.register(PortSpec::events_in(PortId::new(b, 1), "b midi in"));
        reg
    }

    fn audio_edge() -> Connection {
        Connection::new(
            PortId::new(OwnerHandle(1), 0),
            PortId::new(OwnerHandle(2), 0),
        )
    }

    #[test]
    fn test_connect_and_fan_lookup() {
        let reg = registry();
        let mut table = ConnectionTable::new();
        table.connect(audio_edge().with_multiplier(0.5), &reg).unwrap();

        let dst = PortId::new(OwnerHandle(2), 0);
        let fan_in = table.fan_in(dst);
        assert_eq!(fan_in.len(), 1);
        assert_eq!(fan_in[0].multiplier, 0.5);
        assert_eq!(table.fan_out(PortId::new(OwnerHandle(1), 0)).len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let reg = registry();
        let mut table = ConnectionTable::new();
        table.connect(audio_edge(), &reg).unwrap();
        assert!(matches!(
            table.connect(audio_edge(), &reg),
            Err(Error::BadConnection(_))
        ));
    }

    #[test]
    fn test_direction_validated() {
        let reg = registry();
        let mut table = ConnectionTable::new();
        // Input as source.
        let backwards = Connection::new(
            PortId::new(OwnerHandle(2), 0),
            PortId::new(OwnerHandle(1), 0),
        );
        assert!(table.connect(backwards, &reg).is_err());
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let reg = registry();
        let mut table = ConnectionTable::new();
        let mismatched = Connection::new(
            PortId::new(OwnerHandle(1), 0),
            PortId::new(OwnerHandle(2), 1),
        );
        assert!(matches!(
            table.connect(mismatched, &reg),
            Err(Error::BadConnection(_))
        ));
    }

    #[test]
    fn test_locked_edge_refuses_user_removal() {
        let reg = registry();
        let mut table = ConnectionTable::new();
        table.connect(audio_edge().locked(), &reg).unwrap();

        let src = PortId::new(OwnerHandle(1), 0);
        let dst = PortId::new(OwnerHandle(2), 0);
        assert!(table.disconnect(src, dst, false).is_err());
        assert!(table.disconnect(src, dst, true).is_ok());
        assert!(table.is_empty());
    }

    #[test]
    fn test_disabled_edges_hidden_from_fan() {
        let reg = registry();
        let mut table = ConnectionTable::new();
        table.connect(audio_edge(), &reg).unwrap();
        let src = PortId::new(OwnerHandle(1), 0);
        let dst = PortId::new(OwnerHandle(2), 0);
        table.set_enabled(src, dst, false).unwrap();
        assert!(table.fan_in(dst).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_multiplier_clamped() {
        let reg = registry();
        let mut table = ConnectionTable::new();
        table.connect(audio_edge(), &reg).unwrap();
        let src = PortId::new(OwnerHandle(1), 0);
        let dst = PortId::new(OwnerHandle(2), 0);
        let before = table.set_multiplier(src, dst, 3.0).unwrap();
        assert_eq!(before, 1.0);
        assert_eq!(table.get(src, dst).unwrap().multiplier, 1.0);
        table.set_multiplier(src, dst, 0.25).unwrap();
        assert_eq!(table.get(src, dst).unwrap().multiplier, 0.25);
    }

    #[test]
    fn test_disconnect_owner_drops_all_edges() {
        let reg = registry();
        let mut table = ConnectionTable::new();
        table.connect(audio_edge(), &reg).unwrap();
        let dropped = table.disconnect_owner(OwnerHandle(2));
        assert_eq!(dropped.len(), 1);
        assert!(table.is_empty());
    }
}
