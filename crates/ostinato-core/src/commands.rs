//! UI-to-audio command queue.
//!
//! Fine-grained parameter changes cross to the audio thread through this
//! queue and are applied at the top of the next cycle. Structural changes
//! never travel here; they go through the pause handshake and a graph
//! rebuild.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::ids::PortId;
use crate::tempo_map::TempoMapSnapshot;

/// Commands the audio thread applies at defined suspension points.
#[derive(Clone, Debug)]
pub enum EngineCommand {
    SetControl {
        port: PortId,
        value: f32,
        normalized: bool,
    },
    SetConnectionGain {
        src: PortId,
        dst: PortId,
        multiplier: f32,
    },
    Play,
    Pause,
    TogglePlay,
    /// Seek to an absolute frame.
    SetPosition(u64),
    SetLoop {
        start: u64,
        end: u64,
        enabled: bool,
    },
    /// Swap in a prebuilt tempo-map snapshot. Built off the audio thread so
    /// applying it is a single atomic store.
    ApplyTempoMap {
        snapshot: Arc<TempoMapSnapshot>,
        bpm: f32,
    },
    ApplyTimeSignature {
        snapshot: Arc<TempoMapSnapshot>,
        numerator: u32,
        denominator: u32,
    },
}

/// Create the command queue.
pub fn command_queue() -> (CommandSender, Receiver<EngineCommand>) {
    let (tx, rx) = unbounded();
    (CommandSender { tx }, rx)
}

/// Cloneable sender for the UI side. Sends may allocate; only the audio
/// side's `try_recv` is on the hot path.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<EngineCommand>,
}

impl CommandSender {
    pub fn send(&self, command: EngineCommand) {
        let _ = self.tx.send(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{OwnerHandle, PortId};

    #[test]
    fn test_commands_arrive_in_order() {
        let (tx, rx) = command_queue();
        tx.send(EngineCommand::Play);
        tx.send(EngineCommand::SetControl {
            port: PortId::new(OwnerHandle(1), 2),
            value: 0.5,
            normalized: false,
        });

        assert!(matches!(rx.try_recv().unwrap(), EngineCommand::Play));
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineCommand::SetControl { value, .. } if value == 0.5
        ));
        assert!(rx.try_recv().is_err());
    }
}
