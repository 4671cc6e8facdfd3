//! The change-event bus: realtime-safe notifications to the UI.
//!
//! Producers (audio thread, action pipeline) `try_send` and count drops;
//! one consumer drains on its own schedule. Events are coarse: "something
//! of this kind changed, re-query". Payloads are ids that the consumer
//! must re-validate before use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::ErrorKind;
use crate::ids::{PluginId, TrackId};
use crate::transport::PlayState;

/// Coarse-grained change notifications.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChangeEvent {
    TrackAdded(TrackId),
    TrackRemoved(TrackId),
    /// A region or other arranger object on this track changed.
    ArrangerObjectChanged(TrackId),
    PluginLatencyChanged(PluginId),
    PluginFailed(PluginId),
    TransportBpmChanged(f32),
    TransportTimeSignatureChanged(u32, u32),
    TransportStateChanged(PlayState),
    TransportPositionJumped,
    GraphRebuilt,
    MidiRingOverflow { dropped: u64 },
    EngineError(ErrorKind),
}

/// Create a change bus with the given capacity.
pub fn change_bus(capacity: usize) -> (ChangePublisher, ChangeConsumer) {
    let (tx, rx) = bounded(capacity.max(16));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        ChangePublisher {
            tx,
            dropped: Arc::clone(&dropped),
        },
        ChangeConsumer { rx, dropped },
    )
}

/// Producer handle. Cloneable; `publish` never blocks.
#[derive(Clone)]
pub struct ChangePublisher {
    tx: Sender<ChangeEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChangePublisher {
    /// Queue an event. On a full bus the event is dropped and counted;
    /// consumers treat the bus as lossy by contract.
    pub fn publish(&self, event: ChangeEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Single consumer, drained on a low-frequency timer by the UI layer.
pub struct ChangeConsumer {
    rx: Receiver<ChangeEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChangeConsumer {
    /// Drain everything queued, collapsing consecutive identical events.
    pub fn drain(&self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            if events.last() != Some(&event) {
                events.push(event);
            }
        }
        events
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_drain() {
        let (tx, rx) = change_bus(32);
        tx.publish(ChangeEvent::TrackAdded(TrackId(1)));
        tx.publish(ChangeEvent::GraphRebuilt);
        assert_eq!(
            rx.drain(),
            vec![
                ChangeEvent::TrackAdded(TrackId(1)),
                ChangeEvent::GraphRebuilt
            ]
        );
        assert!(rx.is_empty());
    }

    #[test]
    fn test_consecutive_duplicates_coalesced() {
        let (tx, rx) = change_bus(32);
        for _ in 0..5 {
            tx.publish(ChangeEvent::ArrangerObjectChanged(TrackId(3)));
        }
        tx.publish(ChangeEvent::GraphRebuilt);
        tx.publish(ChangeEvent::ArrangerObjectChanged(TrackId(3)));

        let drained = rx.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], ChangeEvent::ArrangerObjectChanged(TrackId(3)));
        assert_eq!(drained[1], ChangeEvent::GraphRebuilt);
        assert_eq!(drained[2], ChangeEvent::ArrangerObjectChanged(TrackId(3)));
    }

    #[test]
    fn test_full_bus_counts_drops() {
        let (tx, rx) = change_bus(16);
        for _ in 0..20 {
            tx.publish(ChangeEvent::GraphRebuilt);
        }
        assert_eq!(tx.dropped(), 4);
        assert_eq!(rx.dropped(), 4);
        // The queued 16 coalesce into one.
        assert_eq!(rx.drain().len(), 1);
    }
}
