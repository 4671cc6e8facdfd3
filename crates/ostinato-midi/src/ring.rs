//! Lock-free SPSC MIDI event ring with drop-oldest overflow.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::event::MidiEvent;

/// Default ring capacity (events). Must be a power of two.
pub const DEFAULT_RING_CAPACITY: usize = 1024;

/// Scratch size for a per-cycle drain; typical cycles carry far fewer events.
const DRAIN_INLINE: usize = 64;

struct RingInner {
    slots: Box<[UnsafeCell<MidiEvent>]>,
    mask: u64,
    /// Next write index (monotonic, masked on access).
    head: AtomicU64,
    /// Next read index (monotonic). Normally advanced by the consumer; the
    /// producer also advances it by one when the ring is full, which is what
    /// implements drop-oldest.
    tail: AtomicU64,
    dropped: AtomicU64,
    sequence: AtomicU64,
}

// SAFETY: slots are plain-old-data `MidiEvent`s behind UnsafeCell. The
// producer writes only the slot at `head`; the consumer copies the slot at
// `tail` and then claims it with a compare-exchange on `tail`. When the
// producer steals `tail` to drop the oldest event, the consumer's claim
// fails and the (possibly torn) copy is discarded. No reference to slot
// memory ever escapes either side.
unsafe impl Send for RingInner {}
unsafe impl Sync for RingInner {}

/// SPSC ring of timestamped MIDI events.
///
/// `push` never blocks: when the ring is full the oldest event is discarded
/// and a lost-event counter is incremented, preserving the most recent
/// input. Sequence numbers are assigned on push so the consumer can order
/// same-frame events FIFO.
pub struct MidiRing;

impl MidiRing {
    /// Create a ring and split it into its producer and consumer halves.
    ///
    /// `capacity` is rounded up to the next power of two.
    pub fn with_capacity(capacity: usize) -> (MidiRingProducer, MidiRingConsumer) {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MidiEvent::new(0, [0; 3])))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let inner = Arc::new(RingInner {
            slots,
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        });

        (
            MidiRingProducer {
                inner: Arc::clone(&inner),
            },
            MidiRingConsumer { inner },
        )
    }

    pub fn new() -> (MidiRingProducer, MidiRingConsumer) {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }
}

/// Producer half. One per ring.
pub struct MidiRingProducer {
    inner: Arc<RingInner>,
}

impl MidiRingProducer {
    /// Push an event, assigning its sequence number. Never blocks; drops the
    /// oldest queued event on overflow.
    pub fn push(&self, mut event: MidiEvent) {
        let inner = &*self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) > inner.mask {
            // Full: steal the oldest slot from the consumer.
            if inner
                .tail
                .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        event.sequence = inner.sequence.fetch_add(1, Ordering::Relaxed);
        let slot = &inner.slots[(head & inner.mask) as usize];
        // SAFETY: the producer is the only writer of the slot at `head`; the
        // consumer cannot claim it until `head` is published below.
        unsafe { *slot.get() = event };
        inner.head.store(head + 1, Ordering::Release);
    }

    /// Events discarded so far because the ring was full.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half. One per ring.
pub struct MidiRingConsumer {
    inner: Arc<RingInner>,
}

impl MidiRingConsumer {
    /// Pop the oldest event, if any.
    pub fn pop(&mut self) -> Option<MidiEvent> {
        let inner = &*self.inner;
        loop {
            let tail = inner.tail.load(Ordering::Acquire);
            let head = inner.head.load(Ordering::Acquire);
            if tail == head {
                return None;
            }
            let slot = &inner.slots[(tail & inner.mask) as usize];
            // SAFETY: copy out before claiming; if the producer stole this
            // slot meanwhile the compare-exchange below fails and the copy
            // is discarded.
            let event = unsafe { *slot.get() };
            if inner
                .tail
                .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(event);
            }
        }
    }

    /// Drain everything queued, in `(frame_offset, sequence)` order.
    ///
    /// Allocation-free for typical cycle loads; larger bursts spill the
    /// scratch vector.
    pub fn drain_sorted(&mut self) -> SmallVec<[MidiEvent; DRAIN_INLINE]> {
        let mut events: SmallVec<[MidiEvent; DRAIN_INLINE]> = SmallVec::new();
        while let Some(ev) = self.pop() {
            events.push(ev);
        }
        // Sequence numbers are unique, so an unstable sort is order-stable.
        events.sort_unstable_by_key(MidiEvent::sort_key);
        events
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.tail.load(Ordering::Acquire) == self.inner.head.load(Ordering::Acquire)
    }

    /// Events discarded so far because the ring was full.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_fifo() {
        let (tx, mut rx) = MidiRing::with_capacity(8);
        tx.push(MidiEvent::note_on(0, 0, 60, 100));
        tx.push(MidiEvent::note_on(4, 0, 64, 100));

        let a = rx.pop().unwrap();
        let b = rx.pop().unwrap();
        assert_eq!(a.note(), Some(60));
        assert_eq!(b.note(), Some(64));
        assert!(a.sequence < b.sequence);
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let (tx, mut rx) = MidiRing::with_capacity(4);
        for i in 0..6u8 {
            tx.push(MidiEvent::note_on(i as u32, 0, 60 + i, 100));
        }
        assert_eq!(tx.dropped(), 2);

        // The two oldest events (notes 60, 61) were dropped.
        let drained = rx.drain_sorted();
        let notes: Vec<u8> = drained.iter().filter_map(|e| e.note()).collect();
        assert_eq!(notes, vec![62, 63, 64, 65]);
    }

    #[test]
    fn test_dropped_counts_once_per_event() {
        let (tx, rx) = MidiRing::with_capacity(2);
        for i in 0..10u8 {
            tx.push(MidiEvent::note_on(0, 0, i, 1));
        }
        assert_eq!(tx.dropped(), 8);
        assert_eq!(rx.dropped(), 8);
    }

    #[test]
    fn test_drain_sorted_orders_by_offset_then_sequence() {
        let (tx, mut rx) = MidiRing::with_capacity(16);
        tx.push(MidiEvent::note_on(50, 0, 1, 1));
        tx.push(MidiEvent::note_on(10, 0, 2, 1));
        tx.push(MidiEvent::note_on(10, 0, 3, 1));
        tx.push(MidiEvent::note_on(0, 0, 4, 1));

        let drained = rx.drain_sorted();
        let notes: Vec<u8> = drained.iter().filter_map(|e| e.note()).collect();
        // Offset order; same-offset events keep arrival order.
        assert_eq!(notes, vec![4, 2, 3, 1]);
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let (tx, mut rx) = MidiRing::with_capacity(3);
        // Effective capacity 4.
        for i in 0..4u8 {
            tx.push(MidiEvent::note_on(0, 0, i, 1));
        }
        assert_eq!(tx.dropped(), 0);
        assert_eq!(rx.drain_sorted().len(), 4);
    }

    #[test]
    fn test_random_offsets_drain_in_order() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let (tx, mut rx) = MidiRing::with_capacity(512);
        for _ in 0..300 {
            tx.push(MidiEvent::note_on(rng.gen_range(0..1024), 0, 60, 100));
        }
        let drained = rx.drain_sorted();
        assert_eq!(drained.len(), 300);
        for pair in drained.windows(2) {
            assert!(pair[0].sort_key() <= pair[1].sort_key());
        }
    }

    #[test]
    fn test_cross_thread_ordering() {
        let (tx, mut rx) = MidiRing::with_capacity(1024);
        let writer = std::thread::spawn(move || {
            for i in 0..500u32 {
                tx.push(MidiEvent::note_on(i, 0, (i % 128) as u8, 100));
            }
            tx
        });
        let tx = writer.join().unwrap();
        assert_eq!(tx.dropped(), 0);

        let drained = rx.drain_sorted();
        assert_eq!(drained.len(), 500);
        for pair in drained.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
        }
    }
}
