//! the jitter ring between the network threads and the audio callback
//!
//! A fixed set of payload sized slots, all allocated up front, with one
//! producer (the receiver thread, or the audio callback on the send side)
//! and one consumer (the audio callback, or the sender thread).  Neither
//! side ever blocks: a full ring sheds its oldest slot, an empty ring hands
//! the consumer silence or a replay of the last good slot.
//!
//! Slot handoff follows the usual sequence stamped scheme: each slot carries
//! an atomic stamp that says which queue position currently owns it.  A slot
//! is only written while its stamp equals the write position and only read
//! between the claim and release of its read position, so the payload bytes
//! are fully published before a cursor moves (release on the stamp store,
//! acquire on the loads).  The one compromise drop-oldest forces: when the
//! consumer has the oldest slot claimed at the exact moment the producer
//! needs to shed it, the producer sheds the incoming payload instead of
//! waiting.  Waiting is the one thing it must never do.
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// what to hand the audio callback when the ring is empty
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnderrunMode {
    /// fill with silence
    Zeros,
    /// replay the last slot that was read successfully
    Wavetable,
}

/// what a policy read actually delivered
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RingRead {
    /// a live payload straight off the ring
    Fresh,
    /// underrun, replayed the wavetable
    Replay,
    /// underrun, zeros (no wavetable available or Zeros mode)
    Silence,
}

struct Slot {
    stamp: AtomicUsize,
    payload: UnsafeCell<Box<[u8]>>,
}

// Slots are shared across the two threads; access to `payload` is arbitrated
// by `stamp` as described in the module docs.
unsafe impl Sync for Slot {}

struct RingCore {
    slots: Box<[Slot]>,
    slot_bytes: usize,
    capacity: usize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    underruns: AtomicUsize,
    overflows: AtomicUsize,
}

impl RingCore {
    fn occupancy(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        w.saturating_sub(r)
    }
    /// shed the oldest slot to make room.  Producer side only.
    fn drop_oldest(&self) -> () {
        let r = self.read_pos.load(Ordering::Acquire);
        let slot = &self.slots[r % self.capacity];
        if slot.stamp.load(Ordering::Acquire) != r + 1 {
            // consumer got here first, there is room now
            return;
        }
        if self
            .read_pos
            .compare_exchange(r, r + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            slot.stamp.store(r + self.capacity, Ordering::Release);
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// build a ring of `queue_len` slots of `slot_bytes` each.
///
/// Returns the producer and consumer endpoints plus a monitor for the
/// supervisor's stats reports.  Exactly one thread may hold each endpoint.
pub fn ring_pair(
    slot_bytes: usize,
    queue_len: usize,
    mode: UnderrunMode,
) -> (RingProducer, RingConsumer, RingMonitor) {
    let mut slots = Vec::with_capacity(queue_len);
    for i in 0..queue_len {
        slots.push(Slot {
            stamp: AtomicUsize::new(i),
            payload: UnsafeCell::new(vec![0u8; slot_bytes].into_boxed_slice()),
        });
    }
    let core = Arc::new(RingCore {
        slots: slots.into_boxed_slice(),
        slot_bytes,
        capacity: queue_len,
        write_pos: AtomicUsize::new(0),
        read_pos: AtomicUsize::new(0),
        underruns: AtomicUsize::new(0),
        overflows: AtomicUsize::new(0),
    });
    (
        RingProducer { core: core.clone() },
        RingConsumer {
            core: core.clone(),
            mode,
            wavetable: vec![0u8; slot_bytes],
            have_wavetable: false,
        },
        RingMonitor { core },
    )
}

/// writer endpoint, held by exactly one thread
pub struct RingProducer {
    core: Arc<RingCore>,
}

impl RingProducer {
    /// copy one payload in.  Never blocks; a full ring drops its oldest
    /// slot first.  Returns false when the payload had to be shed instead
    /// (the consumer had the oldest slot claimed right then).
    pub fn push(&mut self, payload: &[u8]) -> bool {
        let core = &*self.core;
        let w = core.write_pos.load(Ordering::Relaxed);
        if w.wrapping_sub(core.read_pos.load(Ordering::Acquire)) >= core.capacity {
            core.drop_oldest();
        }
        let slot = &core.slots[w % core.capacity];
        if slot.stamp.load(Ordering::Acquire) != w {
            core.overflows.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let n = payload.len().min(core.slot_bytes);
        unsafe {
            (&mut *slot.payload.get())[..n].copy_from_slice(&payload[..n]);
        }
        slot.stamp.store(w + 1, Ordering::Release);
        core.write_pos.store(w + 1, Ordering::Release);
        true
    }
    pub fn occupancy(&self) -> usize {
        self.core.occupancy()
    }
    pub fn slot_bytes(&self) -> usize {
        self.core.slot_bytes
    }
}

/// reader endpoint, held by exactly one thread
pub struct RingConsumer {
    core: Arc<RingCore>,
    mode: UnderrunMode,
    wavetable: Vec<u8>,
    have_wavetable: bool,
}

impl RingConsumer {
    /// raw read with no underrun policy.  True when `out` now holds a live
    /// payload.  Used by the sender loop, which would rather idle than pad.
    pub fn try_pop(&mut self, out: &mut [u8]) -> bool {
        let core = &*self.core;
        loop {
            let r = core.read_pos.load(Ordering::Acquire);
            if r == core.write_pos.load(Ordering::Acquire) {
                return false;
            }
            let slot = &core.slots[r % core.capacity];
            if slot.stamp.load(Ordering::Acquire) != r + 1 {
                // raced with a drop, reload the cursor
                continue;
            }
            if core
                .read_pos
                .compare_exchange(r, r + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let n = out.len().min(core.slot_bytes);
            unsafe {
                out[..n].copy_from_slice(&(&*slot.payload.get())[..n]);
            }
            slot.stamp.store(r + core.capacity, Ordering::Release);
            return true;
        }
    }
    /// policy read for the audio callback: always fills `out`, one way or
    /// another, and never blocks.
    pub fn pop(&mut self, out: &mut [u8]) -> RingRead {
        if self.try_pop(out) {
            let n = out.len().min(self.wavetable.len());
            self.wavetable[..n].copy_from_slice(&out[..n]);
            self.have_wavetable = true;
            return RingRead::Fresh;
        }
        self.core.underruns.fetch_add(1, Ordering::Relaxed);
        if self.mode == UnderrunMode::Wavetable && self.have_wavetable {
            let n = out.len().min(self.wavetable.len());
            out[..n].copy_from_slice(&self.wavetable[..n]);
            return RingRead::Replay;
        }
        out.fill(0);
        RingRead::Silence
    }
    pub fn occupancy(&self) -> usize {
        self.core.occupancy()
    }
    pub fn slot_bytes(&self) -> usize {
        self.core.slot_bytes
    }
    pub fn mode(&self) -> UnderrunMode {
        self.mode
    }
}

/// read only view for the supervisor's interval reports
#[derive(Clone)]
pub struct RingMonitor {
    core: Arc<RingCore>,
}

impl RingMonitor {
    pub fn occupancy(&self) -> usize {
        self.core.occupancy()
    }
    pub fn capacity(&self) -> usize {
        self.core.capacity
    }
    pub fn underruns(&self) -> usize {
        self.core.underruns.load(Ordering::Relaxed)
    }
    pub fn overflows(&self) -> usize {
        self.core.overflows.load(Ordering::Relaxed)
    }
}

impl fmt::Display for RingMonitor {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ depth: {}/{}, underruns: {}, overflows: {} }}",
            self.occupancy(),
            self.capacity(),
            self.underruns(),
            self.overflows()
        )
    }
}

#[cfg(test)]
mod test_ring {
    use super::*;

    #[test]
    fn build() {
        let (prod, cons, mon) = ring_pair(64, 4, UnderrunMode::Zeros);
        assert_eq!(prod.occupancy(), 0);
        assert_eq!(cons.occupancy(), 0);
        assert_eq!(mon.capacity(), 4);
    }

    #[test]
    fn write_then_read() {
        let (mut prod, mut cons, _mon) = ring_pair(4, 4, UnderrunMode::Zeros);
        assert!(prod.push(&[1, 2, 3, 4]));
        let mut out = [0u8; 4];
        assert_eq!(cons.pop(&mut out), RingRead::Fresh);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let (mut prod, _cons, mon) = ring_pair(1, 4, UnderrunMode::Zeros);
        for i in 0..100u8 {
            prod.push(&[i]);
            assert!(mon.occupancy() <= 4);
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        // Q = 4, push payloads tagged 1..=7 with no consumer.  Reads must
        // give the four newest and the overflow count the three shed.
        let (mut prod, mut cons, mon) = ring_pair(1, 4, UnderrunMode::Zeros);
        for i in 1..=7u8 {
            prod.push(&[i]);
        }
        let mut out = [0u8; 1];
        for expect in 4..=7u8 {
            assert_eq!(cons.pop(&mut out), RingRead::Fresh);
            assert_eq!(out[0], expect);
        }
        assert_eq!(mon.overflows(), 3);
    }

    #[test]
    fn underrun_zeros() {
        let (mut prod, mut cons, mon) = ring_pair(4, 4, UnderrunMode::Zeros);
        prod.push(&[9, 9, 9, 9]);
        let mut out = [0u8; 4];
        cons.pop(&mut out);
        assert_eq!(cons.pop(&mut out), RingRead::Silence);
        assert_eq!(out, [0, 0, 0, 0]);
        assert_eq!(mon.underruns(), 1);
    }

    #[test]
    fn underrun_wavetable_replays_last_slot() {
        // load one payload, then read four times with no writes: every
        // read comes back equal to the stored payload
        let stored = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let (mut prod, mut cons, mon) = ring_pair(8, 4, UnderrunMode::Wavetable);
        prod.push(&stored);
        let mut out = [0u8; 8];
        assert_eq!(cons.pop(&mut out), RingRead::Fresh);
        assert_eq!(out, stored);
        for _ in 0..3 {
            out.fill(0);
            assert_eq!(cons.pop(&mut out), RingRead::Replay);
            assert_eq!(out, stored);
        }
        assert_eq!(mon.underruns(), 3);
    }

    #[test]
    fn wavetable_before_any_read_is_silence() {
        let (_prod, mut cons, _mon) = ring_pair(4, 4, UnderrunMode::Wavetable);
        let mut out = [7u8; 4];
        assert_eq!(cons.pop(&mut out), RingRead::Silence);
        assert_eq!(out, [0, 0, 0, 0]);
    }

    #[test]
    fn underrun_count_matches_missing_periods() {
        let (mut prod, mut cons, mon) = ring_pair(1, 4, UnderrunMode::Wavetable);
        let mut out = [0u8; 1];
        // producer delivers every other period
        for i in 0..10u8 {
            if i % 2 == 0 {
                prod.push(&[i]);
            }
            cons.pop(&mut out);
        }
        assert_eq!(mon.underruns(), 5);
    }

    #[test]
    fn threaded_producer_consumer() {
        use std::thread;
        let (mut prod, mut cons, mon) = ring_pair(8, 8, UnderrunMode::Zeros);
        let writer = thread::spawn(move || {
            for i in 0..10_000u64 {
                prod.push(&i.to_le_bytes());
            }
        });
        let reader = thread::spawn(move || {
            let mut out = [0u8; 8];
            let mut last: Option<u64> = None;
            let mut reads = 0usize;
            while reads < 20_000 {
                if cons.try_pop(&mut out) {
                    let v = u64::from_le_bytes(out);
                    if let Some(prev) = last {
                        // values only ever move forward
                        assert!(v > prev, "went backwards: {} after {}", v, prev);
                    }
                    last = Some(v);
                    if v == 9_999 {
                        break;
                    }
                }
                reads += 1;
            }
        });
        writer.join().unwrap();
        reader.join().unwrap();
        assert!(mon.occupancy() <= 8);
    }
}
