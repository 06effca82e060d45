//! Single-producer single-consumer sample ring (§3, §9).
//!
//! The worker thread is the sole writer of `write_index` and the sole
//! adder to `depth`; the reader thread is the sole writer of `read_index`
//! and the sole subtracter from `depth`. [`RingProducer`] and
//! [`RingConsumer`] are the two ends of one ring: each is `Send` but not
//! `Clone`, so the type system enforces "exactly one writer, exactly one
//! reader" the same way a bounded SPSC channel would. The backing storage
//! sits behind an `UnsafeCell` because the two ends genuinely alias the
//! same allocation, but by construction the producer only ever touches
//! `[write_index, write_index + room)` and the consumer only ever touches
//! `[read_index, read_index + depth)`, which never overlap.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared {
    data: UnsafeCell<Box<[f64]>>,
    capacity: usize,
    channel_count: usize,
    write_index: AtomicUsize,
    read_index: AtomicUsize,
    depth: AtomicUsize,
}

// SAFETY: `data` is only ever written through `[write_index, write_index +
// room)` by the producer and only ever read through `[read_index,
// read_index + depth)` by the consumer; these ranges never overlap because
// `depth` is published with Release and observed with Acquire on both
// sides before either range is computed.
unsafe impl Sync for Shared {}

/// `capacity` must be a positive multiple of `channel_count` (§3
/// invariant); the scan controller derives a capacity that satisfies this
/// before calling `ring`.
pub fn ring(capacity: usize, channel_count: usize) -> (RingProducer, RingConsumer) {
    debug_assert!(capacity > 0);
    debug_assert_eq!(capacity % channel_count, 0);
    let shared = Arc::new(Shared {
        data: UnsafeCell::new(vec![0.0; capacity].into_boxed_slice()),
        capacity,
        channel_count,
        write_index: AtomicUsize::new(0),
        read_index: AtomicUsize::new(0),
        depth: AtomicUsize::new(0),
    });
    (
        RingProducer {
            shared: shared.clone(),
        },
        RingConsumer { shared },
    )
}

pub struct RingProducer {
    shared: Arc<Shared>,
}

// SAFETY: only one `RingProducer` is ever created per ring (by `ring`),
// and it is moved into the worker thread wholesale, never shared.
unsafe impl Send for RingProducer {}

pub struct RingConsumer {
    shared: Arc<Shared>,
}

unsafe impl Send for RingConsumer {}

impl RingProducer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channel_count
    }

    /// How many contiguous slots remain before the write cursor wraps —
    /// the bound a single device-read chunk must respect so one transport
    /// call never straddles the wrap point (§4.5 step 4).
    pub fn contiguous_tail(&self) -> usize {
        self.shared.capacity - self.shared.write_index.load(Ordering::Relaxed)
    }

    /// Append one channel-interleaved sample. Returns `true` if this write
    /// pushed `depth` past `capacity` (buffer overrun, §4.5 step 6); the
    /// write itself always lands in a valid, reader-owned-free slot
    /// because the caller clips chunk sizes to `contiguous_tail`.
    pub fn push(&self, sample: f64) -> bool {
        let idx = self.shared.write_index.load(Ordering::Relaxed);
        // SAFETY: see `Shared`'s Sync impl note; only the producer writes here.
        unsafe {
            (*self.shared.data.get())[idx] = sample;
        }
        self.shared
            .write_index
            .store((idx + 1) % self.shared.capacity, Ordering::Relaxed);
        let new_depth = self.shared.depth.load(Ordering::Relaxed) + 1;
        self.shared.depth.store(new_depth, Ordering::Release);
        new_depth > self.shared.capacity
    }
}

impl RingConsumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channel_count
    }

    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    /// Copy up to `count` samples (already snapped to a channel-count
    /// multiple by the caller) into `out`, handling wrap as two memcopies,
    /// then advance `read_index` and decrement `depth`. Returns the number
    /// of samples actually copied.
    pub fn pop_into(&self, out: &mut [f64], count: usize) -> usize {
        let available = self.shared.depth.load(Ordering::Acquire);
        let count = count.min(available).min(out.len());
        if count == 0 {
            return 0;
        }

        let read_idx = self.shared.read_index.load(Ordering::Relaxed);
        let capacity = self.shared.capacity;
        let tail = capacity - read_idx;
        // SAFETY: see `Shared`'s Sync impl note; only the consumer reads here.
        let data = unsafe { &*self.shared.data.get() };
        if count <= tail {
            out[..count].copy_from_slice(&data[read_idx..read_idx + count]);
        } else {
            let first = tail;
            let second = count - tail;
            out[..first].copy_from_slice(&data[read_idx..capacity]);
            out[first..count].copy_from_slice(&data[..second]);
        }

        self.shared
            .read_index
            .store((read_idx + count) % capacity, Ordering::Relaxed);
        self.shared.depth.store(available - count, Ordering::Release);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_preserves_order() {
        let (tx, rx) = ring(4, 2);
        for v in [1.0, 2.0, 3.0, 4.0] {
            tx.push(v);
        }
        assert_eq!(rx.depth(), 4);
        let mut out = [0.0; 4];
        let n = rx.pop_into(&mut out, 4);
        assert_eq!(n, 4);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(rx.depth(), 0);
    }

    #[test]
    fn wrap_around_two_part_copy() {
        let (tx, rx) = ring(4, 2);
        for v in [10.0, 20.0, 30.0, 40.0] {
            tx.push(v);
        }
        let mut drained = [0.0; 2];
        rx.pop_into(&mut drained, 2);
        assert_eq!(drained, [10.0, 20.0]);

        // write_index is now 0 (wrapped); write 2 more samples
        tx.push(50.0);
        tx.push(60.0);
        assert_eq!(rx.depth(), 4);

        let mut out = [0.0; 4];
        let n = rx.pop_into(&mut out, 4);
        assert_eq!(n, 4);
        assert_eq!(out, [30.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn push_past_capacity_reports_overrun() {
        let (tx, _rx) = ring(2, 1);
        assert!(!tx.push(1.0));
        assert!(!tx.push(2.0));
        assert!(tx.push(3.0));
    }

    #[test]
    fn contiguous_tail_shrinks_towards_wrap() {
        let (tx, _rx) = ring(4, 2);
        assert_eq!(tx.contiguous_tail(), 4);
        tx.push(1.0);
        tx.push(2.0);
        assert_eq!(tx.contiguous_tail(), 2);
    }

    #[test]
    fn across_threads() {
        let (tx, rx) = ring(100, 1);
        let writer = std::thread::spawn(move || {
            for i in 0..100 {
                while tx.push(i as f64) {}
            }
        });
        writer.join().unwrap();
        let mut out = [0.0; 100];
        let n = rx.pop_into(&mut out, 100);
        assert_eq!(n, 100);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[99], 99.0);
    }
}
