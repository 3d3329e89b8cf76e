// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lock-free FIFO of waiter handles with in-place erasure.
//!
//! The queue is a linked list of fixed-capacity ring segments. Within a
//! segment, enqueue and dequeue follow the bounded-MPMC sequence-number
//! protocol: slot `i` starts with sequence `i`; an enqueuer that observes
//! `seq == tail` claims the slot by bumping the tail, writes the item, and
//! publishes `seq = tail + 1`; a dequeuer that observes `seq == head + 1`
//! claims it by bumping the head and recycles the slot with
//! `seq = head + capacity`.
//!
//! Erasure replaces a slot's item with a tombstone sentinel without touching
//! the head or tail, so a cancelling waiter can remove itself mid-queue
//! without blocking enqueuers or dequeuers. Dequeue and peek treat a
//! tombstoned slot as empty and advance past it lazily.
//!
//! Enqueue, dequeue, peek, and erase are all lock-free; the only lock is the
//! structural one, taken to append or retire a segment.
//!
//! # Reference discipline
//!
//! Every occupied slot owns one `Arc` reference to its waiter, and removal
//! transfers it: a dequeuer that swaps the item out owns it, as does an
//! eraser whose compare-and-swap installed the tombstone. `peek` does not
//! remove anything, so it acquires a *new* reference instead: waiter
//! allocations are immortal (the pool shelves every retired handle and never
//! frees one), which makes the raw dereference sound, and
//! [`Waiter::try_add_ref_live`] refuses handles whose owners are all gone,
//! which keeps the ownership latch consistent. A successful re-check of the
//! slot then proves the acquired handle is (still, or again) the occupant of
//! the head slot.

use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_utils::CachePadded;
use spin::Mutex;

use crate::wait::pool;
use crate::wait::waiter::Waiter;

/// Capacity of the segment a queue starts with.
const INITIAL_CAPACITY: usize = 32;
/// Segments never grow beyond this many slots.
const MAX_CAPACITY: usize = 1 << 20;
/// High bit of a segment's tail counter; set when the segment is retired from
/// the enqueue path.
const FROZEN: usize = 1 << (usize::BITS - 1);

/// The sentinel installed in place of an erased (or dequeued) item.
#[inline(always)]
fn tombstone() -> *mut Waiter {
    ptr::without_provenance_mut(1)
}

pub(crate) struct WaitQueue {
    head: ArcSwap<Segment>,
    tail: ArcSwap<Segment>,
    /// Serialises structural changes only: appending a new segment and
    /// retiring a drained one.
    structure: Mutex<()>,
}

struct Segment {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    /// Erased slots not yet recycled by a passing dequeuer.
    tombstones: AtomicUsize,
    next: ArcSwapOption<Segment>,
    slots: Box<[Slot]>,
}

struct Slot {
    seq: AtomicUsize,
    item: AtomicPtr<Waiter>,
}

enum Claim {
    /// A real item was taken.
    Item(*mut Waiter),
    /// Nothing is published at the head.
    Empty,
}

enum Peeked {
    /// An owned reference to the waiter occupying the head slot.
    Item(Arc<Waiter>),
    /// Nothing is published at the head.
    Empty,
}

// === impl WaitQueue ===

impl WaitQueue {
    pub(crate) fn new() -> Self {
        let seg = Arc::new(Segment::new(INITIAL_CAPACITY));
        Self {
            head: ArcSwap::from(seg.clone()),
            tail: ArcSwap::from(seg),
            structure: Mutex::new(()),
        }
    }

    /// Append `waiter` at the tail, taking one queue reference on it.
    ///
    /// Lock-free; allocates only when the current segment must roll over.
    pub(crate) fn push(&self, waiter: &Arc<Waiter>) {
        waiter.add_ref();
        let raw = Arc::into_raw(Arc::clone(waiter)).cast_mut();
        loop {
            let seg = self.tail.load_full();
            if seg.try_push(raw) {
                return;
            }
            self.grow(&seg);
        }
    }

    /// Remove and return the waiter at the head, skipping erased slots.
    ///
    /// Lock-free. The returned `Arc` is the queue's reference; the caller
    /// releases it once done.
    pub(crate) fn pop(&self) -> Option<Arc<Waiter>> {
        loop {
            let seg = self.head.load_full();
            match seg.try_pop() {
                Claim::Item(raw) => {
                    // Safety: created by `Arc::into_raw` in `push`; swapping
                    // the slot's item out transferred ownership to us.
                    return Some(unsafe { Arc::from_raw(raw) });
                }
                Claim::Empty => {
                    if !self.advance_head(&seg) {
                        return None;
                    }
                }
            }
        }
    }

    /// Return (but do not remove) the waiter at the head.
    ///
    /// Lock-free. The returned handle is an owned reference to whatever
    /// occupied the head slot at some instant; it may be completed, erased,
    /// or recycled by others at any time afterwards. The caller releases the
    /// reference once done.
    pub(crate) fn peek(&self) -> Option<Arc<Waiter>> {
        loop {
            let seg = self.head.load_full();
            match seg.try_peek() {
                Peeked::Item(waiter) => return Some(waiter),
                Peeked::Empty => {
                    if !self.advance_head(&seg) {
                        return None;
                    }
                }
            }
        }
    }

    /// Replace `waiter`'s slot with a tombstone if it is still queued.
    ///
    /// Lock-free. Returns `true` if this call removed the waiter (and has
    /// released the queue's reference); `false` means a dequeuer already
    /// took it (or it was never here), and that dequeuer owns the reference.
    pub(crate) fn erase(&self, waiter: &Arc<Waiter>) -> bool {
        let target = Arc::as_ptr(waiter);
        let mut seg = self.head.load_full();
        loop {
            if seg.try_erase(target) {
                // Safety: `push` created this reference with `Arc::into_raw`,
                // and winning the slot CAS made us its sole owner.
                pool::release(unsafe { Arc::from_raw(target) });
                return true;
            }
            match seg.next.load_full() {
                Some(next) => seg = next,
                None => return false,
            }
        }
    }

    /// Moment-in-time number of queued (non-erased) waiters.
    pub(crate) fn len(&self) -> usize {
        let mut len = 0usize;
        let mut seg = self.head.load_full();
        loop {
            let tail = seg.tail.load(Ordering::SeqCst) & !FROZEN;
            let head = seg.head.load(Ordering::SeqCst);
            let dead = seg.tombstones.load(Ordering::SeqCst);
            len += tail.saturating_sub(head).saturating_sub(dead);
            match seg.next.load_full() {
                Some(next) => seg = next,
                None => return len,
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retire a drained, frozen head segment. Returns `false` if the head
    /// cannot move (the queue is simply empty, or in-flight enqueues have not
    /// published yet).
    fn advance_head(&self, seg: &Arc<Segment>) -> bool {
        let tail = seg.tail.load(Ordering::Acquire);
        if tail & FROZEN == 0 {
            return false;
        }
        if seg.head.load(Ordering::Acquire) != tail & !FROZEN {
            return false;
        }
        let Some(next) = seg.next.load_full() else {
            return false;
        };
        // retiring is a structural change, serialised with appends; the
        // re-check stops a stale caller from moving the head backwards
        let _lock = self.structure.lock();
        if Arc::ptr_eq(&self.head.load_full(), seg) {
            self.head.store(next);
        }
        true
    }

    #[cold]
    fn grow(&self, from: &Arc<Segment>) {
        let _lock = self.structure.lock();

        // someone else may have rolled the queue over while we waited
        let tail = self.tail.load_full();
        if !Arc::ptr_eq(&tail, from) {
            return;
        }

        tail.freeze();

        // a majority-tombstoned segment was mostly erased waiters, not real
        // load; keep the size instead of doubling
        let capacity = if tail.tombstones.load(Ordering::Relaxed) > tail.capacity() / 2 {
            tail.capacity()
        } else {
            (tail.capacity() * 2).min(MAX_CAPACITY)
        };

        tracing::trace!(capacity, "wait queue rolling over to a new segment");
        let next = Arc::new(Segment::new(capacity));
        tail.next.store(Some(next.clone()));
        self.tail.store(next);
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue").field("len", &self.len()).finish()
    }
}

// === impl Segment ===

impl Segment {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                item: AtomicPtr::new(ptr::null_mut()),
            })
            .collect();
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            tombstones: AtomicUsize::new(0),
            next: ArcSwapOption::empty(),
            slots,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn freeze(&self) {
        self.tail.fetch_or(FROZEN, Ordering::AcqRel);
    }

    /// Returns `false` if the segment is full or frozen and the caller must
    /// roll over to a new one.
    fn try_push(&self, raw: *mut Waiter) -> bool {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            if tail & FROZEN != 0 {
                return false;
            }
            let slot = &self.slots[tail & self.mask()];
            // SeqCst pairs the publish with the primitive's state word so a
            // racing enqueue and release cannot both miss each other
            let seq = slot.seq.load(Ordering::SeqCst);

            if seq == tail {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.item.store(raw, Ordering::Relaxed);
                        slot.seq.store(tail + 1, Ordering::SeqCst);
                        return true;
                    }
                    Err(actual) => tail = actual,
                }
            } else if seq < tail {
                // the slot has not been recycled since the previous lap: full
                return false;
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue one real item, recycling erased slots in passing.
    fn try_pop(&self) -> Claim {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[head & self.mask()];
            let seq = slot.seq.load(Ordering::SeqCst);

            if seq == head + 1 {
                match self.head.compare_exchange_weak(
                    head,
                    head + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let raw = slot.item.swap(tombstone(), Ordering::AcqRel);
                        slot.seq.store(head + self.capacity(), Ordering::Release);
                        if raw == tombstone() {
                            // an erased waiter: as if it were never enqueued
                            self.tombstones.fetch_sub(1, Ordering::Relaxed);
                            head = self.head.load(Ordering::Relaxed);
                            continue;
                        }
                        debug_assert!(!raw.is_null());
                        return Claim::Item(raw);
                    }
                    Err(actual) => head = actual,
                }
            } else if seq == head {
                // nothing published at the head (an in-flight enqueue counts
                // as not-yet-visible)
                return Claim::Empty;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Acquire an owned reference to the head occupant without removing it.
    fn try_peek(&self) -> Peeked {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[head & self.mask()];
            let seq = slot.seq.load(Ordering::SeqCst);

            if seq == head + 1 {
                let raw = slot.item.load(Ordering::Acquire);
                if raw == tombstone() {
                    // help by advancing the head past the dead slot
                    if self
                        .head
                        .compare_exchange(head, head + 1, Ordering::Relaxed, Ordering::Relaxed)
                        .is_ok()
                    {
                        slot.seq.store(head + self.capacity(), Ordering::Release);
                        self.tombstones.fetch_sub(1, Ordering::Relaxed);
                    }
                    head = self.head.load(Ordering::Relaxed);
                    continue;
                }
                debug_assert!(!raw.is_null());

                // Safety: waiter allocations are immortal (see the pool), so
                // the dereference is sound even if the handle was recycled.
                let candidate = unsafe { &*raw };
                if !candidate.try_add_ref_live() {
                    // all owners let go mid-peek; the slot is about to change
                    head = self.head.load(Ordering::Relaxed);
                    continue;
                }
                // Safety: immortality also guarantees at least one strong
                // reference (an owner's or the pool shelf's) exists at all
                // times, so the count cannot be resurrected from zero.
                let waiter = unsafe {
                    Arc::increment_strong_count(raw);
                    Arc::from_raw(raw)
                };
                // the handle is pinned by our reference; re-checking the slot
                // proves it is (still, or again) the head occupant
                if slot.item.load(Ordering::Acquire) == raw {
                    return Peeked::Item(waiter);
                }
                pool::release(waiter);
                head = self.head.load(Ordering::Relaxed);
            } else if seq == head {
                return Peeked::Empty;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Scan from head to tail, tombstoning the slot whose item is `target`.
    fn try_erase(&self, target: *const Waiter) -> bool {
        let tail = self.tail.load(Ordering::Acquire) & !FROZEN;
        let mut pos = self.head.load(Ordering::Acquire);
        while pos != tail {
            let slot = &self.slots[pos & self.mask()];
            if slot
                .item
                .compare_exchange(
                    target.cast_mut(),
                    tombstone(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.tombstones.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            pos += 1;
        }
        false
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // release the queue references of any waiters still in this segment
        for slot in &self.slots {
            let raw = slot.item.load(Ordering::Relaxed);
            if !raw.is_null() && raw != tombstone() {
                // Safety: every non-sentinel pointer in a slot is exactly one
                // live reference created by `push`, and nothing else can
                // reach this segment anymore.
                pool::release(unsafe { Arc::from_raw(raw) });
            }
        }
    }
}

// Safety: slot items are raw `Arc` pointers whose ownership is transferred
// through atomic operations; see the module docs.
unsafe impl Send for Segment {}
// Safety: as above.
unsafe impl Sync for Segment {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::wait::Phase;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn waiters(tags: core::ops::Range<usize>) -> Vec<Arc<Waiter>> {
        tags.map(pool::checkout).collect()
    }

    fn release_all(waiters: Vec<Arc<Waiter>>) {
        for w in waiters {
            assert!(w.transition(Phase::Cancelled));
            pool::release(w);
        }
    }

    #[test]
    fn fifo_order() {
        let queue = WaitQueue::new();
        let ws = waiters(0..5);
        for w in &ws {
            queue.push(w);
        }
        assert_eq!(queue.len(), 5);

        for i in 0..5 {
            let w = queue.pop().unwrap();
            assert_eq!(w.tag(), i);
            pool::release(w);
        }
        assert!(queue.pop().is_none());

        assert!(queue.is_empty());
        release_all(ws);
    }

    #[test]
    fn erase_mid_queue_preserves_order() {
        let queue = WaitQueue::new();
        let ws = waiters(0..4);
        for w in &ws {
            queue.push(w);
        }

        assert!(queue.erase(&ws[1]));
        // erasing twice is a no-op: the slot is already a tombstone
        assert!(!queue.erase(&ws[1]));
        assert_eq!(queue.len(), 3);

        let order: Vec<usize> = core::iter::from_fn(|| {
            queue.pop().map(|w| {
                let tag = w.tag();
                pool::release(w);
                tag
            })
        })
        .collect();
        assert_eq!(order, [0, 2, 3]);
        release_all(ws);
    }

    #[test]
    fn peek_hands_out_an_owned_reference() {
        let queue = WaitQueue::new();
        let ws = waiters(0..3);
        for w in &ws {
            queue.push(w);
        }

        // the peeked handle is a real reference, not a borrow
        let peeked = queue.peek().unwrap();
        assert!(Arc::ptr_eq(&peeked, &ws[0]));
        assert_eq!(peeked.tag(), 0);
        pool::release(peeked);

        // peeking does not remove
        assert_eq!(queue.len(), 3);
        let popped = queue.pop().unwrap();
        assert_eq!(popped.tag(), 0);
        pool::release(popped);
        release_all(ws);
    }

    #[test]
    fn peek_skips_an_erased_head() {
        let queue = WaitQueue::new();
        let ws = waiters(0..3);
        for w in &ws {
            queue.push(w);
        }
        assert!(queue.erase(&ws[0]));

        let peeked = queue.peek().unwrap();
        assert_eq!(peeked.tag(), 1);
        pool::release(peeked);
        release_all(ws);
    }

    #[test]
    fn rollover_grows_segments() {
        let queue = WaitQueue::new();
        // more waiters than the initial segment holds
        let ws = waiters(0..100);
        for w in &ws {
            queue.push(w);
        }
        assert_eq!(queue.len(), 100);

        for i in 0..100 {
            let w = queue.pop().unwrap();
            assert_eq!(w.tag(), i);
            pool::release(w);
        }
        assert!(queue.pop().is_none());
        release_all(ws);
    }

    #[test]
    fn ring_reuse_does_not_allocate_segments() {
        let queue = WaitQueue::new();
        // cycle through far more operations than a segment holds; the ring
        // wraps in place
        for round in 0..10 {
            let ws = waiters(round * 16..round * 16 + 16);
            for w in &ws {
                queue.push(w);
            }
            for w in &ws {
                let popped = queue.pop().unwrap();
                assert!(Arc::ptr_eq(&popped, w));
                pool::release(popped);
            }
            release_all(ws);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_push_pop() {
        use crate::loom::thread;
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;

        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let queue = Arc::new(WaitQueue::new());
        const PER_THREAD: usize = 500;
        const THREADS: usize = 4;

        let producers: Vec<_> = (0..THREADS)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        let w = pool::checkout(t * PER_THREAD + i);
                        queue.push(&w);
                        pool::release(w);
                    }
                })
            })
            .collect();

        let mut seen = Vec::with_capacity(THREADS * PER_THREAD);
        while seen.len() < THREADS * PER_THREAD {
            if let Some(w) = queue.pop() {
                assert!(w.transition(Phase::Completed));
                seen.push(w.tag());
                pool::release(w);
            } else {
                std::thread::yield_now();
            }
        }
        for p in producers {
            p.join().unwrap();
        }

        // FIFO per producer
        for t in 0..THREADS {
            let per: Vec<usize> = seen
                .iter()
                .copied()
                .filter(|tag| tag / PER_THREAD == t)
                .collect();
            let mut sorted = per.clone();
            sorted.sort_unstable();
            assert_eq!(per, sorted, "producer {t} was reordered");
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn dropping_queue_releases_queued_waiters() {
        let queue = WaitQueue::new();
        let ws = waiters(0..8);
        for w in &ws {
            queue.push(w);
        }
        drop(queue);
        // the queue references are gone; ours are the last
        release_all(ws);
    }

    proptest! {
        /// Any interleaving of pushes, pops, and mid-queue erasures behaves
        /// like a FIFO in which erased entries were never enqueued.
        #[test]
        fn fifo_holds_under_interleaved_erasure(
            ops in proptest::collection::vec(0u8..3, 1..160),
        ) {
            let queue = WaitQueue::new();
            let mut model: VecDeque<(usize, Arc<Waiter>)> = VecDeque::new();
            let mut next_tag = 0usize;

            for op in ops {
                match op {
                    0 => {
                        let w = pool::checkout(next_tag);
                        queue.push(&w);
                        model.push_back((next_tag, w));
                        next_tag += 1;
                    }
                    1 => match queue.pop() {
                        Some(w) => {
                            let (tag, caller) =
                                model.pop_front().expect("popped from an empty model");
                            prop_assert_eq!(w.tag(), tag);
                            pool::release(w);
                            pool::release(caller);
                        }
                        None => prop_assert!(model.is_empty()),
                    },
                    2 => {
                        // erase a mid-queue entry when there is one
                        if model.len() >= 2 {
                            let (_, w) = model.remove(1).expect("length checked");
                            prop_assert!(queue.erase(&w));
                            pool::release(w);
                        }
                    }
                    _ => unreachable!(),
                }
            }

            while let Some((tag, caller)) = model.pop_front() {
                let w = queue.pop().expect("model says more entries remain");
                prop_assert_eq!(w.tag(), tag);
                pool::release(w);
                pool::release(caller);
            }
            prop_assert!(queue.pop().is_none());
            prop_assert!(queue.is_empty());
        }
    }
}
