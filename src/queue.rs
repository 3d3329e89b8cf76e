// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bounded producer-consumer queue with closeable semantics.
//!
//! The queue composes two [`Counter`]s over a fixed ring buffer: `free`
//! starts at the capacity and gates adds, `used` starts at zero and gates
//! takes. At quiescence `free + used = capacity`. Completing the adding side
//! closes `free`, failing pending adds; takes keep draining until `used`
//! reaches zero, at which point the queue transitions to drained and further
//! takes fail with [`TakeError::Completed`].

use core::fmt;
use core::mem::MaybeUninit;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};
use pin_project::pin_project;

use crate::cancel::CancelToken;
use crate::counter::{Counter, Decrement, DecrementAny};
use crate::error::{AddError, TakeError, TryAddError};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::time::Timer;

/// A bounded asynchronous queue.
pub struct Queue<T> {
    buffer: Buffer<T>,
    capacity: usize,
    free: Counter,
    used: Counter,
    adding_complete: AtomicBool,
    /// Adds that reserved a slot but have not published their item yet;
    /// the drained transition waits for them.
    in_flight_adds: AtomicUsize,
}

// === impl Queue ===

impl<T> Queue<T> {
    /// A queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            // the ring wants a power of two; the free counter enforces the
            // configured bound
            buffer: Buffer::new(capacity.next_power_of_two()),
            capacity,
            free: Counter::new(capacity),
            used: Counter::new(0),
            adding_complete: AtomicBool::new(false),
            in_flight_adds: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently available to take.
    pub fn len(&self) -> usize {
        self.used.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_adding_complete(&self) -> bool {
        self.adding_complete.load(Ordering::SeqCst)
    }

    /// Insert `item` if a slot is immediately free.
    pub fn try_add(&self, item: T) -> Result<(), TryAddError<T>> {
        if self.is_adding_complete() {
            return Err(TryAddError::Completed(item));
        }
        self.in_flight_adds.fetch_add(1, Ordering::SeqCst);
        let result = if self.free.try_decrement() {
            if self.is_adding_complete() {
                // completion won the race for our slot
                self.free.force_increment();
                Err(TryAddError::Completed(item))
            } else {
                self.publish(item);
                Ok(())
            }
        } else if self.is_adding_complete() {
            Err(TryAddError::Completed(item))
        } else {
            Err(TryAddError::Full(item))
        };
        self.in_flight_adds.fetch_sub(1, Ordering::SeqCst);
        if result.is_err() {
            self.maybe_drain();
        }
        result
    }

    /// Wait for a free slot and insert `item`.
    pub fn add(&self, item: T) -> Add<'_, T> {
        Add {
            queue: self,
            item: Some(item),
            decrement: self.free.decrement(),
        }
    }

    /// Wait for `items.len()` slots at once and insert all of them
    /// contiguously from this producer's perspective.
    pub fn add_many(&self, items: Vec<T>) -> AddMany<'_, T> {
        let n = items.len();
        AddMany {
            queue: self,
            items: Some(items),
            decrement: self.free.decrement_n(n),
        }
    }

    /// Remove the oldest item if one is immediately available.
    pub fn try_take(&self) -> Option<T> {
        if !self.used.try_decrement() {
            return None;
        }
        Some(self.consume())
    }

    /// Wait for an item.
    pub fn take(&self) -> Take<'_, T> {
        Take {
            queue: self,
            decrement: self.used.decrement(),
        }
    }

    /// Stop accepting items.
    ///
    /// Monotonic: pending and future adds fail with
    /// [`AddError::Completed`]; items already queued may still be taken, and
    /// once the last one is gone, takes fail with [`TakeError::Completed`].
    pub fn complete_adding(&self) {
        if !self.adding_complete.swap(true, Ordering::SeqCst) {
            tracing::trace!("queue adding completed");
            self.free.close();
            self.maybe_drain();
        }
    }

    /// Wait for an item on whichever of `queues` becomes non-empty first.
    ///
    /// Exactly one item is consumed. Ties go to the lowest index; an empty
    /// input set completes immediately with `Ok(None)`.
    pub fn take_any<'a>(queues: &[&'a Queue<T>]) -> TakeAny<'a, T> {
        let counters: Vec<&'a Counter> = queues.iter().map(|queue| &queue.used).collect();
        TakeAny {
            queues: queues.to_vec(),
            inner: Counter::decrement_any(&counters),
        }
    }

    /// Insert `item` into whichever of `queues` has a free slot first.
    ///
    /// Ties go to the lowest index; an empty input set completes immediately
    /// with `Ok(None)`, handing the item back.
    pub fn add_any<'a>(queues: &[&'a Queue<T>], item: T) -> AddAny<'a, T> {
        AddAny {
            queues: queues.to_vec(),
            item: Some(item),
            cancel: None,
            deadline: None,
            inner: None,
        }
    }

    /// Move a published free slot into the buffer and the used counter.
    ///
    /// The caller must hold a free-slot reservation and have registered
    /// itself in `in_flight_adds`.
    fn publish(&self, item: T) {
        self.buffer.push(item);
        let published = self.used.increment();
        debug_assert!(
            published.is_ok(),
            "used counter cannot drain while an add is in flight"
        );
    }

    /// Take an item out of the buffer, returning its slot to the free side.
    ///
    /// The caller must have consumed one `used` count.
    fn consume(&self) -> T {
        let item = self.buffer.pop();
        // after completion the free counter is closed and the slot simply
        // retires
        let _ = self.free.try_increment();
        self.maybe_drain();
        item
    }

    /// Transition to drained once adding is complete, no adds are in
    /// flight, and every item has been taken.
    fn maybe_drain(&self) {
        if self.is_adding_complete()
            && self.in_flight_adds.load(Ordering::SeqCst) == 0
            && self.used.count() == 0
        {
            self.used.close();
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("adding_complete", &self.is_adding_complete())
            .finish()
    }
}

// === impl Add ===

/// Future returned by [`Queue::add`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Add<'a, T> {
    queue: &'a Queue<T>,
    item: Option<T>,
    #[pin]
    decrement: Decrement<'a>,
}

impl<'a, T> Add<'a, T> {
    /// Resolve with [`AddError::Cancelled`] if `token` fires first.
    pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
        self.decrement = self.decrement.cancel_on(token);
        self
    }

    /// Resolve with [`AddError::TimedOut`] if `duration` elapses first.
    pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
        self.decrement = self.decrement.deadline(timer, duration);
        self
    }
}

impl<T> Future for Add<'_, T> {
    type Output = Result<(), AddError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let queue = *this.queue;
        match core::task::ready!(this.decrement.poll(cx)) {
            Ok(()) => {
                let item = this.item.take().expect("Add polled after completion");
                queue.in_flight_adds.fetch_add(1, Ordering::SeqCst);
                let result = if queue.is_adding_complete() {
                    // our reservation lost the race with completion
                    queue.free.force_increment();
                    Err(AddError::Completed(item))
                } else {
                    queue.publish(item);
                    Ok(())
                };
                queue.in_flight_adds.fetch_sub(1, Ordering::SeqCst);
                if result.is_err() {
                    queue.maybe_drain();
                }
                Poll::Ready(result)
            }
            Err(err) => {
                let item = this.item.take().expect("Add polled after completion");
                Poll::Ready(Err(AddError::from_acquire(err, item)))
            }
        }
    }
}

impl<T> fmt::Debug for Add<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Add").finish_non_exhaustive()
    }
}

// === impl AddMany ===

/// Future returned by [`Queue::add_many`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct AddMany<'a, T> {
    queue: &'a Queue<T>,
    items: Option<Vec<T>>,
    #[pin]
    decrement: Decrement<'a>,
}

impl<'a, T> AddMany<'a, T> {
    /// Resolve with [`AddError::Cancelled`] if `token` fires first.
    pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
        self.decrement = self.decrement.cancel_on(token);
        self
    }

    /// Resolve with [`AddError::TimedOut`] if `duration` elapses first.
    pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
        self.decrement = self.decrement.deadline(timer, duration);
        self
    }
}

impl<T> Future for AddMany<'_, T> {
    type Output = Result<(), AddError<Vec<T>>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let queue = *this.queue;
        match core::task::ready!(this.decrement.poll(cx)) {
            Ok(()) => {
                let items = this.items.take().expect("AddMany polled after completion");
                let n = items.len();
                queue.in_flight_adds.fetch_add(1, Ordering::SeqCst);
                let result = if queue.is_adding_complete() {
                    queue.free.force_increment_n(n);
                    Err(AddError::Completed(items))
                } else {
                    for item in items {
                        queue.buffer.push(item);
                    }
                    let published = queue.used.increment_n(n);
                    debug_assert!(published.is_ok());
                    Ok(())
                };
                queue.in_flight_adds.fetch_sub(1, Ordering::SeqCst);
                if result.is_err() {
                    queue.maybe_drain();
                }
                Poll::Ready(result)
            }
            Err(err) => {
                let items = this.items.take().expect("AddMany polled after completion");
                Poll::Ready(Err(AddError::from_acquire(err, items)))
            }
        }
    }
}

impl<T> fmt::Debug for AddMany<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddMany").finish_non_exhaustive()
    }
}

// === impl Take ===

/// Future returned by [`Queue::take`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Take<'a, T> {
    queue: &'a Queue<T>,
    #[pin]
    decrement: Decrement<'a>,
}

impl<'a, T> Take<'a, T> {
    /// Resolve with [`TakeError::Cancelled`] if `token` fires first.
    pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
        self.decrement = self.decrement.cancel_on(token);
        self
    }

    /// Resolve with [`TakeError::TimedOut`] if `duration` elapses first.
    pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
        self.decrement = self.decrement.deadline(timer, duration);
        self
    }
}

impl<T> Future for Take<'_, T> {
    type Output = Result<T, TakeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let queue = *this.queue;
        match core::task::ready!(this.decrement.poll(cx)) {
            Ok(()) => Poll::Ready(Ok(queue.consume())),
            Err(err) => Poll::Ready(Err(TakeError::from_acquire(err))),
        }
    }
}

impl<T> fmt::Debug for Take<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Take").finish_non_exhaustive()
    }
}

// === impl TakeAny ===

/// Future returned by [`Queue::take_any`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct TakeAny<'a, T> {
    queues: Vec<&'a Queue<T>>,
    #[pin]
    inner: DecrementAny<'a>,
}

impl<'a, T> TakeAny<'a, T> {
    /// Resolve with [`TakeError::Cancelled`] if `token` fires first.
    pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
        self.inner = self.inner.cancel_on(token);
        self
    }

    /// Resolve with [`TakeError::TimedOut`] if `duration` elapses first.
    pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
        self.inner = self.inner.deadline(timer, duration);
        self
    }
}

impl<T> Future for TakeAny<'_, T> {
    type Output = Result<Option<(usize, T)>, TakeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match core::task::ready!(this.inner.poll(cx)) {
            Ok(Some(index)) => {
                let item = this.queues[index].consume();
                Poll::Ready(Ok(Some((index, item))))
            }
            Ok(None) => Poll::Ready(Ok(None)),
            Err(err) => Poll::Ready(Err(TakeError::from_acquire(err))),
        }
    }
}

impl<T> fmt::Debug for TakeAny<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TakeAny")
            .field("queues", &self.queues.len())
            .finish()
    }
}

// === impl AddAny ===

/// Future returned by [`Queue::add_any`].
///
/// `Ok(Some(index))` names the queue that accepted the item; `Ok(None)`
/// hands the item back for an empty input set.
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct AddAny<'a, T> {
    queues: Vec<&'a Queue<T>>,
    item: Option<T>,
    cancel: Option<&'a CancelToken>,
    deadline: Option<(&'a Timer, Duration)>,
    /// Rebuilt when the winning queue turns out to have completed adding
    /// mid-race, so the limits are kept beside it instead of inside it.
    #[pin]
    inner: Option<DecrementAny<'a>>,
}

impl<'a, T> AddAny<'a, T> {
    /// Resolve with [`AddError::Cancelled`] if `token` fires first.
    pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Resolve with [`AddError::TimedOut`] if `duration` elapses first.
    pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
        self.deadline = Some((timer, duration));
        self
    }

    fn rearm(
        queues: &[&'a Queue<T>],
        cancel: Option<&'a CancelToken>,
        deadline: Option<(&'a Timer, Duration)>,
    ) -> DecrementAny<'a> {
        let counters: Vec<&'a Counter> = queues.iter().map(|queue| &queue.free).collect();
        let mut inner = Counter::decrement_any(&counters);
        if let Some(token) = cancel {
            inner = inner.cancel_on(token);
        }
        if let Some((timer, duration)) = deadline {
            inner = inner.deadline(timer, duration);
        }
        inner
    }
}

impl<T> Future for AddAny<'_, T> {
    type Output = Result<Option<usize>, AddError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            if this.inner.is_none() {
                let inner = Self::rearm(this.queues, *this.cancel, *this.deadline);
                this.inner.set(Some(inner));
            }
            let poll = this
                .inner
                .as_mut()
                .as_pin_mut()
                .expect("inner was just armed")
                .poll(cx);
            match core::task::ready!(poll) {
                Ok(Some(index)) => {
                    let queue = this.queues[index];
                    let item = this.item.take().expect("AddAny polled after completion");
                    queue.in_flight_adds.fetch_add(1, Ordering::SeqCst);
                    if queue.is_adding_complete() {
                        // this queue completed mid-race; refund and race the
                        // remaining queues again
                        queue.free.force_increment();
                        queue.in_flight_adds.fetch_sub(1, Ordering::SeqCst);
                        queue.maybe_drain();
                        *this.item = Some(item);
                        this.inner.set(None);
                        continue;
                    }
                    queue.publish(item);
                    queue.in_flight_adds.fetch_sub(1, Ordering::SeqCst);
                    return Poll::Ready(Ok(Some(index)));
                }
                Ok(None) => return Poll::Ready(Ok(None)),
                Err(err) => {
                    let item = this.item.take().expect("AddAny polled after completion");
                    return Poll::Ready(Err(AddError::from_acquire(err, item)));
                }
            }
        }
    }
}

impl<T> fmt::Debug for AddAny<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddAny")
            .field("queues", &self.queues.len())
            .finish()
    }
}

// === impl Buffer ===

/// The fixed MPMC ring the queue stores items in.
///
/// Slot availability is accounted for externally by the `free`/`used`
/// counters: a caller never pushes without a free-slot reservation or pops
/// without a used count, so both operations are guaranteed to find their
/// slot and only spin for the brief window in which a peer is mid-publish.
struct Buffer<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    capacity: usize,
    slots: Box<[BufferSlot<T>]>,
}

struct BufferSlot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|i| BufferSlot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            capacity,
            slots,
        }
    }

    fn push(&self, item: T) {
        let pos = self.tail.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[pos & (self.capacity - 1)];
        let backoff = Backoff::new();
        while slot.seq.load(Ordering::Acquire) != pos {
            // the consumer of the previous lap is mid-pop
            backoff.snooze();
        }
        slot.value.with_mut(|value| {
            // Safety: the sequence number proves the slot is vacant and ours.
            unsafe { (*value).write(item) };
        });
        slot.seq.store(pos + 1, Ordering::Release);
    }

    fn pop(&self) -> T {
        let pos = self.head.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[pos & (self.capacity - 1)];
        let backoff = Backoff::new();
        while slot.seq.load(Ordering::Acquire) != pos + 1 {
            // the producer is mid-publish
            backoff.snooze();
        }
        let item = slot.value.with_mut(|value| {
            // Safety: the sequence number proves the slot holds an item that
            // is now exclusively ours.
            unsafe { (*value).assume_init_read() }
        });
        slot.seq.store(pos + self.capacity, Ordering::Release);
        item
    }
}

impl<T> Drop for Buffer<T> {
    fn drop(&mut self) {
        // drop the items still sitting between head and tail
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        for pos in head..tail {
            let slot = &self.slots[pos & (self.capacity - 1)];
            slot.value.with_mut(|value| {
                // Safety: positions in [head, tail) were published and never
                // popped.
                unsafe { (*value).assume_init_drop() };
            });
        }
    }
}

// Safety: items are handed between threads through the sequence-number
// protocol; a slot is accessed exclusively by whoever it is sequenced for.
unsafe impl<T: Send> Send for Buffer<T> {}
// Safety: as above.
unsafe impl<T: Send> Sync for Buffer<T> {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok};

    #[test]
    fn backpressure_round_trip() {
        let queue = Queue::bounded(2);
        queue.try_add(1).unwrap();
        queue.try_add(2).unwrap();
        assert_eq!(queue.len(), 2);

        // the third add suspends on back-pressure
        let mut add3 = tokio_test::task::spawn(queue.add(3));
        assert_pending!(add3.poll());

        assert_eq!(queue.try_take(), Some(1));
        assert!(add3.is_woken());
        assert_ready_ok!(add3.poll());

        assert_eq!(queue.try_take(), Some(2));
        assert_eq!(queue.try_take(), Some(3));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.try_take(), None);
    }

    #[test]
    fn take_waits_for_an_add() {
        let queue = Queue::bounded(4);
        let mut take = tokio_test::task::spawn(queue.take());
        assert_pending!(take.poll());

        queue.try_add("hello").unwrap();
        assert!(take.is_woken());
        assert_eq!(assert_ready_ok!(take.poll()), "hello");
    }

    #[test]
    fn fifo_per_producer() {
        let queue = Queue::bounded(8);
        for i in 0..8 {
            queue.try_add(i).unwrap();
        }
        let drained: Vec<i32> = core::iter::from_fn(|| queue.try_take()).collect();
        assert_eq!(drained, [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn conservation_of_slots() {
        let queue = Queue::bounded(4);
        queue.try_add(1).unwrap();
        queue.try_add(2).unwrap();
        // free + used = capacity at quiescence
        assert_eq!(queue.free.count() + queue.used.count(), 4);
        queue.try_take().unwrap();
        assert_eq!(queue.free.count() + queue.used.count(), 4);
    }

    #[test]
    fn complete_adding_fails_pending_adds_and_drains() {
        let queue = Queue::bounded(1);
        queue.try_add(10).unwrap();

        let mut blocked = tokio_test::task::spawn(queue.add(20));
        assert_pending!(blocked.poll());

        queue.complete_adding();
        assert!(queue.is_adding_complete());
        assert!(matches!(
            assert_ready_err!(blocked.poll()),
            AddError::Completed(20)
        ));
        assert!(matches!(queue.try_add(30), Err(TryAddError::Completed(30))));

        // the remaining item is still takeable
        assert_eq!(queue.try_take(), Some(10));

        // and now the queue is drained
        let mut take = tokio_test::task::spawn(queue.take());
        assert_eq!(assert_ready_err!(take.poll()), TakeError::Completed);
    }

    #[test]
    fn complete_adding_on_empty_queue_drains_immediately() {
        let queue = Queue::<u32>::bounded(2);
        let mut take = tokio_test::task::spawn(queue.take());
        assert_pending!(take.poll());

        queue.complete_adding();
        assert!(take.is_woken());
        assert_eq!(assert_ready_err!(take.poll()), TakeError::Completed);
    }

    #[test]
    fn add_many_is_atomic() {
        let queue = Queue::bounded(4);
        queue.try_add(0).unwrap();
        queue.try_add(0).unwrap();
        queue.try_add(0).unwrap();

        // three slots are taken; a batch of two must wait for both
        let mut batch = tokio_test::task::spawn(queue.add_many(vec![8, 9]));
        assert_pending!(batch.poll());

        queue.try_take().unwrap();
        assert_pending!(batch.poll());
        queue.try_take().unwrap();
        assert!(batch.is_woken());
        assert_ready_ok!(batch.poll());

        assert_eq!(queue.try_take(), Some(0));
        assert_eq!(queue.try_take(), Some(8));
        assert_eq!(queue.try_take(), Some(9));
    }

    #[test]
    fn cancelled_add_returns_the_item() {
        let queue = Queue::bounded(1);
        queue.try_add(1).unwrap();
        let source = CancelSource::new();
        let token = source.token();

        let mut add = tokio_test::task::spawn(queue.add(2).cancel_on(&token));
        assert_pending!(add.poll());

        source.cancel();
        let err = assert_ready_err!(add.poll());
        assert_eq!(err.into_inner(), 2);
    }

    #[test]
    fn take_any_picks_the_first_ready_queue() {
        let a = Queue::bounded(2);
        let b = Queue::bounded(2);
        let queues = [&a, &b];

        let mut any = tokio_test::task::spawn(Queue::take_any(&queues));
        assert_pending!(any.poll());

        b.try_add(42).unwrap();
        assert!(any.is_woken());
        let (index, item) = assert_ready_ok!(any.poll()).unwrap();
        assert_eq!((index, item), (1, 42));
        assert!(b.is_empty());
    }

    #[test]
    fn take_any_empty_input_returns_none() {
        let mut any = tokio_test::task::spawn(Queue::<u32>::take_any(&[]));
        assert_eq!(assert_ready_ok!(any.poll()), None);
    }

    #[test]
    fn add_any_prefers_the_lowest_free_queue() {
        let a = Queue::bounded(1);
        let b = Queue::bounded(1);
        a.try_add(0).unwrap(); // a is full
        let queues = [&a, &b];

        let mut any = tokio_test::task::spawn(Queue::add_any(&queues, 7));
        assert_eq!(assert_ready_ok!(any.poll()), Some(1));
        assert_eq!(b.try_take(), Some(7));
    }

    #[test]
    fn add_any_skips_a_queue_that_completed_mid_race() {
        let a = Queue::bounded(1);
        let b = Queue::bounded(1);
        a.try_add(0).unwrap();
        b.try_add(0).unwrap();
        let queues = [&a, &b];

        let mut any = tokio_test::task::spawn(Queue::add_any(&queues, 7));
        assert_pending!(any.poll());

        // a frees a slot but completes before the racer publishes? the racer
        // never observes a completed queue as its winner
        a.complete_adding();
        b.try_take().unwrap();
        assert_eq!(assert_ready_ok!(any.poll()), Some(1));
        assert_eq!(b.try_take(), Some(7));
    }

    #[test]
    fn threaded_producers_and_consumers_conserve_items() {
        use crate::loom::thread;
        use std::sync::Arc;

        let queue = Arc::new(Queue::bounded(4));
        const PER_PRODUCER: usize = 200;
        const PRODUCERS: usize = 3;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut item = p * PER_PRODUCER + i;
                        loop {
                            match queue.try_add(item) {
                                Ok(()) => break,
                                Err(TryAddError::Full(back)) => {
                                    item = back;
                                    std::thread::yield_now();
                                }
                                Err(TryAddError::Completed(_)) => unreachable!(),
                            }
                        }
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while seen.len() < PRODUCERS * PER_PRODUCER {
            match queue.try_take() {
                Some(item) => seen.push(item),
                None => std::thread::yield_now(),
            }
        }
        for p in producers {
            p.join().unwrap();
        }

        // every item exactly once, FIFO per producer
        for p in 0..PRODUCERS {
            let per: Vec<usize> = seen
                .iter()
                .copied()
                .filter(|item| item / PER_PRODUCER == p)
                .collect();
            assert_eq!(per.len(), PER_PRODUCER);
            let mut sorted = per.clone();
            sorted.sort_unstable();
            assert_eq!(per, sorted, "producer {p} was reordered");
        }
        assert!(queue.is_empty());
    }
}
