// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An awaitable non-negative counter.
//!
//! The counter is the root of the capacity protocol every other primitive in
//! this crate composes over: a semaphore is a counter of permits, the bounded
//! queue is a pair of counters over a buffer. Decrements wait FIFO for
//! increments; peek-decrements wait without consuming and are released en
//! masse whenever the count becomes visible.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use pin_project::{pin_project, pinned_drop};

use crate::cancel::{CancelToken, Harness};
use crate::error::{AcquireError, Closed};
use crate::loom::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, Ordering};
use crate::time::Timer;
use crate::wait::{Phase, WaitQueue, Waiter, pool};

/// A non-negative counter with awaitable decrement.
///
/// # Closing
///
/// [`close`][Counter::close] is terminal: pending waiters fail with
/// [`AcquireError::Closed`] and new awaitable operations fail fast. The live
/// count at close time remains consumable through
/// [`try_decrement`][Counter::try_decrement], which is what lets a draining
/// collection hand out its remaining items after its producer side shuts
/// down.
pub struct Counter {
    /// `>= 0` is the live count. Closing bit-complements the value, so a
    /// closed counter still carries its remaining live count as `!value`
    /// (`-1` is closed-and-empty).
    value: CachePadded<AtomicIsize>,
    decrementers: WaitQueue,
    peekers: WaitQueue,
    /// The head decrement, popped by the dispatcher but not yet servable
    /// (its batch exceeds the available count). Logically still first in
    /// line; only the active dispatcher touches it.
    parked: AtomicPtr<Waiter>,
    /// Turnstile: at most one thread runs the handoff loop at a time.
    /// Late releasers delegate to it instead of waiting, and it re-checks
    /// for their count before leaving.
    dispatching: AtomicBool,
}

#[inline]
fn live(value: isize) -> usize {
    let live = if value >= 0 { value } else { !value };
    #[expect(clippy::cast_sign_loss, reason = "non-negative by construction")]
    let live = live as usize;
    live
}

#[inline]
fn encode(live: usize, closed: bool) -> isize {
    #[expect(clippy::cast_possible_wrap, reason = "counts stay far below isize::MAX")]
    let live = live as isize;
    if closed { !live } else { live }
}

// === impl Counter ===

impl Counter {
    pub fn new(initial: usize) -> Self {
        Self {
            value: CachePadded::new(AtomicIsize::new(encode(initial, false))),
            decrementers: WaitQueue::new(),
            peekers: WaitQueue::new(),
            parked: AtomicPtr::new(core::ptr::null_mut()),
            dispatching: AtomicBool::new(false),
        }
    }

    /// The current live count.
    pub fn count(&self) -> usize {
        live(self.value.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.value.load(Ordering::SeqCst) < 0
    }

    /// Consume one count if it is immediately available.
    ///
    /// Fails when the count is zero *or* earlier decrements are still
    /// queued; jumping ahead of them would break FIFO.
    pub fn try_decrement(&self) -> bool {
        self.try_decrement_n(1)
    }

    /// Consume `n` counts atomically if immediately available.
    pub fn try_decrement_n(&self, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        let mut value = self.value.load(Ordering::SeqCst);
        loop {
            if live(value) < n || self.has_waiters() {
                return false;
            }
            match self.value.compare_exchange(
                value,
                encode(live(value) - n, value < 0),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => value = actual,
            }
        }
    }

    /// Wait to consume one count.
    pub fn decrement(&self) -> Decrement<'_> {
        self.decrement_n(1)
    }

    /// Wait to consume `n` counts atomically.
    pub fn decrement_n(&self, n: usize) -> Decrement<'_> {
        Decrement {
            counter: self,
            n,
            waiter: None,
            harness: Harness::new(),
            done: false,
        }
    }

    /// Succeeds when a decrement would currently succeed, without consuming.
    pub fn try_peek_decrement(&self) -> bool {
        self.count() > 0
    }

    /// Wait until a decrement would succeed, without consuming the count.
    pub fn peek_decrement(&self) -> PeekDecrement<'_> {
        PeekDecrement {
            counter: self,
            waiter: None,
            harness: Harness::new(),
            done: false,
        }
    }

    /// Add one count, handing it to the longest-waiting decrement if any.
    ///
    /// # Errors
    ///
    /// Fails with [`Closed`] if the counter was closed.
    pub fn increment(&self) -> Result<(), Closed> {
        self.increment_n(1)
    }

    /// Add `n` counts.
    ///
    /// # Errors
    ///
    /// Fails with [`Closed`] if the counter was closed.
    pub fn increment_n(&self, n: usize) -> Result<(), Closed> {
        let mut value = self.value.load(Ordering::SeqCst);
        loop {
            if value < 0 {
                return Err(Closed(()));
            }
            match self.value.compare_exchange(
                value,
                encode(live(value) + n, false),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => value = actual,
            }
        }
        self.notify();
        Ok(())
    }

    /// Like [`increment`][Counter::increment], returning `false` when closed.
    pub fn try_increment(&self) -> bool {
        self.increment().is_ok()
    }

    /// Add one count even when the counter is closed.
    ///
    /// This is the rollback path used when capacity was reserved for a waiter
    /// that turned out to be cancelled, and the counter may have been closed
    /// in between.
    pub fn force_increment(&self) {
        self.force_increment_n(1);
    }

    /// Add `n` counts even when the counter is closed.
    pub fn force_increment_n(&self, n: usize) {
        self.add_quiet(n);
        self.notify();
    }

    /// Close the counter.
    ///
    /// Terminal and idempotent. All pending decrements and peeks fail with
    /// [`AcquireError::Closed`]; the residual count stays recoverable through
    /// the `try_` forms.
    pub fn close(&self) {
        let closed_now = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                (value >= 0).then_some(!value)
            })
            .is_ok();
        if closed_now {
            tracing::trace!("counter closed");
            self.fail_pending(&self.peekers);
            // the dispatcher drains the decrement side, parked head included
            self.restock();
        }
    }

    /// Wait for a count on whichever of `counters` becomes decrementable
    /// first, consuming exactly one count from exactly one counter.
    ///
    /// Ties are deterministic: the lowest index wins. An empty slice
    /// completes immediately with `Ok(None)`.
    pub fn decrement_any<'a>(counters: &[&'a Counter]) -> DecrementAny<'a> {
        DecrementAny {
            counters: counters.to_vec(),
            waiters: Vec::new(),
            armed: false,
            harness: Harness::new(),
            done: false,
        }
    }

    /// Reserve `n` counts ignoring queued waiters; the restock path uses
    /// this after it has already established who is at the head.
    fn try_take_n(&self, n: usize) -> bool {
        let mut value = self.value.load(Ordering::SeqCst);
        loop {
            if live(value) < n {
                return false;
            }
            match self.value.compare_exchange(
                value,
                encode(live(value) - n, value < 0),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => value = actual,
            }
        }
    }

    /// Add without waking anyone; used to refund a failed reservation while
    /// already inside the restock loop.
    fn add_quiet(&self, n: usize) {
        let mut value = self.value.load(Ordering::SeqCst);
        loop {
            match self.value.compare_exchange(
                value,
                encode(live(value) + n, value < 0),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => value = actual,
            }
        }
    }

    /// Move available count to queued decrements and release peekers.
    fn notify(&self) {
        self.restock();
        if self.count() > 0 {
            self.release_peekers();
        }
    }

    /// `true` while any decrement is in line, parked head included.
    ///
    /// An active dispatch counts too: a head it has popped but not yet
    /// parked is invisible to both the queue and the parking slot, and
    /// `try_decrement` must not slip past it in that window.
    fn has_waiters(&self) -> bool {
        !self.parked.load(Ordering::SeqCst).is_null()
            || self.dispatching.load(Ordering::SeqCst)
            || !self.decrementers.is_empty()
    }

    /// Hand available count to queued decrements, FIFO.
    ///
    /// At most one thread dispatches at a time: whoever wins the turnstile
    /// pops the head, reserves its batch, and completes it; a head whose
    /// batch exceeds the available count is parked (it stays logically
    /// first) until more count arrives. Losers of the turnstile leave
    /// immediately — the active dispatcher re-checks for their count before
    /// exiting, so no wakeup is lost and nobody ever waits here.
    fn restock(&self) {
        loop {
            if self.dispatching.swap(true, Ordering::SeqCst) {
                // an active dispatcher will observe our count on its way out
                return;
            }

            let mut blocked_need = None;
            loop {
                let Some(waiter) = self.take_head() else { break };
                if self.is_closed() {
                    if waiter.transition(Phase::Closed) {
                        waiter.wake();
                    }
                    pool::release(waiter);
                    continue;
                }
                let n = waiter.tag();
                if !self.try_take_n(n) {
                    // FIFO forbids serving anyone past the blocked head
                    blocked_need = Some(n);
                    self.park_head(waiter);
                    break;
                }
                if waiter.transition(Phase::Completed) {
                    waiter.wake();
                } else {
                    // lost to a concurrent cancellation; refund
                    self.add_quiet(n);
                }
                pool::release(waiter);
            }

            self.dispatching.store(false, Ordering::SeqCst);

            // count may have arrived (or close may have fired) while we were
            // closing up; leaving without this re-check would strand it
            let again = if self.is_closed() {
                self.has_waiters()
            } else if let Some(need) = blocked_need {
                self.count() >= need
            } else {
                self.has_waiters() && self.count() > 0
            };
            if !again {
                return;
            }
        }
    }

    /// Take the next decrement in line: the parked head if there is one,
    /// otherwise the queue head. Dispatcher-only.
    fn take_head(&self) -> Option<Arc<Waiter>> {
        let raw = self.parked.swap(core::ptr::null_mut(), Ordering::SeqCst);
        if !raw.is_null() {
            // Safety: parking stored this pointer with `Arc::into_raw`.
            return Some(unsafe { Arc::from_raw(raw) });
        }
        self.decrementers.pop()
    }

    /// Dispatcher-only.
    fn park_head(&self, waiter: Arc<Waiter>) {
        let prev = self
            .parked
            .swap(Arc::into_raw(waiter).cast_mut(), Ordering::SeqCst);
        debug_assert!(prev.is_null(), "only one head can be parked");
    }

    /// Complete every queued peeker; the count is observably positive.
    fn release_peekers(&self) {
        while let Some(waiter) = self.peekers.pop() {
            if waiter.transition(Phase::Completed) {
                waiter.wake();
            }
            pool::release(waiter);
        }
    }

    /// Fail every waiter on `queue` with [`Phase::Closed`].
    fn fail_pending(&self, queue: &WaitQueue) {
        while let Some(waiter) = queue.pop() {
            if waiter.transition(Phase::Closed) {
                waiter.wake();
            }
            pool::release(waiter);
        }
    }

    /// Re-run the producer path after an enqueue; an increment (or close) may
    /// have raced between the failed fast path and the push.
    fn after_enqueue(&self, queue: &WaitQueue) {
        if core::ptr::eq(queue, &self.decrementers) {
            self.restock();
        } else if self.is_closed() {
            self.fail_pending(queue);
        } else if self.count() > 0 {
            self.release_peekers();
        }
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        let raw = self.parked.swap(core::ptr::null_mut(), Ordering::SeqCst);
        if !raw.is_null() {
            // Safety: parking stored this pointer with `Arc::into_raw`.
            pool::release(unsafe { Arc::from_raw(raw) });
        }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("count", &self.count())
            .field("is_closed", &self.is_closed())
            .field("waiting", &self.has_waiters())
            .finish()
    }
}

// === impl Decrement ===

/// Future returned by [`Counter::decrement`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Decrement<'a> {
    counter: &'a Counter,
    n: usize,
    waiter: Option<Arc<Waiter>>,
    #[pin]
    harness: Harness<'a>,
    done: bool,
}

impl<'a> Decrement<'a> {
    /// Resolve with [`AcquireError::Cancelled`] if `token` fires first.
    pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
        self.harness.set_cancel(token);
        self
    }

    /// Resolve with [`AcquireError::TimedOut`] if `duration` elapses first.
    /// A zero duration makes the operation try-only.
    pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
        self.harness.set_deadline(timer, duration);
        self
    }
}

impl Future for Decrement<'_> {
    type Output = Result<(), AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        debug_assert!(!*this.done, "Decrement polled after completion");

        if this.waiter.is_none() {
            if this.counter.try_decrement_n(*this.n) {
                *this.done = true;
                return Poll::Ready(Ok(()));
            }
            if this.harness.immediate {
                *this.done = true;
                return Poll::Ready(Err(AcquireError::TimedOut));
            }
            if this.counter.is_closed() {
                *this.done = true;
                return Poll::Ready(Err(AcquireError::Closed));
            }
            let waiter = pool::checkout(*this.n);
            this.counter.decrementers.push(&waiter);
            *this.waiter = Some(waiter);
            this.counter.after_enqueue(&this.counter.decrementers);
        }

        loop {
            let ready = {
                let waiter = this.waiter.as_ref().expect("waiter must be armed");
                match waiter.poll_ready(cx) {
                    Poll::Ready(phase) => Some(phase),
                    Poll::Pending => None,
                }
            };
            if let Some(phase) = ready {
                let waiter = this.waiter.take().expect("waiter must be armed");
                pool::release(waiter);
                *this.done = true;
                return Poll::Ready(match phase {
                    Phase::Completed => Ok(()),
                    phase => Err(phase.as_error().expect("phase must be terminal")),
                });
            }

            match this.harness.as_mut().poll_limits(cx) {
                Poll::Ready(reason) => {
                    let won = this
                        .waiter
                        .as_ref()
                        .expect("waiter must be armed")
                        .transition(reason);
                    if won {
                        let waiter = this.waiter.take().expect("waiter must be armed");
                        this.counter.decrementers.erase(&waiter);
                        pool::release(waiter);
                        // with this waiter out of line, a smaller batch
                        // behind it may fit the available count
                        this.counter.restock();
                        *this.done = true;
                        return Poll::Ready(Err(reason.as_error().expect("phase must be terminal")));
                    }
                    // a producer beat the cancellation; observe its outcome
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for Decrement<'_> {
    fn drop(mut self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(waiter) = this.waiter.take() {
            if waiter.transition(Phase::Cancelled) {
                this.counter.decrementers.erase(&waiter);
                this.counter.restock();
            } else if waiter.phase() == Phase::Completed {
                // the producer handed us count that was never consumed
                this.counter.force_increment_n(*this.n);
            }
            pool::release(waiter);
        }
    }
}

impl fmt::Debug for Decrement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decrement")
            .field("n", &self.n)
            .field("waiting", &self.waiter.is_some())
            .finish()
    }
}

// === impl PeekDecrement ===

/// Future returned by [`Counter::peek_decrement`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct PeekDecrement<'a> {
    counter: &'a Counter,
    waiter: Option<Arc<Waiter>>,
    #[pin]
    harness: Harness<'a>,
    done: bool,
}

impl<'a> PeekDecrement<'a> {
    /// Resolve with [`AcquireError::Cancelled`] if `token` fires first.
    pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
        self.harness.set_cancel(token);
        self
    }

    /// Resolve with [`AcquireError::TimedOut`] if `duration` elapses first.
    pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
        self.harness.set_deadline(timer, duration);
        self
    }
}

impl Future for PeekDecrement<'_> {
    type Output = Result<(), AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        debug_assert!(!*this.done, "PeekDecrement polled after completion");

        if this.waiter.is_none() {
            if this.counter.try_peek_decrement() {
                *this.done = true;
                return Poll::Ready(Ok(()));
            }
            if this.harness.immediate {
                *this.done = true;
                return Poll::Ready(Err(AcquireError::TimedOut));
            }
            if this.counter.is_closed() {
                *this.done = true;
                return Poll::Ready(Err(AcquireError::Closed));
            }
            let waiter = pool::checkout(0);
            this.counter.peekers.push(&waiter);
            *this.waiter = Some(waiter);
            this.counter.after_enqueue(&this.counter.peekers);
        }

        loop {
            let ready = {
                let waiter = this.waiter.as_ref().expect("waiter must be armed");
                match waiter.poll_ready(cx) {
                    Poll::Ready(phase) => Some(phase),
                    Poll::Pending => None,
                }
            };
            if let Some(phase) = ready {
                let waiter = this.waiter.take().expect("waiter must be armed");
                pool::release(waiter);
                *this.done = true;
                return Poll::Ready(match phase {
                    Phase::Completed => Ok(()),
                    phase => Err(phase.as_error().expect("phase must be terminal")),
                });
            }

            match this.harness.as_mut().poll_limits(cx) {
                Poll::Ready(reason) => {
                    let won = this
                        .waiter
                        .as_ref()
                        .expect("waiter must be armed")
                        .transition(reason);
                    if won {
                        let waiter = this.waiter.take().expect("waiter must be armed");
                        this.counter.peekers.erase(&waiter);
                        pool::release(waiter);
                        *this.done = true;
                        return Poll::Ready(Err(reason.as_error().expect("phase must be terminal")));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for PeekDecrement<'_> {
    fn drop(mut self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(waiter) = this.waiter.take() {
            if waiter.transition(Phase::Cancelled) {
                this.counter.peekers.erase(&waiter);
            }
            // an unconsumed peek completion needs no rollback; peeks never
            // take the count
            pool::release(waiter);
        }
    }
}

impl fmt::Debug for PeekDecrement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeekDecrement")
            .field("waiting", &self.waiter.is_some())
            .finish()
    }
}

// === impl DecrementAny ===

/// Future returned by [`Counter::decrement_any`].
///
/// Completes with `Ok(Some(index))` once one counter's count was consumed,
/// `Ok(None)` for an empty input set, or `Err(AcquireError::Closed)` once
/// every counter is closed.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct DecrementAny<'a> {
    counters: Vec<&'a Counter>,
    /// One optional peek waiter per counter, armed lazily.
    waiters: Vec<Option<Arc<Waiter>>>,
    armed: bool,
    #[pin]
    harness: Harness<'a>,
    done: bool,
}

impl<'a> DecrementAny<'a> {
    /// Resolve with [`AcquireError::Cancelled`] if `token` fires first.
    pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
        self.harness.set_cancel(token);
        self
    }

    /// Resolve with [`AcquireError::TimedOut`] if `duration` elapses first.
    pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
        self.harness.set_deadline(timer, duration);
        self
    }

    fn disarm(counters: &[&Counter], waiters: &mut [Option<Arc<Waiter>>]) {
        for (counter, slot) in counters.iter().zip(waiters.iter_mut()) {
            if let Some(waiter) = slot.take() {
                if waiter.transition(Phase::Cancelled) {
                    counter.peekers.erase(&waiter);
                }
                pool::release(waiter);
            }
        }
    }
}

impl Future for DecrementAny<'_> {
    type Output = Result<Option<usize>, AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        debug_assert!(!*this.done, "DecrementAny polled after completion");

        if this.counters.is_empty() {
            *this.done = true;
            return Poll::Ready(Ok(None));
        }
        if !*this.armed {
            this.waiters.resize_with(this.counters.len(), || None);
            *this.armed = true;
        }

        loop {
            // lowest index wins ties, deterministically
            for (i, counter) in this.counters.iter().enumerate() {
                if counter.try_decrement() {
                    Self::disarm(this.counters, this.waiters);
                    *this.done = true;
                    return Poll::Ready(Ok(Some(i)));
                }
            }

            if this.harness.immediate {
                Self::disarm(this.counters, this.waiters);
                *this.done = true;
                return Poll::Ready(Err(AcquireError::TimedOut));
            }

            // pump the peek waiters, re-arming fired ones on the next pass
            let mut fired = false;
            for (i, counter) in this.counters.iter().enumerate() {
                let slot = &mut this.waiters[i];
                if slot.is_none() {
                    if counter.is_closed() {
                        continue;
                    }
                    let waiter = pool::checkout(0);
                    counter.peekers.push(&waiter);
                    *slot = Some(waiter);
                    counter.after_enqueue(&counter.peekers);
                }
                let phase = {
                    let waiter = slot.as_ref().expect("slot was just armed");
                    match waiter.poll_ready(cx) {
                        Poll::Ready(phase) => Some(phase),
                        Poll::Pending => None,
                    }
                };
                match phase {
                    Some(Phase::Completed) => {
                        pool::release(slot.take().expect("slot was armed"));
                        fired = true;
                    }
                    Some(Phase::Closed) => {
                        pool::release(slot.take().expect("slot was armed"));
                    }
                    Some(phase) => unreachable!("unexpected peek waiter phase {phase:?}"),
                    None => {}
                }
            }
            if fired {
                // somebody released count since our scan; try again
                continue;
            }

            if this.counters.iter().all(|counter| counter.is_closed()) {
                *this.done = true;
                return Poll::Ready(Err(AcquireError::Closed));
            }

            match this.harness.as_mut().poll_limits(cx) {
                Poll::Ready(reason) => {
                    Self::disarm(this.counters, this.waiters);
                    *this.done = true;
                    return Poll::Ready(Err(reason.as_error().expect("phase must be terminal")));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for DecrementAny<'_> {
    fn drop(mut self: Pin<&mut Self>) {
        let this = self.project();
        Self::disarm(this.counters, this.waiters);
    }
}

impl fmt::Debug for DecrementAny<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecrementAny")
            .field("counters", &self.counters.len())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use crate::time::Clock;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok};

    #[test]
    fn fast_path_decrements_synchronously() {
        let counter = Counter::new(2);
        assert!(counter.try_decrement());
        assert_eq!(counter.count(), 1);

        let mut fut = tokio_test::task::spawn(counter.decrement());
        assert_ready_ok!(fut.poll());
        assert_eq!(counter.count(), 0);
        assert!(!counter.try_decrement());
    }

    #[test]
    fn waiters_complete_fifo() {
        let counter = Counter::new(0);

        let mut a = tokio_test::task::spawn(counter.decrement());
        let mut b = tokio_test::task::spawn(counter.decrement());
        let mut c = tokio_test::task::spawn(counter.decrement());
        assert_pending!(a.poll());
        assert_pending!(b.poll());
        assert_pending!(c.poll());

        // try_decrement must not jump the queue
        counter.increment().unwrap();
        assert_eq!(counter.count(), 0, "count went straight to the head waiter");

        assert!(a.is_woken());
        assert!(!b.is_woken());
        assert_ready_ok!(a.poll());
        assert_pending!(b.poll());

        counter.increment().unwrap();
        counter.increment().unwrap();
        assert_ready_ok!(b.poll());
        assert_ready_ok!(c.poll());
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn cancelled_waiter_is_skipped() {
        let counter = Counter::new(0);
        let source = CancelSource::new();
        let token = source.token();

        let mut a = tokio_test::task::spawn(counter.decrement().cancel_on(&token));
        let mut b = tokio_test::task::spawn(counter.decrement());
        let mut c = tokio_test::task::spawn(counter.decrement());
        assert_pending!(a.poll());
        assert_pending!(b.poll());
        assert_pending!(c.poll());

        source.cancel();
        assert_ready_err!(a.poll());

        counter.increment().unwrap();
        assert_ready_ok!(b.poll());
        assert_pending!(c.poll());
        counter.increment().unwrap();
        assert_ready_ok!(c.poll());
    }

    #[test]
    fn delivered_count_beats_late_cancellation() {
        let counter = Counter::new(0);
        let source = CancelSource::new();
        let token = source.token();

        let mut fut = tokio_test::task::spawn(counter.decrement().cancel_on(&token));
        assert_pending!(fut.poll());

        counter.increment().unwrap();
        source.cancel();
        // the release was already delivered; it wins deterministically
        assert_ready_ok!(fut.poll());
    }

    #[test]
    fn dropped_waiter_forfeits_its_place() {
        let counter = Counter::new(0);
        let mut a = tokio_test::task::spawn(counter.decrement());
        let mut b = tokio_test::task::spawn(counter.decrement());
        assert_pending!(a.poll());
        assert_pending!(b.poll());

        drop(a);
        counter.increment().unwrap();
        assert_ready_ok!(b.poll());
    }

    #[test]
    fn unconsumed_completion_is_rolled_back() {
        let counter = Counter::new(0);
        let mut fut = tokio_test::task::spawn(counter.decrement());
        assert_pending!(fut.poll());

        counter.increment().unwrap();
        assert_eq!(counter.count(), 0, "count was handed to the waiter");

        // the waiter was completed but its future is dropped unconsumed
        drop(fut);
        assert_eq!(counter.count(), 1, "unconsumed count must be returned");
    }

    #[test]
    fn close_fails_pending_waiters() {
        let counter = Counter::new(0);
        let mut fut = tokio_test::task::spawn(counter.decrement());
        assert_pending!(fut.poll());

        counter.close();
        assert!(fut.is_woken());
        assert_eq!(assert_ready_err!(fut.poll()), AcquireError::Closed);

        // closing again is a no-op
        counter.close();
        assert!(counter.is_closed());

        let mut late = tokio_test::task::spawn(counter.decrement());
        assert_ready_err!(late.poll());
    }

    #[test]
    fn residual_count_survives_close() {
        let counter = Counter::new(3);
        counter.close();
        assert!(counter.is_closed());
        assert_eq!(counter.count(), 3);

        assert!(counter.try_decrement());
        assert_eq!(counter.count(), 2);
        assert!(!counter.try_increment());
        counter.force_increment();
        assert_eq!(counter.count(), 3);
    }

    #[test]
    fn zero_deadline_is_try_only() {
        let clock = Clock::manual();
        let timer = Timer::new(clock);
        let counter = Counter::new(0);

        let mut fut =
            tokio_test::task::spawn(counter.decrement().deadline(&timer, Duration::ZERO));
        assert_eq!(assert_ready_err!(fut.poll()), AcquireError::TimedOut);

        counter.increment().unwrap();
        let mut fut =
            tokio_test::task::spawn(counter.decrement().deadline(&timer, Duration::ZERO));
        assert_ready_ok!(fut.poll());
    }

    #[test]
    fn deadline_elapses_into_timeout() {
        let clock = Clock::manual();
        let timer = Timer::new(clock.clone());
        let counter = Counter::new(0);

        let mut fut = tokio_test::task::spawn(
            counter.decrement().deadline(&timer, Duration::from_millis(5)),
        );
        assert_pending!(fut.poll());

        clock.advance(Duration::from_millis(5));
        timer.turn();
        assert!(fut.is_woken());
        assert_eq!(assert_ready_err!(fut.poll()), AcquireError::TimedOut);
        drop(fut);

        // the timed-out waiter was erased; a fresh increment is not consumed
        // by a ghost
        counter.increment().unwrap();
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn peek_does_not_consume() {
        let counter = Counter::new(0);
        let mut peek = tokio_test::task::spawn(counter.peek_decrement());
        assert_pending!(peek.poll());

        counter.increment().unwrap();
        assert!(peek.is_woken());
        assert_ready_ok!(peek.poll());
        assert_eq!(counter.count(), 1, "peek must not consume the count");

        assert!(counter.try_peek_decrement());
        assert!(counter.try_decrement());
        assert!(!counter.try_peek_decrement());
    }

    #[test]
    fn batch_decrement_blocks_until_enough() {
        let counter = Counter::new(1);
        let mut batch = tokio_test::task::spawn(counter.decrement_n(3));
        assert_pending!(batch.poll());

        counter.increment().unwrap();
        assert_pending!(batch.poll());
        counter.increment().unwrap();
        assert!(batch.is_woken());
        assert_ready_ok!(batch.poll());
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn batch_head_blocks_smaller_follower() {
        let counter = Counter::new(0);
        let mut big = tokio_test::task::spawn(counter.decrement_n(2));
        let mut small = tokio_test::task::spawn(counter.decrement());
        assert_pending!(big.poll());
        assert_pending!(small.poll());

        counter.increment().unwrap();
        // FIFO: one count is not enough for the head, and the follower must
        // not overtake it
        assert_pending!(big.poll());
        assert_pending!(small.poll());

        counter.increment().unwrap();
        assert_ready_ok!(big.poll());
        assert_pending!(small.poll());
    }

    #[test]
    fn decrement_any_consumes_exactly_one() {
        let a = Counter::new(0);
        let b = Counter::new(0);
        let c = Counter::new(0);
        let counters = [&a, &b, &c];

        let mut fut = tokio_test::task::spawn(Counter::decrement_any(&counters));
        assert_pending!(fut.poll());

        a.increment().unwrap();
        b.increment().unwrap();
        c.increment().unwrap();

        assert!(fut.is_woken());
        let winner = assert_ready_ok!(fut.poll()).unwrap();
        assert_eq!(winner, 0, "lowest index wins the tie");

        let counts = [a.count(), b.count(), c.count()];
        assert_eq!(counts, [0, 1, 1], "exactly one increment was consumed");
    }

    #[test]
    fn decrement_any_empty_set_completes_immediately() {
        let mut fut = tokio_test::task::spawn(Counter::decrement_any(&[]));
        assert_eq!(assert_ready_ok!(fut.poll()), None);
    }

    #[test]
    fn decrement_any_all_closed() {
        let a = Counter::new(0);
        let b = Counter::new(0);
        let counters = [&a, &b];

        let mut fut = tokio_test::task::spawn(Counter::decrement_any(&counters));
        assert_pending!(fut.poll());

        a.close();
        b.close();
        assert!(fut.is_woken());
        assert_eq!(assert_ready_err!(fut.poll()), AcquireError::Closed);
    }

    #[test]
    fn decrement_any_cancel_releases_losers() {
        let a = Counter::new(0);
        let b = Counter::new(0);
        let counters = [&a, &b];
        let source = CancelSource::new();
        let token = source.token();

        let mut fut =
            tokio_test::task::spawn(Counter::decrement_any(&counters).cancel_on(&token));
        assert_pending!(fut.poll());
        assert_eq!(a.peekers.len() + b.peekers.len(), 2);

        source.cancel();
        assert_eq!(assert_ready_err!(fut.poll()), AcquireError::Cancelled);
        drop(fut);
        assert!(a.peekers.is_empty());
        assert!(b.peekers.is_empty());
    }

    #[test]
    fn count_is_never_negative_under_contention() {
        use crate::loom::thread;

        let counter = Arc::new(Counter::new(0));
        let rounds = 1000;

        let producer = {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..rounds {
                    counter.increment().unwrap();
                }
            })
        };
        let consumer = {
            let counter = counter.clone();
            thread::spawn(move || {
                let mut taken = 0;
                while taken < rounds {
                    if counter.try_decrement() {
                        taken += 1;
                    }
                    std::hint::spin_loop();
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn cross_thread_handoff_delivers_wakeups() {
        use crate::loom::thread;
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;

        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let counter = Arc::new(Counter::new(0));
        let rounds = 200;

        // a real suspended consumer, driven end to end through the waker
        let consumer = {
            let counter = counter.clone();
            thread::spawn(move || {
                futures::executor::block_on(async {
                    for _ in 0..rounds {
                        counter.decrement().await.unwrap();
                    }
                });
            })
        };
        let producer = {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..rounds {
                    counter.increment().unwrap();
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert_eq!(counter.count(), 0);
        assert!(!counter.has_waiters());
    }
}
