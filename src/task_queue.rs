// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A queue that runs enqueued work strictly one at a time, in order.
//!
//! Internally this is a chain of task records hanging off an atomic tail
//! pointer. Enqueueing swaps the tail and links the new record behind its
//! predecessor; a finishing record swings its `next` link from null to the
//! `COMPLETED` sentinel (rewinding the tail when it was last) or activates
//! its successor, skipping records that cancelled before activation.
//!
//! Each [`Enqueued`] future first awaits activation, then drives the caller's
//! future to completion, then advances the chain. A record observes its
//! cancellation token only until activation; once activated it runs freely,
//! and dropping the future mid-run still advances the chain.

use core::fmt;
use core::pin::Pin;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use core::task::{Context, Poll};
use core::time::Duration;
use std::sync::Arc;

use pin_project::{pin_project, pinned_drop};

use crate::cancel::{CancelToken, Harness};
use crate::error::AcquireError;
use crate::time::Timer;
use crate::wait::{Phase, Waiter};

/// Sentinel meaning "this record's predecessor chain has fully completed".
#[inline(always)]
fn completed() -> *mut Record {
    ptr::without_provenance_mut(1)
}

/// A serializing task queue.
pub struct TaskQueue {
    /// The most recently enqueued record, or [`completed`] when the chain is
    /// empty. Owns one record reference while it points at a real record.
    tail: AtomicPtr<Record>,
    pending: AtomicUsize,
}

/// One enqueued unit of work.
///
/// The embedded [`Waiter`] is the record's activation machine: a
/// predecessor completing it means "you are now at the head, run". Records
/// are pooled like any other waiter handle; `refs` counts the logical owners
/// (the caller's future, the tail slot, and the predecessor's link).
struct Record {
    waiter: Waiter,
    next: AtomicPtr<Record>,
    refs: AtomicUsize,
}

impl Record {
    fn new() -> Self {
        Self {
            waiter: Waiter::new(),
            next: AtomicPtr::new(ptr::null_mut()),
            refs: AtomicUsize::new(0),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        fn checkout_record() -> Arc<Record> {
            let record = Arc::new(Record::new());
            record.waiter.prepare(0);
            record.refs.store(1, Ordering::Relaxed);
            record
        }

        fn release_record(record: Arc<Record>) {
            let _ = record.refs.fetch_sub(1, Ordering::AcqRel);
        }
    } else {
        use spin::Mutex;

        const RECORD_POOL_CAP: usize = 128;

        static RECORDS: Mutex<Vec<Arc<Record>>> = Mutex::new(Vec::new());

        fn checkout_record() -> Arc<Record> {
            let record = RECORDS
                .lock()
                .pop()
                .unwrap_or_else(|| Arc::new(Record::new()));
            record.waiter.prepare(0);
            record.refs.store(1, Ordering::Relaxed);
            record
        }

        fn release_record(record: Arc<Record>) {
            if record.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                record.next.store(ptr::null_mut(), Ordering::Relaxed);
                record.waiter.recycle();
                let mut shelf = RECORDS.lock();
                if shelf.len() < RECORD_POOL_CAP {
                    shelf.push(record);
                }
            }
        }
    }
}

// === impl TaskQueue ===

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tail: AtomicPtr::new(completed()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Records enqueued but not yet finished (or skipped).
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Append `future` to the chain.
    ///
    /// The returned [`Enqueued`] future resolves with the inner future's
    /// output once every earlier record has finished and the inner future
    /// has run. Work only makes progress while the returned future is being
    /// polled; dropping it cancels the record (before activation) or the
    /// running work (after).
    pub fn enqueue<F: Future>(&self, future: F) -> Enqueued<'_, F> {
        let record = checkout_record();
        self.pending.fetch_add(1, Ordering::AcqRel);

        // the tail slot takes a reference
        record.refs.fetch_add(1, Ordering::Relaxed);
        let raw = Arc::into_raw(Arc::clone(&record)).cast_mut();
        let prev = self.tail.swap(raw, Ordering::AcqRel);

        if prev == completed() {
            // empty chain: active immediately
            let activated = record.waiter.transition(Phase::Completed);
            debug_assert!(activated, "fresh record must be pending");
        } else {
            // Safety: we own the reference the tail slot held on `prev`.
            let prev = unsafe { Arc::from_raw(prev) };

            // the predecessor's link takes a reference too
            record.refs.fetch_add(1, Ordering::Relaxed);
            let link = Arc::into_raw(Arc::clone(&record)).cast_mut();
            match prev.next.compare_exchange(
                ptr::null_mut(),
                link,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // linked: the predecessor's completion will activate us
                Ok(_) => {}
                Err(actual) => {
                    debug_assert_eq!(actual, completed());
                    // the predecessor finished before we linked; reclaim the
                    // link reference and self-activate
                    // Safety: `link` was just created by `Arc::into_raw`.
                    release_record(unsafe { Arc::from_raw(link) });
                    let activated = record.waiter.transition(Phase::Completed);
                    debug_assert!(activated, "fresh record must be pending");
                }
            }
            release_record(prev);
        }

        Enqueued {
            queue: self,
            record: Some(record),
            future,
            state: RunState::Queued,
            harness: Harness::new(),
        }
    }

    /// Wait until every record enqueued before this call has finished.
    ///
    /// Implemented as a no-op record whose completion signals the caller.
    pub async fn complete(&self) {
        let flushed = self.enqueue(core::future::ready(())).await;
        debug_assert!(flushed.is_ok(), "a no-op record cannot be cancelled");
    }

    /// Retire `record` and pass activation down the chain, skipping
    /// cancelled successors in the same call rather than bouncing through
    /// their (gone) futures.
    fn finish(&self, record: &Arc<Record>) {
        let mut cur = Arc::clone(record);
        // whether we hold the chain (predecessor-link) reference for `cur`;
        // the first record's was consumed when it was activated
        let mut owns_chain_ref = false;
        loop {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            match cur.next.compare_exchange(
                ptr::null_mut(),
                completed(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // no successor; rewind the tail if we are still it
                    let cur_raw = Arc::as_ptr(&cur).cast_mut();
                    if self
                        .tail
                        .compare_exchange(cur_raw, completed(), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // Safety: the tail slot owned this reference.
                        release_record(unsafe { Arc::from_raw(cur_raw) });
                    }
                    if owns_chain_ref {
                        release_record(cur);
                    }
                    return;
                }
                Err(next_raw) => {
                    debug_assert_ne!(next_raw, completed(), "record finished twice");
                    // Safety: the predecessor link owns a reference.
                    let successor = unsafe { Arc::from_raw(next_raw) };
                    if owns_chain_ref {
                        release_record(Arc::clone(&cur));
                    }
                    if successor.waiter.transition(Phase::Completed) {
                        successor.waiter.wake();
                        release_record(successor);
                        return;
                    }
                    // the successor cancelled before activation; retire it
                    // and keep walking
                    cur = successor;
                    owns_chain_ref = true;
                }
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail != completed() {
            // Safety: the tail slot owns a reference to the record.
            release_record(unsafe { Arc::from_raw(tail) });
        }
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

// === impl Enqueued ===

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RunState {
    /// Waiting for the predecessor chain.
    Queued,
    /// At the head; driving the inner future.
    Active,
    Done,
}

/// Future returned by [`TaskQueue::enqueue`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Enqueued<'a, F: Future> {
    queue: &'a TaskQueue,
    record: Option<Arc<Record>>,
    #[pin]
    future: F,
    state: RunState,
    #[pin]
    harness: Harness<'a>,
}

impl<'a, F: Future> Enqueued<'a, F> {
    /// Cancel the record if `token` fires before it is activated.
    ///
    /// The token is observed only until activation; once the record is
    /// running, its work proceeds and cancellation is done by dropping this
    /// future.
    pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
        self.harness.set_cancel(token);
        self
    }

    /// Fail with [`AcquireError::TimedOut`] if the record is not activated
    /// within `duration`.
    pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
        self.harness.set_deadline(timer, duration);
        self
    }
}

impl<F: Future> Future for Enqueued<'_, F> {
    type Output = Result<F::Output, AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let queue = *this.queue;

        if *this.state == RunState::Queued {
            loop {
                let ready = {
                    let record = this.record.as_ref().expect("record must exist while queued");
                    match record.waiter.poll_ready(cx) {
                        Poll::Ready(phase) => Some(phase),
                        Poll::Pending => None,
                    }
                };
                match ready {
                    Some(Phase::Completed) => {
                        // activation: this is the moment the token is observed
                        if let Poll::Ready(reason) = this.harness.as_mut().poll_limits(cx) {
                            let record = this.record.take().expect("record must exist");
                            queue.finish(&record);
                            release_record(record);
                            *this.state = RunState::Done;
                            return Poll::Ready(Err(
                                reason.as_error().expect("phase must be terminal")
                            ));
                        }
                        *this.state = RunState::Active;
                        break;
                    }
                    Some(phase) => {
                        unreachable!("task record reached phase {phase:?} without us")
                    }
                    None if this.harness.immediate => {
                        // zero deadline: activation must have been immediate
                        let won = this
                            .record
                            .as_ref()
                            .expect("record must exist")
                            .waiter
                            .transition(Phase::TimedOut);
                        if won {
                            let record = this.record.take().expect("record must exist");
                            release_record(record);
                            *this.state = RunState::Done;
                            return Poll::Ready(Err(AcquireError::TimedOut));
                        }
                    }
                    None => match this.harness.as_mut().poll_limits(cx) {
                        Poll::Ready(reason) => {
                            let won = this
                                .record
                                .as_ref()
                                .expect("record must exist")
                                .waiter
                                .transition(reason);
                            if won {
                                // the predecessor will skip us and advance
                                let record = this.record.take().expect("record must exist");
                                release_record(record);
                                *this.state = RunState::Done;
                                return Poll::Ready(Err(
                                    reason.as_error().expect("phase must be terminal")
                                ));
                            }
                            // activated concurrently; observe it next round
                        }
                        Poll::Pending => return Poll::Pending,
                    },
                }
            }
        }

        debug_assert_eq!(*this.state, RunState::Active, "polled after completion");
        let output = core::task::ready!(this.future.poll(cx));
        let record = this.record.take().expect("record must exist while active");
        queue.finish(&record);
        release_record(record);
        *this.state = RunState::Done;
        Poll::Ready(Ok(output))
    }
}

#[pinned_drop]
impl<F: Future> PinnedDrop for Enqueued<'_, F> {
    fn drop(mut self: Pin<&mut Self>) {
        let this = self.project();
        let Some(record) = this.record.take() else {
            return;
        };
        match this.state {
            RunState::Queued => {
                if !record.waiter.transition(Phase::Cancelled) {
                    // activated but never run; the chain must still advance
                    this.queue.finish(&record);
                }
            }
            RunState::Active => this.queue.finish(&record),
            RunState::Done => debug_assert!(false, "record must be gone when done"),
        }
        release_record(record);
    }
}

impl<F: Future> fmt::Debug for Enqueued<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enqueued").field("state", &self.state).finish()
    }
}
