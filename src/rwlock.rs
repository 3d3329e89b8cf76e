// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-writer / multi-reader asynchronous lock.
//!
//! The whole lock state lives in one signed integer: `0` idle, `> 0` the
//! number of active readers, `-1` a writer, `-2` closed. Two waiter queues
//! (readers, writers) plus a dedicated single-slot upgrade waiter hang off
//! it. Fairness is configurable per role through [`Policy`]: by default both
//! roles queue FIFO and readers drain before a waiting writer takes over;
//! the unfair variants let a role cut ahead under the conditions documented
//! on [`Policy`].

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use pin_project::{pin_project, pinned_drop};
use spin::Mutex;

use crate::cancel::{CancelToken, Harness};
use crate::error::AcquireError;
use crate::loom::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use crate::time::Timer;
use crate::wait::{Phase, Waiter, WaitQueue, pool};

const IDLE: isize = 0;
const WRITER: isize = -1;
const CLOSED: isize = -2;

/// Which roles may cut ahead of the other role's queue.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Policy {
    /// New readers may proceed while writers wait, provided other readers
    /// are already active.
    pub unfair_read: bool,
    /// A releasing writer may hand the lock to the next writer even when
    /// readers are queued.
    pub unfair_write: bool,
}

/// An asynchronous reader/writer lock.
pub struct RwLock {
    state: CachePadded<AtomicIsize>,
    closed: AtomicBool,
    readers: WaitQueue,
    writers: WaitQueue,
    /// At most one pending upgrade, held out of the writer queue so plain
    /// writers stay FIFO and the upgrader cannot deadlock behind a writer
    /// that needs the upgrader's own read to be released.
    upgrade: Mutex<Option<Arc<Waiter>>>,
    upgrade_pending: AtomicBool,
    policy: Policy,
}

enum Handoff {
    /// The lock was handed over (or there is nothing to do).
    Done,
    /// State moved under us; the dispatch loop should re-evaluate.
    Retry,
}

/// Which role an idle-lock handoff favours.
///
/// The last reader leaving hands to a waiting writer even when readers are
/// queued behind it; a fair writer leaving lets the queued reader batch run
/// first.
#[derive(Copy, Clone)]
enum Prefer {
    Writer,
    Reader,
}

// === impl RwLock ===

impl RwLock {
    pub fn new() -> Self {
        Self::with_policy(Policy::default())
    }

    pub fn with_policy(policy: Policy) -> Self {
        Self {
            state: CachePadded::new(AtomicIsize::new(IDLE)),
            closed: AtomicBool::new(false),
            readers: WaitQueue::new(),
            writers: WaitQueue::new(),
            upgrade: Mutex::new(None),
            upgrade_pending: AtomicBool::new(false),
            policy,
        }
    }

    /// Number of readers currently holding the lock.
    pub fn readers(&self) -> usize {
        self.state.load(Ordering::SeqCst).max(0).unsigned_abs()
    }

    /// `true` while a writer holds the lock.
    pub fn has_writer(&self) -> bool {
        self.state.load(Ordering::SeqCst) == WRITER
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take a read lock if it is immediately available.
    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        if self.is_closed() {
            return None;
        }
        let mut state = self.state.load(Ordering::SeqCst);
        loop {
            if state < 0 {
                return None;
            }
            if self.writer_queued() && !(self.policy.unfair_read && state > 0) {
                return None;
            }
            match self.state.compare_exchange(
                state,
                state + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(ReadGuard {
                        lock: self,
                        released: false,
                    });
                }
                Err(actual) => state = actual,
            }
        }
    }

    /// Take the write lock if it is immediately available.
    ///
    /// A fair writer only succeeds with no writers ahead of it in the queue.
    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        if self.is_closed() || self.writer_queued() {
            return None;
        }
        self.state
            .compare_exchange(IDLE, WRITER, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| WriteGuard {
                lock: self,
                released: false,
            })
    }

    /// Wait for a read lock.
    pub fn read(&self) -> Read<'_> {
        Read {
            lock: self,
            waiter: None,
            harness: Harness::new(),
            done: false,
        }
    }

    /// Wait for the write lock.
    pub fn write(&self) -> Write<'_> {
        Write {
            lock: self,
            waiter: None,
            harness: Harness::new(),
            done: false,
        }
    }

    /// Close the lock: queued acquires fail with [`AcquireError::Closed`]
    /// and new ones fail fast. Already-held guards release normally.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::trace!("rwlock closed");
        let _ = self
            .state
            .compare_exchange(IDLE, CLOSED, Ordering::SeqCst, Ordering::SeqCst);
        self.fail_queue(&self.readers);
        self.fail_queue(&self.writers);
        let upgrade = {
            let mut slot = self.upgrade.lock();
            self.upgrade_pending.store(false, Ordering::Release);
            slot.take()
        };
        if let Some(waiter) = upgrade {
            if waiter.transition(Phase::Closed) {
                waiter.wake();
            }
            pool::release(waiter);
        }
    }

    fn writer_queued(&self) -> bool {
        self.upgrade_pending.load(Ordering::SeqCst) || !self.writers.is_empty()
    }

    fn release_reader(&self) {
        let mut state = self.state.load(Ordering::SeqCst);
        loop {
            debug_assert!(state > 0, "released a read lock that was not held");
            let next = if state == 1 && self.is_closed() {
                CLOSED
            } else {
                state - 1
            };
            match self
                .state
                .compare_exchange(state, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
        self.dispatch(Prefer::Writer);
    }

    fn release_writer(&self) {
        let next = if self.is_closed() { CLOSED } else { IDLE };
        let prev = self.state.swap(next, Ordering::SeqCst);
        debug_assert_eq!(prev, WRITER, "released a write lock that was not held");
        self.dispatch(Prefer::Reader);
    }

    /// The central handoff: inspect the state and the queues and promote
    /// whichever role the policies elect next.
    fn dispatch(&self, prefer: Prefer) {
        loop {
            if self.is_closed() {
                self.fail_queue(&self.readers);
                self.fail_queue(&self.writers);
                return;
            }
            let state = self.state.load(Ordering::SeqCst);
            match state {
                WRITER | CLOSED => return,
                IDLE => {
                    let writer_waiting = self.writer_queued();
                    let reader_waiting = !self.readers.is_empty();
                    let writer_first = match prefer {
                        Prefer::Writer => true,
                        Prefer::Reader => !reader_waiting || self.policy.unfair_write,
                    };
                    if writer_waiting && writer_first {
                        match self.promote_writer() {
                            Handoff::Done => return,
                            Handoff::Retry => {}
                        }
                    } else if reader_waiting {
                        self.promote_readers();
                        // all queued readers may have been dead; re-evaluate
                    } else {
                        return;
                    }
                }
                // readers active
                _ => {
                    if state == 1 && self.upgrade_pending.load(Ordering::SeqCst) {
                        match self.promote_upgrade() {
                            Handoff::Done => return,
                            Handoff::Retry => continue,
                        }
                    }
                    if !self.writer_queued() || self.policy.unfair_read {
                        self.promote_readers();
                    }
                    return;
                }
            }
        }
    }

    /// Reserve the writer state, then hand it to the first live queued
    /// writer.
    fn promote_writer(&self) -> Handoff {
        if self
            .state
            .compare_exchange(IDLE, WRITER, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Handoff::Retry;
        }
        while let Some(waiter) = self.writers.pop() {
            if waiter.transition(Phase::Completed) {
                waiter.wake();
                pool::release(waiter);
                return Handoff::Done;
            }
            // cancelled while queued; look for a live one
            pool::release(waiter);
        }
        // no live writer after all; undo the reservation
        let undone =
            self.state
                .compare_exchange(WRITER, IDLE, Ordering::SeqCst, Ordering::SeqCst);
        debug_assert!(undone.is_ok(), "writer reservation disappeared");
        Handoff::Retry
    }

    /// Promote every live queued reader, reserving one reader count before
    /// each removal and refunding it when the waiter turns out dead.
    fn promote_readers(&self) {
        loop {
            if self.readers.is_empty() {
                return;
            }
            if !self.try_add_reader() {
                // the lock went to a writer in the meantime
                return;
            }
            match self.readers.pop() {
                Some(waiter) => {
                    if waiter.transition(Phase::Completed) {
                        waiter.wake();
                    } else {
                        self.remove_reader_quiet();
                    }
                    pool::release(waiter);
                }
                None => {
                    self.remove_reader_quiet();
                    return;
                }
            }
        }
    }

    /// Reclassify the sole remaining reader (the upgrader) as the writer.
    fn promote_upgrade(&self) -> Handoff {
        if self
            .state
            .compare_exchange(1, WRITER, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Handoff::Retry;
        }
        let waiter = {
            let mut slot = self.upgrade.lock();
            let waiter = slot.take();
            if waiter.is_some() {
                self.upgrade_pending.store(false, Ordering::Release);
            }
            waiter
        };
        match waiter {
            Some(waiter) => {
                if waiter.transition(Phase::Completed) {
                    waiter.wake();
                    pool::release(waiter);
                    return Handoff::Done;
                }
                pool::release(waiter);
            }
            None => {}
        }
        // the upgrade was cancelled under us; give the reader count back
        let undone = self
            .state
            .compare_exchange(WRITER, 1, Ordering::SeqCst, Ordering::SeqCst);
        debug_assert!(undone.is_ok(), "upgrade reservation disappeared");
        Handoff::Retry
    }

    fn try_add_reader(&self) -> bool {
        let mut state = self.state.load(Ordering::SeqCst);
        loop {
            if state < 0 {
                return false;
            }
            match self.state.compare_exchange(
                state,
                state + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    fn remove_reader_quiet(&self) {
        let prev = self.state.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    fn fail_queue(&self, queue: &WaitQueue) {
        while let Some(waiter) = queue.pop() {
            if waiter.transition(Phase::Closed) {
                waiter.wake();
            }
            pool::release(waiter);
        }
    }

    fn after_enqueue(&self) {
        if self.is_closed() {
            self.fail_queue(&self.readers);
            self.fail_queue(&self.writers);
        } else {
            self.dispatch(Prefer::Writer);
        }
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("policy", &self.policy)
            .finish()
    }
}

// === acquire futures ===

macro_rules! acquire_future {
    (
        $(#[$meta:meta])*
        $name:ident, $queue:ident, $try_fast:ident, $guard:ident, $rollback:ident
    ) => {
        $(#[$meta])*
        #[pin_project(PinnedDrop)]
        #[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
        pub struct $name<'a> {
            lock: &'a RwLock,
            waiter: Option<Arc<Waiter>>,
            #[pin]
            harness: Harness<'a>,
            done: bool,
        }

        impl<'a> $name<'a> {
            /// Resolve with [`AcquireError::Cancelled`] if `token` fires
            /// first.
            pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
                self.harness.set_cancel(token);
                self
            }

            /// Resolve with [`AcquireError::TimedOut`] if `duration` elapses
            /// first.
            pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
                self.harness.set_deadline(timer, duration);
                self
            }
        }

        impl<'a> Future for $name<'a> {
            type Output = Result<$guard<'a>, AcquireError>;

            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let mut this = self.project();
                let lock: &'a RwLock = *this.lock;
                debug_assert!(!*this.done, "lock future polled after completion");

                if this.waiter.is_none() {
                    if let Some(guard) = lock.$try_fast() {
                        *this.done = true;
                        return Poll::Ready(Ok(guard));
                    }
                    if this.harness.immediate {
                        *this.done = true;
                        return Poll::Ready(Err(AcquireError::TimedOut));
                    }
                    if lock.is_closed() {
                        *this.done = true;
                        return Poll::Ready(Err(AcquireError::Closed));
                    }
                    let waiter = pool::checkout(0);
                    lock.$queue.push(&waiter);
                    *this.waiter = Some(waiter);
                    lock.after_enqueue();
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
                            // the dispatcher already moved the state for us
                            Phase::Completed => Ok($guard {
                                lock,
                                released: false,
                            }),
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
                                lock.$queue.erase(&waiter);
                                pool::release(waiter);
                                // the role we vacated may unblock the other
                                // one right now
                                lock.dispatch(Prefer::Writer);
                                *this.done = true;
                                return Poll::Ready(Err(
                                    reason.as_error().expect("phase must be terminal")
                                ));
                            }
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }

        #[pinned_drop]
        impl PinnedDrop for $name<'_> {
            fn drop(mut self: Pin<&mut Self>) {
                let this = self.project();
                if let Some(waiter) = this.waiter.take() {
                    if waiter.transition(Phase::Cancelled) {
                        this.lock.$queue.erase(&waiter);
                        this.lock.dispatch(Prefer::Writer);
                    } else if waiter.phase() == Phase::Completed {
                        // the lock was handed to us but never consumed
                        this.lock.$rollback();
                    }
                    pool::release(waiter);
                }
            }
        }

        impl fmt::Debug for $name<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("waiting", &self.waiter.is_some())
                    .finish()
            }
        }
    };
}

acquire_future!(
    /// Future returned by [`RwLock::read`].
    Read,
    readers,
    try_read,
    ReadGuard,
    release_reader
);

acquire_future!(
    /// Future returned by [`RwLock::write`].
    Write,
    writers,
    try_write,
    WriteGuard,
    release_writer
);

// === impl ReadGuard ===

/// A held read lock; releases on first drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a RwLock,
    released: bool,
}

impl<'a> ReadGuard<'a> {
    /// Release the read lock now instead of at end of scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    /// Exchange this read lock for the write lock.
    ///
    /// The reader count is kept while waiting and atomically subsumed into
    /// the writer state when the upgrade succeeds. If the upgrade is
    /// cancelled or times out, the error is surfaced only once the read lock
    /// is safely reinstated: the failure carries the original guard.
    pub fn upgrade(mut self) -> Upgrade<'a> {
        let lock = self.lock;
        self.released = true; // ownership of the reader count moves
        Upgrade {
            lock,
            state: UpgradeState::Read,
            waiter: None,
            harness: Harness::new(),
        }
    }

    fn release_inner(&mut self) {
        if !core::mem::replace(&mut self.released, true) {
            self.lock.release_reader();
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard").finish_non_exhaustive()
    }
}

// === impl WriteGuard ===

/// A held write lock; releases on first drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a RwLock,
    released: bool,
}

impl<'a> WriteGuard<'a> {
    /// Release the write lock now instead of at end of scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    /// Atomically re-add this writer to the read state.
    pub fn downgrade(mut self) -> ReadGuard<'a> {
        let lock = self.lock;
        self.released = true;
        let swapped =
            lock.state
                .compare_exchange(WRITER, 1, Ordering::SeqCst, Ordering::SeqCst);
        debug_assert!(swapped.is_ok(), "downgraded a write lock that was not held");
        // other readers may now join, per the read policy
        lock.dispatch(Prefer::Reader);
        ReadGuard {
            lock,
            released: false,
        }
    }

    fn release_inner(&mut self) {
        if !core::mem::replace(&mut self.released, true) {
            self.lock.release_writer();
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard").finish_non_exhaustive()
    }
}

// === impl Upgrade ===

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UpgradeState {
    /// We hold the read count and have not armed the upgrade slot yet.
    Read,
    /// The upgrade waiter sits in the slot; read count still held.
    Waiting,
    /// Resolved; ownership moved into the output guard.
    Done,
}

/// A failed [`upgrade`][ReadGuard::upgrade]: the read lock is handed back
/// alongside the reason.
#[derive(Debug)]
pub struct UpgradeFailed<'a> {
    pub guard: ReadGuard<'a>,
    pub error: AcquireError,
}

/// Future returned by [`ReadGuard::upgrade`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Upgrade<'a> {
    lock: &'a RwLock,
    state: UpgradeState,
    waiter: Option<Arc<Waiter>>,
    #[pin]
    harness: Harness<'a>,
}

impl<'a> Upgrade<'a> {
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

impl<'a> Future for Upgrade<'a> {
    type Output = Result<WriteGuard<'a>, UpgradeFailed<'a>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let lock: &'a RwLock = *this.lock;
        debug_assert!(
            *this.state != UpgradeState::Done,
            "Upgrade polled after completion"
        );
        let fail = |error| UpgradeFailed {
            guard: ReadGuard {
                lock,
                released: false,
            },
            error,
        };

        if *this.state == UpgradeState::Read {
            // upgrades take priority: the sole reader may reclassify even
            // with writers queued
            if lock
                .state
                .compare_exchange(1, WRITER, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                *this.state = UpgradeState::Done;
                return Poll::Ready(Ok(WriteGuard {
                    lock,
                    released: false,
                }));
            }
            if this.harness.immediate {
                *this.state = UpgradeState::Done;
                return Poll::Ready(Err(fail(AcquireError::TimedOut)));
            }
            if lock.is_closed() {
                *this.state = UpgradeState::Done;
                return Poll::Ready(Err(fail(AcquireError::Closed)));
            }

            let waiter = pool::checkout(0);
            {
                let mut slot = lock.upgrade.lock();
                if slot.is_some() {
                    // only one upgrade may be in flight
                    drop(slot);
                    debug_assert!(false, "concurrent upgrade on the same RwLock");
                    pool::release(waiter);
                    *this.state = UpgradeState::Done;
                    return Poll::Ready(Err(fail(AcquireError::Cancelled)));
                }
                waiter.add_ref();
                *slot = Some(waiter.clone());
                lock.upgrade_pending.store(true, Ordering::Release);
            }
            *this.waiter = Some(waiter);
            *this.state = UpgradeState::Waiting;
            // the other readers may already be gone
            lock.dispatch(Prefer::Writer);
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
                *this.state = UpgradeState::Done;
                return Poll::Ready(match phase {
                    Phase::Completed => Ok(WriteGuard {
                        lock,
                        released: false,
                    }),
                    phase => Err(fail(phase.as_error().expect("phase must be terminal"))),
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
                        lock.clear_upgrade_slot(&waiter);
                        pool::release(waiter);
                        *this.state = UpgradeState::Done;
                        // the read lock was never let go; reinstating it is
                        // free, and only now is the cancellation surfaced
                        return Poll::Ready(Err(fail(
                            reason.as_error().expect("phase must be terminal"),
                        )));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for Upgrade<'_> {
    fn drop(mut self: Pin<&mut Self>) {
        let this = self.project();
        match this.state {
            UpgradeState::Done => {}
            UpgradeState::Read => this.lock.release_reader(),
            UpgradeState::Waiting => {
                let waiter = this.waiter.take().expect("waiting implies a waiter");
                if waiter.transition(Phase::Cancelled) {
                    this.lock.clear_upgrade_slot(&waiter);
                    this.lock.release_reader();
                } else if waiter.phase() == Phase::Completed {
                    // reclassified to writer, never consumed
                    this.lock.release_writer();
                } else {
                    // closed while waiting; we still held the read
                    this.lock.release_reader();
                }
                pool::release(waiter);
            }
        }
    }
}

impl fmt::Debug for Upgrade<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrade").field("state", &self.state).finish()
    }
}

impl RwLock {
    /// Empty the upgrade slot if it still holds `waiter`, releasing the
    /// slot's reference.
    fn clear_upgrade_slot(&self, waiter: &Arc<Waiter>) {
        let owned = {
            let mut slot = self.upgrade.lock();
            if slot
                .as_ref()
                .is_some_and(|slotted| Arc::ptr_eq(slotted, waiter))
            {
                self.upgrade_pending.store(false, Ordering::Release);
                slot.take()
            } else {
                None
            }
        };
        if let Some(owned) = owned {
            pool::release(owned);
        }
    }
}
