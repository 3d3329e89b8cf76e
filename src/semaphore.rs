// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use pin_project::pin_project;

use crate::cancel::CancelToken;
use crate::counter::{Counter, Decrement};
use crate::error::AcquireError;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::time::Timer;

/// A bounded pool of permits.
///
/// Acquiring yields a [`Permit`], a scoped release handle: the permit goes
/// back to the pool on its first drop (or explicit
/// [`release`][Permit::release]). The capacity may be resized at runtime;
/// lowering it takes effect as outstanding permits come back.
pub struct Semaphore {
    permits: Counter,
    max: AtomicUsize,
    /// Permits to swallow on release after the capacity was lowered below
    /// the number currently outstanding.
    deficit: AtomicUsize,
}

// === impl Semaphore ===

impl Semaphore {
    pub fn new(max: usize) -> Self {
        Self {
            permits: Counter::new(max),
            max: AtomicUsize::new(max),
            deficit: AtomicUsize::new(0),
        }
    }

    /// Permits currently available for the taking.
    pub fn available(&self) -> usize {
        self.permits.count()
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Take a permit if one is immediately available.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        self.permits.try_decrement().then(|| Permit {
            semaphore: self,
            released: false,
        })
    }

    /// Wait for a permit.
    pub fn acquire(&self) -> Acquire<'_> {
        Acquire {
            semaphore: self,
            decrement: self.permits.decrement(),
        }
    }

    /// Change the permit capacity.
    ///
    /// Raising it makes the extra permits immediately available, promoting
    /// queued acquirers. Lowering it removes available permits right away and
    /// swallows returned permits until the new bound is honoured.
    pub fn set_max(&self, new_max: usize) {
        let old_max = self.max.swap(new_max, Ordering::SeqCst);
        if new_max > old_max {
            let grow = new_max - old_max;
            // repay outstanding deficit before minting fresh permits
            let repaid = self.repay_deficit(grow);
            if grow > repaid {
                let _ = self.permits.increment_n(grow - repaid);
            }
        } else {
            let mut shrink = old_max - new_max;
            // reclaim what is sitting idle; the rest is collected as permits
            // come back
            while shrink > 0 && self.permits.try_decrement() {
                shrink -= 1;
            }
            if shrink > 0 {
                self.deficit.fetch_add(shrink, Ordering::SeqCst);
            }
        }
    }

    /// Close the pool: queued acquirers fail with [`AcquireError::Closed`]
    /// and future acquires fail fast. Outstanding permits may still be
    /// dropped.
    pub fn close(&self) {
        self.permits.close();
    }

    fn release_permit(&self) {
        if self.repay_deficit(1) == 1 {
            return;
        }
        // a closed pool discards returned permits
        let _ = self.permits.increment();
    }

    /// Swallow up to `limit` permits worth of deficit; returns how many were
    /// swallowed.
    fn repay_deficit(&self, limit: usize) -> usize {
        let mut deficit = self.deficit.load(Ordering::SeqCst);
        loop {
            if deficit == 0 {
                return 0;
            }
            let repay = deficit.min(limit);
            match self.deficit.compare_exchange(
                deficit,
                deficit - repay,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return repay,
                Err(actual) => deficit = actual,
            }
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available())
            .field("max", &self.max())
            .finish()
    }
}

// === impl Acquire ===

/// Future returned by [`Semaphore::acquire`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Acquire<'a> {
    semaphore: &'a Semaphore,
    #[pin]
    decrement: Decrement<'a>,
}

impl<'a> Acquire<'a> {
    /// Resolve with [`AcquireError::Cancelled`] if `token` fires first.
    pub fn cancel_on(mut self, token: &'a CancelToken) -> Self {
        self.decrement = self.decrement.cancel_on(token);
        self
    }

    /// Resolve with [`AcquireError::TimedOut`] if `duration` elapses first.
    pub fn deadline(mut self, timer: &'a Timer, duration: Duration) -> Self {
        self.decrement = self.decrement.deadline(timer, duration);
        self
    }
}

impl<'a> Future for Acquire<'a> {
    type Output = Result<Permit<'a>, AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let semaphore: &'a Semaphore = *this.semaphore;
        this.decrement.poll(cx).map(|res| {
            res.map(|()| Permit {
                semaphore,
                released: false,
            })
        })
    }
}

impl fmt::Debug for Acquire<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquire").finish_non_exhaustive()
    }
}

// === impl Permit ===

/// A held permit; returns to the pool on first drop.
#[must_use = "a permit is released as soon as it is dropped"]
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
    released: bool,
}

impl Permit<'_> {
    /// Release the permit now instead of at end of scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !core::mem::replace(&mut self.released, true) {
            self.semaphore.release_permit();
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok};

    #[test]
    fn permits_cycle_through_the_pool() {
        let sem = Semaphore::new(2);
        assert_eq!(sem.available(), 2);

        let a = sem.try_acquire().unwrap();
        let b = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());

        drop(a);
        assert_eq!(sem.available(), 1);
        b.release();
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn releasing_promotes_a_queued_acquirer() {
        let sem = Semaphore::new(1);
        let held = sem.try_acquire().unwrap();

        let mut waiting = tokio_test::task::spawn(sem.acquire());
        assert_pending!(waiting.poll());

        drop(held);
        assert!(waiting.is_woken());
        let permit = assert_ready_ok!(waiting.poll());
        assert_eq!(sem.available(), 0);
        drop(permit);
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn raising_max_promotes_waiters() {
        let sem = Semaphore::new(0);
        let mut waiting = tokio_test::task::spawn(sem.acquire());
        assert_pending!(waiting.poll());

        sem.set_max(1);
        assert!(waiting.is_woken());
        let _permit = assert_ready_ok!(waiting.poll());
        assert_eq!(sem.max(), 1);
    }

    #[test]
    fn lowering_max_reclaims_idle_permits() {
        let sem = Semaphore::new(3);
        sem.set_max(1);
        assert_eq!(sem.available(), 1);
        assert_eq!(sem.max(), 1);
    }

    #[test]
    fn lowering_max_below_outstanding_swallows_releases() {
        let sem = Semaphore::new(2);
        let a = sem.try_acquire().unwrap();
        let b = sem.try_acquire().unwrap();

        sem.set_max(1);
        assert_eq!(sem.available(), 0);

        // the first returned permit is swallowed by the deficit
        drop(a);
        assert_eq!(sem.available(), 0);
        drop(b);
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn close_fails_waiters() {
        let sem = Semaphore::new(1);
        let held = sem.try_acquire().unwrap();

        let mut waiting = tokio_test::task::spawn(sem.acquire());
        assert_pending!(waiting.poll());

        sem.close();
        assert_eq!(assert_ready_err!(waiting.poll()), AcquireError::Closed);
        assert!(sem.is_closed());

        // returning the held permit after close must not panic
        drop(held);
    }

    #[test]
    fn release_is_idempotent_per_permit() {
        let sem = Semaphore::new(1);
        let permit = sem.try_acquire().unwrap();
        permit.release();
        // `release` consumed the permit; the drop that ran inside saw the
        // latch and did nothing extra
        assert_eq!(sem.available(), 1);
    }
}
