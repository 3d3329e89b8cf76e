// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative cancellation tokens.
//!
//! A [`CancelSource`] owns the ability to cancel; any number of cloned
//! [`CancelToken`]s observe it. Cancellation is a signal, not preemption: an
//! acquire future that was handed a token polls [`CancelToken::cancelled`]
//! alongside its waiter and resolves with
//! [`AcquireError::Cancelled`][crate::AcquireError::Cancelled] when the token
//! fires first. A completion that was already delivered always beats a
//! cancellation.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;

use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::wait::WakerList;

/// The cancelling side of a token. Dropping the source does *not* cancel.
pub struct CancelSource {
    inner: Arc<Inner>,
}

/// An observer handle created from a [`CancelSource`].
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    waiters: WakerList,
}

// === impl CancelSource ===

impl CancelSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                waiters: WakerList::new(),
            }),
        }
    }

    /// Create a token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            inner: self.inner.clone(),
        }
    }

    /// Fire the token. Idempotent; every pending and future
    /// [`cancelled()`][CancelToken::cancelled] wait completes.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            tracing::trace!("cancellation source fired");
            self.inner.waiters.wake_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// === impl CancelToken ===

impl CancelToken {
    /// Fast check without registering interest.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Wait for the token to fire.
    pub fn cancelled(&self) -> Cancelled<'_> {
        Cancelled {
            token: self,
            key: None,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Future returned by [`CancelToken::cancelled`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Cancelled<'a> {
    token: &'a CancelToken,
    key: Option<usize>,
}

impl Future for Cancelled<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &self.token.inner;
        if inner.cancelled.load(Ordering::Acquire) {
            inner.waiters.deregister(&mut self.key);
            return Poll::Ready(());
        }

        inner.waiters.register(&mut self.key, cx.waker());

        // cancel() may have drained the list between the check above and our
        // registration; re-checking closes that window
        if inner.cancelled.load(Ordering::Acquire) {
            inner.waiters.deregister(&mut self.key);
            return Poll::Ready(());
        }

        Poll::Pending
    }
}

impl Drop for Cancelled<'_> {
    fn drop(&mut self) {
        self.token.inner.waiters.deregister(&mut self.key);
    }
}

/// The per-operation cancellation harness.
///
/// Every acquire future carries one of these; it holds the optional token
/// wait and deadline sleep the caller configured and reports which of them
/// fired first. A zero deadline is special-cased: the operation attempts its
/// fast path only and fails synchronously.
#[pin_project::pin_project]
#[derive(Debug)]
pub(crate) struct Harness<'a> {
    cancel: Option<Cancelled<'a>>,
    #[pin]
    sleep: Option<crate::time::Sleep<'a>>,
    pub(crate) immediate: bool,
}

impl<'a> Harness<'a> {
    pub(crate) fn new() -> Self {
        Self {
            cancel: None,
            sleep: None,
            immediate: false,
        }
    }

    pub(crate) fn set_cancel(&mut self, token: &'a CancelToken) {
        self.cancel = Some(token.cancelled());
    }

    pub(crate) fn set_deadline(&mut self, timer: &'a crate::time::Timer, duration: core::time::Duration) {
        if duration.is_zero() {
            self.immediate = true;
        } else {
            self.sleep = Some(crate::time::sleep(timer, duration));
        }
    }

    /// Poll both limits; `Ready` carries the terminal phase to move the
    /// waiter to. The caller's token is checked first, so a simultaneous
    /// token/timer firing classifies as [`Phase::Cancelled`].
    ///
    /// [`Phase::Cancelled`]: crate::wait::Phase::Cancelled
    pub(crate) fn poll_limits(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<crate::wait::Phase> {
        let this = self.project();
        if let Some(cancel) = this.cancel {
            if Pin::new(cancel).poll(cx).is_ready() {
                return Poll::Ready(crate::wait::Phase::Cancelled);
            }
        }
        if let Some(sleep) = this.sleep.as_pin_mut() {
            if sleep.poll(cx).is_ready() {
                return Poll::Ready(crate::wait::Phase::TimedOut);
            }
        }
        Poll::Pending
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn fires_pending_waits() {
        let source = CancelSource::new();
        let token = source.token();

        let mut wait = tokio_test::task::spawn(token.cancelled());
        assert_pending!(wait.poll());
        assert!(!source.is_cancelled());

        source.cancel();
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
    }

    #[test]
    fn already_cancelled_completes_immediately() {
        let source = CancelSource::new();
        source.cancel();
        source.cancel(); // idempotent

        let token = source.token();
        assert!(token.is_cancelled());
        let mut wait = tokio_test::task::spawn(token.cancelled());
        assert_ready!(wait.poll());
    }

    #[test]
    fn cloned_tokens_share_the_source() {
        let source = CancelSource::new();
        let a = source.token();
        let b = a.clone();

        let mut wait_a = tokio_test::task::spawn(a.cancelled());
        let mut wait_b = tokio_test::task::spawn(b.cancelled());
        assert_pending!(wait_a.poll());
        assert_pending!(wait_b.poll());

        source.cancel();
        assert_ready!(wait_a.poll());
        assert_ready!(wait_b.poll());
    }

    #[test]
    fn dropping_a_wait_deregisters() {
        let source = CancelSource::new();
        let token = source.token();

        let mut wait = tokio_test::task::spawn(token.cancelled());
        assert_pending!(wait.poll());
        drop(wait);

        // must not wake a freed slot
        source.cancel();
    }
}
