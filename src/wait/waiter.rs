// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::task::{Context, Poll};

use crate::error::AcquireError;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::wait::WakerCell;

/// The lifecycle of a [`Waiter`].
///
/// A handle leaves the pool in `Unused`, becomes `Pending` when its operation
/// starts, and reaches exactly one terminal phase. The compare-and-swap out of
/// `Pending` is the tie-break: whichever of the producer, the cancellation
/// source, or the closing primitive wins it owns the outcome, and everyone
/// else takes the no-op path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub(crate) enum Phase {
    /// The handle is pooled.
    Unused = 0,
    /// Enqueued (or about to be), awaiting a producer or cancellation.
    Pending = 1,
    /// A producer handed the capacity to this waiter.
    Completed = 2,
    /// The caller's cancellation token fired first.
    Cancelled = 3,
    /// The operation's deadline elapsed first.
    TimedOut = 4,
    /// The owning primitive was closed while this waiter was pending.
    Closed = 5,
}

impl Phase {
    fn from_bits(bits: usize) -> Self {
        match bits {
            0 => Phase::Unused,
            1 => Phase::Pending,
            2 => Phase::Completed,
            3 => Phase::Cancelled,
            4 => Phase::TimedOut,
            5 => Phase::Closed,
            _ => unreachable!("invalid waiter phase {bits}"),
        }
    }

    /// Map a terminal phase to the error it delivers, if any.
    pub(crate) fn as_error(self) -> Option<AcquireError> {
        match self {
            Phase::Cancelled => Some(AcquireError::Cancelled),
            Phase::TimedOut => Some(AcquireError::TimedOut),
            Phase::Closed => Some(AcquireError::Closed),
            _ => None,
        }
    }
}

/// One pending awaitable operation.
///
/// Waiters are pooled and reused; the `refs` latch counts logical owners (the
/// caller's future plus at most one queue slot) and the last release recycles
/// the handle. A waiter is never simultaneously in a queue and in the pool.
pub(crate) struct Waiter {
    state: AtomicUsize,
    /// Operation-specific payload, set before the handle is published and
    /// read by producers after dequeueing (e.g. the batch size of a counter
    /// decrement, or a lock waiter's role flags).
    tag: AtomicUsize,
    /// Logical ownership latch gating return to the pool.
    pub(super) refs: AtomicUsize,
    cell: WakerCell,
}

impl Waiter {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicUsize::new(Phase::Unused as usize),
            tag: AtomicUsize::new(0),
            refs: AtomicUsize::new(0),
            cell: WakerCell::new(),
        }
    }

    /// Arm a freshly checked-out handle for one operation.
    pub(crate) fn prepare(&self, tag: usize) {
        debug_assert_eq!(
            self.phase(),
            Phase::Unused,
            "waiter handed out while still in use"
        );
        self.tag.store(tag, Ordering::Relaxed);
        self.refs.store(1, Ordering::Relaxed);
        self.state.store(Phase::Pending as usize, Ordering::Release);
    }

    pub(crate) fn recycle(&self) {
        self.tag.store(0, Ordering::Relaxed);
        self.cell.reset();
        self.state.store(Phase::Unused as usize, Ordering::Release);
    }

    #[inline]
    pub(crate) fn phase(&self) -> Phase {
        Phase::from_bits(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn tag(&self) -> usize {
        self.tag.load(Ordering::Relaxed)
    }

    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a reference only while at least one owner still holds the
    /// handle.
    ///
    /// A handle whose count already reached zero has been recycled (or is
    /// about to be); resurrecting it from zero would race the pool. Peek
    /// uses this to latch onto the head occupant without removing it.
    pub(crate) fn try_add_ref_live(&self) -> bool {
        self.refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| {
                (refs > 0).then_some(refs + 1)
            })
            .is_ok()
    }

    /// Attempt the single transition out of [`Phase::Pending`].
    ///
    /// Returns `true` if this caller won the race and now owns the outcome.
    /// Losers must treat the handle as dead and move on. This does *not* wake
    /// the waiting task; producers call [`wake`][Self::wake] once they are
    /// outside any lock.
    pub(crate) fn transition(&self, to: Phase) -> bool {
        debug_assert!(
            matches!(
                to,
                Phase::Completed | Phase::Cancelled | Phase::TimedOut | Phase::Closed
            ),
            "invalid target phase {to:?}"
        );
        self.state
            .compare_exchange(
                Phase::Pending as usize,
                to as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn wake(&self) {
        self.cell.wake();
    }

    /// Poll until the handle leaves [`Phase::Pending`].
    pub(crate) fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Phase> {
        loop {
            let phase = self.phase();
            if phase != Phase::Pending {
                return Poll::Ready(phase);
            }
            match self.cell.poll_wait(cx) {
                // consumed a wakeup (or the cell was poisoned); re-read
                Poll::Ready(_) => continue,
                Poll::Pending => {
                    // the transition may have landed before our waker was
                    // registered; the producer's wake would then be lost
                    let phase = self.phase();
                    if phase != Phase::Pending {
                        return Poll::Ready(phase);
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("phase", &self.phase())
            .field("tag", &self.tag())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::wait::pool;

    #[test]
    fn exactly_one_winner() {
        loom::model(|| {
            let w = pool::checkout(0);

            let producer = {
                let w = w.clone();
                loom::thread::spawn(move || w.transition(Phase::Completed))
            };
            let canceller = {
                let w = w.clone();
                loom::thread::spawn(move || w.transition(Phase::Cancelled))
            };

            let p = producer.join().unwrap();
            let c = canceller.join().unwrap();
            assert!(p ^ c, "exactly one of producer/cancel must win");

            let phase = w.phase();
            if p {
                assert_eq!(phase, Phase::Completed);
            } else {
                assert_eq!(phase, Phase::Cancelled);
            }
            pool::release(w);
        });
    }

    #[test]
    fn poll_ready_observes_transition() {
        loom::model(|| {
            let w = pool::checkout(7);
            assert_eq!(w.tag(), 7);

            let mut task = tokio_test::task::spawn(());
            assert!(task.enter(|cx, _| w.poll_ready(cx)).is_pending());

            assert!(w.transition(Phase::Completed));
            w.wake();
            assert!(task.is_woken());
            assert_eq!(
                task.enter(|cx, _| w.poll_ready(cx)),
                Poll::Ready(Phase::Completed)
            );
            pool::release(w);
        });
    }

    #[test]
    fn losers_observe_terminal_phase() {
        loom::model(|| {
            let w = pool::checkout(0);
            assert!(w.transition(Phase::Closed));
            assert!(!w.transition(Phase::Completed));
            assert!(!w.transition(Phase::Cancelled));
            assert_eq!(w.phase(), Phase::Closed);
            assert_eq!(w.phase().as_error(), Some(AcquireError::Closed));
            pool::release(w);
        });
    }
}
