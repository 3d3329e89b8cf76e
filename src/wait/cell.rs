// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::task::{Context, Poll, Waker};

use bitflags::bitflags;
use crossbeam_utils::CachePadded;
use static_assertions::const_assert_eq;

use crate::error::Closed;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};

/// An atomically registered [`Waker`].
///
/// The cell stores the waker of a single task; wakers and wakeups may race
/// from any thread. Registration and waking synchronize through one state
/// word, based on Tokio's `AtomicWaker` strategy: registration briefly holds
/// the `REGISTERING` bit, waking briefly holds the `WAKING` bit, and a wakeup
/// that arrives mid-registration is handed back to the registrant instead of
/// touching the waker slot.
///
/// [`close`][WakerCell::close] delivers a final wakeup that also poisons the
/// cell; this doubles as the "fired" signal for one-shot users such as timer
/// entries.
pub(crate) struct WakerCell {
    state: CachePadded<AtomicUsize>,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct State: usize {
        const WAITING = 0b0000;
        const REGISTERING = 0b0001;
        const WAKING = 0b0010;
        const WOKEN = 0b0100;
        const CLOSED = 0b1000;
    }
}
// WAITING must be the all-clear state so `fetch_and` resets land on it.
const_assert_eq!(State::WAITING.bits(), 0);

impl WakerCell {
    pub(crate) fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicUsize::new(State::WAITING.bits())),
            waker: UnsafeCell::new(None),
        }
    }

    /// Register the waker from `cx`, or complete immediately if a wakeup is
    /// already stored.
    pub(crate) fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), Closed>> {
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::CLOSED) => {
                return Poll::Ready(Err(Closed(())));
            }
            Err(actual) if actual.contains(State::WOKEN) => {
                // consume the stored wakeup
                self.fetch_and(!State::WOKEN, Ordering::Release);
                return Poll::Ready(Ok(()));
            }
            // a wake is in progress; don't go to sleep now
            Err(actual) if actual.contains(State::WAKING) => {
                return Poll::Ready(Ok(()));
            }
            Err(_) => {
                // another task is registering; yield and retry once it's done
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Ok(_) => {}
        }

        self.waker.with_mut(|slot| {
            // Safety: the REGISTERING bit grants exclusive access to the slot.
            unsafe {
                match &mut *slot {
                    Some(old) if old.will_wake(cx.waker()) => {}
                    old => *old = Some(cx.waker().clone()),
                }
            }
        });

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
        {
            // We were woken or closed while registering. Take the waker back
            // out (nobody else touched it, per the REGISTERING bit) and reset
            // to WAITING, preserving only the CLOSED bit.
            let waker = self.waker.with_mut(|slot| {
                // Safety: REGISTERING is still set, so the slot is ours.
                unsafe { (*slot).take() }
            });
            drop(waker);

            let state = self.fetch_and(State::CLOSED, Ordering::AcqRel);
            debug_assert!(
                state == actual || state == actual | State::CLOSED,
                "state changed unexpectedly while registering"
            );

            if state.contains(State::CLOSED) {
                return Poll::Ready(Err(Closed(())));
            }
            return Poll::Ready(Ok(()));
        }

        Poll::Pending
    }

    /// Wake the stored waker, or store a wakeup for the next registration.
    ///
    /// Returns `true` if a waiting task was woken.
    pub(crate) fn wake(&self) -> bool {
        if let Some(waker) = self.take_waker(false) {
            waker.wake();
            true
        } else {
            false
        }
    }

    /// Deliver a final wakeup and poison the cell.
    pub(crate) fn close(&self) -> bool {
        if let Some(waker) = self.take_waker(true) {
            waker.wake();
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        let state = State::from_bits_retain(self.state.load(Ordering::Acquire));
        state.contains(State::CLOSED)
    }

    /// Return the cell to its initial state.
    ///
    /// Callers must guarantee exclusive logical ownership (this is only used
    /// when recycling a pooled handle whose reference count reached zero).
    pub(crate) fn reset(&self) {
        self.waker.with_mut(|slot| {
            // Safety: the caller is the sole remaining owner.
            unsafe { *slot = None };
        });
        self.state.store(State::WAITING.bits(), Ordering::Release);
    }

    fn take_waker(&self, close: bool) -> Option<Waker> {
        let mut bits = State::WAKING | State::WOKEN;
        if close {
            bits |= State::CLOSED;
        }
        let state = self.fetch_or(bits, Ordering::AcqRel);

        // Only touch the waker if nobody else is.
        if !state.intersects(State::WAKING | State::REGISTERING | State::CLOSED) {
            let waker = self.waker.with_mut(|slot| {
                // Safety: we hold the WAKING bit and no registration is in
                // flight, so the slot is ours.
                unsafe { (*slot).take() }
            });
            self.fetch_and(!State::WAKING, Ordering::Release);
            return waker;
        }

        None
    }

    #[inline(always)]
    fn compare_exchange(
        &self,
        curr: State,
        new: State,
        success: Ordering,
    ) -> Result<State, State> {
        self.state
            .compare_exchange(curr.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_and(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_and(state.bits(), order))
    }

    #[inline(always)]
    fn fetch_or(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_or(state.bits(), order))
    }
}

impl core::fmt::Debug for WakerCell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WakerCell")
            .field(
                "state",
                &State::from_bits_retain(self.state.load(Ordering::Relaxed)),
            )
            .finish_non_exhaustive()
    }
}

// Safety: all access to the waker slot is mediated by the state word.
unsafe impl Send for WakerCell {}
// Safety: all access to the waker slot is mediated by the state word.
unsafe impl Sync for WakerCell {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;

    #[test]
    fn wake_before_registration_is_stored() {
        loom::model(|| {
            let cell = WakerCell::new();
            assert!(!cell.wake());

            let mut task = tokio_test::task::spawn(());
            let poll = task.enter(|cx, _| cell.poll_wait(cx));
            assert!(matches!(poll, Poll::Ready(Ok(()))));
        });
    }

    #[test]
    fn wake_after_registration_wakes() {
        loom::model(|| {
            let cell = WakerCell::new();
            let mut task = tokio_test::task::spawn(());

            let poll = task.enter(|cx, _| cell.poll_wait(cx));
            assert!(poll.is_pending());
            assert!(!task.is_woken());

            assert!(cell.wake());
            assert!(task.is_woken());
        });
    }

    #[test]
    fn close_poisons() {
        loom::model(|| {
            let cell = WakerCell::new();
            cell.close();
            assert!(cell.is_closed());

            let mut task = tokio_test::task::spawn(());
            let poll = task.enter(|cx, _| cell.poll_wait(cx));
            assert!(matches!(poll, Poll::Ready(Err(Closed(())))));
        });
    }

    #[test]
    fn reset_clears_closed() {
        loom::model(|| {
            let cell = WakerCell::new();
            cell.close();
            cell.reset();

            let mut task = tokio_test::task::spawn(());
            let poll = task.enter(|cx, _| cell.poll_wait(cx));
            assert!(poll.is_pending());
        });
    }

    #[test]
    fn concurrent_wake_and_register() {
        loom::model(|| {
            let cell = Arc::new(WakerCell::new());

            let waker = {
                let cell = cell.clone();
                loom::thread::spawn(move || {
                    cell.wake();
                })
            };

            let mut task = tokio_test::task::spawn(());
            let first = task.enter(|cx, _| cell.poll_wait(cx));
            waker.join().unwrap();

            if first.is_pending() && !task.is_woken() {
                // the wakeup landed after registration and before the waker
                // was stored; it must now be waiting in the cell
                let poll = task.enter(|cx, _| cell.poll_wait(cx));
                assert!(matches!(poll, Poll::Ready(Ok(()))));
            }
        });
    }
}
