// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, ready};
use core::time::Duration;

use pin_project::{pin_project, pinned_drop};

use crate::loom::sync::atomic::Ordering;
use crate::time::clock::Ticks;
use crate::time::timer::{Entry, Timer};

/// Wait until `duration` has elapsed on `timer`'s clock.
pub fn sleep(timer: &Timer, duration: Duration) -> Sleep<'_> {
    let deadline = timer.clock().now_ticks().after(duration);
    Sleep::new(timer, deadline)
}

/// Wait until `deadline` has been reached on `timer`'s clock.
pub fn sleep_until(timer: &Timer, deadline: Ticks) -> Sleep<'_> {
    Sleep::new(timer, deadline)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Unregistered,
    Registered,
    Completed,
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep<'timer> {
    state: State,
    timer: &'timer Timer,
    #[pin]
    entry: Entry,
}

impl<'timer> Sleep<'timer> {
    fn new(timer: &'timer Timer, deadline: Ticks) -> Self {
        Self {
            state: State::Unregistered,
            timer,
            entry: Entry::new(deadline),
        }
    }

    /// The instant this sleep elapses at.
    pub fn deadline(&self) -> Ticks {
        self.entry.deadline
    }
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut me = self.as_mut().project();

        match me.state {
            State::Unregistered => {
                // Safety: the timer treats the pointer as pinned and the drop
                // impl unlinks it before the entry can move or go away.
                let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(me.entry.as_mut())) };
                match me.timer.register(ptr) {
                    Poll::Ready(()) => {
                        *me.state = State::Completed;
                        return Poll::Ready(());
                    }
                    Poll::Pending => *me.state = State::Registered,
                }
            }
            State::Registered if me.entry.is_registered.load(Ordering::Acquire) => {}
            _ => return Poll::Ready(()),
        }

        let _poll = ready!(me.entry.waker.poll_wait(cx));
        debug_assert!(
            _poll.is_err(),
            "a sleep's waker cell should only be fired by closing"
        );
        *me.state = State::Completed;
        Poll::Ready(())
    }
}

#[pinned_drop]
impl PinnedDrop for Sleep<'_> {
    fn drop(mut self: Pin<&mut Self>) {
        let this = self.project();
        // no need to lock the timer unless we're actually linked in
        if this.entry.is_registered.load(Ordering::Acquire) {
            this.timer.cancel(this.entry);
        }
    }
}

impl fmt::Debug for Sleep<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("state", &self.state)
            .field("deadline", &self.entry.deadline)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::time::Clock;
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn fires_when_the_clock_reaches_the_deadline() {
        let clock = Clock::manual();
        let timer = Timer::new(clock.clone());

        let mut fut = tokio_test::task::spawn(sleep(&timer, Duration::from_millis(10)));
        assert_pending!(fut.poll());

        clock.advance(Duration::from_millis(5));
        let (fired, next) = timer.turn();
        assert_eq!(fired, 0);
        assert!(next.is_some());
        assert_pending!(fut.poll());

        clock.advance(Duration::from_millis(5));
        let (fired, next) = timer.turn();
        assert_eq!(fired, 1);
        assert_eq!(next, None);

        assert!(fut.is_woken());
        assert_ready!(fut.poll());
    }

    #[test]
    fn zero_duration_elapses_immediately() {
        let timer = Timer::new(Clock::manual());
        let mut fut = tokio_test::task::spawn(sleep(&timer, Duration::ZERO));
        assert_ready!(fut.poll());
    }

    #[test]
    fn dropping_a_sleep_unregisters_it() {
        let clock = Clock::manual();
        let timer = Timer::new(clock.clone());

        let mut fut = tokio_test::task::spawn(sleep(&timer, Duration::from_millis(10)));
        assert_pending!(fut.poll());
        drop(fut);

        clock.advance(Duration::from_millis(20));
        let (fired, next) = timer.turn();
        assert_eq!(fired, 0);
        assert_eq!(next, None);
    }

    #[test]
    fn turn_reports_the_earliest_deadline() {
        let clock = Clock::manual();
        let timer = Timer::new(clock.clone());
        let deadline_a = clock.now_ticks().after(Duration::from_millis(30));
        let deadline_b = clock.now_ticks().after(Duration::from_millis(10));

        let mut a = tokio_test::task::spawn(sleep_until(&timer, deadline_a));
        let mut b = tokio_test::task::spawn(sleep_until(&timer, deadline_b));
        assert_pending!(a.poll());
        assert_pending!(b.poll());

        let (_, next) = timer.turn();
        assert_eq!(next, Some(deadline_b));

        clock.advance(Duration::from_millis(10));
        let (fired, next) = timer.turn();
        assert_eq!(fired, 1);
        assert_eq!(next, Some(deadline_a));
        assert_ready!(b.poll());
        assert_pending!(a.poll());
    }
}
