// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use pin_project::pin_project;

use crate::time::sleep::{Sleep, sleep};
use crate::time::{Elapsed, Timer};

/// Requires a future to complete before `duration` has elapsed on `timer`.
pub fn timeout<F>(timer: &Timer, duration: Duration, future: F) -> Timeout<'_, F::IntoFuture>
where
    F: IntoFuture,
{
    Timeout {
        sleep: sleep(timer, duration),
        future: future.into_future(),
    }
}

/// Future returned by [`timeout`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timeout<'timer, F> {
    #[pin]
    sleep: Sleep<'timer>,
    #[pin]
    future: F,
}

impl<F> Timeout<'_, F> {
    /// Consumes this timeout, returning the underlying future.
    pub fn into_inner(self) -> F {
        self.future
    }
}

impl<F: Future> Future for Timeout<'_, F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.project();

        if let Poll::Ready(v) = me.future.poll(cx) {
            return Poll::Ready(Ok(v));
        }

        match me.sleep.poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Elapsed(()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::time::Clock;
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn completes_before_the_deadline() {
        let timer = Timer::new(Clock::manual());
        let mut fut = tokio_test::task::spawn(timeout(&timer, Duration::from_secs(1), async { 7 }));
        assert_eq!(assert_ready!(fut.poll()), Ok(7));
    }

    #[test]
    fn elapses_when_the_inner_future_stalls() {
        let clock = Clock::manual();
        let timer = Timer::new(clock.clone());

        let mut fut = tokio_test::task::spawn(timeout(
            &timer,
            Duration::from_millis(10),
            core::future::pending::<()>(),
        ));
        assert_pending!(fut.poll());

        clock.advance(Duration::from_millis(10));
        timer.turn();
        assert!(fut.is_woken());
        assert_eq!(assert_ready!(fut.poll()), Err(Elapsed(())));
    }
}
