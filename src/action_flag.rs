// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A coalescing trigger.
//!
//! [`set`][ActionFlag::set] raises a flag; a single background runner
//! (spawned by the host as the future returned by [`run`][ActionFlag::run])
//! executes a callback once per flag-raise *batch*: any number of sets that
//! land before or during an execution collapse into at most one follow-up
//! run. Between any two `set` calls the callback runs at least once after
//! the second call.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use crate::error::Closed;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::time::Timer;
use crate::wait::{WakerCell, WakerList};

const FLAG: usize = 0b001;
const RUNNING: usize = 0b010;
const CLOSED: usize = 0b100;

/// What the runner does when the callback fails.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ErrorPolicy {
    /// Close the flag and surface the error from [`ActionFlag::run`].
    #[default]
    Stop,
    /// Log the error and keep serving flag raises.
    Continue,
}

/// Options for [`ActionFlag::run`].
#[derive(Debug, Default)]
pub struct RunOptions<'t> {
    policy: ErrorPolicy,
    debounce: Option<(&'t Timer, Duration)>,
}

impl<'t> RunOptions<'t> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swallow (and log) callback errors instead of stopping the runner.
    pub fn continue_on_error(mut self) -> Self {
        self.policy = ErrorPolicy::Continue;
        self
    }

    /// Wait `delay` after noticing a raise before executing, so bursts of
    /// sets collapse into one run.
    pub fn debounce(mut self, timer: &'t Timer, delay: Duration) -> Self {
        self.debounce = Some((timer, delay));
        self
    }
}

/// A flag that runs a callback at most once per assertion batch.
pub struct ActionFlag {
    state: AtomicUsize,
    runner: WakerCell,
    /// Completed executions; `set_and_wait` waits on generation targets.
    runs: AtomicUsize,
    waiters: WakerList,
}

// === impl ActionFlag ===

impl ActionFlag {
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            runner: WakerCell::new(),
            runs: AtomicUsize::new(0),
            waiters: WakerList::new(),
        }
    }

    /// Raise the flag.
    ///
    /// From idle this schedules an execution; while one is already flagged
    /// or executing it coalesces into the next run. No-op once closed.
    pub fn set(&self) {
        let prev = self.state.fetch_or(FLAG, Ordering::AcqRel);
        if prev & CLOSED != 0 {
            return;
        }
        if prev & (FLAG | RUNNING) == 0 {
            self.runner.wake();
        }
    }

    /// Raise the flag and wait for the next full execution.
    ///
    /// A caller arriving while an execution is already underway waits for
    /// the *following* run, since the current one may have missed its raise.
    pub fn set_and_wait(&self) -> SetAndWait<'_> {
        let prev = self.state.fetch_or(FLAG, Ordering::AcqRel);
        if prev & (FLAG | RUNNING | CLOSED) == 0 {
            self.runner.wake();
        }
        let pending_runs = if prev & RUNNING != 0 { 2 } else { 1 };
        SetAndWait {
            flag: self,
            target: self.runs.load(Ordering::Acquire) + pending_runs,
            key: None,
        }
    }

    /// `true` while a raise is waiting to be served.
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) & FLAG != 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSED != 0
    }

    /// Completed executions so far.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Acquire)
    }

    /// Close the flag: the runner exits and pending waits fail.
    pub fn close(&self) {
        if self.state.fetch_or(CLOSED, Ordering::AcqRel) & CLOSED == 0 {
            self.runner.wake();
            self.waiters.wake_all();
        }
    }

    /// Serve the flag until it is closed (or, under
    /// [`ErrorPolicy::Stop`], until the callback fails).
    ///
    /// This is the background runner; the host spawns it. At most one runner
    /// may serve a flag at a time. The callback runs strictly serially.
    pub async fn run<F, Fut, E>(&self, options: RunOptions<'_>, mut action: F) -> Result<(), E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        loop {
            let live = core::future::poll_fn(|cx| self.poll_flagged(cx)).await;
            if !live {
                return Ok(());
            }

            if let Some((timer, delay)) = options.debounce {
                // raises landing inside this window join the batch
                crate::time::sleep(timer, delay).await;
            }

            // consume the flag; RUNNING parks later raises for a re-run
            let mut state = self.state.load(Ordering::Acquire);
            loop {
                match self.state.compare_exchange(
                    state,
                    (state & !FLAG) | RUNNING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => state = actual,
                }
            }

            let result = action().await;

            self.runs.fetch_add(1, Ordering::AcqRel);
            self.waiters.wake_all();
            self.state.fetch_and(!RUNNING, Ordering::AcqRel);

            if let Err(error) = result {
                match options.policy {
                    ErrorPolicy::Continue => {
                        tracing::warn!("action flag callback failed, continuing");
                    }
                    ErrorPolicy::Stop => {
                        self.close();
                        return Err(error);
                    }
                }
            }
        }
    }

    /// Wait until the flag is raised (`true`) or closed (`false`).
    fn poll_flagged(&self, cx: &mut Context<'_>) -> Poll<bool> {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & CLOSED != 0 {
                return Poll::Ready(false);
            }
            if state & FLAG != 0 {
                return Poll::Ready(true);
            }
            match self.runner.poll_wait(cx) {
                Poll::Ready(_) => continue,
                Poll::Pending => {
                    // a raise may have slipped in before our registration
                    let state = self.state.load(Ordering::Acquire);
                    if state & CLOSED != 0 {
                        return Poll::Ready(false);
                    }
                    if state & FLAG != 0 {
                        return Poll::Ready(true);
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl Default for ActionFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("ActionFlag")
            .field("flagged", &(state & FLAG != 0))
            .field("running", &(state & RUNNING != 0))
            .field("closed", &(state & CLOSED != 0))
            .field("runs", &self.runs())
            .finish()
    }
}

// === impl SetAndWait ===

/// Future returned by [`ActionFlag::set_and_wait`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct SetAndWait<'a> {
    flag: &'a ActionFlag,
    target: usize,
    key: Option<usize>,
}

impl Future for SetAndWait<'_> {
    type Output = Result<(), Closed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let flag = self.flag;
        if flag.runs() >= self.target {
            flag.waiters.deregister(&mut self.key);
            return Poll::Ready(Ok(()));
        }
        if flag.is_closed() {
            flag.waiters.deregister(&mut self.key);
            return Poll::Ready(Err(Closed(())));
        }

        flag.waiters.register(&mut self.key, cx.waker());

        // re-check; a run may have completed between the checks above and
        // our registration
        if flag.runs() >= self.target {
            flag.waiters.deregister(&mut self.key);
            return Poll::Ready(Ok(()));
        }
        if flag.is_closed() {
            flag.waiters.deregister(&mut self.key);
            return Poll::Ready(Err(Closed(())));
        }
        Poll::Pending
    }
}

impl Drop for SetAndWait<'_> {
    fn drop(&mut self) {
        self.flag.waiters.deregister(&mut self.key);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::counter::Counter;
    use crate::time::Clock;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok};

    #[test]
    fn bursts_of_sets_coalesce_into_two_runs() {
        let flag = ActionFlag::new();
        let gate = Counter::new(0);

        let mut runner = tokio_test::task::spawn(
            flag.run(RunOptions::new(), || async { gate.decrement().await }),
        );
        assert_pending!(runner.poll());
        assert_eq!(flag.runs(), 0);

        flag.set();
        assert!(runner.is_woken());
        // the callback is now executing, parked on the gate
        assert_pending!(runner.poll());

        // a burst of raises during the execution collapses into one re-run
        for _ in 0..100 {
            flag.set();
        }

        gate.increment().unwrap();
        assert!(runner.is_woken());
        assert_pending!(runner.poll());
        assert_eq!(flag.runs(), 1, "first batch served");

        gate.increment().unwrap();
        assert_pending!(runner.poll());
        assert_eq!(flag.runs(), 2, "burst coalesced into exactly one re-run");

        flag.close();
        assert!(runner.is_woken());
        assert_ready_ok!(runner.poll());
        assert_eq!(flag.runs(), 2);
    }

    #[test]
    fn set_and_wait_observes_the_next_execution() {
        let flag = ActionFlag::new();
        let mut runner = tokio_test::task::spawn(
            flag.run(RunOptions::new(), || async { Ok::<(), Closed>(()) }),
        );
        assert_pending!(runner.poll());

        let mut wait = tokio_test::task::spawn(flag.set_and_wait());
        assert_pending!(wait.poll());

        assert_pending!(runner.poll());
        assert!(wait.is_woken());
        assert_ready_ok!(wait.poll());
        assert_eq!(flag.runs(), 1);
    }

    #[test]
    fn waiting_during_execution_sees_the_following_run() {
        let flag = ActionFlag::new();
        let gate = Counter::new(0);
        let mut runner = tokio_test::task::spawn(
            flag.run(RunOptions::new(), || async { gate.decrement().await }),
        );
        assert_pending!(runner.poll());

        flag.set();
        assert_pending!(runner.poll()); // execution underway

        let mut late = tokio_test::task::spawn(flag.set_and_wait());
        assert_pending!(late.poll());

        gate.increment().unwrap();
        assert_pending!(runner.poll()); // first run done, re-run started
        assert_eq!(flag.runs(), 1);
        // the late waiter must not be satisfied by the run that may have
        // missed its raise
        assert_pending!(late.poll());

        gate.increment().unwrap();
        assert_pending!(runner.poll());
        assert_eq!(flag.runs(), 2);
        assert_ready_ok!(late.poll());
    }

    #[test]
    fn debounce_groups_raises_into_one_run() {
        let clock = Clock::manual();
        let timer = Timer::new(clock.clone());
        let flag = ActionFlag::new();

        let options = RunOptions::new().debounce(&timer, Duration::from_millis(10));
        let mut runner =
            tokio_test::task::spawn(flag.run(options, || async { Ok::<(), Closed>(()) }));
        assert_pending!(runner.poll());

        flag.set();
        assert_pending!(runner.poll()); // sleeping out the debounce window
        flag.set();
        flag.set();

        clock.advance(Duration::from_millis(10));
        timer.turn();
        assert!(runner.is_woken());
        assert_pending!(runner.poll());
        assert_eq!(flag.runs(), 1, "the whole burst became one run");
    }

    #[test]
    fn stop_policy_surfaces_the_error() {
        let flag = ActionFlag::new();
        let mut runner =
            tokio_test::task::spawn(flag.run(RunOptions::new(), || async { Err("boom") }));
        assert_pending!(runner.poll());

        flag.set();
        assert_eq!(assert_ready_err!(runner.poll()), "boom");
        assert!(flag.is_closed());
    }

    #[test]
    fn continue_policy_keeps_serving() {
        let flag = ActionFlag::new();
        let options = RunOptions::new().continue_on_error();
        let mut runner =
            tokio_test::task::spawn(flag.run(options, || async { Err::<(), _>("boom") }));
        assert_pending!(runner.poll());

        flag.set();
        assert_pending!(runner.poll());
        assert_eq!(flag.runs(), 1);

        flag.set();
        assert_pending!(runner.poll());
        assert_eq!(flag.runs(), 2);
    }

    #[test]
    fn close_fails_pending_waits() {
        let flag = ActionFlag::new();
        let mut wait = tokio_test::task::spawn(flag.set_and_wait());
        assert_pending!(wait.poll());

        flag.close();
        assert!(wait.is_woken());
        assert_ready_err!(wait.poll());

        // setting a closed flag is a no-op
        flag.set();
        assert!(!flag.is_set() || flag.is_closed());
    }
}
