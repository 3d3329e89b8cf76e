// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::hash::Hash;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use pin_project::{pin_project, pinned_drop};
use spin::Mutex;

use crate::cancel::{CancelToken, Harness};
use crate::error::AcquireError;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::time::Timer;
use crate::wait::{Phase, WaitQueue, Waiter, pool};

/// Mutual exclusion per key.
///
/// An entry materialises on the first acquire of a key and disappears once
/// nobody holds or waits for it, so the map only ever contains live keys.
/// Keys compare by value.
pub struct KeyedMutex<K> {
    map: Mutex<HashMap<K, Arc<Entry>>>,
}

struct Entry {
    /// Only written under the map lock.
    held: AtomicBool,
    queue: WaitQueue,
}

// === impl KeyedMutex ===

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Number of keys currently held or waited for.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Take the lock for `key` if nobody holds it.
    pub fn try_lock(&self, key: K) -> Option<KeyGuard<'_, K>> {
        let mut map = self.map.lock();
        let entry = map.entry(key.clone()).or_insert_with(|| {
            Arc::new(Entry {
                held: AtomicBool::new(false),
                queue: WaitQueue::new(),
            })
        });
        if entry.held.load(Ordering::Relaxed) {
            return None;
        }
        entry.held.store(true, Ordering::Relaxed);
        drop(map);
        Some(KeyGuard {
            keyed: self,
            key,
            released: false,
        })
    }

    /// Wait for the lock on `key`.
    pub fn lock(&self, key: K) -> Lock<'_, K> {
        Lock {
            keyed: self,
            key: Some(key),
            waiter: None,
            harness: Harness::new(),
        }
    }

    fn unlock(&self, key: &K) {
        let handoff = {
            let mut map = self.map.lock();
            let Some(entry) = map.get(key) else {
                debug_assert!(false, "released a key that has no entry");
                return;
            };
            let entry = Arc::clone(entry);
            loop {
                match entry.queue.pop() {
                    Some(waiter) => {
                        if waiter.transition(Phase::Completed) {
                            // ownership passes straight to the next waiter
                            break Some(waiter);
                        }
                        pool::release(waiter);
                    }
                    None => {
                        entry.held.store(false, Ordering::Relaxed);
                        if entry.queue.is_empty() {
                            map.remove(key);
                        }
                        break None;
                    }
                }
            }
        };
        if let Some(waiter) = handoff {
            waiter.wake();
            pool::release(waiter);
        }
    }

    /// Drop the entry for `key` if it is neither held nor waited for; run
    /// after a waiter cancels.
    fn prune(&self, key: &K) {
        let mut map = self.map.lock();
        if let Some(entry) = map.get(key) {
            if !entry.held.load(Ordering::Relaxed) && entry.queue.is_empty() {
                map.remove(key);
            }
        }
    }
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for KeyedMutex<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedMutex")
            .field("keys", &self.map.lock().len())
            .finish()
    }
}

// === impl Lock ===

/// Future returned by [`KeyedMutex::lock`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Lock<'a, K>
where
    K: Eq + Hash + Clone,
{
    keyed: &'a KeyedMutex<K>,
    key: Option<K>,
    waiter: Option<Arc<Waiter>>,
    #[pin]
    harness: Harness<'a>,
}

impl<'a, K> Lock<'a, K>
where
    K: Eq + Hash + Clone,
{
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

impl<'a, K> Future for Lock<'a, K>
where
    K: Eq + Hash + Clone,
{
    type Output = Result<KeyGuard<'a, K>, AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let keyed: &'a KeyedMutex<K> = *this.keyed;

        if this.waiter.is_none() {
            let key = this.key.as_ref().expect("Lock polled after completion");
            let mut map = keyed.map.lock();
            let entry = map.entry(key.clone()).or_insert_with(|| {
                Arc::new(Entry {
                    held: AtomicBool::new(false),
                    queue: WaitQueue::new(),
                })
            });
            if !entry.held.load(Ordering::Relaxed) {
                entry.held.store(true, Ordering::Relaxed);
                drop(map);
                let key = this.key.take().expect("key checked above");
                return Poll::Ready(Ok(KeyGuard {
                    keyed,
                    key,
                    released: false,
                }));
            }
            if this.harness.immediate {
                return Poll::Ready(Err(AcquireError::TimedOut));
            }
            // every holder/waiter transition happens under the map lock, so
            // enqueueing here cannot lose a wakeup
            let waiter = pool::checkout(0);
            entry.queue.push(&waiter);
            *this.waiter = Some(waiter);
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
                return Poll::Ready(match phase {
                    Phase::Completed => {
                        let key = this.key.take().expect("completed twice");
                        Ok(KeyGuard {
                            keyed,
                            key,
                            released: false,
                        })
                    }
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
                        let key = this.key.take().expect("key still present");
                        if let Some(entry) = keyed.map.lock().get(&key).cloned() {
                            entry.queue.erase(&waiter);
                        }
                        keyed.prune(&key);
                        pool::release(waiter);
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
impl<K> PinnedDrop for Lock<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(mut self: Pin<&mut Self>) {
        let this = self.project();
        let keyed = *this.keyed;
        if let Some(waiter) = this.waiter.take() {
            let key = this.key.take().expect("waiting implies a key");
            if waiter.transition(Phase::Cancelled) {
                if let Some(entry) = keyed.map.lock().get(&key).cloned() {
                    entry.queue.erase(&waiter);
                }
                keyed.prune(&key);
            } else if waiter.phase() == Phase::Completed {
                // the key was handed to us but never consumed
                keyed.unlock(&key);
            }
            pool::release(waiter);
        }
    }
}

impl<K> fmt::Debug for Lock<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("waiting", &self.waiter.is_some())
            .finish()
    }
}

// === impl KeyGuard ===

/// A held per-key lock; releases on first drop.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    keyed: &'a KeyedMutex<K>,
    key: K,
    released: bool,
}

impl<K> KeyGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Release the key now instead of at end of scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !core::mem::replace(&mut self.released, true) {
            self.keyed.unlock(&self.key);
        }
    }
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<K> fmt::Debug for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok};

    #[test]
    fn distinct_keys_do_not_contend() {
        let keyed = KeyedMutex::new();
        let a = keyed.try_lock("a").unwrap();
        let b = keyed.try_lock("b").unwrap();
        assert_eq!(keyed.len(), 2);
        assert!(keyed.try_lock("a").is_none());
        drop(a);
        drop(b);
        assert!(keyed.is_empty(), "idle entries must be pruned");
    }

    #[test]
    fn same_key_hands_off_fifo() {
        let keyed = KeyedMutex::new();
        let held = keyed.try_lock(7).unwrap();

        let mut first = tokio_test::task::spawn(keyed.lock(7));
        let mut second = tokio_test::task::spawn(keyed.lock(7));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        drop(held);
        assert!(first.is_woken());
        let guard = assert_ready_ok!(first.poll());
        assert_eq!(*guard.key(), 7);
        assert_pending!(second.poll());

        guard.release();
        assert_ready_ok!(second.poll());
    }

    #[test]
    fn cancelling_the_last_waiter_prunes_the_entry() {
        let keyed = KeyedMutex::new();
        let source = CancelSource::new();
        let token = source.token();
        let held = keyed.try_lock("key").unwrap();

        let mut waiting = tokio_test::task::spawn(keyed.lock("key").cancel_on(&token));
        assert_pending!(waiting.poll());

        source.cancel();
        assert_eq!(assert_ready_err!(waiting.poll()), AcquireError::Cancelled);
        drop(waiting);

        drop(held);
        assert!(keyed.is_empty());
    }

    #[test]
    fn zero_deadline_is_try_only() {
        let timer = Timer::new(crate::time::Clock::manual());
        let keyed = KeyedMutex::new();
        let _held = keyed.try_lock(1).unwrap();

        let mut fut = tokio_test::task::spawn(keyed.lock(1).deadline(&timer, Duration::ZERO));
        assert_eq!(assert_ready_err!(fut.poll()), AcquireError::TimedOut);
    }

    #[test]
    fn unconsumed_handoff_is_released_on_drop() {
        let keyed = KeyedMutex::new();
        let held = keyed.try_lock("k").unwrap();

        let mut waiting = tokio_test::task::spawn(keyed.lock("k"));
        assert_pending!(waiting.poll());

        drop(held); // hands the key to the waiter
        drop(waiting); // which never consumed it

        assert!(keyed.try_lock("k").is_some());
    }
}
