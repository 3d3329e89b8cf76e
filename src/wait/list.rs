// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::task::Waker;

use spin::Mutex;

/// A slotted list of wakers for broadcast-style notification.
///
/// Each registrant owns one slot, identified by the key it passes back in.
/// [`wake_all`][WakerList::wake_all] drains the stored wakers but keeps the
/// slots reserved, so a woken future can re-register with the same key.
/// Waking happens after the lock is released.
pub(crate) struct WakerList {
    inner: Mutex<Slots>,
}

struct Slots {
    entries: Vec<Option<Waker>>,
    vacant: Vec<usize>,
}

impl WakerList {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                entries: Vec::new(),
                vacant: Vec::new(),
            }),
        }
    }

    /// Store `waker` in the slot named by `key`, allocating a slot on first
    /// registration.
    pub(crate) fn register(&self, key: &mut Option<usize>, waker: &Waker) {
        let mut slots = self.inner.lock();
        match key {
            Some(key) => match &mut slots.entries[*key] {
                Some(old) if old.will_wake(waker) => {}
                old => *old = Some(waker.clone()),
            },
            None => {
                let slot = if let Some(slot) = slots.vacant.pop() {
                    slots.entries[slot] = Some(waker.clone());
                    slot
                } else {
                    slots.entries.push(Some(waker.clone()));
                    slots.entries.len() - 1
                };
                *key = Some(slot);
            }
        }
    }

    /// Give the slot named by `key` back to the list.
    pub(crate) fn deregister(&self, key: &mut Option<usize>) {
        if let Some(key) = key.take() {
            let mut slots = self.inner.lock();
            slots.entries[key] = None;
            slots.vacant.push(key);
        }
    }

    /// Wake every registered waker. Slots stay reserved for their owners.
    pub(crate) fn wake_all(&self) {
        let wakers: Vec<Waker> = {
            let mut slots = self.inner.lock();
            slots
                .entries
                .iter_mut()
                .filter_map(|entry| entry.take())
                .collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl core::fmt::Debug for WakerList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WakerList").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_wake_reregister() {
        let list = WakerList::new();

        let mut a = tokio_test::task::spawn(());
        let mut b = tokio_test::task::spawn(());
        let mut key_a = None;
        let mut key_b = None;

        a.enter(|cx, _| list.register(&mut key_a, cx.waker()));
        b.enter(|cx, _| list.register(&mut key_b, cx.waker()));
        assert_ne!(key_a, key_b);

        list.wake_all();
        assert!(a.is_woken());
        assert!(b.is_woken());

        // slots survive a wake; re-registering reuses them
        let prev = key_a;
        a.enter(|cx, _| list.register(&mut key_a, cx.waker()));
        assert_eq!(prev, key_a);

        list.deregister(&mut key_a);
        assert_eq!(key_a, None);
        list.wake_all();
    }
}
