// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::marker::PhantomPinned;
use core::mem::offset_of;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::Poll;

use cordyceps::{Linked, List, list};
use spin::Mutex;

use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::time::clock::{Clock, Ticks};
use crate::wait::WakerCell;

/// A registry of pending one-shot sleeps.
///
/// The timer only needs to support one-shot delays, so pending entries live
/// on a single intrusive list rather than a hierarchical wheel; a turn walks
/// the list once.
pub struct Timer {
    clock: Clock,
    core: Mutex<Core>,
}

struct Core {
    entries: List<Entry>,
}

/// A pinned node in the timer's entry list.
#[derive(Debug)]
pub(in crate::time) struct Entry {
    pub(in crate::time) deadline: Ticks,
    pub(in crate::time) is_registered: AtomicBool,
    /// Fired by closing, which both wakes and marks the entry elapsed.
    pub(in crate::time) waker: WakerCell,
    links: list::Links<Entry>,
    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

// === impl Timer ===

impl Timer {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            core: Mutex::new(Core {
                entries: List::new(),
            }),
        }
    }

    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Fire every entry whose deadline has passed.
    ///
    /// Returns the number of entries fired and the earliest remaining
    /// deadline, which tells the host when to turn again.
    pub fn turn(&self) -> (usize, Option<Ticks>) {
        let mut core = self.core.lock();
        let now = self.clock.now_ticks();

        let mut keep = List::<Entry>::new();
        let mut expired = 0;
        let mut next: Option<Ticks> = None;

        while let Some(ptr) = core.entries.pop_back() {
            // Safety: registered entries are pinned by their sleep futures
            // and stay valid until cancelled under this lock.
            let entry = unsafe { ptr.as_ref() };
            if entry.deadline <= now {
                entry.fire();
                expired += 1;
            } else {
                if next.is_none_or(|n| entry.deadline < n) {
                    next = Some(entry.deadline);
                }
                keep.push_front(ptr);
            }
        }
        core.entries = keep;

        if expired > 0 {
            tracing::trace!(expired, "timer fired entries");
        }
        (expired, next)
    }

    /// Register `entry`, or fire it immediately if its deadline already
    /// passed.
    pub(in crate::time) fn register(&self, ptr: NonNull<Entry>) -> Poll<()> {
        let mut core = self.core.lock();
        // Safety: the caller promises the entry is pinned and valid.
        let entry = unsafe { ptr.as_ref() };

        if entry.deadline <= self.clock.now_ticks() {
            entry.fire();
            return Poll::Ready(());
        }

        let was_registered = entry.is_registered.swap(true, Ordering::AcqRel);
        debug_assert!(!was_registered, "sleep registered twice");
        core.entries.push_front(ptr);
        Poll::Pending
    }

    /// Remove `entry` if it is still queued; called when a sleep is dropped.
    pub(in crate::time) fn cancel(&self, entry: Pin<&mut Entry>) {
        let mut core = self.core.lock();
        // firing and registration both happen under the core lock, so this
        // re-check is authoritative
        if entry.is_registered.swap(false, Ordering::AcqRel) {
            // Safety: the registered bit proves the entry is on this list;
            // the pointer is only used to unlink it.
            unsafe {
                let ptr = NonNull::from(Pin::into_inner_unchecked(entry));
                core.entries.remove(ptr);
            }
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").field("clock", &self.clock).finish()
    }
}

// === impl Entry ===

impl Entry {
    pub(in crate::time) fn new(deadline: Ticks) -> Self {
        Self {
            deadline,
            is_registered: AtomicBool::new(false),
            waker: WakerCell::new(),
            links: list::Links::new(),
            _pin: PhantomPinned,
        }
    }

    pub(in crate::time) fn fire(&self) {
        self.is_registered.store(false, Ordering::Release);
        self.waker.close();
    }
}

// Safety: entries are only ever linked into one timer's list, and all list
// manipulation happens under that timer's core lock.
unsafe impl Linked<list::Links<Entry>> for Entry {
    type Handle = NonNull<Self>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }
    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }
    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}
