// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide recycling of waiter handles.
//!
//! Acquire operations on a warm path allocate nothing: handles come out of a
//! shared bag and go back once both logical owners (the caller's future and
//! the queue slot) have released them. Stale `Arc` clones held briefly by a
//! party that already released its logical reference are harmless; they never
//! touch the handle again.
//!
//! Handle memory is *immortal*: the shelf keeps every retired handle and
//! never frees one, so the population is bounded by the high-water mark of
//! concurrent waiters. The lock-free peek path depends on this — it reads a
//! raw slot pointer that a racing removal may have already reclaimed, which
//! is only sound because the allocation behind it cannot go away.

use std::sync::Arc;

use crate::loom::sync::atomic::Ordering;
use crate::wait::Waiter;

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        // Pooling across loom executions would leak model state; allocate
        // fresh handles instead. Handles are not immortal under loom, so the
        // queue's peek path must not be exercised in loom models.
        pub(crate) fn checkout(tag: usize) -> Arc<Waiter> {
            let waiter = Arc::new(Waiter::new());
            waiter.prepare(tag);
            waiter
        }

        pub(crate) fn release(waiter: Arc<Waiter>) {
            let _ = waiter.refs.fetch_sub(1, Ordering::AcqRel);
        }
    } else {
        use spin::Mutex;

        static SHELF: Mutex<Vec<Arc<Waiter>>> = Mutex::new(Vec::new());

        /// Take a handle out of the bag (or allocate one) and arm it.
        pub(crate) fn checkout(tag: usize) -> Arc<Waiter> {
            let waiter = SHELF
                .lock()
                .pop()
                .unwrap_or_else(|| Arc::new(Waiter::new()));
            waiter.prepare(tag);
            waiter
        }

        /// Drop one logical reference; the last owner recycles the handle.
        ///
        /// The shelf is unbounded on purpose: a retired handle must stay
        /// allocated forever (see the module docs).
        pub(crate) fn release(waiter: Arc<Waiter>) {
            if waiter.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                waiter.recycle();
                SHELF.lock().push(waiter);
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::wait::Phase;

    #[test]
    fn recycled_handle_is_reset() {
        let w = checkout(42);
        assert_eq!(w.phase(), Phase::Pending);
        assert_eq!(w.tag(), 42);

        assert!(w.transition(Phase::Completed));
        release(w);

        let w = checkout(0);
        assert_eq!(w.phase(), Phase::Pending);
        assert_eq!(w.tag(), 0);
        release(w);
    }

    #[test]
    fn release_waits_for_all_owners() {
        let w = checkout(1);
        w.add_ref(); // simulated queue reference
        let queue_side = w.clone();

        release(w);
        // still owned by the queue side; must not have been recycled
        assert_eq!(queue_side.phase(), Phase::Pending);
        release(queue_side);
    }
}
