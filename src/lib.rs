// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous coordination primitives for cooperative task runtimes.
//!
//! This crate provides the building blocks producer/consumer code composes
//! to coordinate without blocking operating-system threads:
//!
//! - [`Counter`] — a non-negative counter with awaitable decrement,
//!   peek-decrement, and multi-counter [`decrement_any`][Counter::decrement_any]
//! - [`Semaphore`] — a bounded, resizable permit pool yielding scoped
//!   [`Permit`] release handles
//! - [`RwLock`] — a single-writer / multi-reader lock with configurable
//!   [`Policy`], upgrade, and downgrade
//! - [`KeyedMutex`] — mutual exclusion per key
//! - [`Queue`] — a bounded producer-consumer queue with closeable semantics
//!   and take-from-any / add-to-any
//! - [`TaskQueue`] — a chain that runs enqueued futures strictly one at a
//!   time, in order
//! - [`ActionFlag`] — a coalescing trigger that re-runs a callback at most
//!   once per flag-raise batch
//!
//! All primitives share one waiter substrate: acquire operations either
//! complete on a lock-free fast path or park a pooled waiter handle on a
//! lock-free FIFO queue. Every acquire future accepts an optional
//! [`CancelToken`][cancel::CancelToken] and/or a deadline on a
//! [`Timer`][time::Timer] (builder-style, before the first poll), and
//! dropping a future cancels its operation. A completion that was already
//! delivered always beats a late cancellation; an unconsumed completion is
//! rolled back when the future is dropped.
//!
//! The crate assumes a multi-threaded cooperative runtime but does not
//! provide one: any executor that polls futures and delivers wakeups works.
//! Deadlines require the host to drive a [`time::Timer`] by calling
//! [`turn`][time::Timer::turn].

mod action_flag;
pub mod cancel;
mod counter;
mod error;
mod keyed;
mod loom;
mod queue;
mod rwlock;
mod semaphore;
mod task_queue;
pub mod time;
mod wait;

pub use action_flag::{ActionFlag, ErrorPolicy, RunOptions, SetAndWait};
pub use counter::{Counter, Decrement, DecrementAny, PeekDecrement};
pub use error::{AcquireError, AddError, Closed, TakeError, TryAddError};
pub use keyed::{KeyGuard, KeyedMutex, Lock};
pub use queue::{Add, AddAny, AddMany, Queue, Take, TakeAny};
pub use rwlock::{Policy, Read, ReadGuard, RwLock, Upgrade, UpgradeFailed, Write, WriteGuard};
pub use semaphore::{Acquire, Permit, Semaphore};
pub use task_queue::{Enqueued, TaskQueue};
