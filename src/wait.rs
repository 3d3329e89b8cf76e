// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The waiter substrate shared by every primitive in this crate.
//!
//! Each awaitable acquire operation is backed by a pooled [`Waiter`] handle.
//! The handle connects three concurrent actors through a single atomic state
//! machine: the *producer* that releases capacity, the *consumer* future that
//! awaits it, and a *cancellation source* (token or timer) that may fire at
//! any moment. Exactly one of them wins the transition out of
//! [`Phase::Pending`]; the losers observe the terminal phase and discard the
//! handle. Pending handles are queued on a [`WaitQueue`], a lock-free
//! segmented FIFO that supports in-place erasure so a cancelling waiter can
//! remove itself mid-queue without blocking anyone else.

pub(crate) mod cell;
pub(crate) mod list;
pub(crate) mod pool;
pub(crate) mod queue;
pub(crate) mod waiter;

pub(crate) use cell::WakerCell;
pub(crate) use list::WakerList;
pub(crate) use queue::WaitQueue;
pub(crate) use waiter::{Phase, Waiter};
