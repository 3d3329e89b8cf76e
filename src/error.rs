// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Error returned when a primitive was closed while (or before) an operation
/// was pending on it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl core::error::Error for Closed {}

/// The ways an awaitable acquire operation can fail.
///
/// Every waiter owns exactly one error slot; at most one of these is ever
/// delivered per operation, and delivery happens at most once.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AcquireError {
    /// The caller's cancellation token fired before the operation completed.
    Cancelled,
    /// The deadline supplied for this operation elapsed. The internal timer
    /// entry is not exposed.
    TimedOut,
    /// The primitive was closed while the operation was pending.
    Closed,
}

impl From<Closed> for AcquireError {
    fn from(_: Closed) -> Self {
        Self::Closed
    }
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::Cancelled => f.write_str("operation was cancelled"),
            AcquireError::TimedOut => f.write_str("operation timed out"),
            AcquireError::Closed => f.write_str("primitive was closed"),
        }
    }
}

impl core::error::Error for AcquireError {}

/// Error returned by [`Queue::add`][crate::Queue::add] and friends, carrying
/// the rejected item back to the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddError<T> {
    /// The caller's cancellation token fired before a slot became free.
    Cancelled(T),
    /// The deadline elapsed before a slot became free.
    TimedOut(T),
    /// [`complete_adding`][crate::Queue::complete_adding] was called, either
    /// before this add started or while it was waiting for a slot.
    Completed(T),
}

impl<T> AddError<T> {
    pub(crate) fn from_acquire(err: AcquireError, item: T) -> Self {
        match err {
            AcquireError::Cancelled => AddError::Cancelled(item),
            AcquireError::TimedOut => AddError::TimedOut(item),
            AcquireError::Closed => AddError::Completed(item),
        }
    }

    /// Returns the item that could not be added.
    pub fn into_inner(self) -> T {
        match self {
            AddError::Cancelled(item) | AddError::TimedOut(item) | AddError::Completed(item) => {
                item
            }
        }
    }
}

impl<T> fmt::Display for AddError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddError::Cancelled(_) => f.write_str("add was cancelled"),
            AddError::TimedOut(_) => f.write_str("add timed out"),
            AddError::Completed(_) => f.write_str("adding was completed"),
        }
    }
}

impl<T: fmt::Debug> core::error::Error for AddError<T> {}

/// Error returned by [`Queue::try_add`][crate::Queue::try_add], carrying the
/// rejected item back to the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TryAddError<T> {
    /// The queue is at capacity (or earlier adds are still queued ahead).
    Full(T),
    /// Adding has been completed; no further items are accepted.
    Completed(T),
}

impl<T> TryAddError<T> {
    /// Returns the item that could not be added.
    pub fn into_inner(self) -> T {
        match self {
            TryAddError::Full(item) | TryAddError::Completed(item) => item,
        }
    }
}

impl<T> fmt::Display for TryAddError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryAddError::Full(_) => f.write_str("queue is full"),
            TryAddError::Completed(_) => f.write_str("adding was completed"),
        }
    }
}

impl<T: fmt::Debug> core::error::Error for TryAddError<T> {}

/// Error returned by [`Queue::take`][crate::Queue::take] and friends.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TakeError {
    /// The caller's cancellation token fired before an item arrived.
    Cancelled,
    /// The deadline elapsed before an item arrived.
    TimedOut,
    /// Adding was completed and every item has been taken; no item will ever
    /// arrive.
    Completed,
}

impl TakeError {
    pub(crate) fn from_acquire(err: AcquireError) -> Self {
        match err {
            AcquireError::Cancelled => TakeError::Cancelled,
            AcquireError::TimedOut => TakeError::TimedOut,
            AcquireError::Closed => TakeError::Completed,
        }
    }
}

impl fmt::Display for TakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TakeError::Cancelled => f.write_str("take was cancelled"),
            TakeError::TimedOut => f.write_str("take timed out"),
            TakeError::Completed => f.write_str("queue was drained after adding completed"),
        }
    }
}

impl core::error::Error for TakeError {}
