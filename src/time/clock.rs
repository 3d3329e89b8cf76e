// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

use crate::loom::sync::atomic::{AtomicU64, Ordering};

/// Nanoseconds since a [`Clock`]'s epoch.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Ticks(pub u64);

impl Ticks {
    pub(crate) fn after(self, duration: Duration) -> Ticks {
        Ticks(self.0.saturating_add(duration_to_ticks(duration)))
    }
}

pub(crate) fn duration_to_ticks(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// A source of time for a [`Timer`][crate::time::Timer].
#[derive(Clone)]
pub struct Clock {
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    System { epoch: Instant },
    Manual(Arc<AtomicU64>),
}

impl Clock {
    /// A clock backed by [`std::time::Instant`], starting at zero ticks now.
    pub fn system() -> Self {
        Self {
            kind: Kind::System {
                epoch: Instant::now(),
            },
        }
    }

    /// A clock that only moves when [`advance`][Clock::advance] is called.
    ///
    /// Clones share the same underlying time, so a test can hold one clone
    /// to drive time while a [`Timer`][crate::time::Timer] owns the other.
    pub fn manual() -> Self {
        Self {
            kind: Kind::Manual(Arc::new(AtomicU64::new(0))),
        }
    }

    pub fn now_ticks(&self) -> Ticks {
        match &self.kind {
            Kind::System { epoch } => Ticks(duration_to_ticks(epoch.elapsed())),
            Kind::Manual(now) => Ticks(now.load(Ordering::Acquire)),
        }
    }

    /// Move a manual clock forward.
    ///
    /// # Panics
    ///
    /// Panics when called on a [`system`][Clock::system] clock.
    pub fn advance(&self, duration: Duration) {
        match &self.kind {
            Kind::System { .. } => panic!("cannot advance a system clock"),
            Kind::Manual(now) => {
                now.fetch_add(duration_to_ticks(duration), Ordering::AcqRel);
            }
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            Kind::System { .. } => "system",
            Kind::Manual(_) => "manual",
        };
        f.debug_struct("Clock")
            .field("kind", &kind)
            .field("now", &self.now_ticks())
            .finish()
    }
}
