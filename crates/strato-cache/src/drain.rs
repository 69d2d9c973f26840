//! In-flight call accounting for the read-only drain.
//!
//! A [`CallCounter`] guards the entry points of a subsystem that must
//! quiesce before the cache degrades to read-only. Each call holds a
//! [`CallGuard`] for its duration; [`CallCounter::drain`] flips a monotonic
//! flag and waits until every call that started before the flip has
//! finished. Calls arriving after the flip proceed uncounted; they hit the
//! read-only refusal at the cache layer instead.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

const DRAIN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
pub struct CallCounter {
    draining: AtomicBool,
    inflight: AtomicI32,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one in-flight call. Drop the guard when the call ends.
    pub fn guard(&self) -> CallGuard<'_> {
        if self.draining.load(Ordering::SeqCst) {
            return CallGuard { counter: None };
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        CallGuard {
            counter: Some(&self.inflight),
        }
    }

    /// Stop counting new calls and wait for the in-flight ones. One-way.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        while self.inflight.load(Ordering::SeqCst) != 0 {
            thread::sleep(DRAIN_POLL);
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

pub struct CallGuard<'a> {
    counter: Option<&'a AtomicI32>,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
