// Copyright (C) 2022-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of gelf-tracing.
//
// gelf-tracing is free software: you can redistribute it and/or modify it under the terms of the
// GNU General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// gelf-tracing is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with gelf-tracing.  If
// not, see <http://www.gnu.org/licenses/>.
//! Delivery counters.
//!
//! Nothing that goes wrong between encoding & the wire is ever reported to the thread that
//! produced the event; it is counted here instead (& logged at `debug`).

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, lock-free counters; cheap to bump from any thread.
#[derive(Debug, Default)]
pub struct Stats {
    /// Messages offered to the client
    pub(crate) submitted: AtomicU64,
    /// Messages placed on the delivery queue
    pub(crate) enqueued: AtomicU64,
    /// Submissions refused because the queue was full
    pub(crate) overflowed: AtomicU64,
    /// Submissions refused because the client was shutting down
    pub(crate) rejected_closed: AtomicU64,
    /// Payloads handed to the OS without error
    pub(crate) sent: AtomicU64,
    /// Payloads lost to non-retryable transport errors
    pub(crate) send_errors: AtomicU64,
    /// Payloads dropped while the connection was down & no retry buffer was configured
    pub(crate) dropped_disconnected: AtomicU64,
    /// Payloads dropped because the retry buffer was full
    pub(crate) dropped_retry_full: AtomicU64,
    /// Payloads sent successfully from the retry buffer
    pub(crate) retried: AtomicU64,
    /// Payloads still queued when the shutdown grace period expired
    pub(crate) dropped_shutdown: AtomicU64,
    /// Messages that could not be encoded within the size limits
    pub(crate) encode_errors: AtomicU64,
    /// Messages that failed validation
    pub(crate) validation_errors: AtomicU64,
    /// Payloads sent uncompressed because compression failed
    pub(crate) compression_fallbacks: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }
    /// Take a point-in-time copy of the counters.
    ///
    /// The counters are read individually, so a snapshot taken while messages are in flight
    /// may be very slightly inconsistent (e.g. `sent` may include a message not yet reflected
    /// in `enqueued`).
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            submitted: get(&self.submitted),
            enqueued: get(&self.enqueued),
            overflowed: get(&self.overflowed),
            rejected_closed: get(&self.rejected_closed),
            sent: get(&self.sent),
            send_errors: get(&self.send_errors),
            dropped_disconnected: get(&self.dropped_disconnected),
            dropped_retry_full: get(&self.dropped_retry_full),
            retried: get(&self.retried),
            dropped_shutdown: get(&self.dropped_shutdown),
            encode_errors: get(&self.encode_errors),
            validation_errors: get(&self.validation_errors),
            compression_fallbacks: get(&self.compression_fallbacks),
        }
    }
}

/// A copy of [`Stats`] at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub enqueued: u64,
    pub overflowed: u64,
    pub rejected_closed: u64,
    pub sent: u64,
    pub send_errors: u64,
    pub dropped_disconnected: u64,
    pub dropped_retry_full: u64,
    pub retried: u64,
    pub dropped_shutdown: u64,
    pub encode_errors: u64,
    pub validation_errors: u64,
    pub compression_fallbacks: u64,
}

impl StatsSnapshot {
    /// Every message that was accepted but will never reach the wire
    pub fn dropped(&self) -> u64 {
        self.send_errors + self.dropped_disconnected + self.dropped_retry_full + self.dropped_shutdown
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "submitted {}, sent {}, overflowed {}, dropped {}, encode errors {}",
            self.submitted,
            self.sent,
            self.overflowed,
            self.dropped(),
            self.encode_errors
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot() {
        let stats = Stats::new();
        bump(&stats.submitted);
        bump(&stats.submitted);
        bump(&stats.sent);
        add(&stats.dropped_shutdown, 3);
        bump(&stats.send_errors);
        let snap = stats.snapshot();
        assert_eq!(snap.submitted, 2);
        assert_eq!(snap.sent, 1);
        assert_eq!(snap.dropped(), 4);
        assert_eq!(
            format!("{}", snap),
            "submitted 2, sent 1, overflowed 0, dropped 4, encode errors 0"
        );
    }
}
