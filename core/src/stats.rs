// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Statistics about devices and contexts.
//!
//! All the counters are updated atomically and can be read at any time with a snapshot.
//! Snapshots of counters that are updated concurrently aren't necessarily consistent with each
//! other, but each individual counter is exact.

use core::{convert::TryFrom as _, sync::atomic::Ordering, time::Duration};
use pxd_interface::ffi::SECTOR_SIZE;

/// Direction of an operation, for the purpose of statistics.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Reads.
    Read,
    /// Writes and discards.
    Write,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

/// Counters of a single device.
#[derive(Debug, Default)]
pub(crate) struct DeviceStats {
    ios: [atomic::Atomic<u64>; 2],
    sectors: [atomic::Atomic<u64>; 2],
    latency_ns: [atomic::Atomic<u64>; 2],
    discards: atomic::Atomic<u64>,
    errors: atomic::Atomic<u64>,
    alloc_retries: atomic::Atomic<u64>,
}

impl DeviceStats {
    /// Reports that an operation has completed.
    pub fn record_completion(
        &self,
        direction: Direction,
        bytes: u32,
        discard: bool,
        failed: bool,
        latency: Duration,
    ) {
        let i = direction.index();
        self.ios[i].fetch_add(1, Ordering::Relaxed);
        self.sectors[i].fetch_add(u64::from(bytes / SECTOR_SIZE), Ordering::Relaxed);
        let latency_ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.latency_ns[i].fetch_add(latency_ns, Ordering::Relaxed);
        if discard {
            self.discards.fetch_add(1, Ordering::Relaxed);
        }
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reports that allocating a request had to be retried.
    pub fn record_alloc_retries(&self, retries: u32) {
        self.alloc_retries
            .fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    /// Reports an operation that failed before being dispatched.
    pub fn record_dispatch_failure(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ios: [
                self.ios[0].load(Ordering::Relaxed),
                self.ios[1].load(Ordering::Relaxed),
            ],
            sectors: [
                self.sectors[0].load(Ordering::Relaxed),
                self.sectors[1].load(Ordering::Relaxed),
            ],
            latency_ns: [
                self.latency_ns[0].load(Ordering::Relaxed),
                self.latency_ns[1].load(Ordering::Relaxed),
            ],
            discards: self.discards.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            alloc_retries: self.alloc_retries.load(Ordering::Relaxed),
        }
    }
}

/// Copy of the counters of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    ios: [u64; 2],
    sectors: [u64; 2],
    latency_ns: [u64; 2],
    /// Number of discards. Discards are also counted as writes.
    pub discards: u64,
    /// Number of operations that completed with an error.
    pub errors: u64,
    /// Total number of times allocating a request had to be retried.
    pub alloc_retries: u64,
}

impl StatsSnapshot {
    /// Number of completed operations in this direction.
    pub fn ios(&self, direction: Direction) -> u64 {
        self.ios[direction.index()]
    }

    /// Number of sectors transferred in this direction.
    pub fn sectors(&self, direction: Direction) -> u64 {
        self.sectors[direction.index()]
    }

    /// Total time spent between dispatch and completion in this direction.
    pub fn total_latency(&self, direction: Direction) -> Duration {
        Duration::from_nanos(self.latency_ns[direction.index()])
    }
}

/// Counters of a context.
#[derive(Debug, Default)]
pub(crate) struct ContextStats {
    pub requests_sent: atomic::Atomic<u64>,
    pub replies_received: atomic::Atomic<u64>,
    pub requests_cancelled: atomic::Atomic<u64>,
    pub handshakes: atomic::Atomic<u64>,
}

impl ContextStats {
    pub fn snapshot(&self) -> ContextStatsSnapshot {
        ContextStatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            handshakes: self.handshakes.load(Ordering::Relaxed),
        }
    }
}

/// Copy of the counters of a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextStatsSnapshot {
    /// Requests queued on the control conduit, handshakes included.
    pub requests_sent: u64,
    /// Replies written by the backend.
    pub replies_received: u64,
    /// Requests completed without a reply, because of a device removal or an abort.
    pub requests_cancelled: u64,
    /// Handshake replies received.
    pub handshakes: u64,
}

#[cfg(test)]
mod tests {
    use super::{DeviceStats, Direction};
    use core::time::Duration;
    use std::{sync::Arc, thread};

    #[test]
    fn discards_count_as_writes() {
        let stats = DeviceStats::default();
        stats.record_completion(Direction::Write, 8192, true, false, Duration::from_micros(3));
        stats.record_completion(Direction::Read, 4096, false, true, Duration::from_micros(1));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ios(Direction::Write), 1);
        assert_eq!(snapshot.sectors(Direction::Write), 16);
        assert_eq!(snapshot.ios(Direction::Read), 1);
        assert_eq!(snapshot.sectors(Direction::Read), 8);
        assert_eq!(snapshot.discards, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.total_latency(Direction::Write), Duration::from_micros(3));
    }

    #[test]
    fn concurrent_updates_are_exact() {
        let stats = Arc::new(DeviceStats::default());
        let threads = (0..8)
            .map(|_| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_completion(
                            Direction::Read,
                            512,
                            false,
                            false,
                            Duration::from_nanos(1),
                        );
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(stats.snapshot().ios(Direction::Read), 8000);
        assert_eq!(stats.snapshot().sectors(Direction::Read), 8000);
    }
}
