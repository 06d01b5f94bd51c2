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

use core::{num::NonZeroU32, time::Duration};

/// What to do when a request can't be allocated because too many requests are already in
/// flight on the context.
///
/// This situation is temporary: it ends as soon as the backend answers a request. All other
/// allocation failures are permanent and are never retried. A retry blocks until a request
/// completes, or for at most [`Config::alloc_wait`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry until the allocation succeeds or becomes impossible.
    Unbounded,
    /// Retry at most this number of times, then fail the operation.
    Bounded(NonZeroU32),
}

impl RetryPolicy {
    /// Returns true if an allocation that has already been retried `retries` times may be
    /// attempted again.
    pub fn allows(&self, retries: u32) -> bool {
        match self {
            RetryPolicy::Unbounded => true,
            RetryPolicy::Bounded(max) => retries < max.get(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Unbounded
    }
}

/// Configuration shared by all the contexts of a [`System`](crate::System).
///
/// See the methods of [`SystemBuilder`](crate::SystemBuilder) for the meaning of each field.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) num_contexts: u32,
    pub(crate) page_size: usize,
    pub(crate) max_pages_per_request: usize,
    pub(crate) max_background: usize,
    pub(crate) alloc_retry: RetryPolicy,
    pub(crate) alloc_wait: Duration,
}

impl Config {
    /// Number of contexts.
    pub fn num_contexts(&self) -> u32 {
        self.num_contexts
    }

    /// Size in bytes of a data page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Maximum number of data pages of a single request.
    pub fn max_pages_per_request(&self) -> usize {
        self.max_pages_per_request
    }

    /// Maximum number of I/O requests in flight per context.
    pub fn max_background(&self) -> usize {
        self.max_background
    }

    /// Policy applied when allocating a request.
    pub fn alloc_retry(&self) -> RetryPolicy {
        self.alloc_retry
    }

    /// Longest time a congested dispatch blocks before counting a retry.
    pub fn alloc_wait(&self) -> Duration {
        self.alloc_wait
    }

    /// Number of roster entries that fit in a single page of the handshake.
    pub fn roster_entries_per_page(&self) -> usize {
        self.page_size / pxd_interface::ffi::DEV_ID_ENCODED_LEN
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_contexts: 10,
            page_size: 4096,
            max_pages_per_request: 256,
            max_background: 64,
            alloc_retry: RetryPolicy::Unbounded,
            alloc_wait: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, RetryPolicy};
    use core::num::NonZeroU32;

    #[test]
    fn retry_policy() {
        assert!(RetryPolicy::Unbounded.allows(u32::MAX));
        let bounded = RetryPolicy::Bounded(NonZeroU32::new(2).unwrap());
        assert!(bounded.allows(0));
        assert!(bounded.allows(1));
        assert!(!bounded.allows(2));
    }

    #[test]
    fn default_roster_capacity() {
        assert_eq!(Config::default().roster_entries_per_page(), 341);
    }
}
