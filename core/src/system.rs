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

use crate::config::{Config, RetryPolicy};
use crate::context::Context;
use crate::host::{BlockHost, HeadlessHost};
use crate::id_pool::IdPool;

use core::{fmt, time::Duration};
use pxd_interface::ffi::{DEV_ID_ENCODED_LEN, MINORBITS};
use std::sync::Arc;

/// Name under which the first context is also reachable.
const DEFAULT_CONTEXT_NAME: &str = "pxd-control";

/// Collection of contexts sharing the same pool of local indices and the same host adapter.
pub struct System {
    contexts: Vec<Arc<Context>>,
    shared: Arc<Shared>,
}

/// State shared between all the contexts of a [`System`].
pub(crate) struct Shared {
    pub config: Config,
    /// Local indices of the devices. Allocated across all the contexts.
    pub minors: IdPool,
    pub host: Arc<dyn BlockHost>,
    /// Major number reported by `host`.
    pub major: u32,
}

/// Prototype for a [`System`].
pub struct SystemBuilder {
    config: Config,
    host: Option<Arc<dyn BlockHost>>,
}

impl SystemBuilder {
    /// Starts building a [`System`] with the default configuration.
    pub fn new() -> Self {
        SystemBuilder {
            config: Config::default(),
            host: None,
        }
    }

    /// Sets the number of contexts.
    ///
    /// # Panic
    ///
    /// Panics if `num` is 0.
    pub fn with_num_contexts(mut self, num: u32) -> Self {
        assert_ne!(num, 0);
        self.config.num_contexts = num;
        self
    }

    /// Sets the size of a data page. The pages of the handshake contain as many devices as
    /// fit in this size.
    ///
    /// # Panic
    ///
    /// Panics if a page can't contain a single device.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        assert!(page_size >= DEV_ID_ENCODED_LEN);
        self.config.page_size = page_size;
        self
    }

    /// Sets the maximum number of data pages of an I/O operation. Operations with more
    /// segments than that fail.
    pub fn with_max_pages_per_request(mut self, max: usize) -> Self {
        self.config.max_pages_per_request = max;
        self
    }

    /// Sets the maximum number of I/O requests in flight per context.
    ///
    /// # Panic
    ///
    /// Panics if `max` is 0.
    pub fn with_max_background(mut self, max: usize) -> Self {
        assert_ne!(max, 0);
        self.config.max_background = max;
        self
    }

    /// Sets what happens when an I/O operation is dispatched while too many requests are
    /// already in flight.
    pub fn with_alloc_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.alloc_retry = policy;
        self
    }

    /// Sets how long a congested dispatch waits for a request to complete before counting a
    /// retry. Each completion also counts as a retry.
    ///
    /// # Panic
    ///
    /// Panics if `wait` is zero.
    pub fn with_alloc_wait(mut self, wait: Duration) -> Self {
        assert_ne!(wait, Duration::from_secs(0));
        self.config.alloc_wait = wait;
        self
    }

    /// Sets the adapter used to expose devices. Defaults to a [`HeadlessHost`].
    pub fn with_host(mut self, host: Arc<dyn BlockHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Builds the [`System`].
    pub fn build(self) -> System {
        let host = self
            .host
            .unwrap_or_else(|| Arc::new(HeadlessHost::default()));

        let shared = Arc::new(Shared {
            major: host.major(),
            minors: IdPool::new(1..(1 << MINORBITS)),
            host,
            config: self.config,
        });

        let contexts = (0..shared.config.num_contexts)
            .map(|index| Arc::new(Context::new(index, shared.clone())))
            .collect::<Vec<_>>();

        log::info!(
            "pxd driver loaded: {} contexts, major {}",
            contexts.len(),
            shared.major
        );

        System { contexts, shared }
    }
}

impl Default for SystemBuilder {
    fn default() -> Self {
        SystemBuilder::new()
    }
}

impl fmt::Debug for SystemBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SystemBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl System {
    /// Returns the context with the given index.
    pub fn context(&self, index: u32) -> Option<&Arc<Context>> {
        self.contexts.get(index as usize)
    }

    /// Returns the context whose control conduit has the given name.
    pub fn context_by_name(&self, name: &str) -> Option<&Arc<Context>> {
        if name == DEFAULT_CONTEXT_NAME {
            return Some(self.default_context());
        }
        self.contexts.iter().find(|c| c.name() == name)
    }

    /// Returns the first context.
    pub fn default_context(&self) -> &Arc<Context> {
        // The builder guarantees that there's at least one context.
        &self.contexts[0]
    }

    /// Returns all the contexts.
    pub fn contexts(&self) -> &[Arc<Context>] {
        &self.contexts
    }

    /// Configuration the system has been built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Major number of all the devices.
    pub fn major(&self) -> u32 {
        self.shared.major
    }

    /// Total number of devices across all the contexts.
    pub fn num_devices(&self) -> usize {
        self.contexts.iter().map(|c| c.num_devices()).sum()
    }

    /// Fails all the requests that haven't completed yet, in all the contexts.
    pub fn shutdown(self) {
        let aborted = self.contexts.iter().map(|c| c.abort()).sum::<usize>();
        log::info!("pxd driver unloaded, {} requests aborted", aborted);
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.contexts.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::SystemBuilder;

    #[test]
    fn context_names() {
        let system = SystemBuilder::new().with_num_contexts(3).build();
        assert_eq!(system.contexts().len(), 3);
        assert_eq!(system.context(2).unwrap().name(), "pxd-control-2");
        assert_eq!(system.context_by_name("pxd-control").unwrap().index(), 0);
        assert_eq!(system.context_by_name("pxd-control-1").unwrap().index(), 1);
        assert!(system.context_by_name("pxd-control-3").is_none());
        assert!(system.context(3).is_none());
    }

    #[test]
    #[should_panic]
    fn zero_contexts() {
        SystemBuilder::new().with_num_contexts(0);
    }

    #[test]
    #[should_panic]
    fn page_too_small() {
        SystemBuilder::new().with_page_size(11);
    }
}
