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

//! Creation and removal of devices.

use crate::context::Context;
use crate::device::Device;
use crate::{translator, Error};

use std::{sync::Arc, thread};

impl Context {
    /// Creates a new device with the given identifier and size in bytes. Returns its local
    /// index, which is unique across the whole [`System`](crate::System).
    ///
    /// Fails with [`Error::AlreadyExists`] if a device with the same identifier exists in
    /// this context, and with [`Error::ResourceExhausted`] if no local index is available.
    pub fn add(self: &Arc<Self>, dev_id: u64, size: u64) -> Result<u32, Error> {
        if self.registry().get(dev_id).is_some() {
            log::debug!("{}: add {}: already exists", self.name(), dev_id);
            return Err(Error::AlreadyExists(dev_id));
        }

        let shared = self.shared();
        let minor = shared.minors.acquire()?;
        let device = Arc::new(Device::new(
            dev_id,
            shared.major,
            minor,
            size,
            Arc::downgrade(self),
        ));

        let disk = device.disk_info();
        if let Err(err) = shared.host.add_disk(&disk) {
            shared.minors.release(minor);
            log::error!("{}: exposing {} failed: {}", self.name(), disk.name, err);
            return Err(err);
        }

        // Another addition with the same identifier might have happened concurrently.
        if let Err(err) = self.registry().insert(device) {
            shared.host.del_disk(&disk);
            shared.minors.release(minor);
            log::debug!("{}: add {}: {}", self.name(), dev_id, err);
            return Err(err);
        }

        log::debug!(
            "{}: added {} as {} ({} bytes)",
            self.name(),
            dev_id,
            disk.name,
            size
        );
        Ok(minor)
    }

    /// Removes the device with the given identifier.
    ///
    /// Fails with [`Error::NotFound`] if there's no such device, and with [`Error::Busy`] if
    /// the device is open, in which case the device is left untouched. Otherwise, all the
    /// operations of the device that haven't completed yet fail before this function returns.
    ///
    /// Must not be called from within the completion callback of an operation.
    pub fn remove(&self, dev_id: u64) -> Result<(), Error> {
        let device = match self.registry().remove_idle(dev_id) {
            Ok(d) => d,
            Err(err) => {
                log::debug!("{}: remove {}: {}", self.name(), dev_id, err);
                return Err(err);
            }
        };

        // Dispatches blocked on a congested conduit give up.
        self.conduit().wake_waiters();

        let shared = self.shared();
        let disk = device.disk_info();
        shared.host.del_disk(&disk);

        // Operations that passed the removal check might not be in the conduit yet.
        let mut cancelled = 0;
        loop {
            cancelled += translator::cancel_matching(self, device.minor());
            if device.inflight() == 0 {
                break;
            }
            thread::yield_now();
        }

        shared.minors.release(device.minor());
        log::debug!(
            "{}: removed {} ({}), {} requests cancelled",
            self.name(),
            dev_id,
            disk.name,
            cancelled
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Error, SystemBuilder};

    #[test]
    fn add_then_remove() {
        let system = SystemBuilder::new().with_num_contexts(1).build();
        let context = system.default_context();
        let minor = context.add(12, 1 << 20).unwrap();
        assert_eq!(context.device(12).unwrap().minor(), minor);
        context.remove(12).unwrap();
        assert!(context.device(12).is_none());
        assert_eq!(context.remove(12), Err(Error::NotFound(12)));
    }

    #[test]
    fn minor_reused_after_remove() {
        let system = SystemBuilder::new().with_num_contexts(1).build();
        let context = system.default_context();
        let first = context.add(1, 4096).unwrap();
        context.remove(1).unwrap();
        assert_eq!(context.add(2, 4096).unwrap(), first);
    }

    #[test]
    fn minors_unique_across_contexts() {
        let system = SystemBuilder::new().with_num_contexts(2).build();
        let a = system.context(0).unwrap().add(5, 4096).unwrap();
        let b = system.context(1).unwrap().add(5, 4096).unwrap();
        assert_ne!(a, b);
    }
}
