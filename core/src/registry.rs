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

//! Devices of a context.

use crate::device::Device;
use crate::Error;

use pxd_interface::ffi::DevId;
use spinning_top::Spinlock;
use std::{
    collections::{btree_map::Entry, BTreeMap},
    sync::Arc,
};

/// Collection of the devices of a context, ordered by identifier.
///
/// All the modifications of the membership, and the snapshots used for the handshake, are
/// serialized by a single lock.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    // TODO: do something smarter than a spinning lock?
    devices: Spinlock<BTreeMap<u64, Arc<Device>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Inserts a device, unless a device with the same identifier already exists.
    pub fn insert(&self, device: Arc<Device>) -> Result<(), Error> {
        match self.devices.lock().entry(device.id()) {
            Entry::Occupied(_) => Err(Error::AlreadyExists(device.id())),
            Entry::Vacant(entry) => {
                entry.insert(device);
                Ok(())
            }
        }
    }

    pub fn get(&self, dev_id: u64) -> Option<Arc<Device>> {
        self.devices.lock().get(&dev_id).cloned()
    }

    /// Removes the device with the given identifier, unless it is open.
    ///
    /// The device is marked as being removed before the registry lock is released, so that it
    /// can't be opened in-between.
    pub fn remove_idle(&self, dev_id: u64) -> Result<Arc<Device>, Error> {
        match self.devices.lock().entry(dev_id) {
            Entry::Vacant(_) => Err(Error::NotFound(dev_id)),
            Entry::Occupied(entry) => {
                entry.get().mark_removing_if_idle()?;
                Ok(entry.remove())
            }
        }
    }

    /// Returns the list of `(identifier, local index)` pairs of all the devices.
    pub fn roster(&self) -> Vec<DevId> {
        self.devices
            .lock()
            .values()
            .map(|device| DevId {
                dev_id: device.id(),
                local_minor: device.minor(),
            })
            .collect()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::Registry;
    use crate::device::Device;
    use crate::Error;
    use std::sync::{Arc, Weak};

    fn device(dev_id: u64, minor: u32) -> Arc<Device> {
        Arc::new(Device::new(dev_id, 0, minor, 4096, Weak::new()))
    }

    #[test]
    fn duplicate_rejected() {
        let registry = Registry::new();
        registry.insert(device(7, 1)).unwrap();
        assert_eq!(registry.insert(device(7, 2)), Err(Error::AlreadyExists(7)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(7).unwrap().minor(), 1);
    }

    #[test]
    fn remove_busy_then_idle() {
        let registry = Registry::new();
        registry.insert(device(7, 1)).unwrap();
        let handle = registry.get(7).unwrap().open().unwrap();
        assert_eq!(registry.remove_idle(7).unwrap_err(), Error::Busy);
        assert!(!handle.device().is_removing());
        drop(handle);
        let removed = registry.remove_idle(7).unwrap();
        assert!(removed.is_removing());
        assert_eq!(registry.remove_idle(7).unwrap_err(), Error::NotFound(7));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn roster_ordered_by_id() {
        let registry = Registry::new();
        registry.insert(device(30, 1)).unwrap();
        registry.insert(device(10, 2)).unwrap();
        registry.insert(device(20, 3)).unwrap();
        let roster = registry.roster();
        let ids = roster.iter().map(|e| e.dev_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(roster[0].local_minor, 2);
    }
}
