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

use crate::bio::{Bio, EndIo};
use crate::context::Context;
use crate::host::{DiskInfo, QueueLimits};
use crate::stats::{DeviceStats, StatsSnapshot};
use crate::{translator, Error};

use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};
use futures::{channel::oneshot, prelude::*};
use pxd_interface::ffi::{errno, SECTOR_SIZE};
use spinning_top::Spinlock;
use std::sync::{Arc, Weak};

/// Virtual block device.
///
/// Devices are created and destroyed by their [`Context`]. A `Device` that has been removed
/// from its context refuses any new I/O and can't be opened again, but the object itself
/// remains valid as long as an `Arc` to it exists.
pub struct Device {
    /// Identifier chosen by the backend. Unique within the context.
    dev_id: u64,
    major: u32,
    /// Local index. Unique within the whole system.
    minor: u32,
    /// Size in bytes.
    size: u64,
    /// Context the device belongs to.
    context: Weak<Context>,
    /// Fields modified when the device is opened, closed or removed.
    state: Spinlock<DeviceState>,
    /// Number of operations that have passed the removal check and haven't completed yet.
    inflight: AtomicUsize,
    stats: DeviceStats,
}

#[derive(Debug, Default)]
struct DeviceState {
    open_count: usize,
    /// Once set, never cleared.
    removing: bool,
}

impl Device {
    pub(crate) fn new(dev_id: u64, major: u32, minor: u32, size: u64, context: Weak<Context>) -> Self {
        Device {
            dev_id,
            major,
            minor,
            size,
            context,
            state: Spinlock::new(DeviceState::default()),
            inflight: AtomicUsize::new(0),
            stats: DeviceStats::default(),
        }
    }

    /// Identifier chosen by the backend when the device was added.
    pub fn id(&self) -> u64 {
        self.dev_id
    }

    /// Local index of the device, also its externally-visible number.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Major number of the device.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Size of the device in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of [`DeviceHandle`]s currently alive.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Returns true if the device has been removed from its context.
    pub fn is_removing(&self) -> bool {
        self.state.lock().removing
    }

    /// Returns the context this device belongs to, if it still exists.
    pub fn context(&self) -> Option<Arc<Context>> {
        self.context.upgrade()
    }

    /// Returns a copy of the statistics of the device.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the informational attributes of the device.
    pub fn attributes(&self) -> DeviceAttributes {
        DeviceAttributes {
            size: self.size,
            major: self.major,
            minor: self.minor,
        }
    }

    /// Opens the device. Fails with [`Error::Busy`] if the device is being removed.
    ///
    /// The device can't be removed as long as the returned handle is alive.
    pub fn open(self: &Arc<Self>) -> Result<DeviceHandle, Error> {
        let mut state = self.state.lock();
        if state.removing {
            return Err(Error::Busy);
        }
        state.open_count += 1;
        drop(state);

        Ok(DeviceHandle {
            device: self.clone(),
        })
    }

    /// Forwards an I/O operation to the backend.
    ///
    /// `end_io` is called exactly once, when the backend has replied, when the device is
    /// removed, or immediately if the operation can't be dispatched. It might be called from
    /// within this function or from any other thread.
    ///
    /// `end_io` must not remove the device.
    pub fn dispatch(
        self: &Arc<Self>,
        bio: Bio,
        end_io: impl FnOnce(Bio, Result<(), Error>) + Send + 'static,
    ) {
        let end_io: EndIo = Box::new(end_io);
        match self.context.upgrade() {
            Some(context) => translator::dispatch(&context, self, bio, end_io),
            None => {
                self.stats.record_dispatch_failure();
                end_io(bio, Err(Error::IoError(-errno::ENXIO)))
            }
        }
    }

    /// Same as [`Device::dispatch`], but returns a `Future`. On success, the `Future` yields
    /// back the [`Bio`], with its segments filled in the case of a read.
    pub fn submit(self: &Arc<Self>, bio: Bio) -> impl Future<Output = Result<Bio, Error>> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(bio, move |bio, result| {
            let _ = tx.send(result.map(|()| bio));
        });
        rx.map(|result| result.unwrap_or(Err(Error::IoError(-errno::EIO))))
    }

    pub(crate) fn disk_info(&self) -> DiskInfo {
        DiskInfo {
            name: format!("pxd{}", self.minor),
            major: self.major,
            minor: self.minor,
            capacity_sectors: self.size / u64::from(SECTOR_SIZE),
            limits: QueueLimits::default(),
        }
    }

    pub(crate) fn stats_counters(&self) -> &DeviceStats {
        &self.stats
    }

    /// Registers the start of an operation. Fails if the device is being removed.
    ///
    /// Must be balanced with [`Device::end_io`] on success.
    pub(crate) fn begin_io(&self) -> Result<(), Error> {
        let state = self.state.lock();
        if state.removing {
            return Err(Error::IoError(-errno::ENODEV));
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Registers the end of an operation started with [`Device::begin_io`].
    pub(crate) fn end_io(&self) {
        let _prev = self.inflight.fetch_sub(1, Ordering::SeqCst);
        debug_assert_ne!(_prev, 0);
    }

    /// Number of operations started and not completed yet.
    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Marks the device as being removed, unless it is open.
    pub(crate) fn mark_removing_if_idle(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.open_count != 0 {
            return Err(Error::Busy);
        }
        state.removing = true;
        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("dev_id", &self.dev_id)
            .field("minor", &self.minor)
            .field("size", &self.size)
            .finish()
    }
}

/// Open device. Closes the device when dropped.
pub struct DeviceHandle {
    device: Arc<Device>,
}

impl DeviceHandle {
    /// Returns the device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// See [`Device::dispatch`].
    pub fn dispatch(&self, bio: Bio, end_io: impl FnOnce(Bio, Result<(), Error>) + Send + 'static) {
        self.device.dispatch(bio, end_io)
    }

    /// See [`Device::submit`].
    pub fn submit(&self, bio: Bio) -> impl Future<Output = Result<Bio, Error>> {
        self.device.submit(bio)
    }

    /// Closes the device. Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("DeviceHandle").field(&self.device).finish()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        let mut state = self.device.state.lock();
        debug_assert_ne!(state.open_count, 0);
        state.open_count -= 1;
    }
}

/// Informational attributes of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttributes {
    /// Size in bytes.
    pub size: u64,
    /// Major number.
    pub major: u32,
    /// Local index.
    pub minor: u32,
}

impl DeviceAttributes {
    /// Renders the attribute with the given name, one value per line. Returns `None` for an
    /// unknown name.
    pub fn show(&self, name: &str) -> Option<String> {
        match name {
            "size" => Some(format!("{}\n", self.size)),
            "major" => Some(format!("{}\n", self.major)),
            "minor" => Some(format!("{}\n", self.minor)),
            _ => None,
        }
    }
}
