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

//! Interface with the host block layer.
//!
//! Registering a disk, configuring its queue and exposing it to the rest of the system is the
//! job of the environment this crate runs in. The [`BlockHost`] trait is the boundary.

use crate::Error;
use pxd_interface::ffi::{PXD_LBS, SECTOR_SIZE, SEGMENT_SIZE};

/// Adapter towards the host block layer.
pub trait BlockHost: Send + Sync {
    /// Major number under which all the disks are exposed.
    fn major(&self) -> u32;

    /// Exposes a new disk. Called before the device is made visible in its context. If this
    /// returns an error, the device isn't created.
    fn add_disk(&self, disk: &DiskInfo) -> Result<(), Error>;

    /// Removes a disk previously exposed with [`BlockHost::add_disk`].
    fn del_disk(&self, disk: &DiskInfo);
}

/// Description of a disk passed to [`BlockHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    /// Name of the disk, for example `pxd3`.
    pub name: String,
    /// Major number, see [`BlockHost::major`].
    pub major: u32,
    /// Local index of the device.
    pub minor: u32,
    /// Size of the disk, in sectors of [`SECTOR_SIZE`] bytes.
    pub capacity_sectors: u64,
    /// Parameters of the request queue.
    pub limits: QueueLimits,
}

/// Parameters of the request queue of a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLimits {
    /// Maximum size of an operation, in sectors.
    pub max_hw_sectors: u32,
    /// Maximum size of a segment, in bytes.
    pub max_segment_size: u32,
    /// Minimum I/O size, in bytes.
    pub io_min: u32,
    /// Optimal I/O size, in bytes.
    pub io_opt: u32,
    /// Size of a logical block, in bytes.
    pub logical_block_size: u32,
    /// Granularity of discards, in bytes.
    pub discard_granularity: u32,
    /// Alignment of discards, in bytes.
    pub discard_alignment: u32,
    /// Maximum size of a discard, in sectors.
    pub max_discard_sectors: u32,
    /// Whether discarded ranges read back as zeroes.
    pub discard_zeroes_data: bool,
    /// Whether flushes and forced unit accesses are passed through.
    pub flush_fua: bool,
}

impl Default for QueueLimits {
    fn default() -> Self {
        QueueLimits {
            max_hw_sectors: SEGMENT_SIZE / SECTOR_SIZE,
            max_segment_size: SEGMENT_SIZE,
            io_min: PXD_LBS,
            io_opt: PXD_LBS,
            logical_block_size: PXD_LBS,
            discard_granularity: PXD_LBS,
            discard_alignment: PXD_LBS,
            max_discard_sectors: SEGMENT_SIZE / SECTOR_SIZE,
            discard_zeroes_data: true,
            flush_fua: true,
        }
    }
}

/// [`BlockHost`] that doesn't expose anything and only logs.
#[derive(Debug, Default)]
pub struct HeadlessHost {
    major: u32,
}

impl HeadlessHost {
    /// Builds a new `HeadlessHost` reporting the given major number.
    pub fn new(major: u32) -> Self {
        HeadlessHost { major }
    }
}

impl BlockHost for HeadlessHost {
    fn major(&self) -> u32 {
        self.major
    }

    fn add_disk(&self, disk: &DiskInfo) -> Result<(), Error> {
        log::debug!(
            "{}: {}:{} with {} sectors",
            disk.name,
            disk.major,
            disk.minor,
            disk.capacity_sectors
        );
        Ok(())
    }

    fn del_disk(&self, disk: &DiskInfo) {
        log::debug!("{}: gone", disk.name);
    }
}
