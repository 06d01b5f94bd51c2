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

//! Block I/O operations submitted to a device.

use crate::Error;

use core::convert::TryFrom as _;
use pxd_interface::ffi::{RdwrFlags, SECTOR_SIZE};
use smallvec::SmallVec;

bitflags::bitflags! {
    /// Direction and modifiers of a [`Bio`].
    ///
    /// Neither `WRITE` nor `DISCARD` means a read. `DISCARD` takes precedence over `WRITE`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct BioRw: u32 {
        const WRITE = 1 << 0;
        const DISCARD = 1 << 1;
        const FLUSH = 1 << 2;
        const FUA = 1 << 3;
        const META = 1 << 4;
    }
}

impl BioRw {
    /// Returns the flags to put on the wire.
    pub(crate) fn rdwr_flags(self) -> RdwrFlags {
        let mut flags = RdwrFlags::empty();
        if self.contains(BioRw::FLUSH) {
            flags |= RdwrFlags::FLUSH;
        }
        if self.contains(BioRw::FUA) {
            flags |= RdwrFlags::FUA;
        }
        if self.contains(BioRw::META) {
            flags |= RdwrFlags::META;
        }
        flags
    }
}

/// Segment of a [`Bio`]: a range within a data page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BioVec {
    page: Vec<u8>,
    offset: usize,
    len: usize,
}

impl BioVec {
    /// Builds a segment covering `len` bytes of `page` starting at `offset`.
    ///
    /// Returns `None` if the range doesn't fit in the page.
    pub fn new(page: Vec<u8>, offset: usize, len: usize) -> Option<Self> {
        if offset.checked_add(len)? > page.len() {
            return None;
        }
        Some(BioVec { page, offset, len })
    }

    /// Builds a segment covering an entire page.
    pub fn whole(page: Vec<u8>) -> Self {
        let len = page.len();
        BioVec {
            page,
            offset: 0,
            len,
        }
    }

    /// Offset of the segment within its page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the segment.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the segment is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes covered by the segment.
    pub fn data(&self) -> &[u8] {
        &self.page[self.offset..self.offset + self.len]
    }

    /// Mutable access to the bytes covered by the segment.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.page[self.offset..self.offset + self.len]
    }

    /// Entire underlying page.
    pub(crate) fn page(&self) -> &[u8] {
        &self.page
    }

    /// Returns the underlying page.
    pub fn into_page(self) -> Vec<u8> {
        self.page
    }
}

/// Callback invoked exactly once when a [`Bio`] completes.
pub(crate) type EndIo = Box<dyn FnOnce(Bio, Result<(), Error>) + Send>;

/// Block I/O operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bio {
    rw: BioRw,
    /// First sector concerned by the operation.
    sector: u64,
    /// Size of a discard. Reads and writes use the length of their segments instead.
    discard_len: u32,
    vecs: SmallVec<[BioVec; 4]>,
    /// Process that issued the operation.
    pid: u32,
}

impl Bio {
    /// Builds a read of the given segments, starting at `sector`.
    pub fn read(sector: u64, vecs: impl IntoIterator<Item = BioVec>) -> Self {
        Bio::new(BioRw::empty(), sector, vecs)
    }

    /// Builds a write of the given segments, starting at `sector`.
    pub fn write(sector: u64, vecs: impl IntoIterator<Item = BioVec>) -> Self {
        Bio::new(BioRw::WRITE, sector, vecs)
    }

    /// Builds a discard of `len` bytes starting at `sector`.
    pub fn discard(sector: u64, len: u32) -> Self {
        Bio {
            rw: BioRw::DISCARD,
            sector,
            discard_len: len,
            vecs: SmallVec::new(),
            pid: std::process::id(),
        }
    }

    fn new(rw: BioRw, sector: u64, vecs: impl IntoIterator<Item = BioVec>) -> Self {
        Bio {
            rw,
            sector,
            discard_len: 0,
            vecs: vecs.into_iter().collect(),
            pid: std::process::id(),
        }
    }

    /// Adds flags to the operation.
    pub fn with_flags(mut self, flags: BioRw) -> Self {
        self.rw |= flags;
        self
    }

    /// Overrides the identity of the process issuing the operation. Defaults to the current
    /// process.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Direction and modifiers.
    pub fn rw(&self) -> BioRw {
        self.rw
    }

    /// First sector concerned by the operation.
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Offset in bytes of the operation.
    pub fn offset(&self) -> u64 {
        self.sector * u64::from(SECTOR_SIZE)
    }

    /// Number of bytes concerned by the operation. Saturates at `u32::MAX`, see
    /// [`Bio::checked_size`].
    pub fn size(&self) -> u32 {
        self.checked_size().unwrap_or(u32::MAX)
    }

    /// Number of bytes concerned by the operation, or `None` if it doesn't fit in a request.
    /// Such operations are refused by the devices.
    pub fn checked_size(&self) -> Option<u32> {
        if self.rw.contains(BioRw::DISCARD) {
            return Some(self.discard_len);
        }
        let total = self
            .vecs
            .iter()
            .try_fold(0usize, |total, v| total.checked_add(v.len))?;
        u32::try_from(total).ok()
    }

    /// Identity of the process that issued the operation.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Segments of the operation.
    pub fn vecs(&self) -> &[BioVec] {
        &self.vecs
    }

    /// Concatenation of the data of all the segments.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        for vec in &self.vecs {
            out.extend_from_slice(vec.data());
        }
        out
    }

    /// Returns the segments.
    pub fn into_vecs(self) -> impl Iterator<Item = BioVec> {
        self.vecs.into_iter()
    }

    /// Copies `data`, split in any number of chunks, into the segments, in order. Returns the
    /// number of bytes copied.
    pub(crate) fn scatter<'a>(&mut self, data: impl IntoIterator<Item = &'a [u8]>) -> usize {
        let mut vecs = self.vecs.iter_mut();
        let mut current = vecs.next();
        let mut filled = 0;
        let mut copied = 0;

        for mut chunk in data {
            while !chunk.is_empty() {
                let vec = match current.as_mut() {
                    Some(v) => v,
                    None => return copied,
                };
                let dest = &mut vec.data_mut()[filled..];
                let n = dest.len().min(chunk.len());
                dest[..n].copy_from_slice(&chunk[..n]);
                chunk = &chunk[n..];
                filled += n;
                copied += n;
                if filled == vec.len {
                    current = vecs.next();
                    filled = 0;
                }
            }
        }

        copied
    }
}
