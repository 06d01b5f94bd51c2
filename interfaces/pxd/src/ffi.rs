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

//! Messages exchanged on the control conduit.
//!
//! All messages are SCALE-encoded. Integers are therefore fixed-size little endian, and lists
//! are prefixed with their compact-encoded length.

use alloc::vec::Vec;
use core::{convert::TryFrom, fmt};
use parity_scale_codec::{Decode, Encode};

/// Version of the protocol, sent in [`InitIn::version`].
pub const PXD_VERSION: u32 = 1;

/// Logical block size of the devices.
pub const PXD_LBS: u32 = 4 * 1024;

/// Size of a sector, the unit of the host block layer.
pub const SECTOR_SIZE: u32 = 512;

/// Maximum size of a single I/O operation.
pub const SEGMENT_SIZE: u32 = 1024 * 1024;

/// Number of bits of a local index. Local indices are in `1..(1 << MINORBITS)`.
pub const MINORBITS: u32 = 20;

/// Number of bytes of an encoded [`DevId`].
pub const DEV_ID_ENCODED_LEN: usize = 12;

/// Operation code found in [`RequestHeader::opcode`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Handshake, sent when the control conduit is opened.
    Init,
    Write,
    Read,
    Discard,
    /// Only ever written by the backend.
    Add,
    /// Only ever written by the backend.
    Remove,
}

impl From<Opcode> for u32 {
    fn from(opcode: Opcode) -> u32 {
        match opcode {
            Opcode::Init => 8192,
            Opcode::Write => 8193,
            Opcode::Read => 8194,
            Opcode::Discard => 8195,
            Opcode::Add => 8196,
            Opcode::Remove => 8197,
        }
    }
}

impl TryFrom<u32> for Opcode {
    type Error = InvalidOpcodeError;

    fn try_from(value: u32) -> Result<Self, InvalidOpcodeError> {
        Ok(match value {
            8192 => Opcode::Init,
            8193 => Opcode::Write,
            8194 => Opcode::Read,
            8195 => Opcode::Discard,
            8196 => Opcode::Add,
            8197 => Opcode::Remove,
            n => return Err(InvalidOpcodeError(n)),
        })
    }
}

/// Error that can happen when decoding an [`Opcode`].
#[derive(Debug)]
pub struct InvalidOpcodeError(u32);

impl InvalidOpcodeError {
    /// Returns the value that failed to decode.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for InvalidOpcodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid opcode {}", self.0)
    }
}

bitflags::bitflags! {
    /// Flags of a read, write or discard, found in [`RdwrIn::flags`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct RdwrFlags: u32 {
        const FLUSH = 0x1;
        const FUA = 0x2;
        const META = 0x4;
    }
}

/// Header common to all the requests read by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RequestHeader {
    /// Numeric value of an [`Opcode`].
    pub opcode: u32,
    /// Identifier of the request, to copy in [`Reply::unique`].
    pub unique: u64,
    /// Identifier of the process that issued the operation.
    pub pid: u32,
}

/// Arguments of a read, write or discard.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RdwrIn {
    /// Offset in bytes from the start of the device.
    pub offset: u64,
    /// Number of bytes.
    pub size: u32,
    /// Bits of [`RdwrFlags`].
    pub flags: u32,
    /// Local index of the device.
    pub minor: u32,
    /// Reserved. Always 0.
    pub chksum: u32,
}

impl RdwrIn {
    /// Returns the decoded flags. Unknown bits are ignored.
    pub fn flags(&self) -> RdwrFlags {
        RdwrFlags::from_bits_truncate(self.flags)
    }
}

/// Fixed-size part of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct InitIn {
    /// Always [`PXD_VERSION`].
    pub version: u32,
    /// Number of [`DevId`]s found in the pages.
    pub num_devices: u32,
}

/// Entry of the roster sent during the handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct DevId {
    /// Identifier of the device chosen by the backend when adding it.
    pub dev_id: u64,
    /// Local index assigned to the device.
    pub local_minor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RequestBody {
    /// Handshake. Each page contains a list of encoded [`DevId`]s, without length prefix.
    /// Use [`decode_roster_page`] to decode a page.
    Init { init: InitIn, pages: Vec<Vec<u8>> },
    /// Read request. The reply must contain `size` bytes of data.
    Read(RdwrIn),
    /// Write request, with the data to write split in pages.
    Write { rdwr: RdwrIn, data: Vec<Vec<u8>> },
    /// Discard request.
    Discard(RdwrIn),
}

impl RequestBody {
    /// Returns the opcode matching this body.
    pub fn opcode(&self) -> Opcode {
        match self {
            RequestBody::Init { .. } => Opcode::Init,
            RequestBody::Read(_) => Opcode::Read,
            RequestBody::Write { .. } => Opcode::Write,
            RequestBody::Discard(_) => Opcode::Discard,
        }
    }

    /// Returns the read/write arguments, or `None` for the handshake.
    pub fn rdwr(&self) -> Option<&RdwrIn> {
        match self {
            RequestBody::Init { .. } => None,
            RequestBody::Read(rdwr) => Some(rdwr),
            RequestBody::Write { rdwr, .. } => Some(rdwr),
            RequestBody::Discard(rdwr) => Some(rdwr),
        }
    }
}

/// Request read by the backend from the control conduit.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PxdRequest {
    pub header: RequestHeader,
    pub body: RequestBody,
}

/// Answer to a [`PxdRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Reply {
    /// Copy of [`RequestHeader::unique`].
    pub unique: u64,
    /// `0` on success, or a negative errno.
    pub error: i32,
    /// For reads, the data that has been read. Ignored otherwise.
    pub data: Vec<Vec<u8>>,
}

/// Creates a device.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AddOut {
    pub dev_id: u64,
    /// Size of the device, in bytes.
    pub size: u64,
}

/// Destroys a device.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RemoveOut {
    pub dev_id: u64,
}

/// Message written by the backend on the control conduit.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum PxdMessage {
    Reply(Reply),
    Add(AddOut),
    Remove(RemoveOut),
}

/// Decodes one page of the roster found in [`RequestBody::Init`].
pub fn decode_roster_page(page: &[u8]) -> Result<Vec<DevId>, parity_scale_codec::Error> {
    if page.len() % DEV_ID_ENCODED_LEN != 0 {
        return Err("roster page length isn't a multiple of the entry size".into());
    }

    page.chunks(DEV_ID_ENCODED_LEN)
        .map(|mut chunk| DevId::decode(&mut chunk))
        .collect()
}

/// Error codes found in [`Reply::error`], always negated.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EPROTO: i32 = 71;
    pub const ENOTCONN: i32 = 107;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use core::convert::TryFrom as _;

    #[test]
    fn dev_id_encoded_len() {
        let id = DevId {
            dev_id: 0x0102030405060708,
            local_minor: 9,
        };
        assert_eq!(id.encode().len(), DEV_ID_ENCODED_LEN);
    }

    #[test]
    fn roster_page_decode() {
        let mut page = Vec::new();
        for n in 0..3u32 {
            DevId {
                dev_id: u64::from(n) * 100,
                local_minor: n + 1,
            }
            .encode_to(&mut page);
        }

        let entries = decode_roster_page(&page).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].dev_id, 200);
        assert_eq!(entries[2].local_minor, 3);
    }

    #[test]
    fn roster_page_truncated() {
        assert!(decode_roster_page(&[0; DEV_ID_ENCODED_LEN + 1]).is_err());
        assert!(decode_roster_page(&[]).unwrap().is_empty());
    }

    #[test]
    fn opcodes_numbering() {
        assert_eq!(u32::from(Opcode::Init), 8192);
        assert_eq!(Opcode::try_from(8195).unwrap(), Opcode::Discard);
        assert_eq!(Opcode::try_from(1).unwrap_err().value(), 1);
        let body = RequestBody::Write {
            rdwr: RdwrIn {
                offset: 0,
                size: 4,
                flags: (RdwrFlags::FUA | RdwrFlags::META).bits(),
                minor: 1,
                chksum: 0,
            },
            data: vec![vec![0; 4]],
        };
        assert_eq!(body.opcode(), Opcode::Write);
        assert_eq!(body.rdwr().unwrap().flags(), RdwrFlags::FUA | RdwrFlags::META);
    }
}
