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

use pxd_interface::ffi::errno;

/// Error that can happen in this crate.
///
/// Administrative operations return it directly. I/O operations only ever receive
/// [`Error::IoError`], and always through their completion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Failed to allocate a resource.
    #[error("Out of resources")]
    ResourceExhausted,

    /// A device with this identifier already exists in the context.
    #[error("Device {0:#x} already exists")]
    AlreadyExists(u64),

    /// No device or request with this identifier.
    #[error("{0:#x} not found")]
    NotFound(u64),

    /// Device is open, or the control conduit is already in use.
    #[error("Device or resource busy")]
    Busy,

    /// The backend has sent something unexpected.
    #[error("Protocol violation: {0}")]
    ProtocolError(&'static str),

    /// I/O operation failed. Contains a negative errno.
    #[error("I/O error (errno {0})")]
    IoError(i32),
}

impl Error {
    /// Returns the negative errno matching this error, as found on the wire.
    pub fn errno(&self) -> i32 {
        match self {
            Error::ResourceExhausted => -errno::ENOMEM,
            Error::AlreadyExists(_) => -errno::EEXIST,
            Error::NotFound(_) => -errno::ENOENT,
            Error::Busy => -errno::EBUSY,
            Error::ProtocolError(_) => -errno::EPROTO,
            Error::IoError(n) => *n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errnos_are_negative() {
        for err in [
            Error::ResourceExhausted,
            Error::AlreadyExists(1),
            Error::NotFound(1),
            Error::Busy,
            Error::ProtocolError("foo"),
            Error::IoError(-5),
        ]
        .iter()
        {
            assert!(err.errno() < 0);
        }
        assert_eq!(Error::AlreadyExists(3).errno(), -17);
    }
}
