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

//! Virtual block devices whose I/O is forwarded to a storage backend.
//!
//! A [`System`] holds a fixed number of [`Context`]s. Each context groups a set of devices and
//! a control conduit. A backend opens the control conduit with [`Context::open_control`],
//! receives a handshake containing the list of devices that already exist, and then answers
//! the read, write and discard requests that the devices generate.
//!
//! # Usage
//!
//! - Build a [`System`] with a [`SystemBuilder`].
//! - Open the control conduit of a context. The returned [`ControlChannel`] lets you read
//!   encoded requests and write encoded replies. See the `pxd-interface` crate for the format.
//! - Create devices, either with [`Context::add`] or by writing an `Add` message on the
//!   control conduit.
//! - Submit [`Bio`]s to a [`Device`]. They complete once the backend has replied.
//!

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub use bio::{Bio, BioRw, BioVec};
pub use config::{Config, RetryPolicy};
pub use context::{ConnectionState, Context, ControlChannel, WriteOutcome};
pub use device::{Device, DeviceAttributes, DeviceHandle};
pub use error::Error;
pub use host::{BlockHost, DiskInfo, HeadlessHost, QueueLimits};
pub use stats::{ContextStatsSnapshot, Direction, StatsSnapshot};
pub use system::{System, SystemBuilder};

mod bio;
mod config;
mod conduit;
mod context;
mod device;
mod error;
mod host;
mod id_pool;
mod lifecycle;
mod protocol;
mod registry;
mod request;
mod stats;
mod system;
mod translator;

#[cfg(test)]
mod tests;
