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

//! Virtual block devices control conduit.
//!
//! The block devices exposed by `pxd-core` don't service any I/O by themselves. Every read,
//! write or discard is turned into a request that is read from the control conduit by a
//! storage backend, which must then write back a reply.
//!
//! # Usage
//!
//! - The backend opens the control conduit of a context. The first request it reads is always
//!   an [`ffi::RequestBody::Init`] containing the roster of the devices that already exist.
//! - The backend answers every request with an [`ffi::PxdMessage::Reply`] carrying the same
//!   `unique` identifier.
//! - Devices are created and destroyed by writing [`ffi::PxdMessage::Add`] and
//!   [`ffi::PxdMessage::Remove`].
//!

#![no_std]

extern crate alloc;

pub mod ffi;

pub use ffi::{DevId, PxdMessage, PxdRequest, RdwrFlags};
