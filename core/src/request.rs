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

//! Requests travelling on the control conduit.

use crate::bio::{Bio, EndIo};
use crate::context::Context;
use crate::device::Device;
use crate::Error;

use parity_scale_codec::Encode as _;
use pxd_interface::ffi::{InitIn, Opcode, PxdRequest, RdwrIn, RequestBody, RequestHeader};
use smallvec::SmallVec;
use std::{sync::Arc, time::Instant};

/// Function called when a request completes, either because of a reply or because it has been
/// cancelled. Consumes the request, which guarantees that it is only ever called once.
pub(crate) type EndFn = fn(&Context, Request, ReplyStatus) -> Result<(), Error>;

pub(crate) struct Request {
    /// Identifier of the request, unique within its conduit.
    pub unique: u64,
    /// Process that issued the request.
    pub pid: u32,
    /// When the request has been allocated.
    pub start: Instant,
    pub kind: RequestKind,
    pub end: EndFn,
}

pub(crate) enum RequestKind {
    /// Handshake. Each page has already been trimmed to the length of its content.
    Init { init: InitIn, pages: Vec<Vec<u8>> },
    Io(IoRequest),
}

pub(crate) struct IoRequest {
    pub device: Arc<Device>,
    /// Either `Read`, `Write` or `Discard`.
    pub opcode: Opcode,
    pub rdwr: RdwrIn,
    /// For writes, one entry per segment of `bio`, in the same order. Empty otherwise.
    pub page_descs: SmallVec<[PageDesc; 4]>,
    pub bio: Bio,
    pub end_io: EndIo,
}

/// Range of a data page that belongs to a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PageDesc {
    pub offset: u32,
    pub length: u32,
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplyStatus {
    /// `0` on success, negative errno otherwise.
    pub error: i32,
    pub data: Vec<Vec<u8>>,
}

impl ReplyStatus {
    /// Status of a request completed without a reply.
    pub fn failed(errno: i32) -> Self {
        ReplyStatus {
            error: errno,
            data: Vec::new(),
        }
    }
}

impl Request {
    pub fn is_init(&self) -> bool {
        matches!(self.kind, RequestKind::Init { .. })
    }

    /// Local index of the device the request is addressed to. `None` for the handshake.
    pub fn minor(&self) -> Option<u32> {
        match &self.kind {
            RequestKind::Init { .. } => None,
            RequestKind::Io(io) => Some(io.rdwr.minor),
        }
    }

    /// Builds the message read by the backend.
    pub fn encode(&self) -> Vec<u8> {
        let body = match &self.kind {
            RequestKind::Init { init, pages } => RequestBody::Init {
                init: init.clone(),
                pages: pages.clone(),
            },
            RequestKind::Io(io) => match io.opcode {
                Opcode::Write => RequestBody::Write {
                    rdwr: io.rdwr.clone(),
                    data: io.gather(),
                },
                Opcode::Discard => RequestBody::Discard(io.rdwr.clone()),
                _ => RequestBody::Read(io.rdwr.clone()),
            },
        };

        PxdRequest {
            header: RequestHeader {
                opcode: u32::from(body.opcode()),
                unique: self.unique,
                pid: self.pid,
            },
            body,
        }
        .encode()
    }
}

impl IoRequest {
    /// Copies the data of each page descriptor.
    fn gather(&self) -> Vec<Vec<u8>> {
        self.bio
            .vecs()
            .iter()
            .zip(self.page_descs.iter())
            .map(|(vec, desc)| {
                let start = desc.offset as usize;
                vec.page()[start..start + desc.length as usize].to_vec()
            })
            .collect()
    }
}
