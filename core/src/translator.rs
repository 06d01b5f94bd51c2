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

//! Translation of I/O operations into requests on the control conduit, and of replies back
//! into completions.

use crate::bio::{Bio, BioRw, EndIo};
use crate::conduit::AllocError;
use crate::context::Context;
use crate::device::Device;
use crate::request::{EndFn, IoRequest, PageDesc, ReplyStatus, Request, RequestKind};
use crate::stats::Direction;
use crate::Error;

use core::convert::TryFrom as _;
use pxd_interface::ffi::{errno, Opcode, RdwrIn};
use std::{process, sync::Arc, time::Instant};

/// Forwards `bio` to the backend of `context`. `end_io` is called exactly once.
pub(crate) fn dispatch(context: &Context, device: &Arc<Device>, bio: Bio, end_io: EndIo) {
    log::trace!(
        "{}: dev m {} g {} {:?} at {} len {} bytes {} pages",
        context.name(),
        device.minor(),
        device.id(),
        bio.rw(),
        bio.offset(),
        bio.size(),
        bio.vecs().len()
    );

    if !context.is_open() {
        device.stats_counters().record_dispatch_failure();
        end_io(bio, Err(Error::IoError(-errno::EIO)));
        return;
    }

    if bio.checked_size().is_none() {
        log::error!(
            "{}: pxd{}: operation larger than 4 GiB refused",
            context.name(),
            device.minor()
        );
        device.stats_counters().record_dispatch_failure();
        end_io(bio, Err(Error::IoError(-errno::EIO)));
        return;
    }

    if let Err(err) = device.begin_io() {
        device.stats_counters().record_dispatch_failure();
        end_io(bio, Err(err));
        return;
    }

    let num_pages = bio.vecs().len();
    let conduit = context.conduit();
    let policy = context.config().alloc_retry();
    let mut retries = 0;
    let slot = loop {
        let seen = conduit.generation();
        match conduit.alloc_background(num_pages) {
            Ok(slot) => break Some(slot),
            Err(AllocError::Congested) if policy.allows(retries + 1) => {
                // Blocks until a request completes or the situation changes.
                conduit.wait_generation(seen, context.config().alloc_wait());
                retries += 1;
                if !context.is_open() || device.is_removing() {
                    log::error!(
                        "{}: request alloc ({} pages) abandoned after {} retries",
                        context.name(),
                        num_pages,
                        retries
                    );
                    break None;
                }
            }
            Err(err) => {
                log::error!(
                    "{}: request alloc ({} pages) failed: {:?} retries {}",
                    context.name(),
                    num_pages,
                    err,
                    retries
                );
                break None;
            }
        }
    };

    if retries > 0 {
        log::info!(
            "{}: request alloc ({} pages) retries {}",
            context.name(),
            num_pages,
            retries
        );
        device.stats_counters().record_alloc_retries(retries);
    }

    let slot = match slot {
        Some(s) => s,
        None => {
            device.stats_counters().record_dispatch_failure();
            device.end_io();
            end_io(bio, Err(Error::IoError(-errno::EIO)));
            return;
        }
    };

    let opcode = if bio.rw().contains(BioRw::DISCARD) {
        Opcode::Discard
    } else if bio.rw().contains(BioRw::WRITE) {
        Opcode::Write
    } else {
        Opcode::Read
    };
    let end: EndFn = match opcode {
        Opcode::Read => process_read_reply,
        _ => process_write_reply,
    };

    let rdwr = RdwrIn {
        offset: bio.offset(),
        size: bio.size(),
        flags: bio.rw().rdwr_flags().bits(),
        minor: device.minor(),
        chksum: 0,
    };

    // Only writes carry data towards the backend.
    let page_descs = if opcode != Opcode::Write {
        Default::default()
    } else {
        bio.vecs()
            .iter()
            .map(|vec| PageDesc {
                offset: u32::try_from(vec.offset()).unwrap_or(u32::MAX),
                length: u32::try_from(vec.len()).unwrap_or(u32::MAX),
            })
            .collect()
    };

    let pid = if bio.pid() != 0 {
        bio.pid()
    } else {
        process::id()
    };

    let request = Request {
        unique: slot.unique(),
        pid,
        start: Instant::now(),
        kind: RequestKind::Io(IoRequest {
            device: device.clone(),
            opcode,
            rdwr,
            page_descs,
            bio,
            end_io,
        }),
        end,
    };

    context.send_background(slot, request);
}

fn process_read_reply(context: &Context, request: Request, status: ReplyStatus) -> Result<(), Error> {
    complete_io(context, request, status, Direction::Read)
}

fn process_write_reply(context: &Context, request: Request, status: ReplyStatus) -> Result<(), Error> {
    complete_io(context, request, status, Direction::Write)
}

fn complete_io(
    context: &Context,
    request: Request,
    status: ReplyStatus,
    direction: Direction,
) -> Result<(), Error> {
    let unique = request.unique;
    let start = request.start;
    let io = match request.kind {
        RequestKind::Io(io) => io,
        RequestKind::Init { .. } => return Err(Error::ProtocolError("handshake reply on I/O path")),
    };

    let IoRequest {
        device,
        opcode,
        rdwr,
        mut bio,
        end_io,
        ..
    } = io;

    let result = match status.error {
        0 => {
            if opcode == Opcode::Read {
                let copied = bio.scatter(status.data.iter().map(|d| &d[..]));
                if copied != rdwr.size as usize {
                    log::warn!(
                        "{}: short read reply to {}: {} of {} bytes",
                        context.name(),
                        unique,
                        copied,
                        rdwr.size
                    );
                }
            }
            Ok(())
        }
        err if err < 0 => Err(Error::IoError(err)),
        err => Err(Error::IoError(-err)),
    };

    let latency = start.elapsed();
    log::trace!(
        "{}: reply to {} at {} err {} after {:?}",
        context.name(),
        unique,
        rdwr.offset,
        status.error,
        latency
    );

    device.stats_counters().record_completion(
        direction,
        rdwr.size,
        opcode == Opcode::Discard,
        result.is_err(),
        latency,
    );

    end_io(bio, result);
    device.end_io();
    Ok(())
}

/// Fails every request addressed to the device with local index `minor` that hasn't been
/// answered yet. Returns the number of requests that have been cancelled.
pub(crate) fn cancel_matching(context: &Context, minor: u32) -> usize {
    let requests = context
        .conduit()
        .drain_matching(|request| request.minor() == Some(minor));
    let num = requests.len();
    for request in requests {
        context.cancel(request, -errno::ENODEV);
    }
    if num != 0 {
        log::debug!("{}: cancelled {} requests of pxd{}", context.name(), num, minor);
    }
    num
}
