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

//! Handshake performed whenever a backend opens the control conduit of a context.
//!
//! Opening the control conduit moves the context from `Disconnected` to `Connecting`, puts
//! back at the head of the queue the requests that a previous backend has read but not
//! answered, then queues an INIT request ahead of everything else. The INIT request carries
//! the list of devices of the context, split in pages. As soon as INIT is queued, the context
//! is considered `Open` and I/O operations are accepted. If the backend rejects the handshake,
//! the context goes back to `Disconnected` until the control conduit is opened again.

use crate::context::{ConnectionState, Context, ControlChannel};
use crate::request::{ReplyStatus, Request, RequestKind};
use crate::Error;

use core::{convert::TryFrom as _, sync::atomic::Ordering};
use parity_scale_codec::Encode as _;
use pxd_interface::ffi::{errno, DevId, InitIn, DEV_ID_ENCODED_LEN, PXD_VERSION};
use std::{process, sync::Arc, time::Instant};

impl Context {
    /// Opens the control conduit of this context and performs the handshake.
    ///
    /// Fails with [`Error::Busy`] if the control conduit is already open, or if the
    /// handshake of a previous opening hasn't been answered yet.
    pub fn open_control(self: &Arc<Self>) -> Result<ControlChannel, Error> {
        if self.control_attached().swap(true, Ordering::SeqCst) {
            log::error!("{}: too many outstanding opened", self.name());
            return Err(Error::Busy);
        }

        {
            let mut connection = self.connection().lock();
            if connection.init_pending {
                drop(connection);
                self.control_attached().store(false, Ordering::SeqCst);
                log::error!("{}: handshake already pending", self.name());
                return Err(Error::Busy);
            }
            connection.state = ConnectionState::Connecting;
            connection.init_pending = true;
        }

        let restarted = self.conduit().restart();

        if let Err(err) = send_init(self) {
            {
                let mut connection = self.connection().lock();
                connection.state = ConnectionState::Disconnected;
                connection.init_pending = false;
            }
            self.control_attached().store(false, Ordering::SeqCst);
            log::error!("{}: open failed: {}", self.name(), err);
            return Err(err);
        }

        self.connection().lock().state = ConnectionState::Open;
        log::info!(
            "{}: open OK, {} requests restarted",
            self.name(),
            restarted
        );

        Ok(ControlChannel {
            context: self.clone(),
        })
    }
}

/// Builds and queues the INIT request.
pub(crate) fn send_init(context: &Context) -> Result<(), Error> {
    let roster = context.registry().roster();
    let pages = build_roster_pages(&roster, context.config().roster_entries_per_page())?;
    let num_devices = u32::try_from(roster.len()).map_err(|_| Error::ResourceExhausted)?;

    let request = Request {
        unique: context.conduit().next_unique(),
        pid: process::id(),
        start: Instant::now(),
        kind: RequestKind::Init {
            init: InitIn {
                version: PXD_VERSION,
                num_devices,
            },
            pages,
        },
        end: process_init_reply,
    };

    context
        .stats_counters()
        .requests_sent
        .fetch_add(1, Ordering::Relaxed);
    context.conduit().send_oob(request);

    log::debug!(
        "{}: version {} num devices {}",
        context.name(),
        PXD_VERSION,
        num_devices
    );
    Ok(())
}

/// Splits the roster into pages of at most `per_page` entries. Each page is only as long as
/// its entries. An empty roster produces no page.
pub(crate) fn build_roster_pages(roster: &[DevId], per_page: usize) -> Result<Vec<Vec<u8>>, Error> {
    if per_page == 0 {
        return Err(Error::ResourceExhausted);
    }

    let num_pages = (roster.len() + per_page - 1) / per_page;
    let mut pages = Vec::new();
    pages
        .try_reserve_exact(num_pages)
        .map_err(|_| Error::ResourceExhausted)?;

    for chunk in roster.chunks(per_page) {
        let mut page = Vec::new();
        page.try_reserve_exact(chunk.len() * DEV_ID_ENCODED_LEN)
            .map_err(|_| Error::ResourceExhausted)?;
        for entry in chunk {
            entry.encode_to(&mut page);
        }
        debug_assert_eq!(page.len(), chunk.len() * DEV_ID_ENCODED_LEN);
        pages.push(page);
    }

    Ok(pages)
}

fn process_init_reply(context: &Context, request: Request, status: ReplyStatus) -> Result<(), Error> {
    debug_assert!(request.is_init());

    let mut connection = context.connection().lock();
    // Every path that takes the handshake out of the conduit goes through here or through
    // `release_control`, which both clear the flag.
    debug_assert!(connection.init_pending);

    connection.init_pending = false;
    if status.error != 0 {
        connection.state = ConnectionState::Disconnected;
        drop(connection);
        context.conduit().wake_waiters();
        log::warn!(
            "{}: handshake rejected with error {}",
            context.name(),
            status.error
        );
    } else {
        drop(connection);
        log::debug!("{}: handshake complete", context.name());
    }

    context
        .stats_counters()
        .handshakes
        .fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Called when the [`ControlChannel`] is destroyed.
pub(crate) fn release_control(context: &Context) {
    context.connection().lock().state = ConnectionState::Disconnected;
    context.conduit().wake_waiters();

    // An unanswered handshake would prevent any future opening.
    for request in context.conduit().drain_matching(|r| r.is_init()) {
        context.cancel(request, -errno::ENOTCONN);
    }

    context.control_attached().store(false, Ordering::SeqCst);
    log::info!("{}: control released", context.name());
}
