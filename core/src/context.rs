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

use crate::conduit::{Conduit, Slot};
use crate::config::Config;
use crate::device::Device;
use crate::registry::Registry;
use crate::request::{ReplyStatus, Request};
use crate::stats::{ContextStats, ContextStatsSnapshot};
use crate::system::Shared;
use crate::{protocol, Error};

use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};
use futures::future;
use parity_scale_codec::DecodeAll as _;
use pxd_interface::ffi::{errno, DevId, PxdMessage, Reply};
use spinning_top::Spinlock;
use std::sync::Arc;

/// Group of devices sharing a control conduit.
pub struct Context {
    index: u32,
    /// Name of the control conduit, for example `pxd-control-3`.
    name: String,
    registry: Registry,
    conduit: Conduit,
    connection: Spinlock<Connection>,
    /// True if a [`ControlChannel`] currently exists.
    control_attached: AtomicBool,
    shared: Arc<Shared>,
    stats: ContextStats,
}

/// State of the connection with the backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No backend. I/O operations fail immediately.
    Disconnected,
    /// A backend is opening the control conduit.
    Connecting,
    /// I/O operations are forwarded to the backend.
    Open,
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub state: ConnectionState,
    /// True if a handshake has been sent and not answered yet. At most one handshake is ever
    /// in flight.
    pub init_pending: bool,
}

impl Context {
    pub(crate) fn new(index: u32, shared: Arc<Shared>) -> Self {
        Context {
            index,
            name: format!("pxd-control-{}", index),
            registry: Registry::new(),
            conduit: Conduit::new(
                shared.config.max_background(),
                shared.config.max_pages_per_request(),
            ),
            connection: Spinlock::new(Connection {
                state: ConnectionState::Disconnected,
                init_pending: false,
            }),
            control_attached: AtomicBool::new(false),
            shared,
            stats: ContextStats::default(),
        }
    }

    /// Index of the context within its [`System`](crate::System).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Name of the control conduit of this context.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state of the connection with the backend.
    pub fn state(&self) -> ConnectionState {
        self.connection.lock().state
    }

    /// Returns true if I/O operations are currently accepted.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Returns true if a handshake has been sent and not answered yet.
    pub fn handshake_pending(&self) -> bool {
        self.connection.lock().init_pending
    }

    /// Returns the device with the given identifier.
    pub fn device(&self, dev_id: u64) -> Option<Arc<Device>> {
        self.registry.get(dev_id)
    }

    /// Returns all the devices, ordered by identifier.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.devices()
    }

    /// Number of devices in this context.
    pub fn num_devices(&self) -> usize {
        self.registry.len()
    }

    /// Returns the list of devices as sent during the handshake.
    pub fn roster(&self) -> Vec<DevId> {
        self.registry.roster()
    }

    /// Number of requests sent on the control conduit that haven't completed yet.
    pub fn num_in_flight(&self) -> usize {
        self.conduit.num_in_flight()
    }

    /// Returns a copy of the statistics of the context.
    pub fn stats(&self) -> ContextStatsSnapshot {
        self.stats.snapshot()
    }

    /// Fails every request that hasn't completed yet, and marks the context as disconnected.
    /// Returns the number of requests that have been failed.
    pub fn abort(&self) -> usize {
        self.connection.lock().state = ConnectionState::Disconnected;
        self.conduit.wake_waiters();
        let requests = self.conduit.drain_matching(|_| true);
        let num = requests.len();
        for request in requests {
            self.cancel(request, -errno::ENOTCONN);
        }
        if num != 0 {
            log::warn!("{}: aborted {} requests", self.name, num);
        }
        num
    }

    pub(crate) fn config(&self) -> &Config {
        &self.shared.config
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn conduit(&self) -> &Conduit {
        &self.conduit
    }

    pub(crate) fn connection(&self) -> &Spinlock<Connection> {
        &self.connection
    }

    pub(crate) fn control_attached(&self) -> &AtomicBool {
        &self.control_attached
    }

    pub(crate) fn stats_counters(&self) -> &ContextStats {
        &self.stats
    }

    /// Queues an I/O request.
    pub(crate) fn send_background(&self, slot: Slot, request: Request) {
        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
        slot.send(request);
    }

    /// Completes a request with the reply written by the backend.
    pub(crate) fn complete(&self, reply: Reply) -> Result<(), Error> {
        let request = self.conduit.take_answerable(reply.unique)?;
        self.stats.replies_received.fetch_add(1, Ordering::Relaxed);
        let end = request.end;
        end(
            self,
            request,
            ReplyStatus {
                error: reply.error,
                data: reply.data,
            },
        )
    }

    /// Completes a request that has been taken out of the conduit without a reply.
    pub(crate) fn cancel(&self, request: Request, errno: i32) {
        self.stats.requests_cancelled.fetch_add(1, Ordering::Relaxed);
        let unique = request.unique;
        let end = request.end;
        if let Err(err) = end(self, request, ReplyStatus::failed(errno)) {
            log::error!("{}: cancelling request {}: {}", self.name, unique, err);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Requests kept for the next backend would otherwise never complete.
        self.abort();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("num_devices", &self.num_devices())
            .finish()
    }
}

/// What a message written with [`ControlChannel::write`] has done.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A request has been completed.
    Completed,
    /// A device has been created, with the given local index.
    Added(u32),
    /// A device has been removed.
    Removed,
}

/// Open control conduit of a [`Context`]. Obtained with [`Context::open_control`].
///
/// At most one `ControlChannel` exists per context at any given time. Destroying it marks the
/// context as disconnected. Requests that have been read but not answered are kept, and
/// handed again to the next backend that opens the control conduit.
pub struct ControlChannel {
    pub(crate) context: Arc<Context>,
}

impl ControlChannel {
    /// Returns the context this conduit belongs to.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Waits for the next request and returns it, encoded as a
    /// [`PxdRequest`](pxd_interface::ffi::PxdRequest).
    pub async fn read(&self) -> Vec<u8> {
        future::poll_fn(|cx| self.context.conduit.poll_next(cx)).await
    }

    /// Same as [`ControlChannel::read`], but returns `None` if no request is available.
    pub fn try_read(&self) -> Option<Vec<u8>> {
        self.context.conduit.try_next()
    }

    /// Processes a message encoded as a [`PxdMessage`].
    pub fn write(&self, message: &[u8]) -> Result<WriteOutcome, Error> {
        let message = PxdMessage::decode_all(message)
            .map_err(|_| Error::ProtocolError("malformed message"))?;
        self.write_message(message)
    }

    /// Same as [`ControlChannel::write`], with a message that is already decoded.
    pub fn write_message(&self, message: PxdMessage) -> Result<WriteOutcome, Error> {
        match message {
            PxdMessage::Reply(reply) => {
                self.context.complete(reply)?;
                Ok(WriteOutcome::Completed)
            }
            PxdMessage::Add(add) => {
                let minor = self.context.add(add.dev_id, add.size)?;
                Ok(WriteOutcome::Added(minor))
            }
            PxdMessage::Remove(remove) => {
                self.context.remove(remove.dev_id)?;
                Ok(WriteOutcome::Removed)
            }
        }
    }

    /// Closes the control conduit. Equivalent to dropping it.
    pub fn close(self) {}
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ControlChannel")
            .field(&self.context.name)
            .finish()
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        protocol::release_control(&self.context);
    }
}
