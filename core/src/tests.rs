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

#![cfg(test)]

use crate::{BlockHost, Context, ControlChannel, DiskInfo, Error, WriteOutcome};

use parity_scale_codec::{DecodeAll as _, Encode as _};
use pxd_interface::ffi::{Opcode, PxdMessage, PxdRequest, Reply};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

mod concurrency;
mod lifecycle;

#[test]
fn send_sync() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<crate::System>();
    is_send_sync::<crate::Context>();
    is_send_sync::<crate::Device>();
    is_send_sync::<crate::ControlChannel>();
    is_send_sync::<crate::DeviceHandle>();
}

/// Reads the next request that the backend would see, and decodes it.
fn next_request(channel: &ControlChannel) -> PxdRequest {
    let message = channel.try_read().unwrap();
    PxdRequest::decode_all(&message).unwrap()
}

fn reply(
    channel: &ControlChannel,
    unique: u64,
    error: i32,
    data: Vec<Vec<u8>>,
) -> Result<WriteOutcome, Error> {
    let message = PxdMessage::Reply(Reply {
        unique,
        error,
        data,
    });
    channel.write(&message.encode())
}

/// Opens the control conduit and accepts the handshake.
fn connect(context: &Arc<Context>) -> ControlChannel {
    let channel = context.open_control().unwrap();
    let init = next_request(&channel);
    assert_eq!(init.header.opcode, u32::from(Opcode::Init));
    reply(&channel, init.header.unique, 0, Vec::new()).unwrap();
    channel
}

/// Host adapter remembering which disks it has been asked to expose.
#[derive(Default)]
struct RecordingHost {
    exposed: Mutex<Vec<DiskInfo>>,
    removed: Mutex<Vec<DiskInfo>>,
    refuse: AtomicBool,
}

impl BlockHost for RecordingHost {
    fn major(&self) -> u32 {
        43
    }

    fn add_disk(&self, disk: &DiskInfo) -> Result<(), Error> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::ResourceExhausted);
        }
        self.exposed.lock().unwrap().push(disk.clone());
        Ok(())
    }

    fn del_disk(&self, disk: &DiskInfo) {
        let mut exposed = self.exposed.lock().unwrap();
        let pos = exposed.iter().position(|d| d == disk).unwrap();
        exposed.remove(pos);
        self.removed.lock().unwrap().push(disk.clone());
    }
}
