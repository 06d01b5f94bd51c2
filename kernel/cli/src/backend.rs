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

//! Storage backend keeping the content of every device in memory.

use futures::{channel::oneshot, future, pin_mut};
use hashbrown::HashMap;
use nohash_hasher::BuildNoHashHasher;
use parity_scale_codec::DecodeAll as _;
use pxd_core::{ControlChannel, Error};
use pxd_interface::ffi::{
    decode_roster_page, errno, PxdMessage, PxdRequest, RdwrIn, Reply, RequestBody,
};

/// Answers the requests of a control conduit from memory.
pub struct RamBackend {
    channel: ControlChannel,
    /// Content of each device, indexed by local index. Grown on demand.
    disks: HashMap<u32, Vec<u8>, BuildNoHashHasher<u32>>,
    num_answered: u64,
}

impl RamBackend {
    pub fn new(channel: ControlChannel) -> Self {
        RamBackend {
            channel,
            disks: HashMap::default(),
            num_answered: 0,
        }
    }

    /// Answers requests until `stop` fires. Returns the number of requests answered.
    pub async fn run(mut self, stop: oneshot::Receiver<()>) -> u64 {
        pin_mut!(stop);

        loop {
            let message = {
                let read = self.channel.read();
                pin_mut!(read);
                match future::select(read, stop.as_mut()).await {
                    future::Either::Left((message, _)) => message,
                    future::Either::Right(_) => break,
                }
            };

            if let Err(err) = self.handle(&message) {
                log::error!("backend: {}", err);
            }
        }

        log::info!(
            "backend: {} requests answered on {}",
            self.num_answered,
            self.channel.context().name()
        );
        self.num_answered
    }

    fn handle(&mut self, message: &[u8]) -> Result<(), Error> {
        let request = PxdRequest::decode_all(message)
            .map_err(|_| Error::ProtocolError("undecodable request"))?;

        let (error, data) = match request.body {
            RequestBody::Init { init, pages } => {
                let mut roster = Vec::with_capacity(init.num_devices as usize);
                for page in &pages {
                    roster.extend(
                        decode_roster_page(page)
                            .map_err(|_| Error::ProtocolError("bad roster page"))?,
                    );
                }
                for entry in &roster {
                    log::info!(
                        "backend: device {:#x} is pxd{}",
                        entry.dev_id,
                        entry.local_minor
                    );
                }
                if roster.len() == init.num_devices as usize {
                    (0, Vec::new())
                } else {
                    (-errno::EPROTO, Vec::new())
                }
            }
            RequestBody::Read(rdwr) => (0, vec![self.read(&rdwr)]),
            RequestBody::Write { rdwr, data } => {
                let disk = self.range_mut(&rdwr);
                let mut pos = 0;
                for chunk in data {
                    let len = chunk.len().min(disk.len() - pos);
                    disk[pos..pos + len].copy_from_slice(&chunk[..len]);
                    pos += len;
                }
                (0, Vec::new())
            }
            RequestBody::Discard(rdwr) => {
                for byte in self.range_mut(&rdwr) {
                    *byte = 0;
                }
                (0, Vec::new())
            }
        };

        self.num_answered += 1;
        self.channel.write_message(PxdMessage::Reply(Reply {
            unique: request.header.unique,
            error,
            data,
        }))?;
        Ok(())
    }

    fn read(&self, rdwr: &RdwrIn) -> Vec<u8> {
        let start = rdwr.offset as usize;
        let end = start + rdwr.size as usize;
        let mut out = vec![0; rdwr.size as usize];
        if let Some(disk) = self.disks.get(&rdwr.minor) {
            if start < disk.len() {
                let available = end.min(disk.len());
                out[..available - start].copy_from_slice(&disk[start..available]);
            }
        }
        out
    }

    fn range_mut(&mut self, rdwr: &RdwrIn) -> &mut [u8] {
        let start = rdwr.offset as usize;
        let end = start + rdwr.size as usize;
        let disk = self.disks.entry(rdwr.minor).or_insert_with(Vec::new);
        if disk.len() < end {
            disk.resize(end, 0);
        }
        &mut disk[start..end]
    }
}
