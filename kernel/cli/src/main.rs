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

//! Creates virtual block devices, attaches an in-memory backend to them, and runs a
//! write-then-read workload on each device.

use futures::{channel::oneshot, executor::block_on};
use pxd_core::{Bio, BioVec, Direction, RetryPolicy, SystemBuilder};
use std::{error, num::NonZeroU32, process, thread};
use structopt::StructOpt;

mod backend;
mod logger;

#[derive(Debug, StructOpt)]
#[structopt(name = "pxd", about = "Virtual block devices backed by memory.")]
struct CliOptions {
    /// Number of contexts.
    #[structopt(long, default_value = "10")]
    num_contexts: u32,

    /// Size of a data page, in bytes.
    #[structopt(long, default_value = "4096")]
    page_size: usize,

    /// Maximum number of requests in flight per context.
    #[structopt(long, default_value = "64")]
    max_background: usize,

    /// Number of times the allocation of a request is retried when too many requests are in
    /// flight. Unbounded if absent or 0.
    #[structopt(long)]
    alloc_retries: Option<u32>,

    /// Index of the context to use.
    #[structopt(long, default_value = "0")]
    context: u32,

    /// Number of devices to create.
    #[structopt(long, default_value = "2")]
    devices: u32,

    /// Size of each device, in bytes.
    #[structopt(long, default_value = "16777216")]
    device_size: u64,

    /// Number of blocks written then read back on each device.
    #[structopt(long, default_value = "32")]
    blocks: u32,

    /// Maximum level of the log messages to print.
    #[structopt(long, default_value = "info")]
    log_level: log::LevelFilter,
}

fn main() {
    let cli_opts = CliOptions::from_args();
    if let Err(err) = logger::TerminalLogger::new(cli_opts.log_level).install() {
        eprintln!("{}", err);
    }

    if let Err(err) = run(cli_opts) {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn run(cli_opts: CliOptions) -> Result<(), Box<dyn error::Error>> {
    let alloc_retry = match cli_opts.alloc_retries.and_then(NonZeroU32::new) {
        Some(max) => RetryPolicy::Bounded(max),
        None => RetryPolicy::Unbounded,
    };

    let system = SystemBuilder::new()
        .with_num_contexts(cli_opts.num_contexts)
        .with_page_size(cli_opts.page_size)
        .with_max_background(cli_opts.max_background)
        .with_alloc_retry(alloc_retry)
        .build();

    let context = system
        .context(cli_opts.context)
        .ok_or("no such context")?
        .clone();

    // Devices created before the backend connects are announced in the handshake.
    for n in 0..cli_opts.devices {
        context.add(0x1000 + u64::from(n), cli_opts.device_size)?;
    }

    let channel = context.open_control()?;
    let (stop_tx, stop_rx) = oneshot::channel();
    let backend = thread::spawn(move || block_on(backend::RamBackend::new(channel).run(stop_rx)));

    let block_size = pxd_interface::ffi::PXD_LBS as usize;
    let workers = context
        .devices()
        .into_iter()
        .map(|device| {
            let blocks = cli_opts.blocks;
            thread::spawn(move || -> Result<_, pxd_core::Error> {
                let handle = device.open()?;
                let sectors_per_block = (block_size / 512) as u64;

                for block in 0..blocks {
                    let pattern = vec![(block % 251) as u8 + 1; block_size];
                    let bio = Bio::write(
                        u64::from(block) * sectors_per_block,
                        vec![BioVec::whole(pattern)],
                    );
                    block_on(handle.submit(bio))?;
                }

                let mut mismatches = 0;
                for block in 0..blocks {
                    let bio = Bio::read(
                        u64::from(block) * sectors_per_block,
                        vec![BioVec::whole(vec![0; block_size])],
                    );
                    let bio = block_on(handle.submit(bio))?;
                    if bio.to_vec() != vec![(block % 251) as u8 + 1; block_size] {
                        mismatches += 1;
                    }
                }

                block_on(handle.submit(Bio::discard(0, block_size as u32)))?;
                Ok((device, mismatches))
            })
        })
        .collect::<Vec<_>>();

    let mut total_mismatches = 0;
    for worker in workers {
        let (device, mismatches) = worker.join().map_err(|_| "worker panicked")??;
        let stats = device.stats();
        log::info!(
            "pxd{}: {} reads ({} sectors, {:?}), {} writes ({} sectors, {:?}), {} discards, {} errors, {} mismatches",
            device.minor(),
            stats.ios(Direction::Read),
            stats.sectors(Direction::Read),
            stats.total_latency(Direction::Read),
            stats.ios(Direction::Write),
            stats.sectors(Direction::Write),
            stats.total_latency(Direction::Write),
            stats.discards,
            stats.errors,
            mismatches
        );
        total_mismatches += mismatches;
    }

    for device in context.devices() {
        context.remove(device.id())?;
    }

    let _ = stop_tx.send(());
    backend.join().map_err(|_| "backend panicked")?;

    let stats = context.stats();
    log::info!(
        "{}: {} requests sent, {} replies, {} cancelled, {} handshakes",
        context.name(),
        stats.requests_sent,
        stats.replies_received,
        stats.requests_cancelled,
        stats.handshakes
    );

    system.shutdown();

    if total_mismatches != 0 {
        return Err(format!("{} blocks read back differently", total_mismatches).into());
    }
    Ok(())
}
