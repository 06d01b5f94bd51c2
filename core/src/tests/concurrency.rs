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

use super::{connect, reply};
use crate::{Bio, BioVec, Error, SystemBuilder};

use futures::executor::block_on;
use parity_scale_codec::DecodeAll as _;
use pxd_interface::ffi::{errno, PxdRequest, RequestBody};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
};

#[test]
fn completions_exactly_once() {
    const NUM_THREADS: usize = 8;
    const OPS_PER_THREAD: usize = 50;
    let total = NUM_THREADS * OPS_PER_THREAD;

    let system = SystemBuilder::new()
        .with_num_contexts(1)
        .with_max_background(16)
        .build();
    let context = system.default_context().clone();
    context.add(1, 1 << 30).unwrap();
    let device = context.device(1).unwrap();
    let channel = connect(&context);

    let backend = thread::spawn(move || {
        for _ in 0..total {
            let message = block_on(channel.read());
            let request = PxdRequest::decode_all(&message).unwrap();
            let data = match request.body {
                RequestBody::Read(rdwr) => vec![vec![0xaa; rdwr.size as usize]],
                _ => Vec::new(),
            };
            reply(&channel, request.header.unique, 0, data).unwrap();
        }
        channel
    });

    let completions = Arc::new((0..total).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
    let start_barrier = Arc::new(Barrier::new(NUM_THREADS));
    let end_barrier = Arc::new(Barrier::new(NUM_THREADS + 1));

    for thread_index in 0..NUM_THREADS {
        let device = device.clone();
        let completions = completions.clone();
        let start_barrier = start_barrier.clone();
        let end_barrier = end_barrier.clone();
        thread::spawn(move || {
            start_barrier.wait();
            let mut pending = Vec::new();
            for n in 0..OPS_PER_THREAD {
                let op = thread_index * OPS_PER_THREAD + n;
                let bio = if n % 2 == 0 {
                    Bio::read(op as u64, vec![BioVec::whole(vec![0; 512])])
                } else {
                    Bio::write(op as u64, vec![BioVec::whole(vec![1; 512])])
                };
                let (tx, rx) = futures::channel::oneshot::channel();
                let completions = completions.clone();
                device.dispatch(bio, move |bio, result| {
                    completions[op].fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send((bio, result));
                });
                pending.push((n, rx));
            }
            for (n, rx) in pending {
                let (bio, result) = block_on(rx).unwrap();
                assert!(result.is_ok());
                if n % 2 == 0 {
                    assert_eq!(bio.to_vec(), vec![0xaa; 512]);
                }
            }
            end_barrier.wait();
        });
    }

    end_barrier.wait();
    let _channel = backend.join().unwrap();

    for completion in completions.iter() {
        assert_eq!(completion.load(Ordering::SeqCst), 1);
    }
    assert_eq!(context.num_in_flight(), 0);
    assert_eq!(context.stats().replies_received as usize, total + 1);
}

#[test]
fn remove_during_traffic() {
    const NUM_THREADS: usize = 4;
    const OPS_PER_THREAD: usize = 100;
    let total = NUM_THREADS * OPS_PER_THREAD;

    let system = SystemBuilder::new().with_num_contexts(1).build();
    let context = system.default_context().clone();
    context.add(1, 1 << 30).unwrap();
    context.add(2, 1 << 30).unwrap();
    let target = context.device(1).unwrap();
    let channel = connect(&context);

    // Answers every other request it sees, in order to leave some of them in flight.
    let stop = Arc::new(AtomicBool::new(false));
    let backend = {
        let stop = stop.clone();
        thread::spawn(move || {
            let mut answer = false;
            while !stop.load(Ordering::SeqCst) {
                let message = match channel.try_read() {
                    Some(m) => m,
                    None => {
                        thread::yield_now();
                        continue;
                    }
                };
                let request = PxdRequest::decode_all(&message).unwrap();
                answer = !answer;
                if answer {
                    // The request might have been cancelled in the meantime.
                    let _ = reply(&channel, request.header.unique, 0, Vec::new());
                }
            }
            channel
        })
    };

    let completions = Arc::new((0..total).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
    let successes = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(NUM_THREADS + 1));

    let dispatchers = (0..NUM_THREADS)
        .map(|thread_index| {
            let target = target.clone();
            let completions = completions.clone();
            let successes = successes.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for n in 0..OPS_PER_THREAD {
                    let op = thread_index * OPS_PER_THREAD + n;
                    let completions = completions.clone();
                    let successes = successes.clone();
                    target.dispatch(Bio::discard(op as u64, 512), move |_, result| {
                        completions[op].fetch_add(1, Ordering::SeqCst);
                        match result {
                            Ok(()) => {
                                successes.fetch_add(1, Ordering::SeqCst);
                            }
                            // Cancelled by the removal, or given up while waiting for a
                            // slot.
                            Err(err) => assert!(
                                err == Error::IoError(-errno::ENODEV)
                                    || err == Error::IoError(-errno::EIO),
                                "{:?}",
                                err
                            ),
                        }
                    });
                }
            })
        })
        .collect::<Vec<_>>();

    barrier.wait();
    context.remove(1).unwrap();

    for dispatcher in dispatchers {
        dispatcher.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    let _channel = backend.join().unwrap();

    for completion in completions.iter() {
        assert_eq!(completion.load(Ordering::SeqCst), 1);
    }
    assert!(successes.load(Ordering::SeqCst) < total);
    assert!(target.is_removing());
    assert_eq!(context.num_in_flight(), 0);

    // The other device is unaffected.
    assert!(context.device(2).is_some());
    assert!(context.device(1).is_none());
}
