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

use super::{connect, next_request, reply, RecordingHost};
use crate::{Bio, BioVec, Error, SystemBuilder};

use futures::executor::block_on;
use hashbrown::HashSet;
use nohash_hasher::BuildNoHashHasher;
use pxd_interface::ffi::{errno, SECTOR_SIZE};
use std::sync::{atomic::Ordering, Arc};

#[test]
fn host_sees_disks() {
    let host = Arc::new(RecordingHost::default());
    let system = SystemBuilder::new()
        .with_num_contexts(1)
        .with_host(host.clone())
        .build();
    assert_eq!(system.major(), 43);

    let context = system.default_context();
    let minor = context.add(0x10, 1 << 20).unwrap();
    {
        let exposed = host.exposed.lock().unwrap();
        assert_eq!(exposed.len(), 1);
        assert_eq!(exposed[0].name, format!("pxd{}", minor));
        assert_eq!(exposed[0].major, 43);
        assert_eq!(exposed[0].capacity_sectors, (1 << 20) / u64::from(SECTOR_SIZE));
    }

    context.remove(0x10).unwrap();
    assert!(host.exposed.lock().unwrap().is_empty());
    assert_eq!(host.removed.lock().unwrap().len(), 1);
}

#[test]
fn duplicate_add_changes_nothing() {
    let host = Arc::new(RecordingHost::default());
    let system = SystemBuilder::new()
        .with_num_contexts(1)
        .with_host(host.clone())
        .build();
    let context = system.default_context();

    let minor = context.add(5, 4096).unwrap();
    assert_eq!(context.add(5, 8192), Err(Error::AlreadyExists(5)));
    assert_eq!(context.num_devices(), 1);
    assert_eq!(context.device(5).unwrap().size(), 4096);
    assert_eq!(host.exposed.lock().unwrap().len(), 1);

    // The local index hasn't been consumed by the failed attempt.
    assert_eq!(context.add(6, 4096).unwrap(), minor + 1);
}

#[test]
fn host_refusal_releases_index() {
    let host = Arc::new(RecordingHost::default());
    let system = SystemBuilder::new()
        .with_num_contexts(1)
        .with_host(host.clone())
        .build();
    let context = system.default_context();

    host.refuse.store(true, Ordering::SeqCst);
    assert_eq!(context.add(1, 4096), Err(Error::ResourceExhausted));
    assert!(context.device(1).is_none());

    host.refuse.store(false, Ordering::SeqCst);
    assert_eq!(context.add(1, 4096), Ok(1));
}

#[test]
fn unique_minors() {
    let system = SystemBuilder::new().with_num_contexts(4).build();
    let mut minors = HashSet::<u32, BuildNoHashHasher<u32>>::default();
    for context in system.contexts() {
        for dev_id in 0..25 {
            assert!(minors.insert(context.add(dev_id, 4096).unwrap()));
        }
    }
    assert_eq!(system.num_devices(), 100);
    assert!(!minors.contains(&0));
}

#[test]
fn busy_remove_keeps_device_working() {
    let system = SystemBuilder::new().with_num_contexts(1).build();
    let context = system.default_context();
    context.add(1, 1 << 20).unwrap();
    let channel = connect(context);

    let handle = context.device(1).unwrap().open().unwrap();
    assert_eq!(handle.device().open_count(), 1);
    assert_eq!(context.remove(1), Err(Error::Busy));
    assert!(!handle.device().is_removing());

    let future = handle.submit(Bio::write(0, vec![BioVec::whole(vec![3; 512])]));
    let request = next_request(&channel);
    reply(&channel, request.header.unique, 0, Vec::new()).unwrap();
    assert!(block_on(future).is_ok());

    handle.close();
    assert_eq!(context.remove(1), Ok(()));
    assert_eq!(context.remove(1), Err(Error::NotFound(1)));
}

#[test]
fn remove_cancels_only_its_requests() {
    let system = SystemBuilder::new().with_num_contexts(1).build();
    let context = system.default_context();
    context.add(1, 1 << 20).unwrap();
    context.add(2, 1 << 20).unwrap();
    let first = context.device(1).unwrap();
    let second = context.device(2).unwrap();
    let channel = connect(context);

    let read_first = first.submit(Bio::read(0, vec![BioVec::whole(vec![0; 512])]));
    let read_second = second.submit(Bio::read(0, vec![BioVec::whole(vec![0; 512])]));
    let request_first = next_request(&channel);
    let request_second = next_request(&channel);
    // Not read by the backend yet.
    let write_first = first.submit(Bio::write(0, vec![BioVec::whole(vec![0; 512])]));

    context.remove(1).unwrap();
    assert_eq!(block_on(read_first), Err(Error::IoError(-errno::ENODEV)));
    assert_eq!(block_on(write_first), Err(Error::IoError(-errno::ENODEV)));
    assert_eq!(context.stats().requests_cancelled, 2);

    // Replies to cancelled requests are rejected.
    assert_eq!(
        reply(&channel, request_first.header.unique, 0, vec![vec![1; 512]]),
        Err(Error::NotFound(request_first.header.unique))
    );
    assert!(channel.try_read().is_none());

    reply(&channel, request_second.header.unique, 0, vec![vec![2; 512]]).unwrap();
    assert_eq!(block_on(read_second).unwrap().to_vec(), vec![2; 512]);

    // Operations on the removed device fail immediately.
    assert!(first.open().is_err());
    assert_eq!(
        block_on(first.submit(Bio::discard(0, 512))),
        Err(Error::IoError(-errno::ENODEV))
    );
}

#[test]
fn attributes() {
    let system = SystemBuilder::new().with_num_contexts(1).build();
    let context = system.default_context();
    let minor = context.add(1, 123456).unwrap();
    let attributes = context.device(1).unwrap().attributes();
    assert_eq!(attributes.show("size").unwrap(), "123456\n");
    assert_eq!(attributes.show("minor").unwrap(), format!("{}\n", minor));
    assert_eq!(attributes.show("major").unwrap(), "0\n");
    assert!(attributes.show("foo").is_none());
}
