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

//! Queue of requests between the devices of a context and the backend.
//!
//! Every request sent on the conduit stays in [`Inner::requests`] until it is taken out,
//! either because the backend has replied or because it is cancelled. Whoever takes a request
//! out is responsible for completing it. Since taking out is done under the lock, each request
//! is completed exactly once.

use crate::request::Request;
use crate::Error;

use core::{
    sync::atomic::Ordering,
    task::{Context, Poll},
    time::Duration,
};
use futures::task::AtomicWaker;
use hashbrown::HashMap;
use nohash_hasher::BuildNoHashHasher;
use parking_lot::{Condvar, Mutex};
use spinning_top::Spinlock;
use std::{collections::VecDeque, time::Instant};

pub(crate) struct Conduit {
    // TODO: do something smarter than a spinning lock?
    inner: Spinlock<Inner>,
    /// Woken up when a request is pushed to [`Inner::pending`].
    reader: AtomicWaker,
    /// Incremented whenever a background slot is released, or whenever a blocked allocation
    /// might no longer be wanted.
    generation: Mutex<u64>,
    /// Notified when `generation` changes.
    generation_changed: Condvar,
    /// Value of the next [`Request::unique`].
    next_unique: atomic::Atomic<u64>,
    /// Maximum value of [`Inner::num_background`].
    max_background: usize,
    /// Maximum number of data pages of a request.
    max_pages: usize,
}

struct Inner {
    /// Requests that haven't completed yet.
    requests: HashMap<u64, InFlight, BuildNoHashHasher<u64>>,
    /// Requests that the backend hasn't read yet, in the order in which it must read them.
    /// Might contain identifiers that are no longer in `requests`, in which case they are
    /// skipped.
    pending: VecDeque<u64>,
    /// Number of entries in `requests` that aren't handshakes, plus the number of allocated
    /// but not yet sent [`Slot`]s.
    num_background: usize,
}

struct InFlight {
    request: Request,
    /// True if the backend has read the request.
    read: bool,
}

/// Reason why [`Conduit::alloc_background`] failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AllocError {
    /// Too many requests in flight. Goes away once the backend replies.
    Congested,
    /// The operation has more pages than a request can hold.
    TooManyPages,
}

/// Reserved space for a request, obtained with [`Conduit::alloc_background`].
#[must_use]
pub(crate) struct Slot<'a> {
    conduit: &'a Conduit,
    unique: u64,
    sent: bool,
}

impl Conduit {
    pub fn new(max_background: usize, max_pages: usize) -> Self {
        Conduit {
            inner: Spinlock::new(Inner {
                requests: Default::default(),
                pending: VecDeque::new(),
                num_background: 0,
            }),
            reader: AtomicWaker::new(),
            generation: Mutex::new(0),
            generation_changed: Condvar::new(),
            next_unique: atomic::Atomic::new(1),
            max_background,
            max_pages,
        }
    }

    /// Allocates a new request identifier.
    pub fn next_unique(&self) -> u64 {
        self.next_unique.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves space for an I/O request with the given number of data pages.
    pub fn alloc_background(&self, num_pages: usize) -> Result<Slot, AllocError> {
        if num_pages > self.max_pages {
            return Err(AllocError::TooManyPages);
        }

        let mut inner = self.inner.lock();
        if inner.num_background >= self.max_background {
            return Err(AllocError::Congested);
        }
        inner.num_background += 1;
        drop(inner);

        Ok(Slot {
            conduit: self,
            unique: self.next_unique(),
            sent: false,
        })
    }

    /// Current generation, to pass to [`Conduit::wait_generation`]. Must be obtained before
    /// the allocation attempt that it guards.
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Blocks until the generation differs from `seen`, or until `timeout` has elapsed.
    /// Returns false on timeout.
    pub fn wait_generation(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self
                .generation_changed
                .wait_until(&mut generation, deadline)
                .timed_out()
            {
                return *generation != seen;
            }
        }
        true
    }

    /// Wakes up every allocation blocked in [`Conduit::wait_generation`].
    pub fn wake_waiters(&self) {
        *self.generation.lock() += 1;
        self.generation_changed.notify_all();
    }

    /// Queues a handshake ahead of every other request that the backend hasn't read yet.
    pub fn send_oob(&self, request: Request) {
        debug_assert!(request.is_init());
        self.queue(request, true);
    }

    fn queue(&self, request: Request, front: bool) {
        let unique = request.unique;
        let mut inner = self.inner.lock();
        let _prev = inner.requests.insert(
            unique,
            InFlight {
                request,
                read: false,
            },
        );
        debug_assert!(_prev.is_none());
        if front {
            inner.pending.push_front(unique);
        } else {
            inner.pending.push_back(unique);
        }
        drop(inner);
        self.reader.wake();
    }

    /// Returns the next request to hand to the backend, encoded.
    pub fn try_next(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        while let Some(unique) = inner.pending.pop_front() {
            if let Some(in_flight) = inner.requests.get_mut(&unique) {
                debug_assert!(!in_flight.read);
                in_flight.read = true;
                return Some(in_flight.request.encode());
            }
        }
        None
    }

    /// Same as [`Conduit::try_next`], but registers the waker if no request is available.
    pub fn poll_next(&self, cx: &mut Context) -> Poll<Vec<u8>> {
        if let Some(message) = self.try_next() {
            return Poll::Ready(message);
        }
        self.reader.register(cx.waker());
        match self.try_next() {
            Some(message) => Poll::Ready(message),
            None => Poll::Pending,
        }
    }

    /// Takes out a request that the backend has read, in order to complete it.
    pub fn take_answerable(&self, unique: u64) -> Result<Request, Error> {
        let mut inner = self.inner.lock();
        match inner.requests.get(&unique) {
            Some(in_flight) if in_flight.read => {}
            _ => return Err(Error::NotFound(unique)),
        }
        let request = match inner.requests.remove(&unique) {
            Some(in_flight) => in_flight.request,
            None => return Err(Error::NotFound(unique)),
        };
        let background = !request.is_init();
        if background {
            inner.num_background -= 1;
        }
        drop(inner);
        if background {
            self.wake_waiters();
        }
        Ok(request)
    }

    /// Takes out all the requests matching the predicate, in order to complete them.
    pub fn drain_matching(&self, mut filter: impl FnMut(&Request) -> bool) -> Vec<Request> {
        // TODO: O(n) complexity
        let mut inner = self.inner.lock();

        let list = inner
            .requests
            .iter()
            .filter(|(_, in_flight)| filter(&in_flight.request))
            .map(|(unique, _)| *unique)
            .collect::<Vec<_>>();

        let mut out = Vec::with_capacity(list.len());
        let mut released = false;
        for unique in list {
            if let Some(in_flight) = inner.requests.remove(&unique) {
                if !in_flight.request.is_init() {
                    inner.num_background -= 1;
                    released = true;
                }
                out.push(in_flight.request);
            }
        }
        drop(inner);

        if released {
            self.wake_waiters();
        }

        out.sort_by_key(|r| r.unique);
        out
    }

    /// Puts back the requests that the backend has read but not answered at the head of the
    /// queue, so that the next reader sees them again.
    pub fn restart(&self) -> usize {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let mut to_restart = inner
            .requests
            .iter_mut()
            .filter(|(_, in_flight)| in_flight.read)
            .map(|(unique, in_flight)| {
                in_flight.read = false;
                *unique
            })
            .collect::<Vec<_>>();
        to_restart.sort_unstable();

        for unique in to_restart.iter().rev() {
            inner.pending.push_front(*unique);
        }

        if !to_restart.is_empty() {
            self.reader.wake();
        }
        to_restart.len()
    }

    /// Number of requests that haven't completed yet.
    pub fn num_in_flight(&self) -> usize {
        self.inner.lock().requests.len()
    }
}

impl<'a> Slot<'a> {
    pub fn unique(&self) -> u64 {
        self.unique
    }

    /// Queues the request. Its `unique` must be the one of this slot.
    pub fn send(mut self, request: Request) {
        debug_assert_eq!(request.unique, self.unique);
        debug_assert!(!request.is_init());
        self.sent = true;
        self.conduit.queue(request, false);
    }
}

impl<'a> Drop for Slot<'a> {
    fn drop(&mut self) {
        if !self.sent {
            self.conduit.inner.lock().num_background -= 1;
            self.conduit.wake_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AllocError, Conduit};
    use crate::context::Context;
    use crate::request::{ReplyStatus, Request, RequestKind};
    use crate::Error;

    use parity_scale_codec::DecodeAll as _;
    use pxd_interface::ffi::{InitIn, PxdRequest};
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    fn noop(_: &Context, _: Request, _: ReplyStatus) -> Result<(), Error> {
        Ok(())
    }

    fn init(unique: u64) -> Request {
        Request {
            unique,
            pid: 0,
            start: Instant::now(),
            kind: RequestKind::Init {
                init: InitIn {
                    version: 1,
                    num_devices: 0,
                },
                pages: Vec::new(),
            },
            end: noop,
        }
    }

    fn decode_unique(message: &[u8]) -> u64 {
        PxdRequest::decode_all(message).unwrap().header.unique
    }

    #[test]
    fn background_limit() {
        let conduit = Conduit::new(2, 4);
        assert_eq!(conduit.alloc_background(5).err(), Some(AllocError::TooManyPages));
        let a = conduit.alloc_background(1).unwrap();
        let b = conduit.alloc_background(1).unwrap();
        assert_ne!(a.unique(), b.unique());
        assert_eq!(conduit.alloc_background(1).err(), Some(AllocError::Congested));
        drop(a);
        assert!(conduit.alloc_background(4).is_ok());
    }

    #[test]
    fn oob_and_restart() {
        let conduit = Conduit::new(2, 4);
        conduit.send_oob(init(10));
        conduit.send_oob(init(11));
        assert_eq!(decode_unique(&conduit.try_next().unwrap()), 11);
        assert_eq!(conduit.restart(), 1);
        assert_eq!(decode_unique(&conduit.try_next().unwrap()), 11);
        assert_eq!(decode_unique(&conduit.try_next().unwrap()), 10);
        assert!(conduit.try_next().is_none());
    }

    #[test]
    fn only_read_requests_are_answerable() {
        let conduit = Conduit::new(2, 4);
        conduit.send_oob(init(5));
        assert_eq!(conduit.take_answerable(5).err(), Some(Error::NotFound(5)));
        conduit.try_next().unwrap();
        assert!(conduit.take_answerable(5).is_ok());
        assert_eq!(conduit.take_answerable(5).err(), Some(Error::NotFound(5)));
        assert_eq!(conduit.num_in_flight(), 0);
    }

    #[test]
    fn drained_requests_skipped() {
        let conduit = Conduit::new(2, 4);
        conduit.send_oob(init(1));
        conduit.send_oob(init(2));
        let drained = conduit.drain_matching(|r| r.unique == 2);
        assert_eq!(drained.len(), 1);
        assert_eq!(decode_unique(&conduit.try_next().unwrap()), 1);
        assert!(conduit.try_next().is_none());
    }

    #[test]
    fn released_slot_wakes_waiter() {
        let conduit = Arc::new(Conduit::new(1, 4));
        let slot = conduit.alloc_background(1).unwrap();

        let waiter = {
            let conduit = conduit.clone();
            thread::spawn(move || loop {
                let seen = conduit.generation();
                match conduit.alloc_background(1) {
                    Ok(_) => return,
                    Err(err) => assert_eq!(err, AllocError::Congested),
                }
                assert!(conduit.wait_generation(seen, Duration::from_secs(30)));
            })
        };

        thread::sleep(Duration::from_millis(20));
        drop(slot);
        waiter.join().unwrap();
    }

    #[test]
    fn wait_times_out() {
        let conduit = Conduit::new(1, 4);
        let seen = conduit.generation();
        assert!(!conduit.wait_generation(seen, Duration::from_millis(5)));
        conduit.wake_waiters();
        assert!(conduit.wait_generation(seen, Duration::from_millis(5)));
    }
}
