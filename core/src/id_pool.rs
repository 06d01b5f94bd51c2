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

use crate::Error;

use core::{convert::TryFrom as _, fmt, ops::Range};
use spinning_top::Spinlock;

/// Pool of small integers within a fixed range. Always hands out the lowest available value.
pub struct IdPool {
    /// First value of the range.
    start: u32,
    /// Number of values in the range.
    len: usize,
    // TODO: smarter than a spinloop?
    inner: Spinlock<Inner>,
}

struct Inner {
    /// One bit per value of the range. A set bit means that the value is in use.
    bitmap: Vec<u64>,
    /// Index within `bitmap` of the first word that might contain a clear bit.
    first_free_word: usize,
    /// Number of bits set in `bitmap`.
    in_use: usize,
}

impl IdPool {
    /// Initializes a new pool handing out values from `range`.
    pub fn new(range: Range<u32>) -> Self {
        let len = usize::try_from(range.end.saturating_sub(range.start)).unwrap_or(usize::MAX);
        IdPool {
            start: range.start,
            len,
            inner: Spinlock::new(Inner {
                bitmap: vec![0; (len + 63) / 64],
                first_free_word: 0,
                in_use: 0,
            }),
        }
    }

    /// Assigns a value from this pool.
    pub fn acquire(&self) -> Result<u32, Error> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        for word_index in inner.first_free_word..inner.bitmap.len() {
            let word = inner.bitmap[word_index];
            if word == u64::MAX {
                continue;
            }

            let bit = word.trailing_ones() as usize;
            let offset = word_index * 64 + bit;
            if offset >= self.len {
                break;
            }

            inner.bitmap[word_index] |= 1 << bit;
            inner.first_free_word = word_index;
            inner.in_use += 1;
            // `offset < len`, and `len` fits in the range of `u32`.
            return Ok(self.start + offset as u32);
        }

        inner.first_free_word = inner.bitmap.len();
        Err(Error::ResourceExhausted)
    }

    /// Puts back a value in the pool.
    pub fn release(&self, value: u32) {
        let offset = match value.checked_sub(self.start) {
            Some(o) if (o as usize) < self.len => o as usize,
            _ => {
                debug_assert!(false, "value {} outside of pool", value);
                return;
            }
        };

        let mut inner = self.inner.lock();
        let word_index = offset / 64;
        let mask = 1u64 << (offset % 64);
        debug_assert_ne!(inner.bitmap[word_index] & mask, 0);
        if inner.bitmap[word_index] & mask != 0 {
            inner.bitmap[word_index] &= !mask;
            inner.in_use -= 1;
        }
        if word_index < inner.first_free_word {
            inner.first_free_word = word_index;
        }
    }

    /// Returns the number of values currently assigned.
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }
}

impl fmt::Debug for IdPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IdPool")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("in_use", &self.in_use())
            .finish()
    }
}
