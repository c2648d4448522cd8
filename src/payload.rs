// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Read;

use log::debug;

use crate::{Error, Result, ToU64, TryVec, skip};

/// The undecoded remainder of one tag's data, read straight from the
/// underlying source.
///
/// The unread byte count is owned by the [`Decoder`](crate::Decoder) that
/// handed out this reader. Reads never go past that bound, and whatever is
/// left when the reader is dropped gets skipped by the decoder's next call.
pub struct PayloadReader<'a, T> {
    src: &'a mut T,
    remaining: &'a mut u64,
}

impl<'a, T: Read> PayloadReader<'a, T> {
    pub(crate) fn new(src: &'a mut T, remaining: &'a mut u64) -> Self {
        Self { src, remaining }
    }

    /// Bytes still unread in this tag.
    pub fn bytes_left(&self) -> u64 {
        *self.remaining
    }

    /// Read and drop everything that is left in this tag.
    pub fn discard(&mut self) -> Result<()> {
        let left = *self.remaining;
        if left == 0 {
            return Ok(());
        }
        debug!("discarding {left} payload bytes");
        skip(self, left)?;
        if *self.remaining != 0 {
            return Err(Error::UnexpectedEOF);
        }
        Ok(())
    }

    /// Buffer the rest of the payload.
    pub fn read_into_try_vec(&mut self) -> std::io::Result<TryVec<u8>> {
        let limit = *self.remaining;
        let mut vec = std::vec::Vec::new();
        vec.try_reserve_exact(limit.try_into().map_err(|_| std::io::ErrorKind::OutOfMemory)?)
            .map_err(|_| std::io::ErrorKind::OutOfMemory)?;
        self.read_to_end(&mut vec)?;
        if *self.remaining != 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        Ok(vec.into())
    }
}

impl<T: Read> Read for PayloadReader<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let left = *self.remaining;
        if left == 0 {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
        let n = self.src.read(&mut buf[..max])?;
        *self.remaining -= n.to_u64();
        Ok(n)
    }
}

impl<T> Drop for PayloadReader<'_, T> {
    fn drop(&mut self) {
        if *self.remaining > 0 {
            debug!("leaving {} unread payload bytes", self.remaining);
        }
    }
}

impl<T> std::fmt::Debug for PayloadReader<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadReader").field("remaining", &self.remaining).finish()
    }
}

#[test]
fn payload_read_to_end() {
    let tmp = &mut b"1234567890".as_slice();
    let mut left = 5;
    let mut src = PayloadReader::new(&mut *tmp, &mut left);
    let buf = src.read_into_try_vec().unwrap();
    assert_eq!(buf.len(), 5);
    assert_eq!(buf, b"12345".as_ref());
    drop(src);
    assert_eq!(left, 0);
    assert_eq!(*tmp, b"67890");
}

#[test]
fn payload_discard() {
    let tmp = &mut b"1234567890".as_slice();
    let mut left = 7;
    let mut src = PayloadReader::new(&mut *tmp, &mut left);
    let mut two = [0u8; 2];
    src.read_exact(&mut two).unwrap();
    assert_eq!(&two, b"12");
    assert_eq!(src.bytes_left(), 5);
    src.discard().unwrap();
    assert_eq!(src.bytes_left(), 0);
    assert_eq!(src.read(&mut two).unwrap(), 0);
    drop(src);
    assert_eq!(*tmp, b"890");
}

#[test]
fn payload_discard_truncated() {
    let tmp = &mut b"123".as_slice();
    let mut left = 10;
    let mut src = PayloadReader::new(&mut *tmp, &mut left);
    assert!(matches!(src.discard(), Err(Error::UnexpectedEOF)));
    assert_eq!(src.bytes_left(), 7);
}

#[test]
fn payload_read_to_end_oom() {
    let tmp = &mut b"1234567890".as_slice();
    let mut left = u64::MAX / 2;
    let mut src = PayloadReader::new(&mut *tmp, &mut left);
    assert!(src.read_into_try_vec().is_err());
}
