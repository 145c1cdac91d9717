use std::cmp;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use memmap2::Mmap;

use crate::index::Extent;

/// A read handle to one regular file within an image.
///
/// The logical range is `[0, size)`; ranges not covered by any extent read
/// as zeros, and ranges spanning several extents are stitched together in
/// logical order. Each handle owns its read position, and keeps the backing
/// storage alive through an `Arc`, so handles stay valid however the owning
/// image and other handles are moved or dropped.
///
/// `File` implements [`std::io::Read`] and [`std::io::Seek`].
#[derive(Debug, Clone)]
pub struct File {
    mmap: Arc<Mmap>,
    extents: Vec<Extent>,
    inum: u64,
    size: u64,
    pos: u64,
}

impl File {
    pub(crate) fn new(mmap: Arc<Mmap>, extents: Vec<Extent>, inum: u64, size: u64) -> Self {
        File {
            mmap,
            extents,
            inum,
            size,
            pos: 0,
        }
    }

    /// Declared size of the file in bytes. Reads never return more than
    /// this, even when the extent map covers a trailing padding byte.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn inum(&self) -> u64 {
        self.inum
    }

    /// Reads at an explicit offset without touching the seek position.
    /// Returns the number of bytes read; short only at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        if offset >= self.size {
            return 0;
        }
        let end = cmp::min(offset + buf.len() as u64, self.size);
        let len = (end - offset) as usize;
        let out = &mut buf[..len];
        // Holes read as zeros.
        out.fill(0);

        for extent in &self.extents {
            let extent_end = extent.logical + extent.len;
            if extent_end <= offset {
                continue;
            }
            if extent.logical >= end {
                break;
            }
            let copy_start = cmp::max(extent.logical, offset);
            let copy_end = cmp::min(extent_end, end);
            let src = (extent.physical + (copy_start - extent.logical)) as usize;
            let dst = (copy_start - offset) as usize;
            let n = (copy_end - copy_start) as usize;
            out[dst..dst + n].copy_from_slice(&self.mmap[src..src + n]);
        }
        len
    }
}

impl Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match new_pos {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            )),
        }
    }
}
