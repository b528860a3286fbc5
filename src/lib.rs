// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Asynchronous VHD block backend.
//!
//! Exposes a fixed-size logical block device stored in a VHD container
//! (fixed, dynamic or differencing) and completes sector-granular requests
//! through kernel AIO.
//!
//! A note on write transactions: writes that require updating the BAT or an
//! allocation bitmap cannot be signaled as complete until every update has
//! reached disk. Transactions enforce that ordering. Bitmap-only
//! transactions group data writes touching the same bitmap; the bitmap
//! write starts only once all grouped data writes have finished, and the
//! data writes are signaled only after the bitmap write returns.
//! BAT-and-bitmap transactions additionally carry a write that zeros the
//! newly allocated bitmap on disk; when the data writes and the zero-bitmap
//! write complete, the BAT and bitmap writes are started in parallel and
//! the transaction finishes only after both succeed.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::ptr::NonNull;

use remain::sorted;
use thiserror::Error;

pub mod aio;
pub mod bat;
pub mod bitmap;
pub mod create;
pub mod driver;
pub mod header;
pub mod request;

pub use create::{create, snapshot};
pub use driver::{OpenFlags, TdCallback, VhdDriver, VhdInfo};
pub use header::{DiskType, DynamicHeader, Footer};

pub const VHD_SECTOR_SHIFT: u32 = 9;
pub const VHD_SECTOR_SIZE: u64 = 1 << VHD_SECTOR_SHIFT;

/// Sentinel BAT entry marking a block with no backing store.
pub const DD_BLK_UNUSED: u32 = 0xffff_ffff;

/// Completion result for reads of a sparse hole. The host dispatcher uses
/// this to consult the parent image (or synthesize zeros).
pub const BLK_NOT_ALLOCATED: i32 = -99;

/// Number of cached per-block allocation bitmaps.
pub const VHD_CACHE_SIZE: usize = 32;

// Ring depth of the host dispatcher and the segment fan-out per request
// bound the number of data descriptors that can ever be outstanding.
const MAX_REQUESTS: usize = 64;
const MAX_SEGMENTS_PER_REQ: usize = 11;

/// Capacity of the data request pool.
pub const VHD_REQS_DATA: usize = MAX_REQUESTS * MAX_SEGMENTS_PER_REQ;

// Metadata requests use descriptors embedded in the bitmap cache and the
// BAT pending-write slot: one per cached bitmap, plus the BAT sector write
// and the zero-bitmap write.
pub const VHD_REQS_TOTAL: usize = VHD_REQS_DATA + VHD_CACHE_SIZE + 2;

#[sorted]
#[derive(Error, Debug)]
pub enum VhdError {
    #[error("BAT entry {entry:#x} for block {blk} precedes the data area")]
    BadBatEntry { blk: u32, entry: u32 },
    #[error("Invalid block size {0:#x}")]
    BadBlockSize(u32),
    #[error("Checksum mismatch (stored {stored:#x}, computed {computed:#x})")]
    BadChecksum { stored: u32, computed: u32 },
    #[error("Not a VHD image (bad cookie)")]
    BadCookie,
    #[error("Invalid parent locator")]
    BadLocator,
    #[error("Invalid parent path")]
    BadParentPath,
    #[error("Failed creating the AIO context")]
    NewAioContext(#[source] io::Error),
    #[error("Failed opening image")]
    OpenImage(#[source] io::Error),
    #[error("Parent image has been modified since the snapshot was taken")]
    ParentModified,
    #[error("Parent image UUID does not match the child's record")]
    ParentUuidMismatch,
    #[error("Failed reading image metadata")]
    ReadMetadata(#[source] io::Error),
    #[error("Unsupported disk type {0}")]
    UnsupportedDiskType(u32),
    #[error("Unsupported dynamic-disk header version {0:#x}")]
    UnsupportedVersion(u32),
    #[error("Failed writing image metadata")]
    WriteMetadata(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VhdError>;

pub(crate) fn secs_round_up(bytes: u64) -> u64 {
    bytes.div_ceil(VHD_SECTOR_SIZE)
}

/// An owned, zero-initialized buffer with explicit alignment, suitable for
/// direct I/O.
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

impl AlignedBuf {
    /// Allocates `size` zeroed bytes aligned to `align`.
    pub fn zeroed(size: usize, align: usize) -> AlignedBuf {
        let layout = Layout::from_size_align(size.max(align), align).expect("bad buffer layout");
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => std::alloc::handle_alloc_error(layout),
        };
        AlignedBuf { ptr, size, layout }
    }

    /// A buffer of `nr_secs` sectors, page-aligned.
    pub fn sectors(nr_secs: u32) -> AlignedBuf {
        // SAFETY: trivially safe FFI call
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        AlignedBuf::zeroed((nr_secs as usize) << VHD_SECTOR_SHIFT, page)
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is live and at least `size` bytes long
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the allocation is live and at least `size` bytes long
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with the same layout in `zeroed`
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_buf_is_zeroed_and_aligned() {
        let mut buf = AlignedBuf::zeroed(4096, 4096);
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));

        buf.as_mut_slice().fill(0xa5);
        buf.zero();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn secs_round_up_boundaries() {
        assert_eq!(secs_round_up(0), 0);
        assert_eq!(secs_round_up(1), 1);
        assert_eq!(secs_round_up(512), 1);
        assert_eq!(secs_round_up(513), 2);
        assert_eq!(secs_round_up(4096), 8);
    }
}
