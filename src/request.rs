// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Data request descriptors and the write transactions that gate their
//! completion.
//!
//! Data descriptors come from a fixed pool so the hot path never allocates;
//! metadata writes (bitmap, zero-bitmap, BAT) use buffers embedded in the
//! objects that own them and therefore cannot fail for want of a slot.

use bitflags::bitflags;

use crate::driver::TdCallback;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReqFlags: u8 {
        /// The write targets a block whose BAT entry is still unused.
        const UPDATE_BAT = 1;
        /// The write must set bits in the block's allocation bitmap.
        const UPDATE_BITMAP = 1 << 1;
        /// Parked on a bitmap's deferred queue behind a closed transaction.
        const QUEUED = 1 << 2;
        /// The request's own I/O has completed.
        const FINISHED = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxFlags: u8 {
        const LIVE = 1;
        const UPDATE_BAT = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum VhdOp {
    #[default]
    DataRead,
    DataWrite,
    BitmapRead,
    BitmapWrite,
    ZeroBmWrite,
    BatWrite,
}

/// A queued data request. `buf` belongs to the caller and must stay valid
/// until the completion callback fires.
pub struct VhdRequest {
    pub id: u64,
    pub tag: u64,
    pub error: i32,
    pub buf: *mut u8,
    pub op: VhdOp,
    pub lsec: u64,
    pub nr_secs: u32,
    pub flags: ReqFlags,
    pub cb: Option<TdCallback>,
    pub in_tx: bool,
}

impl Default for VhdRequest {
    fn default() -> Self {
        VhdRequest {
            id: 0,
            tag: 0,
            error: 0,
            buf: std::ptr::null_mut(),
            op: VhdOp::default(),
            lsec: 0,
            nr_secs: 0,
            flags: ReqFlags::empty(),
            cb: None,
            in_tx: false,
        }
    }
}

/// Groups data writes with the metadata writes that make them durable.
/// Complete once every member that started has finished.
#[derive(Default)]
pub struct VhdTransaction {
    pub error: i32,
    pub closed: bool,
    pub started: u32,
    pub finished: u32,
    pub status: TxFlags,
    /// Pool indices of the member data requests.
    pub requests: Vec<usize>,
}

impl VhdTransaction {
    pub fn reset(&mut self) {
        self.error = 0;
        self.closed = false;
        self.started = 0;
        self.finished = 0;
        self.status = TxFlags::empty();
        self.requests.clear();
    }

    /// Enrolls a data request.
    pub fn add(&mut self, rid: usize) {
        debug_assert!(!self.closed);
        self.started += 1;
        self.requests.push(rid);
        self.status.insert(TxFlags::LIVE);
    }

    /// Enrolls a metadata write (the zero-bitmap write), which is counted
    /// but never signaled upward.
    pub fn add_meta(&mut self) {
        debug_assert!(!self.closed);
        self.started += 1;
        self.status.insert(TxFlags::LIVE);
    }

    pub fn completed(&self) -> bool {
        self.started == self.finished
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_empty()
    }

    pub fn taint(&mut self, error: i32) {
        if self.error == 0 {
            self.error = error;
        }
    }
}

/// Fixed pool of data request descriptors with a LIFO free stack.
pub struct RequestPool {
    reqs: Vec<VhdRequest>,
    free: Vec<usize>,
}

impl RequestPool {
    pub fn new(count: usize) -> RequestPool {
        let mut reqs = Vec::with_capacity(count);
        reqs.resize_with(count, VhdRequest::default);
        RequestPool {
            reqs,
            free: (0..count).rev().collect(),
        }
    }

    /// Returns a free descriptor index, or `None` when the pool is
    /// exhausted; the scheduler surfaces that as a retriable busy.
    pub fn alloc(&mut self) -> Option<usize> {
        let rid = self.free.pop()?;
        debug_assert_eq!(self.reqs[rid].nr_secs, 0);
        Some(rid)
    }

    pub fn free(&mut self, rid: usize) {
        self.reqs[rid] = VhdRequest::default();
        self.free.push(rid);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn req(&self, rid: usize) -> &VhdRequest {
        &self.reqs[rid]
    }

    pub fn req_mut(&mut self, rid: usize) -> &mut VhdRequest {
        &mut self.reqs[rid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_alloc_free_lifo() {
        let mut pool = RequestPool::new(4);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        pool.free(b);
        // Most recently freed slot is reused first.
        assert_eq!(pool.alloc().unwrap(), b);
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let mut pool = RequestPool::new(2);
        let a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        pool.free(a);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn freed_descriptor_is_reset() {
        let mut pool = RequestPool::new(1);
        let rid = pool.alloc().unwrap();
        let req = pool.req_mut(rid);
        req.nr_secs = 8;
        req.flags.insert(ReqFlags::FINISHED);
        req.in_tx = true;
        pool.free(rid);
        let rid = pool.alloc().unwrap();
        let req = pool.req(rid);
        assert_eq!(req.nr_secs, 0);
        assert!(req.flags.is_empty());
        assert!(!req.in_tx);
    }

    #[test]
    fn transaction_lifecycle() {
        let mut tx = VhdTransaction::default();
        assert!(tx.completed());
        assert!(!tx.is_live());

        tx.add(3);
        tx.add_meta();
        assert!(tx.is_live());
        assert!(!tx.completed());
        assert_eq!(tx.requests, vec![3]);

        tx.finished += 2;
        assert!(tx.completed());

        tx.taint(-5);
        tx.taint(-7);
        assert_eq!(tx.error, -5);

        tx.reset();
        assert!(!tx.is_live());
        assert!(tx.requests.is_empty());
        assert_eq!(tx.error, 0);
    }
}
