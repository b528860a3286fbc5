// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Kernel-AIO engine: accumulates control blocks into a submission vector,
//! submits them in batch and drains completions one event at a time.
//! Completions fan out through an eventfd so the host dispatcher can poll a
//! single descriptor.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use vmm_sys_util::aio;
use vmm_sys_util::eventfd::EventFd;

/// An I/O that the kernel refused at submit time: the originating request
/// token and the errno to fail it with.
pub type RefusedIo = (u64, i32);

pub struct AioContext {
    fd: RawFd,
    ctx: aio::IoContext,
    eventfd: EventFd,
    queue: Vec<aio::IoControlBlock>,
}

impl AioContext {
    pub fn new(fd: RawFd, depth: u32) -> io::Result<Self> {
        let eventfd = EventFd::new(libc::EFD_NONBLOCK)?;
        let ctx = aio::IoContext::new(depth)?;

        Ok(AioContext {
            fd,
            ctx,
            eventfd,
            queue: Vec::with_capacity(depth as usize),
        })
    }

    /// Signaled whenever a completion is ready to be reaped.
    pub fn notifier(&self) -> &EventFd {
        &self.eventfd
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn prep(&mut self, opcode: u32, offset: u64, buf: *mut u8, len: usize, user_data: u64) {
        self.queue.push(aio::IoControlBlock {
            aio_fildes: self.fd as u32,
            aio_lio_opcode: opcode as u16,
            aio_buf: buf as u64,
            aio_nbytes: len as u64,
            aio_offset: offset as libc::off_t,
            aio_data: user_data,
            aio_flags: aio::IOCB_FLAG_RESFD,
            aio_resfd: self.eventfd.as_raw_fd() as u32,
            ..Default::default()
        });
    }

    pub fn prep_read(&mut self, offset: u64, buf: *mut u8, len: usize, user_data: u64) {
        self.prep(aio::IOCB_CMD_PREAD, offset, buf, len, user_data);
    }

    pub fn prep_write(&mut self, offset: u64, buf: *mut u8, len: usize, user_data: u64) {
        self.prep(aio::IOCB_CMD_PWRITE, offset, buf, len, user_data);
    }

    /// Submits the accumulated vector. Control blocks the kernel refuses
    /// (partial or full failure) are handed back so the caller can route
    /// them through the normal completion finishers.
    pub fn submit(&mut self) -> (usize, Vec<RefusedIo>) {
        if self.queue.is_empty() {
            return (0, Vec::new());
        }

        let total = self.queue.len();
        let result = {
            let iocbs: Vec<&mut aio::IoControlBlock> = self.queue.iter_mut().collect();
            self.ctx.submit(&iocbs[..])
        };

        let mut refused = Vec::new();
        let submitted = match result {
            Ok(n) if n >= total => total,
            Ok(n) => {
                for iocb in &self.queue[n..] {
                    refused.push((iocb.aio_data, -libc::EIO));
                }
                n
            }
            Err(e) => {
                let errno = -e.raw_os_error().unwrap_or(libc::EIO);
                for iocb in &self.queue {
                    refused.push((iocb.aio_data, errno));
                }
                0
            }
        };

        self.queue.clear();
        (submitted, refused)
    }

    /// Non-blocking reap of one completion: the request token and the raw
    /// result (bytes transferred, or a negative errno).
    pub fn next_event(&mut self) -> Option<(u64, i64)> {
        let mut events: [aio::IoEvent; 1] = [aio::IoEvent::default()];
        let rc = self.ctx.get_events(0, &mut events, None).unwrap();
        if rc == 0 {
            None
        } else {
            Some((events[0].data, events[0].res))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempfile::TempFile;

    fn drain(ctx: &mut AioContext) -> Vec<(u64, i64)> {
        let mut done = Vec::new();
        while done.is_empty() {
            while let Some(ev) = ctx.next_event() {
                done.push(ev);
            }
        }
        done
    }

    #[test]
    fn write_then_read_round_trip() {
        let f = TempFile::new().unwrap().into_file();
        f.set_len(4096).unwrap();
        let mut ctx = AioContext::new(f.as_raw_fd(), 16).unwrap();

        let mut wbuf = crate::AlignedBuf::sectors(1);
        wbuf.as_mut_slice().fill(0x5a);
        ctx.prep_write(512, wbuf.as_mut_ptr(), 512, 1);
        let (submitted, refused) = ctx.submit();
        assert_eq!(submitted, 1);
        assert!(refused.is_empty());
        assert_eq!(drain(&mut ctx), vec![(1, 512)]);

        let mut rbuf = crate::AlignedBuf::sectors(1);
        ctx.prep_read(512, rbuf.as_mut_ptr(), 512, 2);
        let (submitted, _) = ctx.submit();
        assert_eq!(submitted, 1);
        assert_eq!(drain(&mut ctx), vec![(2, 512)]);
        assert!(rbuf.as_slice().iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn batch_submit_completes_all() {
        let f = TempFile::new().unwrap().into_file();
        f.set_len(8192).unwrap();
        let mut ctx = AioContext::new(f.as_raw_fd(), 16).unwrap();

        let mut bufs: Vec<crate::AlignedBuf> = (0..4).map(|_| crate::AlignedBuf::sectors(1)).collect();
        for (i, buf) in bufs.iter_mut().enumerate() {
            ctx.prep_write((i as u64) * 512, buf.as_mut_ptr(), 512, i as u64);
        }
        assert_eq!(ctx.queued(), 4);
        let (submitted, refused) = ctx.submit();
        assert_eq!(submitted, 4);
        assert!(refused.is_empty());
        assert_eq!(ctx.queued(), 0);

        let mut done = Vec::new();
        while done.len() < 4 {
            while let Some(ev) = ctx.next_event() {
                done.push(ev);
            }
        }
        done.sort_unstable();
        assert_eq!(done, vec![(0, 512), (1, 512), (2, 512), (3, 512)]);
    }

    #[test]
    fn empty_submit_is_a_no_op() {
        let f = TempFile::new().unwrap().into_file();
        let mut ctx = AioContext::new(f.as_raw_fd(), 4).unwrap();
        let (submitted, refused) = ctx.submit();
        assert_eq!(submitted, 0);
        assert!(refused.is_empty());
    }
}
