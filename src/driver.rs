// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Per-image driver: request scheduling, the AIO submit/poll loop and the
//! completion finishers that advance the write-path state machine.
//!
//! Everything here runs on one thread; I/O completion is the only source
//! of concurrency. The `LOCKED` flags on bitmaps and the BAT are logical
//! locks keeping objects alive while outstanding work references them, not
//! mutexes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::aio::AioContext;
use crate::bat::{BatFlags, VhdBat};
use crate::bitmap::{set_bit, test_bit, BitmapCache, BmFlags};
use crate::header::{
    macx_decode_location, vhd_time, w2ku_decode_location, DiskType, DynamicHeader, Footer,
    DD_HEADER_SIZE, DD_VERSION, FOOTER_SIZE, PLAT_CODE_MACX, PLAT_CODE_W2KU,
};
use crate::request::{ReqFlags, RequestPool, TxFlags, VhdOp};
use crate::{
    secs_round_up, AlignedBuf, Result, VhdError, BLK_NOT_ALLOCATED, DD_BLK_UNUSED, VHD_CACHE_SIZE,
    VHD_REQS_DATA, VHD_REQS_TOTAL, VHD_SECTOR_SHIFT, VHD_SECTOR_SIZE,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u8 {
        const RDONLY = 1;
        /// Open for metadata inspection only: no bitmap cache is set up and
        /// no data requests may be queued.
        const NO_CACHE = 1 << 1;
    }
}

/// Per-request completion callback. Invoked exactly once per classified
/// run with 0, a negative errno, or [`BLK_NOT_ALLOCATED`]; may queue
/// further requests on the driver it is handed.
pub type TdCallback = fn(&mut VhdDriver, res: i32, sector: u64, nr_secs: u32, id: u64, tag: u64) -> i32;

/// Bitmap-cache classification of one incoming sector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BitmapState {
    /// Another block's BAT allocation is in flight.
    BatLocked,
    /// The target block has no backing store.
    BatClear,
    /// Bitmap cached, bit clear: the sector is a hole in this image.
    BitClear,
    /// Data present for the sector.
    BitSet,
    /// The block's bitmap is not cached.
    NotCached,
    /// The block's bitmap is being read.
    ReadPending,
}

/// Identifies the request behind a kernel AIO completion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum IoTarget {
    /// A pooled data descriptor.
    Data(usize),
    /// The embedded descriptor of a cached bitmap.
    Bitmap(u32),
    /// The zero-bitmap write of the pending block allocation.
    ZeroBm,
    /// The BAT sector write of the pending block allocation.
    Bat,
}

const UD_DATA: u64 = 0;
const UD_BITMAP: u64 = 1;
const UD_ZERO_BM: u64 = 2;
const UD_BAT: u64 = 3;

fn encode_target(target: IoTarget) -> u64 {
    match target {
        IoTarget::Data(rid) => (UD_DATA << 32) | rid as u64,
        IoTarget::Bitmap(blk) => (UD_BITMAP << 32) | u64::from(blk),
        IoTarget::ZeroBm => UD_ZERO_BM << 32,
        IoTarget::Bat => UD_BAT << 32,
    }
}

fn decode_target(user_data: u64) -> IoTarget {
    match user_data >> 32 {
        UD_DATA => IoTarget::Data(user_data as u32 as usize),
        UD_BITMAP => IoTarget::Bitmap(user_data as u32),
        UD_ZERO_BM => IoTarget::ZeroBm,
        UD_BAT => IoTarget::Bat,
        _ => unreachable!("corrupt completion token {user_data:#x}"),
    }
}

#[derive(Default)]
struct Stats {
    queued: u64,
    submitted: u64,
    returned: u64,
    reads: u64,
    writes: u64,
    read_size: u64,
    write_size: u64,
    submits: u64,
    callbacks: u64,
    callback_sum: u64,
}

/// Information about an open image, for hosts that inspect allocation.
#[derive(Clone, Debug)]
pub struct VhdInfo {
    pub spb: u32,
    pub secs: u64,
    pub bat: Vec<u32>,
}

pub struct VhdDriver {
    file: File,
    path: PathBuf,
    read_only: bool,

    footer: Footer,
    hdr: DynamicHeader,
    /// Sectors per page.
    spp: u32,
    /// Sectors per block.
    spb: u32,
    /// Bitmap size in sectors.
    bm_secs: u32,
    /// Allocation cursor: sector at which the next block will be placed.
    next_db: u64,
    /// Virtual disk size in sectors.
    sectors: u64,

    bat: VhdBat,
    cache: BitmapCache,
    pool: RequestPool,
    aio: AioContext,
    stats: Stats,
}

impl VhdDriver {
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<VhdDriver> {
        let path = path.as_ref().to_path_buf();
        let read_only = flags.contains(OpenFlags::RDONLY);

        debug!("vhd_open: {}", path.display());
        let mut file = open_image(&path, read_only)?;
        let footer = read_footer(&mut file)?;

        let mut hdr = DynamicHeader::default();
        let mut spb = 0;
        let mut bm_secs = 0;
        let mut next_db = 0;
        let mut bat_entries = Vec::new();
        // SAFETY: trivially safe FFI call
        let spp = (unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64 >> VHD_SECTOR_SHIFT) as u32;

        if footer.disk_type != DiskType::Fixed {
            hdr = read_dynamic_header(&mut file, footer.data_offset)?;
            if hdr.hdr_ver != DD_VERSION {
                return Err(VhdError::UnsupportedVersion(hdr.hdr_ver));
            }
            if hdr.block_size < VHD_SECTOR_SIZE as u32 || !hdr.block_size.is_power_of_two() {
                return Err(VhdError::BadBlockSize(hdr.block_size));
            }

            spb = hdr.block_size >> VHD_SECTOR_SHIFT;
            bm_secs = secs_round_up(u64::from(spb) / 8) as u32;

            let (entries, first_free) = read_bat(&mut file, &hdr, spb, bm_secs, spp)?;
            bat_entries = entries;
            next_db = first_free;
        }

        let cache_slots = if flags.contains(OpenFlags::NO_CACHE) || footer.disk_type == DiskType::Fixed
        {
            0
        } else {
            VHD_CACHE_SIZE
        };

        let aio = AioContext::new(file.as_raw_fd(), VHD_REQS_TOTAL as u32)
            .map_err(VhdError::NewAioContext)?;

        let sectors = footer.curr_size >> VHD_SECTOR_SHIFT;
        info!(
            "vhd_open: {} done (sz: {sectors} sectors, type: {:?})",
            path.display(),
            footer.disk_type
        );

        Ok(VhdDriver {
            file,
            path,
            read_only,
            footer,
            hdr,
            spp,
            spb,
            bm_secs,
            next_db,
            sectors,
            bat: VhdBat::new(bat_entries, bm_secs),
            cache: BitmapCache::new(cache_slots, bm_secs.max(1)),
            pool: RequestPool::new(VHD_REQS_DATA),
            aio,
            stats: Stats::default(),
        })
    }

    /// Flushes the footer (for writable opens) and releases all state.
    /// Only legal once no requests are outstanding.
    pub fn close(mut self) -> Result<()> {
        if !self.read_only {
            let offset = if self.footer.disk_type == DiskType::Fixed {
                self.footer.curr_size
            } else {
                self.next_db << VHD_SECTOR_SHIFT
            };
            let mut buf = AlignedBuf::sectors(1);
            buf.as_mut_slice().copy_from_slice(&self.footer.serialize());
            self.file
                .seek(SeekFrom::Start(offset))
                .map_err(VhdError::WriteMetadata)?;
            self.file
                .write_all(buf.as_slice())
                .map_err(VhdError::WriteMetadata)?;
        }

        debug!(
            "vhd_close: {}: queued: {}, submitted: {}, returned: {}, writes: {}, reads: {}, \
             avg_write: {:.1}, avg_read: {:.1}, avg_submit_batch: {:.1}, avg_callback_batch: {:.1}",
            self.path.display(),
            self.stats.queued,
            self.stats.submitted,
            self.stats.returned,
            self.stats.writes,
            self.stats.reads,
            per(self.stats.write_size, self.stats.writes),
            per(self.stats.read_size, self.stats.reads),
            per(self.stats.submitted, self.stats.submits),
            per(self.stats.callback_sum, self.stats.callbacks),
        );

        Ok(())
    }

    /// Virtual disk size in sectors.
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    pub fn sector_size(&self) -> u64 {
        VHD_SECTOR_SIZE
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn header(&self) -> &DynamicHeader {
        &self.hdr
    }

    /// Signaled when completions are ready; poll this, then call
    /// [`VhdDriver::do_callbacks`].
    pub fn notifier(&self) -> &EventFd {
        self.aio.notifier()
    }

    pub fn info(&self) -> VhdInfo {
        VhdInfo {
            spb: self.spb,
            secs: self.sectors,
            bat: self.bat.entries().to_vec(),
        }
    }

    fn blk_of(&self, sector: u64) -> u32 {
        (sector / u64::from(self.spb)) as u32
    }

    fn sec_in_blk(&self, sector: u64) -> u32 {
        (sector % u64::from(self.spb)) as u32
    }

    /// Sectors left in the target block; a run never straddles two blocks.
    fn block_remainder(&self, sector: u64) -> u32 {
        self.spb - self.sec_in_blk(sector)
    }

    fn bitmap_state(&mut self, sector: u64, write: bool) -> BitmapState {
        // In fixed disks, every sector is present.
        if self.footer.disk_type == DiskType::Fixed {
            return BitmapState::BitSet;
        }

        let blk = self.blk_of(sector);
        if self.bat.entry(blk) == DD_BLK_UNUSED {
            if write && self.bat.locked() && self.bat.pbw_blk != blk {
                return BitmapState::BatLocked;
            }
            return BitmapState::BatClear;
        }

        // Allocated blocks of dynamic disks are fully present; the bitmap
        // is maintained only for the allocation interlock.
        if self.footer.disk_type == DiskType::Dynamic {
            return BitmapState::BitSet;
        }

        let bi = match self.cache.find(blk) {
            Some(bi) => bi,
            None => return BitmapState::NotCached,
        };
        self.cache.touch(bi);

        let bm = self.cache.slot(bi);
        if bm.status.contains(BmFlags::READ_PENDING) {
            return BitmapState::ReadPending;
        }

        if test_bit(bm.map.as_slice(), self.sec_in_blk(sector)) {
            BitmapState::BitSet
        } else {
            BitmapState::BitClear
        }
    }

    /// Length of the maximal run starting at `sector` whose bits all equal
    /// `value`, capped at the block boundary.
    fn bitmap_span(&self, sector: u64, nr_secs: u32, value: bool) -> u32 {
        if self.footer.disk_type == DiskType::Fixed {
            return nr_secs;
        }

        let sec = self.sec_in_blk(sector);
        let max = (self.spb - sec).min(nr_secs);

        if self.footer.disk_type == DiskType::Dynamic {
            return max;
        }

        let bi = self.cache.find(self.blk_of(sector)).expect("bitmap cached");
        let bm = self.cache.slot(bi);
        debug_assert!(bm.valid());

        let mut n = 0;
        while n < max && test_bit(bm.map.as_slice(), sec + n) == value {
            n += 1;
        }
        n
    }

    /// Queues a read of `nr_sectors` sectors into `buf`.
    ///
    /// Walks the range in maximal runs; each run completes through `cb`
    /// exactly once, possibly synchronously (holes report
    /// [`BLK_NOT_ALLOCATED`] without touching disk). Returns the sum of the
    /// callback returns.
    ///
    /// # Safety contract
    ///
    /// `buf` must point to `nr_sectors` sectors of page-aligned memory that
    /// stays valid until every callback for the range has fired.
    pub fn queue_read(
        &mut self,
        sector: u64,
        nr_sectors: u32,
        buf: *mut u8,
        cb: TdCallback,
        id: u64,
        tag: u64,
    ) -> i32 {
        debug!("queue_read: sector: {sector}, nr_sectors: {nr_sectors}");

        if nr_sectors == 0 {
            return cb(self, 0, sector, 0, id, tag);
        }
        if sector
            .checked_add(u64::from(nr_sectors))
            .map_or(true, |end| end > self.sectors)
        {
            return cb(self, -libc::EINVAL, sector, nr_sectors, id, tag);
        }

        let mut rsp = 0;
        let mut sec = sector;
        let end = sector + u64::from(nr_sectors);
        let mut buf = buf;

        while sec < end {
            let remaining = (end - sec) as u32;
            let n;

            match self.bitmap_state(sec, false) {
                BitmapState::BatClear => {
                    n = remaining.min(self.block_remainder(sec));
                    let ret = cb(self, BLK_NOT_ALLOCATED, sec, n, id, tag);
                    if ret == -libc::EBUSY {
                        return cb(self, -libc::EBUSY, sec + u64::from(n), remaining - n, id, tag);
                    }
                    rsp += ret;
                }

                BitmapState::BitClear => {
                    n = self.bitmap_span(sec, remaining, false);
                    let ret = cb(self, BLK_NOT_ALLOCATED, sec, n, id, tag);
                    if ret == -libc::EBUSY {
                        return cb(self, -libc::EBUSY, sec + u64::from(n), remaining - n, id, tag);
                    }
                    rsp += ret;
                }

                BitmapState::BitSet => {
                    n = self.bitmap_span(sec, remaining, true);
                    if let Err(err) =
                        self.schedule_data_read(sec, n, buf, ReqFlags::empty(), cb, id, tag)
                    {
                        return cb(self, err, sec, remaining, id, tag);
                    }
                }

                BitmapState::NotCached => {
                    n = remaining.min(self.block_remainder(sec));
                    if let Err(err) = self.schedule_bitmap_read(self.blk_of(sec)) {
                        return cb(self, err, sec, remaining, id, tag);
                    }
                    if let Err(err) = self.defer_to_bitmap(VhdOp::DataRead, sec, n, buf, cb, id, tag)
                    {
                        return cb(self, err, sec, remaining, id, tag);
                    }
                }

                BitmapState::ReadPending => {
                    n = remaining.min(self.block_remainder(sec));
                    if let Err(err) = self.defer_to_bitmap(VhdOp::DataRead, sec, n, buf, cb, id, tag)
                    {
                        return cb(self, err, sec, remaining, id, tag);
                    }
                }

                BitmapState::BatLocked => unreachable!("BAT lock observed on the read path"),
            }

            sec += u64::from(n);
            // SAFETY: the caller's buffer spans the queued range
            buf = unsafe { buf.add((n as usize) << VHD_SECTOR_SHIFT) };
        }

        rsp
    }

    /// Queues a write of `nr_sectors` sectors from `buf`; same walking,
    /// callback and buffer rules as [`VhdDriver::queue_read`]. Writes to
    /// unallocated or partially present blocks are gated on their metadata
    /// updates and complete only once those are durable.
    pub fn queue_write(
        &mut self,
        sector: u64,
        nr_sectors: u32,
        buf: *mut u8,
        cb: TdCallback,
        id: u64,
        tag: u64,
    ) -> i32 {
        debug!("queue_write: sector: {sector}, nr_sectors: {nr_sectors}");

        if nr_sectors == 0 {
            return cb(self, 0, sector, 0, id, tag);
        }
        if sector
            .checked_add(u64::from(nr_sectors))
            .map_or(true, |end| end > self.sectors)
        {
            return cb(self, -libc::EINVAL, sector, nr_sectors, id, tag);
        }

        let mut sec = sector;
        let end = sector + u64::from(nr_sectors);
        let mut buf = buf;

        while sec < end {
            let remaining = (end - sec) as u32;
            let n;

            match self.bitmap_state(sec, true) {
                BitmapState::BatLocked => {
                    return cb(self, -libc::EBUSY, sec, remaining, id, tag);
                }

                BitmapState::BatClear => {
                    let flags = ReqFlags::UPDATE_BAT | ReqFlags::UPDATE_BITMAP;
                    n = remaining.min(self.block_remainder(sec));
                    if let Err(err) = self.schedule_data_write(sec, n, buf, flags, cb, id, tag) {
                        return cb(self, err, sec, remaining, id, tag);
                    }
                }

                BitmapState::BitClear => {
                    n = self.bitmap_span(sec, remaining, false);
                    let flags = ReqFlags::UPDATE_BITMAP;
                    if let Err(err) = self.schedule_data_write(sec, n, buf, flags, cb, id, tag) {
                        return cb(self, err, sec, remaining, id, tag);
                    }
                }

                BitmapState::BitSet => {
                    n = self.bitmap_span(sec, remaining, true);
                    if let Err(err) =
                        self.schedule_data_write(sec, n, buf, ReqFlags::empty(), cb, id, tag)
                    {
                        return cb(self, err, sec, remaining, id, tag);
                    }
                }

                BitmapState::NotCached => {
                    n = remaining.min(self.block_remainder(sec));
                    if let Err(err) = self.schedule_bitmap_read(self.blk_of(sec)) {
                        return cb(self, err, sec, remaining, id, tag);
                    }
                    if let Err(err) =
                        self.defer_to_bitmap(VhdOp::DataWrite, sec, n, buf, cb, id, tag)
                    {
                        return cb(self, err, sec, remaining, id, tag);
                    }
                }

                BitmapState::ReadPending => {
                    n = remaining.min(self.block_remainder(sec));
                    if let Err(err) =
                        self.defer_to_bitmap(VhdOp::DataWrite, sec, n, buf, cb, id, tag)
                    {
                        return cb(self, err, sec, remaining, id, tag);
                    }
                }
            }

            sec += u64::from(n);
            // SAFETY: the caller's buffer spans the queued range
            buf = unsafe { buf.add((n as usize) << VHD_SECTOR_SHIFT) };
        }

        0
    }

    fn aio_read(&mut self, offset: u64, buf: *mut u8, len: usize, target: IoTarget, nr_secs: u32) {
        self.aio.prep_read(offset, buf, len, encode_target(target));
        self.stats.queued += 1;
        self.stats.reads += 1;
        self.stats.read_size += u64::from(nr_secs);
    }

    fn aio_write(&mut self, offset: u64, buf: *mut u8, len: usize, target: IoTarget, nr_secs: u32) {
        self.aio.prep_write(offset, buf, len, encode_target(target));
        self.stats.queued += 1;
        self.stats.writes += 1;
        self.stats.write_size += u64::from(nr_secs);
    }

    fn schedule_data_read(
        &mut self,
        sector: u64,
        nr_secs: u32,
        buf: *mut u8,
        flags: ReqFlags,
        cb: TdCallback,
        id: u64,
        tag: u64,
    ) -> std::result::Result<(), i32> {
        let offset = if self.footer.disk_type == DiskType::Fixed {
            sector << VHD_SECTOR_SHIFT
        } else {
            let blk = self.blk_of(sector);
            let entry = self.bat.entry(blk);
            debug_assert!(entry != DD_BLK_UNUSED);
            (u64::from(entry) + u64::from(self.bm_secs) + u64::from(self.sec_in_blk(sector)))
                << VHD_SECTOR_SHIFT
        };

        let rid = self.pool.alloc().ok_or(-libc::EBUSY)?;
        let req = self.pool.req_mut(rid);
        req.lsec = sector;
        req.nr_secs = nr_secs;
        req.buf = buf;
        req.flags = flags;
        req.cb = Some(cb);
        req.id = id;
        req.tag = tag;
        req.op = VhdOp::DataRead;

        self.aio_read(offset, buf, (nr_secs as usize) << VHD_SECTOR_SHIFT, IoTarget::Data(rid), nr_secs);

        debug!("data read scheduled: lsec: {sector}, nr_secs: {nr_secs}, offset: {offset}");
        Ok(())
    }

    fn schedule_data_write(
        &mut self,
        sector: u64,
        nr_secs: u32,
        buf: *mut u8,
        flags: ReqFlags,
        cb: TdCallback,
        id: u64,
        tag: u64,
    ) -> std::result::Result<(), i32> {
        let mut blk = 0;
        let offset = if self.footer.disk_type == DiskType::Fixed {
            sector << VHD_SECTOR_SHIFT
        } else {
            blk = self.blk_of(sector);
            let mut base = u64::from(self.bat.entry(blk));
            if flags.contains(ReqFlags::UPDATE_BAT) {
                self.update_bat(blk)?;
                base = self.bat.pbw_offset;
            }
            (base + u64::from(self.bm_secs) + u64::from(self.sec_in_blk(sector)))
                << VHD_SECTOR_SHIFT
        };

        let rid = self.pool.alloc().ok_or(-libc::EBUSY)?;
        let req = self.pool.req_mut(rid);
        req.lsec = sector;
        req.nr_secs = nr_secs;
        req.buf = buf;
        req.flags = flags;
        req.cb = Some(cb);
        req.id = id;
        req.tag = tag;
        req.op = VhdOp::DataWrite;

        if flags.contains(ReqFlags::UPDATE_BITMAP) {
            let bi = self.cache.find(blk).expect("bitmap cached for update");
            let bm = self.cache.slot_mut(bi);
            debug_assert!(bm.valid());
            bm.lock();

            if bm.tx.closed {
                // Defer past the in-flight transaction; drained into a
                // fresh one when it finalizes.
                bm.queue.push(rid);
                self.pool.req_mut(rid).flags.insert(ReqFlags::QUEUED);
            } else {
                bm.tx.add(rid);
                self.pool.req_mut(rid).in_tx = true;
            }
        }

        self.aio_write(offset, buf, (nr_secs as usize) << VHD_SECTOR_SHIFT, IoTarget::Data(rid), nr_secs);

        debug!(
            "data write scheduled: lsec: {sector}, nr_secs: {nr_secs}, offset: {offset}, \
             flags: {flags:?}"
        );
        Ok(())
    }

    /// Opens (or joins) the block allocation for `blk`: installs a zeroed
    /// bitmap, reserves the file offset and schedules the zero-bitmap
    /// write. The BAT write follows once the zero-bitmap write completes.
    fn update_bat(&mut self, blk: u32) -> std::result::Result<(), i32> {
        debug_assert_eq!(self.bat.entry(blk), DD_BLK_UNUSED);

        if self.bat.locked() {
            // The scheduler only lets same-block writes through while the
            // slot is held; they join the pending allocation.
            debug_assert_eq!(self.bat.pbw_blk, blk);
            return Ok(());
        }

        // The empty bitmap may already be cached if an earlier BAT update
        // failed.
        let bi = match self.cache.find(blk) {
            Some(bi) => bi,
            None => self.cache.alloc(blk).ok_or(-libc::EBUSY)?,
        };

        self.bat.reserve(blk, self.next_db);
        self.schedule_zero_bm_write(bi);
        self.cache
            .slot_mut(bi)
            .tx
            .status
            .insert(TxFlags::UPDATE_BAT);

        Ok(())
    }

    fn schedule_zero_bm_write(&mut self, bi: usize) {
        let offset = self.bat.pbw_offset << VHD_SECTOR_SHIFT;
        let len = (self.bm_secs as usize) << VHD_SECTOR_SHIFT;
        let ptr = self.bat.zero_buf.as_mut_ptr();

        debug!(
            "zero bitmap write scheduled: blk: {}, offset: {offset}",
            self.bat.pbw_blk
        );

        let bm = self.cache.slot_mut(bi);
        bm.lock();
        bm.tx.add_meta();
        self.aio_write(offset, ptr, len, IoTarget::ZeroBm, self.bm_secs);
    }

    fn schedule_bat_write(&mut self) {
        debug_assert!(self.bat.locked());

        let blk = self.bat.pbw_blk;
        let sector_off = self.bat.patch_sector();
        let offset = self.hdr.table_offset + sector_off;
        let ptr = self.bat.req_buf.as_mut_ptr();

        self.aio_write(offset, ptr, VHD_SECTOR_SIZE as usize, IoTarget::Bat, 1);
        self.bat.status.insert(BatFlags::WRITE_STARTED);

        debug!("bat write scheduled: blk: {blk}, offset: {offset}");
    }

    fn schedule_bitmap_read(&mut self, blk: u32) -> std::result::Result<(), i32> {
        debug_assert!(self.footer.disk_type != DiskType::Fixed);

        let entry = self.bat.entry(blk);
        debug_assert!(entry != DD_BLK_UNUSED);
        debug_assert!(self.cache.find(blk).is_none());

        let bi = self.cache.alloc(blk).ok_or(-libc::EBUSY)?;
        let offset = u64::from(entry) << VHD_SECTOR_SHIFT;
        let len = (self.bm_secs as usize) << VHD_SECTOR_SHIFT;

        let bm = self.cache.slot_mut(bi);
        let ptr = bm.map.as_mut_ptr();
        bm.lock();
        bm.status.insert(BmFlags::READ_PENDING);
        self.aio_read(offset, ptr, len, IoTarget::Bitmap(blk), self.bm_secs);

        debug!("bitmap read scheduled: blk: {blk}, offset: {offset}");
        Ok(())
    }

    fn schedule_bitmap_write(&mut self, blk: u32) {
        let bi = self.cache.find(blk).expect("bitmap cached");

        let entry = self.bat.entry(blk);
        let base = if entry == DD_BLK_UNUSED {
            // Allocation still in flight; the bitmap lands at the reserved
            // offset, racing the BAT write by design.
            debug_assert_eq!(self.bat.pbw_blk, blk);
            self.bat.pbw_offset
        } else {
            u64::from(entry)
        };
        let offset = base << VHD_SECTOR_SHIFT;
        let len = (self.bm_secs as usize) << VHD_SECTOR_SHIFT;

        let bm = self.cache.slot_mut(bi);
        debug_assert!(bm.valid() && !bm.status.contains(BmFlags::WRITE_PENDING));
        let ptr = bm.shadow.as_mut_ptr();
        bm.lock();
        bm.status.insert(BmFlags::WRITE_PENDING);
        self.cache.touch(bi);
        self.aio_write(offset, ptr, len, IoTarget::Bitmap(blk), self.bm_secs);

        debug!("bitmap write scheduled: blk: {blk}, offset: {offset}");
    }

    /// Parks a request on the bitmap read it depends on; re-dispatched
    /// through the scheduler once the bitmap arrives.
    fn defer_to_bitmap(
        &mut self,
        op: VhdOp,
        sector: u64,
        nr_secs: u32,
        buf: *mut u8,
        cb: TdCallback,
        id: u64,
        tag: u64,
    ) -> std::result::Result<(), i32> {
        let blk = self.blk_of(sector);
        let bi = self.cache.find(blk).expect("bitmap read in flight");
        debug_assert!(self.cache.slot(bi).status.contains(BmFlags::READ_PENDING));

        let rid = self.pool.alloc().ok_or(-libc::EBUSY)?;
        let req = self.pool.req_mut(rid);
        req.lsec = sector;
        req.nr_secs = nr_secs;
        req.buf = buf;
        req.cb = Some(cb);
        req.id = id;
        req.tag = tag;
        req.op = op;

        let bm = self.cache.slot_mut(bi);
        bm.waiting.push(rid);
        bm.lock();

        debug!("request deferred on bitmap: lsec: {sector}, blk: {blk}, op: {op:?}");
        Ok(())
    }

    /// Submits the accumulated I/O vector to the kernel. Control blocks
    /// the kernel refuses are synthesized into failure completions and
    /// routed through the normal finishers.
    pub fn submit(&mut self) -> i32 {
        if self.aio.queued() == 0 {
            return 0;
        }

        debug!("submitting {} iocbs", self.aio.queued());
        let (submitted, refused) = self.aio.submit();
        self.stats.submits += 1;
        self.stats.submitted += submitted as u64;

        let mut rsp = 0;
        for (user_data, err) in refused {
            error!("io submission refused: token {user_data:#x}, err {err}");
            rsp += self.complete_io(decode_target(user_data), err);
        }
        rsp
    }

    /// Drains completed I/O without blocking and runs the finishers. Call
    /// when the notifier fd becomes readable. Finishers may enqueue
    /// further I/O, which is submitted before returning.
    pub fn do_callbacks(&mut self) -> i32 {
        let queued_before = self.aio.queued();
        let mut rsp = 0;
        let mut drained = 0u64;

        while let Some((user_data, res)) = self.aio.next_event() {
            drained += 1;
            let target = decode_target(user_data);
            let expected = self.expected_bytes(target) as i64;
            let error = if res == expected { 0 } else { -libc::EIO };
            if error != 0 {
                error!("io failed: target {target:?}, res {res}, expected {expected}");
            }
            rsp += self.complete_io(target, error);
        }

        self.stats.callbacks += 1;
        self.stats.callback_sum += drained;

        if self.aio.queued() != queued_before {
            // The finishers enqueued more work.
            rsp += self.submit();
        }
        rsp
    }

    fn expected_bytes(&self, target: IoTarget) -> usize {
        match target {
            IoTarget::Data(rid) => (self.pool.req(rid).nr_secs as usize) << VHD_SECTOR_SHIFT,
            IoTarget::Bitmap(_) | IoTarget::ZeroBm => {
                (self.bm_secs as usize) << VHD_SECTOR_SHIFT
            }
            IoTarget::Bat => VHD_SECTOR_SIZE as usize,
        }
    }

    fn complete_io(&mut self, target: IoTarget, error: i32) -> i32 {
        match target {
            IoTarget::Data(rid) => {
                self.pool.req_mut(rid).error = error;
                match self.pool.req(rid).op {
                    VhdOp::DataRead => self.finish_data_read(rid),
                    VhdOp::DataWrite => self.finish_data_write(rid),
                    op => unreachable!("pooled descriptor completed as {op:?}"),
                }
            }
            IoTarget::Bitmap(blk) => {
                let bi = self.cache.find(blk).expect("completed bitmap cached");
                if self.cache.slot(bi).status.contains(BmFlags::READ_PENDING) {
                    self.finish_bitmap_read(blk, error)
                } else {
                    self.finish_bitmap_write(blk, error)
                }
            }
            IoTarget::ZeroBm => self.finish_zero_bm_write(error),
            IoTarget::Bat => self.finish_bat_write(error),
        }
    }

    /// Invokes the caller's callback for each descriptor and returns it to
    /// the pool. A nonzero `error` overrides per-request errors.
    fn signal_completion(&mut self, list: Vec<usize>, error: i32) -> i32 {
        let mut rsp = 0;
        for rid in list {
            let (cb, err, lsec, nr_secs, id, tag) = {
                let r = self.pool.req(rid);
                let err = if error != 0 { error } else { r.error };
                (r.cb, err, r.lsec, r.nr_secs, r.id, r.tag)
            };
            let cb = cb.expect("completion without a callback");
            rsp += cb(self, err, lsec, nr_secs, id, tag);
            self.pool.free(rid);
            self.stats.returned += 1;
        }
        rsp
    }

    fn finish_data_read(&mut self, rid: usize) -> i32 {
        self.signal_completion(vec![rid], 0)
    }

    fn finish_data_write(&mut self, rid: usize) -> i32 {
        let mut rsp = 0;
        self.pool.req_mut(rid).flags.insert(ReqFlags::FINISHED);

        let (in_tx, queued, error, lsec, nr_secs) = {
            let r = self.pool.req(rid);
            (
                r.in_tx,
                r.flags.contains(ReqFlags::QUEUED),
                r.error,
                r.lsec,
                r.nr_secs,
            )
        };

        if in_tx {
            let blk = self.blk_of(lsec);
            let sec = self.sec_in_blk(lsec);
            let bi = self.cache.find(blk).expect("transaction bitmap cached");
            let diff = self.footer.disk_type == DiskType::Diff;

            let completed = {
                let bm = self.cache.slot_mut(bi);
                debug_assert!(bm.valid() && bm.locked());
                bm.tx.finished += 1;
                if error != 0 {
                    bm.tx.taint(error);
                } else if diff {
                    for i in 0..nr_secs {
                        set_bit(bm.shadow.as_mut_slice(), sec + i);
                    }
                }
                debug!(
                    "data write finished: blk: {blk}, started: {}, finished: {}",
                    bm.tx.started, bm.tx.finished
                );
                bm.tx.completed()
            };

            if completed {
                rsp += self.finish_data_transaction(bi);
            }
        } else if !queued {
            rsp += self.signal_completion(vec![rid], 0);
        }

        rsp
    }

    /// Runs exactly once per transaction, when the last data write and (if
    /// present) the zero-bitmap write have completed.
    fn finish_data_transaction(&mut self, bi: usize) -> i32 {
        let bm = self.cache.slot_mut(bi);
        let blk = bm.blk;
        bm.tx.closed = true;
        let error = bm.tx.error;

        debug!("data transaction done: blk: {blk}, err: {error}");

        if error == 0 && self.footer.disk_type == DiskType::Diff {
            self.schedule_bitmap_write(blk);
            return 0;
        }

        self.finish_bitmap_transaction(bi, 0)
    }

    fn finish_bitmap_transaction(&mut self, bi: usize, error: i32) -> i32 {
        let mut rsp = 0;

        {
            let bm = self.cache.slot_mut(bi);
            bm.tx.taint(error);
            debug!("bitmap transaction finishing: blk: {}, err: {}", bm.blk, bm.tx.error);

            if bm.tx.status.contains(TxFlags::UPDATE_BAT) {
                // Still waiting for the BAT write; park and let its
                // finisher complete us.
                debug_assert_eq!(bm.blk, self.bat.pbw_blk);
                debug_assert!(self.bat.write_started());
                self.bat.parked_tx = true;
                return 0;
            }
        }

        let (list, tx_error) = {
            let bm = self.cache.slot_mut(bi);
            (std::mem::take(&mut bm.tx.requests), bm.tx.error)
        };
        rsp += self.signal_completion(list, tx_error);
        self.cache.slot_mut(bi).tx.reset();
        rsp += self.start_new_bitmap_transaction(bi);

        if !self.cache.slot(bi).in_use() {
            self.cache.slot_mut(bi).unlock();
        }

        rsp
    }

    /// Drains the bitmap's deferred queue into a fresh transaction,
    /// preserving completion state for writes whose data I/O already
    /// landed.
    fn start_new_bitmap_transaction(&mut self, bi: usize) -> i32 {
        if self.cache.slot(bi).queue.is_empty() {
            return 0;
        }

        let mut rsp = 0;
        let blk = self.cache.slot(bi).blk;
        let drained = std::mem::take(&mut self.cache.slot_mut(bi).queue);
        let mut completed = Vec::new();
        let mut error = 0;

        debug!("starting new bitmap transaction: blk: {blk}");

        if self.bat.entry(blk) == DD_BLK_UNUSED {
            // The allocation these writes were queued behind failed.
            error = -libc::EIO;
            completed = drained;
        } else {
            let diff = self.footer.disk_type == DiskType::Diff;
            for rid in drained {
                self.pool.req_mut(rid).flags.remove(ReqFlags::QUEUED);
                let (req_error, finished, lsec, nr_secs) = {
                    let r = self.pool.req(rid);
                    (
                        r.error,
                        r.flags.contains(ReqFlags::FINISHED),
                        r.lsec,
                        r.nr_secs,
                    )
                };

                if req_error != 0 {
                    completed.push(rid);
                    continue;
                }

                self.cache.slot_mut(bi).tx.add(rid);
                self.pool.req_mut(rid).in_tx = true;

                if finished {
                    let sec = self.sec_in_blk(lsec);
                    let bm = self.cache.slot_mut(bi);
                    if diff {
                        for i in 0..nr_secs {
                            set_bit(bm.shadow.as_mut_slice(), sec + i);
                        }
                    }
                    bm.tx.finished += 1;
                }
            }

            // Perhaps all the queued writes already completed.
            if self.cache.slot(bi).tx.completed() {
                rsp += self.finish_data_transaction(bi);
            }
        }

        rsp += self.signal_completion(completed, error);
        rsp
    }

    fn finish_zero_bm_write(&mut self, error: i32) -> i32 {
        let mut rsp = 0;
        let blk = self.bat.pbw_blk;
        let bi = self.cache.find(blk).expect("pending bitmap cached");

        debug_assert!(self.bat.locked());
        debug!("zero bitmap write finished: blk: {blk}, err: {error}");

        self.stats.returned += 1;
        {
            let bm = self.cache.slot_mut(bi);
            debug_assert!(bm.valid() && bm.locked());
            bm.tx.finished += 1;
        }

        if error != 0 {
            // Drop the reservation; a later write may retry the
            // allocation at the same cursor.
            self.bat.unlock();
            self.bat.reset_pending();

            let completed = {
                let bm = self.cache.slot_mut(bi);
                bm.tx.taint(error);
                bm.tx.status.remove(TxFlags::UPDATE_BAT);
                bm.tx.completed()
            };
            if completed {
                rsp += self.finish_data_transaction(bi);
            }
        } else {
            self.schedule_bat_write();
        }

        rsp
    }

    fn finish_bat_write(&mut self, error: i32) -> i32 {
        let mut rsp = 0;
        let blk = self.bat.pbw_blk;
        let bi = self.cache.find(blk).expect("pending bitmap cached");

        debug_assert!(self.bat.locked() && self.bat.write_started());
        debug_assert!(self.cache.slot(bi).tx.is_live());
        debug!("bat write finished: blk: {blk}, err: {error}");

        self.stats.returned += 1;

        if error == 0 {
            self.bat.set_entry(blk, self.bat.pbw_offset as u32);
            self.next_db += u64::from(self.spb) + u64::from(self.bm_secs);

            // The data region of the next block must begin on a page
            // boundary.
            let rem = (self.next_db + u64::from(self.bm_secs)) % u64::from(self.spp);
            if rem != 0 {
                self.next_db += u64::from(self.spp) - rem;
            }
        } else {
            self.cache.slot_mut(bi).tx.taint(error);
        }

        self.cache
            .slot_mut(bi)
            .tx
            .status
            .remove(TxFlags::UPDATE_BAT);

        if self.bat.parked_tx {
            rsp += self.finish_bitmap_transaction(bi, error);
        }

        self.bat.unlock();
        self.bat.reset_pending();

        rsp
    }

    fn finish_bitmap_read(&mut self, blk: u32, error: i32) -> i32 {
        let mut rsp = 0;
        let bi = self.cache.find(blk).expect("bitmap cached");

        debug!("bitmap read finished: blk: {blk}, err: {error}");
        self.stats.returned += 1;

        let waiters = {
            let bm = self.cache.slot_mut(bi);
            debug_assert!(bm.status.contains(BmFlags::READ_PENDING));
            bm.status.remove(BmFlags::READ_PENDING);
            std::mem::take(&mut bm.waiting)
        };

        if error == 0 {
            {
                let bm = self.cache.slot_mut(bi);
                let (map, shadow) = (&bm.map, &mut bm.shadow);
                shadow.as_mut_slice().copy_from_slice(map.as_slice());
            }

            // Re-dispatch every waiter; classification now succeeds.
            for rid in waiters {
                let (op, lsec, nr_secs, buf, cb, id, tag) = {
                    let r = self.pool.req(rid);
                    (r.op, r.lsec, r.nr_secs, r.buf, r.cb, r.id, r.tag)
                };
                let cb = cb.expect("waiting request without a callback");
                self.pool.free(rid);

                rsp += match op {
                    VhdOp::DataRead => self.queue_read(lsec, nr_secs, buf, cb, id, tag),
                    VhdOp::DataWrite => self.queue_write(lsec, nr_secs, buf, cb, id, tag),
                    op => unreachable!("deferred request with op {op:?}"),
                };
            }

            let bm = self.cache.slot_mut(bi);
            if !bm.in_use() {
                bm.unlock();
            }
        } else {
            rsp += self.signal_completion(waiters, error);

            // Drop the entry so a retry re-reads the bitmap from disk.
            let bm = self.cache.slot_mut(bi);
            bm.unlock();
            self.cache.evict(bi);
        }

        rsp
    }

    fn finish_bitmap_write(&mut self, blk: u32, error: i32) -> i32 {
        let bi = self.cache.find(blk).expect("bitmap cached");

        debug!("bitmap write finished: blk: {blk}, err: {error}");
        self.stats.returned += 1;

        {
            let bm = self.cache.slot_mut(bi);
            debug_assert!(bm.tx.closed);
            debug_assert!(bm.status.contains(BmFlags::WRITE_PENDING));
            bm.status.remove(BmFlags::WRITE_PENDING);

            if error != 0 {
                // Revert the tentative bits; on-disk state is unchanged.
                let (map, shadow) = (&bm.map, &mut bm.shadow);
                shadow.as_mut_slice().copy_from_slice(map.as_slice());
            } else {
                // Commit: the new bits become visible atomically.
                let (map, shadow) = (&mut bm.map, &bm.shadow);
                map.as_mut_slice().copy_from_slice(shadow.as_slice());
            }
        }

        self.finish_bitmap_transaction(bi, error)
    }

    /// Decodes the parent image path recorded in the locator table.
    /// Returns `None` for non-differencing images.
    pub fn get_parent_id(&mut self) -> Result<Option<PathBuf>> {
        if self.footer.disk_type != DiskType::Diff {
            return Ok(None);
        }

        for loc in self.hdr.loc {
            if loc.code != PLAT_CODE_MACX && loc.code != PLAT_CODE_W2KU {
                continue;
            }

            let size = match DynamicHeader::locator_space(&loc) {
                Ok(size) => size,
                Err(_) => continue,
            };

            let mut raw = AlignedBuf::zeroed(size, VHD_SECTOR_SIZE as usize);
            if self.file.seek(SeekFrom::Start(loc.data_offset)).is_err() {
                continue;
            }
            if self.file.read_exact(raw.as_mut_slice()).is_err() {
                continue;
            }

            let len = (loc.data_len as usize).min(size);
            let name = match loc.code {
                PLAT_CODE_MACX => macx_decode_location(&raw.as_slice()[..len]),
                _ => w2ku_decode_location(&raw.as_slice()[..len]),
            };

            if let Some(path) = name {
                debug!("parent locator: {}", path.display());
                return Ok(Some(path));
            }
        }

        Err(VhdError::BadLocator)
    }

    /// Verifies that `parent` is still the image this child was snapshot
    /// from: its UUID and modification time must match the child's record.
    pub fn validate_parent(&self, parent: &VhdDriver) -> Result<()> {
        let meta = std::fs::metadata(&parent.path).map_err(VhdError::OpenImage)?;
        let mtime = meta.modified().map_err(VhdError::OpenImage)?;

        if self.hdr.prt_ts != vhd_time(mtime) {
            return Err(VhdError::ParentModified);
        }
        if self.hdr.prt_uuid != parent.footer.uuid {
            return Err(VhdError::ParentUuidMismatch);
        }

        Ok(())
    }
}

fn per(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

fn open_image(path: &Path, read_only: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(!read_only).custom_flags(libc::O_DIRECT);

    match opts.open(path) {
        Ok(file) => {
            debug!("opened {} with O_DIRECT", path.display());
            Ok(file)
        }
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            // The filesystem may not support O_DIRECT.
            warn!("accessing image without O_DIRECT ({})", path.display());
            let mut opts = OpenOptions::new();
            opts.read(true).write(!read_only);
            opts.open(path).map_err(VhdError::OpenImage)
        }
        Err(e) => Err(VhdError::OpenImage(e)),
    }
}

/// Locates and parses the footer: at the end of the file, in the legacy
/// 511-byte layout, or falling back to the backup copy at byte 0.
fn read_footer(file: &mut File) -> Result<Footer> {
    let end = file.seek(SeekFrom::End(0)).map_err(VhdError::ReadMetadata)?;
    if end < FOOTER_SIZE as u64 {
        return Err(VhdError::BadCookie);
    }

    let mut buf = AlignedBuf::sectors(1);
    file.seek(SeekFrom::Start(end - FOOTER_SIZE as u64))
        .map_err(VhdError::ReadMetadata)?;
    file.read_exact(buf.as_mut_slice())
        .map_err(VhdError::ReadMetadata)?;

    let mut raw = [0u8; FOOTER_SIZE];
    raw.copy_from_slice(buf.as_slice());
    let primary = Footer::parse(&raw);
    if primary.is_ok() {
        return primary;
    }

    // Pre-Virtual PC 2004 images carry a 511-byte footer.
    let mut shifted = [0u8; FOOTER_SIZE];
    shifted[..FOOTER_SIZE - 1].copy_from_slice(&raw[1..]);
    if let Ok(footer) = Footer::parse(&shifted) {
        return Ok(footer);
    }

    warn!("couldn't find footer at the end of the image, trying the backup copy");
    file.seek(SeekFrom::Start(0)).map_err(VhdError::ReadMetadata)?;
    if file.read_exact(buf.as_mut_slice()).is_ok() {
        raw.copy_from_slice(buf.as_slice());
        if let Ok(footer) = Footer::parse(&raw) {
            return Ok(footer);
        }
    }

    primary
}

fn read_dynamic_header(file: &mut File, offset: u64) -> Result<DynamicHeader> {
    let mut buf = AlignedBuf::sectors(2);
    file.seek(SeekFrom::Start(offset))
        .map_err(VhdError::ReadMetadata)?;
    file.read_exact(buf.as_mut_slice())
        .map_err(VhdError::ReadMetadata)?;

    let mut raw = [0u8; DD_HEADER_SIZE];
    raw.copy_from_slice(buf.as_slice());
    DynamicHeader::parse(&raw)
}

/// Reads the BAT and derives the allocation cursor: one past the furthest
/// allocated block, aligned so block data starts on a page boundary.
fn read_bat(
    file: &mut File,
    hdr: &DynamicHeader,
    spb: u32,
    bm_secs: u32,
    spp: u32,
) -> Result<(Vec<u32>, u64)> {
    let entries = hdr.max_bat_size as usize;
    let bat_secs = secs_round_up(entries as u64 * 4);

    let mut buf = AlignedBuf::sectors(bat_secs as u32);
    file.seek(SeekFrom::Start(hdr.table_offset))
        .map_err(VhdError::ReadMetadata)?;
    file.read_exact(buf.as_mut_slice())
        .map_err(VhdError::ReadMetadata)?;

    let first_db = (hdr.table_offset >> VHD_SECTOR_SHIFT) + bat_secs;
    let mut next_db = first_db;
    let mut bat = Vec::with_capacity(entries);
    let mut used = 0u32;

    for i in 0..entries {
        let entry = BigEndian::read_u32(&buf.as_slice()[i * 4..]);
        if entry != DD_BLK_UNUSED {
            if u64::from(entry) < first_db {
                return Err(VhdError::BadBatEntry {
                    blk: i as u32,
                    entry,
                });
            }
            let block_end = u64::from(entry) + u64::from(spb) + u64::from(bm_secs);
            if block_end > next_db {
                next_db = block_end;
            }
            used += 1;
        }
        bat.push(entry);
    }

    // Block data regions begin on page boundaries.
    let rem = (next_db + u64::from(bm_secs)) % u64::from(spp);
    if rem != 0 {
        next_db += u64::from(spp) - rem;
    }

    info!(
        "read BAT: {used} allocated / {} blocks, next_db: {next_db}",
        entries
    );

    Ok((bat, next_db))
}
