// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Bounded cache of per-block allocation bitmaps.
//!
//! Each entry carries a `map`/`shadow` pair: `map` is the committed on-disk
//! state and is only mutated by the bitmap-write finisher; in-flight writes
//! set bits in `shadow`, which is promoted to `map` when the bitmap write
//! succeeds or reverted from `map` when it fails. The embedded transaction
//! gates the completion of the data writes grouped under this bitmap.

use bitflags::bitflags;

use crate::request::VhdTransaction;
use crate::{AlignedBuf, VHD_SECTOR_SHIFT};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BmFlags: u8 {
        const READ_PENDING = 1;
        const WRITE_PENDING = 1 << 1;
        const LOCKED = 1 << 2;
    }
}

// VHD bitmaps are MSB-first within each byte: byte 0 bit 7 covers the
// block's first sector.

pub fn test_bit(map: &[u8], sec: u32) -> bool {
    map[(sec >> 3) as usize] & (0x80 >> (sec & 7)) != 0
}

pub fn set_bit(map: &mut [u8], sec: u32) {
    map[(sec >> 3) as usize] |= 0x80 >> (sec & 7);
}

pub fn clear_bit(map: &mut [u8], sec: u32) {
    map[(sec >> 3) as usize] &= !(0x80 >> (sec & 7));
}

pub struct VhdBitmap {
    pub blk: u32,
    pub seqno: u64,
    pub status: BmFlags,
    pub installed: bool,
    /// Committed bitmap; mutated only when a bitmap write completes.
    pub map: AlignedBuf,
    /// Tentative bitmap carrying not-yet-durable bits.
    pub shadow: AlignedBuf,
    pub tx: VhdTransaction,
    /// Data writes deferred past the currently closed transaction.
    pub queue: Vec<usize>,
    /// Requests that cannot be classified until the bitmap read finishes.
    pub waiting: Vec<usize>,
}

impl VhdBitmap {
    fn new(map_bytes: usize) -> VhdBitmap {
        VhdBitmap {
            blk: 0,
            seqno: 0,
            status: BmFlags::empty(),
            installed: false,
            map: AlignedBuf::zeroed(map_bytes, 512),
            shadow: AlignedBuf::zeroed(map_bytes, 512),
            tx: VhdTransaction::default(),
            queue: Vec::new(),
            waiting: Vec::new(),
        }
    }

    pub fn locked(&self) -> bool {
        self.status.contains(BmFlags::LOCKED)
    }

    pub fn lock(&mut self) {
        self.status.insert(BmFlags::LOCKED);
    }

    pub fn unlock(&mut self) {
        self.status.remove(BmFlags::LOCKED);
    }

    /// A bitmap is valid once its on-disk contents have arrived.
    pub fn valid(&self) -> bool {
        !self.status.contains(BmFlags::READ_PENDING)
    }

    /// True while outstanding work still references this entry; such an
    /// entry must not be evicted or reused.
    pub fn in_use(&self) -> bool {
        self.status.contains(BmFlags::READ_PENDING)
            || self.status.contains(BmFlags::WRITE_PENDING)
            || self.tx.is_live()
            || !self.tx.requests.is_empty()
            || !self.waiting.is_empty()
            || !self.queue.is_empty()
    }

    /// Returns the entry to its pristine, fully zeroed state. A zeroed map
    /// guarantees that if the block's BAT allocation later fails with the
    /// entry still installed, no sector is falsely reported present.
    fn reset(&mut self, blk: u32) {
        self.blk = blk;
        self.seqno = 0;
        self.status = BmFlags::empty();
        self.map.zero();
        self.shadow.zero();
        self.tx.reset();
        self.queue.clear();
        self.waiting.clear();
    }
}

/// Fixed-capacity associative set of bitmaps with LRU replacement. Lookup
/// is a linear scan: capacity is small and the constant-time bound matters
/// more than asymptotics.
pub struct BitmapCache {
    slots: Vec<VhdBitmap>,
    lru: u64,
}

// Halve all sequence numbers when the counter reaches this span.
const LRU_SEQNO_SPAN: u64 = 0xffff_ffff;

impl BitmapCache {
    pub fn new(capacity: usize, bm_secs: u32) -> BitmapCache {
        let map_bytes = (bm_secs as usize) << VHD_SECTOR_SHIFT;
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || VhdBitmap::new(map_bytes));
        BitmapCache { slots, lru: 0 }
    }

    pub fn find(&self, blk: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|bm| bm.installed && bm.blk == blk)
    }

    pub fn slot(&self, bi: usize) -> &VhdBitmap {
        &self.slots[bi]
    }

    pub fn slot_mut(&mut self, bi: usize) -> &mut VhdBitmap {
        &mut self.slots[bi]
    }

    fn next_seqno(&mut self) -> u64 {
        if self.lru == LRU_SEQNO_SPAN {
            self.lru = 0;
            for bm in &mut self.slots {
                if bm.installed {
                    bm.seqno >>= 1;
                    if bm.seqno > self.lru {
                        self.lru = bm.seqno;
                    }
                }
            }
        }
        self.lru += 1;
        self.lru
    }

    pub fn touch(&mut self, bi: usize) {
        let seqno = self.next_seqno();
        self.slots[bi].seqno = seqno;
    }

    /// Installs a fresh, zeroed entry for `blk`, evicting the least
    /// recently touched idle entry if necessary. `None` means every entry
    /// is pinned by outstanding work; the caller surfaces busy.
    pub fn alloc(&mut self, blk: u32) -> Option<usize> {
        let bi = match self.slots.iter().position(|bm| !bm.installed) {
            Some(bi) => bi,
            None => self.evict_lru()?,
        };
        self.slots[bi].reset(blk);
        self.slots[bi].installed = true;
        self.touch(bi);
        Some(bi)
    }

    fn evict_lru(&mut self) -> Option<usize> {
        let mut lru: Option<usize> = None;
        for (i, bm) in self.slots.iter().enumerate() {
            if !bm.installed || bm.locked() || bm.in_use() {
                continue;
            }
            if lru.map_or(true, |l| bm.seqno < self.slots[l].seqno) {
                lru = Some(i);
            }
        }
        let bi = lru?;
        self.slots[bi].installed = false;
        Some(bi)
    }

    /// Drops an installed entry outright (failed bitmap read).
    pub fn evict(&mut self, bi: usize) {
        debug_assert!(!self.slots[bi].locked());
        debug_assert!(!self.slots[bi].in_use());
        self.slots[bi].installed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_order_is_msb_first() {
        let mut map = [0u8; 2];
        set_bit(&mut map, 0);
        assert_eq!(map[0], 0x80);
        set_bit(&mut map, 7);
        assert_eq!(map[0], 0x81);
        set_bit(&mut map, 8);
        assert_eq!(map[1], 0x80);

        assert!(test_bit(&map, 0));
        assert!(!test_bit(&map, 1));
        assert!(test_bit(&map, 7));
        assert!(test_bit(&map, 8));

        clear_bit(&mut map, 0);
        assert!(!test_bit(&map, 0));
        assert_eq!(map[0], 0x01);
    }

    #[test]
    fn lookup_and_touch() {
        let mut cache = BitmapCache::new(4, 1);
        assert!(cache.find(7).is_none());
        let bi = cache.alloc(7).unwrap();
        assert_eq!(cache.find(7), Some(bi));
        let before = cache.slot(bi).seqno;
        cache.touch(bi);
        assert!(cache.slot(bi).seqno > before);
    }

    #[test]
    fn evicts_least_recently_touched() {
        let mut cache = BitmapCache::new(2, 1);
        let a = cache.alloc(1).unwrap();
        let b = cache.alloc(2).unwrap();
        cache.touch(a); // block 2 is now the LRU

        let c = cache.alloc(3).unwrap();
        assert_eq!(c, b);
        assert!(cache.find(2).is_none());
        assert!(cache.find(1).is_some());
        assert!(cache.find(3).is_some());
    }

    #[test]
    fn locked_entries_never_evicted() {
        let mut cache = BitmapCache::new(2, 1);
        let a = cache.alloc(1).unwrap();
        let b = cache.alloc(2).unwrap();
        cache.slot_mut(a).lock();
        cache.touch(b); // block 1 has the lower seqno but is locked

        let c = cache.alloc(3).unwrap();
        assert_eq!(c, b);
        assert!(cache.find(1).is_some());
    }

    #[test]
    fn full_cache_of_pinned_entries_is_busy() {
        let mut cache = BitmapCache::new(2, 1);
        for blk in 0..2 {
            let bi = cache.alloc(blk).unwrap();
            cache.slot_mut(bi).lock();
        }
        assert!(cache.alloc(9).is_none());
    }

    #[test]
    fn in_use_entries_never_evicted() {
        let mut cache = BitmapCache::new(1, 1);
        let a = cache.alloc(1).unwrap();
        cache.slot_mut(a).queue.push(0);
        assert!(cache.alloc(2).is_none());
        cache.slot_mut(a).queue.clear();
        assert!(cache.alloc(2).is_some());
    }

    #[test]
    fn seqno_compaction_preserves_order() {
        let mut cache = BitmapCache::new(2, 1);
        let a = cache.alloc(1).unwrap();
        let b = cache.alloc(2).unwrap();
        cache.lru = LRU_SEQNO_SPAN;
        cache.touch(a);
        // Halving compacted both entries; ordering must survive.
        assert!(cache.slot(a).seqno > cache.slot(b).seqno);
        assert!(cache.slot(a).seqno <= LRU_SEQNO_SPAN);
    }

    #[test]
    fn fresh_entry_is_zeroed() {
        let mut cache = BitmapCache::new(1, 1);
        let a = cache.alloc(1).unwrap();
        set_bit(cache.slot_mut(a).map.as_mut_slice(), 0);
        set_bit(cache.slot_mut(a).shadow.as_mut_slice(), 0);
        cache.evict(a);
        let a = cache.alloc(2).unwrap();
        assert!(!test_bit(cache.slot(a).map.as_slice(), 0));
        assert!(!test_bit(cache.slot(a).shadow.as_slice(), 0));
    }
}
