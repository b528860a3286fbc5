// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! On-disk VHD metadata: the 512-byte footer, the 1024-byte dynamic-disk
//! header and the parent locator table. Everything is big-endian except the
//! UTF-16LE text carried by parent locators.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::{secs_round_up, Result, VhdError, VHD_SECTOR_SHIFT};

pub const HD_COOKIE: &[u8; 8] = b"conectix";
pub const DD_COOKIE: &[u8; 8] = b"cxsparse";

pub const HD_FF_VERSION: u32 = 0x0001_0000;
pub const DD_VERSION: u32 = 0x0001_0000;

pub const HD_RESERVED: u32 = 0x0000_0002;

pub const FOOTER_SIZE: usize = 512;
pub const DD_HEADER_SIZE: usize = 1024;

const FOOTER_CHECKSUM_OFF: usize = 64;
const DD_CHECKSUM_OFF: usize = 36;

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 00:00 UTC).
const VHD_EPOCH_OFFSET: u64 = 946_684_800;

/// Parent locator platform codes honored by the open path.
pub const PLAT_CODE_NONE: u32 = 0;
pub const PLAT_CODE_MACX: u32 = 0x4d61_6358; // "MacX": UTF-8 file:// URI
pub const PLAT_CODE_W2KU: u32 = 0x5732_6b75; // "W2ku": UTF-16 absolute path

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Diff,
}

impl DiskType {
    fn from_raw(raw: u32) -> Result<DiskType> {
        match raw {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Diff),
            t => Err(VhdError::UnsupportedDiskType(t)),
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            DiskType::Fixed => 2,
            DiskType::Dynamic => 3,
            DiskType::Diff => 4,
        }
    }
}

/// Ones-complement byte sum with the checksum field itself taken as zero.
fn checksum_over(buf: &[u8], cksum_off: usize) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in buf.iter().enumerate() {
        if i >= cksum_off && i < cksum_off + 4 {
            continue;
        }
        sum = sum.wrapping_add(u32::from(*b));
    }
    !sum
}

/// Number of seconds since the VHD epoch.
pub fn vhd_time(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().saturating_sub(VHD_EPOCH_OFFSET))
        .unwrap_or(0) as u32
}

/// CHS geometry word for a virtual size in bytes, per the VHD specification.
pub fn chs(size: u64) -> u32 {
    let mut secs = secs_round_up(size);

    if secs > 65535 * 16 * 255 {
        secs = 65535 * 16 * 255;
    }

    let mut spt;
    let mut cth;
    let mut heads;

    if secs >= 65535 * 16 * 63 {
        spt = 255;
        cth = secs / spt;
        heads = 16;
    } else {
        spt = 17;
        cth = secs / spt;
        heads = (cth + 1023) / 1024;

        if heads < 4 {
            heads = 4;
        }

        if cth >= heads * 1024 || heads > 16 {
            spt = 31;
            cth = secs / spt;
            heads = 16;
        }

        if cth >= heads * 1024 {
            spt = 63;
            cth = secs / spt;
            heads = 16;
        }
    }

    geom_encode((cth / heads) as u32, heads as u32, spt as u32)
}

fn geom_encode(cylinders: u32, heads: u32, spt: u32) -> u32 {
    (cylinders << 16) | (heads << 8) | spt
}

/// Hard-disk footer, stored at the end of every image and (for sparse
/// images) mirrored at byte 0.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Footer {
    pub features: u32,
    pub ff_version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub crtr_app: [u8; 4],
    pub crtr_ver: u32,
    pub crtr_os: u32,
    pub orig_size: u64,
    pub curr_size: u64,
    pub geometry: u32,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub uuid: Uuid,
    pub saved: u8,
}

impl Footer {
    pub fn parse(buf: &[u8; FOOTER_SIZE]) -> Result<Footer> {
        if &buf[0..8] != HD_COOKIE {
            return Err(VhdError::BadCookie);
        }

        let stored = BigEndian::read_u32(&buf[FOOTER_CHECKSUM_OFF..]);
        let computed = checksum_over(buf, FOOTER_CHECKSUM_OFF);
        if stored != computed {
            return Err(VhdError::BadChecksum { stored, computed });
        }

        let mut crtr_app = [0u8; 4];
        crtr_app.copy_from_slice(&buf[28..32]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[68..84]);

        Ok(Footer {
            features: BigEndian::read_u32(&buf[8..]),
            ff_version: BigEndian::read_u32(&buf[12..]),
            data_offset: BigEndian::read_u64(&buf[16..]),
            timestamp: BigEndian::read_u32(&buf[24..]),
            crtr_app,
            crtr_ver: BigEndian::read_u32(&buf[32..]),
            crtr_os: BigEndian::read_u32(&buf[36..]),
            orig_size: BigEndian::read_u64(&buf[40..]),
            curr_size: BigEndian::read_u64(&buf[48..]),
            geometry: BigEndian::read_u32(&buf[56..]),
            disk_type: DiskType::from_raw(BigEndian::read_u32(&buf[60..]))?,
            checksum: stored,
            uuid: Uuid::from_bytes(uuid),
            saved: buf[84],
        })
    }

    pub fn serialize(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(HD_COOKIE);
        BigEndian::write_u32(&mut buf[8..], self.features);
        BigEndian::write_u32(&mut buf[12..], self.ff_version);
        BigEndian::write_u64(&mut buf[16..], self.data_offset);
        BigEndian::write_u32(&mut buf[24..], self.timestamp);
        buf[28..32].copy_from_slice(&self.crtr_app);
        BigEndian::write_u32(&mut buf[32..], self.crtr_ver);
        BigEndian::write_u32(&mut buf[36..], self.crtr_os);
        BigEndian::write_u64(&mut buf[40..], self.orig_size);
        BigEndian::write_u64(&mut buf[48..], self.curr_size);
        BigEndian::write_u32(&mut buf[56..], self.geometry);
        BigEndian::write_u32(&mut buf[60..], self.disk_type.to_raw());
        BigEndian::write_u32(&mut buf[FOOTER_CHECKSUM_OFF..], self.checksum);
        buf[68..84].copy_from_slice(self.uuid.as_bytes());
        buf[84] = self.saved;
        buf
    }

    /// Recomputes the checksum from the current field values.
    pub fn update_checksum(&mut self) {
        self.checksum = 0;
        let raw = self.serialize();
        self.checksum = checksum_over(&raw, FOOTER_CHECKSUM_OFF);
    }
}

/// One of the eight parent locator slots in the dynamic-disk header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ParentLocator {
    pub code: u32,
    pub data_space: u32,
    pub data_len: u32,
    pub data_offset: u64,
}

/// Dynamic-disk header, present for dynamic and differencing images at the
/// footer's `data_offset`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DynamicHeader {
    pub data_offset: u64,
    pub table_offset: u64,
    pub hdr_ver: u32,
    pub max_bat_size: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub prt_uuid: Uuid,
    pub prt_ts: u32,
    pub prt_name: [u8; 512],
    pub loc: [ParentLocator; 8],
}

impl Default for DynamicHeader {
    fn default() -> Self {
        DynamicHeader {
            data_offset: u64::MAX,
            table_offset: 0,
            hdr_ver: DD_VERSION,
            max_bat_size: 0,
            block_size: 0,
            checksum: 0,
            prt_uuid: Uuid::nil(),
            prt_ts: 0,
            prt_name: [0u8; 512],
            loc: [ParentLocator::default(); 8],
        }
    }
}

impl DynamicHeader {
    pub fn parse(buf: &[u8; DD_HEADER_SIZE]) -> Result<DynamicHeader> {
        if &buf[0..8] != DD_COOKIE {
            return Err(VhdError::BadCookie);
        }

        let stored = BigEndian::read_u32(&buf[DD_CHECKSUM_OFF..]);
        let computed = checksum_over(buf, DD_CHECKSUM_OFF);
        if stored != computed {
            return Err(VhdError::BadChecksum { stored, computed });
        }

        let mut prt_uuid = [0u8; 16];
        prt_uuid.copy_from_slice(&buf[40..56]);
        let mut prt_name = [0u8; 512];
        prt_name.copy_from_slice(&buf[64..576]);

        let mut loc = [ParentLocator::default(); 8];
        for (i, l) in loc.iter_mut().enumerate() {
            let off = 576 + i * 24;
            l.code = BigEndian::read_u32(&buf[off..]);
            l.data_space = BigEndian::read_u32(&buf[off + 4..]);
            l.data_len = BigEndian::read_u32(&buf[off + 8..]);
            l.data_offset = BigEndian::read_u64(&buf[off + 16..]);
        }

        Ok(DynamicHeader {
            data_offset: BigEndian::read_u64(&buf[8..]),
            table_offset: BigEndian::read_u64(&buf[16..]),
            hdr_ver: BigEndian::read_u32(&buf[24..]),
            max_bat_size: BigEndian::read_u32(&buf[28..]),
            block_size: BigEndian::read_u32(&buf[32..]),
            checksum: stored,
            prt_uuid: Uuid::from_bytes(prt_uuid),
            prt_ts: BigEndian::read_u32(&buf[56..]),
            prt_name,
            loc,
        })
    }

    pub fn serialize(&self) -> [u8; DD_HEADER_SIZE] {
        let mut buf = [0u8; DD_HEADER_SIZE];
        buf[0..8].copy_from_slice(DD_COOKIE);
        BigEndian::write_u64(&mut buf[8..], self.data_offset);
        BigEndian::write_u64(&mut buf[16..], self.table_offset);
        BigEndian::write_u32(&mut buf[24..], self.hdr_ver);
        BigEndian::write_u32(&mut buf[28..], self.max_bat_size);
        BigEndian::write_u32(&mut buf[32..], self.block_size);
        BigEndian::write_u32(&mut buf[DD_CHECKSUM_OFF..], self.checksum);
        buf[40..56].copy_from_slice(self.prt_uuid.as_bytes());
        BigEndian::write_u32(&mut buf[56..], self.prt_ts);
        buf[64..576].copy_from_slice(&self.prt_name);
        for (i, l) in self.loc.iter().enumerate() {
            let off = 576 + i * 24;
            BigEndian::write_u32(&mut buf[off..], l.code);
            BigEndian::write_u32(&mut buf[off + 4..], l.data_space);
            BigEndian::write_u32(&mut buf[off + 8..], l.data_len);
            BigEndian::write_u64(&mut buf[off + 16..], l.data_offset);
        }
        buf
    }

    pub fn update_checksum(&mut self) {
        self.checksum = 0;
        let raw = self.serialize();
        self.checksum = checksum_over(&raw, DD_CHECKSUM_OFF);
    }

    /// Encodes a parent file name into the fixed UTF-16LE name field.
    pub fn set_parent_name(&mut self, name: &str) -> Result<()> {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() * 2 > self.prt_name.len() {
            return Err(VhdError::BadParentPath);
        }
        self.prt_name = [0u8; 512];
        for (i, u) in units.iter().enumerate() {
            LittleEndian::write_u16(&mut self.prt_name[i * 2..], *u);
        }
        Ok(())
    }

    /// Decodes the UTF-16LE parent name field, stopping at the first NUL.
    pub fn parent_name(&self) -> Option<String> {
        let units: Vec<u16> = self
            .prt_name
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .take_while(|&u| u != 0)
            .collect();
        if units.is_empty() {
            return None;
        }
        String::from_utf16(&units).ok()
    }

    /// Byte length of a locator's on-disk allocation. The field should hold
    /// sectors but some creators store bytes; accept both.
    pub fn locator_space(loc: &ParentLocator) -> Result<usize> {
        let space = loc.data_space as u64;
        if space < crate::VHD_SECTOR_SIZE {
            Ok((space << VHD_SECTOR_SHIFT) as usize)
        } else if space % crate::VHD_SECTOR_SIZE == 0 {
            Ok(space as usize)
        } else {
            Err(VhdError::BadLocator)
        }
    }
}

/// Decodes a MACX locator: a UTF-8 `file://` URI.
pub fn macx_decode_location(raw: &[u8]) -> Option<PathBuf> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let uri = std::str::from_utf8(&raw[..end]).ok()?;
    let path = uri.strip_prefix("file://")?;
    if path.is_empty() {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Decodes a W2KU locator: a UTF-16LE Windows path. Backslashes map to
/// forward slashes and a leading drive letter is dropped.
pub fn w2ku_decode_location(raw: &[u8]) -> Option<PathBuf> {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|&u| u != 0)
        .collect();
    let text = String::from_utf16(&units).ok()?;
    let mut path = text.replace('\\', "/");
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        path = path.split_off(2);
    }
    if path.is_empty() {
        return None;
    }
    Some(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_footer() -> Footer {
        let mut ftr = Footer {
            features: HD_RESERVED,
            ff_version: HD_FF_VERSION,
            data_offset: 512,
            timestamp: 0x0123_4567,
            crtr_app: *b"tap\0",
            crtr_ver: 0x0000_0001,
            crtr_os: 0,
            orig_size: 8 << 20,
            curr_size: 8 << 20,
            geometry: chs(8 << 20),
            disk_type: DiskType::Dynamic,
            checksum: 0,
            uuid: Uuid::new_v4(),
            saved: 0,
        };
        ftr.update_checksum();
        ftr
    }

    #[test]
    fn footer_round_trip() {
        let ftr = sample_footer();
        let raw = ftr.serialize();
        let parsed = Footer::parse(&raw).unwrap();
        assert_eq!(parsed, ftr);
        assert_eq!(parsed.serialize(), raw);
    }

    #[test]
    fn footer_checksum_bit_flip_detected() {
        let ftr = sample_footer();
        let raw = ftr.serialize();
        for bit in 0..32 {
            let mut corrupt = raw;
            corrupt[64 + bit / 8] ^= 1 << (bit % 8);
            assert!(matches!(
                Footer::parse(&corrupt),
                Err(VhdError::BadChecksum { .. })
            ));
        }
    }

    #[test]
    fn footer_payload_corruption_detected() {
        let ftr = sample_footer();
        let mut raw = ftr.serialize();
        raw[48] ^= 0x01; // current size
        assert!(matches!(
            Footer::parse(&raw),
            Err(VhdError::BadChecksum { .. })
        ));
    }

    #[test]
    fn footer_bad_cookie_rejected() {
        let ftr = sample_footer();
        let mut raw = ftr.serialize();
        raw[0] = b'x';
        assert!(matches!(Footer::parse(&raw), Err(VhdError::BadCookie)));
    }

    #[test]
    fn dynamic_header_round_trip() {
        let mut hdr = DynamicHeader {
            table_offset: 3 << VHD_SECTOR_SHIFT,
            max_bat_size: 4,
            block_size: 2 << 20,
            prt_uuid: Uuid::new_v4(),
            prt_ts: 42,
            ..Default::default()
        };
        hdr.set_parent_name("base.vhd").unwrap();
        hdr.loc[0] = ParentLocator {
            code: PLAT_CODE_MACX,
            data_space: 1,
            data_len: 19,
            data_offset: 1536,
        };
        hdr.update_checksum();

        let raw = hdr.serialize();
        let parsed = DynamicHeader::parse(&raw).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(parsed.serialize(), raw);
        assert_eq!(parsed.parent_name().as_deref(), Some("base.vhd"));
    }

    #[test]
    fn dynamic_header_checksum_flip_detected() {
        let mut hdr = DynamicHeader {
            table_offset: 1536,
            max_bat_size: 1,
            block_size: 2 << 20,
            ..Default::default()
        };
        hdr.update_checksum();
        let mut raw = hdr.serialize();
        raw[36] ^= 0x80;
        assert!(matches!(
            DynamicHeader::parse(&raw),
            Err(VhdError::BadChecksum { .. })
        ));
    }

    #[test]
    fn vhd_epoch() {
        let epoch = UNIX_EPOCH + Duration::from_secs(946_684_800);
        assert_eq!(vhd_time(epoch), 0);
        assert_eq!(vhd_time(epoch + Duration::from_secs(3600)), 3600);
    }

    #[test]
    fn chs_small_disk() {
        // 2 MiB: 4096 sectors, 17 spt, 4 heads, 60 cylinders.
        assert_eq!(chs(2 << 20), geom_encode(60, 4, 17));
    }

    #[test]
    fn macx_locator_decode() {
        let uri = b"file:///images/base.vhd\0\0";
        assert_eq!(
            macx_decode_location(uri).unwrap(),
            PathBuf::from("/images/base.vhd")
        );
        assert!(macx_decode_location(b"http://nope").is_none());
    }

    #[test]
    fn w2ku_locator_decode() {
        let text: Vec<u16> = "C:\\images\\base.vhd".encode_utf16().collect();
        let mut raw = Vec::new();
        for u in text {
            raw.extend_from_slice(&u.to_le_bytes());
        }
        assert_eq!(
            w2ku_decode_location(&raw).unwrap(),
            PathBuf::from("/images/base.vhd")
        );
    }

    #[test]
    fn locator_space_units() {
        let mut loc = ParentLocator {
            data_space: 1,
            ..Default::default()
        };
        assert_eq!(DynamicHeader::locator_space(&loc).unwrap(), 512);
        loc.data_space = 1024;
        assert_eq!(DynamicHeader::locator_space(&loc).unwrap(), 1024);
        loc.data_space = 513;
        assert!(DynamicHeader::locator_space(&loc).is_err());
    }
}
