// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Image creation and snapshot provisioning.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::SystemTime;

use log::{debug, info};
use uuid::Uuid;

use crate::driver::{OpenFlags, VhdDriver};
use crate::header::{
    chs, vhd_time, DiskType, DynamicHeader, Footer, ParentLocator, DD_VERSION, HD_FF_VERSION,
    HD_RESERVED, PLAT_CODE_MACX,
};
use crate::{secs_round_up, Result, VhdError, DD_BLK_UNUSED, VHD_SECTOR_SHIFT, VHD_SECTOR_SIZE};

const BLK_SHIFT: u32 = 21; // 2 MiB blocks
const DEFAULT_BLOCK_SIZE: u32 = 1 << BLK_SHIFT;

/// Creates a new image at `path`. A sparse image with a backing file
/// becomes a differencing image inheriting the parent's size.
pub fn create<P: AsRef<Path>>(
    path: P,
    total_size: u64,
    sparse: bool,
    backing: Option<&Path>,
) -> Result<()> {
    let path = path.as_ref();

    let mut blks = total_size.div_ceil(1 << BLK_SHIFT);
    let size = blks << BLK_SHIFT;
    let disk_type = if sparse {
        if backing.is_some() {
            DiskType::Diff
        } else {
            DiskType::Dynamic
        }
    } else {
        DiskType::Fixed
    };

    info!(
        "vhd_create: {}: size: {size}, type: {disk_type:?}",
        path.display()
    );

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(VhdError::OpenImage)?;

    let mut ftr = Footer {
        features: HD_RESERVED,
        ff_version: HD_FF_VERSION,
        data_offset: if sparse { VHD_SECTOR_SIZE } else { u64::MAX },
        timestamp: vhd_time(SystemTime::now()),
        crtr_app: *b"tap\0",
        crtr_ver: 0x0000_0001,
        crtr_os: 0,
        orig_size: size,
        curr_size: size,
        geometry: chs(size),
        disk_type,
        checksum: 0,
        uuid: Uuid::new_v4(),
        saved: 0,
    };

    if sparse {
        let mut hdr = DynamicHeader {
            data_offset: u64::MAX,
            table_offset: 3 * VHD_SECTOR_SIZE, // footer copy + two-sector header
            hdr_ver: DD_VERSION,
            max_bat_size: blks as u32,
            block_size: DEFAULT_BLOCK_SIZE,
            ..Default::default()
        };

        if let Some(backing) = backing {
            let parent = VhdDriver::open(backing, OpenFlags::RDONLY | OpenFlags::NO_CACHE)?;
            let parent_size = parent.footer().curr_size;

            blks = parent_size.div_ceil(1 << BLK_SHIFT);
            ftr.orig_size = parent_size;
            ftr.curr_size = parent_size;
            ftr.geometry = chs(parent_size);
            hdr.max_bat_size = blks as u32;

            set_parent(&mut file, &mut hdr, backing, &parent)?;
        }

        ftr.update_checksum();
        hdr.update_checksum();

        // Backup footer at byte 0, then the dynamic-disk header.
        file.seek(SeekFrom::Start(0)).map_err(VhdError::WriteMetadata)?;
        file.write_all(&ftr.serialize())
            .map_err(VhdError::WriteMetadata)?;
        file.seek(SeekFrom::Start(ftr.data_offset))
            .map_err(VhdError::WriteMetadata)?;
        file.write_all(&hdr.serialize())
            .map_err(VhdError::WriteMetadata)?;

        // All-unused BAT, padded to a sector boundary.
        let bat_secs = secs_round_up(blks * 4);
        let mut bat = vec![0u8; (bat_secs << VHD_SECTOR_SHIFT) as usize];
        for i in 0..blks as usize {
            bat[i * 4..i * 4 + 4].copy_from_slice(&DD_BLK_UNUSED.to_be_bytes());
        }
        file.seek(SeekFrom::Start(hdr.table_offset))
            .map_err(VhdError::WriteMetadata)?;
        file.write_all(&bat).map_err(VhdError::WriteMetadata)?;
    } else {
        ftr.update_checksum();

        // Preallocate the full data region.
        let zeros = [0u8; 4096];
        let mut left = size;
        while left > 0 {
            let n = left.min(zeros.len() as u64) as usize;
            file.write_all(&zeros[..n]).map_err(VhdError::WriteMetadata)?;
            left -= n as u64;
        }
    }

    // The live footer lands after the metadata (or data) prefix.
    file.write_all(&ftr.serialize())
        .map_err(VhdError::WriteMetadata)?;

    debug!("vhd_create: {}: done", path.display());
    Ok(())
}

/// Creates a sparse differencing image at `child` backed by `parent`.
pub fn snapshot<P: AsRef<Path>, Q: AsRef<Path>>(parent: P, child: Q) -> Result<()> {
    create(child, 0, true, Some(parent.as_ref()))
}

/// Records the parent's identity in the header and writes an absolute
/// `file://` locator between the header and the BAT, pushing the table
/// back by the locator's allocation.
fn set_parent(
    file: &mut std::fs::File,
    hdr: &mut DynamicHeader,
    parent_path: &Path,
    parent: &VhdDriver,
) -> Result<()> {
    let absolute = std::fs::canonicalize(parent_path).map_err(|_| VhdError::BadParentPath)?;
    let name = absolute
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(VhdError::BadParentPath)?;

    let meta = std::fs::metadata(&absolute).map_err(VhdError::OpenImage)?;
    hdr.prt_ts = vhd_time(meta.modified().map_err(VhdError::OpenImage)?);
    hdr.prt_uuid = parent.footer().uuid;
    hdr.set_parent_name(name)?;

    let uri = format!("file://{}", absolute.display());
    let bytes = uri.as_bytes();
    let data_space = secs_round_up(bytes.len() as u64) as u32;
    let data_offset = hdr.table_offset;

    hdr.loc[0] = ParentLocator {
        code: PLAT_CODE_MACX,
        data_space,
        data_len: bytes.len() as u32,
        data_offset,
    };
    hdr.table_offset += u64::from(data_space) << VHD_SECTOR_SHIFT;

    file.seek(SeekFrom::Start(data_offset))
        .map_err(VhdError::WriteMetadata)?;
    file.write_all(bytes).map_err(VhdError::WriteMetadata)?;

    debug!(
        "set_parent: {} at locator offset {data_offset}",
        absolute.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FOOTER_SIZE;
    use std::io::Read;
    use vmm_sys_util::tempfile::TempFile;

    fn read_exact_at(file: &mut std::fs::File, offset: u64, buf: &mut [u8]) {
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(buf).unwrap();
    }

    #[test]
    fn dynamic_image_layout() {
        let img = TempFile::new().unwrap();
        create(img.as_path(), 8 << 20, true, None).unwrap();

        let mut file = std::fs::File::open(img.as_path()).unwrap();

        // Backup footer at byte 0.
        let mut raw = [0u8; FOOTER_SIZE];
        read_exact_at(&mut file, 0, &mut raw);
        let ftr = Footer::parse(&raw).unwrap();
        assert_eq!(ftr.disk_type, DiskType::Dynamic);
        assert_eq!(ftr.curr_size, 8 << 20);
        assert_eq!(ftr.data_offset, VHD_SECTOR_SIZE);

        // Header at data_offset.
        let mut raw = [0u8; crate::header::DD_HEADER_SIZE];
        read_exact_at(&mut file, ftr.data_offset, &mut raw);
        let hdr = DynamicHeader::parse(&raw).unwrap();
        assert_eq!(hdr.max_bat_size, 4);
        assert_eq!(hdr.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(hdr.table_offset, 3 * VHD_SECTOR_SIZE);

        // Every BAT entry unused.
        let mut bat = [0u8; 16];
        read_exact_at(&mut file, hdr.table_offset, &mut bat);
        for entry in bat.chunks_exact(4) {
            assert_eq!(u32::from_be_bytes(entry.try_into().unwrap()), DD_BLK_UNUSED);
        }

        // Live footer right after the (one-sector) BAT.
        let mut raw = [0u8; FOOTER_SIZE];
        read_exact_at(&mut file, hdr.table_offset + VHD_SECTOR_SIZE, &mut raw);
        let tail = Footer::parse(&raw).unwrap();
        assert_eq!(tail, ftr);
    }

    #[test]
    fn fixed_image_layout() {
        let img = TempFile::new().unwrap();
        create(img.as_path(), 2 << 20, false, None).unwrap();

        let mut file = std::fs::File::open(img.as_path()).unwrap();
        let len = file.metadata().unwrap().len();
        assert_eq!(len, (2 << 20) + FOOTER_SIZE as u64);

        let mut raw = [0u8; FOOTER_SIZE];
        read_exact_at(&mut file, 2 << 20, &mut raw);
        let ftr = Footer::parse(&raw).unwrap();
        assert_eq!(ftr.disk_type, DiskType::Fixed);
        assert_eq!(ftr.data_offset, u64::MAX);

        // Data region starts zeroed.
        let mut first = [0xffu8; 512];
        read_exact_at(&mut file, 0, &mut first);
        assert!(first.iter().all(|&b| b == 0));
    }

    #[test]
    fn size_rounds_up_to_block_multiple() {
        let img = TempFile::new().unwrap();
        create(img.as_path(), (2 << 20) + 1, true, None).unwrap();

        let mut file = std::fs::File::open(img.as_path()).unwrap();
        let mut raw = [0u8; FOOTER_SIZE];
        read_exact_at(&mut file, 0, &mut raw);
        let ftr = Footer::parse(&raw).unwrap();
        assert_eq!(ftr.curr_size, 4 << 20);
    }
}
