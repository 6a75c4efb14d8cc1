//! Storage attributes and the ECC × layout policy.
//!
//! A driver registers a [`StorageAttr`] at mount time: immutable chip
//! geometry plus three layout tables describing where the data ECC, the
//! spare ECC, and the tag bytes live inside the spare region. The policy
//! functions here decide which driver operations are mandatory for a
//! given ECC/layout combination and reject broken configurations before
//! the first I/O.

use crate::ecc;
use crate::ops::OpsCaps;
use crate::tag::TAG_BYTES;
use nandfs_error::{FlashError, Result};
use nandfs_types::ParseError;

/// Who computes and applies ECC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccMode {
    /// No protection; scratch and test media only.
    None,
    /// The filesystem computes and verifies ECC in software.
    Soft,
    /// The driver (or its hardware) computes ECC; the filesystem stores
    /// it in spare and hands it back for correction on read.
    Hw,
    /// The driver computes, corrects, and persists ECC transparently;
    /// ECC bytes never transit the filesystem.
    HwAuto,
}

/// Who owns the physical byte packing of the spare region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    /// The filesystem owns spare offsets, per the layout tables; requires
    /// the raw `read_page_spare`/`write_page_spare` pair.
    Fs,
    /// The driver owns the packing and exposes only the logical tag/ECC
    /// view; requires the `*_spare_layout` pair.
    Flash,
}

/// Wire encoding terminator for layout tables: offset 0xFF, size 0.
const LAYOUT_SENTINEL: [u8; 2] = [0xFF, 0];

/// A spare-region layout table: ordered `(offset, size)` runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    entries: Vec<(u8, u8)>,
}

impl Layout {
    /// Build from explicit runs, rejecting zero-sized entries.
    pub fn new(entries: Vec<(u8, u8)>) -> std::result::Result<Self, ParseError> {
        if entries.iter().any(|&(_, size)| size == 0) {
            return Err(ParseError::InvalidField {
                field: "layout",
                reason: "zero-sized run",
            });
        }
        Ok(Self { entries })
    }

    /// Decode the sentinel-terminated wire form `[ofs, size, ..., 0xFF, 0]`.
    pub fn parse(raw: &[u8]) -> std::result::Result<Self, ParseError> {
        let mut entries = Vec::new();
        let mut iter = raw.chunks_exact(2);
        for pair in &mut iter {
            if pair == LAYOUT_SENTINEL {
                return Self::new(entries);
            }
            entries.push((pair[0], pair[1]));
        }
        Err(ParseError::MissingSentinel)
    }

    /// Encode to the sentinel-terminated wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 2 + 2);
        for &(ofs, size) in &self.entries {
            out.push(ofs);
            out.push(size);
        }
        out.extend_from_slice(&LAYOUT_SENTINEL);
        out
    }

    #[must_use]
    pub fn entries(&self) -> &[(u8, u8)] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes the table addresses.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.entries
            .iter()
            .map(|&(_, size)| usize::from(size))
            .sum()
    }

    /// Scatter `src` bytes into their spare offsets. `src` must cover
    /// [`Self::total_len`] bytes and every run must fit in `spare`.
    pub fn pack_into(&self, src: &[u8], spare: &mut [u8]) -> std::result::Result<(), ParseError> {
        if src.len() < self.total_len() {
            return Err(ParseError::InsufficientData {
                needed: self.total_len(),
                actual: src.len(),
            });
        }
        let mut taken = 0_usize;
        for &(ofs, size) in &self.entries {
            let (ofs, size) = (usize::from(ofs), usize::from(size));
            let end = ofs + size;
            if end > spare.len() {
                return Err(ParseError::InvalidField {
                    field: "layout",
                    reason: "run exceeds spare size",
                });
            }
            spare[ofs..end].copy_from_slice(&src[taken..taken + size]);
            taken += size;
        }
        Ok(())
    }

    /// Gather bytes from their spare offsets into `dst`.
    pub fn unpack_from(&self, spare: &[u8], dst: &mut [u8]) -> std::result::Result<(), ParseError> {
        if dst.len() < self.total_len() {
            return Err(ParseError::InsufficientData {
                needed: self.total_len(),
                actual: dst.len(),
            });
        }
        let mut filled = 0_usize;
        for &(ofs, size) in &self.entries {
            let (ofs, size) = (usize::from(ofs), usize::from(size));
            let end = ofs + size;
            if end > spare.len() {
                return Err(ParseError::InvalidField {
                    field: "layout",
                    reason: "run exceeds spare size",
                });
            }
            dst[filled..filled + size].copy_from_slice(&spare[ofs..end]);
            filled += size;
        }
        Ok(())
    }

    fn covers(&self, byte: usize) -> bool {
        self.entries.iter().any(|&(ofs, size)| {
            (usize::from(ofs)..usize::from(ofs) + usize::from(size)).contains(&byte)
        })
    }
}

/// Immutable-after-mount description of the physical chip.
///
/// Owned by the driver registration code; the device holds it behind an
/// `Arc` and never mutates it.
#[derive(Debug, Clone)]
pub struct StorageAttr {
    /// Total blocks in the chip (the partition is a sub-range of these).
    pub total_blocks: u32,
    /// Page data region size in bytes, e.g. 512 or 2048.
    pub page_data_size: u32,
    /// Spare region size in bytes, e.g. 16 or 64.
    pub spare_size: u32,
    pub pages_per_block: u32,
    /// Offset of the block-status byte within spare. Any value other
    /// than the erased byte there marks the block bad.
    pub block_status_offs: u32,
    pub ecc_mode: EccMode,
    pub layout_mode: LayoutMode,
    /// Where the page-data ECC lives in spare (layout mode `Fs`).
    pub ecc_layout: Layout,
    /// Where the spare-data ECC lives in spare, when carried separately.
    pub s_ecc_layout: Layout,
    /// Where the packed tag bytes live in spare (layout mode `Fs`).
    pub data_layout: Layout,
}

impl StorageAttr {
    /// ECC bytes the filesystem stores per page. Zero when ECC is off or
    /// fully hidden inside the driver.
    #[must_use]
    pub fn ecc_size(&self) -> usize {
        match self.ecc_mode {
            EccMode::Soft | EccMode::Hw => ecc::ecc_size(self.page_data_size as usize),
            EccMode::None | EccMode::HwAuto => 0,
        }
    }

    /// Validate geometry and layout tables. Called once at mount;
    /// violations are configuration errors, not I/O errors.
    pub fn validate(&self) -> Result<()> {
        if self.total_blocks == 0 || self.pages_per_block == 0 {
            return Err(FlashError::Config("zero blocks or pages per block".into()));
        }
        if self.page_data_size == 0 || self.spare_size == 0 {
            return Err(FlashError::Config("zero page or spare size".into()));
        }
        if self.block_status_offs >= self.spare_size {
            return Err(FlashError::Config(format!(
                "block_status_offs {} outside spare of {} bytes",
                self.block_status_offs, self.spare_size
            )));
        }
        if self.ecc_mode == EccMode::Soft && self.page_data_size % ecc::ECC_CHUNK as u32 != 0 {
            return Err(FlashError::Config(format!(
                "soft ECC requires page_data_size in {}-byte chunks, got {}",
                ecc::ECC_CHUNK,
                self.page_data_size
            )));
        }
        if self.ecc_mode == EccMode::HwAuto && self.layout_mode != LayoutMode::Flash {
            return Err(FlashError::Config(
                "hardware-auto ECC requires driver-managed spare layout".into(),
            ));
        }

        if self.layout_mode == LayoutMode::Fs {
            self.validate_fs_layout()?;
        }
        Ok(())
    }

    fn validate_fs_layout(&self) -> Result<()> {
        if self.data_layout.total_len() != TAG_BYTES {
            return Err(FlashError::Config(format!(
                "data layout covers {} bytes, tag needs {TAG_BYTES}",
                self.data_layout.total_len()
            )));
        }
        if self.ecc_layout.total_len() != self.ecc_size() {
            return Err(FlashError::Config(format!(
                "ECC layout covers {} bytes, mode needs {}",
                self.ecc_layout.total_len(),
                self.ecc_size()
            )));
        }
        if !self.s_ecc_layout.is_empty() && self.s_ecc_layout.total_len() != ecc::ecc_size(TAG_BYTES)
        {
            return Err(FlashError::Config(format!(
                "spare ECC layout covers {} bytes, tag ECC needs {}",
                self.s_ecc_layout.total_len(),
                ecc::ecc_size(TAG_BYTES)
            )));
        }

        let spare = self.spare_size as usize;
        let status = self.block_status_offs as usize;
        let mut claimed = vec![false; spare];
        for table in [&self.ecc_layout, &self.s_ecc_layout, &self.data_layout] {
            for &(ofs, size) in table.entries() {
                for byte in usize::from(ofs)..usize::from(ofs) + usize::from(size) {
                    if byte >= spare {
                        return Err(FlashError::Config(format!(
                            "layout run exceeds spare size {spare}"
                        )));
                    }
                    if byte == status {
                        return Err(FlashError::Config(
                            "layout run overlaps block-status byte".into(),
                        ));
                    }
                    if claimed[byte] {
                        return Err(FlashError::Config(format!(
                            "layout tables overlap at spare byte {byte}"
                        )));
                    }
                    claimed[byte] = true;
                }
            }
        }
        Ok(())
    }

    /// Check that the driver provides every operation the ECC/layout
    /// policy makes mandatory. Fail fast at mount, never at first I/O.
    pub fn check_ops(&self, caps: OpsCaps) -> Result<()> {
        match self.layout_mode {
            LayoutMode::Fs if !caps.spare_raw => Err(FlashError::Config(
                "filesystem-managed layout requires raw spare read/write".into(),
            )),
            LayoutMode::Flash if !caps.spare_layout => Err(FlashError::Config(
                "driver-managed layout requires spare-layout read/write".into(),
            )),
            _ => Ok(()),
        }
    }

    /// True when the status byte in `spare` says the block is good.
    #[must_use]
    pub fn status_byte_good(&self, spare: &[u8]) -> bool {
        spare
            .get(self.block_status_offs as usize)
            .is_some_and(|&b| b == nandfs_types::ERASED_BYTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soft_attr() -> StorageAttr {
        StorageAttr {
            total_blocks: 64,
            page_data_size: 512,
            spare_size: 16,
            pages_per_block: 32,
            block_status_offs: 5,
            ecc_mode: EccMode::Soft,
            layout_mode: LayoutMode::Fs,
            ecc_layout: Layout::new(vec![(10, 6)]).expect("layout"),
            s_ecc_layout: Layout::default(),
            data_layout: Layout::new(vec![(0, 5), (6, 4)]).expect("layout"),
        }
    }

    #[test]
    fn layout_wire_round_trip() {
        let layout = Layout::new(vec![(0, 5), (6, 4)]).expect("layout");
        let wire = layout.encode();
        assert_eq!(wire, vec![0, 5, 6, 4, 0xFF, 0]);
        assert_eq!(Layout::parse(&wire).expect("parse"), layout);
    }

    #[test]
    fn layout_without_sentinel_rejected() {
        assert_eq!(Layout::parse(&[0, 5, 6, 4]), Err(ParseError::MissingSentinel));
    }

    #[test]
    fn pack_unpack_scatter_gather() {
        let layout = Layout::new(vec![(0, 5), (6, 4)]).expect("layout");
        let src: Vec<u8> = (1..=9).collect();
        let mut spare = [0xFF_u8; 16];
        layout.pack_into(&src, &mut spare).expect("pack");
        // Status byte slot at offset 5 is untouched.
        assert_eq!(spare[5], 0xFF);
        assert_eq!(&spare[0..5], &[1, 2, 3, 4, 5]);
        assert_eq!(&spare[6..10], &[6, 7, 8, 9]);

        let mut dst = [0_u8; 9];
        layout.unpack_from(&spare, &mut dst).expect("unpack");
        assert_eq!(&dst[..], &src[..]);
    }

    #[test]
    fn soft_attr_validates() {
        soft_attr().validate().expect("valid");
    }

    #[test]
    fn layout_overlapping_status_byte_rejected() {
        let mut attr = soft_attr();
        attr.data_layout = Layout::new(vec![(0, 9)]).expect("layout");
        assert!(matches!(attr.validate(), Err(FlashError::Config(_))));
    }

    #[test]
    fn ecc_layout_size_must_match_mode() {
        let mut attr = soft_attr();
        attr.ecc_layout = Layout::new(vec![(10, 3)]).expect("layout");
        assert!(matches!(attr.validate(), Err(FlashError::Config(_))));
    }

    #[test]
    fn hw_auto_demands_driver_layout() {
        let mut attr = soft_attr();
        attr.ecc_mode = EccMode::HwAuto;
        assert!(matches!(attr.validate(), Err(FlashError::Config(_))));
    }

    #[test]
    fn check_ops_per_layout_mode() {
        let attr = soft_attr();
        let missing = OpsCaps::default();
        assert!(attr.check_ops(missing).is_err());

        let has_raw = OpsCaps {
            spare_raw: true,
            ..OpsCaps::default()
        };
        attr.check_ops(has_raw).expect("raw spare satisfies Fs layout");

        let mut flash_attr = soft_attr();
        flash_attr.layout_mode = LayoutMode::Flash;
        assert!(flash_attr.check_ops(has_raw).is_err());
        let has_layout = OpsCaps {
            spare_layout: true,
            ..OpsCaps::default()
        };
        flash_attr.check_ops(has_layout).expect("layout pair satisfies");
    }

    #[test]
    fn status_byte_check() {
        let attr = soft_attr();
        let mut spare = [0xFF_u8; 16];
        assert!(attr.status_byte_good(&spare));
        spare[5] = 0x00;
        assert!(!attr.status_byte_good(&spare));
    }
}
