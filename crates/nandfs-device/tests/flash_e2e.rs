//! End-to-end flash service tests against the simulated NAND chip.

use std::sync::Arc;

use nandfs_device::{Device, DeviceConfig};
use nandfs_emu::{sim_attr, sim_attr_flash_layout, OpKind, SimNand};
use nandfs_error::FlashError;
use nandfs_flash::{EccMode, IoError, Layout, OpsCaps, StorageAttr, Tag};
use nandfs_types::{BlockId, DeviceType, PageId, Partition, Serial};

fn mount(attr: StorageAttr) -> (Arc<Device>, SimNand) {
    let nand = SimNand::new(attr.clone());
    let handle = nand.clone();
    let par = Partition::new(BlockId(0), BlockId(attr.total_blocks - 1)).unwrap();
    let dev = Device::mount(
        DeviceType::Emulated,
        par,
        Arc::new(attr),
        Box::new(nand),
        DeviceConfig::default(),
    )
    .unwrap();
    (dev, handle)
}

/// Wider spare carrying a dedicated ECC run for the tag bytes.
fn s_ecc_attr() -> StorageAttr {
    let mut attr = sim_attr();
    attr.spare_size = 24;
    attr.s_ecc_layout = Layout::new(vec![(16, 3)]).unwrap();
    attr
}

fn tag_for(serial: u16, page: u32, data_len: u16) -> Tag {
    Tag {
        valid: true,
        block_ts: 1,
        parent: Serial(0),
        serial: Serial(serial),
        page_id: PageId(page),
        data_len,
    }
}

#[test]
fn write_then_read_round_trips_data_and_tag() {
    let (dev, _nand) = mount(sim_attr());
    let payload = vec![b'A'; 512];
    let tag = tag_for(7, 0, 512);

    dev.write_page_combine(BlockId(3), PageId(0), &payload, tag)
        .unwrap();

    let mut back = vec![0_u8; 512];
    let flips = dev.read_page(BlockId(3), PageId(0), &mut back).unwrap();
    assert_eq!(flips, 0);
    assert_eq!(back, payload);

    let (read_tag, corrected) = dev.read_page_spare(BlockId(3), PageId(0)).unwrap();
    assert_eq!(read_tag, Some(tag));
    assert_eq!(corrected, 0);

    let stats = dev.stats();
    assert_eq!(stats.page_write_count, 1);
    assert_eq!(stats.spare_write_count, 1);
    assert_eq!(stats.page_read_count, 1);
}

#[test]
fn short_write_pads_with_erased_bytes() {
    let (dev, _nand) = mount(sim_attr());
    dev.write_page_combine(BlockId(1), PageId(2), &[0x42; 100], tag_for(1, 2, 100))
        .unwrap();

    let mut back = vec![0_u8; 512];
    dev.read_page(BlockId(1), PageId(2), &mut back).unwrap();
    assert_eq!(&back[..100], &[0x42; 100][..]);
    assert!(back[100..].iter().all(|&b| b == 0xFF));
}

#[test]
fn soft_ecc_corrects_a_single_bit_flip() {
    let (dev, nand) = mount(sim_attr());
    let payload = vec![b'A'; 512];
    dev.write_page_combine(BlockId(3), PageId(0), &payload, tag_for(7, 0, 512))
        .unwrap();

    nand.flip_data_bit(BlockId(3), PageId(0), 100, 4);

    let mut back = vec![0_u8; 512];
    let flips = dev.read_page(BlockId(3), PageId(0), &mut back).unwrap();
    assert_eq!(flips, 1);
    assert_eq!(back, payload);
}

#[test]
fn soft_ecc_rejects_a_double_bit_flip() {
    let (dev, nand) = mount(sim_attr());
    dev.write_page_combine(BlockId(4), PageId(1), &[0x5A; 512], tag_for(2, 1, 512))
        .unwrap();

    // Two flips inside the same 256-byte chunk defeat single-bit ECC.
    nand.flip_data_bit(BlockId(4), PageId(1), 10, 1);
    nand.flip_data_bit(BlockId(4), PageId(1), 20, 6);

    let mut back = vec![0_u8; 512];
    assert_eq!(
        dev.read_page(BlockId(4), PageId(1), &mut back),
        Err(FlashError::EccFailed { block: 4, page: 1 })
    );
}

#[test]
fn erased_page_has_no_tag_and_clean_ecc() {
    let (dev, _nand) = mount(sim_attr());
    let (tag, corrected) = dev.read_page_spare(BlockId(9), PageId(5)).unwrap();
    assert_eq!(tag, None);
    assert_eq!(corrected, 0);

    let mut back = vec![0_u8; 512];
    let flips = dev.read_page(BlockId(9), PageId(5), &mut back).unwrap();
    assert_eq!(flips, 0);
    assert!(back.iter().all(|&b| b == 0xFF));
}

#[test]
fn spare_read_is_cached_until_invalidated() {
    let (dev, _nand) = mount(sim_attr());
    dev.write_page_combine(BlockId(6), PageId(0), &[1; 512], tag_for(3, 0, 512))
        .unwrap();
    let spare_reads_before = dev.stats().spare_read_count;

    // The combine seeded the cache; no spare I/O for repeated lookups.
    for _ in 0..5 {
        dev.read_page_spare(BlockId(6), PageId(0)).unwrap();
    }
    assert_eq!(dev.stats().spare_read_count, spare_reads_before);

    dev.erase_block(BlockId(6)).unwrap();
    let (tag, _) = dev.read_page_spare(BlockId(6), PageId(0)).unwrap();
    assert_eq!(tag, None);
    assert!(dev.stats().spare_read_count > spare_reads_before);
}

#[test]
fn corrupted_tag_seal_surfaces_as_spare_ecc_failure() {
    let cfg = DeviceConfig::default();
    let (dev, nand) = mount(sim_attr());
    dev.write_page_combine(BlockId(2), PageId(0), &[9; 512], tag_for(4, 0, 512))
        .unwrap();
    nand.flip_spare_bit(BlockId(2), PageId(0), 0, 0);

    // Evict block 2 from the info cache so the next lookup rescans.
    for b in 20..20 + cfg.cache_blocks as u32 {
        dev.write_page_combine(BlockId(b), PageId(0), &[0; 512], tag_for(5, 0, 512))
            .unwrap();
    }

    assert_eq!(
        dev.read_page_spare(BlockId(2), PageId(0)),
        Err(FlashError::SpareEccFailed { block: 2, page: 0 })
    );
}

#[test]
fn tag_ecc_repairs_a_flipped_spare_bit() {
    let cfg = DeviceConfig::default();
    let (dev, nand) = mount(s_ecc_attr());
    let tag = tag_for(4, 0, 512);
    dev.write_page_combine(BlockId(2), PageId(0), &[9; 512], tag)
        .unwrap();
    nand.flip_spare_bit(BlockId(2), PageId(0), 0, 1);

    // Evict block 2 so the next lookup rescans the damaged spare.
    for b in 20..20 + cfg.cache_blocks as u32 {
        dev.write_page_combine(BlockId(b), PageId(0), &[0; 512], tag_for(5, 0, 512))
            .unwrap();
    }

    let (read_tag, corrected) = dev.read_page_spare(BlockId(2), PageId(0)).unwrap();
    assert_eq!(read_tag, Some(tag));
    assert!(corrected >= 1);
}

#[test]
fn tag_ecc_flip_in_stored_ecc_is_tolerated() {
    let cfg = DeviceConfig::default();
    let (dev, nand) = mount(s_ecc_attr());
    let tag = tag_for(4, 0, 512);
    dev.write_page_combine(BlockId(2), PageId(0), &[9; 512], tag)
        .unwrap();
    nand.flip_spare_bit(BlockId(2), PageId(0), 16, 4);
    for b in 20..20 + cfg.cache_blocks as u32 {
        dev.write_page_combine(BlockId(b), PageId(0), &[0; 512], tag_for(5, 0, 512))
            .unwrap();
    }

    let (read_tag, corrected) = dev.read_page_spare(BlockId(2), PageId(0)).unwrap();
    assert_eq!(read_tag, Some(tag));
    assert_eq!(corrected, 1);
}

#[test]
fn hw_ecc_round_trips_and_corrects_via_driver() {
    let attr = StorageAttr {
        ecc_mode: EccMode::Hw,
        ..sim_attr()
    };
    let (dev, nand) = mount(attr);
    let payload = vec![0x77_u8; 512];
    dev.write_page_combine(BlockId(3), PageId(1), &payload, tag_for(8, 1, 512))
        .unwrap();

    let mut back = vec![0_u8; 512];
    assert_eq!(dev.read_page(BlockId(3), PageId(1), &mut back).unwrap(), 0);
    assert_eq!(back, payload);

    nand.flip_data_bit(BlockId(3), PageId(1), 42, 3);
    let flips = dev.read_page(BlockId(3), PageId(1), &mut back).unwrap();
    assert_eq!(flips, 1);
    assert_eq!(back, payload);

    // A second flip in the same chunk exceeds the driver's correction.
    nand.flip_data_bit(BlockId(3), PageId(1), 50, 2);
    assert_eq!(
        dev.read_page(BlockId(3), PageId(1), &mut back),
        Err(FlashError::EccFailed { block: 3, page: 1 })
    );
}

#[test]
fn ecc_none_round_trips_without_protection() {
    let attr = StorageAttr {
        ecc_mode: EccMode::None,
        ecc_layout: Layout::default(),
        ..sim_attr()
    };
    let (dev, nand) = mount(attr);
    let payload = vec![0x1E_u8; 512];
    let tag = tag_for(2, 0, 512);
    dev.write_page_combine(BlockId(1), PageId(0), &payload, tag)
        .unwrap();

    let mut back = vec![0_u8; 512];
    assert_eq!(dev.read_page(BlockId(1), PageId(0), &mut back).unwrap(), 0);
    assert_eq!(back, payload);
    let (read_tag, _) = dev.read_page_spare(BlockId(1), PageId(0)).unwrap();
    assert_eq!(read_tag, Some(tag));

    // Unprotected mode: a flip passes through as-is, never an error.
    nand.flip_data_bit(BlockId(1), PageId(0), 0, 0);
    assert_eq!(dev.read_page(BlockId(1), PageId(0), &mut back).unwrap(), 0);
    assert_ne!(back, payload);
}

#[test]
fn hw_auto_round_trips_with_driver_managed_spare() {
    let attr = StorageAttr {
        ecc_mode: EccMode::HwAuto,
        ..sim_attr_flash_layout()
    };
    let (dev, _nand) = mount(attr);
    let payload = vec![0x4D_u8; 512];
    let tag = tag_for(5, 0, 512);
    dev.write_page_combine(BlockId(4), PageId(2), &payload, tag)
        .unwrap();

    let mut back = vec![0_u8; 512];
    assert_eq!(dev.read_page(BlockId(4), PageId(2), &mut back).unwrap(), 0);
    assert_eq!(back, payload);
    let (read_tag, _) = dev.read_page_spare(BlockId(4), PageId(2)).unwrap();
    assert_eq!(read_tag, Some(tag));
}

#[test]
fn transient_errors_retry_then_succeed() {
    let (dev, nand) = mount(sim_attr());
    dev.write_page_combine(BlockId(5), PageId(0), &[7; 512], tag_for(1, 0, 512))
        .unwrap();

    nand.fail_next(OpKind::ReadData, IoError::Retry, 2);
    let mut back = vec![0_u8; 512];
    assert!(dev.read_page(BlockId(5), PageId(0), &mut back).is_ok());
}

#[test]
fn retry_budget_exhaustion_reports_io_error() {
    let (dev, nand) = mount(sim_attr());
    nand.fail_next(OpKind::ReadData, IoError::Retry, 100);

    let mut back = vec![0_u8; 512];
    assert_eq!(
        dev.read_page(BlockId(5), PageId(0), &mut back),
        Err(FlashError::Io {
            block: 5,
            page: 0,
            attempts: DeviceConfig::default().max_retries,
        })
    );
}

#[test]
fn bad_block_on_write_lands_in_pending_slot() {
    let (dev, nand) = mount(sim_attr());
    nand.fail_next(OpKind::WriteData, IoError::BadBlock, 1);

    assert_eq!(
        dev.write_page_combine(BlockId(8), PageId(0), &[1; 512], tag_for(1, 0, 512)),
        Err(FlashError::BadBlock { block: 8 })
    );
    assert_eq!(dev.take_pending_bad(), Some(BlockId(8)));
    assert_eq!(dev.take_pending_bad(), None);
}

#[test]
fn erase_reporting_bad_records_pending_and_drops_cache() {
    let (dev, nand) = mount(sim_attr());
    dev.write_page_combine(BlockId(10), PageId(0), &[3; 512], tag_for(2, 0, 512))
        .unwrap();
    nand.set_erase_reports_bad(BlockId(10), true);

    assert_eq!(
        dev.erase_block(BlockId(10)),
        Err(FlashError::BadBlock { block: 10 })
    );
    assert_eq!(dev.take_pending_bad(), Some(BlockId(10)));

    // Cache entry is gone; the lookup goes back to flash.
    let spare_reads = dev.stats().spare_read_count;
    dev.read_page_spare(BlockId(10), PageId(0)).unwrap();
    assert!(dev.stats().spare_read_count > spare_reads);
}

#[test]
fn mark_bad_is_idempotent_and_clears_pending() {
    let (dev, nand) = mount(sim_attr());
    nand.set_erase_reports_bad(BlockId(11), true);
    let _ = dev.erase_block(BlockId(11));

    dev.mark_bad_block(BlockId(11)).unwrap();
    assert_eq!(dev.take_pending_bad(), None);
    assert!(dev.is_bad_block(BlockId(11)).unwrap());

    dev.mark_bad_block(BlockId(11)).unwrap();
    assert!(nand.is_marked_bad(BlockId(11)));
}

#[test]
fn bad_block_check_falls_back_to_status_byte() {
    let attr = sim_attr();
    let nand = SimNand::new(attr.clone()).with_caps(OpsCaps {
        spare_raw: true,
        spare_layout: false,
        bad_block_probe: false,
    });
    let handle = nand.clone();
    let par = Partition::new(BlockId(0), BlockId(attr.total_blocks - 1)).unwrap();
    let dev = Device::mount(
        DeviceType::Emulated,
        par,
        Arc::new(attr),
        Box::new(nand),
        DeviceConfig::default(),
    )
    .unwrap();

    assert!(!dev.is_bad_block(BlockId(12)).unwrap());
    dev.mark_bad_block(BlockId(12)).unwrap();
    assert!(dev.is_bad_block(BlockId(12)).unwrap());
    assert!(handle.is_marked_bad(BlockId(12)));
}

#[test]
fn mount_rejects_a_driver_missing_required_ops() {
    let attr = sim_attr();
    let nand = SimNand::new(attr.clone()).with_caps(OpsCaps {
        spare_raw: false,
        spare_layout: true,
        bad_block_probe: true,
    });
    let par = Partition::new(BlockId(0), BlockId(attr.total_blocks - 1)).unwrap();
    let result = Device::mount(
        DeviceType::Emulated,
        par,
        Arc::new(attr),
        Box::new(nand),
        DeviceConfig::default(),
    );
    assert!(result.is_err());
}

#[test]
fn out_of_range_access_is_rejected() {
    let (dev, _nand) = mount(sim_attr());
    let mut back = vec![0_u8; 512];
    assert_eq!(
        dev.read_page(BlockId(64), PageId(0), &mut back),
        Err(FlashError::OutOfRange { block: 64, page: 0 })
    );
    assert_eq!(
        dev.read_page_spare(BlockId(0), PageId(32)),
        Err(FlashError::OutOfRange { block: 0, page: 32 })
    );
}

#[test]
fn driver_lifecycle_hooks_run_at_mount_and_drop() {
    let attr = sim_attr();
    let nand = SimNand::new(attr.clone());
    let handle = nand.clone();
    let par = Partition::new(BlockId(0), BlockId(attr.total_blocks - 1)).unwrap();
    let dev = Device::mount(
        DeviceType::Emulated,
        par,
        Arc::new(attr),
        Box::new(nand),
        DeviceConfig::default(),
    )
    .unwrap();

    assert_eq!(handle.init_calls(), 1);
    assert_eq!(handle.close_calls(), 0);
    drop(dev);
    assert_eq!(handle.close_calls(), 1);
}

#[test]
fn staged_writes_flush_as_a_group() {
    let cfg = DeviceConfig::default();
    let (dev, _nand) = mount(sim_attr());

    // Serial 3 maps to dirty group 0.
    let serial = Serial(3);
    let group = serial.dirty_group();
    for page in 0..cfg.dirty_buf_max as u32 {
        let staged_group = dev
            .stage_write(serial, PageId(page), &[page as u8; 512], tag_for(3, page, 512))
            .unwrap();
        assert_eq!(staged_group, group);
    }
    assert!(dev.group_needs_flush(group));

    dev.flush_group(group, |buf| (BlockId(5), PageId(buf.page_id.0)))
        .unwrap();
    assert!(!dev.group_needs_flush(group));

    let mut back = vec![0_u8; 512];
    dev.read_page(BlockId(5), PageId(7), &mut back).unwrap();
    assert_eq!(back, vec![7_u8; 512]);

    // Buffers returned to the free list; staging works again.
    dev.stage_write(serial, PageId(0), &[0xAB; 512], tag_for(3, 0, 512))
        .unwrap();
}

#[test]
fn failed_flush_requeues_the_dirty_group() {
    let (dev, nand) = mount(sim_attr());
    let serial = Serial(0);
    let group = serial.dirty_group();
    for page in 0..4_u32 {
        dev.stage_write(serial, PageId(page), &[1; 512], tag_for(0, page, 512))
            .unwrap();
    }

    nand.fail_next(OpKind::WriteData, IoError::BadBlock, 1);
    assert!(dev
        .flush_group(group, |buf| (BlockId(6), PageId(buf.page_id.0)))
        .is_err());
    assert_eq!(dev.take_pending_bad(), Some(BlockId(6)));

    // Nothing staged was lost; the retried flush commits everything.
    dev.flush_group(group, |buf| (BlockId(7), PageId(buf.page_id.0)))
        .unwrap();
    let mut back = vec![0_u8; 512];
    dev.read_page(BlockId(7), PageId(2), &mut back).unwrap();
    assert_eq!(back, vec![1_u8; 512]);
}

#[test]
fn pool_exhausts_when_every_buffer_is_dirty() {
    let cfg = DeviceConfig::default();
    let (dev, _nand) = mount(sim_attr());

    for n in 0..cfg.buf_max as u32 {
        dev.stage_write(
            Serial(n as u16),
            PageId(0),
            &[2; 512],
            tag_for(n as u16, 0, 512),
        )
        .unwrap();
    }
    let overflow = dev.stage_write(Serial(999), PageId(0), &[2; 512], tag_for(999, 0, 512));
    assert!(matches!(overflow, Err(FlashError::PoolExhausted(_))));
}

#[test]
fn device_lock_is_reentrant_from_the_owning_task() {
    let (dev, _nand) = mount(sim_attr());
    let _guard = dev.lock();
    assert_eq!(dev.lock_depth(), 1);

    // Service calls re-enter the held lock instead of deadlocking.
    let mut back = vec![0_u8; 512];
    dev.read_page(BlockId(0), PageId(0), &mut back).unwrap();
    assert_eq!(dev.lock_depth(), 1);
}

#[test]
fn driver_owned_spare_layout_round_trips() {
    let (dev, nand) = mount(sim_attr_flash_layout());
    let payload = vec![0x33_u8; 512];
    let tag = tag_for(6, 0, 512);

    dev.write_page_combine(BlockId(1), PageId(0), &payload, tag)
        .unwrap();
    let (read_tag, _) = dev.read_page_spare(BlockId(1), PageId(0)).unwrap();
    assert_eq!(read_tag, Some(tag));

    nand.flip_data_bit(BlockId(1), PageId(0), 300, 2);
    let mut back = vec![0_u8; 512];
    let flips = dev.read_page(BlockId(1), PageId(0), &mut back).unwrap();
    assert_eq!(flips, 1);
    assert_eq!(back, payload);
}

#[test]
fn read_page_into_buf_carries_tag_and_length() {
    let (dev, _nand) = mount(sim_attr());
    dev.write_page_combine(BlockId(2), PageId(3), &[0x11; 200], tag_for(9, 3, 200))
        .unwrap();

    let handle = dev
        .read_page_into_buf(BlockId(2), PageId(3), Serial(9), PageId(3))
        .unwrap();
    let buf = dev.buf_snapshot(handle).unwrap();
    assert_eq!(buf.serial, Serial(9));
    assert_eq!(buf.page_id, PageId(3));
    assert_eq!(buf.data_len, 200);
    assert_eq!(&buf.data[..200], &[0x11; 200][..]);
    assert_eq!(buf.tag.map(|t| t.data_len), Some(200));
}
