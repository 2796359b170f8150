//! Group 0 command handlers

use log::*;

use crate::config::InquiryStrings;
use crate::diag::DebugCategory;
use crate::handshake::{BLOCK_SIZE, Block};
use crate::scsi::Cdb;
use crate::scsi::command::{Context, HandlerError, HandlerResult};
use crate::scsi::descriptor::{DESCRIPTOR_LEN, LunDescriptor, SECTORS_PER_TRACK};
use crate::scsi::sense::{SENSE_LEN, SenseData, SenseKind};
use crate::storage::StorageError;

pub const INQUIRY_LEN: usize = 36;
pub const TRANSLATE_LEN: usize = 8;

pub fn test_unit_ready(ctx: &mut Context, _cdb: &Cdb) -> HandlerResult {
    ctx.require_ready()
}

pub fn rezero_unit(ctx: &mut Context, _cdb: &Cdb) -> HandlerResult {
    ctx.require_ready()
}

pub fn request_sense(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    // An allocation length of 0 still gets the full non-extended block
    let len = match usize::from(cdb.length()) {
        0 => SENSE_LEN,
        n => n.min(SENSE_LEN),
    };
    let sense = ctx
        .sense
        .take(ctx.lun)
        .unwrap_or(SenseData::new(SenseKind::NoSense));
    let data = sense.to_bytes(ctx.lun, &ctx.config.sense);
    ctx.bus.data_in(&data[..len])?;
    Ok(())
}

/// Byte 2 is the fill pattern. Also creates a LUN that has no image yet.
pub fn format_unit(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    let pattern = cdb.0[2];
    debug!("Formatting LUN {} with pattern {:02X}", ctx.lun, pattern);
    ctx.storage.format_lun(ctx.lun, pattern)?;
    Ok(())
}

pub fn read6(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    ctx.require_ready()?;
    let lba = cdb.lba();
    let count = cdb.blocks();
    ctx.require_range(lba, count)?;

    let mut block: Block = [0; BLOCK_SIZE];
    for lba in lba..lba + count {
        ctx.storage
            .read_sector(ctx.lun, lba, &mut block)
            .map_err(|e| HandlerError::storage_at(e, lba))?;
        if ctx.diag.enabled(DebugCategory::Blocks) {
            ctx.diag
                .dump(DebugCategory::Blocks, &format!("LUN {} block {}", ctx.lun, lba), &block);
        }
        ctx.bus.data_in_block(&block)?;
    }
    Ok(())
}

pub fn write6(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    ctx.require_ready()?;
    let lba = cdb.lba();
    let count = cdb.blocks();
    ctx.require_range(lba, count)?;

    let mut block: Block = [0; BLOCK_SIZE];
    for lba in lba..lba + count {
        ctx.bus.data_out_block(&mut block)?;
        if ctx.diag.enabled(DebugCategory::Blocks) {
            ctx.diag
                .dump(DebugCategory::Blocks, &format!("LUN {} block {}", ctx.lun, lba), &block);
        }
        ctx.storage
            .write_sector(ctx.lun, lba, &block)
            .map_err(|e| HandlerError::storage_at(e, lba))?;
    }
    Ok(())
}

pub fn seek(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    ctx.require_ready()?;
    ctx.require_range(cdb.lba(), 1)
}

pub fn select(ctx: &mut Context, _cdb: &Cdb) -> HandlerResult {
    ctx.require_ready()
}

/// Logical block to physical address (cylinder, head, bytes from index)
pub fn translate(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    ctx.require_ready()?;
    let lba = cdb.lba();
    ctx.require_range(lba, 1)?;

    let heads = u32::from(ctx.storage.read_descriptor(ctx.lun)?.heads.max(1));
    let cylinder = lba / (heads * SECTORS_PER_TRACK);
    let head = (lba / SECTORS_PER_TRACK) % heads;
    let offset = (lba % SECTORS_PER_TRACK) * BLOCK_SIZE as u32;

    let mut result = [0; TRANSLATE_LEN];
    result[0..3].copy_from_slice(&cylinder.to_be_bytes()[1..]);
    result[3] = head as u8;
    result[4..8].copy_from_slice(&offset.to_be_bytes());
    ctx.bus.data_in(&result)?;
    Ok(())
}

pub fn inquiry(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    let strings = &ctx.config.inquiry;
    let mut result = [0; INQUIRY_LEN];

    // 0 Peripheral device type: direct access, or 0x7F for no LUN here
    result[0] = if ctx.storage.lun_exists(ctx.lun) { 0x00 } else { 0x7F };

    // 2 SCSI-1
    result[2] = 0x01;

    // 4 Additional length (N-4)
    result[4] = (INQUIRY_LEN - 5) as u8;

    // 8..16 Vendor, 16..32 Product, 32..36 Revision, space padded
    pad_ascii(&mut result[8..16], &strings.vendor);
    pad_ascii(&mut result[16..32], &strings.product);
    pad_ascii(&mut result[32..32 + InquiryStrings::REVISION_LEN], &strings.revision);
    result[35] = ctx.config.emulation.tag();

    let len = usize::from(cdb.length()).min(INQUIRY_LEN);
    ctx.bus.data_in(&result[..len])?;
    Ok(())
}

fn pad_ascii(dest: &mut [u8], src: &str) {
    dest.fill(b' ');
    let len = src.len().min(dest.len());
    dest[..len].copy_from_slice(&src.as_bytes()[..len]);
}

pub fn verify(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    ctx.require_ready()?;
    let lba = cdb.lba();
    let count = cdb.blocks();
    ctx.require_range(lba, count)?;

    let mut block: Block = [0; BLOCK_SIZE];
    for lba in lba..lba + count {
        ctx.storage
            .read_sector(ctx.lun, lba, &mut block)
            .map_err(|e| HandlerError::storage_at(e, lba))?;
    }
    Ok(())
}

pub fn mode_select(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    let mut data = vec![0; usize::from(cdb.length())];
    ctx.bus.data_out(&mut data)?;
    ctx.diag.dump(DebugCategory::Commands, "Mode select parameters", &data);

    // A LUN still to be created starts from the default geometry
    let current = match ctx.storage.read_descriptor(ctx.lun) {
        Err(StorageError::NotFound) if !ctx.storage.lun_exists(ctx.lun) => {
            LunDescriptor::default()
        }
        r => r?,
    };
    let new = current.merge(&data[..data.len().min(DESCRIPTOR_LEN)]);
    if new.block_size != BLOCK_SIZE as u32 {
        warn!("MODE SELECT with unsupported block length {}", new.block_size);
        return Err(HandlerError::check(SenseKind::InvalidParameter));
    }
    ctx.storage.write_descriptor(ctx.lun, &new)?;
    Ok(())
}

pub fn mode_sense(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    let descriptor = ctx.storage.read_descriptor(ctx.lun)?;
    let data = descriptor.to_bytes();
    let len = usize::from(cdb.length()).min(DESCRIPTOR_LEN);
    ctx.bus.data_in(&data[..len])?;
    Ok(())
}

pub fn start_stop(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    let start = cdb.0[4] & 1 != 0;
    ctx.storage.set_lun_ready(ctx.lun, start)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmulationMode, TargetConfig};
    use crate::scsi::command::tests::{FakeBus, dispatcher, storage};
    use crate::scsi::{STATUS_CHECK_CONDITION, STATUS_GOOD};
    use crate::storage::Storage;
    use hex_literal::hex;

    fn run(cdb: [u8; 6], bus: &mut FakeBus, s: &mut dyn Storage) -> u8 {
        let mut d = dispatcher(TargetConfig::default());
        d.dispatch(&Cdb(cdb), cdb[1] >> 5, s, bus).status
    }

    #[test]
    fn read_blocks() {
        let mut s = storage();
        let mut bus = FakeBus::default();
        assert_eq!(run([0x08, 0, 0, 1, 2, 0], &mut bus, &mut s), STATUS_GOOD);
        assert_eq!(bus.data_in.len(), 2 * BLOCK_SIZE);
        assert!(bus.data_in[..BLOCK_SIZE].iter().all(|&b| b == 2));
        assert!(bus.data_in[BLOCK_SIZE..].iter().all(|&b| b == 3));
    }

    #[test]
    fn read_past_end() {
        let mut s = storage();
        let mut d = dispatcher(TargetConfig::default());
        let mut bus = FakeBus::default();
        let outcome = d.dispatch(&Cdb([0x08, 0, 0, 3, 2, 0]), 0, &mut s, &mut bus);
        assert_eq!(outcome.status, STATUS_CHECK_CONDITION);
        assert_eq!(
            outcome.sense,
            Some(SenseData::at(SenseKind::IllegalBlockAddress, 3))
        );
        assert!(bus.data_in.is_empty());
    }

    #[test]
    fn read_storage_error_then_request_sense() {
        let mut s = storage();
        let mut d = dispatcher(TargetConfig::default());
        s.inject_fault(0, StorageError::Io);

        let outcome = d.dispatch(&Cdb([0x08, 0, 0, 2, 1, 0]), 0, &mut s, &mut FakeBus::default());
        assert_eq!(outcome.sense, Some(SenseData::at(SenseKind::MediumError, 2)));

        let mut bus = FakeBus::default();
        assert!(d.dispatch(&Cdb([0x03, 0, 0, 0, 4, 0]), 0, &mut s, &mut bus).is_good());
        assert_eq!(bus.data_in, hex!("91 00 00 02"));

        let mut bus = FakeBus::default();
        assert!(d.dispatch(&Cdb([0x03, 0, 0, 0, 0, 0]), 0, &mut s, &mut bus).is_good());
        assert_eq!(bus.data_in, hex!("00 00 00 00"));
    }

    #[test]
    fn write_blocks() {
        let mut s = storage();
        let mut data = vec![0x11; BLOCK_SIZE];
        data.extend(vec![0x22; BLOCK_SIZE]);
        let mut bus = FakeBus::with_out(data.clone());
        assert_eq!(run([0x0A, 0, 0, 2, 2, 0], &mut bus, &mut s), STATUS_GOOD);
        assert_eq!(&s.contents(0).unwrap()[2 * BLOCK_SIZE..], &data[..]);
    }

    #[test]
    fn length_zero_means_256_blocks() {
        let mut s = storage();
        let mut bus = FakeBus::default();
        // 4-block LUN
        assert_eq!(run([0x08, 0, 0, 0, 0, 0], &mut bus, &mut s), STATUS_CHECK_CONDITION);

        s.add_lun(1, 256);
        let mut bus = FakeBus::default();
        assert_eq!(run([0x08, 0x20, 0, 0, 0, 0], &mut bus, &mut s), STATUS_GOOD);
        assert_eq!(bus.data_in.len(), 256 * BLOCK_SIZE);
    }

    #[test]
    fn unit_ready_and_start_stop() {
        let mut s = storage();
        let mut bus = FakeBus::default();
        assert_eq!(run([0x00; 6], &mut bus, &mut s), STATUS_GOOD);
        assert_eq!(run([0x1B, 0, 0, 0, 0, 0], &mut bus, &mut s), STATUS_GOOD);
        assert_eq!(run([0x00; 6], &mut bus, &mut s), STATUS_CHECK_CONDITION);
        assert_eq!(run([0x0E, 0, 0, 0, 0, 0], &mut bus, &mut s), STATUS_CHECK_CONDITION);
        assert_eq!(run([0x1B, 0, 0, 0, 1, 0], &mut bus, &mut s), STATUS_GOOD);
        assert_eq!(run([0x01, 0, 0, 0, 0, 0], &mut bus, &mut s), STATUS_GOOD);
    }

    #[test]
    fn not_ready_sense() {
        let mut s = storage();
        s.set_lun_ready(0, false).unwrap();
        let mut d = dispatcher(TargetConfig::default());
        let outcome = d.dispatch(&Cdb([0x00; 6]), 0, &mut s, &mut FakeBus::default());
        assert_eq!(outcome.sense, Some(SenseData::new(SenseKind::NotReady)));
    }

    #[test]
    fn inquiry_block() {
        let mut s = storage();
        let mut d = dispatcher(TargetConfig {
            emulation: EmulationMode::LvDos,
            ..Default::default()
        });
        let mut bus = FakeBus::default();
        assert!(d.dispatch(&Cdb([0x12, 0, 0, 0, 0xFF, 0]), 0, &mut s, &mut bus).is_good());
        assert_eq!(bus.data_in.len(), INQUIRY_LEN);
        assert_eq!(bus.data_in[0], 0);
        assert_eq!(bus.data_in[4], 31);
        assert_eq!(&bus.data_in[8..16], b"LCSCSI  ");
        assert_eq!(&bus.data_in[16..32], b"VIRTUAL DISK    ");
        assert_eq!(bus.data_in[35], b'L');

        let mut bus = FakeBus::default();
        assert!(d.dispatch(&Cdb([0x12, 0xE0, 0, 0, 5, 0]), 7, &mut s, &mut bus).is_good());
        assert_eq!(bus.data_in, [0x7F, 0, 1, 0, 31]);
    }

    #[test]
    fn seek_range() {
        let mut s = storage();
        let mut bus = FakeBus::default();
        assert_eq!(run([0x0B, 0, 0, 3, 0, 0], &mut bus, &mut s), STATUS_GOOD);
        assert_eq!(run([0x0B, 0, 0, 4, 0, 0], &mut bus, &mut s), STATUS_CHECK_CONDITION);
    }

    #[test]
    fn translate_address() {
        let mut s = storage();
        s.add_lun(1, 100);
        let mut d = dispatcher(TargetConfig::default());
        let mut desc = s.read_descriptor(1).unwrap();
        desc.heads = 2;
        s.write_descriptor(1, &desc).unwrap();

        let mut bus = FakeBus::default();
        // 70 = cylinder 1, head 0, sector 4
        assert!(d.dispatch(&Cdb([0x0F, 0x20, 0, 70, 0, 0]), 1, &mut s, &mut bus).is_good());
        assert_eq!(bus.data_in, hex!("00 00 01 00 00 00 04 00"));
    }

    #[test]
    fn mode_sense_select() {
        let mut s = storage();
        let mut d = dispatcher(TargetConfig::default());

        let mut bus = FakeBus::default();
        assert!(d.dispatch(&Cdb([0x1A, 0, 0, 0, 22, 0]), 0, &mut s, &mut bus).is_good());
        assert_eq!(bus.data_in, LunDescriptor::for_capacity(4).to_bytes());

        let mut params = LunDescriptor::for_capacity(50).to_bytes().to_vec();
        params[21] = 3;
        let mut bus = FakeBus::with_out(params);
        assert!(d.dispatch(&Cdb([0x15, 0, 0, 0, 22, 0]), 0, &mut s, &mut bus).is_good());
        let stored = s.read_descriptor(0).unwrap();
        assert_eq!(stored.blocks, 50);
        assert_eq!(stored.step_rate, 3);

        // Truncated sense
        let mut bus = FakeBus::default();
        assert!(d.dispatch(&Cdb([0x1A, 0, 0, 0, 4, 0]), 0, &mut s, &mut bus).is_good());
        assert_eq!(bus.data_in, [0, 0, 0, 8]);
    }

    #[test]
    fn mode_select_rejects_block_size() {
        let mut s = storage();
        let mut d = dispatcher(TargetConfig::default());
        let mut params = LunDescriptor::for_capacity(4).to_bytes().to_vec();
        params[9..12].copy_from_slice(&[0, 2, 0]);
        let mut bus = FakeBus::with_out(params);
        let outcome = d.dispatch(&Cdb([0x15, 0, 0, 0, 22, 0]), 0, &mut s, &mut bus);
        assert_eq!(outcome.sense, Some(SenseData::new(SenseKind::InvalidParameter)));
    }

    #[test]
    fn format_then_verify() {
        let mut s = storage();
        let mut bus = FakeBus::default();
        assert_eq!(run([0x04, 0, 0, 0, 0, 0], &mut bus, &mut s), STATUS_GOOD);
        assert!(s.contents(0).unwrap().iter().all(|&b| b == 0));
        assert_eq!(run([0x13, 0, 0, 0, 4, 0], &mut bus, &mut s), STATUS_GOOD);
        assert_eq!(run([0x13, 0, 0, 1, 4, 0], &mut bus, &mut s), STATUS_CHECK_CONDITION);
        assert!(bus.data_in.is_empty());
    }

    #[test]
    fn format_fill_pattern() {
        let mut s = storage();
        let mut bus = FakeBus::default();
        assert_eq!(run([0x04, 0, 0xB6, 0, 0, 0], &mut bus, &mut s), STATUS_GOOD);
        assert_eq!(s.contents(0).unwrap().len(), 4 * BLOCK_SIZE);
        assert!(s.contents(0).unwrap().iter().all(|&b| b == 0xB6));
    }

    #[test]
    fn mode_select_and_format_create_lun() {
        let mut s = storage();
        let mut d = dispatcher(TargetConfig::default());
        assert!(!s.lun_exists(1));

        // Reading the geometry of a LUN that is not there still fails
        let cdb = Cdb([0x1A, 0x20, 0, 0, 22, 0]);
        let outcome = d.dispatch(&cdb, 1, &mut s, &mut FakeBus::default());
        assert_eq!(outcome.sense, Some(SenseData::new(SenseKind::InvalidLun)));

        let params = LunDescriptor::for_capacity(12).to_bytes().to_vec();
        let mut bus = FakeBus::with_out(params);
        assert!(d.dispatch(&Cdb([0x15, 0x20, 0, 0, 22, 0]), 1, &mut s, &mut bus).is_good());
        assert!(!s.lun_exists(1));

        let cdb = Cdb([0x04, 0x20, 0, 0, 0, 0]);
        let outcome = d.dispatch(&cdb, 1, &mut s, &mut FakeBus::default());
        assert!(outcome.is_good());
        assert!(s.lun_exists(1));
        assert_eq!(s.lun_size_in_blocks(1), 12);

        let mut bus = FakeBus::default();
        assert!(d.dispatch(&Cdb([0x00, 0x20, 0, 0, 0, 0]), 1, &mut s, &mut bus).is_good());
    }

    #[test]
    fn format_without_descriptor_uses_default() {
        let mut s = storage();
        let mut d = dispatcher(TargetConfig::default());
        let cdb = Cdb([0x04, 0x40, 0, 0, 0, 0]);
        let outcome = d.dispatch(&cdb, 2, &mut s, &mut FakeBus::default());
        assert!(outcome.is_good());
        assert_eq!(s.read_descriptor(2).unwrap(), LunDescriptor::default());
    }
}
