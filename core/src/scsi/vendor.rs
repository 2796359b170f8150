//! F-code and vendor diagnostic commands
//!
//! F-codes are the laser-disc player control strings of the LV-DOS
//! filing system. No player is attached, so writes are kept for
//! inspection and reads always see an empty reply.

use log::*;

use crate::config::EmulationMode;
use crate::diag::DebugCategory;
use crate::handshake::{BLOCK_SIZE, Block};
use crate::scsi::command::{Context, HandlerError, HandlerResult};
use crate::scsi::sense::SenseKind;
use crate::scsi::{Cdb, MAX_LUNS};
use crate::storage::{StorageError, USER_CODE_LEN};

/// Terminates an F-code string and forms the empty player reply
pub const FCODE_TERMINATOR: u8 = 0x0D;

pub const VENDOR_SENSE_LEN: usize = 13;

#[derive(Debug, Default, Clone)]
pub struct VendorState {
    /// Last block received by WRITE F-CODE
    pub last_fcode: Option<Block>,
    /// File last queried by VENDOR FAT INFO
    pub fat_file: Option<u32>,
}

impl VendorState {
    /// The F-code text of the last WRITE F-CODE, up to its terminator
    pub fn last_fcode_text(&self) -> Option<String> {
        let block = self.last_fcode.as_ref()?;
        let end = block
            .iter()
            .position(|&b| b == FCODE_TERMINATOR || b == 0)
            .unwrap_or(BLOCK_SIZE);
        Some(String::from_utf8_lossy(&block[..end]).into_owned())
    }
}

pub fn write_fcode(ctx: &mut Context, _cdb: &Cdb) -> HandlerResult {
    let mut block: Block = [0; BLOCK_SIZE];
    ctx.bus.data_out_block(&mut block)?;
    ctx.vendor.last_fcode = Some(block);

    if ctx.diag.enabled(DebugCategory::Fcodes) {
        debug!(
            target: DebugCategory::Fcodes.target(),
            "F-code: {}",
            ctx.vendor.last_fcode_text().unwrap_or_default()
        );
    }
    Ok(())
}

pub fn read_fcode(ctx: &mut Context, _cdb: &Cdb) -> HandlerResult {
    let mut block: Block = [0; BLOCK_SIZE];
    block[0] = FCODE_TERMINATOR;
    ctx.diag.dump(DebugCategory::Fcodes, "F-code reply", &block[..1]);
    ctx.bus.data_in_block(&block)?;
    Ok(())
}

/// 0 LUN directory, 1 emulation mode, 2 LUNs present, 3 LUNs ready,
/// 4..8 capacity of the addressed LUN in blocks, 8..13 its user code
pub fn vendor_sense(ctx: &mut Context, _cdb: &Cdb) -> HandlerResult {
    let mut result = [0; VENDOR_SENSE_LEN];
    result[0] = ctx.storage.lun_directory();
    result[1] = match ctx.config.emulation {
        EmulationMode::Fixed => 0,
        EmulationMode::LvDos => 1,
    };
    for lun in 0..MAX_LUNS as u8 {
        if ctx.storage.lun_exists(lun) {
            result[2] |= 1 << lun;
        }
        if ctx.storage.lun_ready(lun) {
            result[3] |= 1 << lun;
        }
    }
    let size = ctx.storage.lun_size_in_blocks(ctx.lun);
    result[4..8].copy_from_slice(&size.to_be_bytes());
    result[8..8 + USER_CODE_LEN].copy_from_slice(&ctx.storage.lun_user_code(ctx.lun));
    ctx.bus.data_in(&result)?;
    Ok(())
}

fn not_found_is_parameter(err: StorageError) -> HandlerError {
    match err {
        StorageError::NotFound => HandlerError::check(SenseKind::InvalidParameter),
        e => e.into(),
    }
}

pub fn vendor_select(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    let directory = cdb.0[4];
    ctx.storage
        .set_lun_directory(directory)
        .map_err(not_found_is_parameter)?;
    ctx.vendor.fat_file = None;
    Ok(())
}

pub fn fat_path(ctx: &mut Context, _cdb: &Cdb) -> HandlerResult {
    let mut block: Block = [0; BLOCK_SIZE];
    ctx.bus.data_out_block(&mut block)?;
    let end = block.iter().position(|&b| b == 0).unwrap_or(BLOCK_SIZE);
    let path = String::from_utf8_lossy(&block[..end]);

    if ctx.diag.enabled(DebugCategory::Filesystem) {
        debug!(target: DebugCategory::Filesystem.target(), "FAT path: '{}'", path);
    }
    ctx.storage
        .set_fat_directory(&path)
        .map_err(not_found_is_parameter)?;
    ctx.vendor.fat_file = None;
    Ok(())
}

pub fn fat_info(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    let file = cdb.lba();
    let Some(entry) = ctx.storage.fat_file_info(file)? else {
        return Err(HandlerError::check_at(SenseKind::SectorNotFound, file));
    };
    ctx.vendor.fat_file = Some(file);
    ctx.bus.data_in_block(&entry.to_block())?;
    Ok(())
}

/// Reads blocks of the file last queried by VENDOR FAT INFO; the LBA field
/// is the first block
pub fn fat_read(ctx: &mut Context, cdb: &Cdb) -> HandlerResult {
    let Some(file) = ctx.vendor.fat_file else {
        return Err(HandlerError::check(SenseKind::InvalidParameter));
    };
    let start = cdb.lba();
    let mut block: Block = [0; BLOCK_SIZE];
    for n in start..start + cdb.blocks() {
        ctx.storage
            .read_fat_block(file, n, &mut block)
            .map_err(|e| HandlerError::storage_at(e, n))?;
        ctx.bus.data_in_block(&block)?;
    }
    Ok(())
}
