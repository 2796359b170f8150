//! Command dispatcher
//!
//! Commands are looked up by opcode in a static table. Each entry carries
//! the handler that decodes the rest of the CDB and moves any data through
//! a [`DataPhase`].

use log::*;
use thiserror::Error;

use crate::config::{EmulationMode, TargetConfig};
use crate::diag::{DebugCategory, Diagnostics};
use crate::handshake::{Block, TransportError};
use crate::scsi::sense::{SenseData, SenseKind, SenseStore};
use crate::scsi::vendor::VendorState;
use crate::scsi::{Cdb, STATUS_CHECK_CONDITION, STATUS_GOOD, handlers, vendor};
use crate::storage::{Storage, StorageError};

/// Data transfer sub-phases, as driven by the phase sequencer
pub trait DataPhase {
    /// Sends bytes to the host in DataIn
    fn data_in(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Receives bytes from the host in DataOut
    fn data_out(&mut self, data: &mut [u8]) -> Result<(), TransportError>;

    /// Sends one block using the bounded block transfer
    fn data_in_block(&mut self, block: &Block) -> Result<(), TransportError>;

    /// Receives one block using the bounded block transfer
    fn data_out_block(&mut self, block: &mut Block) -> Result<(), TransportError>;
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
    #[error("check condition ({:?})", .0.kind)]
    Check(SenseData),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HandlerError {
    pub const fn check(kind: SenseKind) -> Self {
        Self::Check(SenseData::new(kind))
    }

    pub const fn check_at(kind: SenseKind, lba: u32) -> Self {
        Self::Check(SenseData::at(kind, lba))
    }

    /// Maps a storage failure concerning block `lba`
    pub fn storage_at(err: StorageError, lba: u32) -> Self {
        Self::check_at(err.into(), lba)
    }
}

impl From<StorageError> for HandlerError {
    fn from(err: StorageError) -> Self {
        Self::check(err.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Everything a handler may touch while running one command
pub struct Context<'a> {
    pub lun: u8,
    pub storage: &'a mut dyn Storage,
    pub bus: &'a mut dyn DataPhase,
    pub sense: &'a mut SenseStore,
    pub vendor: &'a mut VendorState,
    pub config: &'a TargetConfig,
    pub diag: &'a Diagnostics,
}

impl Context<'_> {
    /// Fails with NotReady unless the addressed LUN is spun up
    pub fn require_ready(&self) -> HandlerResult {
        if self.storage.lun_ready(self.lun) {
            Ok(())
        } else {
            Err(HandlerError::check(SenseKind::NotReady))
        }
    }

    /// Fails unless `count` blocks starting at `lba` lie within the LUN
    pub fn require_range(&self, lba: u32, count: u32) -> HandlerResult {
        let size = self.storage.lun_size_in_blocks(self.lun);
        if u64::from(lba) + u64::from(count) > u64::from(size) {
            Err(HandlerError::check_at(SenseKind::IllegalBlockAddress, lba))
        } else {
            Ok(())
        }
    }
}

pub type Handler = fn(&mut Context, &Cdb) -> HandlerResult;

pub struct CommandSpec {
    pub opcode: u8,
    pub name: &'static str,
    /// Fails with InvalidLun if the addressed LUN does not exist
    pub needs_lun: bool,
    /// Only accepted in [`EmulationMode::LvDos`]
    pub lvdos_only: bool,
    pub handler: Handler,
}

macro_rules! command {
    ($opcode:expr, $name:expr, $handler:path) => {
        command!($opcode, $name, $handler, needs_lun: true, lvdos_only: false)
    };
    ($opcode:expr, $name:expr, $handler:path, needs_lun: $lun:expr, lvdos_only: $lv:expr) => {
        CommandSpec {
            opcode: $opcode,
            name: $name,
            needs_lun: $lun,
            lvdos_only: $lv,
            handler: $handler,
        }
    };
}

pub static COMMANDS: &[CommandSpec] = &[
    command!(0x00, "TEST UNIT READY", handlers::test_unit_ready),
    command!(0x01, "REZERO UNIT", handlers::rezero_unit),
    command!(0x03, "REQUEST SENSE", handlers::request_sense, needs_lun: false, lvdos_only: false),
    // Both may address a LUN that has no image yet
    command!(0x04, "FORMAT UNIT", handlers::format_unit, needs_lun: false, lvdos_only: false),
    command!(0x08, "READ(6)", handlers::read6),
    command!(0x0A, "WRITE(6)", handlers::write6),
    command!(0x0B, "SEEK", handlers::seek),
    command!(0x0E, "SELECT", handlers::select),
    command!(0x0F, "TRANSLATE", handlers::translate),
    command!(0x12, "INQUIRY", handlers::inquiry, needs_lun: false, lvdos_only: false),
    command!(0x13, "VERIFY", handlers::verify),
    command!(0x15, "MODE SELECT", handlers::mode_select, needs_lun: false, lvdos_only: false),
    command!(0x1A, "MODE SENSE", handlers::mode_sense),
    command!(0x1B, "START/STOP UNIT", handlers::start_stop),
    command!(0xC8, "READ F-CODE", vendor::read_fcode, needs_lun: true, lvdos_only: true),
    command!(0xCA, "WRITE F-CODE", vendor::write_fcode, needs_lun: true, lvdos_only: true),
    command!(0xD0, "VENDOR SENSE", vendor::vendor_sense, needs_lun: false, lvdos_only: false),
    command!(0xD1, "VENDOR SELECT", vendor::vendor_select, needs_lun: false, lvdos_only: false),
    command!(0xD2, "VENDOR FAT PATH", vendor::fat_path, needs_lun: false, lvdos_only: false),
    command!(0xD3, "VENDOR FAT INFO", vendor::fat_info, needs_lun: false, lvdos_only: false),
    command!(0xD4, "VENDOR FAT READ", vendor::fat_read, needs_lun: false, lvdos_only: false),
];

pub fn lookup(opcode: u8) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.opcode == opcode)
}

/// Result of running one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: u8,
    /// Sense recorded for the LUN, if the command failed
    pub sense: Option<SenseData>,
    /// Set if a data transfer was cut short
    pub transport: Option<TransportError>,
}

impl CommandOutcome {
    pub const GOOD: Self = Self {
        status: STATUS_GOOD,
        sense: None,
        transport: None,
    };

    pub const fn is_good(&self) -> bool {
        self.status == STATUS_GOOD
    }
}

pub struct Dispatcher {
    config: TargetConfig,
    sense: SenseStore,
    vendor: VendorState,
    diag: Diagnostics,
}

impl Dispatcher {
    pub fn new(config: TargetConfig, diag: Diagnostics) -> Self {
        Self {
            config,
            sense: SenseStore::default(),
            vendor: VendorState::default(),
            diag,
        }
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn sense(&self) -> &SenseStore {
        &self.sense
    }

    pub fn vendor(&self) -> &VendorState {
        &self.vendor
    }

    /// Runs one command against `lun`
    pub fn dispatch(
        &mut self,
        cdb: &Cdb,
        lun: u8,
        storage: &mut dyn Storage,
        bus: &mut dyn DataPhase,
    ) -> CommandOutcome {
        let lun = lun & 7;
        let spec = lookup(cdb.opcode());

        if self.diag.enabled(DebugCategory::Commands) {
            debug!(
                target: DebugCategory::Commands.target(),
                "LUN {} {} [{}]",
                lun,
                spec.map_or("(unknown)", |s| s.name),
                cdb
            );
        }

        let result = match spec {
            None => Err(HandlerError::check(SenseKind::InvalidCommand)),
            Some(s) if s.lvdos_only && self.config.emulation != EmulationMode::LvDos => {
                Err(HandlerError::check(SenseKind::InvalidCommand))
            }
            Some(s) if s.needs_lun && !storage.lun_exists(lun) => {
                Err(HandlerError::check(SenseKind::InvalidLun))
            }
            Some(s) => {
                let mut ctx = Context {
                    lun,
                    storage,
                    bus,
                    sense: &mut self.sense,
                    vendor: &mut self.vendor,
                    config: &self.config,
                    diag: &self.diag,
                };
                (s.handler)(&mut ctx, cdb)
            }
        };

        self.complete(lun, spec.map_or("(unknown)", |s| s.name), result)
    }

    /// Fails a selection of a LUN that does not exist, without any command
    pub fn reject_lun(&mut self, lun: u8) -> CommandOutcome {
        self.complete(lun & 7, "selection", Err(HandlerError::check(SenseKind::InvalidLun)))
    }

    fn complete(&mut self, lun: u8, name: &str, result: HandlerResult) -> CommandOutcome {
        let (sense, transport) = match result {
            Ok(()) => {
                self.sense.clear(lun);
                return CommandOutcome::GOOD;
            }
            Err(HandlerError::Check(sense)) => (sense, None),
            Err(HandlerError::Transport(e)) => {
                warn!("{} on LUN {} aborted: {}", name, lun, e);
                (SenseData::new(SenseKind::TransferAborted), Some(e))
            }
        };

        if self.diag.enabled(DebugCategory::Commands) {
            debug!(
                target: DebugCategory::Commands.target(),
                "{} on LUN {} failed: {:?}{}",
                name,
                lun,
                sense.kind,
                sense.lba.map(|l| format!(" at block {}", l)).unwrap_or_default()
            );
        }
        self.sense.set(lun, sense);
        CommandOutcome {
            status: STATUS_CHECK_CONDITION,
            sense: Some(sense),
            transport,
        }
    }

    /// Drops all sense and vendor state after a host reset
    pub fn reset(&mut self) {
        self.sense.clear_all();
        self.vendor = VendorState::default();
    }
}
