//! Sense data
//!
//! The target reports non-extended (4-byte) sense. Which code byte is used
//! for each condition comes from a [`SenseTable`] so it can be matched to
//! whatever the host driver expects.

use serde::{Deserialize, Serialize};

use crate::scsi::MAX_LUNS;
use crate::storage::StorageError;

/// Length of the sense block returned by REQUEST SENSE
pub const SENSE_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::EnumIter)]
pub enum SenseKind {
    NoSense,
    NotReady,
    MediumError,
    SectorNotFound,
    InvalidCommand,
    IllegalBlockAddress,
    InvalidParameter,
    InvalidLun,
    TransferAborted,
}

impl From<StorageError> for SenseKind {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => Self::SectorNotFound,
            StorageError::NotReady | StorageError::NoMedia => Self::NotReady,
            StorageError::Io | StorageError::ReadOnly => Self::MediumError,
            StorageError::OutOfRange => Self::IllegalBlockAddress,
        }
    }
}

/// Error code byte per sense condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenseTable {
    pub no_sense: u8,
    pub not_ready: u8,
    pub medium_error: u8,
    pub sector_not_found: u8,
    pub invalid_command: u8,
    pub illegal_block_address: u8,
    pub invalid_parameter: u8,
    pub invalid_lun: u8,
    pub transfer_aborted: u8,
}

impl Default for SenseTable {
    fn default() -> Self {
        Self {
            no_sense: 0x00,
            not_ready: 0x04,
            medium_error: 0x11,
            sector_not_found: 0x14,
            invalid_command: 0x20,
            illegal_block_address: 0x21,
            invalid_parameter: 0x24,
            invalid_lun: 0x25,
            transfer_aborted: 0x1A,
        }
    }
}

impl SenseTable {
    pub const fn code(&self, kind: SenseKind) -> u8 {
        match kind {
            SenseKind::NoSense => self.no_sense,
            SenseKind::NotReady => self.not_ready,
            SenseKind::MediumError => self.medium_error,
            SenseKind::SectorNotFound => self.sector_not_found,
            SenseKind::InvalidCommand => self.invalid_command,
            SenseKind::IllegalBlockAddress => self.illegal_block_address,
            SenseKind::InvalidParameter => self.invalid_parameter,
            SenseKind::InvalidLun => self.invalid_lun,
            SenseKind::TransferAborted => self.transfer_aborted,
        }
    }
}

/// The last error recorded for a LUN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub kind: SenseKind,
    /// Block the error relates to, if any
    pub lba: Option<u32>,
}

impl SenseData {
    pub const fn new(kind: SenseKind) -> Self {
        Self { kind, lba: None }
    }

    pub const fn at(kind: SenseKind, lba: u32) -> Self {
        Self {
            kind,
            lba: Some(lba),
        }
    }

    pub fn to_bytes(self, lun: u8, table: &SenseTable) -> [u8; SENSE_LEN] {
        let lba = self.lba.unwrap_or(0) & 0x1F_FFFF;
        let valid = if self.lba.is_some() { 0x80 } else { 0 };
        [
            valid | (table.code(self.kind) & 0x7F),
            ((lun & 7) << 5) | (lba >> 16) as u8,
            (lba >> 8) as u8,
            lba as u8,
        ]
    }
}

/// Per-LUN sense slots
#[derive(Debug, Default)]
pub struct SenseStore {
    slots: [Option<SenseData>; MAX_LUNS],
}

impl SenseStore {
    pub fn set(&mut self, lun: u8, sense: SenseData) {
        self.slots[usize::from(lun & 7)] = Some(sense);
    }

    pub fn clear(&mut self, lun: u8) {
        self.slots[usize::from(lun & 7)] = None;
    }

    pub fn get(&self, lun: u8) -> Option<SenseData> {
        self.slots[usize::from(lun & 7)]
    }

    /// Returns and clears the sense for a LUN
    pub fn take(&mut self, lun: u8) -> Option<SenseData> {
        self.slots[usize::from(lun & 7)].take()
    }

    pub fn clear_all(&mut self) {
        self.slots = Default::default();
    }
}
