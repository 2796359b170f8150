//! Storage collaborator
//!
//! The SCSI core never touches files itself. Everything it persists or
//! retrieves goes through [`Storage`], addressed by LUN and 256-byte block.

pub mod image;
pub mod ram;

use thiserror::Error;

use crate::handshake::{BLOCK_SIZE, Block};
use crate::scsi::descriptor::LunDescriptor;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("no such LUN or file")]
    NotFound,
    #[error("LUN not ready")]
    NotReady,
    #[error("no media mounted")]
    NoMedia,
    #[error("I/O error")]
    Io,
    #[error("block address out of range")]
    OutOfRange,
    #[error("medium is read-only")]
    ReadOnly,
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::ReadOnly,
            _ => Self::Io,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Length of the per-LUN user code
pub const USER_CODE_LEN: usize = 5;

pub type UserCode = [u8; USER_CODE_LEN];

/// Directory entry in the FAT transfer area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatEntry {
    pub name: String,
    pub size: u32,
    pub is_dir: bool,
}

impl FatEntry {
    /// Longest name that fits in an info block with its terminator
    pub const MAX_NAME: usize = BLOCK_SIZE - 6;

    /// Info block as returned by VENDOR FAT INFO
    pub fn to_block(&self) -> Block {
        let mut block = [0; BLOCK_SIZE];
        block[0..4].copy_from_slice(&self.size.to_be_bytes());
        block[4] = u8::from(self.is_dir);
        let name = self.name.as_bytes();
        let len = name.len().min(Self::MAX_NAME);
        block[5..5 + len].copy_from_slice(&name[..len]);
        block
    }
}

/// Backing store for the emulated LUNs
pub trait Storage {
    fn lun_exists(&self, lun: u8) -> bool;

    /// Exists and is spun up
    fn lun_ready(&self, lun: u8) -> bool {
        self.lun_exists(lun)
    }

    fn lun_size_in_blocks(&self, lun: u8) -> u32;

    fn read_sector(&mut self, lun: u8, lba: u32, buffer: &mut Block) -> StorageResult<()>;

    fn write_sector(&mut self, lun: u8, lba: u32, buffer: &Block) -> StorageResult<()>;

    /// Mode parameter list for a LUN. Stores without persisted descriptors
    /// derive one from the capacity.
    fn read_descriptor(&mut self, lun: u8) -> StorageResult<LunDescriptor> {
        if !self.lun_exists(lun) {
            return Err(StorageError::NotFound);
        }
        Ok(LunDescriptor::for_capacity(self.lun_size_in_blocks(lun)))
    }

    fn write_descriptor(&mut self, _lun: u8, _descriptor: &LunDescriptor) -> StorageResult<()> {
        Err(StorageError::ReadOnly)
    }

    /// (Re)creates the LUN image at the size its descriptor names, every byte
    /// set to `pattern`. A LUN without a descriptor gets
    /// [`LunDescriptor::default`].
    fn format_lun(&mut self, lun: u8, pattern: u8) -> StorageResult<()>;

    /// Owner code stored alongside the LUN. All zero if none is set.
    fn lun_user_code(&self, _lun: u8) -> UserCode {
        [0; USER_CODE_LEN]
    }

    /// START/STOP UNIT
    fn set_lun_ready(&mut self, lun: u8, ready: bool) -> StorageResult<()> {
        let _ = ready;
        if self.lun_exists(lun) {
            Ok(())
        } else {
            Err(StorageError::NotFound)
        }
    }

    /// Called from reset recovery; closes anything held open
    fn reset(&mut self) {}

    /// Currently selected LUN directory
    fn lun_directory(&self) -> u8 {
        0
    }

    fn set_lun_directory(&mut self, directory: u8) -> StorageResult<()> {
        if directory == 0 {
            Ok(())
        } else {
            Err(StorageError::NotFound)
        }
    }

    /// Selects a directory within the FAT transfer area
    fn set_fat_directory(&mut self, _path: &str) -> StorageResult<()> {
        Err(StorageError::NoMedia)
    }

    /// Entry `file` of the current FAT directory, `None` past the end
    fn fat_file_info(&mut self, _file: u32) -> StorageResult<Option<FatEntry>> {
        Err(StorageError::NoMedia)
    }

    /// Reads block `block` of entry `file` of the current FAT directory
    fn read_fat_block(
        &mut self,
        _file: u32,
        _block: u32,
        _buffer: &mut Block,
    ) -> StorageResult<()> {
        Err(StorageError::NoMedia)
    }
}
