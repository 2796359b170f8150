//! Diagnostic sink
//!
//! Debug output is plain `log` output, gated per category by flags that the
//! host can change at run time through the CONF line.

use std::sync::Arc;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::reset::SharedState;

bitfield! {
    /// Enabled debug categories
    #[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DebugFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub filesystem: bool @ 0,
        pub scsi_commands: bool @ 1,
        pub scsi_blocks: bool @ 2,
        pub scsi_fcodes: bool @ 3,
        pub scsi_state: bool @ 4,
        pub fatfs: bool @ 5,
    }
}

/// Commands read from the data bus on a CONF edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ConfCommand {
    AllOff = 0,
    AllOn = 1,
    FilesystemOn = 10,
    FilesystemOff = 11,
    CommandsOn = 12,
    CommandsOff = 13,
    BlocksOn = 14,
    BlocksOff = 15,
    FcodesOn = 16,
    FcodesOff = 17,
    StateOn = 18,
    StateOff = 19,
    FatFsOn = 20,
    FatFsOff = 21,
}

impl DebugFlags {
    pub const ALL: Self = Self(0b11_1111);

    /// Applies a configuration command as sent over the CONF line.
    /// Returns `None` for unknown commands.
    pub fn apply_command(self, cmd: u8) -> Option<Self> {
        Some(match ConfCommand::from_u8(cmd)? {
            ConfCommand::AllOff => Self(0),
            // Block dumps are far too noisy to be part of 'all on'
            ConfCommand::AllOn => Self::ALL.with_scsi_blocks(false),
            ConfCommand::FilesystemOn => self.with_filesystem(true),
            ConfCommand::FilesystemOff => self.with_filesystem(false),
            ConfCommand::CommandsOn => self.with_scsi_commands(true),
            ConfCommand::CommandsOff => self.with_scsi_commands(false),
            ConfCommand::BlocksOn => self.with_scsi_blocks(true),
            ConfCommand::BlocksOff => self.with_scsi_blocks(false),
            ConfCommand::FcodesOn => self.with_scsi_fcodes(true),
            ConfCommand::FcodesOff => self.with_scsi_fcodes(false),
            ConfCommand::StateOn => self.with_scsi_state(true),
            ConfCommand::StateOff => self.with_scsi_state(false),
            ConfCommand::FatFsOn => self.with_fatfs(true),
            ConfCommand::FatFsOff => self.with_fatfs(false),
        })
    }

    pub fn enabled(self, category: DebugCategory) -> bool {
        match category {
            DebugCategory::Filesystem => self.filesystem(),
            DebugCategory::Commands => self.scsi_commands(),
            DebugCategory::Blocks => self.scsi_blocks(),
            DebugCategory::Fcodes => self.scsi_fcodes(),
            DebugCategory::State => self.scsi_state(),
            DebugCategory::FatFs => self.fatfs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter)]
pub enum DebugCategory {
    Filesystem,
    Commands,
    Blocks,
    Fcodes,
    State,
    /// FAT transfer area
    FatFs,
}

impl DebugCategory {
    /// `log` target used for this category
    pub const fn target(self) -> &'static str {
        match self {
            Self::Filesystem => "lcscsi::fs",
            Self::Commands => "lcscsi::cmd",
            Self::Blocks => "lcscsi::block",
            Self::Fcodes => "lcscsi::fcode",
            Self::State => "lcscsi::state",
            Self::FatFs => "lcscsi::fatfs",
        }
    }
}

/// Cheap, cloneable handle used at observation points
#[derive(Debug, Clone)]
pub struct Diagnostics {
    shared: Arc<SharedState>,
}

impl Diagnostics {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    pub fn enabled(&self, category: DebugCategory) -> bool {
        self.shared.debug_flags().enabled(category)
    }

    /// Dumps a buffer at debug level if the category is enabled
    pub fn dump(&self, category: DebugCategory, title: &str, data: &[u8]) {
        let target = category.target();
        if self.enabled(category) && log::log_enabled!(target: target, log::Level::Debug) {
            log::debug!(target: target, "{} ({} bytes)\n{}", title, data.len(), hexdump(data));
        }
    }
}

/// Formats a buffer as rows of 16 bytes with an offset column
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4);
    for (row, chunk) in data.chunks(16).enumerate() {
        if row > 0 {
            out.push('\n');
        }
        out.push_str(&format!("{:04X}:", row * 16));
        for b in chunk {
            out.push(' ');
            out.push_str(&hex::encode_upper([*b]));
        }
    }
    out
}
