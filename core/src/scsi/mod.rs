//! SCSI target emulation
//!
//! ## Bus phases and transitions
//! ```mermaid
//! stateDiagram-v2
//!     [*] --> Free
//!
//!     Free --> Selection : SEL + our ID
//!     Selection --> MessageOut : ATN (IDENTIFY)
//!     Selection --> Command : Assert BSY, C/D, REQ
//!     MessageOut --> Command : LUN present
//!     MessageOut --> Status : LUN not present
//!     Command --> DataIn : handler sends data
//!     Command --> DataOut : handler receives data
//!     Command --> Status
//!     DataIn --> Status
//!     DataOut --> Status
//!     Status --> MessageIn : Status byte
//!     MessageIn --> Free : Release BSY (Command complete)
//!
//!     StateChange --> Free: Reset (Release all signals)
//! ```

pub mod command;
pub mod descriptor;
pub mod handlers;
pub mod sense;
pub mod sequencer;
pub mod vendor;

use serde::{Deserialize, Serialize};

pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;

pub const MSG_COMMAND_COMPLETE: u8 = 0x00;

/// Bit 7 of a message byte marks an IDENTIFY message
pub const MSG_IDENTIFY: u8 = 0x80;

/// Number of addressable logical units
pub const MAX_LUNS: usize = 8;

/// Length of every supported command
pub const CDB_LEN: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
/// SCSI bus phases
pub enum BusPhase {
    Free,
    Selection,
    Command,
    /// Initiator -> Target
    DataOut,
    /// Target -> Initiator
    DataIn,
    Status,
    MessageOut,
    MessageIn,
}

impl BusPhase {
    /// (MSG, C/D, I/O) for the information transfer phases
    pub const fn flags(self) -> Option<(bool, bool, bool)> {
        match self {
            Self::DataOut => Some((false, false, false)),
            Self::DataIn => Some((false, false, true)),
            Self::Command => Some((false, true, false)),
            Self::Status => Some((false, true, true)),
            Self::MessageOut => Some((true, true, false)),
            Self::MessageIn => Some((true, true, true)),
            Self::Free | Self::Selection => None,
        }
    }

    /// Decodes the phase signalled by (MSG, C/D, I/O)
    pub const fn from_flags(msg: bool, cd: bool, io: bool) -> Option<Self> {
        match (msg, cd, io) {
            (false, false, false) => Some(Self::DataOut),
            (false, false, true) => Some(Self::DataIn),
            (false, true, false) => Some(Self::Command),
            (false, true, true) => Some(Self::Status),
            (true, true, false) => Some(Self::MessageOut),
            (true, true, true) => Some(Self::MessageIn),
            // Reserved combinations
            (true, false, _) => None,
        }
    }
}

/// Group 0 command descriptor block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Cdb(pub [u8; CDB_LEN]);

impl Cdb {
    pub const fn opcode(&self) -> u8 {
        self.0[0]
    }

    /// Command group (opcode bits 7-5)
    pub const fn group(&self) -> u8 {
        self.0[0] >> 5
    }

    /// LUN selector (byte 1 bits 7-5)
    pub const fn lun(&self) -> u8 {
        self.0[1] >> 5
    }

    /// 21-bit logical block address
    pub const fn lba(&self) -> u32 {
        (((self.0[1] & 0x1F) as u32) << 16) | ((self.0[2] as u32) << 8) | self.0[3] as u32
    }

    /// Raw transfer length / allocation length byte
    pub const fn length(&self) -> u8 {
        self.0[4]
    }

    /// Transfer length in blocks, where 0 means 256
    pub const fn blocks(&self) -> u32 {
        match self.0[4] {
            0 => 256,
            n => n as u32,
        }
    }

    pub const fn control(&self) -> u8 {
        self.0[5]
    }
}

impl std::fmt::Display for Cdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X?}", self.0)
    }
}
