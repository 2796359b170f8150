//! Target configuration

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::diag::DebugFlags;
use crate::handshake::DEFAULT_ACK_ATTEMPTS;
use crate::scsi::sense::SenseTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
/// Which host driver the target is set up for
pub enum EmulationMode {
    /// Plain fixed disk
    #[default]
    Fixed,
    /// Fixed disk plus the laser-disc filing system F-code commands
    LvDos,
}

impl EmulationMode {
    /// Character appended to the INQUIRY revision
    pub const fn tag(self) -> u8 {
        match self {
            Self::Fixed => b'F',
            Self::LvDos => b'L',
        }
    }
}

/// Identification strings returned by INQUIRY
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InquiryStrings {
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl InquiryStrings {
    pub const VENDOR_LEN: usize = 8;
    pub const PRODUCT_LEN: usize = 16;
    /// The fourth revision byte carries the emulation mode
    pub const REVISION_LEN: usize = 3;
}

impl Default for InquiryStrings {
    fn default() -> Self {
        Self {
            vendor: "LCSCSI".to_string(),
            product: "VIRTUAL DISK".to_string(),
            revision: format!(
                "{}.{}",
                env!("CARGO_PKG_VERSION_MAJOR"),
                env!("CARGO_PKG_VERSION_MINOR")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Our SCSI ID (0-7)
    pub target_id: u8,
    pub emulation: EmulationMode,
    /// Poll bound for every ACK wait during a block transfer
    pub ack_attempts: u32,
    /// Treat selections without ATN/IDENTIFY as addressing a missing LUN
    pub identify_required: bool,
    pub inquiry: InquiryStrings,
    pub sense: SenseTable,
    pub debug: DebugFlags,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            target_id: 0,
            emulation: EmulationMode::Fixed,
            ack_attempts: DEFAULT_ACK_ATTEMPTS,
            identify_required: false,
            inquiry: InquiryStrings::default(),
            sense: SenseTable::default(),
            debug: DebugFlags(0),
        }
    }
}

impl TargetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_id > 7 {
            bail!("Target ID {} out of range (0-7)", self.target_id);
        }
        if self.ack_attempts == 0 {
            bail!("ack_attempts must be non-zero");
        }
        for (name, val, max) in [
            ("vendor", &self.inquiry.vendor, InquiryStrings::VENDOR_LEN),
            ("product", &self.inquiry.product, InquiryStrings::PRODUCT_LEN),
            ("revision", &self.inquiry.revision, InquiryStrings::REVISION_LEN),
        ] {
            if val.len() > max || !val.is_ascii() {
                bail!("Inquiry {} '{}' must be at most {} ASCII characters", name, val, max);
            }
        }
        Ok(())
    }
}
