//! Mode parameter list, persisted per LUN as its descriptor

use crate::handshake::BLOCK_SIZE;

/// Length of the parameter list exchanged by MODE SENSE / MODE SELECT
pub const DESCRIPTOR_LEN: usize = 22;

/// Sectors per track assumed when deriving a geometry from a capacity
pub const SECTORS_PER_TRACK: u32 = 33;

const MAX_HEADS: u32 = 15;

/// Capacity given to a LUN that is formatted before any descriptor exists
/// (10 MiB)
pub const DEFAULT_BLOCKS: u32 = 40_960;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LunDescriptor {
    pub density: u8,
    /// Capacity in blocks (24 bits)
    pub blocks: u32,
    /// Block length in bytes (24 bits)
    pub block_size: u32,
    pub list_format: u8,
    pub cylinders: u16,
    pub heads: u8,
    pub reduced_write_current: u16,
    pub write_precomp: u16,
    pub landing_zone: u8,
    pub step_rate: u8,
}

impl LunDescriptor {
    /// Derives a plausible drive geometry for a capacity in blocks
    pub fn for_capacity(blocks: u32) -> Self {
        let blocks = blocks.min(0xFF_FFFF);
        let heads = (1..=MAX_HEADS)
            .find(|h| blocks.div_ceil(h * SECTORS_PER_TRACK) <= u32::from(u16::MAX))
            .unwrap_or(MAX_HEADS);
        let cylinders = blocks.div_ceil(heads * SECTORS_PER_TRACK);

        Self {
            density: 0,
            blocks,
            block_size: BLOCK_SIZE as u32,
            list_format: 1,
            cylinders: cylinders.min(u32::from(u16::MAX)) as u16,
            heads: heads as u8,
            reduced_write_current: 128,
            write_precomp: 128,
            landing_zone: 0,
            step_rate: 1,
        }
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut result = [0; DESCRIPTOR_LEN];

        // 0..4 Header: reserved, reserved, reserved, block descriptor length
        result[3] = 8;

        // 4..12 Block descriptor
        result[4] = self.density;
        result[5..8].copy_from_slice(&self.blocks.to_be_bytes()[1..]);
        result[9..12].copy_from_slice(&self.block_size.to_be_bytes()[1..]);

        // 12..22 Drive parameter list
        result[12] = self.list_format;
        result[13..15].copy_from_slice(&self.cylinders.to_be_bytes());
        result[15] = self.heads;
        result[16..18].copy_from_slice(&self.reduced_write_current.to_be_bytes());
        result[18..20].copy_from_slice(&self.write_precomp.to_be_bytes());
        result[20] = self.landing_zone;
        result[21] = self.step_rate;

        result
    }

    pub fn from_bytes(data: &[u8; DESCRIPTOR_LEN]) -> Self {
        let be24 = |b: &[u8]| u32::from_be_bytes([0, b[0], b[1], b[2]]);
        let be16 = |b: &[u8]| u16::from_be_bytes([b[0], b[1]]);

        Self {
            density: data[4],
            blocks: be24(&data[5..8]),
            block_size: be24(&data[9..12]),
            list_format: data[12],
            cylinders: be16(&data[13..15]),
            heads: data[15],
            reduced_write_current: be16(&data[16..18]),
            write_precomp: be16(&data[18..20]),
            landing_zone: data[20],
            step_rate: data[21],
        }
    }

    /// Overlays a (possibly short) parameter list sent by the host onto
    /// this descriptor
    pub fn merge(&self, data: &[u8]) -> Self {
        let mut bytes = self.to_bytes();
        let len = data.len().min(DESCRIPTOR_LEN);
        bytes[..len].copy_from_slice(&data[..len]);
        Self::from_bytes(&bytes)
    }
}

impl Default for LunDescriptor {
    fn default() -> Self {
        Self::for_capacity(DEFAULT_BLOCKS)
    }
}
