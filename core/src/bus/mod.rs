//! Signal layer
//!
//! All SCSI lines are active-low on the wire. [`PinPort`] is the electrical
//! view (levels, `true` = high) implemented by a board driver or a test
//! double; [`Signals`] performs the inversion and exposes the logical view
//! (`true` = asserted) the rest of the core is written against.

pub mod initiator;

use serde::{Deserialize, Serialize};

/// A named SCSI control line
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::IntoStaticStr,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
pub enum BusLine {
    Rst,
    Sel,
    Bsy,
    Req,
    Ack,
    Msg,
    Cd,
    Io,
    Atn,
}

impl BusLine {
    pub const COUNT: usize = 9;

    /// Lines driven by the target. All others are inputs.
    pub const fn is_output(self) -> bool {
        matches!(self, Self::Bsy | Self::Req | Self::Msg | Self::Cd | Self::Io)
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Electrical access to the bus lines and the 8-bit data bus.
///
/// Levels are raw pin levels (`true` = high = released). Implementations do
/// not invert anything.
pub trait PinPort {
    fn set_level(&mut self, line: BusLine, high: bool);
    fn level(&mut self, line: BusLine) -> bool;

    /// Switches the data bus pins between output (`true`) and input
    fn set_databus_output(&mut self, output: bool);
    fn write_databus_raw(&mut self, val: u8);
    fn read_databus_raw(&mut self) -> u8;
}

/// Logical view of the bus. Cannot fail.
pub struct Signals<P: PinPort> {
    port: P,
    databus_output: bool,
}

impl<P: PinPort> Signals<P> {
    pub fn new(mut port: P) -> Self {
        port.set_databus_output(false);
        Self {
            port,
            databus_output: false,
        }
    }

    pub fn set_line(&mut self, line: BusLine, asserted: bool) {
        debug_assert!(line.is_output(), "{:?} is not a target output", line);
        self.port.set_level(line, !asserted);
    }

    pub fn read_line(&mut self, line: BusLine) -> bool {
        !self.port.level(line)
    }

    pub fn set_databus_direction(&mut self, output: bool) {
        if self.databus_output != output {
            self.databus_output = output;
            self.port.set_databus_output(output);
        }
    }

    pub fn databus_is_output(&self) -> bool {
        self.databus_output
    }

    pub fn write_databus(&mut self, val: u8) {
        self.port.write_databus_raw(!val);
    }

    pub fn read_databus(&mut self) -> u8 {
        !self.port.read_databus_raw()
    }

    /// Releases every target output and turns the data bus around to input
    pub fn release_all(&mut self) {
        self.set_databus_direction(false);
        for line in [BusLine::Req, BusLine::Msg, BusLine::Cd, BusLine::Io, BusLine::Bsy] {
            self.set_line(line, false);
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}
