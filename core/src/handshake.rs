//! REQ/ACK handshake primitives
//!
//! Byte transfers wait for the host without a bound other than the reset
//! flag. Block transfers additionally bound every ACK wait by a number of
//! poll attempts: a host that stops responding is treated as if it reset
//! the bus.

use thiserror::Error;

use crate::bus::{BusLine, PinPort, Signals};
use crate::reset::ResetFlag;

/// Size of a block transfer
pub const BLOCK_SIZE: usize = 256;

/// Default bound on ACK polls per byte within a block transfer
pub const DEFAULT_ACK_ATTEMPTS: u32 = 100_000;

pub type Block = [u8; BLOCK_SIZE];

/// Direction of a block transfer, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Target to host
    In,
    /// Host to target
    Out,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("host reset")]
    Reset,
    #[error("host stalled after {transferred} bytes")]
    Stalled { transferred: usize },
}

/// Outcome of an ACK wait
enum Wait {
    Done,
    Reset,
    TimedOut,
}

pub struct Handshake<P: PinPort> {
    signals: Signals<P>,
    reset: ResetFlag,
    ack_attempts: u32,
}

impl<P: PinPort> Handshake<P> {
    pub fn new(port: P, reset: ResetFlag, ack_attempts: u32) -> Self {
        Self {
            signals: Signals::new(port),
            reset,
            ack_attempts: ack_attempts.max(1),
        }
    }

    pub fn reset_flag(&self) -> &ResetFlag {
        &self.reset
    }

    pub fn signals(&self) -> &Signals<P> {
        &self.signals
    }

    pub fn signals_mut(&mut self) -> &mut Signals<P> {
        &mut self.signals
    }

    pub fn port(&self) -> &P {
        self.signals.port()
    }

    pub fn port_mut(&mut self) -> &mut P {
        self.signals.port_mut()
    }

    /// Waits for ACK to reach `asserted`. `limit` of `None` waits for as
    /// long as the reset flag stays clear.
    fn wait_ack(&mut self, asserted: bool, limit: Option<u32>) -> Wait {
        let mut attempts = 0;
        loop {
            if self.signals.read_line(BusLine::Ack) == asserted {
                return Wait::Done;
            }
            if self.reset.is_raised() {
                return Wait::Reset;
            }
            if let Some(limit) = limit {
                attempts += 1;
                if attempts >= limit {
                    return Wait::TimedOut;
                }
            }
        }
    }

    /// Reads a byte from the host
    pub fn read_byte(&mut self) -> Result<u8, TransportError> {
        self.signals.set_line(BusLine::Req, true);
        if let Wait::Reset = self.wait_ack(true, None) {
            self.signals.set_line(BusLine::Req, false);
            return Err(TransportError::Reset);
        }
        self.signals.set_line(BusLine::Req, false);
        let val = self.signals.read_databus();

        match self.wait_ack(false, None) {
            Wait::Reset => Err(TransportError::Reset),
            _ => Ok(val),
        }
    }

    /// Writes a byte to the host. The data bus must already be an output.
    pub fn write_byte(&mut self, val: u8) -> Result<(), TransportError> {
        debug_assert!(self.signals.databus_is_output());

        self.signals.write_databus(val);
        self.signals.set_line(BusLine::Req, true);
        let wait = self.wait_ack(true, None);
        self.signals.set_line(BusLine::Req, false);
        if let Wait::Reset = wait {
            return Err(TransportError::Reset);
        }

        match self.wait_ack(false, None) {
            Wait::Reset => Err(TransportError::Reset),
            _ => Ok(()),
        }
    }

    /// Moves one block in the given direction. Returns the number of bytes
    /// that completed their handshake; anything short of [`BLOCK_SIZE`]
    /// means the transfer was abandoned and the reset flag is set.
    pub fn transfer_block(&mut self, direction: Direction, buffer: &mut Block) -> usize {
        match self.move_block(direction, buffer) {
            Ok(()) => BLOCK_SIZE,
            Err((done, _)) => done,
        }
    }

    /// Like [`Self::transfer_block`] but reports a short transfer as an error
    pub fn transfer_block_checked(
        &mut self,
        direction: Direction,
        buffer: &mut Block,
    ) -> Result<(), TransportError> {
        self.move_block(direction, buffer).map_err(|(_, e)| e)
    }

    fn move_block(
        &mut self,
        direction: Direction,
        buffer: &mut Block,
    ) -> Result<(), (usize, TransportError)> {
        let limit = Some(self.ack_attempts);

        for (done, byte) in buffer.iter_mut().enumerate() {
            if direction == Direction::In {
                self.signals.write_databus(*byte);
            }
            self.signals.set_line(BusLine::Req, true);

            let wait = self.wait_ack(true, limit);
            if !matches!(wait, Wait::Done) {
                self.signals.set_line(BusLine::Req, false);
                return Err(self.abandon(done, &wait));
            }

            if direction == Direction::Out {
                *byte = self.signals.read_databus();
            }
            self.signals.set_line(BusLine::Req, false);

            let wait = self.wait_ack(false, limit);
            if !matches!(wait, Wait::Done) {
                // The byte itself made it across
                return Err(self.abandon(done + 1, &wait));
            }
        }
        Ok(())
    }

    fn abandon(&mut self, transferred: usize, wait: &Wait) -> (usize, TransportError) {
        match wait {
            Wait::TimedOut => {
                self.reset.raise();
                (transferred, TransportError::Stalled { transferred })
            }
            _ => (transferred, TransportError::Reset),
        }
    }

    /// Sets the MSG, C/D and I/O lines and turns the data bus around to
    /// match I/O. Only called at phase boundaries.
    pub fn set_phase_flags(
        &mut self,
        message: bool,
        command_not_data: bool,
        input_not_output: bool,
    ) {
        // Data bus goes to input before the host is told it may drive it
        if !input_not_output {
            self.signals.set_databus_direction(false);
        }
        self.signals.set_line(BusLine::Msg, message);
        self.signals.set_line(BusLine::Cd, command_not_data);
        self.signals.set_line(BusLine::Io, input_not_output);
        if input_not_output {
            self.signals.set_databus_direction(true);
        }
    }

    pub fn set_busy(&mut self, asserted: bool) {
        self.signals.set_line(BusLine::Bsy, asserted);
    }

    /// Waits, interruptibly and bounded, for a host line to reach a state.
    /// A timeout raises the reset flag.
    pub fn wait_line(&mut self, line: BusLine, asserted: bool) -> Result<(), TransportError> {
        for _ in 0..self.ack_attempts {
            if self.signals.read_line(line) == asserted {
                return Ok(());
            }
            if self.reset.is_raised() {
                return Err(TransportError::Reset);
            }
        }
        self.reset.raise();
        Err(TransportError::Stalled { transferred: 0 })
    }

    pub fn release_all(&mut self) {
        self.signals.release_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bus::initiator::{Fault, VirtualInitiator};
    use crate::reset::{ResetMonitor, SharedState};

    fn handshake(
        peer: VirtualInitiator,
        attempts: u32,
    ) -> (Handshake<VirtualInitiator>, ResetFlag) {
        let shared = Arc::new(SharedState::default());
        let flag = ResetFlag::new(shared.clone());
        let peer = peer.with_reset_monitor(ResetMonitor::new(shared));
        (Handshake::new(peer, flag.clone(), attempts), flag)
    }

    #[test]
    fn byte_roundtrip() {
        let (mut hs, _) = handshake(VirtualInitiator::loopback(), 100);

        for val in [0x00, 0x5A, 0xA5, 0xFF] {
            hs.set_phase_flags(false, false, true);
            hs.write_byte(val).unwrap();
            hs.set_phase_flags(false, false, false);
            assert_eq!(hs.read_byte().unwrap(), val);
        }
    }

    #[test]
    fn req_released_after_byte() {
        let (mut hs, _) = handshake(VirtualInitiator::loopback(), 100);
        hs.set_phase_flags(false, false, true);
        hs.write_byte(1).unwrap();
        assert!(!hs.port().asserted(BusLine::Req));
        assert!(!hs.port().asserted(BusLine::Ack));
    }

    #[test]
    fn block_in() {
        let (mut hs, flag) = handshake(VirtualInitiator::loopback(), 100);
        hs.port_mut().reset_trace();
        hs.set_phase_flags(false, false, true);

        let mut block = [0u8; BLOCK_SIZE];
        for (i, b) in block.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(hs.transfer_block(Direction::In, &mut block), BLOCK_SIZE);
        assert!(!flag.is_raised());

        let trace = hs.port().get_trace();
        assert_eq!(trace.len(), BLOCK_SIZE);
        for (i, t) in trace.iter().enumerate() {
            assert_eq!(t.direction, Direction::In);
            assert_eq!(t.val, i as u8);
        }
    }

    #[test]
    fn block_out() {
        let (mut hs, _) = handshake(VirtualInitiator::loopback(), 100);
        hs.set_phase_flags(false, false, true);
        hs.write_byte(0x3C).unwrap();
        hs.set_phase_flags(false, false, false);

        let mut block = [0u8; BLOCK_SIZE];
        assert_eq!(hs.transfer_block(Direction::Out, &mut block), BLOCK_SIZE);
        assert!(block.iter().all(|&b| b == 0x3C));
    }

    #[test]
    fn block_stall_sets_reset_once() {
        let mut peer = VirtualInitiator::loopback();
        peer.set_fault(Fault::StallAt(10));
        let (mut hs, flag) = handshake(peer, 50);
        hs.set_phase_flags(false, false, true);

        let mut block = [0xEEu8; BLOCK_SIZE];
        let transferred = hs.transfer_block(Direction::In, &mut block);
        assert_eq!(transferred, 10);
        assert!(transferred < BLOCK_SIZE);
        assert!(flag.clear());
        assert!(!flag.is_raised());
        assert!(!hs.port().asserted(BusLine::Req));
    }

    #[test]
    fn block_stall_checked() {
        let mut peer = VirtualInitiator::loopback();
        peer.set_fault(Fault::StallAt(0));
        let (mut hs, _) = handshake(peer, 8);
        hs.set_phase_flags(false, false, false);

        let mut block = [0u8; BLOCK_SIZE];
        assert_eq!(
            hs.transfer_block_checked(Direction::Out, &mut block),
            Err(TransportError::Stalled { transferred: 0 })
        );
    }

    #[test]
    fn stall_is_bounded_by_attempts() {
        let mut peer = VirtualInitiator::loopback();
        peer.set_fault(Fault::StallAt(0));
        let (mut hs, _) = handshake(peer, 1000);
        hs.set_phase_flags(false, false, true);

        let mut block = [0u8; BLOCK_SIZE];
        hs.transfer_block(Direction::In, &mut block);
        assert_eq!(hs.port().ack_polls(), 1000);
    }

    #[test]
    fn reset_aborts_read_byte() {
        let mut peer = VirtualInitiator::loopback();
        peer.set_fault(Fault::ResetAt(0));
        let (mut hs, flag) = handshake(peer, 100);
        hs.set_phase_flags(false, true, false);

        assert_eq!(hs.read_byte(), Err(TransportError::Reset));
        assert!(flag.is_raised());
        assert!(hs.port().ack_polls() <= 2);
        assert!(!hs.port().asserted(BusLine::Req));
    }

    #[test]
    fn reset_aborts_write_byte() {
        let (mut hs, flag) = handshake(VirtualInitiator::loopback(), 100);
        hs.set_phase_flags(false, true, true);
        hs.port_mut().set_fault(Fault::ResetAt(0));

        assert_eq!(hs.write_byte(0x02), Err(TransportError::Reset));
        assert!(flag.is_raised());
    }

    #[test]
    fn raised_flag_aborts_immediately() {
        let mut peer = VirtualInitiator::loopback();
        peer.set_fault(Fault::StallAt(0));
        let (mut hs, flag) = handshake(peer, 100);
        flag.raise();

        hs.set_phase_flags(false, false, true);
        assert_eq!(hs.write_byte(0), Err(TransportError::Reset));
        let mut block = [0u8; BLOCK_SIZE];
        assert_eq!(hs.transfer_block(Direction::In, &mut block), 0);
        assert!(hs.port().ack_polls() <= 2);
    }

    #[test]
    fn wait_line_bounded() {
        let (mut hs, flag) = handshake(VirtualInitiator::loopback(), 20);
        assert_eq!(hs.wait_line(BusLine::Sel, false), Ok(()));
        assert!(!flag.is_raised());

        assert_eq!(
            hs.wait_line(BusLine::Sel, true),
            Err(TransportError::Stalled { transferred: 0 })
        );
        assert!(flag.clear());
        flag.raise();
        assert_eq!(hs.wait_line(BusLine::Sel, true), Err(TransportError::Reset));
    }

    #[test]
    fn phase_flags_switch_direction() {
        let (mut hs, _) = handshake(VirtualInitiator::loopback(), 100);

        hs.set_phase_flags(true, true, true);
        assert!(hs.port().asserted(BusLine::Msg));
        assert!(hs.port().asserted(BusLine::Cd));
        assert!(hs.port().asserted(BusLine::Io));
        assert!(hs.signals().databus_is_output());

        hs.set_phase_flags(false, false, false);
        assert!(!hs.port().asserted(BusLine::Msg));
        assert!(!hs.port().asserted(BusLine::Cd));
        assert!(!hs.port().asserted(BusLine::Io));
        assert!(!hs.signals().databus_is_output());
    }
}
