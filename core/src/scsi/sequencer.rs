//! Phase sequencer
//!
//! Drives one bus transaction at a time: selection, optional IDENTIFY,
//! command, whatever data the handler moves, status, message and back to
//! bus free. The reset flag is checked at every phase boundary. Seeing it
//! set abandons the transaction without status and runs the recovery path.

use log::*;

use crate::bus::{BusLine, PinPort};
use crate::diag::{DebugCategory, Diagnostics};
use crate::handshake::{Block, Direction, Handshake, TransportError};
use crate::reset::ResetFlag;
use crate::scsi::command::{CommandOutcome, DataPhase, Dispatcher};
use crate::scsi::{BusPhase, CDB_LEN, Cdb, MSG_COMMAND_COMPLETE, MSG_IDENTIFY};
use crate::storage::Storage;

/// What one [`PhaseSequencer::step`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Not selected
    Idle,
    /// A transaction ran to completion
    Complete(CommandOutcome),
    /// The transaction was abandoned and the target recovered
    Recovered(Abort),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    /// The host asserted RST
    HostReset,
    /// The host stopped answering
    Stall,
}

/// Handshake plus the phase currently signalled to the host
pub struct PhaseBus<P: PinPort> {
    hs: Handshake<P>,
    phase: BusPhase,
    diag: Diagnostics,
}

impl<P: PinPort> PhaseBus<P> {
    pub fn new(hs: Handshake<P>, diag: Diagnostics) -> Self {
        Self {
            hs,
            phase: BusPhase::Free,
            diag,
        }
    }

    pub fn phase(&self) -> BusPhase {
        self.phase
    }

    pub fn handshake(&self) -> &Handshake<P> {
        &self.hs
    }

    pub fn handshake_mut(&mut self) -> &mut Handshake<P> {
        &mut self.hs
    }

    /// Moves to `phase`, signalling it on MSG, C/D and I/O if it is an
    /// information transfer phase
    fn enter(&mut self, phase: BusPhase) {
        if self.phase == phase {
            return;
        }
        if self.diag.enabled(DebugCategory::State) {
            debug!(
                target: DebugCategory::State.target(),
                "Phase {} -> {}",
                <&str>::from(self.phase),
                <&str>::from(phase)
            );
        }
        if let Some((msg, cd, io)) = phase.flags() {
            self.hs.set_phase_flags(msg, cd, io);
        }
        self.phase = phase;
    }

    fn release(&mut self) {
        self.hs.release_all();
        self.enter(BusPhase::Free);
    }
}

impl<P: PinPort> DataPhase for PhaseBus<P> {
    fn data_in(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if data.is_empty() {
            return Ok(());
        }
        self.enter(BusPhase::DataIn);
        for &b in data {
            self.hs.write_byte(b)?;
        }
        Ok(())
    }

    fn data_out(&mut self, data: &mut [u8]) -> Result<(), TransportError> {
        if data.is_empty() {
            return Ok(());
        }
        self.enter(BusPhase::DataOut);
        for b in &mut *data {
            *b = self.hs.read_byte()?;
        }
        Ok(())
    }

    fn data_in_block(&mut self, block: &Block) -> Result<(), TransportError> {
        self.enter(BusPhase::DataIn);
        let mut buffer = *block;
        self.hs.transfer_block_checked(Direction::In, &mut buffer)
    }

    fn data_out_block(&mut self, block: &mut Block) -> Result<(), TransportError> {
        self.enter(BusPhase::DataOut);
        self.hs.transfer_block_checked(Direction::Out, block)
    }
}

pub struct PhaseSequencer<P: PinPort, S: Storage> {
    bus: PhaseBus<P>,
    storage: S,
    dispatcher: Dispatcher,
    reset: ResetFlag,
    diag: Diagnostics,
    target_id: u8,
    identify_required: bool,
    /// Set when a stall (rather than RST) raised the reset flag
    stalled: bool,
    bus_free_entries: u64,
}

impl<P: PinPort, S: Storage> PhaseSequencer<P, S> {
    pub fn new(
        port: P,
        storage: S,
        dispatcher: Dispatcher,
        reset: ResetFlag,
        diag: Diagnostics,
    ) -> Self {
        let config = dispatcher.config();
        let target_id = config.target_id & 7;
        let identify_required = config.identify_required;
        let hs = Handshake::new(port, reset.clone(), config.ack_attempts);

        let mut bus = PhaseBus::new(hs, diag.clone());
        bus.release();
        Self {
            bus,
            storage,
            dispatcher,
            reset,
            diag,
            target_id,
            identify_required,
            stalled: false,
            bus_free_entries: 0,
        }
    }

    pub fn phase(&self) -> BusPhase {
        self.bus.phase()
    }

    /// Number of times the bus was returned to BusFree
    pub fn bus_free_entries(&self) -> u64 {
        self.bus_free_entries
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn port(&self) -> &P {
        self.bus.handshake().port()
    }

    pub fn port_mut(&mut self) -> &mut P {
        self.bus.handshake_mut().port_mut()
    }

    /// Runs at most one bus transaction
    pub fn step(&mut self) -> Step {
        if self.reset.is_raised() {
            return Step::Recovered(self.recover());
        }
        if !self.selected() {
            return Step::Idle;
        }

        match self.transaction() {
            Ok(outcome) => {
                self.bus_free();
                Step::Complete(outcome)
            }
            Err(e) => {
                if matches!(e, TransportError::Stalled { .. }) {
                    self.stalled = true;
                }
                Step::Recovered(self.recover())
            }
        }
    }

    /// SEL is asserted and our ID is on the data bus
    fn selected(&mut self) -> bool {
        let signals = self.bus.hs.signals_mut();
        if !signals.read_line(BusLine::Sel) || signals.read_line(BusLine::Bsy) {
            return false;
        }
        signals.read_databus() & (1 << self.target_id) != 0
    }

    fn transaction(&mut self) -> Result<CommandOutcome, TransportError> {
        self.bus.enter(BusPhase::Selection);
        self.bus.hs.set_busy(true);
        self.bus.hs.wait_line(BusLine::Sel, false)?;
        let atn = self.bus.hs.signals_mut().read_line(BusLine::Atn);

        let mut identified = None;
        if atn {
            self.bus.enter(BusPhase::MessageOut);
            let msg = self.bus.hs.read_byte()?;
            if msg & MSG_IDENTIFY != 0 {
                identified = Some(msg & 7);
            } else {
                debug!("Ignoring message {:02X} after selection", msg);
            }
        }
        self.check_reset()?;

        let outcome = match identified {
            Some(lun) if !self.storage.lun_exists(lun) => {
                if self.diag.enabled(DebugCategory::State) {
                    debug!(
                        target: DebugCategory::State.target(),
                        "IDENTIFY for missing LUN {}",
                        lun
                    );
                }
                self.dispatcher.reject_lun(lun)
            }
            None if self.identify_required => self.dispatcher.reject_lun(0),
            _ => {
                let cdb = self.read_cdb()?;
                let lun = identified.unwrap_or_else(|| cdb.lun());
                self.dispatcher
                    .dispatch(&cdb, lun, &mut self.storage, &mut self.bus)
            }
        };
        if let Some(TransportError::Stalled { .. }) = outcome.transport {
            self.stalled = true;
        }
        self.check_reset()?;

        self.bus.enter(BusPhase::Status);
        self.bus.hs.write_byte(outcome.status)?;
        self.check_reset()?;

        self.bus.enter(BusPhase::MessageIn);
        self.bus.hs.write_byte(MSG_COMMAND_COMPLETE)?;
        Ok(outcome)
    }

    fn read_cdb(&mut self) -> Result<Cdb, TransportError> {
        self.bus.enter(BusPhase::Command);
        let mut cdb = [0; CDB_LEN];
        for b in &mut cdb {
            *b = self.bus.hs.read_byte()?;
        }
        Ok(Cdb(cdb))
    }

    fn check_reset(&self) -> Result<(), TransportError> {
        if self.reset.is_raised() {
            Err(TransportError::Reset)
        } else {
            Ok(())
        }
    }

    fn bus_free(&mut self) {
        self.bus.release();
        self.bus_free_entries += 1;
    }

    /// Single recovery path for host resets and stalls
    fn recover(&mut self) -> Abort {
        let cause = if std::mem::take(&mut self.stalled) {
            Abort::Stall
        } else {
            Abort::HostReset
        };
        self.bus.hs.release_all();
        self.storage.reset();
        self.dispatcher.reset();
        self.bus_free();
        self.reset.clear();

        match cause {
            Abort::Stall => warn!("Host stopped responding, bus reset"),
            Abort::HostReset => info!("Host bus reset"),
        }
        cause
    }
}
