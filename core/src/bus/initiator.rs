//! Virtual SCSI initiator
//!
//! A [`PinPort`] that plays the host side of the bus. It reacts to the
//! target's pin accesses as they happen, so a whole command can be run
//! synchronously on one thread: queue [`HostCommand`]s, step the target
//! until [`VirtualInitiator::is_idle`], then collect the [`Transcript`]s.

use std::collections::VecDeque;

use super::{BusLine, PinPort};
use crate::handshake::Direction;
use crate::reset::ResetMonitor;
use crate::scsi::{BusPhase, CDB_LEN, MSG_IDENTIFY};

/// SCSI ID of the virtual host
pub const HOST_ID: u8 = 7;

/// NO OPERATION message, sent when MessageOut is entered without IDENTIFY
const MSG_NOP: u8 = 0x08;

/// One command as issued by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub target: u8,
    /// LUN sent in an IDENTIFY message (selects with ATN)
    pub identify: Option<u8>,
    pub cdb: [u8; CDB_LEN],
    /// Bytes offered during DataOut; zeroes are sent past the end
    pub data_out: Vec<u8>,
}

impl HostCommand {
    pub fn new(target: u8, cdb: [u8; CDB_LEN]) -> Self {
        Self {
            target,
            identify: None,
            cdb,
            data_out: vec![],
        }
    }

    pub fn with_identify(mut self, lun: u8) -> Self {
        self.identify = Some(lun);
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data_out = data;
        self
    }
}

/// Everything the host observed during one selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub command: HostCommand,
    /// Information transfer phases in the order they were entered
    pub phases: Vec<BusPhase>,
    pub command_bytes: usize,
    pub data_in: Vec<u8>,
    pub data_out_sent: usize,
    pub status: Option<u8>,
    pub message: Option<u8>,
    pub handshakes: usize,
}

impl Transcript {
    fn new(command: HostCommand) -> Self {
        Self {
            command,
            phases: vec![],
            command_bytes: 0,
            data_in: vec![],
            data_out_sent: 0,
            status: None,
            message: None,
            handshakes: 0,
        }
    }
}

/// Injected host misbehaviour, keyed on the handshake number within the
/// current selection (0 is the first REQ)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Never answer this REQ
    StallAt(usize),
    /// Assert RST instead of answering this REQ
    ResetAt(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraceEntry {
    pub phase: Option<BusPhase>,
    pub direction: Direction,
    pub val: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostState {
    Idle,
    Selecting,
    Connected,
    /// Echoes every byte received back on the next host-to-target REQ
    Loopback,
}

pub struct VirtualInitiator {
    /// Pin levels (`true` = high) of every line, whoever drives it
    levels: [bool; BusLine::COUNT],
    target_drives_data: bool,
    target_data: u8,
    host_data: Option<u8>,

    state: HostState,
    queue: VecDeque<HostCommand>,
    current: Option<Transcript>,
    done: Vec<Transcript>,
    cmd_pos: usize,
    out_pos: usize,
    loopback_last: u8,

    fault: Option<Fault>,
    stalled: bool,
    handshakes: usize,
    monitor: Option<ResetMonitor>,

    trace: Vec<TraceEntry>,
    trace_enabled: bool,
    ack_polls: usize,
}

impl VirtualInitiator {
    pub fn new() -> Self {
        Self {
            levels: [true; BusLine::COUNT],
            target_drives_data: false,
            target_data: 0xFF,
            host_data: None,
            state: HostState::Idle,
            queue: VecDeque::new(),
            current: None,
            done: vec![],
            cmd_pos: 0,
            out_pos: 0,
            loopback_last: 0,
            fault: None,
            stalled: false,
            handshakes: 0,
            monitor: None,
            trace: vec![],
            trace_enabled: false,
            ack_polls: 0,
        }
    }

    /// A peer that answers every REQ and echoes back what it last received
    pub fn loopback() -> Self {
        Self {
            state: HostState::Loopback,
            ..Self::new()
        }
    }

    /// Connects the RST output of the host to the target's reset monitor
    pub fn with_reset_monitor(mut self, monitor: ResetMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn queue(&mut self, cmd: HostCommand) {
        self.queue.push_back(cmd);
    }

    pub fn set_fault(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    /// No command in flight and nothing queued
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && matches!(self.state, HostState::Idle | HostState::Loopback)
    }

    pub fn take_transcripts(&mut self) -> Vec<Transcript> {
        std::mem::take(&mut self.done)
    }

    pub fn reset_trace(&mut self) {
        self.trace.clear();
        self.trace_enabled = true;
    }

    pub fn get_trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Number of times the target has sampled ACK
    pub fn ack_polls(&self) -> usize {
        self.ack_polls
    }

    /// Line state as seen by the host (`true` = asserted)
    pub fn asserted(&self, line: BusLine) -> bool {
        !self.levels[line.index()]
    }

    fn drive(&mut self, line: BusLine, asserted: bool) {
        self.levels[line.index()] = !asserted;
    }

    fn phase(&self) -> Option<BusPhase> {
        BusPhase::from_flags(
            self.asserted(BusLine::Msg),
            self.asserted(BusLine::Cd),
            self.asserted(BusLine::Io),
        )
    }

    fn start_selection(&mut self) {
        if self.state != HostState::Idle || !self.levels[BusLine::Bsy.index()] {
            return;
        }
        let Some(cmd) = self.queue.pop_front() else {
            return;
        };
        self.host_data = Some(!((1 << (cmd.target & 7)) | (1 << HOST_ID)));
        self.drive(BusLine::Atn, cmd.identify.is_some());
        self.drive(BusLine::Sel, true);
        self.cmd_pos = 0;
        self.out_pos = 0;
        self.handshakes = 0;
        self.current = Some(Transcript::new(cmd));
        self.state = HostState::Selecting;
    }

    fn on_bsy(&mut self, asserted: bool) {
        match (self.state, asserted) {
            (HostState::Selecting, true) => {
                self.drive(BusLine::Sel, false);
                self.host_data = None;
                self.state = HostState::Connected;
            }
            (HostState::Connected | HostState::Selecting, false) => {
                if let Some(t) = self.current.take() {
                    self.done.push(t);
                }
                for line in [BusLine::Sel, BusLine::Atn, BusLine::Ack, BusLine::Rst] {
                    self.drive(line, false);
                }
                self.host_data = None;
                self.stalled = false;
                self.state = HostState::Idle;
            }
            _ => (),
        }
    }

    fn on_req(&mut self) {
        if self.stalled {
            return;
        }
        let phase = self.phase();
        let handshake = self.handshakes;

        match self.fault {
            Some(Fault::StallAt(n)) if n == handshake => {
                self.fault = None;
                self.stalled = true;
                return;
            }
            Some(Fault::ResetAt(n)) if n == handshake => {
                self.fault = None;
                self.stalled = true;
                self.drive(BusLine::Rst, true);
                if let Some(monitor) = &self.monitor {
                    monitor.on_rst_edge();
                }
                return;
            }
            _ => (),
        }

        let (direction, val) = if self.asserted(BusLine::Io) {
            let val = if self.target_drives_data {
                !self.target_data
            } else {
                0
            };
            self.receive(phase, val);
            (Direction::In, val)
        } else {
            let val = self.next_out(phase);
            self.host_data = Some(!val);
            (Direction::Out, val)
        };

        self.handshakes += 1;
        if let Some(t) = self.current.as_mut() {
            t.handshakes += 1;
        }
        if self.trace_enabled {
            self.trace.push(TraceEntry {
                phase,
                direction,
                val,
            });
        }
        self.drive(BusLine::Ack, true);
    }

    fn receive(&mut self, phase: Option<BusPhase>, val: u8) {
        self.loopback_last = val;
        let Some(t) = self.current.as_mut() else {
            return;
        };
        Self::note_phase(t, phase);
        match phase {
            Some(BusPhase::DataIn) => t.data_in.push(val),
            Some(BusPhase::Status) => t.status = Some(val),
            Some(BusPhase::MessageIn) => t.message = Some(val),
            _ => (),
        }
    }

    fn next_out(&mut self, phase: Option<BusPhase>) -> u8 {
        if self.state == HostState::Loopback {
            return self.loopback_last;
        }
        let Some(t) = self.current.as_mut() else {
            return 0;
        };
        Self::note_phase(t, phase);
        match phase {
            Some(BusPhase::Command) => {
                let val = t.command.cdb.get(self.cmd_pos).copied().unwrap_or(0);
                self.cmd_pos += 1;
                t.command_bytes += 1;
                val
            }
            Some(BusPhase::DataOut) => {
                let val = t.command.data_out.get(self.out_pos).copied().unwrap_or(0);
                self.out_pos += 1;
                t.data_out_sent += 1;
                val
            }
            Some(BusPhase::MessageOut) => {
                let msg = t
                    .command
                    .identify
                    .map_or(MSG_NOP, |lun| MSG_IDENTIFY | (lun & 7));
                self.levels[BusLine::Atn.index()] = true;
                msg
            }
            _ => 0,
        }
    }

    fn note_phase(t: &mut Transcript, phase: Option<BusPhase>) {
        if let Some(p) = phase {
            if t.phases.last() != Some(&p) {
                t.phases.push(p);
            }
        }
    }
}

impl PinPort for VirtualInitiator {
    fn set_level(&mut self, line: BusLine, high: bool) {
        let was = self.levels[line.index()];
        self.levels[line.index()] = high;
        if was == high {
            return;
        }
        match line {
            BusLine::Req if !high => self.on_req(),
            BusLine::Req => self.drive(BusLine::Ack, false),
            BusLine::Bsy => self.on_bsy(!high),
            _ => (),
        }
    }

    fn level(&mut self, line: BusLine) -> bool {
        match line {
            BusLine::Sel => self.start_selection(),
            BusLine::Ack => self.ack_polls += 1,
            _ => (),
        }
        self.levels[line.index()]
    }

    fn set_databus_output(&mut self, output: bool) {
        self.target_drives_data = output;
    }

    fn write_databus_raw(&mut self, val: u8) {
        self.target_data = val;
    }

    fn read_databus_raw(&mut self) -> u8 {
        if self.target_drives_data {
            self.target_data
        } else {
            self.host_data.unwrap_or(0xFF)
        }
    }
}
