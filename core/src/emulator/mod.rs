//! Main poll loop

use std::sync::Arc;

use anyhow::Result;
use log::*;
use serde::Serialize;

use crate::bus::PinPort;
use crate::config::TargetConfig;
use crate::diag::Diagnostics;
use crate::reset::{ResetFlag, ResetMonitor, SharedState};
use crate::scsi::command::Dispatcher;
use crate::scsi::sequencer::{Abort, PhaseSequencer, Step};
use crate::storage::Storage;

/// Counters over the lifetime of an [`Emulator`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Bus transactions that ran through to MessageIn
    pub transactions: u64,
    /// Of those, the ones that ended in CHECK CONDITION
    pub check_conditions: u64,
    /// Recoveries after the host asserted RST
    pub resets: u64,
    /// Recoveries after the host stopped answering
    pub stalls: u64,
}

pub struct Emulator<P: PinPort, S: Storage> {
    sequencer: PhaseSequencer<P, S>,
    shared: Arc<SharedState>,
    stats: Stats,
}

/// Creates the state shared with interrupt context. A board driver (or the
/// virtual host) needs it before the port can be built.
pub fn shared_state(config: &TargetConfig) -> Arc<SharedState> {
    Arc::new(SharedState::new(config.debug))
}

impl<P: PinPort, S: Storage> Emulator<P, S> {
    pub fn new(
        config: TargetConfig,
        shared: Arc<SharedState>,
        port: P,
        storage: S,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "SCSI target {} ({} emulation, {} ACK polls per byte)",
            config.target_id, config.emulation, config.ack_attempts
        );

        let diag = Diagnostics::new(shared.clone());
        let dispatcher = Dispatcher::new(config, diag.clone());
        let sequencer =
            PhaseSequencer::new(port, storage, dispatcher, ResetFlag::new(shared.clone()), diag);
        Ok(Self {
            sequencer,
            shared,
            stats: Stats::default(),
        })
    }

    /// Handle for the RST/CONF edge interrupt
    pub fn reset_monitor(&self) -> ResetMonitor {
        ResetMonitor::new(self.shared.clone())
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn sequencer(&self) -> &PhaseSequencer<P, S> {
        &self.sequencer
    }

    pub fn sequencer_mut(&mut self) -> &mut PhaseSequencer<P, S> {
        &mut self.sequencer
    }

    /// Polls the bus once, running at most one transaction
    pub fn step(&mut self) -> Step {
        let step = self.sequencer.step();
        match step {
            Step::Idle => (),
            Step::Complete(outcome) => {
                self.stats.transactions += 1;
                if !outcome.is_good() {
                    self.stats.check_conditions += 1;
                }
            }
            Step::Recovered(Abort::HostReset) => self.stats.resets += 1,
            Step::Recovered(Abort::Stall) => self.stats.stalls += 1,
        }
        step
    }

    /// Steps until `stop` returns true
    pub fn run_until(&mut self, mut stop: impl FnMut(&Self) -> bool) {
        while !stop(self) {
            self.step();
        }
    }

    pub fn run(&mut self) -> ! {
        loop {
            self.step();
        }
    }
}
