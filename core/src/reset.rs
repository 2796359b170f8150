//! Reset monitor and the state shared with interrupt context
//!
//! Exactly one asynchronous context exists: the falling-edge notification
//! of the RST (and CONF) lines. It only ever writes to [`SharedState`]; the
//! poll loop is the sole reader.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use log::*;

use crate::diag::DebugFlags;

/// State crossing the interrupt/poll boundary
#[derive(Debug, Default)]
pub struct SharedState {
    reset: AtomicBool,
    debug: AtomicU8,
}

impl SharedState {
    pub const fn new(debug: DebugFlags) -> Self {
        Self {
            reset: AtomicBool::new(false),
            debug: AtomicU8::new(debug.0),
        }
    }

    pub fn debug_flags(&self) -> DebugFlags {
        DebugFlags(self.debug.load(Ordering::Relaxed))
    }

    pub fn set_debug_flags(&self, flags: DebugFlags) {
        self.debug.store(flags.0, Ordering::Relaxed);
    }
}

/// Handle to the host reset flag, polled by every blocking wait
#[derive(Debug, Clone)]
pub struct ResetFlag {
    shared: Arc<SharedState>,
}

impl ResetFlag {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    pub fn raise(&self) {
        self.shared.reset.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.shared.reset.load(Ordering::Acquire)
    }

    /// Clears the flag, returning whether it was set
    pub fn clear(&self) -> bool {
        self.shared.reset.swap(false, Ordering::AcqRel)
    }
}

/// Interrupt-side observer of the RST and CONF lines.
///
/// A board driver calls these from its edge interrupt handler. Neither
/// touches anything but [`SharedState`].
#[derive(Debug, Clone)]
pub struct ResetMonitor {
    shared: Arc<SharedState>,
}

impl ResetMonitor {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    /// Host asserted RST
    pub fn on_rst_edge(&self) {
        self.shared.reset.store(true, Ordering::Release);
    }

    /// Host asserted CONF; `databus` is the logical data bus value carrying
    /// the configuration command
    pub fn on_conf_edge(&self, databus: u8) {
        let flags = self.shared.debug_flags();
        match flags.apply_command(databus) {
            Some(new) => self.shared.set_debug_flags(new),
            None => trace!("Ignoring configuration command {}", databus),
        }
    }
}
