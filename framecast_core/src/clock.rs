//! Frame clock and tick-cue gating.

use crate::command::TickCue;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Ticks proceed at the host's cadence
    Asynchronous,
    /// A tick completes only after a client tick-cue
    Synchronous,
}

impl ExecutionMode {
    pub fn from_synchronous(synchronous: bool) -> Self {
        if synchronous {
            ExecutionMode::Synchronous
        } else {
            ExecutionMode::Asynchronous
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Advanced { frame: u64 },
    Blocked,
}

impl TickOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, TickOutcome::Blocked)
    }
}

/// Owns the session's frame counter.
///
/// Only the tick thread touches the clock; the counter moves by exactly one
/// per advanced tick and is only ever lowered by [`FrameClock::reset`].
#[derive(Debug, Clone)]
pub struct FrameClock {
    base: u64,
    frame: u64,
    mode: ExecutionMode,
    fixed_delta: Option<f64>,
    elapsed_seconds: f64,
    last_delta: f64,
}

impl FrameClock {
    pub fn new(base: u64, mode: ExecutionMode, fixed_delta: Option<f64>) -> Self {
        Self {
            base,
            frame: base,
            mode,
            fixed_delta,
            elapsed_seconds: 0.0,
            last_delta: 0.0,
        }
    }

    /// Back to the base frame with zeroed timers.
    pub fn reset(&mut self) {
        self.frame = self.base;
        self.elapsed_seconds = 0.0;
        self.last_delta = 0.0;
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Ticks completed since the last reset.
    pub fn ticks(&self) -> u64 {
        self.frame - self.base
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        if mode != self.mode {
            debug!("Execution mode {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }
    }

    pub fn fixed_delta(&self) -> Option<f64> {
        self.fixed_delta
    }

    pub fn set_fixed_delta(&mut self, fixed_delta: Option<f64>) {
        self.fixed_delta = fixed_delta;
    }

    /// The step this session simulates for a host delta.
    pub fn effective_delta(&self, host_delta: f64) -> f64 {
        self.fixed_delta.unwrap_or(host_delta)
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_seconds
    }

    /// Step used by the last advanced tick.
    pub fn last_delta(&self) -> f64 {
        self.last_delta
    }

    /// Advances one frame unless synchronous mode is waiting for a cue.
    ///
    /// In asynchronous mode a stray cue is cleared so it cannot carry over
    /// into a later switch to synchronous mode.
    pub fn advance_if_ready(&mut self, host_delta: f64, cue: &mut TickCue) -> TickOutcome {
        match self.mode {
            ExecutionMode::Asynchronous => {
                cue.clear();
            }
            ExecutionMode::Synchronous => {
                if !cue.take() {
                    return TickOutcome::Blocked;
                }
            }
        }

        let delta = self.effective_delta(host_delta);
        self.frame += 1;
        self.elapsed_seconds += delta;
        self.last_delta = delta;
        TickOutcome::Advanced { frame: self.frame }
    }
}
