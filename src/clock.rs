//! The simulation clock: the single authority for "now".

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::types::SimTime;

/// How simulated time is stepped during a run.
///
/// - **EventDriven**: jump straight to the next due event, skipping idle time.
/// - **Fixed**: additionally emit a periodic tick every `step_us`, giving
///   uniform sampling of all pin levels. Protocol continuations still fire at
///   their exact due times in between ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimestepMode {
    #[default]
    EventDriven,
    Fixed {
        /// Tick period in microseconds
        step_us: SimTime,
    },
}

impl TimestepMode {
    /// Returns the tick period if this is fixed-timestep mode.
    pub fn step(&self) -> Option<SimTime> {
        match self {
            TimestepMode::Fixed { step_us } => Some(*step_us),
            TimestepMode::EventDriven => None,
        }
    }
}

/// Deterministic simulated-time source.
#[derive(Clone, Debug)]
pub struct Clock {
    now: SimTime,
    mode: TimestepMode,
}

impl Clock {
    /// Creates a clock at time zero.
    pub fn new(mode: TimestepMode) -> Self {
        Self { now: 0, mode }
    }

    /// Returns the current simulation time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Returns the stepping mode of this run.
    pub fn mode(&self) -> TimestepMode {
        self.mode
    }

    /// Moves time forward to `t`.
    ///
    /// Moving backwards is a scheduling bug and fails with
    /// [`SimError::TimeOrderViolation`]. Advancing to the current time is a
    /// no-op.
    pub fn advance_to(&mut self, t: SimTime) -> SimResult<()> {
        if t < self.now {
            return Err(SimError::TimeOrderViolation {
                now: self.now,
                requested: t,
            });
        }
        self.now = t;
        Ok(())
    }
}
