//! Kernel error taxonomy.
//!
//! Recoverable, caller-facing conditions (configuration mistakes, contention)
//! are returned as typed results. Invariant violations are also returned as
//! `SimError` values but are marked fatal: nothing inside the kernel catches
//! or retries them, and drivers are expected to stop the run.
//!
//! Protocol outcomes such as a NACK, a UART framing error or an overrun are
//! *not* errors; they are delivered as transaction outcomes and events.

use thiserror::Error;

use crate::config::ConfigError;
use crate::trace::TraceError;
use crate::types::{BusId, BusRef, ControllerId, PinAddress, PinId, SimTime, TransactionId};

/// Errors returned by the simulation kernel.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("unknown pin: {0}")]
    UnknownPin(PinAddress),

    #[error("unknown bus: {0}")]
    UnknownBus(BusRef),

    #[error("{pin} does not support mode {mode}")]
    UnsupportedMode { pin: PinId, mode: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("operation '{operation}' is not valid for {pin} in mode {mode}")]
    InvalidOperationForMode {
        pin: PinId,
        mode: String,
        operation: &'static str,
    },

    #[error("{resource} is owned by {owner}, {requester} cannot drive it")]
    PinOwnershipConflict {
        resource: String,
        owner: ControllerId,
        requester: ControllerId,
    },

    #[error("{pin} has a transaction in flight; mode change refused")]
    ModeChangeWhileBusy { pin: PinId },

    #[error("spi{bus}: chip select {requested} requested while {active} is selected")]
    ChipSelectConflict { bus: BusId, active: u8, requested: u8 },

    #[error("{bus}: address {address:#x} already has a device")]
    AddressInUse { bus: BusRef, address: u16 },

    #[error("time order violation: clock at {now}, asked to move to {requested}")]
    TimeOrderViolation { now: SimTime, requested: SimTime },

    #[error("cannot schedule at {requested}, clock already at {now}")]
    PastScheduling { now: SimTime, requested: SimTime },

    #[error("transaction {0} is finalized and cannot be modified")]
    TransactionFinalized(TransactionId),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
}

impl SimError {
    /// Returns true for internal-consistency failures that indicate a kernel
    /// bug. The run must halt; these are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimError::TimeOrderViolation { .. }
                | SimError::PastScheduling { .. }
                | SimError::TransactionFinalized(_)
        )
    }

    /// Returns true for contention errors the caller may resolve by retrying
    /// later or releasing a resource.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            SimError::PinOwnershipConflict { .. } | SimError::ChipSelectConflict { .. }
        )
    }
}

/// Result type for kernel operations.
pub type SimResult<T> = Result<T, SimError>;
