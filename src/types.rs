//! Core type definitions for the simulation kernel.
//!
//! This module defines the identifiers shared by every controller, the event
//! bus and the trace format.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Simulation time in microseconds since epoch-zero.
///
/// Every signal sample, scheduled event and trace record uses the same
/// `SimTime` representation, giving one timeline for all controllers.
pub type SimTime = u64;

/// Identifier of an I2C or SPI bus (e.g. `1` for `/dev/i2c-1`).
pub type BusId = u8;

/// Identifier of a UART port.
pub type PortId = u8;

/// Identifier of a bus transaction, unique within one kernel.
pub type TransactionId = u64;

/// Identifier of an attached device model, unique within one kernel.
pub type DeviceId = u32;

/// Logical pin identity: the BCM GPIO number.
///
/// Physical header positions are resolved to a `PinId` by the board table,
/// so both addressing schemes land on the same pin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinId(pub u8);

impl PinId {
    /// Returns the BCM number of this pin.
    pub fn bcm(self) -> u8 {
        self.0
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO{}", self.0)
    }
}

/// A pin address as supplied by a driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinAddress {
    /// BCM (Broadcom SoC) GPIO number.
    Bcm(u8),
    /// Physical position on the 40-pin header (1-40).
    Physical(u8),
}

impl From<PinId> for PinAddress {
    fn from(pin: PinId) -> Self {
        PinAddress::Bcm(pin.0)
    }
}

impl fmt::Display for PinAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinAddress::Bcm(n) => write!(f, "BCM {}", n),
            PinAddress::Physical(n) => write!(f, "physical pin {}", n),
        }
    }
}

/// A bus or port that pins can be bound to and controllers can own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusRef {
    I2c(BusId),
    Spi(BusId),
    Uart(PortId),
    Pwm(u8),
}

impl fmt::Display for BusRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusRef::I2c(id) => write!(f, "i2c{}", id),
            BusRef::Spi(id) => write!(f, "spi{}", id),
            BusRef::Uart(id) => write!(f, "uart{}", id),
            BusRef::Pwm(id) => write!(f, "pwm{}", id),
        }
    }
}

/// The controller that drives (owns) a pin or bus.
///
/// Ownership is tracked by id in the pin registry, never by reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerId {
    Gpio,
    Pwm,
    I2c(BusId),
    Spi(BusId),
    Uart(PortId),
    /// A driver outside the kernel (user code, a device model).
    External(u32),
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerId::Gpio => write!(f, "gpio"),
            ControllerId::Pwm => write!(f, "pwm"),
            ControllerId::I2c(id) => write!(f, "i2c{}", id),
            ControllerId::Spi(id) => write!(f, "spi{}", id),
            ControllerId::Uart(id) => write!(f, "uart{}", id),
            ControllerId::External(id) => write!(f, "external{}", id),
        }
    }
}

/// Rounds `numerator / denominator` up, never returning less than 1.
///
/// Used to turn bus frequencies into whole-microsecond bit times.
pub(crate) fn ceil_div_min1(numerator: u64, denominator: u64) -> SimTime {
    if denominator == 0 {
        return 1;
    }
    ((numerator + denominator - 1) / denominator).max(1)
}
