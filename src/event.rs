//! Event definitions for the simulation kernel.
//!
//! Every state change in the kernel (a pin level, a finished bus transfer, a
//! UART line error) is published as an [`Event`]. Events are immutable once
//! created; the event bus fans them out to subscribers, the trace recorder
//! serializes them, and the replayer re-publishes them.

use serde::{Deserialize, Serialize};

use crate::controllers::spi::SpiSettings;
use crate::controllers::uart::{UartErrorKind, UartSettings};
use crate::pins::{PinMode, Pull};
use crate::signal::{Edge, EdgeDetect};
use crate::transaction::BusTransaction;
use crate::types::{BusId, BusRef, DeviceId, PinId, PortId, SimTime};

/// Event topics subscribers can filter on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// A pin's signal changed level
    PinLevel,
    /// A registered edge detector matched
    GpioEdge,
    /// A pin changed mode or pull
    PinMode,
    /// A bus line (SDA, SCL, SCLK, chip select, TX) changed level, or an
    /// SPI byte was shifted
    BusLine,
    I2cTransaction,
    SpiTransaction,
    UartTransaction,
    /// A byte was delivered into a UART receive buffer
    UartRx,
    /// Framing, parity or overrun error on a UART receiver
    UartError,
    PwmUpdate,
    /// Fixed-timestep sampling tick
    Tick,
    /// Wake-up for an external cooperative runner
    Wake,
    /// Reading or actuation result published by a device model
    Device,
    /// Runtime settings change of a controller or pin
    Config,
}

impl Topic {
    /// Returns the topic name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PinLevel => "pin_level",
            Topic::GpioEdge => "gpio_edge",
            Topic::PinMode => "pin_mode",
            Topic::BusLine => "bus_line",
            Topic::I2cTransaction => "i2c_transaction",
            Topic::SpiTransaction => "spi_transaction",
            Topic::UartTransaction => "uart_transaction",
            Topic::UartRx => "uart_rx",
            Topic::UartError => "uart_error",
            Topic::PwmUpdate => "pwm_update",
            Topic::Tick => "tick",
            Topic::Wake => "wake",
            Topic::Device => "device",
            Topic::Config => "config",
        }
    }
}

/// A named line of a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Line {
    Sda,
    Scl,
    Sclk,
    ChipSelect(u8),
    Tx,
}

/// A settings change made while the simulation runs.
///
/// Recorded so a trace shows why later timing changed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigChange {
    Spi {
        bus: BusId,
        settings: SpiSettings,
    },
    Uart {
        port: PortId,
        settings: UartSettings,
    },
    UartLink {
        a: PortId,
        b: PortId,
    },
    UartOpen {
        port: PortId,
        open: bool,
    },
    EdgeDetect {
        pin: PinId,
        detect: Option<EdgeDetect>,
    },
}

/// The payload of an event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    PinLevel {
        pin: PinId,
        level: bool,
    },
    GpioEdge {
        pin: PinId,
        edge: Edge,
    },
    PinMode {
        pin: PinId,
        mode: PinMode,
        pull: Pull,
    },
    BusLine {
        bus: BusRef,
        line: Line,
        level: bool,
    },
    /// One byte exchanged on an SPI bus, both directions.
    SpiByte {
        bus: BusId,
        chip_select: u8,
        mosi: u8,
        miso: u8,
    },
    /// A finalized bus transaction.
    Transaction(BusTransaction),
    UartRx {
        port: PortId,
        byte: u8,
    },
    UartError {
        port: PortId,
        kind: UartErrorKind,
        /// The byte involved: the dropped byte for overruns, the received
        /// byte for parity errors, nothing for framing errors.
        byte: Option<u8>,
    },
    PwmUpdate {
        pin: PinId,
        frequency_hz: f64,
        duty_percent: f64,
        running: bool,
    },
    Tick {
        index: u64,
        /// Bit `n` is the level of BCM pin `n`
        levels: u64,
    },
    Wake {
        token: u64,
    },
    Device {
        device: DeviceId,
        data: serde_json::Value,
    },
    Config(ConfigChange),
}

impl EventPayload {
    /// Returns the topic this payload is published on.
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::PinLevel { .. } => Topic::PinLevel,
            EventPayload::GpioEdge { .. } => Topic::GpioEdge,
            EventPayload::PinMode { .. } => Topic::PinMode,
            EventPayload::BusLine { .. } | EventPayload::SpiByte { .. } => Topic::BusLine,
            EventPayload::Transaction(tx) => match tx.bus() {
                BusRef::I2c(_) => Topic::I2cTransaction,
                BusRef::Spi(_) => Topic::SpiTransaction,
                BusRef::Uart(_) | BusRef::Pwm(_) => Topic::UartTransaction,
            },
            EventPayload::UartRx { .. } => Topic::UartRx,
            EventPayload::UartError { .. } => Topic::UartError,
            EventPayload::PwmUpdate { .. } => Topic::PwmUpdate,
            EventPayload::Tick { .. } => Topic::Tick,
            EventPayload::Wake { .. } => Topic::Wake,
            EventPayload::Device { .. } => Topic::Device,
            EventPayload::Config(_) => Topic::Config,
        }
    }

    /// Returns the pin this payload concerns, if any.
    pub fn pin(&self) -> Option<PinId> {
        match self {
            EventPayload::PinLevel { pin, .. }
            | EventPayload::GpioEdge { pin, .. }
            | EventPayload::PinMode { pin, .. }
            | EventPayload::PwmUpdate { pin, .. }
            | EventPayload::Config(ConfigChange::EdgeDetect { pin, .. }) => Some(*pin),
            _ => None,
        }
    }
}

/// An immutable record of something that happened in the simulation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The topic the event was published on
    pub topic: Topic,
    /// The simulation time at which the event occurred
    pub time: SimTime,
    /// The event payload
    pub payload: EventPayload,
}

impl Event {
    /// Creates a new event; the topic is derived from the payload.
    pub fn new(time: SimTime, payload: EventPayload) -> Self {
        Self {
            topic: payload.topic(),
            time,
            payload,
        }
    }

    /// Creates a pin-level event.
    pub fn pin_level(time: SimTime, pin: PinId, level: bool) -> Self {
        Self::new(time, EventPayload::PinLevel { pin, level })
    }
}
