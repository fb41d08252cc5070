//! # boardsim
//!
//! A deterministic, event-driven simulation kernel standing in for a
//! single-board computer. It reproduces GPIO, I2C, SPI, UART and PWM
//! behavior with protocol-accurate timing so embedded code can be developed
//! and tested without the hardware.
//!
//! ## Design Principles
//!
//! - **One timeline**: every signal sample, scheduled event and trace record
//!   uses the same microsecond `SimTime`. Only the clock advances it.
//! - **Deterministic ordering**: events due at the same instant fire in the
//!   order they were scheduled. Two runs of the same configuration and
//!   commands produce byte-identical traces.
//! - **Hardware waits are continuations**: a command returns immediately; the
//!   bus transfer, UART frame or PWM period it starts completes when the
//!   scheduler reaches it.
//! - **Ids, not references**: pins, buses, controllers and devices refer to
//!   each other through ids into registries.
//!
//! ## Features
//!
//! - `parallel` - Run independent kernels of a [`BatchRunner`] on rayon
//!
//! ## Quick Start
//!
//! ```rust
//! use boardsim::{I2cRequest, Kernel, KernelConfig, Outcome, PinId, PinMode, Pull};
//! use boardsim::devices::builtin::I2cRegisterFile;
//!
//! let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
//! let recorder = kernel.record();
//!
//! // Blink a LED
//! kernel.set_pin_mode(PinId(17), PinMode::Output, Pull::Off).unwrap();
//! kernel.write_pin(PinId(17), true).unwrap();
//!
//! // Read a register from an I2C peripheral
//! let sensor = I2cRegisterFile::new().with_register(0x00, 0x2A);
//! kernel.i2c_attach(1, 0x48, Box::new(sensor)).unwrap();
//! let id = kernel.i2c_transfer(1, I2cRequest::write_read(0x48, [0x00], 1)).unwrap();
//!
//! kernel.run_for(1_000).unwrap();
//!
//! let tx = kernel.transaction(id).unwrap();
//! assert_eq!(tx.outcome(), Some(Outcome::Completed));
//! assert_eq!(tx.bytes_in(), &[0x2A]);
//! assert!(!recorder.trace().is_empty());
//! ```
//!
//! ## Configuration-Driven Setup
//!
//! ```rust,ignore
//! use boardsim::{Kernel, KernelConfig};
//!
//! let config = KernelConfig::from_file("board.yaml")?;
//! let mut kernel = Kernel::new(config)?;
//! ```

pub mod types;
pub mod error;
pub mod clock;
pub mod scheduler;
pub mod event;
pub mod event_bus;
pub mod signal;
pub mod board;
pub mod pins;
pub mod transaction;
pub mod controllers;
pub mod devices;
pub mod config;
pub mod trace;
pub mod kernel;
pub mod batch;

// Re-export commonly used types
pub use types::{BusId, BusRef, ControllerId, DeviceId, PinAddress, PinId, PortId, SimTime, TransactionId};
pub use error::{SimError, SimResult};
pub use clock::{Clock, TimestepMode};
pub use scheduler::{Continuation, EventHandle, Scheduler};
pub use event::{ConfigChange, Event, EventPayload, Line, Topic};
pub use event_bus::{EventBus, EventLog, Subscriber, SubscriptionId, TopicFilter};
pub use signal::{Edge, EdgeDetect, Signal, SignalValue};
pub use board::{Board, BoardModel};
pub use pins::{PinMode, Pull, Resource};
pub use transaction::{BusTransaction, Direction, NackPhase, Outcome, Participant};
pub use controllers::{
    BitOrder, I2cRequest, I2cResponder, I2cSpeed, Parity, SpiMode, SpiResponder, SpiSettings,
    StopBits, UartErrorKind, UartSettings,
};
pub use devices::{Capability, DeviceAddress, DeviceBinding, DeviceModel, DeviceRegistry};
pub use config::{ConfigError, KernelConfig, KernelConfigBuilder, UartPortConfig};
pub use trace::{compare, Replayer, Trace, TraceError, TraceRecorder};
pub use kernel::Kernel;
pub use batch::{BatchResult, BatchRunner};

/// Initialize the tracing subscriber for logging.
///
/// Call this at the start of your program to enable logging. `RUST_LOG`
/// takes precedence over `level`.
///
/// # Example
///
/// ```rust,ignore
/// boardsim::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
