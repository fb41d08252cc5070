//! Protocol controllers.
//!
//! Controllers validate driver commands, mutate pin and line state, and
//! schedule their own follow-up [`Continuation`]s. They never call each other
//! directly; the kernel dispatches each continuation back to the controller
//! that scheduled it, handing it a [`Ctx`] with the shared kernel state.

pub mod gpio;
pub mod i2c;
pub mod pwm;
pub mod spi;
pub mod uart;

pub use gpio::GpioController;
pub use i2c::{I2cController, I2cRequest, I2cResponder, I2cSpeed};
pub use pwm::PwmController;
pub use spi::{BitOrder, SpiController, SpiMode, SpiResponder, SpiSettings};
pub use uart::{
    ErrorInjection, Parity, StopBits, UartController, UartErrorKind, UartFrame, UartSettings,
};

use crate::error::SimResult;
use crate::event::{EventPayload, Line};
use crate::event_bus::EventBus;
use crate::pins::{PinMode, PinRegistry};
use crate::scheduler::{Continuation, EventHandle, Scheduler};
use crate::transaction::TransactionLog;
use crate::types::{BusRef, PinId, SimTime};

/// Mutable view of the kernel state shared by all controllers.
pub struct Ctx<'a> {
    pub scheduler: &'a mut Scheduler,
    pub bus: &'a mut EventBus,
    pub pins: &'a mut PinRegistry,
    pub transactions: &'a mut TransactionLog,
}

impl<'a> Ctx<'a> {
    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    /// Publishes a payload at the current time.
    pub fn publish(&mut self, payload: EventPayload) {
        let now = self.scheduler.now();
        self.bus.publish(now, payload);
    }

    pub fn schedule_after(&mut self, delay: SimTime, continuation: Continuation) -> EventHandle {
        self.scheduler.schedule_after(delay, continuation)
    }

    /// Drives a pin's signal to `level`, publishing a pin-level event on an
    /// actual change and a GPIO edge event when the pin's detector matches.
    pub fn set_pin_level(&mut self, pin: PinId, level: bool) -> SimResult<()> {
        let now = self.scheduler.now();
        if let Some(change) = self.pins.apply_level(pin, level, now)? {
            self.bus
                .publish(now, EventPayload::PinLevel { pin, level: change.level });
            if change.detected {
                self.bus
                    .publish(now, EventPayload::GpioEdge { pin, edge: change.edge });
            }
        }
        Ok(())
    }

    /// Publishes the current mode and pull of a pin.
    pub fn publish_mode(&mut self, pin: PinId) -> SimResult<()> {
        let mode = self.pins.mode(pin)?;
        let pull = self.pins.pull(pin)?;
        self.publish(EventPayload::PinMode { pin, mode, pull });
        Ok(())
    }

    /// Publishes a bus line change.
    pub fn line(&mut self, bus: BusRef, line: Line, level: bool) {
        self.publish(EventPayload::BusLine { bus, line, level });
    }

    /// Copies a bus line level onto `pin` when the pin is switched to the
    /// bus's alternate function.
    pub fn mirror(&mut self, bus: BusRef, pin: PinId, level: bool) -> SimResult<()> {
        if self.pins.mode(pin)? == PinMode::Alt(bus) {
            self.set_pin_level(pin, level)?;
        }
        Ok(())
    }
}
