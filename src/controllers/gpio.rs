//! General-purpose digital I/O.

use crate::error::{SimError, SimResult};
use crate::event::{ConfigChange, EventPayload};
use crate::pins::{PinMode, Pull};
use crate::scheduler::Continuation;
use crate::signal::EdgeDetect;
use crate::types::{ControllerId, PinId, SimTime};

use super::Ctx;

/// Statistics collected by the GPIO controller.
#[derive(Clone, Debug, Default)]
pub struct GpioStats {
    pub writes: u64,
    pub reads: u64,
    pub mode_changes: u64,
    pub glitches: u64,
}

/// Digital pin modes, reads, writes and edge detection.
///
/// Edge events come straight from consecutive Signal samples; there is no
/// debouncing.
#[derive(Debug, Default)]
pub struct GpioController {
    stats: GpioStats,
}

impl GpioController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes a pin's mode and pull, publishing the new mode and any level
    /// change the mode implies (e.g. a pull-up on a floating input).
    pub fn set_mode(&mut self, ctx: &mut Ctx<'_>, pin: PinId, mode: PinMode, pull: Pull) -> SimResult<()> {
        self.set_mode_as(ctx, pin, mode, pull, ControllerId::Gpio)
    }

    pub(crate) fn set_mode_as(
        &mut self,
        ctx: &mut Ctx<'_>,
        pin: PinId,
        mode: PinMode,
        pull: Pull,
        requester: ControllerId,
    ) -> SimResult<()> {
        let level = ctx.pins.set_mode(pin, mode, pull, requester)?;
        self.stats.mode_changes += 1;
        ctx.publish_mode(pin)?;
        ctx.set_pin_level(pin, level)
    }

    /// Drives an output pin.
    pub fn write(&mut self, ctx: &mut Ctx<'_>, pin: PinId, level: bool) -> SimResult<()> {
        ctx.pins.check_writable(pin, ControllerId::Gpio)?;
        self.stats.writes += 1;
        ctx.set_pin_level(pin, level)
    }

    /// Reads a pin. For an output this is the last written level.
    pub fn read(&mut self, ctx: &Ctx<'_>, pin: PinId) -> SimResult<bool> {
        self.stats.reads += 1;
        ctx.pins.level(pin)
    }

    /// Lets a device model drive an input pin; `None` lets it float back to
    /// its pull level.
    pub fn drive_input(&mut self, ctx: &mut Ctx<'_>, pin: PinId, level: Option<bool>) -> SimResult<()> {
        let level = ctx.pins.drive_input(pin, level)?;
        ctx.set_pin_level(pin, level)
    }

    pub fn add_edge_detect(&mut self, ctx: &mut Ctx<'_>, pin: PinId, detect: EdgeDetect) -> SimResult<()> {
        self.set_edge_detect(ctx, pin, Some(detect))
    }

    pub fn remove_edge_detect(&mut self, ctx: &mut Ctx<'_>, pin: PinId) -> SimResult<()> {
        self.set_edge_detect(ctx, pin, None)
    }

    fn set_edge_detect(&mut self, ctx: &mut Ctx<'_>, pin: PinId, detect: Option<EdgeDetect>) -> SimResult<()> {
        ctx.pins.set_edge_detect(pin, detect)?;
        ctx.publish(EventPayload::Config(ConfigChange::EdgeDetect { pin, detect }));
        Ok(())
    }

    /// Inverts a pin's level for `duration` µs, then puts back the level it
    /// had before the glitch. Works in any pin mode and ignores ownership.
    pub fn inject_glitch(&mut self, ctx: &mut Ctx<'_>, pin: PinId, duration: SimTime) -> SimResult<()> {
        if duration == 0 {
            return Err(SimError::InvalidParameter("glitch duration must be non-zero".into()));
        }
        let level = ctx.pins.level(pin)?;
        self.stats.glitches += 1;
        tracing::debug!(%pin, duration, "glitch injected");
        ctx.set_pin_level(pin, !level)?;
        ctx.schedule_after(duration, Continuation::GlitchEnd { pin, level });
        Ok(())
    }

    /// End of a glitch pulse.
    pub fn on_glitch_end(&mut self, ctx: &mut Ctx<'_>, pin: PinId, level: bool) -> SimResult<()> {
        ctx.set_pin_level(pin, level)
    }

    pub fn stats(&self) -> &GpioStats {
        &self.stats
    }
}
