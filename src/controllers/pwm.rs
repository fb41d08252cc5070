//! Hardware PWM.
//!
//! Each running channel is a self-rescheduling pair of edges. The rising
//! edge at the start of a period reads the current frequency and duty cycle
//! and schedules the falling edge and the end of the period from them, so a
//! parameter change takes effect at the next period boundary and never
//! rewrites edges already in the past.

use std::collections::BTreeMap;

use crate::error::{SimError, SimResult};
use crate::event::EventPayload;
use crate::pins::{PinMode, Pull, Resource};
use crate::scheduler::{Continuation, EventHandle};
use crate::types::{ControllerId, PinId, SimTime};

use super::Ctx;

#[derive(Clone, Debug, PartialEq)]
struct Channel {
    frequency_hz: f64,
    duty_percent: f64,
    running: bool,
    next: Option<EventHandle>,
    period_end: SimTime,
}

impl Channel {
    fn period(&self) -> SimTime {
        ((1_000_000.0 / self.frequency_hz).round() as SimTime).max(1)
    }

    fn high_time(&self, period: SimTime) -> SimTime {
        ((period as f64 * self.duty_percent / 100.0).round() as SimTime).min(period)
    }
}

/// PWM output on the header's PWM-capable pins.
#[derive(Debug, Default)]
pub struct PwmController {
    channels: BTreeMap<PinId, Channel>,
    edges: u64,
}

impl PwmController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets frequency and duty for a pin. On a running channel the new values
    /// apply from the next period.
    pub fn configure(
        &mut self,
        ctx: &mut Ctx<'_>,
        pin: PinId,
        frequency_hz: f64,
        duty_percent: f64,
    ) -> SimResult<()> {
        if !(frequency_hz.is_finite() && frequency_hz > 0.0 && frequency_hz <= 1_000_000.0) {
            return Err(SimError::InvalidParameter(format!(
                "pwm frequency {} Hz out of range",
                frequency_hz
            )));
        }
        if !(0.0..=100.0).contains(&duty_percent) {
            return Err(SimError::InvalidParameter(format!(
                "pwm duty {}% out of range",
                duty_percent
            )));
        }
        if ctx.pins.board().pwm_channel(pin).is_none() {
            return Err(SimError::UnsupportedMode {
                pin,
                mode: PinMode::Pwm.to_string(),
            });
        }

        let channel = self.channels.entry(pin).or_insert(Channel {
            frequency_hz,
            duty_percent,
            running: false,
            next: None,
            period_end: 0,
        });
        channel.frequency_hz = frequency_hz;
        channel.duty_percent = duty_percent;
        let running = channel.running;
        ctx.publish(EventPayload::PwmUpdate {
            pin,
            frequency_hz,
            duty_percent,
            running,
        });
        Ok(())
    }

    /// Starts the waveform with a rising edge now.
    pub fn start(&mut self, ctx: &mut Ctx<'_>, pin: PinId) -> SimResult<()> {
        let channel = self.channels.get_mut(&pin).ok_or_else(|| {
            SimError::InvalidParameter(format!("{} has no pwm configuration", pin))
        })?;
        if channel.running {
            return Ok(());
        }
        ctx.pins.claim(Resource::Pin(pin), ControllerId::Pwm)?;
        let level = ctx.pins.set_mode(pin, PinMode::Pwm, Pull::Off, ControllerId::Pwm)?;
        ctx.publish_mode(pin)?;
        ctx.set_pin_level(pin, level)?;

        channel.running = true;
        let now = ctx.now();
        channel.next = Some(
            ctx.scheduler
                .schedule_at(now, Continuation::PwmEdge { pin, rising: true })?,
        );
        let (frequency_hz, duty_percent) = (channel.frequency_hz, channel.duty_percent);
        ctx.publish(EventPayload::PwmUpdate {
            pin,
            frequency_hz,
            duty_percent,
            running: true,
        });
        Ok(())
    }

    /// Stops the waveform, drives the pin low and hands it back as an input.
    pub fn stop(&mut self, ctx: &mut Ctx<'_>, pin: PinId) -> SimResult<()> {
        let channel = match self.channels.get_mut(&pin) {
            Some(channel) if channel.running => channel,
            _ => return Ok(()),
        };
        if let Some(next) = channel.next.take() {
            ctx.scheduler.cancel(next);
        }
        channel.running = false;
        let (frequency_hz, duty_percent) = (channel.frequency_hz, channel.duty_percent);

        ctx.set_pin_level(pin, false)?;
        ctx.pins.set_mode(pin, PinMode::Input, Pull::Off, ControllerId::Pwm)?;
        ctx.pins.release(Resource::Pin(pin), ControllerId::Pwm)?;
        ctx.publish_mode(pin)?;
        ctx.publish(EventPayload::PwmUpdate {
            pin,
            frequency_hz,
            duty_percent,
            running: false,
        });
        Ok(())
    }

    /// A period boundary or mid-period falling edge came due.
    pub fn on_edge(&mut self, ctx: &mut Ctx<'_>, pin: PinId, rising: bool) -> SimResult<()> {
        let channel = match self.channels.get_mut(&pin) {
            Some(channel) if channel.running => channel,
            _ => return Ok(()),
        };
        let now = ctx.now();

        let next = if rising {
            let period = channel.period();
            let high = channel.high_time(period);
            channel.period_end = now.saturating_add(period);
            ctx.set_pin_level(pin, high > 0)?;
            if high == 0 || high == period {
                // 0% and 100% hold the level for the whole period
                ctx.scheduler
                    .schedule_at(channel.period_end, Continuation::PwmEdge { pin, rising: true })?
            } else {
                ctx.schedule_after(high, Continuation::PwmEdge { pin, rising: false })
            }
        } else {
            ctx.set_pin_level(pin, false)?;
            ctx.scheduler
                .schedule_at(channel.period_end, Continuation::PwmEdge { pin, rising: true })?
        };
        channel.next = Some(next);
        self.edges += 1;
        Ok(())
    }

    pub fn is_running(&self, pin: PinId) -> bool {
        self.channels.get(&pin).map_or(false, |c| c.running)
    }

    /// Returns the configured (frequency, duty) of a pin.
    pub fn parameters(&self, pin: PinId) -> Option<(f64, f64)> {
        self.channels
            .get(&pin)
            .map(|c| (c.frequency_hz, c.duty_percent))
    }

    /// Number of edge continuations processed.
    pub fn edges(&self) -> u64 {
        self.edges
    }
}
