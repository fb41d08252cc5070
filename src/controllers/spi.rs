//! SPI bus controller.
//!
//! Full duplex, one chip select active per bus at a time. A transfer claims
//! the bus for its whole duration and shifts one byte per scheduled step;
//! the byte time is eight SCLK periods rounded up to whole microseconds.
//!
//! SCLK is modelled at its idle level only: it settles to CPOL before chip
//! select falls and after it rises. Each shifted byte is published with
//! both its MOSI and MISO values.
//!
//! Peripherals may declare their own mode and bit order. When they disagree
//! with the bus settings the data is corrupted the way miswired hardware
//! corrupts it: a sampling-edge mismatch reads every bit one half-cycle late
//! (a one-bit shift), a bit-order mismatch reverses the byte.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::event::{EventPayload, Line};
use crate::pins::Resource;
use crate::scheduler::Continuation;
use crate::signal::{Edge, Signal};
use crate::transaction::{Direction, Outcome, Participant};
use crate::types::{ceil_div_min1, BusId, BusRef, ControllerId, SimTime, TransactionId};

use super::Ctx;

/// Clock polarity and phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct SpiMode {
    pub cpol: bool,
    pub cpha: bool,
}

impl SpiMode {
    pub const MODE0: SpiMode = SpiMode { cpol: false, cpha: false };
    pub const MODE1: SpiMode = SpiMode { cpol: false, cpha: true };
    pub const MODE2: SpiMode = SpiMode { cpol: true, cpha: false };
    pub const MODE3: SpiMode = SpiMode { cpol: true, cpha: true };

    /// Returns the mode with the conventional number 0-3.
    pub fn from_number(mode: u8) -> SimResult<Self> {
        match mode {
            0 => Ok(Self::MODE0),
            1 => Ok(Self::MODE1),
            2 => Ok(Self::MODE2),
            3 => Ok(Self::MODE3),
            _ => Err(SimError::InvalidParameter(format!("spi mode {}", mode))),
        }
    }

    pub fn number(&self) -> u8 {
        (self.cpol as u8) << 1 | self.cpha as u8
    }

    /// The SCLK edge on which data is sampled.
    pub fn sampling_edge(&self) -> Edge {
        if self.cpol == self.cpha {
            Edge::Rising
        } else {
            Edge::Falling
        }
    }
}

/// Order in which bits are shifted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BitOrder {
    #[default]
    MsbFirst,
    LsbFirst,
}

/// Runtime-adjustable settings of one SPI bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiSettings {
    pub clock_hz: u32,
    pub mode: SpiMode,
    pub bit_order: BitOrder,
}

impl SpiSettings {
    /// Time to shift one byte, in microseconds.
    pub fn byte_time(&self) -> SimTime {
        ceil_div_min1(8_000_000, u64::from(self.clock_hz))
    }

    /// Converts a byte as seen by a peer with `mode`/`order` into what the
    /// other side latches.
    fn skew(&self, byte: u8, mode: Option<SpiMode>, order: Option<BitOrder>) -> u8 {
        let mut byte = byte;
        if order.map_or(false, |o| o != self.bit_order) {
            byte = byte.reverse_bits();
        }
        if mode.map_or(false, |m| m.sampling_edge() != self.mode.sampling_edge()) {
            byte >>= 1;
        }
        byte
    }
}

/// A peripheral on one chip-select line.
pub trait SpiResponder: Send {
    /// Exchanges one byte: receives MOSI, returns MISO.
    fn exchange(&mut self, mosi: u8) -> u8;

    /// The mode the peripheral expects, if it cares.
    fn mode(&self) -> Option<SpiMode> {
        None
    }

    /// The bit order the peripheral expects, if it cares.
    fn bit_order(&self) -> Option<BitOrder> {
        None
    }

    fn select(&mut self) {}

    fn deselect(&mut self) {}
}

struct ActiveTransfer {
    id: TransactionId,
    chip_select: u8,
    owner: ControllerId,
    settings: SpiSettings,
    bytes: Vec<u8>,
    index: usize,
}

/// One SPI bus with its chip-select lines.
pub struct SpiController {
    id: BusId,
    settings: SpiSettings,
    chip_selects: u8,
    responders: BTreeMap<u8, Box<dyn SpiResponder>>,
    active: Option<ActiveTransfer>,
    sclk: Signal,
    transfers: u64,
}

impl SpiController {
    pub fn new(id: BusId, settings: SpiSettings, chip_selects: u8) -> Self {
        Self {
            id,
            settings,
            chip_selects,
            responders: BTreeMap::new(),
            active: None,
            sclk: Signal::digital(settings.mode.cpol, 64),
            transfers: 0,
        }
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    pub fn bus(&self) -> BusRef {
        BusRef::Spi(self.id)
    }

    pub fn settings(&self) -> SpiSettings {
        self.settings
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    /// Returns the SCLK line signal.
    pub fn sclk(&self) -> &Signal {
        &self.sclk
    }

    /// Changes clock, mode and bit order. An in-flight transfer finishes
    /// with the settings it started with.
    pub fn configure(&mut self, settings: SpiSettings) -> SimResult<()> {
        if settings.clock_hz == 0 {
            return Err(SimError::InvalidParameter("spi clock must be non-zero".into()));
        }
        tracing::debug!(bus = %self.bus(), ?settings, "spi reconfigured");
        self.settings = settings;
        Ok(())
    }

    fn check_chip_select(&self, chip_select: u8) -> SimResult<()> {
        if chip_select >= self.chip_selects {
            return Err(SimError::InvalidParameter(format!(
                "{} has no chip select {}",
                self.bus(),
                chip_select
            )));
        }
        Ok(())
    }

    pub fn attach(&mut self, chip_select: u8, responder: Box<dyn SpiResponder>) -> SimResult<()> {
        self.check_chip_select(chip_select)?;
        if self.responders.contains_key(&chip_select) {
            return Err(SimError::AddressInUse {
                bus: self.bus(),
                address: u16::from(chip_select),
            });
        }
        self.responders.insert(chip_select, responder);
        Ok(())
    }

    pub fn detach(&mut self, chip_select: u8) -> Option<Box<dyn SpiResponder>> {
        self.responders.remove(&chip_select)
    }

    /// Starts a full-duplex transfer of `bytes` on `chip_select`.
    ///
    /// Fails with [`SimError::ChipSelectConflict`] if a transfer is already
    /// in flight on this bus.
    pub fn transfer(
        &mut self,
        ctx: &mut Ctx<'_>,
        chip_select: u8,
        owner: ControllerId,
        bytes: Vec<u8>,
    ) -> SimResult<TransactionId> {
        self.check_chip_select(chip_select)?;
        if let Some(active) = &self.active {
            return Err(SimError::ChipSelectConflict {
                bus: self.id,
                active: active.chip_select,
                requested: chip_select,
            });
        }
        if bytes.is_empty() {
            return Err(SimError::InvalidParameter("empty spi transfer".into()));
        }
        ctx.pins.claim(Resource::Bus(self.bus()), owner)?;

        let now = ctx.now();
        let id = ctx.transactions.begin(
            self.bus(),
            Direction::FullDuplex,
            vec![
                Participant::Controller(owner),
                Participant::ChipSelect(chip_select),
            ],
            now,
        );
        let settings = self.settings;
        ctx.pins.set_bus_busy(self.bus(), true);
        self.set_sclk(ctx, settings.mode.cpol)?;
        self.set_chip_select(ctx, chip_select, false)?;
        if let Some(r) = self.responders.get_mut(&chip_select) {
            r.select();
        }

        self.active = Some(ActiveTransfer {
            id,
            chip_select,
            owner,
            settings,
            bytes,
            index: 0,
        });
        self.transfers += 1;
        ctx.schedule_after(settings.byte_time(), Continuation::SpiByte { bus: self.id });
        Ok(id)
    }

    /// One byte has been shifted in both directions.
    pub fn on_byte(&mut self, ctx: &mut Ctx<'_>) -> SimResult<()> {
        let mut active = match self.active.take() {
            Some(active) => active,
            None => return Ok(()),
        };
        let mosi = active.bytes[active.index];
        let settings = active.settings;

        let miso = match self.responders.get_mut(&active.chip_select) {
            Some(r) => {
                let (mode, order) = (r.mode(), r.bit_order());
                let seen = settings.skew(mosi, mode, order);
                let reply = r.exchange(seen);
                settings.skew(reply, mode, order)
            }
            // MISO floats high with nothing selected
            None => 0xFF,
        };

        let tx = ctx.transactions.open_mut(active.id)?;
        tx.push_out(mosi)?;
        tx.push_in(miso)?;
        active.index += 1;
        ctx.publish(EventPayload::SpiByte {
            bus: self.id,
            chip_select: active.chip_select,
            mosi,
            miso,
        });

        if active.index < active.bytes.len() {
            self.active = Some(active);
            ctx.schedule_after(settings.byte_time(), Continuation::SpiByte { bus: self.id });
            return Ok(());
        }

        if let Some(r) = self.responders.get_mut(&active.chip_select) {
            r.deselect();
        }
        self.set_chip_select(ctx, active.chip_select, true)?;
        self.set_sclk(ctx, settings.mode.cpol)?;
        ctx.pins.set_bus_busy(self.bus(), false);
        ctx.pins.release(Resource::Bus(self.bus()), active.owner)?;
        let tx = ctx.transactions.finish(active.id, Outcome::Completed, ctx.scheduler.now())?;
        ctx.publish(EventPayload::Transaction(tx));
        Ok(())
    }

    /// Settles SCLK at `level`, publishing only on a change.
    fn set_sclk(&mut self, ctx: &mut Ctx<'_>, level: bool) -> SimResult<()> {
        if self.sclk.set_level(level, ctx.now())?.is_none() {
            return Ok(());
        }
        let bus = self.bus();
        ctx.line(bus, Line::Sclk, level);
        if let Some(pins) = ctx.pins.board().spi_pins(self.id) {
            ctx.mirror(bus, pins.sclk, level)?;
        }
        Ok(())
    }

    fn set_chip_select(&self, ctx: &mut Ctx<'_>, chip_select: u8, level: bool) -> SimResult<()> {
        let bus = self.bus();
        ctx.line(bus, Line::ChipSelect(chip_select), level);
        let pin = ctx
            .pins
            .board()
            .spi_pins(self.id)
            .and_then(|pins| pins.chip_selects.get(usize::from(chip_select)).copied());
        if let Some(pin) = pin {
            ctx.mirror(bus, pin, level)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SpiController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpiController")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("chip_selects", &self.chip_selects)
            .field("busy", &self.active.is_some())
            .field("sclk", &self.sclk.level())
            .finish()
    }
}
