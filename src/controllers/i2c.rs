//! I2C bus controller.
//!
//! A transfer moves through Start → address phase → ACK/NACK → data phase
//! (one ACK per byte) → Stop, one scheduled step per phase. Timing comes
//! from the bus speed: each byte is nine bit times (eight data bits plus the
//! acknowledge), start and stop conditions take one bit time each.
//!
//! # Arbitration
//!
//! Every transfer is arbitrated by an `I2cStart` continuation scheduled at
//! the moment the driver issued it. Starts that overlap on one bus are
//! resolved by scheduler order: the first to fire (lowest sequence number)
//! takes the bus, a Start from another master that fires while a transfer
//! is in flight is finalized as `ArbitrationLost`. Losers are not retried.
//! A master never arbitrates against itself: its later transfers wait for
//! the bus and start one bit time after the Stop.
//!
//! # Addressing
//!
//! 7-bit and 10-bit addresses are separate address spaces, so a 10-bit
//! responder at 0x048 and a 7-bit one at 0x48 can share a bus.
//!
//! # Clock stretching
//!
//! After each byte the addressed responder may hold SCL low for a number of
//! microseconds. When a stretch timeout is configured, a timeout
//! continuation races the release; whichever fires first cancels the other.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::event::{EventPayload, Line};
use crate::scheduler::{Continuation, EventHandle};
use crate::signal::Signal;
use crate::transaction::{Direction, NackPhase, Outcome, Participant};
use crate::types::{ceil_div_min1, BusId, BusRef, ControllerId, SimTime, TransactionId};

use super::Ctx;

/// Bits clocked per byte: eight data bits and the acknowledge bit.
const BITS_PER_BYTE: u64 = 9;

/// First and last address tried by a bus scan; the rest are reserved.
const SCAN_FIRST: u16 = 0x08;
const SCAN_LAST: u16 = 0x77;

/// I2C bus speed grade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum I2cSpeed {
    /// 100 kHz
    #[default]
    Standard,
    /// 400 kHz
    Fast,
    /// 1 MHz
    FastPlus,
}

impl I2cSpeed {
    pub fn hz(&self) -> u64 {
        match self {
            I2cSpeed::Standard => 100_000,
            I2cSpeed::Fast => 400_000,
            I2cSpeed::FastPlus => 1_000_000,
        }
    }

    /// One SCL period in whole microseconds, rounded up.
    pub fn bit_time(&self) -> SimTime {
        ceil_div_min1(1_000_000, self.hz())
    }
}

/// A transfer requested by a bus master.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct I2cRequest {
    pub address: u16,
    pub ten_bit: bool,
    /// Bytes written after the address
    pub write: Vec<u8>,
    /// Bytes to read (after a repeated start when `write` is non-empty)
    pub read_len: usize,
}

impl I2cRequest {
    pub fn write(address: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            ten_bit: false,
            write: data.into(),
            read_len: 0,
        }
    }

    pub fn read(address: u16, len: usize) -> Self {
        Self {
            address,
            ten_bit: false,
            write: Vec::new(),
            read_len: len,
        }
    }

    /// Writes `data` (typically a register pointer), then reads `len` bytes
    /// after a repeated start.
    pub fn write_read(address: u16, data: impl Into<Vec<u8>>, len: usize) -> Self {
        Self {
            address,
            ten_bit: false,
            write: data.into(),
            read_len: len,
        }
    }

    /// Uses 10-bit addressing.
    pub fn ten_bit(mut self) -> Self {
        self.ten_bit = true;
        self
    }

    pub fn direction(&self) -> Direction {
        match (self.write.is_empty(), self.read_len) {
            (false, n) if n > 0 => Direction::WriteRead,
            (true, n) if n > 0 => Direction::Read,
            _ => Direction::Write,
        }
    }

    fn validate(&self) -> SimResult<()> {
        check_address(self.address, self.ten_bit)
    }

    fn key(&self) -> AddressKey {
        (self.ten_bit, self.address)
    }

    fn address_bits(&self) -> u64 {
        if self.ten_bit {
            2 * BITS_PER_BYTE
        } else {
            BITS_PER_BYTE
        }
    }

    fn plan(&self) -> VecDeque<Phase> {
        let mut plan = VecDeque::new();
        match self.direction() {
            Direction::Read => {
                plan.push_back(Phase::Address { read: true });
                plan.extend((0..self.read_len).map(Phase::ReadData));
            }
            Direction::WriteRead => {
                plan.push_back(Phase::Address { read: false });
                plan.extend((0..self.write.len()).map(Phase::WriteData));
                plan.push_back(Phase::RepeatedStart);
                plan.push_back(Phase::Address { read: true });
                plan.extend((0..self.read_len).map(Phase::ReadData));
            }
            _ => {
                plan.push_back(Phase::Address { read: false });
                plan.extend((0..self.write.len()).map(Phase::WriteData));
            }
        }
        plan.push_back(Phase::Stop);
        plan
    }
}

fn check_address(address: u16, ten_bit: bool) -> SimResult<()> {
    let max = if ten_bit { 0x3FF } else { 0x7F };
    if address > max {
        return Err(SimError::InvalidParameter(format!(
            "i2c address {:#x} exceeds {}-bit range",
            address,
            if ten_bit { 10 } else { 7 }
        )));
    }
    Ok(())
}

/// A peripheral answering on an I2C address.
pub trait I2cResponder: Send {
    /// Called at every address phase; returning false NACKs the address.
    fn address_ack(&mut self, read: bool) -> bool {
        let _ = read;
        true
    }

    /// Receives one byte from the master; returning false NACKs it.
    fn write_byte(&mut self, byte: u8) -> bool;

    /// Supplies one byte to the master.
    fn read_byte(&mut self) -> u8;

    /// Microseconds SCL is held low after byte `index` of the transfer
    /// (address bytes included).
    fn clock_stretch(&mut self, index: usize) -> SimTime {
        let _ = index;
        0
    }

    /// Called when the master issues a Stop.
    fn stop(&mut self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Address { read: bool },
    WriteData(usize),
    RepeatedStart,
    ReadData(usize),
    Stop,
}

/// Responder key: (10-bit addressing, address).
type AddressKey = (bool, u16);

struct PendingTransfer {
    master: ControllerId,
    request: I2cRequest,
}

struct ActiveTransfer {
    id: TransactionId,
    master: ControllerId,
    request: I2cRequest,
    plan: VecDeque<Phase>,
    nack: Option<NackPhase>,
    bytes_clocked: usize,
    /// Pending stretch release and the timeout racing it
    stretch: Option<(EventHandle, Option<EventHandle>)>,
}

/// Statistics collected by an I2C controller.
#[derive(Clone, Debug, Default)]
pub struct I2cStats {
    pub transfers: u64,
    pub arbitration_lost: u64,
    pub nacks: u64,
    pub stretch_timeouts: u64,
}

/// One I2C bus with its attached responders.
pub struct I2cController {
    id: BusId,
    speed: I2cSpeed,
    stretch_timeout: Option<SimTime>,
    responders: BTreeMap<AddressKey, Box<dyn I2cResponder>>,
    pending: BTreeMap<TransactionId, PendingTransfer>,
    /// Same-master transfers waiting for the bus, oldest first
    waiting: VecDeque<TransactionId>,
    active: Option<ActiveTransfer>,
    sda: Signal,
    scl: Signal,
    stats: I2cStats,
}

impl I2cController {
    pub fn new(id: BusId, speed: I2cSpeed, stretch_timeout: Option<SimTime>) -> Self {
        Self {
            id,
            speed,
            stretch_timeout,
            responders: BTreeMap::new(),
            pending: BTreeMap::new(),
            waiting: VecDeque::new(),
            active: None,
            sda: Signal::digital(true, 64),
            scl: Signal::digital(true, 64),
            stats: I2cStats::default(),
        }
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    pub fn bus(&self) -> BusRef {
        BusRef::I2c(self.id)
    }

    pub fn speed(&self) -> I2cSpeed {
        self.speed
    }

    pub fn stats(&self) -> &I2cStats {
        &self.stats
    }

    /// Returns true if no transfer is in flight.
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// Attaches a responder at 7-bit `address`.
    pub fn attach(&mut self, address: u16, responder: Box<dyn I2cResponder>) -> SimResult<()> {
        self.attach_keyed((false, address), responder)
    }

    /// Attaches a responder at 10-bit `address`.
    pub fn attach_ten_bit(&mut self, address: u16, responder: Box<dyn I2cResponder>) -> SimResult<()> {
        self.attach_keyed((true, address), responder)
    }

    fn attach_keyed(&mut self, key: AddressKey, responder: Box<dyn I2cResponder>) -> SimResult<()> {
        let (ten_bit, address) = key;
        check_address(address, ten_bit)?;
        if self.responders.contains_key(&key) {
            return Err(SimError::AddressInUse {
                bus: self.bus(),
                address,
            });
        }
        self.responders.insert(key, responder);
        Ok(())
    }

    pub fn detach(&mut self, address: u16, ten_bit: bool) -> Option<Box<dyn I2cResponder>> {
        self.responders.remove(&(ten_bit, address))
    }

    /// Returns the 7-bit addresses in the usable range that acknowledge a
    /// write.
    pub fn scan(&mut self) -> Vec<u16> {
        self.responders
            .range_mut((false, SCAN_FIRST)..=(false, SCAN_LAST))
            .filter_map(|(&(_, address), r)| r.address_ack(false).then_some(address))
            .collect()
    }

    /// Queues a transfer; it is arbitrated at the current instant.
    pub fn transfer(
        &mut self,
        ctx: &mut Ctx<'_>,
        master: ControllerId,
        request: I2cRequest,
    ) -> SimResult<TransactionId> {
        request.validate()?;
        let now = ctx.now();
        let id = ctx.transactions.begin(
            self.bus(),
            request.direction(),
            vec![
                Participant::Controller(master),
                Participant::I2cAddress(request.address),
            ],
            now,
        );
        self.pending.insert(id, PendingTransfer { master, request });
        ctx.scheduler.schedule_at(
            now,
            Continuation::I2cStart {
                bus: self.id,
                transaction: id,
            },
        )?;
        Ok(id)
    }

    /// Arbitrates a queued transfer and, if it wins, drives the Start
    /// condition.
    pub fn on_start(&mut self, ctx: &mut Ctx<'_>, id: TransactionId) -> SimResult<()> {
        let master = match self.pending.get(&id) {
            Some(pending) => pending.master,
            None => return Ok(()),
        };

        if let Some(active) = &self.active {
            if active.master == master {
                tracing::debug!(bus = %self.bus(), id, behind = active.id, "transfer waiting for bus");
                self.waiting.push_back(id);
                return Ok(());
            }
            self.pending.remove(&id);
            self.stats.arbitration_lost += 1;
            tracing::warn!(
                bus = %self.bus(),
                loser = id,
                winner = active.id,
                "arbitration lost"
            );
            let tx = ctx
                .transactions
                .finish(id, Outcome::ArbitrationLost, ctx.scheduler.now())?;
            ctx.publish(EventPayload::Transaction(tx));
            return Ok(());
        }

        let request = match self.pending.remove(&id) {
            Some(pending) => pending.request,
            None => return Ok(()),
        };
        self.stats.transfers += 1;
        ctx.pins.set_bus_busy(self.bus(), true);
        // SDA falls while SCL is high, then SCL is pulled low
        self.set_line(ctx, Line::Sda, false)?;
        self.set_line(ctx, Line::Scl, false)?;

        let plan = request.plan();
        self.active = Some(ActiveTransfer {
            id,
            master,
            request,
            plan,
            nack: None,
            bytes_clocked: 0,
            stretch: None,
        });
        ctx.schedule_after(self.speed.bit_time(), Continuation::I2cStep { bus: self.id });
        Ok(())
    }

    /// Runs the next phase of the active transfer.
    pub fn on_step(&mut self, ctx: &mut Ctx<'_>) -> SimResult<()> {
        let mut active = match self.active.take() {
            Some(active) => active,
            None => return Ok(()),
        };
        if let Some((_, Some(timeout))) = active.stretch.take() {
            ctx.scheduler.cancel(timeout);
        }

        let phase = match active.plan.pop_front() {
            Some(phase) => phase,
            None => return self.complete(ctx, active),
        };

        let bit = self.speed.bit_time();
        let bus = self.bus();
        let address = active.request.address;
        let key = active.request.key();

        let (bits, stretch) = match phase {
            Phase::Address { read } => {
                let index = active.bytes_clocked;
                active.bytes_clocked += 1;
                let acked = self
                    .responders
                    .get_mut(&key)
                    .map_or(false, |r| r.address_ack(read));
                if acked {
                    (active.request.address_bits(), self.stretch_after(key, index))
                } else {
                    tracing::debug!(%bus, address, "address not acknowledged");
                    active.nack = Some(NackPhase::Address);
                    active.plan = VecDeque::from([Phase::Stop]);
                    (active.request.address_bits(), 0)
                }
            }
            Phase::WriteData(i) => {
                let byte = active.request.write[i];
                ctx.transactions.open_mut(active.id)?.push_out(byte)?;
                let index = active.bytes_clocked;
                active.bytes_clocked += 1;
                let acked = self
                    .responders
                    .get_mut(&key)
                    .map_or(false, |r| r.write_byte(byte));
                if acked {
                    (BITS_PER_BYTE, self.stretch_after(key, index))
                } else {
                    active.nack = Some(NackPhase::Data(i));
                    active.plan = VecDeque::from([Phase::Stop]);
                    (BITS_PER_BYTE, 0)
                }
            }
            Phase::ReadData(_) => {
                let index = active.bytes_clocked;
                active.bytes_clocked += 1;
                // Nobody drives SDA: the pull-up reads back as ones
                let byte = self
                    .responders
                    .get_mut(&key)
                    .map_or(0xFF, |r| r.read_byte());
                ctx.transactions.open_mut(active.id)?.push_in(byte)?;
                (BITS_PER_BYTE, self.stretch_after(key, index))
            }
            Phase::RepeatedStart => (1, 0),
            Phase::Stop => {
                self.set_line(ctx, Line::Scl, true)?;
                self.set_line(ctx, Line::Sda, true)?;
                (1, 0)
            }
        };

        let delay = bits * bit;
        let step = Continuation::I2cStep { bus: self.id };
        if stretch > 0 {
            tracing::trace!(%bus, stretch, "clock stretched");
            let release = ctx.schedule_after(delay + stretch, step);
            let timeout = self.stretch_timeout.map(|limit| {
                ctx.schedule_after(delay + limit, Continuation::I2cStretchTimeout { bus: self.id })
            });
            active.stretch = Some((release, timeout));
        } else {
            ctx.schedule_after(delay, step);
        }
        self.active = Some(active);
        Ok(())
    }

    /// The stretch timeout beat the release: abort the transfer.
    pub fn on_stretch_timeout(&mut self, ctx: &mut Ctx<'_>) -> SimResult<()> {
        let mut active = match self.active.take() {
            Some(active) => active,
            None => return Ok(()),
        };
        if let Some((release, _)) = active.stretch.take() {
            ctx.scheduler.cancel(release);
        }
        self.stats.stretch_timeouts += 1;
        tracing::warn!(bus = %self.bus(), id = active.id, "clock stretch timeout");

        self.set_line(ctx, Line::Scl, true)?;
        self.set_line(ctx, Line::Sda, true)?;
        self.finish(ctx, active, Outcome::StretchTimeout)
    }

    fn stretch_after(&mut self, key: AddressKey, index: usize) -> SimTime {
        self.responders
            .get_mut(&key)
            .map_or(0, |r| r.clock_stretch(index))
    }

    fn complete(&mut self, ctx: &mut Ctx<'_>, active: ActiveTransfer) -> SimResult<()> {
        let outcome = match active.nack {
            Some(phase) => {
                self.stats.nacks += 1;
                Outcome::Nack(phase)
            }
            None => Outcome::Completed,
        };
        self.finish(ctx, active, outcome)
    }

    fn finish(&mut self, ctx: &mut Ctx<'_>, active: ActiveTransfer, outcome: Outcome) -> SimResult<()> {
        if let Some(r) = self.responders.get_mut(&active.request.key()) {
            r.stop();
        }
        ctx.pins.set_bus_busy(self.bus(), false);
        let tx = ctx.transactions.finish(active.id, outcome, ctx.scheduler.now())?;
        ctx.publish(EventPayload::Transaction(tx));

        // Bus free time before the next queued Start
        if let Some(next) = self.waiting.pop_front() {
            ctx.schedule_after(
                self.speed.bit_time(),
                Continuation::I2cStart {
                    bus: self.id,
                    transaction: next,
                },
            );
        }
        Ok(())
    }

    /// Updates SDA or SCL, mirroring the level onto the header pin when it
    /// is bound to this bus.
    fn set_line(&mut self, ctx: &mut Ctx<'_>, line: Line, level: bool) -> SimResult<()> {
        let now = ctx.now();
        let signal = match line {
            Line::Sda => &mut self.sda,
            _ => &mut self.scl,
        };
        if signal.set_level(level, now)?.is_none() {
            return Ok(());
        }
        let bus = BusRef::I2c(self.id);
        ctx.line(bus, line, level);

        if let Some((sda, scl)) = ctx.pins.board().i2c_pins(self.id) {
            let pin = if line == Line::Sda { sda } else { scl };
            ctx.mirror(bus, pin, level)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for I2cController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I2cController")
            .field("id", &self.id)
            .field("speed", &self.speed)
            .field("responders", &self.responders.keys().collect::<Vec<_>>())
            .field("busy", &self.active.is_some())
            .field("waiting", &self.waiting.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_times() {
        assert_eq!(I2cSpeed::Standard.bit_time(), 10);
        assert_eq!(I2cSpeed::Fast.bit_time(), 3);
        assert_eq!(I2cSpeed::FastPlus.bit_time(), 1);
    }

    #[test]
    fn test_request_direction() {
        assert_eq!(I2cRequest::write(0x48, vec![1, 2]).direction(), Direction::Write);
        assert_eq!(I2cRequest::read(0x48, 2).direction(), Direction::Read);
        assert_eq!(
            I2cRequest::write_read(0x48, vec![0x00], 2).direction(),
            Direction::WriteRead
        );
        assert_eq!(I2cRequest::write(0x48, Vec::new()).direction(), Direction::Write);
    }

    #[test]
    fn test_address_validation() {
        assert!(I2cRequest::write(0x80, vec![0]).validate().is_err());
        assert!(I2cRequest::write(0x80, vec![0]).ten_bit().validate().is_ok());
        assert!(I2cRequest::read(0x400, 1).ten_bit().validate().is_err());
    }

    #[test]
    fn test_write_read_plan() {
        let plan: Vec<_> = I2cRequest::write_read(0x48, vec![0x10], 2).plan().into();
        assert_eq!(
            plan,
            vec![
                Phase::Address { read: false },
                Phase::WriteData(0),
                Phase::RepeatedStart,
                Phase::Address { read: true },
                Phase::ReadData(0),
                Phase::ReadData(1),
                Phase::Stop,
            ]
        );
    }

    struct Echo;

    impl I2cResponder for Echo {
        fn write_byte(&mut self, _byte: u8) -> bool {
            true
        }

        fn read_byte(&mut self) -> u8 {
            0
        }

        fn address_ack(&mut self, read: bool) -> bool {
            !read
        }
    }

    #[test]
    fn test_attach_and_scan() {
        let mut bus = I2cController::new(1, I2cSpeed::Fast, None);
        bus.attach(0x48, Box::new(Echo)).unwrap();
        bus.attach(0x03, Box::new(Echo)).unwrap();

        assert!(matches!(
            bus.attach(0x48, Box::new(Echo)),
            Err(SimError::AddressInUse { address: 0x48, .. })
        ));
        // Reserved addresses are skipped
        assert_eq!(bus.scan(), vec![0x48]);

        assert!(bus.detach(0x48, true).is_none());
        assert!(bus.detach(0x48, false).is_some());
        assert!(bus.scan().is_empty());
    }

    #[test]
    fn test_address_spaces_are_separate() {
        let mut bus = I2cController::new(1, I2cSpeed::Standard, None);
        bus.attach(0x48, Box::new(Echo)).unwrap();
        bus.attach_ten_bit(0x048, Box::new(Echo)).unwrap();
        assert!(bus.attach_ten_bit(0x048, Box::new(Echo)).is_err());

        // Out-of-range addresses are rejected at attach time
        assert!(bus.attach(0x1A5, Box::new(Echo)).is_err());
        assert!(bus.attach_ten_bit(0x400, Box::new(Echo)).is_err());

        // Only the 7-bit responder shows up in a scan
        assert_eq!(bus.scan(), vec![0x48]);
    }
}
