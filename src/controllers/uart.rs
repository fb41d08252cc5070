//! UART controller.
//!
//! Transmit and receive are independent scheduled chains. The transmitter
//! puts one frame on the line per `UartTxFrame` step, timed by its own baud
//! rate. The receiving port observes the start edge (`UartLineStart`) and
//! samples the frame at the middle of each of *its own* bit periods when its
//! own frame time has elapsed (`UartRxSample`). A baud mismatch between the
//! two sides therefore shows up the way it does on real wires: as framing
//! errors or garbage bytes.
//!
//! Bit times are kept in nanoseconds so common baud rates do not collapse
//! onto the microsecond grid; only frame completion times are rounded up to
//! whole microseconds.
//!
//! While a transmit chain runs, pins bound to the port are busy and the TX
//! level is copied onto the TX pin.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::event::{EventPayload, Line};
use crate::scheduler::Continuation;
use crate::signal::Signal;
use crate::transaction::{Direction, Outcome, Participant};
use crate::types::{ceil_div_min1, BusRef, PortId, SimTime, TransactionId};

use super::Ctx;

/// Default receive buffer size in bytes.
pub const DEFAULT_RX_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl StopBits {
    pub fn count(&self) -> u8 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

/// Line error reported by a receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UartErrorKind {
    Framing,
    Parity,
    Overrun,
}

/// Line settings of one side of a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartSettings {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for UartSettings {
    fn default() -> Self {
        Self {
            baud: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl UartSettings {
    /// One bit period in nanoseconds.
    pub fn bit_ns(&self) -> u64 {
        let baud = u64::from(self.baud.max(1));
        (1_000_000_000 + baud / 2) / baud
    }

    /// Bits per frame: start, data, parity, stop.
    pub fn frame_bits(&self) -> u8 {
        let parity = if self.parity == Parity::None { 0 } else { 1 };
        1 + self.data_bits + parity + self.stop_bits.count()
    }

    /// Frame duration in whole microseconds, rounded up.
    pub fn frame_time(&self) -> SimTime {
        ceil_div_min1(u64::from(self.frame_bits()) * self.bit_ns(), 1000)
    }

    fn parity_bit(&self, data: u8) -> bool {
        let odd_ones = data.count_ones() % 2 == 1;
        match self.parity {
            Parity::Even => odd_ones,
            Parity::Odd => !odd_ones,
            Parity::None => false,
        }
    }

    fn data_mask(&self) -> u8 {
        ((1u16 << self.data_bits) - 1) as u8
    }

    /// Encodes a byte into the waveform of one frame.
    pub fn encode(&self, byte: u8) -> UartFrame {
        let data = byte & self.data_mask();
        // Bit 0 is the start bit and stays low
        let mut levels = u16::from(data) << 1;
        let mut next = 1 + self.data_bits;
        if self.parity != Parity::None {
            if self.parity_bit(data) {
                levels |= 1 << next;
            }
            next += 1;
        }
        for _ in 0..self.stop_bits.count() {
            levels |= 1 << next;
            next += 1;
        }
        UartFrame {
            levels,
            len: next,
            bit_ns: self.bit_ns(),
            data,
        }
    }
}

/// One character frame as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UartFrame {
    /// Bit `i` is the line level during bit period `i`
    levels: u16,
    len: u8,
    /// Transmitter bit period in nanoseconds
    bit_ns: u64,
    data: u8,
}

impl UartFrame {
    /// The data the transmitter intended to send.
    pub fn data(&self) -> u8 {
        self.data
    }

    /// Line level at `offset_ns` after the start edge; idle (high) once the
    /// frame is over.
    fn level_at(&self, offset_ns: u64) -> bool {
        let index = offset_ns / self.bit_ns.max(1);
        if index >= u64::from(self.len) {
            return true;
        }
        (self.levels >> index) & 1 == 1
    }
}

/// The result of sampling a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoded {
    Byte(u8),
    ParityError(u8),
    FramingError,
}

/// Samples `frame` with receiver settings `rx`, at the middle of each
/// receiver bit period.
pub fn decode_frame(frame: &UartFrame, rx: &UartSettings) -> Decoded {
    let bit = rx.bit_ns();
    let sample = |i: u64| frame.level_at((2 * i + 1) * bit / 2);

    if sample(0) {
        return Decoded::FramingError;
    }
    let mut data = 0u8;
    for i in 0..rx.data_bits {
        if sample(1 + u64::from(i)) {
            data |= 1 << i;
        }
    }
    let mut next = 1 + u64::from(rx.data_bits);
    let parity_ok = if rx.parity == Parity::None {
        true
    } else {
        let bit = sample(next);
        next += 1;
        bit == rx.parity_bit(data)
    };
    for _ in 0..rx.stop_bits.count() {
        if !sample(next) {
            return Decoded::FramingError;
        }
        next += 1;
    }
    if parity_ok {
        Decoded::Byte(data)
    } else {
        Decoded::ParityError(data)
    }
}

/// Error injection settings of a receiver.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorInjection {
    /// Probability per received byte, 0.0..=1.0
    pub rate: f64,
    /// Kinds drawn from when the rate fires
    pub kinds: Vec<UartErrorKind>,
    pub seed: u64,
}

impl Default for ErrorInjection {
    fn default() -> Self {
        Self {
            rate: 0.0,
            kinds: vec![UartErrorKind::Framing, UartErrorKind::Parity],
            seed: 0,
        }
    }
}

/// Counters for one port.
#[derive(Clone, Debug, Default)]
pub struct UartStats {
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub framing_errors: u64,
    pub parity_errors: u64,
    pub overruns: u64,
    /// Queued bytes discarded by a transmit flush
    pub tx_flushed: u64,
}

/// One UART port.
#[derive(Debug)]
pub struct UartController {
    id: PortId,
    settings: UartSettings,
    open: bool,
    peer: Option<PortId>,
    rx: VecDeque<u8>,
    rx_capacity: usize,
    tx_queue: VecDeque<(TransactionId, u8)>,
    tx_busy: bool,
    /// Transaction whose last frame is on the line
    tx_finishing: Option<TransactionId>,
    tx_line: Signal,
    injection: ErrorInjection,
    scripted: VecDeque<UartErrorKind>,
    rng: ChaCha8Rng,
    stats: UartStats,
}

impl UartController {
    pub fn new(id: PortId, settings: UartSettings, rx_capacity: usize, injection: ErrorInjection) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(injection.seed ^ u64::from(id));
        Self {
            id,
            settings,
            open: true,
            peer: None,
            rx: VecDeque::with_capacity(rx_capacity),
            rx_capacity: rx_capacity.max(1),
            tx_queue: VecDeque::new(),
            tx_busy: false,
            tx_finishing: None,
            tx_line: Signal::digital(true, 64),
            injection,
            scripted: VecDeque::new(),
            rng,
            stats: UartStats::default(),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn bus(&self) -> BusRef {
        BusRef::Uart(self.id)
    }

    pub fn settings(&self) -> UartSettings {
        self.settings
    }

    pub fn stats(&self) -> &UartStats {
        &self.stats
    }

    pub fn peer(&self) -> Option<PortId> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: Option<PortId>) {
        self.peer = peer;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Opens or closes the port. A closed port ignores incoming frames and
    /// refuses writes.
    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    /// Replaces the line settings. Frames already on the line keep the
    /// settings they started with; the next frame in either direction uses
    /// the new ones.
    pub fn configure(&mut self, settings: UartSettings) -> SimResult<()> {
        if settings.baud == 0 {
            return Err(SimError::InvalidParameter("uart baud must be non-zero".into()));
        }
        if !(5..=8).contains(&settings.data_bits) {
            return Err(SimError::InvalidParameter(format!(
                "uart data_bits {} outside 5..=8",
                settings.data_bits
            )));
        }
        tracing::debug!(port = self.id, ?settings, "uart reconfigured");
        self.settings = settings;
        Ok(())
    }

    fn ensure_open(&self) -> SimResult<()> {
        if !self.open {
            return Err(SimError::InvalidParameter(format!("{} is closed", self.bus())));
        }
        Ok(())
    }

    /// Queues an error to apply to the next received frame.
    pub fn inject_error(&mut self, kind: UartErrorKind) {
        self.scripted.push_back(kind);
    }

    /// Queues bytes for transmission.
    pub fn write(&mut self, ctx: &mut Ctx<'_>, bytes: &[u8]) -> SimResult<TransactionId> {
        self.ensure_open()?;
        if bytes.is_empty() {
            return Err(SimError::InvalidParameter("empty uart write".into()));
        }
        let mut participants = vec![Participant::Port(self.id)];
        participants.extend(self.peer.map(Participant::Port));
        let now = ctx.now();
        let id = ctx
            .transactions
            .begin(self.bus(), Direction::Transmit, participants, now);
        self.tx_queue.extend(bytes.iter().map(|&b| (id, b)));

        if !self.tx_busy {
            self.tx_busy = true;
            ctx.pins.set_bus_busy(self.bus(), true);
            ctx.scheduler
                .schedule_at(now, Continuation::UartTxFrame { port: self.id })?;
        }
        Ok(id)
    }

    /// Start of a frame period on the transmit side.
    pub fn on_tx_frame(&mut self, ctx: &mut Ctx<'_>) -> SimResult<()> {
        if let Some(done) = self.tx_finishing.take() {
            let tx = ctx.transactions.finish(done, Outcome::Completed, ctx.scheduler.now())?;
            ctx.publish(EventPayload::Transaction(tx));
        }

        let (id, byte) = match self.tx_queue.pop_front() {
            Some(next) => next,
            None => {
                self.tx_busy = false;
                ctx.pins.set_bus_busy(self.bus(), false);
                return self.set_tx_line(ctx, true);
            }
        };

        let frame = self.settings.encode(byte);
        ctx.transactions.open_mut(id)?.push_out(byte)?;
        if self.tx_queue.front().map(|&(next, _)| next) != Some(id) {
            self.tx_finishing = Some(id);
        }
        self.stats.frames_sent += 1;
        self.set_tx_line(ctx, false)?;

        if let Some(peer) = self.peer {
            let now = ctx.now();
            ctx.scheduler
                .schedule_at(now, Continuation::UartLineStart { port: peer, frame })?;
        }
        ctx.schedule_after(
            self.settings.frame_time(),
            Continuation::UartTxFrame { port: self.id },
        );
        Ok(())
    }

    /// Feeds bytes into this port's receiver as if a peer sent them at this
    /// port's own line settings, back to back starting now.
    pub fn inject(&mut self, ctx: &mut Ctx<'_>, bytes: &[u8]) -> SimResult<()> {
        self.ensure_open()?;
        let frame_time = self.settings.frame_time();
        for (k, &byte) in bytes.iter().enumerate() {
            let frame = self.settings.encode(byte);
            ctx.schedule_after(
                k as SimTime * frame_time,
                Continuation::UartLineStart { port: self.id, frame },
            );
        }
        Ok(())
    }

    /// A start edge arrived: sample the frame once our own frame time is up.
    pub fn on_line_start(&mut self, ctx: &mut Ctx<'_>, frame: UartFrame) -> SimResult<()> {
        if !self.open {
            return Ok(());
        }
        let settings = self.settings;
        ctx.schedule_after(
            settings.frame_time(),
            Continuation::UartRxSample { port: self.id, frame, settings },
        );
        Ok(())
    }

    /// Decodes a frame and delivers the byte into the receive buffer.
    pub fn on_rx_sample(
        &mut self,
        ctx: &mut Ctx<'_>,
        frame: UartFrame,
        settings: UartSettings,
    ) -> SimResult<()> {
        if !self.open {
            return Ok(());
        }
        let mut decoded = decode_frame(&frame, &settings);
        let mut force_overrun = false;
        match self.next_injected() {
            Some(UartErrorKind::Framing) => decoded = Decoded::FramingError,
            Some(UartErrorKind::Parity) => {
                if let Decoded::Byte(b) = decoded {
                    decoded = Decoded::ParityError(b);
                }
            }
            Some(UartErrorKind::Overrun) => force_overrun = true,
            None => {}
        }

        match decoded {
            Decoded::FramingError => {
                self.stats.framing_errors += 1;
                tracing::warn!(port = self.id, sent = frame.data(), "uart framing error");
                ctx.publish(EventPayload::UartError {
                    port: self.id,
                    kind: UartErrorKind::Framing,
                    byte: None,
                });
                Ok(())
            }
            Decoded::ParityError(byte) => {
                self.stats.parity_errors += 1;
                tracing::warn!(port = self.id, byte, "uart parity error");
                ctx.publish(EventPayload::UartError {
                    port: self.id,
                    kind: UartErrorKind::Parity,
                    byte: Some(byte),
                });
                self.deliver(ctx, byte, force_overrun);
                Ok(())
            }
            Decoded::Byte(byte) => {
                self.deliver(ctx, byte, force_overrun);
                Ok(())
            }
        }
    }

    fn next_injected(&mut self) -> Option<UartErrorKind> {
        if let Some(kind) = self.scripted.pop_front() {
            return Some(kind);
        }
        if self.injection.rate <= 0.0 || self.injection.kinds.is_empty() {
            return None;
        }
        if self.rng.gen::<f64>() < self.injection.rate {
            let index = self.rng.gen_range(0..self.injection.kinds.len());
            return Some(self.injection.kinds[index]);
        }
        None
    }

    fn deliver(&mut self, ctx: &mut Ctx<'_>, byte: u8, force_overrun: bool) {
        if self.rx.len() >= self.rx_capacity || force_overrun {
            let dropped = self.rx.pop_front();
            self.stats.overruns += 1;
            tracing::warn!(port = self.id, ?dropped, "uart overrun");
            ctx.publish(EventPayload::UartError {
                port: self.id,
                kind: UartErrorKind::Overrun,
                byte: dropped,
            });
        }
        self.rx.push_back(byte);
        self.stats.bytes_received += 1;
        ctx.publish(EventPayload::UartRx { port: self.id, byte });
    }

    /// Takes up to `max` bytes from the receive buffer, oldest first.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.rx.len());
        self.rx.drain(..n).collect()
    }

    /// Returns the number of buffered received bytes.
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// Discards the receive buffer and returns how many bytes were dropped.
    pub fn flush(&mut self) -> usize {
        let n = self.rx.len();
        self.rx.clear();
        n
    }

    /// Discards bytes still waiting to be sent and returns how many were
    /// dropped. The frame on the line finishes; every write that loses bytes
    /// ends as [`Outcome::Aborted`].
    pub fn flush_tx(&mut self, ctx: &mut Ctx<'_>) -> SimResult<usize> {
        let dropped: Vec<_> = self.tx_queue.drain(..).collect();
        let mut aborted: Vec<TransactionId> = dropped.iter().map(|&(id, _)| id).collect();
        aborted.dedup();

        let now = ctx.now();
        for id in aborted {
            let tx = ctx.transactions.finish(id, Outcome::Aborted, now)?;
            ctx.publish(EventPayload::Transaction(tx));
        }
        self.stats.tx_flushed += dropped.len() as u64;
        if !dropped.is_empty() {
            tracing::debug!(port = self.id, dropped = dropped.len(), "uart tx flushed");
        }
        Ok(dropped.len())
    }

    /// Returns true while frames are queued or on the line.
    pub fn is_transmitting(&self) -> bool {
        self.tx_busy
    }

    /// Returns the TX line signal.
    pub fn tx_line(&self) -> &Signal {
        &self.tx_line
    }

    fn set_tx_line(&mut self, ctx: &mut Ctx<'_>, level: bool) -> SimResult<()> {
        if self.tx_line.set_level(level, ctx.now())?.is_none() {
            return Ok(());
        }
        let bus = self.bus();
        ctx.line(bus, Line::Tx, level);
        if let Some((tx, _)) = ctx.pins.board().uart_pins(self.id) {
            ctx.mirror(bus, tx, level)?;
        }
        Ok(())
    }
}
