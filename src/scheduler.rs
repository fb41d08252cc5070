//! Future-event scheduler.
//!
//! The scheduler owns the [`Clock`] and a priority queue of continuations
//! keyed by `(due time, sequence number)`. Sequence numbers are assigned at
//! scheduling time and only ever increase, so events due at the same instant
//! fire in the order they were scheduled, identically on every run.
//!
//! Continuations are plain data ([`Continuation`]) rather than closures: the
//! kernel dispatches each variant to the controller that scheduled it. This
//! keeps the queue free of borrows into controller state.

use std::collections::BTreeMap;

use crate::clock::{Clock, TimestepMode};
use crate::controllers::uart::{UartFrame, UartSettings};
use crate::error::{SimError, SimResult};
use crate::types::{BusId, PinId, PortId, SimTime, TransactionId};

/// The work to perform when a scheduled event comes due.
#[derive(Clone, Debug, PartialEq)]
pub enum Continuation {
    /// Fixed-timestep sampling tick.
    Tick { index: u64 },
    /// Wake-up requested by an external cooperative runner.
    Wake { token: u64 },
    /// Arbitrate and begin a queued I2C transfer.
    I2cStart { bus: BusId, transaction: TransactionId },
    /// Next protocol phase of the active I2C transfer.
    I2cStep { bus: BusId },
    /// Clock-stretch timeout racing the stretch release.
    I2cStretchTimeout { bus: BusId },
    /// One byte of the active SPI transfer has been shifted.
    SpiByte { bus: BusId },
    /// Transmitter is ready to put the next frame on the line.
    UartTxFrame { port: PortId },
    /// Receiver observes the falling edge of a start bit.
    UartLineStart { port: PortId, frame: UartFrame },
    /// Receiver has sampled the last bit of a frame, with the line settings
    /// it had at the start edge.
    UartRxSample { port: PortId, frame: UartFrame, settings: UartSettings },
    /// PWM boundary: rising or falling edge of the waveform.
    PwmEdge { pin: PinId, rising: bool },
    /// Trailing edge of an injected glitch: restore `level`.
    GlitchEnd { pin: PinId, level: bool },
    /// Re-publish a recorded trace event.
    Replay { index: usize },
}

/// Handle to a scheduled event, used for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventHandle {
    due: SimTime,
    sequence: u64,
}

impl EventHandle {
    /// Returns the time at which the event is due.
    pub fn due(&self) -> SimTime {
        self.due
    }

    /// Returns the tie-break sequence number assigned at scheduling time.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// An event taken off the queue, ready to run.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledEvent {
    pub due: SimTime,
    pub sequence: u64,
    pub continuation: Continuation,
}

/// Statistics collected by the scheduler.
#[derive(Clone, Debug, Default)]
pub struct SchedulerStats {
    /// Events scheduled
    pub scheduled: u64,
    /// Events handed out for execution
    pub fired: u64,
    /// Events removed before firing
    pub cancelled: u64,
}

/// Priority queue of future events driving the clock.
#[derive(Debug)]
pub struct Scheduler {
    clock: Clock,
    queue: BTreeMap<(SimTime, u64), Continuation>,
    next_sequence: u64,
    stats: SchedulerStats,
}

impl Scheduler {
    /// Creates an empty scheduler with its clock at zero.
    pub fn new(mode: TimestepMode) -> Self {
        Self {
            clock: Clock::new(mode),
            queue: BTreeMap::new(),
            next_sequence: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// Returns the current simulation time.
    pub fn now(&self) -> SimTime {
        self.clock.now()
    }

    /// Returns the clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Schedules `continuation` at absolute time `t`.
    ///
    /// Fails with [`SimError::PastScheduling`] when `t` is before now.
    pub fn schedule_at(&mut self, t: SimTime, continuation: Continuation) -> SimResult<EventHandle> {
        let now = self.clock.now();
        if t < now {
            return Err(SimError::PastScheduling { now, requested: t });
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queue.insert((t, sequence), continuation);
        self.stats.scheduled += 1;
        Ok(EventHandle { due: t, sequence })
    }

    /// Schedules `continuation` `delay` microseconds from now.
    pub fn schedule_after(&mut self, delay: SimTime, continuation: Continuation) -> EventHandle {
        let due = self.clock.now().saturating_add(delay);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queue.insert((due, sequence), continuation);
        self.stats.scheduled += 1;
        EventHandle { due, sequence }
    }

    /// Removes a not-yet-fired event.
    ///
    /// Returns false if the event already fired or was already cancelled;
    /// neither case is an error.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        let removed = self.queue.remove(&(handle.due, handle.sequence)).is_some();
        if removed {
            self.stats.cancelled += 1;
        }
        removed
    }

    /// Returns true if the event is still waiting to fire.
    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.queue.contains_key(&(handle.due, handle.sequence))
    }

    /// Returns the due time of the next event, if any.
    pub fn peek_due(&self) -> Option<SimTime> {
        self.queue.keys().next().map(|&(due, _)| due)
    }

    /// Takes the next event due at or before `limit`, advancing the clock to
    /// its due time first so the continuation observes `now() == due`.
    pub fn pop_due(&mut self, limit: SimTime) -> SimResult<Option<ScheduledEvent>> {
        let due = match self.peek_due() {
            Some(due) if due <= limit => due,
            _ => return Ok(None),
        };
        self.clock.advance_to(due)?;
        let ((due, sequence), continuation) = match self.queue.pop_first() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.stats.fired += 1;
        Ok(Some(ScheduledEvent {
            due,
            sequence,
            continuation,
        }))
    }

    /// Moves the clock to `t` without firing anything.
    ///
    /// Callers must have drained every event due before `t`.
    pub fn advance_to(&mut self, t: SimTime) -> SimResult<()> {
        self.clock.advance_to(t)
    }

    /// Returns the number of pending events.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Returns the scheduler statistics.
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}
