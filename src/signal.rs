//! Digital/analog signal state with edge detection and bounded history.
//!
//! A `Signal` is owned by exactly one pin or bus line. It only records a
//! sample when the value actually changes, so writing the same level twice
//! produces a single transition.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::types::SimTime;

/// Default number of samples retained per signal.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// The value carried by a signal.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalValue {
    Digital(bool),
    Analog(f64),
}

impl SignalValue {
    /// Interprets the value as a logic level (analog uses a 0.5 threshold).
    pub fn as_level(&self) -> bool {
        match self {
            SignalValue::Digital(level) => *level,
            SignalValue::Analog(v) => *v >= 0.5,
        }
    }

    fn same_kind(&self, other: &SignalValue) -> bool {
        matches!(
            (self, other),
            (SignalValue::Digital(_), SignalValue::Digital(_))
                | (SignalValue::Analog(_), SignalValue::Analog(_))
        )
    }
}

/// A digital transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// Returns the edge between two consecutive digital levels, if any.
    pub fn between(from: bool, to: bool) -> Option<Edge> {
        match (from, to) {
            (false, true) => Some(Edge::Rising),
            (true, false) => Some(Edge::Falling),
            _ => None,
        }
    }
}

/// Which edges an edge detector reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeDetect {
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    /// Returns true if this detector reports `edge`.
    pub fn matches(&self, edge: Edge) -> bool {
        match self {
            EdgeDetect::Rising => edge == Edge::Rising,
            EdgeDetect::Falling => edge == Edge::Falling,
            EdgeDetect::Both => true,
        }
    }
}

/// A timestamped signal value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: SimTime,
    pub value: SignalValue,
}

/// The result of a [`Signal::set`] that changed the value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transition {
    pub from: SignalValue,
    pub to: SignalValue,
    /// Set for digital signals only
    pub edge: Option<Edge>,
}

/// Time-stamped value with bounded, time-ordered history.
///
/// History holds transitions only. The value before the oldest retained
/// sample is kept as the baseline, so a change at time zero is an edge like
/// any other.
#[derive(Clone, Debug)]
pub struct Signal {
    value: SignalValue,
    baseline: SignalValue,
    last_transition: SimTime,
    history: VecDeque<Sample>,
    capacity: usize,
}

impl Signal {
    /// Creates a signal holding `initial` since time zero.
    pub fn new(initial: SignalValue, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            value: initial,
            baseline: initial,
            last_transition: 0,
            history: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
        }
    }

    /// Creates a digital signal.
    pub fn digital(level: bool, capacity: usize) -> Self {
        Self::new(SignalValue::Digital(level), capacity)
    }

    /// Creates an analog signal.
    pub fn analog(value: f64, capacity: usize) -> Self {
        Self::new(SignalValue::Analog(value), capacity)
    }

    /// Returns the latest value.
    pub fn read(&self) -> SignalValue {
        self.value
    }

    /// Returns the latest value as a logic level.
    pub fn level(&self) -> bool {
        self.value.as_level()
    }

    /// Returns the value the signal held before its oldest retained sample.
    pub fn baseline(&self) -> SignalValue {
        self.baseline
    }

    /// Returns the time of the last actual change.
    pub fn last_transition(&self) -> SimTime {
        self.last_transition
    }

    /// Sets a new value at time `at`.
    ///
    /// Returns `None` when the value is unchanged (edge suppression). Going
    /// back in time is a [`SimError::TimeOrderViolation`]. A second change at
    /// the same instant replaces the sample taken at that instant, or removes
    /// it when the value returns to what it was before, so the history never
    /// holds two different values for one timestamp.
    pub fn set(&mut self, value: SignalValue, at: SimTime) -> SimResult<Option<Transition>> {
        if !self.value.same_kind(&value) {
            return Err(SimError::InvalidParameter(format!(
                "cannot store {:?} in a signal holding {:?}",
                value, self.value
            )));
        }
        if at < self.last_transition {
            return Err(SimError::TimeOrderViolation {
                now: self.last_transition,
                requested: at,
            });
        }
        if value == self.value {
            return Ok(None);
        }

        let from = self.value;
        let edge = match (from, value) {
            (SignalValue::Digital(a), SignalValue::Digital(b)) => Edge::between(a, b),
            _ => None,
        };

        match self.history.back().map(|s| s.time) {
            Some(time) if time == at => {
                let before = self.value_before_last();
                if before == value {
                    self.history.pop_back();
                } else if let Some(last) = self.history.back_mut() {
                    last.value = value;
                }
            }
            _ => {
                self.history.push_back(Sample { time: at, value });
                while self.history.len() > self.capacity {
                    if let Some(evicted) = self.history.pop_front() {
                        self.baseline = evicted.value;
                    }
                }
            }
        }

        self.value = value;
        self.last_transition = at;
        Ok(Some(Transition {
            from,
            to: value,
            edge,
        }))
    }

    fn value_before_last(&self) -> SignalValue {
        match self.history.len() {
            0 | 1 => self.baseline,
            n => self.history[n - 2].value,
        }
    }

    /// Sets a digital level, returning the edge if the level changed.
    pub fn set_level(&mut self, level: bool, at: SimTime) -> SimResult<Option<Edge>> {
        Ok(self
            .set(SignalValue::Digital(level), at)?
            .and_then(|t| t.edge))
    }

    /// Returns the retained samples, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Sample> {
        self.history.iter()
    }

    /// Returns the number of retained samples.
    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    /// Returns the retained samples within `[start, end]`.
    pub fn samples_between(&self, start: SimTime, end: SimTime) -> Vec<Sample> {
        self.history
            .iter()
            .filter(|s| s.time >= start && s.time <= end)
            .copied()
            .collect()
    }

    /// Returns the digital edges recorded in history, computed from
    /// consecutive samples starting at the baseline.
    pub fn edges(&self) -> Vec<(SimTime, Edge)> {
        let mut previous = self.baseline.as_level();
        self.history
            .iter()
            .filter_map(|s| {
                let level = s.value.as_level();
                let edge = Edge::between(previous, level).map(|e| (s.time, e));
                previous = level;
                edge
            })
            .collect()
    }

    /// Counts edges matching `detect` with timestamps in `[start, end)`.
    pub fn count_edges(&self, detect: EdgeDetect, start: SimTime, end: SimTime) -> usize {
        self.edges()
            .into_iter()
            .filter(|&(t, e)| t >= start && t < end && detect.matches(e))
            .count()
    }

    /// Estimates frequency in Hz from rising edges within the last `window`
    /// microseconds of history.
    pub fn frequency(&self, window: SimTime) -> Option<f64> {
        let end = self.history.back()?.time;
        let start = end.saturating_sub(window);
        let rising = self.count_edges(EdgeDetect::Rising, start, end + 1);
        if rising == 0 || window == 0 {
            return None;
        }
        Some(rising as f64 * 1_000_000.0 / window as f64)
    }
}
