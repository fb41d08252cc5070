//! Bus transactions.
//!
//! A [`BusTransaction`] is opened when a controller accepts a transfer and is
//! finalized exactly once, on completion or abort. After that it is
//! immutable: any attempt to modify it is a fatal
//! [`SimError::TransactionFinalized`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::types::{BusRef, ControllerId, PortId, SimTime, TransactionId};

/// Data direction of a transaction, from the master's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Write,
    Read,
    /// Write followed by a repeated start and a read
    WriteRead,
    /// SPI: every byte out has a byte in
    FullDuplex,
    /// UART transmit
    Transmit,
}

/// Where in an I2C transfer a NACK was seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackPhase {
    Address,
    /// Index of the refused data byte
    Data(usize),
}

/// How a transaction ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Nack(NackPhase),
    ArbitrationLost,
    StretchTimeout,
    /// Dropped by the driver before every byte went out
    Aborted,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

/// A party to a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Participant {
    Controller(ControllerId),
    I2cAddress(u16),
    ChipSelect(u8),
    Port(PortId),
}

/// One bus transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusTransaction {
    id: TransactionId,
    bus: BusRef,
    participants: Vec<Participant>,
    direction: Direction,
    bytes_out: Vec<u8>,
    bytes_in: Vec<u8>,
    start: SimTime,
    end: Option<SimTime>,
    outcome: Option<Outcome>,
}

impl BusTransaction {
    /// Opens a transaction.
    pub fn new(
        id: TransactionId,
        bus: BusRef,
        direction: Direction,
        participants: Vec<Participant>,
        start: SimTime,
    ) -> Self {
        Self {
            id,
            bus,
            participants,
            direction,
            bytes_out: Vec::new(),
            bytes_in: Vec::new(),
            start,
            end: None,
            outcome: None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn bus(&self) -> BusRef {
        self.bus
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes sent by the master.
    pub fn bytes_out(&self) -> &[u8] {
        &self.bytes_out
    }

    /// Bytes received by the master.
    pub fn bytes_in(&self) -> &[u8] {
        &self.bytes_in
    }

    pub fn start(&self) -> SimTime {
        self.start
    }

    pub fn end(&self) -> Option<SimTime> {
        self.end
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn is_finalized(&self) -> bool {
        self.outcome.is_some()
    }

    /// Returns the transaction length once finalized.
    pub fn duration(&self) -> Option<SimTime> {
        self.end.map(|end| end - self.start)
    }

    fn ensure_open(&self) -> SimResult<()> {
        if self.is_finalized() {
            return Err(SimError::TransactionFinalized(self.id));
        }
        Ok(())
    }

    pub fn push_out(&mut self, byte: u8) -> SimResult<()> {
        self.ensure_open()?;
        self.bytes_out.push(byte);
        Ok(())
    }

    pub fn push_in(&mut self, byte: u8) -> SimResult<()> {
        self.ensure_open()?;
        self.bytes_in.push(byte);
        Ok(())
    }

    /// Closes the transaction with `outcome` at time `at`.
    pub fn finalize(&mut self, outcome: Outcome, at: SimTime) -> SimResult<()> {
        self.ensure_open()?;
        self.outcome = Some(outcome);
        self.end = Some(at);
        Ok(())
    }
}

/// Allocates transaction ids and keeps every transaction of a run.
#[derive(Debug, Default)]
pub struct TransactionLog {
    next_id: TransactionId,
    transactions: BTreeMap<TransactionId, BusTransaction>,
    completed: u64,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new transaction and returns its id.
    pub fn begin(
        &mut self,
        bus: BusRef,
        direction: Direction,
        participants: Vec<Participant>,
        start: SimTime,
    ) -> TransactionId {
        self.next_id += 1;
        let id = self.next_id;
        self.transactions
            .insert(id, BusTransaction::new(id, bus, direction, participants, start));
        id
    }

    pub fn get(&self, id: TransactionId) -> Option<&BusTransaction> {
        self.transactions.get(&id)
    }

    /// Returns an open transaction for modification.
    pub fn open_mut(&mut self, id: TransactionId) -> SimResult<&mut BusTransaction> {
        let tx = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| SimError::InvalidParameter(format!("no transaction {}", id)))?;
        tx.ensure_open()?;
        Ok(tx)
    }

    /// Finalizes a transaction and returns a copy for publishing.
    pub fn finish(
        &mut self,
        id: TransactionId,
        outcome: Outcome,
        at: SimTime,
    ) -> SimResult<BusTransaction> {
        let tx = self.open_mut(id)?;
        tx.finalize(outcome, at)?;
        let finished = tx.clone();
        self.completed += 1;
        tracing::debug!(
            id,
            bus = %finished.bus(),
            ?outcome,
            bytes_out = finished.bytes_out().len(),
            bytes_in = finished.bytes_in().len(),
            "transaction finalized"
        );
        Ok(finished)
    }

    /// Returns the number of finalized transactions.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Iterates over every transaction in id order.
    pub fn iter(&self) -> impl Iterator<Item = &BusTransaction> {
        self.transactions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_once() {
        let mut tx = BusTransaction::new(1, BusRef::I2c(1), Direction::Write, Vec::new(), 10);
        tx.push_out(0xAB).unwrap();
        tx.finalize(Outcome::Completed, 30).unwrap();

        assert_eq!(tx.duration(), Some(20));
        assert!(matches!(
            tx.finalize(Outcome::ArbitrationLost, 40),
            Err(SimError::TransactionFinalized(1))
        ));
        let err = tx.push_out(0xCD).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(tx.bytes_out(), &[0xAB]);
        assert_eq!(tx.outcome(), Some(Outcome::Completed));
    }

    #[test]
    fn test_log_allocates_ids() {
        let mut log = TransactionLog::new();
        let a = log.begin(BusRef::Spi(0), Direction::FullDuplex, Vec::new(), 0);
        let b = log.begin(BusRef::Spi(0), Direction::FullDuplex, Vec::new(), 0);
        assert!(b > a);

        log.open_mut(a).unwrap().push_in(0x42).unwrap();
        let done = log.finish(a, Outcome::Completed, 8).unwrap();
        assert_eq!(done.bytes_in(), &[0x42]);
        assert_eq!(log.completed(), 1);

        assert!(log.open_mut(a).unwrap_err().is_fatal());
        assert!(log.finish(a, Outcome::Completed, 9).is_err());
        assert!(!log.get(b).unwrap().is_finalized());
    }

    #[test]
    fn test_transaction_serialization() {
        let mut tx = BusTransaction::new(
            7,
            BusRef::I2c(1),
            Direction::Read,
            vec![Participant::I2cAddress(0x48)],
            0,
        );
        tx.finalize(Outcome::Nack(NackPhase::Address), 20).unwrap();

        let json = serde_json::to_string(&tx).unwrap();
        let restored: BusTransaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, restored);
    }
}
