//! Built-in protocol models used by tests, demos and configuration files.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::controllers::{BitOrder, I2cResponder, SpiMode, SpiResponder};
use crate::error::{SimError, SimResult};
use crate::types::SimTime;

fn attr<T: FromStr>(attrs: &BTreeMap<String, String>, key: &str) -> SimResult<Option<T>> {
    match attrs.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SimError::InvalidParameter(format!("attribute {}={:?}", key, raw))),
    }
}

/// A 256-byte register file behind an auto-incrementing pointer, the layout
/// most I2C sensors use.
///
/// The first byte of every write transfer sets the pointer; further bytes
/// are stored from there. Reads return registers from the pointer onwards.
#[derive(Clone, Debug)]
pub struct I2cRegisterFile {
    registers: [u8; 256],
    pointer: u8,
    expect_pointer: bool,
    stretch_us: SimTime,
}

impl Default for I2cRegisterFile {
    fn default() -> Self {
        Self {
            registers: [0; 256],
            pointer: 0,
            expect_pointer: true,
            stretch_us: 0,
        }
    }
}

impl I2cRegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds SCL low for `stretch_us` after every byte.
    pub fn with_stretch(mut self, stretch_us: SimTime) -> Self {
        self.stretch_us = stretch_us;
        self
    }

    /// Presets a register.
    pub fn with_register(mut self, register: u8, value: u8) -> Self {
        self.registers[register as usize] = value;
        self
    }

    /// Builds from factory attributes: `stretch_us`, `fill`.
    pub fn from_attrs(attrs: &BTreeMap<String, String>) -> SimResult<Self> {
        let mut device = Self::new();
        if let Some(stretch) = attr(attrs, "stretch_us")? {
            device.stretch_us = stretch;
        }
        if let Some(fill) = attr::<u8>(attrs, "fill")? {
            device.registers = [fill; 256];
        }
        Ok(device)
    }

    pub fn register(&self, register: u8) -> u8 {
        self.registers[register as usize]
    }
}

impl I2cResponder for I2cRegisterFile {
    fn address_ack(&mut self, read: bool) -> bool {
        self.expect_pointer = !read;
        true
    }

    fn write_byte(&mut self, byte: u8) -> bool {
        if self.expect_pointer {
            self.pointer = byte;
            self.expect_pointer = false;
        } else {
            self.registers[self.pointer as usize] = byte;
            self.pointer = self.pointer.wrapping_add(1);
        }
        true
    }

    fn read_byte(&mut self) -> u8 {
        let value = self.registers[self.pointer as usize];
        self.pointer = self.pointer.wrapping_add(1);
        value
    }

    fn clock_stretch(&mut self, _index: usize) -> SimTime {
        self.stretch_us
    }
}

/// Echoes every MOSI byte back on MISO in the same exchange.
///
/// It can declare its own mode and bit order to exercise mismatches.
#[derive(Clone, Debug, Default)]
pub struct SpiLoopback {
    mode: Option<SpiMode>,
    bit_order: Option<BitOrder>,
    exchanged: u64,
}

impl SpiLoopback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: SpiMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_bit_order(mut self, order: BitOrder) -> Self {
        self.bit_order = Some(order);
        self
    }

    /// Builds from factory attributes: `mode` (0-3), `bit_order` (`msb`/`lsb`).
    pub fn from_attrs(attrs: &BTreeMap<String, String>) -> SimResult<Self> {
        let mut device = Self::new();
        if let Some(mode) = attr::<u8>(attrs, "mode")? {
            device.mode = Some(SpiMode::from_number(mode)?);
        }
        device.bit_order = match attrs.get("bit_order").map(String::as_str) {
            None => None,
            Some("msb") => Some(BitOrder::MsbFirst),
            Some("lsb") => Some(BitOrder::LsbFirst),
            Some(other) => {
                return Err(SimError::InvalidParameter(format!("bit_order={:?}", other)))
            }
        };
        Ok(device)
    }

    pub fn exchanged(&self) -> u64 {
        self.exchanged
    }
}

impl SpiResponder for SpiLoopback {
    fn exchange(&mut self, mosi: u8) -> u8 {
        self.exchanged += 1;
        mosi
    }

    fn mode(&self) -> Option<SpiMode> {
        self.mode
    }

    fn bit_order(&self) -> Option<BitOrder> {
        self.bit_order
    }
}
