//! Kernel configuration.
//!
//! A [`KernelConfig`] is consumed once, at kernel construction. It can be
//! written by hand in YAML or JSON, built with [`KernelConfigBuilder`], and
//! is embedded in every trace header so a replay starts from the same
//! parameters.
//!
//! # Configuration File Structure
//!
//! ```yaml
//! simulation:
//!   timestep:
//!     mode: fixed
//!     step_us: 100
//!   board: pi4_b
//!   history_capacity: 1024
//!   seed: 42
//!   log_level: info
//!
//! i2c:
//!   - id: 1
//!     speed: fast
//!     stretch_timeout_us: 500
//!
//! spi:
//!   - id: 0
//!     clock_hz: 1000000
//!     mode: 0
//!     bit_order: msb_first
//!
//! uart:
//!   - id: 0
//!     baud: 115200
//!     parity: even
//!     rx_capacity: 16
//!
//! devices:
//!   - kind: i2c_register_file
//!     bus: 1
//!     address: 0x48
//!     attrs:
//!       stretch_us: "20"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

use crate::board::BoardModel;
use crate::clock::TimestepMode;
use crate::controllers::spi::SpiSettings;
use crate::controllers::uart::{ErrorInjection, DEFAULT_RX_CAPACITY};
use crate::controllers::{BitOrder, I2cSpeed, Parity, SpiMode, StopBits, UartErrorKind, UartSettings};
use crate::signal::DEFAULT_HISTORY_CAPACITY;
use crate::types::{BusId, PortId, SimTime};

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Global simulation parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Event-driven, or event-driven plus a periodic sampling tick
    #[serde(default)]
    pub timestep: TimestepMode,

    #[serde(default)]
    pub board: BoardModel,

    /// Samples retained per pin signal
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Seed for UART error injection
    #[serde(default)]
    pub seed: u64,

    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            timestep: TimestepMode::default(),
            board: BoardModel::default(),
            history_capacity: default_history_capacity(),
            seed: 0,
            log_level: default_log_level(),
        }
    }
}

/// Configuration for one I2C bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct I2cBusConfig {
    pub id: BusId,

    #[serde(default)]
    pub speed: I2cSpeed,

    /// Abort a transfer when a peripheral stretches SCL longer than this
    #[serde(default)]
    pub stretch_timeout_us: Option<SimTime>,
}

/// Configuration for one SPI bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpiBusConfig {
    pub id: BusId,

    #[serde(default = "default_spi_clock")]
    pub clock_hz: u32,

    /// SPI mode number 0-3
    #[serde(default)]
    pub mode: u8,

    #[serde(default)]
    pub bit_order: BitOrder,

    #[serde(default = "default_chip_selects")]
    pub chip_selects: u8,
}

fn default_spi_clock() -> u32 {
    1_000_000
}

fn default_chip_selects() -> u8 {
    2
}

impl SpiBusConfig {
    /// Returns the runtime settings described by this configuration.
    pub fn settings(&self) -> ConfigResult<SpiSettings> {
        let mode = SpiMode::from_number(self.mode)
            .map_err(|e| ConfigError::Validation(format!("spi{}: {}", self.id, e)))?;
        Ok(SpiSettings {
            clock_hz: self.clock_hz,
            mode,
            bit_order: self.bit_order,
        })
    }
}

/// Configuration for one UART port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UartPortConfig {
    pub id: PortId,

    #[serde(default = "default_baud")]
    pub baud: u32,

    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    #[serde(default)]
    pub parity: Parity,

    #[serde(default)]
    pub stop_bits: StopBits,

    /// Receive buffer size in bytes
    #[serde(default = "default_rx_capacity")]
    pub rx_capacity: usize,

    /// Per-byte probability of an injected receive error
    #[serde(default)]
    pub error_rate: f64,

    /// Kinds drawn from when an error is injected
    #[serde(default = "default_error_kinds")]
    pub error_kinds: Vec<UartErrorKind>,

    /// Whether the port starts open
    #[serde(default = "default_open")]
    pub open: bool,
}

fn default_baud() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_rx_capacity() -> usize {
    DEFAULT_RX_CAPACITY
}

fn default_error_kinds() -> Vec<UartErrorKind> {
    ErrorInjection::default().kinds
}

fn default_open() -> bool {
    true
}

impl UartPortConfig {
    /// A port with default 8N1 settings at `baud`.
    pub fn new(id: PortId, baud: u32) -> Self {
        Self {
            id,
            baud,
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: StopBits::One,
            rx_capacity: default_rx_capacity(),
            error_rate: 0.0,
            error_kinds: default_error_kinds(),
            open: true,
        }
    }

    pub fn settings(&self) -> UartSettings {
        UartSettings {
            baud: self.baud,
            data_bits: self.data_bits,
            parity: self.parity,
            stop_bits: self.stop_bits,
        }
    }

    pub fn injection(&self, seed: u64) -> ErrorInjection {
        ErrorInjection {
            rate: self.error_rate,
            kinds: self.error_kinds.clone(),
            seed,
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.baud == 0 {
            return Err(ConfigError::Validation(format!("uart{}: baud must be non-zero", self.id)));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::Validation(format!(
                "uart{}: data_bits {} outside 5..=8",
                self.id, self.data_bits
            )));
        }
        if self.rx_capacity == 0 {
            return Err(ConfigError::Validation(format!(
                "uart{}: rx_capacity must be non-zero",
                self.id
            )));
        }
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(ConfigError::Validation(format!(
                "uart{}: error_rate {} outside 0..=1",
                self.id, self.error_rate
            )));
        }
        Ok(())
    }
}

/// A built-in device created through the device registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Registered factory name
    pub kind: String,

    /// Bus id (I2C or SPI, depending on the model)
    pub bus: BusId,

    /// I2C address, or chip-select line for SPI models
    pub address: u16,

    /// I2C models only: `address` is a 10-bit address
    #[serde(default)]
    pub ten_bit: bool,

    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

/// Complete kernel configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub simulation: SimulationParams,

    #[serde(default = "default_i2c")]
    pub i2c: Vec<I2cBusConfig>,

    #[serde(default = "default_spi")]
    pub spi: Vec<SpiBusConfig>,

    #[serde(default = "default_uart")]
    pub uart: Vec<UartPortConfig>,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_i2c() -> Vec<I2cBusConfig> {
    vec![I2cBusConfig {
        id: 1,
        speed: I2cSpeed::Standard,
        stretch_timeout_us: None,
    }]
}

fn default_spi() -> Vec<SpiBusConfig> {
    vec![SpiBusConfig {
        id: 0,
        clock_hz: default_spi_clock(),
        mode: 0,
        bit_order: BitOrder::MsbFirst,
        chip_selects: default_chip_selects(),
    }]
}

fn default_uart() -> Vec<UartPortConfig> {
    vec![UartPortConfig::new(0, default_baud())]
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            simulation: SimulationParams::default(),
            i2c: default_i2c(),
            spi: default_spi(),
            uart: default_uart(),
            devices: Vec::new(),
        }
    }
}

impl KernelConfig {
    /// Creates the default configuration: I2C bus 1, SPI bus 0, UART port 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: KernelConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: KernelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file, auto-detecting format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "json" => Self::from_json_file(path),
            _ => Err(ConfigError::UnknownFormat(ext.to_string())),
        }
    }

    /// Validates the entire configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.simulation.timestep.step() == Some(0) {
            return Err(ConfigError::Validation("fixed timestep must be non-zero".into()));
        }
        if self.simulation.history_capacity == 0 {
            return Err(ConfigError::Validation("history_capacity must be non-zero".into()));
        }

        let mut ids = HashSet::new();
        for bus in &self.i2c {
            if !ids.insert(bus.id) {
                return Err(ConfigError::Validation(format!("Duplicate I2C bus ID: {}", bus.id)));
            }
            if bus.stretch_timeout_us == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "i2c{}: stretch_timeout_us must be non-zero",
                    bus.id
                )));
            }
        }

        let mut ids = HashSet::new();
        for bus in &self.spi {
            if !ids.insert(bus.id) {
                return Err(ConfigError::Validation(format!("Duplicate SPI bus ID: {}", bus.id)));
            }
            if bus.clock_hz == 0 {
                return Err(ConfigError::Validation(format!(
                    "spi{}: clock_hz must be non-zero",
                    bus.id
                )));
            }
            if bus.chip_selects == 0 {
                return Err(ConfigError::Validation(format!(
                    "spi{}: needs at least one chip select",
                    bus.id
                )));
            }
            bus.settings()?;
        }

        let mut ids = HashSet::new();
        for port in &self.uart {
            if !ids.insert(port.id) {
                return Err(ConfigError::Validation(format!("Duplicate UART port ID: {}", port.id)));
            }
            port.validate()?;
        }

        for device in &self.devices {
            if device.kind.is_empty() {
                return Err(ConfigError::Validation("device kind must not be empty".into()));
            }
        }

        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Saves configuration to a JSON file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Converts to YAML string.
    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Converts to JSON string.
    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn find_i2c(&self, id: BusId) -> Option<&I2cBusConfig> {
        self.i2c.iter().find(|b| b.id == id)
    }

    pub fn find_spi(&self, id: BusId) -> Option<&SpiBusConfig> {
        self.spi.iter().find(|b| b.id == id)
    }

    pub fn find_uart(&self, id: PortId) -> Option<&UartPortConfig> {
        self.uart.iter().find(|p| p.id == id)
    }
}

/// Builder for creating KernelConfig programmatically.
#[derive(Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    /// Creates a builder seeded with the default buses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from no buses at all.
    pub fn empty() -> Self {
        Self {
            config: KernelConfig {
                i2c: Vec::new(),
                spi: Vec::new(),
                uart: Vec::new(),
                ..KernelConfig::default()
            },
        }
    }

    pub fn timestep(mut self, mode: TimestepMode) -> Self {
        self.config.simulation.timestep = mode;
        self
    }

    /// Emits a sampling tick every `step_us`.
    pub fn fixed_step(self, step_us: SimTime) -> Self {
        self.timestep(TimestepMode::Fixed { step_us })
    }

    pub fn board(mut self, board: BoardModel) -> Self {
        self.config.simulation.board = board;
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.simulation.history_capacity = capacity;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.simulation.seed = seed;
        self
    }

    /// Sets the log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.simulation.log_level = level.into();
        self
    }

    /// Adds (or replaces) an I2C bus.
    pub fn i2c(mut self, id: BusId, speed: I2cSpeed, stretch_timeout_us: Option<SimTime>) -> Self {
        self.config.i2c.retain(|b| b.id != id);
        self.config.i2c.push(I2cBusConfig {
            id,
            speed,
            stretch_timeout_us,
        });
        self
    }

    /// Adds (or replaces) an SPI bus.
    pub fn spi(mut self, id: BusId, clock_hz: u32, mode: u8, bit_order: BitOrder) -> Self {
        self.config.spi.retain(|b| b.id != id);
        self.config.spi.push(SpiBusConfig {
            id,
            clock_hz,
            mode,
            bit_order,
            chip_selects: default_chip_selects(),
        });
        self
    }

    /// Adds (or replaces) a UART port.
    pub fn uart(mut self, port: UartPortConfig) -> Self {
        self.config.uart.retain(|p| p.id != port.id);
        self.config.uart.push(port);
        self
    }

    /// Adds a built-in device.
    pub fn device(mut self, kind: impl Into<String>, bus: BusId, address: u16) -> Self {
        self.config.devices.push(DeviceConfig {
            kind: kind.into(),
            bus,
            address,
            ten_bit: false,
            attrs: BTreeMap::new(),
        });
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> ConfigResult<KernelConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
