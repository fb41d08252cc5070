//! Device bindings and the device factory registry.
//!
//! The kernel does not model sensor or actuator physics. A device is a
//! binding of an id to a bus address or pin plus a set of capabilities, and
//! optionally a protocol model ([`DeviceModel`]) answering on that bus.
//! Factories are registered by name at startup so devices can be created
//! from configuration.
//!
//! # Example
//!
//! ```
//! use boardsim::devices::{DeviceModel, DeviceRegistry};
//! use boardsim::devices::builtin::SpiLoopback;
//! use std::collections::BTreeMap;
//!
//! let mut registry = DeviceRegistry::new();
//! registry.register("loopback", |_attrs| Ok(DeviceModel::Spi(Box::new(SpiLoopback::default()))));
//!
//! let model = registry.create("loopback", &BTreeMap::new()).unwrap();
//! assert!(model.is_some());
//! ```

pub mod builtin;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::controllers::{I2cResponder, SpiResponder};
use crate::error::SimResult;
use crate::types::{BusId, DeviceId, PinAddress, PortId};

/// Where a device is attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAddress {
    I2c {
        bus: BusId,
        address: u16,
        #[serde(default)]
        ten_bit: bool,
    },
    Spi { bus: BusId, chip_select: u8 },
    Uart { port: PortId },
    Pin(PinAddress),
}

/// What a device can do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    I2cPeripheral,
    SpiPeripheral,
    UartPeer,
    DigitalInput,
    DigitalOutput,
    Pwm,
    Sensor,
    Actuator,
}

/// A recorded device binding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub id: DeviceId,
    pub address: DeviceAddress,
    pub capabilities: Vec<Capability>,
}

/// A protocol model created by a factory.
pub enum DeviceModel {
    I2c(Box<dyn I2cResponder>),
    Spi(Box<dyn SpiResponder>),
}

impl DeviceModel {
    /// The capability the model provides on its bus.
    pub fn capability(&self) -> Capability {
        match self {
            DeviceModel::I2c(_) => Capability::I2cPeripheral,
            DeviceModel::Spi(_) => Capability::SpiPeripheral,
        }
    }
}

impl std::fmt::Debug for DeviceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceModel::I2c(_) => f.write_str("DeviceModel::I2c"),
            DeviceModel::Spi(_) => f.write_str("DeviceModel::Spi"),
        }
    }
}

/// Type alias for device factory functions.
pub type DeviceFactory =
    Arc<dyn Fn(&BTreeMap<String, String>) -> SimResult<DeviceModel> + Send + Sync>;

/// Device factories registered by kind name.
#[derive(Default)]
pub struct DeviceRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&BTreeMap<String, String>) -> SimResult<DeviceModel> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// Creates a model of `kind`.
    ///
    /// Returns `Ok(None)` if the kind is not registered and an error if the
    /// factory rejects the attributes.
    pub fn create(
        &self,
        kind: &str,
        attrs: &BTreeMap<String, String>,
    ) -> SimResult<Option<DeviceModel>> {
        self.factories.get(kind).map(|f| f(attrs)).transpose()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Returns the registered kinds in sorted order.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn unregister(&mut self, kind: &str) -> bool {
        self.factories.remove(kind).is_some()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Creates a registry with the built-in device models.
///
/// Includes:
/// - `i2c_register_file` - [`builtin::I2cRegisterFile`]
/// - `spi_loopback` - [`builtin::SpiLoopback`]
pub fn create_default_registry() -> DeviceRegistry {
    use builtin::{I2cRegisterFile, SpiLoopback};

    let mut registry = DeviceRegistry::new();
    registry.register("i2c_register_file", |attrs| {
        Ok(DeviceModel::I2c(Box::new(I2cRegisterFile::from_attrs(attrs)?)))
    });
    registry.register("spi_loopback", |attrs| {
        Ok(DeviceModel::Spi(Box::new(SpiLoopback::from_attrs(attrs)?)))
    });
    registry
}
