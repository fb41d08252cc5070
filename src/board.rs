//! Board models and the 40-pin header table.
//!
//! All supported models share the same GPIO header layout, so pin numbering
//! and alternate functions are model independent. The model only changes how
//! a board identifies itself.

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::types::{BusId, BusRef, PinAddress, PinId, PortId};

/// (BCM number, physical header position) for every GPIO on the header.
const HEADER: [(u8, u8); 26] = [
    (2, 3),
    (3, 5),
    (4, 7),
    (5, 29),
    (6, 31),
    (7, 26),
    (8, 24),
    (9, 21),
    (10, 19),
    (11, 23),
    (12, 32),
    (13, 33),
    (14, 8),
    (15, 10),
    (16, 36),
    (17, 11),
    (18, 12),
    (19, 35),
    (20, 38),
    (21, 40),
    (22, 15),
    (23, 16),
    (24, 18),
    (25, 22),
    (26, 37),
    (27, 13),
];

/// A supported single-board computer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoardModel {
    Pi3B,
    #[default]
    Pi4B,
    PiZero2W,
}

impl BoardModel {
    /// Returns the marketing name of the model.
    pub fn name(&self) -> &'static str {
        match self {
            BoardModel::Pi3B => "Raspberry Pi 3 Model B",
            BoardModel::Pi4B => "Raspberry Pi 4 Model B",
            BoardModel::PiZero2W => "Raspberry Pi Zero 2 W",
        }
    }
}

/// An alternate (peripheral) function a header pin can be muxed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AltFunction {
    I2cSda(BusId),
    I2cScl(BusId),
    SpiChipSelect(BusId, u8),
    SpiMiso(BusId),
    SpiMosi(BusId),
    SpiSclk(BusId),
    UartTx(PortId),
    UartRx(PortId),
    Pwm(u8),
}

impl AltFunction {
    /// Returns the bus or channel this function belongs to.
    pub fn bus(&self) -> BusRef {
        match *self {
            AltFunction::I2cSda(id) | AltFunction::I2cScl(id) => BusRef::I2c(id),
            AltFunction::SpiChipSelect(id, _)
            | AltFunction::SpiMiso(id)
            | AltFunction::SpiMosi(id)
            | AltFunction::SpiSclk(id) => BusRef::Spi(id),
            AltFunction::UartTx(id) | AltFunction::UartRx(id) => BusRef::Uart(id),
            AltFunction::Pwm(channel) => BusRef::Pwm(channel),
        }
    }
}

/// SPI pin assignment for one bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpiPins {
    pub sclk: PinId,
    pub mosi: PinId,
    pub miso: PinId,
    pub chip_selects: [PinId; 2],
}

/// A board instance: pin numbering and alternate-function lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Board {
    model: BoardModel,
}

impl Board {
    /// Creates a board of the given model.
    pub fn new(model: BoardModel) -> Self {
        Self { model }
    }

    /// Returns the board model.
    pub fn model(&self) -> BoardModel {
        self.model
    }

    /// Resolves a BCM or physical address to a logical pin.
    ///
    /// Power, ground and ID EEPROM positions are not GPIOs and fail with
    /// [`SimError::UnknownPin`], as do numbers outside the header.
    pub fn resolve(&self, address: PinAddress) -> SimResult<PinId> {
        let found = match address {
            PinAddress::Bcm(bcm) => HEADER.iter().find(|&&(b, _)| b == bcm),
            PinAddress::Physical(pos) => HEADER.iter().find(|&&(_, p)| p == pos),
        };
        found
            .map(|&(bcm, _)| PinId(bcm))
            .ok_or(SimError::UnknownPin(address))
    }

    /// Returns the physical header position of a pin.
    pub fn physical(&self, pin: PinId) -> Option<u8> {
        HEADER
            .iter()
            .find(|&&(bcm, _)| bcm == pin.bcm())
            .map(|&(_, pos)| pos)
    }

    /// Returns every GPIO on the header in BCM order.
    pub fn pins(&self) -> impl Iterator<Item = PinId> {
        let mut bcm: Vec<u8> = HEADER.iter().map(|&(b, _)| b).collect();
        bcm.sort_unstable();
        bcm.into_iter().map(PinId)
    }

    /// Returns the alternate functions available on a pin.
    pub fn alt_functions(&self, pin: PinId) -> Vec<AltFunction> {
        match pin.bcm() {
            2 => vec![AltFunction::I2cSda(1)],
            3 => vec![AltFunction::I2cScl(1)],
            7 => vec![AltFunction::SpiChipSelect(0, 1)],
            8 => vec![AltFunction::SpiChipSelect(0, 0)],
            9 => vec![AltFunction::SpiMiso(0)],
            10 => vec![AltFunction::SpiMosi(0)],
            11 => vec![AltFunction::SpiSclk(0)],
            12 | 18 => vec![AltFunction::Pwm(0)],
            13 | 19 => vec![AltFunction::Pwm(1)],
            14 => vec![AltFunction::UartTx(0)],
            15 => vec![AltFunction::UartRx(0)],
            _ => Vec::new(),
        }
    }

    /// Returns true if `pin` can be bound to `bus`.
    pub fn supports_alt(&self, pin: PinId, bus: BusRef) -> bool {
        self.alt_functions(pin).iter().any(|f| f.bus() == bus)
    }

    /// Returns the hardware PWM channel of a pin, if it has one.
    pub fn pwm_channel(&self, pin: PinId) -> Option<u8> {
        self.alt_functions(pin).into_iter().find_map(|f| match f {
            AltFunction::Pwm(channel) => Some(channel),
            _ => None,
        })
    }

    /// Returns the (SDA, SCL) pins of an I2C bus broken out on the header.
    pub fn i2c_pins(&self, bus: BusId) -> Option<(PinId, PinId)> {
        (bus == 1).then_some((PinId(2), PinId(3)))
    }

    /// Returns the pins of an SPI bus broken out on the header.
    pub fn spi_pins(&self, bus: BusId) -> Option<SpiPins> {
        (bus == 0).then_some(SpiPins {
            sclk: PinId(11),
            mosi: PinId(10),
            miso: PinId(9),
            chip_selects: [PinId(8), PinId(7)],
        })
    }

    /// Returns the (TX, RX) pins of a UART port broken out on the header.
    pub fn uart_pins(&self, port: PortId) -> Option<(PinId, PinId)> {
        (port == 0).then_some((PinId(14), PinId(15)))
    }

    /// Returns every header pin bound to `bus` by its alternate function.
    pub fn bus_pins(&self, bus: BusRef) -> Vec<PinId> {
        self.pins().filter(|&p| self.supports_alt(p, bus)).collect()
    }
}
