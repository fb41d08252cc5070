//! Pin and bus registry.
//!
//! Every header GPIO is created when the board is initialized and lives for
//! the whole run. The registry stores, per pin, its mode, pull, Signal and
//! edge-detect setting, and tracks which controller owns each pin and bus.
//! Ownership is a map from resource to [`ControllerId`]; controllers never
//! hold references to each other or to pins.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::board::Board;
use crate::error::{SimError, SimResult};
use crate::signal::{Edge, EdgeDetect, Signal};
use crate::types::{BusRef, ControllerId, PinAddress, PinId, SimTime};

/// Function a pin is currently muxed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PinMode {
    #[default]
    Input,
    Output,
    Pwm,
    /// Bound to a bus peripheral (I2C, SPI, UART)
    Alt(BusRef),
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinMode::Input => write!(f, "input"),
            PinMode::Output => write!(f, "output"),
            PinMode::Pwm => write!(f, "pwm"),
            PinMode::Alt(bus) => write!(f, "alt({})", bus),
        }
    }
}

/// Internal pull resistor setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Pull {
    #[default]
    Off,
    Up,
    Down,
}

/// Something a controller can own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
    Pin(PinId),
    Bus(BusRef),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Pin(pin) => write!(f, "{}", pin),
            Resource::Bus(bus) => write!(f, "{}", bus),
        }
    }
}

/// A level change applied to a pin's signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelChange {
    pub pin: PinId,
    pub level: bool,
    pub edge: Edge,
    /// True if the pin's edge detector reports this edge
    pub detected: bool,
}

#[derive(Debug)]
struct PinState {
    mode: PinMode,
    pull: Pull,
    signal: Signal,
    /// Level imposed on an input by an external device
    drive: Option<bool>,
    edge_detect: Option<EdgeDetect>,
    busy: bool,
}

impl PinState {
    fn input_level(&self) -> bool {
        match (self.drive, self.pull) {
            (Some(level), _) => level,
            (None, Pull::Up) => true,
            (None, Pull::Down) => false,
            (None, Pull::Off) => self.signal.level(),
        }
    }
}

/// Logical pin id → mode, owner and signal state.
#[derive(Debug)]
pub struct PinRegistry {
    board: Board,
    pins: BTreeMap<PinId, PinState>,
    claims: BTreeMap<Resource, ControllerId>,
}

impl PinRegistry {
    /// Creates every header pin as a floating, low input.
    pub fn new(board: Board, history_capacity: usize) -> Self {
        let pins = board
            .pins()
            .map(|pin| {
                (
                    pin,
                    PinState {
                        mode: PinMode::Input,
                        pull: Pull::Off,
                        signal: Signal::digital(false, history_capacity),
                        drive: None,
                        edge_detect: None,
                        busy: false,
                    },
                )
            })
            .collect();
        Self {
            board,
            pins,
            claims: BTreeMap::new(),
        }
    }

    /// Returns the board the registry was built for.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Resolves a driver-supplied address.
    pub fn resolve(&self, address: PinAddress) -> SimResult<PinId> {
        self.board.resolve(address)
    }

    /// Returns every pin id in BCM order.
    pub fn pin_ids(&self) -> impl Iterator<Item = PinId> + '_ {
        self.pins.keys().copied()
    }

    fn state(&self, pin: PinId) -> SimResult<&PinState> {
        self.pins
            .get(&pin)
            .ok_or(SimError::UnknownPin(PinAddress::from(pin)))
    }

    fn state_mut(&mut self, pin: PinId) -> SimResult<&mut PinState> {
        self.pins
            .get_mut(&pin)
            .ok_or(SimError::UnknownPin(PinAddress::from(pin)))
    }

    pub fn mode(&self, pin: PinId) -> SimResult<PinMode> {
        Ok(self.state(pin)?.mode)
    }

    pub fn pull(&self, pin: PinId) -> SimResult<Pull> {
        Ok(self.state(pin)?.pull)
    }

    pub fn signal(&self, pin: PinId) -> SimResult<&Signal> {
        Ok(&self.state(pin)?.signal)
    }

    /// Returns the current logic level of a pin.
    pub fn level(&self, pin: PinId) -> SimResult<bool> {
        Ok(self.state(pin)?.signal.level())
    }

    /// Returns the owner of a pin or bus.
    pub fn owner(&self, resource: Resource) -> Option<ControllerId> {
        self.claims.get(&resource).copied()
    }

    /// Claims a pin or bus for `owner`.
    ///
    /// Claiming something already owned by the same controller succeeds.
    pub fn claim(&mut self, resource: Resource, owner: ControllerId) -> SimResult<()> {
        if let Resource::Pin(pin) = resource {
            self.state(pin)?;
        }
        match self.claims.get(&resource) {
            Some(&current) if current != owner => Err(SimError::PinOwnershipConflict {
                resource: resource.to_string(),
                owner: current,
                requester: owner,
            }),
            _ => {
                self.claims.insert(resource, owner);
                Ok(())
            }
        }
    }

    /// Releases a claim. Releasing an unclaimed resource is a no-op;
    /// releasing one owned by another controller is a conflict.
    pub fn release(&mut self, resource: Resource, owner: ControllerId) -> SimResult<()> {
        match self.claims.get(&resource) {
            Some(&current) if current != owner => Err(SimError::PinOwnershipConflict {
                resource: resource.to_string(),
                owner: current,
                requester: owner,
            }),
            Some(_) => {
                self.claims.remove(&resource);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Changes a pin's mode and pull on behalf of `requester`.
    ///
    /// Returns the level the pin should now show. The caller applies it
    /// through [`PinRegistry::apply_level`] so the change is published.
    pub fn set_mode(
        &mut self,
        pin: PinId,
        mode: PinMode,
        pull: Pull,
        requester: ControllerId,
    ) -> SimResult<bool> {
        let board = self.board;
        let state = self.state(pin)?;
        if state.busy {
            return Err(SimError::ModeChangeWhileBusy { pin });
        }
        let supported = match mode {
            PinMode::Input | PinMode::Output => true,
            PinMode::Pwm => board.pwm_channel(pin).is_some(),
            PinMode::Alt(bus) => board.supports_alt(pin, bus),
        };
        if !supported {
            return Err(SimError::UnsupportedMode {
                pin,
                mode: mode.to_string(),
            });
        }
        if let Some(owner) = self.owner(Resource::Pin(pin)) {
            if owner != requester {
                return Err(SimError::PinOwnershipConflict {
                    resource: pin.to_string(),
                    owner,
                    requester,
                });
            }
        }

        let previous = state.mode;
        match mode {
            PinMode::Output | PinMode::Pwm => self.claim(Resource::Pin(pin), requester)?,
            _ if matches!(previous, PinMode::Output | PinMode::Pwm) => {
                self.release(Resource::Pin(pin), requester)?
            }
            _ => {}
        }

        let state = self.state_mut(pin)?;
        state.mode = mode;
        state.pull = pull;
        if mode != PinMode::Input {
            state.drive = None;
        }
        // Bus lines idle at their pull level
        let level = match mode {
            PinMode::Input | PinMode::Alt(_) => state.input_level(),
            _ => state.signal.level(),
        };
        tracing::debug!(%pin, %mode, ?pull, "pin mode changed");
        Ok(level)
    }

    /// Checks that `requester` may drive `pin` as an output.
    pub fn check_writable(&self, pin: PinId, requester: ControllerId) -> SimResult<()> {
        let state = self.state(pin)?;
        if state.mode != PinMode::Output {
            return Err(SimError::InvalidOperationForMode {
                pin,
                mode: state.mode.to_string(),
                operation: "write",
            });
        }
        match self.owner(Resource::Pin(pin)) {
            Some(owner) if owner != requester => Err(SimError::PinOwnershipConflict {
                resource: pin.to_string(),
                owner,
                requester,
            }),
            _ => Ok(()),
        }
    }

    /// Sets or clears the external drive on an input pin and returns the
    /// level the pin should now show.
    pub fn drive_input(&mut self, pin: PinId, drive: Option<bool>) -> SimResult<bool> {
        let state = self.state_mut(pin)?;
        if state.mode != PinMode::Input {
            return Err(SimError::InvalidOperationForMode {
                pin,
                mode: state.mode.to_string(),
                operation: "drive_input",
            });
        }
        state.drive = drive;
        Ok(state.input_level())
    }

    /// Registers (or clears, with `None`) edge detection on a pin.
    pub fn set_edge_detect(&mut self, pin: PinId, detect: Option<EdgeDetect>) -> SimResult<()> {
        self.state_mut(pin)?.edge_detect = detect;
        Ok(())
    }

    pub fn edge_detect(&self, pin: PinId) -> SimResult<Option<EdgeDetect>> {
        Ok(self.state(pin)?.edge_detect)
    }

    /// Marks a pin as carrying an in-flight transaction.
    pub fn set_busy(&mut self, pin: PinId, busy: bool) -> SimResult<()> {
        self.state_mut(pin)?.busy = busy;
        Ok(())
    }

    pub fn is_busy(&self, pin: PinId) -> SimResult<bool> {
        Ok(self.state(pin)?.busy)
    }

    /// Marks every pin currently bound to `bus` busy or idle.
    pub fn set_bus_busy(&mut self, bus: BusRef, busy: bool) {
        for state in self.pins.values_mut() {
            if state.mode == PinMode::Alt(bus) {
                state.busy = busy;
            }
        }
    }

    /// Writes a level into a pin's signal at time `at`.
    ///
    /// Returns `None` if the level did not change.
    pub fn apply_level(
        &mut self,
        pin: PinId,
        level: bool,
        at: SimTime,
    ) -> SimResult<Option<LevelChange>> {
        let state = self.state_mut(pin)?;
        let edge = match state.signal.set_level(level, at)? {
            Some(edge) => edge,
            None => return Ok(None),
        };
        let detected = state.edge_detect.map_or(false, |d| d.matches(edge));
        Ok(Some(LevelChange {
            pin,
            level,
            edge,
            detected,
        }))
    }

    /// Returns all pin levels as a bitmap indexed by BCM number.
    pub fn levels_bitmap(&self) -> u64 {
        self.pins
            .iter()
            .filter(|(_, s)| s.signal.level())
            .fold(0u64, |acc, (pin, _)| acc | (1u64 << pin.bcm()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardModel;

    fn registry() -> PinRegistry {
        PinRegistry::new(Board::new(BoardModel::Pi4B), 64)
    }

    #[test]
    fn test_claim_and_release() {
        let mut pins = registry();
        let pin = Resource::Pin(PinId(17));

        pins.claim(pin, ControllerId::Gpio).unwrap();
        // Idempotent for the same owner
        pins.claim(pin, ControllerId::Gpio).unwrap();

        let err = pins.claim(pin, ControllerId::Pwm).unwrap_err();
        assert!(err.is_contention());
        assert!(pins.release(pin, ControllerId::Pwm).is_err());

        pins.release(pin, ControllerId::Gpio).unwrap();
        pins.claim(pin, ControllerId::Pwm).unwrap();
        assert_eq!(pins.owner(pin), Some(ControllerId::Pwm));

        // Releasing something unclaimed is fine
        pins.release(Resource::Bus(BusRef::Spi(0)), ControllerId::Gpio).unwrap();
    }

    #[test]
    fn test_output_mode_claims_pin() {
        let mut pins = registry();
        pins.set_mode(PinId(17), PinMode::Output, Pull::Off, ControllerId::Gpio)
            .unwrap();
        assert_eq!(pins.owner(Resource::Pin(PinId(17))), Some(ControllerId::Gpio));

        let err = pins
            .set_mode(PinId(17), PinMode::Input, Pull::Off, ControllerId::Pwm)
            .unwrap_err();
        assert!(matches!(err, SimError::PinOwnershipConflict { .. }));

        pins.set_mode(PinId(17), PinMode::Input, Pull::Up, ControllerId::Gpio)
            .unwrap();
        assert_eq!(pins.owner(Resource::Pin(PinId(17))), None);
    }

    #[test]
    fn test_unsupported_modes() {
        let mut pins = registry();
        let err = pins
            .set_mode(PinId(17), PinMode::Pwm, Pull::Off, ControllerId::Pwm)
            .unwrap_err();
        assert!(matches!(err, SimError::UnsupportedMode { .. }));

        let err = pins
            .set_mode(PinId(4), PinMode::Alt(BusRef::I2c(1)), Pull::Off, ControllerId::Gpio)
            .unwrap_err();
        assert!(matches!(err, SimError::UnsupportedMode { .. }));

        pins.set_mode(PinId(2), PinMode::Alt(BusRef::I2c(1)), Pull::Up, ControllerId::Gpio)
            .unwrap();
    }

    #[test]
    fn test_busy_pin_refuses_mode_change() {
        let mut pins = registry();
        pins.set_mode(PinId(2), PinMode::Alt(BusRef::I2c(1)), Pull::Up, ControllerId::Gpio)
            .unwrap();
        pins.set_bus_busy(BusRef::I2c(1), true);

        let err = pins
            .set_mode(PinId(2), PinMode::Input, Pull::Off, ControllerId::Gpio)
            .unwrap_err();
        assert!(matches!(err, SimError::ModeChangeWhileBusy { pin } if pin == PinId(2)));

        pins.set_bus_busy(BusRef::I2c(1), false);
        assert!(!pins.is_busy(PinId(2)).unwrap());
    }

    #[test]
    fn test_pull_and_drive_levels() {
        let mut pins = registry();
        let level = pins
            .set_mode(PinId(4), PinMode::Input, Pull::Up, ControllerId::Gpio)
            .unwrap();
        assert!(level);

        assert!(!pins.drive_input(PinId(4), Some(false)).unwrap());
        assert!(pins.drive_input(PinId(4), None).unwrap());

        pins.set_mode(PinId(5), PinMode::Output, Pull::Off, ControllerId::Gpio)
            .unwrap();
        assert!(pins.drive_input(PinId(5), Some(true)).is_err());
    }

    #[test]
    fn test_apply_level_and_edge_detect() {
        let mut pins = registry();
        pins.set_edge_detect(PinId(4), Some(EdgeDetect::Falling)).unwrap();

        let rise = pins.apply_level(PinId(4), true, 10).unwrap().unwrap();
        assert_eq!(rise.edge, Edge::Rising);
        assert!(!rise.detected);

        assert!(pins.apply_level(PinId(4), true, 20).unwrap().is_none());

        let fall = pins.apply_level(PinId(4), false, 30).unwrap().unwrap();
        assert!(fall.detected);
    }

    #[test]
    fn test_levels_bitmap() {
        let mut pins = registry();
        pins.apply_level(PinId(2), true, 0).unwrap();
        pins.apply_level(PinId(27), true, 0).unwrap();
        assert_eq!(pins.levels_bitmap(), (1 << 2) | (1 << 27));
    }
}
