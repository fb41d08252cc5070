//! The simulation kernel: the driver-facing command interface.
//!
//! A [`Kernel`] owns one scheduler, one event bus, the pin registry and every
//! controller built from its [`KernelConfig`]. Commands validate and apply
//! their immediate effects synchronously; anything that takes simulated time
//! (a bus transfer, a UART frame, a PWM period) is scheduled and only happens
//! when the driver runs the kernel forward with [`Kernel::run_until`].
//!
//! # Example
//!
//! ```
//! use boardsim::{Kernel, KernelConfig, PinId, PinMode, Pull};
//!
//! let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
//! kernel.set_pin_mode(PinId(17), PinMode::Output, Pull::Off).unwrap();
//! kernel.write_pin(PinId(17), true).unwrap();
//! kernel.run_for(1_000).unwrap();
//!
//! assert!(kernel.read_pin(PinId(17)).unwrap());
//! assert_eq!(kernel.now(), 1_000);
//! ```

use std::collections::BTreeMap;

use crate::board::Board;
use crate::config::{DeviceConfig, KernelConfig};
use crate::controllers::{
    Ctx, GpioController, I2cController, I2cRequest, I2cResponder, PwmController, SpiController,
    SpiResponder, SpiSettings, UartController, UartErrorKind, UartSettings,
};
use crate::devices::{
    create_default_registry, Capability, DeviceAddress, DeviceBinding, DeviceModel, DeviceRegistry,
};
use crate::error::{SimError, SimResult};
use crate::event::{ConfigChange, EventPayload};
use crate::event_bus::{EventBus, Subscriber, SubscriptionId, TopicFilter};
use crate::pins::{PinMode, PinRegistry, Pull, Resource};
use crate::scheduler::{Continuation, EventHandle, ScheduledEvent, Scheduler};
use crate::signal::{EdgeDetect, Signal};
use crate::trace::{TraceHeader, TraceRecorder};
use crate::transaction::{BusTransaction, TransactionLog};
use crate::types::{BusId, BusRef, ControllerId, DeviceId, PinAddress, PinId, PortId, SimTime, TransactionId};

/// Kernel state every controller works against.
#[derive(Debug)]
struct Shared {
    scheduler: Scheduler,
    bus: EventBus,
    pins: PinRegistry,
    transactions: TransactionLog,
}

impl Shared {
    fn ctx(&mut self) -> Ctx<'_> {
        Ctx {
            scheduler: &mut self.scheduler,
            bus: &mut self.bus,
            pins: &mut self.pins,
            transactions: &mut self.transactions,
        }
    }
}

fn lookup<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, bus: BusRef) -> SimResult<&mut V> {
    map.get_mut(&key).ok_or(SimError::UnknownBus(bus))
}

/// Logs fatal errors on their way out to the driver.
fn surface(err: SimError) -> SimError {
    if err.is_fatal() {
        tracing::error!(error = %err, "fatal kernel error");
    }
    err
}

/// The deterministic hardware simulation kernel.
pub struct Kernel {
    config: KernelConfig,
    shared: Shared,
    gpio: GpioController,
    pwm: PwmController,
    i2c: BTreeMap<BusId, I2cController>,
    spi: BTreeMap<BusId, SpiController>,
    uart: BTreeMap<PortId, UartController>,
    devices: DeviceRegistry,
    bindings: BTreeMap<DeviceId, DeviceBinding>,
    next_device: DeviceId,
    /// Payloads re-published by `Continuation::Replay`
    replay: Vec<EventPayload>,
}

impl Kernel {
    /// Builds a kernel, its controllers and the configured devices.
    pub fn new(config: KernelConfig) -> SimResult<Self> {
        Self::build(config, true, Vec::new())
    }

    /// Builds a kernel that re-publishes `payloads` instead of generating
    /// periodic ticks.
    pub(crate) fn for_replay(config: KernelConfig, payloads: Vec<EventPayload>) -> SimResult<Self> {
        Self::build(config, false, payloads)
    }

    fn build(config: KernelConfig, ticks: bool, replay: Vec<EventPayload>) -> SimResult<Self> {
        config.validate()?;
        let params = config.simulation.clone();
        let board = Board::new(params.board);

        let i2c: BTreeMap<BusId, I2cController> = config
            .i2c
            .iter()
            .map(|b| (b.id, I2cController::new(b.id, b.speed, b.stretch_timeout_us)))
            .collect();
        let spi: BTreeMap<BusId, SpiController> = config
            .spi
            .iter()
            .map(|b| -> SimResult<(BusId, SpiController)> {
                Ok((b.id, SpiController::new(b.id, b.settings()?, b.chip_selects)))
            })
            .collect::<SimResult<_>>()?;
        let uart: BTreeMap<PortId, UartController> = config
            .uart
            .iter()
            .map(|p| {
                let mut port = UartController::new(
                    p.id,
                    p.settings(),
                    p.rx_capacity,
                    p.injection(params.seed),
                );
                port.set_open(p.open);
                (p.id, port)
            })
            .collect();

        let mut kernel = Self {
            shared: Shared {
                scheduler: Scheduler::new(params.timestep),
                bus: EventBus::new(),
                pins: PinRegistry::new(board, params.history_capacity),
                transactions: TransactionLog::new(),
            },
            gpio: GpioController::new(),
            pwm: PwmController::new(),
            i2c,
            spi,
            uart,
            devices: create_default_registry(),
            bindings: BTreeMap::new(),
            next_device: 1,
            replay,
            config,
        };

        if ticks && kernel.config.simulation.timestep.step().is_some() {
            kernel
                .shared
                .scheduler
                .schedule_at(0, Continuation::Tick { index: 0 })?;
        }
        for device in kernel.config.devices.clone() {
            kernel.add_device(&device)?;
        }

        tracing::debug!(
            board = kernel.config.simulation.board.name(),
            i2c = kernel.i2c.len(),
            spi = kernel.spi.len(),
            uart = kernel.uart.len(),
            devices = kernel.bindings.len(),
            "kernel created"
        );
        Ok(kernel)
    }

    // ========== Time ==========

    /// Returns the current simulation time.
    pub fn now(&self) -> SimTime {
        self.shared.scheduler.now()
    }

    /// Runs every event due at or before `t`, then moves the clock to `t`.
    ///
    /// Fatal errors stop the run and are returned as-is.
    pub fn run_until(&mut self, t: SimTime) -> SimResult<()> {
        while let Some(event) = self.shared.scheduler.pop_due(t).map_err(surface)? {
            self.dispatch(event).map_err(surface)?;
        }
        self.shared.scheduler.advance_to(t).map_err(surface)
    }

    /// Runs for `duration` microseconds from now.
    pub fn run_for(&mut self, duration: SimTime) -> SimResult<()> {
        self.run_until(self.now().saturating_add(duration))
    }

    /// Runs events until `predicate` holds or the clock would pass `limit`.
    ///
    /// The predicate is checked before the first event and after each one.
    /// Returns true if it was satisfied; on false the clock is left at
    /// `limit`.
    pub fn run_until_with<F>(&mut self, limit: SimTime, mut predicate: F) -> SimResult<bool>
    where
        F: FnMut(&Kernel) -> bool,
    {
        if predicate(self) {
            return Ok(true);
        }
        while let Some(event) = self.shared.scheduler.pop_due(limit).map_err(surface)? {
            self.dispatch(event).map_err(surface)?;
            if predicate(self) {
                return Ok(true);
            }
        }
        self.shared.scheduler.advance_to(limit).map_err(surface)?;
        Ok(false)
    }

    /// Fires the next pending event, whenever it is due.
    ///
    /// Returns its due time, or `None` if nothing is scheduled.
    pub fn step(&mut self) -> SimResult<Option<SimTime>> {
        match self.shared.scheduler.pop_due(SimTime::MAX).map_err(surface)? {
            Some(event) => {
                let due = event.due;
                self.dispatch(event).map_err(surface)?;
                Ok(Some(due))
            }
            None => Ok(None),
        }
    }

    /// Returns the number of events waiting to fire.
    pub fn pending_events(&self) -> usize {
        self.shared.scheduler.pending()
    }

    /// Schedules a `wake` event `delay` microseconds from now, for an
    /// external cooperative runner to resume a sleeping task on.
    pub fn schedule_wake(&mut self, delay: SimTime, token: u64) -> EventHandle {
        self.shared
            .scheduler
            .schedule_after(delay, Continuation::Wake { token })
    }

    /// Cancels a scheduled wake. Returns false if it already fired.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        self.shared.scheduler.cancel(handle)
    }

    pub(crate) fn schedule_replay(&mut self, at: SimTime, index: usize) -> SimResult<EventHandle> {
        self.shared
            .scheduler
            .schedule_at(at, Continuation::Replay { index })
    }

    fn dispatch(&mut self, event: ScheduledEvent) -> SimResult<()> {
        tracing::trace!(
            due = event.due,
            sequence = event.sequence,
            continuation = ?event.continuation,
            "fire"
        );
        let mut ctx = self.shared.ctx();

        match event.continuation {
            Continuation::Tick { index } => {
                let levels = ctx.pins.levels_bitmap();
                ctx.publish(EventPayload::Tick { index, levels });
                if let Some(step) = self.config.simulation.timestep.step() {
                    ctx.schedule_after(step, Continuation::Tick { index: index + 1 });
                }
                Ok(())
            }
            Continuation::Wake { token } => {
                ctx.publish(EventPayload::Wake { token });
                Ok(())
            }
            Continuation::I2cStart { bus, transaction } => {
                lookup(&mut self.i2c, bus, BusRef::I2c(bus))?.on_start(&mut ctx, transaction)
            }
            Continuation::I2cStep { bus } => {
                lookup(&mut self.i2c, bus, BusRef::I2c(bus))?.on_step(&mut ctx)
            }
            Continuation::I2cStretchTimeout { bus } => {
                lookup(&mut self.i2c, bus, BusRef::I2c(bus))?.on_stretch_timeout(&mut ctx)
            }
            Continuation::SpiByte { bus } => {
                lookup(&mut self.spi, bus, BusRef::Spi(bus))?.on_byte(&mut ctx)
            }
            Continuation::UartTxFrame { port } => {
                lookup(&mut self.uart, port, BusRef::Uart(port))?.on_tx_frame(&mut ctx)
            }
            Continuation::UartLineStart { port, frame } => {
                lookup(&mut self.uart, port, BusRef::Uart(port))?.on_line_start(&mut ctx, frame)
            }
            Continuation::UartRxSample { port, frame, settings } => {
                lookup(&mut self.uart, port, BusRef::Uart(port))?
                    .on_rx_sample(&mut ctx, frame, settings)
            }
            Continuation::PwmEdge { pin, rising } => self.pwm.on_edge(&mut ctx, pin, rising),
            Continuation::GlitchEnd { pin, level } => self.gpio.on_glitch_end(&mut ctx, pin, level),
            Continuation::Replay { index } => {
                if let Some(payload) = self.replay.get(index).cloned() {
                    ctx.publish(payload);
                }
                Ok(())
            }
        }
    }

    // ========== Events ==========

    /// Registers a subscriber on the kernel's event bus.
    pub fn subscribe(
        &mut self,
        filter: impl Into<TopicFilter>,
        handler: impl Subscriber + 'static,
    ) -> SubscriptionId {
        self.shared.bus.subscribe(filter, handler)
    }

    /// Removes a subscription. Idempotent.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.shared.bus.unsubscribe(id)
    }

    /// Starts recording every event from now on.
    pub fn record(&mut self) -> TraceRecorder {
        let recorder = TraceRecorder::new(TraceHeader::new(self.config.clone()));
        self.shared.bus.subscribe(TopicFilter::All, recorder.clone());
        recorder
    }

    // ========== Pins and GPIO ==========

    /// Resolves a BCM or physical pin address.
    pub fn resolve(&self, pin: impl Into<PinAddress>) -> SimResult<PinId> {
        self.shared.pins.resolve(pin.into())
    }

    pub fn board(&self) -> &Board {
        self.shared.pins.board()
    }

    pub fn set_pin_mode(&mut self, pin: impl Into<PinAddress>, mode: PinMode, pull: Pull) -> SimResult<()> {
        let pin = self.resolve(pin)?;
        self.gpio.set_mode(&mut self.shared.ctx(), pin, mode, pull)
    }

    pub fn pin_mode(&self, pin: impl Into<PinAddress>) -> SimResult<PinMode> {
        let pin = self.resolve(pin)?;
        self.shared.pins.mode(pin)
    }

    /// Drives an output pin. Fails on inputs and on pins owned by another
    /// controller.
    pub fn write_pin(&mut self, pin: impl Into<PinAddress>, level: bool) -> SimResult<()> {
        let pin = self.resolve(pin)?;
        self.gpio.write(&mut self.shared.ctx(), pin, level)
    }

    /// Reads a pin. An output reads back the last written level.
    pub fn read_pin(&mut self, pin: impl Into<PinAddress>) -> SimResult<bool> {
        let pin = self.resolve(pin)?;
        self.gpio.read(&self.shared.ctx(), pin)
    }

    /// Drives an input pin from outside (a device model); `None` releases it
    /// back to its pull level.
    pub fn drive_input(&mut self, pin: impl Into<PinAddress>, level: Option<bool>) -> SimResult<()> {
        let pin = self.resolve(pin)?;
        self.gpio.drive_input(&mut self.shared.ctx(), pin, level)
    }

    pub fn add_edge_detect(&mut self, pin: impl Into<PinAddress>, detect: EdgeDetect) -> SimResult<()> {
        let pin = self.resolve(pin)?;
        self.gpio.add_edge_detect(&mut self.shared.ctx(), pin, detect)
    }

    pub fn remove_edge_detect(&mut self, pin: impl Into<PinAddress>) -> SimResult<()> {
        let pin = self.resolve(pin)?;
        self.gpio.remove_edge_detect(&mut self.shared.ctx(), pin)
    }

    /// Inverts a pin's level for `duration` µs starting now.
    pub fn gpio_inject_glitch(&mut self, pin: impl Into<PinAddress>, duration: SimTime) -> SimResult<()> {
        let pin = self.resolve(pin)?;
        self.gpio.inject_glitch(&mut self.shared.ctx(), pin, duration)
    }

    /// Returns the signal (level and history) of a pin.
    pub fn signal(&self, pin: impl Into<PinAddress>) -> SimResult<&Signal> {
        let pin = self.resolve(pin)?;
        self.shared.pins.signal(pin)
    }

    /// Claims a pin as an output for `owner`.
    pub fn claim_output(&mut self, pin: impl Into<PinAddress>, owner: ControllerId) -> SimResult<()> {
        let pin = self.resolve(pin)?;
        self.shared.pins.claim(Resource::Pin(pin), owner)
    }

    /// Claims a pin or bus for `owner`.
    pub fn claim(&mut self, resource: Resource, owner: ControllerId) -> SimResult<()> {
        self.shared.pins.claim(resource, owner)
    }

    /// Releases a claim held by `owner`.
    pub fn release(&mut self, resource: Resource, owner: ControllerId) -> SimResult<()> {
        self.shared.pins.release(resource, owner)
    }

    pub fn owner(&self, resource: Resource) -> Option<ControllerId> {
        self.shared.pins.owner(resource)
    }

    // ========== I2C ==========

    /// Queues an I2C transfer mastered by the bus's own controller.
    pub fn i2c_transfer(&mut self, bus: BusId, request: I2cRequest) -> SimResult<TransactionId> {
        self.i2c_transfer_as(bus, ControllerId::I2c(bus), request)
    }

    /// Queues an I2C transfer on behalf of `master`. Transfers whose Start
    /// collides with one in flight finish with `ArbitrationLost`.
    pub fn i2c_transfer_as(
        &mut self,
        bus: BusId,
        master: ControllerId,
        request: I2cRequest,
    ) -> SimResult<TransactionId> {
        let controller = lookup(&mut self.i2c, bus, BusRef::I2c(bus))?;
        controller.transfer(&mut self.shared.ctx(), master, request)
    }

    /// Returns the addresses answering on the bus.
    pub fn i2c_scan(&mut self, bus: BusId) -> SimResult<Vec<u16>> {
        Ok(lookup(&mut self.i2c, bus, BusRef::I2c(bus))?.scan())
    }

    /// Attaches a peripheral model at `address` and records its binding.
    pub fn i2c_attach(
        &mut self,
        bus: BusId,
        address: u16,
        responder: Box<dyn I2cResponder>,
    ) -> SimResult<DeviceId> {
        lookup(&mut self.i2c, bus, BusRef::I2c(bus))?.attach(address, responder)?;
        Ok(self.bind(
            DeviceAddress::I2c {
                bus,
                address,
                ten_bit: false,
            },
            vec![Capability::I2cPeripheral],
        ))
    }

    /// Attaches a peripheral model at a 10-bit `address`.
    pub fn i2c_attach_ten_bit(
        &mut self,
        bus: BusId,
        address: u16,
        responder: Box<dyn I2cResponder>,
    ) -> SimResult<DeviceId> {
        lookup(&mut self.i2c, bus, BusRef::I2c(bus))?.attach_ten_bit(address, responder)?;
        Ok(self.bind(
            DeviceAddress::I2c {
                bus,
                address,
                ten_bit: true,
            },
            vec![Capability::I2cPeripheral],
        ))
    }

    pub fn i2c(&self, bus: BusId) -> Option<&I2cController> {
        self.i2c.get(&bus)
    }

    // ========== SPI ==========

    /// Starts a full-duplex SPI transfer owned by the bus's own controller.
    pub fn spi_transfer(&mut self, bus: BusId, chip_select: u8, bytes: Vec<u8>) -> SimResult<TransactionId> {
        self.spi_transfer_as(bus, chip_select, ControllerId::Spi(bus), bytes)
    }

    /// Starts a transfer with the bus claimed for `owner` until it completes.
    pub fn spi_transfer_as(
        &mut self,
        bus: BusId,
        chip_select: u8,
        owner: ControllerId,
        bytes: Vec<u8>,
    ) -> SimResult<TransactionId> {
        let controller = lookup(&mut self.spi, bus, BusRef::Spi(bus))?;
        controller.transfer(&mut self.shared.ctx(), chip_select, owner, bytes)
    }

    /// Changes clock, mode and bit order for transfers started from now on.
    pub fn spi_configure(&mut self, bus: BusId, settings: SpiSettings) -> SimResult<()> {
        lookup(&mut self.spi, bus, BusRef::Spi(bus))?.configure(settings)?;
        self.publish_config(ConfigChange::Spi { bus, settings });
        Ok(())
    }

    pub fn spi_attach(
        &mut self,
        bus: BusId,
        chip_select: u8,
        responder: Box<dyn SpiResponder>,
    ) -> SimResult<DeviceId> {
        lookup(&mut self.spi, bus, BusRef::Spi(bus))?.attach(chip_select, responder)?;
        Ok(self.bind(
            DeviceAddress::Spi { bus, chip_select },
            vec![Capability::SpiPeripheral],
        ))
    }

    pub fn spi(&self, bus: BusId) -> Option<&SpiController> {
        self.spi.get(&bus)
    }

    // ========== UART ==========

    /// Queues bytes for transmission on `port`.
    pub fn uart_write(&mut self, port: PortId, bytes: &[u8]) -> SimResult<TransactionId> {
        let controller = lookup(&mut self.uart, port, BusRef::Uart(port))?;
        controller.write(&mut self.shared.ctx(), bytes)
    }

    /// Takes up to `max` received bytes.
    pub fn uart_read(&mut self, port: PortId, max: usize) -> SimResult<Vec<u8>> {
        Ok(lookup(&mut self.uart, port, BusRef::Uart(port))?.read(max))
    }

    pub fn uart_available(&mut self, port: PortId) -> SimResult<usize> {
        Ok(lookup(&mut self.uart, port, BusRef::Uart(port))?.available())
    }

    /// Discards buffered received bytes and returns how many were dropped.
    pub fn uart_flush(&mut self, port: PortId) -> SimResult<usize> {
        Ok(lookup(&mut self.uart, port, BusRef::Uart(port))?.flush())
    }

    /// Discards bytes queued for transmission and returns how many were
    /// dropped.
    pub fn uart_flush_tx(&mut self, port: PortId) -> SimResult<usize> {
        let controller = lookup(&mut self.uart, port, BusRef::Uart(port))?;
        controller.flush_tx(&mut self.shared.ctx())
    }

    /// Replaces the line settings of one side of a link.
    pub fn uart_configure(&mut self, port: PortId, settings: UartSettings) -> SimResult<()> {
        lookup(&mut self.uart, port, BusRef::Uart(port))?.configure(settings)?;
        self.publish_config(ConfigChange::Uart { port, settings });
        Ok(())
    }

    /// Wires two ports TX-to-RX in both directions.
    pub fn uart_connect(&mut self, a: PortId, b: PortId) -> SimResult<()> {
        lookup(&mut self.uart, b, BusRef::Uart(b))?;
        lookup(&mut self.uart, a, BusRef::Uart(a))?.set_peer(Some(b));
        lookup(&mut self.uart, b, BusRef::Uart(b))?.set_peer(Some(a));
        self.publish_config(ConfigChange::UartLink { a, b });
        Ok(())
    }

    /// Feeds bytes into `port`'s receiver as a device model would.
    pub fn uart_inject(&mut self, port: PortId, bytes: &[u8]) -> SimResult<()> {
        let controller = lookup(&mut self.uart, port, BusRef::Uart(port))?;
        controller.inject(&mut self.shared.ctx(), bytes)
    }

    /// Scripts an error onto the next frame `port` receives.
    pub fn uart_inject_error(&mut self, port: PortId, kind: UartErrorKind) -> SimResult<()> {
        lookup(&mut self.uart, port, BusRef::Uart(port))?.inject_error(kind);
        Ok(())
    }

    pub fn uart_set_open(&mut self, port: PortId, open: bool) -> SimResult<()> {
        lookup(&mut self.uart, port, BusRef::Uart(port))?.set_open(open);
        self.publish_config(ConfigChange::UartOpen { port, open });
        Ok(())
    }

    pub fn uart(&self, port: PortId) -> Option<&UartController> {
        self.uart.get(&port)
    }

    // ========== PWM ==========

    pub fn pwm_configure(
        &mut self,
        pin: impl Into<PinAddress>,
        frequency_hz: f64,
        duty_percent: f64,
    ) -> SimResult<()> {
        let pin = self.resolve(pin)?;
        self.pwm
            .configure(&mut self.shared.ctx(), pin, frequency_hz, duty_percent)
    }

    pub fn pwm_start(&mut self, pin: impl Into<PinAddress>) -> SimResult<()> {
        let pin = self.resolve(pin)?;
        self.pwm.start(&mut self.shared.ctx(), pin)
    }

    pub fn pwm_stop(&mut self, pin: impl Into<PinAddress>) -> SimResult<()> {
        let pin = self.resolve(pin)?;
        self.pwm.stop(&mut self.shared.ctx(), pin)
    }

    pub fn pwm(&self) -> &PwmController {
        &self.pwm
    }

    pub fn gpio(&self) -> &GpioController {
        &self.gpio
    }

    // ========== Devices ==========

    fn bind(&mut self, address: DeviceAddress, capabilities: Vec<Capability>) -> DeviceId {
        let id = self.next_device;
        self.next_device += 1;
        tracing::debug!(device = id, ?address, ?capabilities, "device bound");
        self.bindings.insert(
            id,
            DeviceBinding {
                id,
                address,
                capabilities,
            },
        );
        id
    }

    /// Records a device binding. Only the binding is kept; the device's
    /// behavior lives outside the kernel.
    pub fn register_device(
        &mut self,
        address: DeviceAddress,
        capabilities: Vec<Capability>,
    ) -> SimResult<DeviceId> {
        let address = match address {
            DeviceAddress::I2c { bus, .. } if !self.i2c.contains_key(&bus) => {
                return Err(SimError::UnknownBus(BusRef::I2c(bus)))
            }
            DeviceAddress::Spi { bus, .. } if !self.spi.contains_key(&bus) => {
                return Err(SimError::UnknownBus(BusRef::Spi(bus)))
            }
            DeviceAddress::Uart { port } if !self.uart.contains_key(&port) => {
                return Err(SimError::UnknownBus(BusRef::Uart(port)))
            }
            // Store pins by BCM number so both numberings compare equal
            DeviceAddress::Pin(pin) => DeviceAddress::Pin(PinAddress::from(self.resolve(pin)?)),
            other => other,
        };
        Ok(self.bind(address, capabilities))
    }

    /// Creates a built-in device model from the factory registry and attaches
    /// it to its bus.
    pub fn add_device(&mut self, device: &DeviceConfig) -> SimResult<DeviceId> {
        let model = self
            .devices
            .create(&device.kind, &device.attrs)?
            .ok_or_else(|| SimError::InvalidParameter(format!("unknown device kind '{}'", device.kind)))?;
        match model {
            DeviceModel::I2c(responder) if device.ten_bit => {
                self.i2c_attach_ten_bit(device.bus, device.address, responder)
            }
            DeviceModel::I2c(responder) => self.i2c_attach(device.bus, device.address, responder),
            DeviceModel::Spi(responder) => {
                let chip_select = u8::try_from(device.address).map_err(|_| {
                    SimError::InvalidParameter(format!("chip select {} out of range", device.address))
                })?;
                self.spi_attach(device.bus, chip_select, responder)
            }
        }
    }

    /// Publishes a reading or actuation result on behalf of a bound device.
    pub fn publish_device(&mut self, device: DeviceId, data: serde_json::Value) -> SimResult<()> {
        if !self.bindings.contains_key(&device) {
            return Err(SimError::InvalidParameter(format!("no device with id {}", device)));
        }
        self.shared
            .ctx()
            .publish(EventPayload::Device { device, data });
        Ok(())
    }

    fn publish_config(&mut self, change: ConfigChange) {
        tracing::debug!(?change, "config changed");
        self.shared.ctx().publish(EventPayload::Config(change));
    }

    /// The device factory registry, for registering additional models.
    pub fn devices_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.devices
    }

    pub fn binding(&self, device: DeviceId) -> Option<&DeviceBinding> {
        self.bindings.get(&device)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &DeviceBinding> {
        self.bindings.values()
    }

    // ========== Inspection ==========

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Returns a transaction by id, open or finalized.
    pub fn transaction(&self, id: TransactionId) -> Option<&BusTransaction> {
        self.shared.transactions.get(id)
    }

    pub fn transactions(&self) -> impl Iterator<Item = &BusTransaction> {
        self.shared.transactions.iter()
    }

    /// Exports kernel and controller statistics.
    pub fn export_stats(&self) -> serde_json::Value {
        let scheduler = self.shared.scheduler.stats();

        let i2c: serde_json::Map<String, serde_json::Value> = self
            .i2c
            .iter()
            .map(|(id, c)| {
                let s = c.stats();
                (
                    id.to_string(),
                    serde_json::json!({
                        "transfers": s.transfers,
                        "arbitration_lost": s.arbitration_lost,
                        "nacks": s.nacks,
                        "stretch_timeouts": s.stretch_timeouts,
                    }),
                )
            })
            .collect();
        let spi: serde_json::Map<String, serde_json::Value> = self
            .spi
            .iter()
            .map(|(id, c)| (id.to_string(), serde_json::json!({ "transfers": c.transfers() })))
            .collect();
        let uart: serde_json::Map<String, serde_json::Value> = self
            .uart
            .iter()
            .map(|(id, c)| {
                let s = c.stats();
                (
                    id.to_string(),
                    serde_json::json!({
                        "frames_sent": s.frames_sent,
                        "bytes_received": s.bytes_received,
                        "framing_errors": s.framing_errors,
                        "parity_errors": s.parity_errors,
                        "overruns": s.overruns,
                        "tx_flushed": s.tx_flushed,
                    }),
                )
            })
            .collect();
        let gpio = self.gpio.stats();

        serde_json::json!({
            "kernel": {
                "current_time": self.now(),
                "events_scheduled": scheduler.scheduled,
                "events_fired": scheduler.fired,
                "events_cancelled": scheduler.cancelled,
                "events_pending": self.shared.scheduler.pending(),
                "events_published": self.shared.bus.published(),
                "transactions_completed": self.shared.transactions.completed(),
                "devices": self.bindings.len(),
            },
            "gpio": {
                "writes": gpio.writes,
                "reads": gpio.reads,
                "mode_changes": gpio.mode_changes,
                "glitches": gpio.glitches,
            },
            "pwm": { "edges": self.pwm.edges() },
            "i2c": i2c,
            "spi": spi,
            "uart": uart,
        })
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("now", &self.now())
            .field("pending", &self.shared.scheduler.pending())
            .field("i2c", &self.i2c.keys().collect::<Vec<_>>())
            .field("spi", &self.spi.keys().collect::<Vec<_>>())
            .field("uart", &self.uart.keys().collect::<Vec<_>>())
            .field("devices", &self.bindings.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfigBuilder;
    use crate::event::Topic;
    use crate::event_bus::EventLog;

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default()).unwrap()
    }

    #[test]
    fn test_kernel_creation() {
        let kernel = kernel();
        assert_eq!(kernel.now(), 0);
        assert_eq!(kernel.pending_events(), 0);
        assert!(kernel.i2c(1).is_some());
        assert!(kernel.spi(0).is_some());
        assert!(kernel.uart(0).is_some());
    }

    #[test]
    fn test_physical_and_bcm_resolve_to_same_pin() {
        let mut kernel = kernel();
        kernel
            .set_pin_mode(PinAddress::Physical(11), PinMode::Output, Pull::Off)
            .unwrap();
        assert_eq!(kernel.pin_mode(PinId(17)).unwrap(), PinMode::Output);

        assert!(matches!(
            kernel.write_pin(PinAddress::Physical(1), true),
            Err(SimError::UnknownPin(_))
        ));
    }

    #[test]
    fn test_run_until_moves_clock() {
        let mut kernel = kernel();
        kernel.run_until(250).unwrap();
        assert_eq!(kernel.now(), 250);

        let err = kernel.run_until(100).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(kernel.now(), 250);
    }

    #[test]
    fn test_wake_and_cancel() {
        let mut kernel = kernel();
        let log = EventLog::new();
        kernel.subscribe(Topic::Wake, log.clone());

        kernel.schedule_wake(100, 1);
        let cancelled = kernel.schedule_wake(50, 2);
        assert!(kernel.cancel(cancelled));

        kernel.run_until(1_000).unwrap();
        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time, 100);
        assert_eq!(events[0].payload, EventPayload::Wake { token: 1 });
    }

    #[test]
    fn test_step_and_predicate() {
        let mut kernel = kernel();
        kernel.schedule_wake(10, 1);
        kernel.schedule_wake(20, 2);

        assert_eq!(kernel.step().unwrap(), Some(10));
        let reached = kernel.run_until_with(1_000, |k| k.now() >= 20).unwrap();
        assert!(reached);
        assert_eq!(kernel.now(), 20);
        assert_eq!(kernel.step().unwrap(), None);
    }

    #[test]
    fn test_fixed_timestep_ticks() {
        let config = KernelConfigBuilder::new().fixed_step(100).build().unwrap();
        let mut kernel = Kernel::new(config).unwrap();
        let log = EventLog::new();
        kernel.subscribe(Topic::Tick, log.clone());

        kernel.set_pin_mode(PinId(4), PinMode::Output, Pull::Off).unwrap();
        kernel.write_pin(PinId(4), true).unwrap();
        kernel.run_until(300).unwrap();

        let ticks = log.events();
        assert_eq!(ticks.len(), 4);
        assert_eq!(ticks[3].time, 300);
        match ticks[3].payload {
            EventPayload::Tick { index, levels } => {
                assert_eq!(index, 3);
                assert_eq!(levels, 1 << 4);
            }
            ref other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unknown_bus() {
        let mut kernel = kernel();
        assert!(matches!(
            kernel.i2c_transfer(7, I2cRequest::read(0x48, 1)),
            Err(SimError::UnknownBus(BusRef::I2c(7)))
        ));
        assert!(matches!(
            kernel.register_device(DeviceAddress::Uart { port: 3 }, vec![Capability::UartPeer]),
            Err(SimError::UnknownBus(BusRef::Uart(3)))
        ));
    }

    #[test]
    fn test_register_and_publish_device() {
        let mut kernel = kernel();
        let log = EventLog::new();
        kernel.subscribe(Topic::Device, log.clone());

        let id = kernel
            .register_device(
                DeviceAddress::Pin(PinAddress::Physical(7)),
                vec![Capability::Sensor, Capability::DigitalInput],
            )
            .unwrap();
        assert_eq!(
            kernel.binding(id).unwrap().address,
            DeviceAddress::Pin(PinAddress::Bcm(4))
        );

        kernel
            .publish_device(id, serde_json::json!({ "celsius": 21.5 }))
            .unwrap();
        assert_eq!(log.len(), 1);
        assert!(kernel.publish_device(99, serde_json::json!(null)).is_err());
    }

    #[test]
    fn test_devices_from_config() {
        let config = KernelConfigBuilder::new()
            .device("i2c_register_file", 1, 0x48)
            .device("spi_loopback", 0, 1)
            .build()
            .unwrap();
        let mut kernel = Kernel::new(config).unwrap();

        assert_eq!(kernel.bindings().count(), 2);
        assert_eq!(kernel.i2c_scan(1).unwrap(), vec![0x48]);

        let bad = KernelConfigBuilder::new()
            .device("flux_capacitor", 1, 0x10)
            .build()
            .unwrap();
        assert!(Kernel::new(bad).is_err());
    }

    #[test]
    fn test_export_stats() {
        let mut kernel = kernel();
        kernel.set_pin_mode(PinId(5), PinMode::Output, Pull::Off).unwrap();
        kernel.write_pin(PinId(5), true).unwrap();
        kernel.run_until(10).unwrap();

        let stats = kernel.export_stats();
        assert_eq!(stats["kernel"]["current_time"], 10);
        assert_eq!(stats["gpio"]["writes"], 1);
        assert_eq!(stats["gpio"]["mode_changes"], 1);
        assert!(stats["i2c"]["1"].is_object());
    }
}
