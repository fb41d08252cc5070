//! End-to-end tests: configuration files, device models, external runners
//! and batch execution.
//!
//! These tests drive the kernel the way an embedding application does:
//! - Board set up from a YAML or JSON file
//! - Devices created from the factory registry
//! - A cooperative runner sleeping on wake events
//! - Independent kernels run as a batch

use std::collections::BTreeMap;

use boardsim::config::DeviceConfig;
use boardsim::devices::builtin::I2cRegisterFile;
use boardsim::{
    BatchRunner, Capability, DeviceAddress, DeviceModel, EventLog, EventPayload, I2cRequest,
    Kernel, KernelConfig, KernelConfigBuilder, Outcome, PinAddress, PinId, PinMode, Pull,
    SimError, Topic, TimestepMode,
};

const BOARD_YAML: &str = r#"
simulation:
  timestep:
    mode: fixed
    step_us: 1000
  seed: 7

i2c:
  - id: 1
    speed: standard
    stretch_timeout_us: 80

spi:
  - id: 0
    clock_hz: 2000000
    mode: 0

devices:
  - kind: i2c_register_file
    bus: 1
    address: 0x48
    attrs:
      fill: "165"
  - kind: i2c_register_file
    bus: 1
    address: 0x49
    attrs:
      stretch_us: "200"
  - kind: spi_loopback
    bus: 0
    address: 1
"#;

// ============================================================================
// Configuration-driven setup
// ============================================================================

#[test]
fn test_board_from_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("board.yaml");
    std::fs::write(&path, BOARD_YAML).unwrap();

    let config = KernelConfig::from_file(&path).unwrap();
    assert_eq!(config.simulation.timestep, TimestepMode::Fixed { step_us: 1000 });

    let mut kernel = Kernel::new(config).unwrap();
    assert_eq!(kernel.bindings().count(), 3);
    assert_eq!(kernel.i2c_scan(1).unwrap(), vec![0x48, 0x49]);

    let read = kernel.i2c_transfer(1, I2cRequest::read(0x48, 2)).unwrap();
    kernel.run_for(1_000).unwrap();
    let stretched = kernel.i2c_transfer(1, I2cRequest::read(0x49, 1)).unwrap();
    let spi = kernel.spi_transfer(0, 1, vec![0x3C]).unwrap();
    kernel.run_for(1_000).unwrap();

    let tx = kernel.transaction(read).unwrap();
    assert_eq!(tx.outcome(), Some(Outcome::Completed));
    assert_eq!(tx.bytes_in(), &[165, 165]);
    // The second register file stretches past the configured timeout
    assert_eq!(
        kernel.transaction(stretched).unwrap().outcome(),
        Some(Outcome::StretchTimeout)
    );
    let tx = kernel.transaction(spi).unwrap();
    assert_eq!(tx.bytes_in(), &[0x3C]);
    // 2 MHz: 4 µs per byte
    assert_eq!(tx.end(), Some(tx.start() + 4));
}

#[test]
fn test_json_file_and_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let original = KernelConfig::from_yaml(BOARD_YAML).unwrap();

    let json_path = dir.path().join("board.json");
    original.to_json_file(&json_path).unwrap();
    assert_eq!(KernelConfig::from_file(&json_path).unwrap(), original);

    let yaml_path = dir.path().join("board.yml");
    original.to_yaml_file(&yaml_path).unwrap();
    assert_eq!(KernelConfig::from_file(&yaml_path).unwrap(), original);

    let bad = dir.path().join("board.toml");
    std::fs::write(&bad, "").unwrap();
    assert!(KernelConfig::from_file(&bad).is_err());
}

#[test]
fn test_invalid_configs_are_rejected() {
    let zero_step = KernelConfigBuilder::new().fixed_step(0).build();
    assert!(zero_step.is_err());

    let mut config = KernelConfig::default();
    config.devices.push(DeviceConfig {
        kind: "flux_capacitor".to_string(),
        bus: 1,
        address: 0x10,
        ten_bit: false,
        attrs: BTreeMap::new(),
    });
    assert!(matches!(
        Kernel::new(config),
        Err(SimError::InvalidParameter(_))
    ));

    let wrong_bus = KernelConfigBuilder::new()
        .device("i2c_register_file", 4, 0x48)
        .build()
        .unwrap();
    assert!(matches!(
        Kernel::new(wrong_bus),
        Err(SimError::UnknownBus(_))
    ));
}

// ============================================================================
// Devices
// ============================================================================

#[test]
fn test_custom_device_kind() {
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    kernel.devices_mut().register("eeprom_24c02", |attrs| {
        let eeprom = I2cRegisterFile::from_attrs(attrs)?.with_register(0x00, 0xEE);
        Ok(DeviceModel::I2c(Box::new(eeprom)))
    });

    let id = kernel
        .add_device(&DeviceConfig {
            kind: "eeprom_24c02".to_string(),
            bus: 1,
            address: 0x50,
            ten_bit: false,
            attrs: BTreeMap::new(),
        })
        .unwrap();
    assert_eq!(
        kernel.binding(id).unwrap().address,
        DeviceAddress::I2c { bus: 1, address: 0x50, ten_bit: false }
    );

    let tx = kernel
        .i2c_transfer(1, I2cRequest::write_read(0x50, [0x00], 1))
        .unwrap();
    kernel.run_for(1_000).unwrap();
    assert_eq!(kernel.transaction(tx).unwrap().bytes_in(), &[0xEE]);
}

#[test]
fn test_pin_device_publishes_readings() {
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    let readings = EventLog::new();
    kernel.subscribe(Topic::Device, readings.clone());

    // A DHT-style sensor on physical pin 7 (GPIO4)
    let sensor = kernel
        .register_device(
            DeviceAddress::Pin(PinAddress::Physical(7)),
            vec![Capability::Sensor, Capability::DigitalInput],
        )
        .unwrap();
    assert_eq!(
        kernel.binding(sensor).unwrap().address,
        DeviceAddress::Pin(PinAddress::Bcm(4))
    );

    kernel.run_until(2_000).unwrap();
    kernel
        .publish_device(sensor, serde_json::json!({ "temperature_c": 21.5 }))
        .unwrap();

    let events = readings.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].time, 2_000);
    match &events[0].payload {
        EventPayload::Device { device, data } => {
            assert_eq!(*device, sensor);
            assert_eq!(data["temperature_c"], 21.5);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    assert!(kernel.publish_device(999, serde_json::json!(null)).is_err());
}

// ============================================================================
// Cooperative runner
// ============================================================================

#[test]
fn test_sleeping_task_resumes_on_wake() {
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    let wakes = EventLog::new();
    kernel.subscribe(Topic::Wake, wakes.clone());
    kernel.set_pin_mode(PinId(17), PinMode::Output, Pull::Off).unwrap();

    // A blink task: toggle, sleep 250 µs, four times
    let mut level = false;
    let mut resumed = Vec::new();
    kernel.schedule_wake(0, 1);
    while resumed.len() < 4 {
        if kernel.step().unwrap().is_none() {
            break;
        }
        for event in wakes.take() {
            if let EventPayload::Wake { token } = event.payload {
                resumed.push(event.time);
                level = !level;
                kernel.write_pin(PinId(17), level).unwrap();
                kernel.schedule_wake(250, token);
            }
        }
    }

    assert_eq!(resumed, vec![0, 250, 500, 750]);
    assert!(!kernel.read_pin(PinId(17)).unwrap());

    // The task exits; its last sleep is cancelled by the runner
    let next = kernel.schedule_wake(250, 2);
    assert!(kernel.cancel(next));
    assert!(!kernel.cancel(next));
}

#[test]
fn test_wait_for_transaction_with_predicate() {
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    kernel
        .i2c_attach(1, 0x48, Box::new(I2cRegisterFile::new()))
        .unwrap();

    let id = kernel.i2c_transfer(1, I2cRequest::write(0x48, [1, 2])).unwrap();
    let done = kernel
        .run_until_with(10_000, |k| {
            k.transaction(id).map_or(false, |t| t.is_finalized())
        })
        .unwrap();

    assert!(done);
    assert_eq!(kernel.now(), 290);

    // A condition that never holds leaves the clock at the limit
    let never = kernel.run_until_with(5_000, |_| false).unwrap();
    assert!(!never);
    assert_eq!(kernel.now(), 5_000);
}

// ============================================================================
// Batch execution
// ============================================================================

#[test]
fn test_batch_of_seeds() {
    let mut batch = BatchRunner::new().with_threads(2);
    for seed in [1u64, 2, 3, 1] {
        let config = KernelConfigBuilder::new().seed(seed).build().unwrap();
        batch.add(format!("seed-{}", seed), config, 5_000, |k: &mut Kernel| {
            k.uart_connect(0, 0)?;
            k.uart_write(0, b"ping")?;
            Ok(())
        });
    }

    let results: Vec<_> = batch.run().into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(results.len(), 4);
    for result in &results {
        assert_eq!(result.stats["uart"]["0"]["bytes_received"], 4);
        assert_eq!(result.stats["kernel"]["current_time"], 5_000);
    }
    // Same seed, same trace
    assert_eq!(results[0].trace, results[3].trace);
    assert_ne!(results[0].trace.header, results[1].trace.header);
}
