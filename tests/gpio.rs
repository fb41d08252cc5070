//! Integration tests for pins, GPIO and the ownership rules.

use boardsim::{
    BusRef, ConfigChange, ControllerId, Edge, EdgeDetect, EventLog, EventPayload, I2cRequest,
    Kernel, KernelConfig, PinAddress, PinId, PinMode, Pull, Resource, SimError, Topic,
};
use boardsim::devices::builtin::I2cRegisterFile;

fn kernel() -> Kernel {
    Kernel::new(KernelConfig::default()).unwrap()
}

// ============================================================================
// Levels and edges
// ============================================================================

#[test]
fn test_repeated_writes_publish_one_edge() {
    let mut kernel = kernel();
    let levels = EventLog::new();
    kernel.subscribe(Topic::PinLevel, levels.clone());

    kernel.set_pin_mode(PinId(17), PinMode::Output, Pull::Off).unwrap();
    for (t, level) in [(10, true), (20, true), (30, true), (40, false), (50, false)] {
        kernel.run_until(t).unwrap();
        kernel.write_pin(PinId(17), level).unwrap();
    }

    let events = levels.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].time, 10);
    assert_eq!(events[1].time, 40);

    let signal = kernel.signal(PinId(17)).unwrap();
    assert_eq!(signal.edges(), vec![(10, Edge::Rising), (40, Edge::Falling)]);
    assert_eq!(signal.last_transition(), 40);
}

#[test]
fn test_edge_detect_filters() {
    let mut kernel = kernel();
    let edges = EventLog::new();
    kernel.subscribe(Topic::GpioEdge, edges.clone());

    kernel.set_pin_mode(PinId(27), PinMode::Output, Pull::Off).unwrap();
    kernel.add_edge_detect(PinId(27), EdgeDetect::Rising).unwrap();

    for (t, level) in [(0, true), (5, false), (10, true), (15, false)] {
        kernel.run_until(t).unwrap();
        kernel.write_pin(PinId(27), level).unwrap();
    }
    assert_eq!(edges.len(), 2);
    assert!(edges.events().iter().all(|e| e.payload
        == EventPayload::GpioEdge {
            pin: PinId(27),
            edge: Edge::Rising
        }));

    kernel.remove_edge_detect(PinId(27)).unwrap();
    kernel.run_until(20).unwrap();
    kernel.write_pin(PinId(27), true).unwrap();
    assert_eq!(edges.len(), 2);
}

#[test]
fn test_output_reads_back_last_write() {
    let mut kernel = kernel();
    kernel.set_pin_mode(PinAddress::Physical(12), PinMode::Output, Pull::Off).unwrap();
    kernel.write_pin(PinId(18), true).unwrap();
    assert!(kernel.read_pin(PinAddress::Physical(12)).unwrap());
    assert_eq!(kernel.gpio().stats().reads, 1);
}

#[test]
fn test_write_to_input_fails() {
    let mut kernel = kernel();
    let err = kernel.write_pin(PinId(5), true).unwrap_err();
    assert!(matches!(
        err,
        SimError::InvalidOperationForMode { operation: "write", .. }
    ));
}

#[test]
fn test_unknown_pins() {
    let mut kernel = kernel();
    assert!(matches!(
        kernel.set_pin_mode(PinId(40), PinMode::Output, Pull::Off),
        Err(SimError::UnknownPin(_))
    ));
    // Physical pin 6 is ground
    assert!(matches!(
        kernel.read_pin(PinAddress::Physical(6)),
        Err(SimError::UnknownPin(_))
    ));
}

#[test]
fn test_pulls_and_external_drive() {
    let mut kernel = kernel();
    let edges = EventLog::new();
    kernel.subscribe(Topic::GpioEdge, edges.clone());

    kernel.set_pin_mode(PinId(23), PinMode::Input, Pull::Up).unwrap();
    kernel.add_edge_detect(PinId(23), EdgeDetect::Both).unwrap();
    assert!(kernel.read_pin(PinId(23)).unwrap());

    // A button pulls the line low, then lets go
    kernel.run_until(100).unwrap();
    kernel.drive_input(PinId(23), Some(false)).unwrap();
    assert!(!kernel.read_pin(PinId(23)).unwrap());
    kernel.run_until(200).unwrap();
    kernel.drive_input(PinId(23), None).unwrap();
    assert!(kernel.read_pin(PinId(23)).unwrap());

    let kinds: Vec<_> = edges
        .events()
        .iter()
        .map(|e| (e.time, e.payload.clone()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (100, EventPayload::GpioEdge { pin: PinId(23), edge: Edge::Falling }),
            (200, EventPayload::GpioEdge { pin: PinId(23), edge: Edge::Rising }),
        ]
    );

    // Outputs cannot be driven from outside
    kernel.set_pin_mode(PinId(24), PinMode::Output, Pull::Off).unwrap();
    assert!(kernel.drive_input(PinId(24), Some(true)).is_err());
}

#[test]
fn test_write_at_time_zero_is_in_history() {
    let mut kernel = kernel();
    kernel.set_pin_mode(PinId(17), PinMode::Output, Pull::Off).unwrap();
    kernel.write_pin(PinId(17), true).unwrap();
    kernel.run_until(10).unwrap();
    kernel.write_pin(PinId(17), false).unwrap();

    let signal = kernel.signal(PinId(17)).unwrap();
    assert_eq!(signal.edges(), vec![(0, Edge::Rising), (10, Edge::Falling)]);
    assert_eq!(signal.count_edges(EdgeDetect::Rising, 0, 1), 1);
}

#[test]
fn test_edge_detect_changes_are_published() {
    let mut kernel = kernel();
    let changes = EventLog::new();
    kernel.subscribe(Topic::Config, changes.clone());

    kernel.add_edge_detect(PinId(27), EdgeDetect::Falling).unwrap();
    kernel.remove_edge_detect(PinId(27)).unwrap();

    let payloads: Vec<_> = changes.events().into_iter().map(|e| e.payload).collect();
    assert_eq!(
        payloads,
        vec![
            EventPayload::Config(ConfigChange::EdgeDetect {
                pin: PinId(27),
                detect: Some(EdgeDetect::Falling)
            }),
            EventPayload::Config(ConfigChange::EdgeDetect { pin: PinId(27), detect: None }),
        ]
    );
    assert_eq!(payloads[0].pin(), Some(PinId(27)));
}

// ============================================================================
// Glitches
// ============================================================================

#[test]
fn test_glitch_pulses_and_restores() {
    let mut kernel = kernel();
    let edges = EventLog::new();
    kernel.subscribe(Topic::GpioEdge, edges.clone());
    kernel.set_pin_mode(PinId(23), PinMode::Input, Pull::Up).unwrap();
    kernel.add_edge_detect(PinId(23), EdgeDetect::Both).unwrap();

    kernel.run_until(100).unwrap();
    kernel.gpio_inject_glitch(PinId(23), 5).unwrap();
    assert!(!kernel.read_pin(PinId(23)).unwrap());
    kernel.run_until(110).unwrap();
    assert!(kernel.read_pin(PinId(23)).unwrap());

    let seen: Vec<_> = edges.events().iter().map(|e| (e.time, e.payload.clone())).collect();
    assert_eq!(
        seen,
        vec![
            (100, EventPayload::GpioEdge { pin: PinId(23), edge: Edge::Falling }),
            (105, EventPayload::GpioEdge { pin: PinId(23), edge: Edge::Rising }),
        ]
    );
    assert_eq!(kernel.gpio().stats().glitches, 1);
}

#[test]
fn test_glitch_on_low_output_goes_high() {
    let mut kernel = kernel();
    kernel.set_pin_mode(PinId(17), PinMode::Output, Pull::Off).unwrap();
    kernel.run_until(50).unwrap();
    kernel.gpio_inject_glitch(PinId(17), 1).unwrap();
    kernel.run_until(60).unwrap();

    assert_eq!(
        kernel.signal(PinId(17)).unwrap().edges(),
        vec![(50, Edge::Rising), (51, Edge::Falling)]
    );
    assert!(matches!(
        kernel.gpio_inject_glitch(PinId(17), 0),
        Err(SimError::InvalidParameter(_))
    ));
    assert!(matches!(
        kernel.gpio_inject_glitch(PinId(40), 5),
        Err(SimError::UnknownPin(_))
    ));
}

// ============================================================================
// Ownership
// ============================================================================

#[test]
fn test_claimed_pin_rejects_other_controllers() {
    let mut kernel = kernel();
    let driver = ControllerId::External(1);
    kernel.claim_output(PinId(17), driver).unwrap();

    let err = kernel
        .set_pin_mode(PinId(17), PinMode::Output, Pull::Off)
        .unwrap_err();
    assert!(err.is_contention());
    assert!(matches!(
        err,
        SimError::PinOwnershipConflict { owner: ControllerId::External(1), requester: ControllerId::Gpio, .. }
    ));

    // Claiming twice as the same owner is fine; releasing hands the pin over
    kernel.claim_output(PinId(17), driver).unwrap();
    kernel.release(Resource::Pin(PinId(17)), driver).unwrap();
    kernel.set_pin_mode(PinId(17), PinMode::Output, Pull::Off).unwrap();
    assert_eq!(kernel.owner(Resource::Pin(PinId(17))), Some(ControllerId::Gpio));
}

#[test]
fn test_gpio_and_pwm_never_share_a_pin() {
    let mut kernel = kernel();
    kernel.set_pin_mode(PinId(18), PinMode::Output, Pull::Off).unwrap();
    kernel.pwm_configure(PinId(18), 1_000.0, 50.0).unwrap();

    let err = kernel.pwm_start(PinId(18)).unwrap_err();
    assert!(matches!(err, SimError::PinOwnershipConflict { owner: ControllerId::Gpio, .. }));

    kernel.set_pin_mode(PinId(18), PinMode::Input, Pull::Off).unwrap();
    assert_eq!(kernel.owner(Resource::Pin(PinId(18))), None);
    kernel.pwm_start(PinId(18)).unwrap();
    assert_eq!(kernel.owner(Resource::Pin(PinId(18))), Some(ControllerId::Pwm));

    // GPIO cannot drive or reconfigure it while PWM owns it
    assert!(kernel.write_pin(PinId(18), true).is_err());
    assert!(kernel
        .set_pin_mode(PinId(18), PinMode::Output, Pull::Off)
        .is_err());
}

#[test]
fn test_unsupported_alt_function() {
    let mut kernel = kernel();
    let err = kernel
        .set_pin_mode(PinId(4), PinMode::Alt(BusRef::I2c(1)), Pull::Off)
        .unwrap_err();
    assert!(matches!(err, SimError::UnsupportedMode { pin: PinId(4), .. }));

    assert!(matches!(
        kernel.pwm_configure(PinId(4), 100.0, 10.0),
        Err(SimError::UnsupportedMode { .. })
    ));
}

#[test]
fn test_mode_change_while_bus_busy() {
    let mut kernel = kernel();
    let i2c = BusRef::I2c(1);
    kernel.set_pin_mode(PinId(2), PinMode::Alt(i2c), Pull::Up).unwrap();
    kernel.set_pin_mode(PinId(3), PinMode::Alt(i2c), Pull::Up).unwrap();
    kernel
        .i2c_attach(1, 0x48, Box::new(I2cRegisterFile::new()))
        .unwrap();

    kernel.i2c_transfer(1, I2cRequest::write(0x48, [0x01, 0x02])).unwrap();
    kernel.run_until(50).unwrap();

    let err = kernel
        .set_pin_mode(PinId(2), PinMode::Input, Pull::Off)
        .unwrap_err();
    assert!(matches!(err, SimError::ModeChangeWhileBusy { pin: PinId(2) }));

    kernel.run_until(1_000).unwrap();
    kernel.set_pin_mode(PinId(2), PinMode::Input, Pull::Off).unwrap();
}

#[test]
fn test_i2c_lines_mirror_onto_bound_pins() {
    let mut kernel = kernel();
    let i2c = BusRef::I2c(1);
    kernel.set_pin_mode(PinId(2), PinMode::Alt(i2c), Pull::Up).unwrap();
    kernel.set_pin_mode(PinId(3), PinMode::Alt(i2c), Pull::Up).unwrap();

    kernel.run_until(100).unwrap();
    kernel.i2c_transfer(1, I2cRequest::write(0x50, [0xAA])).unwrap();
    kernel.run_until(1_000).unwrap();

    // The pull-ups hold both lines high, Start pulls them low, Stop releases them
    let sda = kernel.signal(PinId(2)).unwrap();
    assert_eq!(sda.edges().first(), Some(&(100, Edge::Falling)));
    assert!(sda.level());
    assert!(kernel.signal(PinId(3)).unwrap().level());
}
