//! Integration tests for hardware PWM waveforms.

use boardsim::{
    ControllerId, Edge, EdgeDetect, EventLog, EventPayload, Kernel, KernelConfig,
    KernelConfigBuilder, PinId, PinMode, Resource, SimError, Topic,
};

const PWM_PIN: PinId = PinId(18);

fn kernel() -> Kernel {
    Kernel::new(KernelConfig::default()).unwrap()
}

/// (time, level) of every level change on the PWM pin.
fn levels(log: &EventLog) -> Vec<(u64, bool)> {
    log.events()
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::PinLevel { pin, level } if pin == PWM_PIN => Some((e.time, level)),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Waveform
// ============================================================================

#[test]
fn test_one_khz_square_wave() {
    let mut kernel = kernel();
    let log = EventLog::new();
    kernel.subscribe(Topic::PinLevel, log.clone());

    kernel.pwm_configure(PWM_PIN, 1_000.0, 50.0).unwrap();
    kernel.pwm_start(PWM_PIN).unwrap();
    kernel.run_until(9_999).unwrap();

    let seen = levels(&log);
    assert_eq!(seen.len(), 20);
    for (i, &(time, level)) in seen.iter().enumerate() {
        assert_eq!(time, i as u64 * 500);
        assert_eq!(level, i % 2 == 0);
    }

    assert!(kernel.pwm().is_running(PWM_PIN));
    assert_eq!(kernel.pin_mode(PWM_PIN).unwrap(), PinMode::Pwm);
    assert_eq!(kernel.owner(Resource::Pin(PWM_PIN)), Some(ControllerId::Pwm));
    let freq = kernel.signal(PWM_PIN).unwrap().frequency(5_000).unwrap();
    assert!((freq - 1_000.0).abs() < 250.0);
}

#[test]
fn test_signal_history_counts_every_edge() {
    let mut kernel = kernel();
    kernel.pwm_configure(PWM_PIN, 1_000.0, 50.0).unwrap();
    kernel.pwm_start(PWM_PIN).unwrap();
    kernel.run_until(9_999).unwrap();

    let signal = kernel.signal(PWM_PIN).unwrap();
    assert_eq!(signal.count_edges(EdgeDetect::Rising, 0, 10_000), 10);
    assert_eq!(signal.count_edges(EdgeDetect::Falling, 0, 10_000), 10);
    assert_eq!(signal.count_edges(EdgeDetect::Both, 0, 10_000), 20);
    assert_eq!(signal.edges()[0], (0, Edge::Rising));
    assert_eq!(signal.edges()[1], (500, Edge::Falling));
}

#[test]
fn test_very_low_frequency_does_not_overflow() {
    let mut kernel = kernel();
    kernel.pwm_configure(PWM_PIN, 1e-15, 50.0).unwrap();
    kernel.pwm_start(PWM_PIN).unwrap();
    kernel.run_until(1_000_000).unwrap();

    // The period saturates; the first high phase outlasts the run
    assert!(kernel.read_pin(PWM_PIN).unwrap());
    assert_eq!(kernel.signal(PWM_PIN).unwrap().edges(), vec![(0, Edge::Rising)]);

    // Full duty holds until a period end that saturates too
    kernel.pwm_stop(PWM_PIN).unwrap();
    kernel.pwm_configure(PWM_PIN, 1e-15, 100.0).unwrap();
    kernel.pwm_start(PWM_PIN).unwrap();
    kernel.run_until(2_000_000).unwrap();
    assert!(kernel.read_pin(PWM_PIN).unwrap());
}

#[test]
fn test_fixed_step_ticks_sample_waveform() {
    let config = KernelConfigBuilder::new().fixed_step(500).build().unwrap();
    let mut kernel = Kernel::new(config).unwrap();
    let log = EventLog::new();
    let ticks = EventLog::new();
    kernel.subscribe(Topic::PinLevel, log.clone());
    kernel.subscribe(Topic::Tick, ticks.clone());

    kernel.pwm_configure(PWM_PIN, 1_000.0, 50.0).unwrap();
    kernel.pwm_start(PWM_PIN).unwrap();
    kernel.run_until(9_999).unwrap();

    // Same waveform as in event-driven mode
    let seen = levels(&log);
    assert_eq!(seen.len(), 20);
    assert_eq!(seen[1], (500, false));

    // A tick due with an edge fires first, so it samples the level before it
    let samples: Vec<_> = ticks
        .events()
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::Tick { index, levels } => Some((index, levels & (1 << 18) != 0)),
            _ => None,
        })
        .collect();
    assert_eq!(samples.len(), 20);
    for (index, high) in samples {
        assert_eq!(high, index % 2 == 1, "tick {}", index);
    }
}

#[test]
fn test_duty_change_applies_next_period() {
    let mut kernel = kernel();
    let log = EventLog::new();
    kernel.subscribe(Topic::PinLevel, log.clone());

    kernel.pwm_configure(PWM_PIN, 1_000.0, 50.0).unwrap();
    kernel.pwm_start(PWM_PIN).unwrap();
    kernel.run_until(1_200).unwrap();
    kernel.pwm_configure(PWM_PIN, 1_000.0, 25.0).unwrap();
    kernel.run_until(2_999).unwrap();

    assert_eq!(
        levels(&log),
        vec![
            (0, true),
            (500, false),
            (1_000, true),
            // The running period keeps its 50% duty
            (1_500, false),
            (2_000, true),
            (2_250, false),
        ]
    );
    assert_eq!(kernel.pwm().parameters(PWM_PIN), Some((1_000.0, 25.0)));
}

#[test]
fn test_frequency_change_applies_next_period() {
    let mut kernel = kernel();
    let log = EventLog::new();
    kernel.subscribe(Topic::PinLevel, log.clone());

    kernel.pwm_configure(PWM_PIN, 1_000.0, 50.0).unwrap();
    kernel.pwm_start(PWM_PIN).unwrap();
    kernel.run_until(300).unwrap();
    kernel.pwm_configure(PWM_PIN, 500.0, 50.0).unwrap();
    kernel.run_until(4_999).unwrap();

    assert_eq!(
        levels(&log),
        vec![(0, true), (500, false), (1_000, true), (2_000, false), (3_000, true), (4_000, false)]
    );
}

#[test]
fn test_full_duty_holds_high() {
    let mut kernel = kernel();
    let log = EventLog::new();
    kernel.subscribe(Topic::PinLevel, log.clone());

    kernel.pwm_configure(PWM_PIN, 1_000.0, 100.0).unwrap();
    kernel.pwm_start(PWM_PIN).unwrap();
    kernel.run_until(5_000).unwrap();

    assert_eq!(levels(&log), vec![(0, true)]);
    assert!(kernel.pwm().edges() >= 5);
}

#[test]
fn test_stop_releases_pin() {
    let mut kernel = kernel();
    let log = EventLog::new();
    kernel.subscribe(Topic::PinLevel, log.clone());

    kernel.pwm_configure(PWM_PIN, 1_000.0, 50.0).unwrap();
    kernel.pwm_start(PWM_PIN).unwrap();
    kernel.run_until(2_250).unwrap();
    kernel.pwm_stop(PWM_PIN).unwrap();
    kernel.run_until(5_000).unwrap();

    let seen = levels(&log);
    assert_eq!(seen.last(), Some(&(2_250, false)));
    assert_eq!(seen.len(), 6);
    assert!(!kernel.pwm().is_running(PWM_PIN));
    assert_eq!(kernel.pin_mode(PWM_PIN).unwrap(), PinMode::Input);
    assert_eq!(kernel.owner(Resource::Pin(PWM_PIN)), None);
    assert_eq!(kernel.pending_events(), 0);

    // Stopping twice is harmless
    kernel.pwm_stop(PWM_PIN).unwrap();
}

#[test]
fn test_update_events() {
    let mut kernel = kernel();
    let updates = EventLog::new();
    kernel.subscribe(Topic::PwmUpdate, updates.clone());

    kernel.pwm_configure(PWM_PIN, 50.0, 7.5).unwrap();
    kernel.pwm_start(PWM_PIN).unwrap();

    let running: Vec<_> = updates
        .events()
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::PwmUpdate { running, .. } => Some(running),
            _ => None,
        })
        .collect();
    assert_eq!(running, vec![false, true]);
}

#[test]
fn test_invalid_parameters() {
    let mut kernel = kernel();
    for (freq, duty) in [(0.0, 50.0), (-5.0, 50.0), (f64::NAN, 50.0), (1_000.0, 120.0)] {
        assert!(matches!(
            kernel.pwm_configure(PWM_PIN, freq, duty),
            Err(SimError::InvalidParameter(_))
        ));
    }
    // Starting an unconfigured channel
    assert!(kernel.pwm_start(PinId(13)).is_err());
}
