//! LED blink with a temperature sensor.
//!
//! A cooperative task toggles GPIO17 every 250 ms by sleeping on wake
//! events, reads a TMP102-style sensor over I2C once per second and prints
//! what the board did. The run is recorded and the trace is replayed at the
//! end to show it reproduces exactly.
//!
//! Run with: `cargo run --example blink`

use boardsim::devices::builtin::I2cRegisterFile;
use boardsim::{
    EventLog, EventPayload, I2cRequest, Kernel, KernelConfig, Outcome, PinId, PinMode, Pull,
    Replayer, SimResult, SimTime, Topic,
};

const LED: PinId = PinId(17);
const SENSOR_ADDRESS: u16 = 0x48;
const BLINK_PERIOD: SimTime = 250_000;
const SAMPLE_PERIOD: SimTime = 1_000_000;
const SIM_TIME: SimTime = 3_000_000;

const BLINK_TASK: u64 = 1;
const SAMPLE_TASK: u64 = 2;

// -----------------------------------------------------------------------------
// Setup
// -----------------------------------------------------------------------------

fn build() -> SimResult<Kernel> {
    let mut kernel = Kernel::new(KernelConfig::default())?;
    kernel.set_pin_mode(LED, PinMode::Output, Pull::Off)?;

    // 25.0 °C in the TMP102 12-bit format
    let sensor = I2cRegisterFile::new()
        .with_register(0x00, 0x19)
        .with_register(0x01, 0x00);
    kernel.i2c_attach(1, SENSOR_ADDRESS, Box::new(sensor))?;
    Ok(kernel)
}

fn celsius(raw: &[u8]) -> Option<f64> {
    match raw {
        [msb, lsb] => Some(f64::from((u16::from(*msb) << 4) | (u16::from(*lsb) >> 4)) * 0.0625),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// Cooperative runner
// -----------------------------------------------------------------------------

fn run(kernel: &mut Kernel) -> SimResult<()> {
    let wakes = EventLog::new();
    kernel.subscribe(Topic::Wake, wakes.clone());

    let mut led = false;
    kernel.schedule_wake(0, BLINK_TASK);
    kernel.schedule_wake(0, SAMPLE_TASK);

    while kernel.now() < SIM_TIME {
        if kernel.step()?.is_none() {
            break;
        }
        for event in wakes.take() {
            match event.payload {
                EventPayload::Wake { token: BLINK_TASK } => {
                    led = !led;
                    kernel.write_pin(LED, led)?;
                    kernel.schedule_wake(BLINK_PERIOD, BLINK_TASK);
                }
                EventPayload::Wake { token: SAMPLE_TASK } => {
                    kernel.i2c_transfer(1, I2cRequest::write_read(SENSOR_ADDRESS, [0x00], 2))?;
                    kernel.schedule_wake(SAMPLE_PERIOD, SAMPLE_TASK);
                }
                _ => {}
            }
        }
    }
    kernel.run_until(SIM_TIME)
}

fn main() -> SimResult<()> {
    boardsim::init_logging("info");

    let mut kernel = build()?;
    let edges = EventLog::new();
    let transactions = EventLog::new();
    kernel.subscribe(Topic::PinLevel, edges.clone());
    kernel.subscribe(Topic::I2cTransaction, transactions.clone());
    let recorder = kernel.record();

    run(&mut kernel)?;

    println!("LED edges:");
    for event in edges.events() {
        if let EventPayload::PinLevel { pin, level } = event.payload {
            println!("  t={:>8} us  {} -> {}", event.time, pin, if level { "HIGH" } else { "LOW" });
        }
    }

    println!("Sensor reads:");
    for event in transactions.events() {
        if let EventPayload::Transaction(tx) = &event.payload {
            match (tx.outcome(), celsius(tx.bytes_in())) {
                (Some(Outcome::Completed), Some(temp)) => {
                    println!("  t={:>8} us  {:.2} C", event.time, temp)
                }
                (outcome, _) => println!("  t={:>8} us  failed: {:?}", event.time, outcome),
            }
        }
    }

    println!(
        "Stats: {}",
        serde_json::to_string_pretty(&kernel.export_stats()).unwrap_or_default()
    );

    let trace = recorder.trace();
    let replayed = Replayer::new(trace.clone())?.run()?;
    println!(
        "Replay: {} records, identical = {}",
        replayed.len(),
        replayed.records == trace.records
    );
    Ok(())
}
