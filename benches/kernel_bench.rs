//! Performance benchmarks for the simulation kernel.
//!
//! Run with: `cargo bench`
//! Or for specific bench: `cargo bench --bench kernel_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use boardsim::devices::builtin::{I2cRegisterFile, SpiLoopback};
use boardsim::{
    BatchRunner, EventLog, I2cRequest, Kernel, KernelConfig, KernelConfigBuilder, PinId, PinMode,
    Pull, Topic, TimestepMode,
};

fn kernel() -> Kernel {
    Kernel::new(KernelConfig::default()).unwrap()
}

// ============================================================================
// Scheduler
// ============================================================================

fn bench_wake_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("wake_throughput");

    for events in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*events));
        group.bench_with_input(BenchmarkId::new("events", events), events, |b, &events| {
            b.iter(|| {
                let mut kernel = kernel();
                // Interleaved due times exercise ordering, not just appends
                for i in 0..events {
                    kernel.schedule_wake((i * 7919) % 10_000, i);
                }
                kernel.run_until(10_000).unwrap();
                black_box(kernel.now())
            });
        });
    }

    group.finish();
}

fn bench_fixed_step_ticks(c: &mut Criterion) {
    let mut group = c.benchmark_group("fixed_step");

    for ticks in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*ticks));
        group.bench_with_input(BenchmarkId::new("ticks", ticks), ticks, |b, &ticks| {
            b.iter(|| {
                let config = KernelConfigBuilder::new()
                    .timestep(TimestepMode::Fixed { step_us: 10 })
                    .build()
                    .unwrap();
                let mut kernel = Kernel::new(config).unwrap();
                kernel.run_until(ticks * 10).unwrap();
                black_box(kernel.pending_events())
            });
        });
    }

    group.finish();
}

// ============================================================================
// Controllers
// ============================================================================

fn bench_gpio_toggle(c: &mut Criterion) {
    let mut group = c.benchmark_group("gpio_toggle");

    for subscribers in [0usize, 1, 8].iter() {
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            subscribers,
            |b, &subscribers| {
                b.iter(|| {
                    let mut kernel = kernel();
                    for _ in 0..subscribers {
                        kernel.subscribe(Topic::PinLevel, EventLog::new());
                    }
                    kernel.set_pin_mode(PinId(17), PinMode::Output, Pull::Off).unwrap();
                    for i in 0..1_000u64 {
                        kernel.run_until(i).unwrap();
                        kernel.write_pin(PinId(17), i % 2 == 0).unwrap();
                    }
                    black_box(kernel.gpio().stats().writes)
                });
            },
        );
    }

    group.finish();
}

fn bench_pwm_waveform(c: &mut Criterion) {
    let mut group = c.benchmark_group("pwm_waveform");

    // 10 kHz for 100 ms: 2000 edges
    group.throughput(Throughput::Elements(2_000));
    group.bench_function("10khz_100ms", |b| {
        b.iter(|| {
            let mut kernel = kernel();
            kernel.pwm_configure(PinId(18), 10_000.0, 25.0).unwrap();
            kernel.pwm_start(PinId(18)).unwrap();
            kernel.run_until(100_000).unwrap();
            black_box(kernel.pwm().edges())
        });
    });

    group.finish();
}

fn bench_bus_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_transactions");
    group.throughput(Throughput::Elements(100));

    group.bench_function("i2c_write_read", |b| {
        b.iter(|| {
            let mut kernel = kernel();
            kernel
                .i2c_attach(1, 0x48, Box::new(I2cRegisterFile::new()))
                .unwrap();
            for i in 0..100u8 {
                kernel
                    .i2c_transfer(1, I2cRequest::write_read(0x48, [i], 2))
                    .unwrap();
                kernel.run_for(1_000).unwrap();
            }
            black_box(kernel.i2c(1).unwrap().stats().transfers)
        });
    });

    group.bench_function("spi_exchange", |b| {
        b.iter(|| {
            let mut kernel = kernel();
            kernel.spi_attach(0, 0, Box::new(SpiLoopback::new())).unwrap();
            for i in 0..100u8 {
                kernel.spi_transfer(0, 0, vec![i; 16]).unwrap();
                kernel.run_for(200).unwrap();
            }
            black_box(kernel.spi(0).unwrap().transfers())
        });
    });

    group.bench_function("uart_link", |b| {
        b.iter(|| {
            let mut kernel = kernel();
            kernel.uart_connect(0, 0).unwrap();
            for _ in 0..100 {
                kernel.uart_write(0, b"x").unwrap();
                kernel.run_for(100).unwrap();
                kernel.uart_flush(0).unwrap();
            }
            black_box(kernel.uart(0).unwrap().stats().frames_sent)
        });
    });

    group.finish();
}

// ============================================================================
// Recording and batches
// ============================================================================

fn bench_recording_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("recording");

    for record in [false, true].iter() {
        group.bench_with_input(BenchmarkId::new("record", record), record, |b, &record| {
            b.iter(|| {
                let mut kernel = kernel();
                let recorder = record.then(|| kernel.record());
                kernel.pwm_configure(PinId(18), 1_000.0, 50.0).unwrap();
                kernel.pwm_start(PinId(18)).unwrap();
                kernel.run_until(100_000).unwrap();
                black_box(recorder.map(|r| r.len()))
            });
        });
    }

    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch");
    group.sample_size(20);

    for jobs in [1usize, 4, 8].iter() {
        group.throughput(Throughput::Elements(*jobs as u64));
        group.bench_with_input(BenchmarkId::new("jobs", jobs), jobs, |b, &jobs| {
            b.iter(|| {
                let mut batch = BatchRunner::new();
                for seed in 0..jobs as u64 {
                    let config = KernelConfigBuilder::new().seed(seed).build().unwrap();
                    batch.add(format!("job-{}", seed), config, 50_000, |k: &mut Kernel| {
                        k.pwm_configure(PinId(18), 2_000.0, 50.0)?;
                        k.pwm_start(PinId(18))
                    });
                }
                black_box(batch.run().len())
            });
        });
    }

    group.finish();
}

criterion_group!(scheduler_benches, bench_wake_throughput, bench_fixed_step_ticks);

criterion_group!(
    controller_benches,
    bench_gpio_toggle,
    bench_pwm_waveform,
    bench_bus_transactions
);

criterion_group!(trace_benches, bench_recording_overhead, bench_batch);

criterion_main!(scheduler_benches, controller_benches, trace_benches);
