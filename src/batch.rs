//! Batch execution of independent kernels.
//!
//! Each job builds its own [`Kernel`] from a configuration, applies a driver
//! script, runs to a fixed time and returns its trace. Kernels share nothing,
//! so jobs can run on any thread in any order and still produce the same
//! traces.
//!
//! # Feature Flag
//!
//! With the `parallel` feature jobs run on a rayon thread pool:
//! ```toml
//! [dependencies]
//! boardsim = { version = "0.1", features = ["parallel"] }
//! ```

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use std::sync::Arc;

use crate::config::KernelConfig;
use crate::error::SimResult;
use crate::kernel::Kernel;
use crate::trace::Trace;
use crate::types::SimTime;

/// Driver script applied to a freshly built kernel before it runs.
pub type Scenario = Arc<dyn Fn(&mut Kernel) -> SimResult<()> + Send + Sync>;

struct BatchJob {
    name: String,
    config: KernelConfig,
    until: SimTime,
    scenario: Scenario,
}

/// Output of one job.
#[derive(Clone, Debug)]
pub struct BatchResult {
    pub name: String,
    pub trace: Trace,
    pub stats: serde_json::Value,
}

/// Runs a set of independent simulations.
///
/// # Example
///
/// ```
/// use boardsim::{BatchRunner, KernelConfig, PinId, PinMode, Pull};
///
/// let mut batch = BatchRunner::new();
/// for seed in 0..3 {
///     let mut config = KernelConfig::default();
///     config.simulation.seed = seed;
///     batch.add(format!("seed-{}", seed), config, 1_000, |k| {
///         k.set_pin_mode(PinId(17), PinMode::Output, Pull::Off)?;
///         k.write_pin(PinId(17), true)
///     });
/// }
///
/// let results = batch.run();
/// assert_eq!(results.len(), 3);
/// assert!(results.iter().all(|r| r.is_ok()));
/// ```
#[derive(Default)]
pub struct BatchRunner {
    jobs: Vec<BatchJob>,
    /// Number of worker threads (0 = rayon default)
    num_threads: usize,
}

impl BatchRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads.
    ///
    /// Only has an effect with the `parallel` feature.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.num_threads = threads;
        self
    }

    /// Adds a job that applies `scenario` and runs until `until`.
    pub fn add<F>(&mut self, name: impl Into<String>, config: KernelConfig, until: SimTime, scenario: F)
    where
        F: Fn(&mut Kernel) -> SimResult<()> + Send + Sync + 'static,
    {
        self.jobs.push(BatchJob {
            name: name.into(),
            config,
            until,
            scenario: Arc::new(scenario),
        });
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Runs every job; results come back in the order jobs were added.
    #[cfg(not(feature = "parallel"))]
    pub fn run(&self) -> Vec<SimResult<BatchResult>> {
        self.jobs.iter().map(run_job).collect()
    }

    /// Runs every job on the rayon pool; results come back in the order jobs
    /// were added.
    #[cfg(feature = "parallel")]
    pub fn run(&self) -> Vec<SimResult<BatchResult>> {
        if self.num_threads > 0 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.num_threads)
                .build()
            {
                Ok(pool) => return pool.install(|| self.jobs.par_iter().map(run_job).collect()),
                Err(err) => tracing::warn!(error = %err, "falling back to the global rayon pool"),
            }
        }
        self.jobs.par_iter().map(run_job).collect()
    }
}

fn run_job(job: &BatchJob) -> SimResult<BatchResult> {
    let mut kernel = Kernel::new(job.config.clone())?;
    let recorder = kernel.record();
    (job.scenario)(&mut kernel)?;
    kernel.run_until(job.until)?;
    tracing::debug!(job = %job.name, records = recorder.len(), "batch job finished");
    Ok(BatchResult {
        name: job.name.clone(),
        trace: recorder.trace(),
        stats: kernel.export_stats(),
    })
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("jobs", &self.jobs.iter().map(|j| j.name.as_str()).collect::<Vec<_>>())
            .field("num_threads", &self.num_threads)
            .finish()
    }
}
