//! Trace recording, replay and golden-trace comparison.
//!
//! A [`Trace`] is a header (the kernel configuration: timestep mode and bus
//! parameters) followed by every published event in delivery order. On disk
//! it is JSON lines: the header on the first line, one record per line after
//! it. Two runs of the same configuration and command script produce
//! byte-identical files.
//!
//! The [`Replayer`] re-publishes a trace's records at their original times on
//! a fresh kernel and checks that what comes out of the event bus matches the
//! recording field for field.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::KernelConfig;
use crate::error::SimResult;
use crate::event::{Event, EventPayload, Topic};
use crate::event_bus::{Subscriber, SubscriptionId, TopicFilter};
use crate::kernel::Kernel;
use crate::types::SimTime;

/// Version written into every trace header.
pub const TRACE_FORMAT_VERSION: u32 = 1;

/// Errors raised while reading, writing or comparing traces.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("trace has no header")]
    MissingHeader,

    #[error("trace header mismatch: {0}")]
    HeaderMismatch(String),

    #[error("record {index} at {sim_time}us differs in {field}")]
    Mismatch {
        index: usize,
        sim_time: SimTime,
        field: String,
    },

    #[error("record count differs: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// First line of a trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceHeader {
    pub format_version: u32,
    pub config: KernelConfig,
}

impl TraceHeader {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            format_version: TRACE_FORMAT_VERSION,
            config,
        }
    }
}

/// One recorded event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub sim_time: SimTime,
    pub topic: Topic,
    pub payload: EventPayload,
}

impl From<&Event> for TraceRecord {
    fn from(event: &Event) -> Self {
        Self {
            sim_time: event.time,
            topic: event.topic,
            payload: event.payload.clone(),
        }
    }
}

/// A complete recording.
#[derive(Clone, Debug, PartialEq)]
pub struct Trace {
    pub header: TraceHeader,
    pub records: Vec<TraceRecord>,
}

impl Trace {
    pub fn new(header: TraceHeader) -> Self {
        Self {
            header,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the records published on one topic.
    pub fn on_topic(&self, topic: Topic) -> impl Iterator<Item = &TraceRecord> {
        self.records.iter().filter(move |r| r.topic == topic)
    }

    /// Serializes to JSON lines.
    pub fn to_jsonl(&self) -> Result<String, TraceError> {
        let mut out = serde_json::to_string(&self.header)?;
        out.push('\n');
        for record in &self.records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parses JSON lines. Blank lines are skipped.
    pub fn from_jsonl(text: &str) -> Result<Self, TraceError> {
        Self::from_lines(text.lines().map(|l| Ok(l.to_string())))
    }

    fn from_lines<I>(lines: I) -> Result<Self, TraceError>
    where
        I: Iterator<Item = std::io::Result<String>>,
    {
        let mut header = None;
        let mut records = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if header.is_none() {
                header = Some(serde_json::from_str::<TraceHeader>(&line)?);
            } else {
                records.push(serde_json::from_str::<TraceRecord>(&line)?);
            }
        }
        let header = header.ok_or(TraceError::MissingHeader)?;
        Ok(Self { header, records })
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<(), TraceError> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        file.write_all(self.to_jsonl()?.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        let file = std::fs::File::open(path)?;
        Self::from_lines(BufReader::new(file).lines())
    }
}

/// A subscriber capturing every event it sees into a trace.
///
/// Clones share one buffer: hand a clone to the event bus and keep another
/// to collect the trace afterwards.
#[derive(Clone, Debug)]
pub struct TraceRecorder {
    header: TraceHeader,
    records: Arc<Mutex<Vec<TraceRecord>>>,
}

impl TraceRecorder {
    pub fn new(header: TraceHeader) -> Self {
        Self {
            header,
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of records captured so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Returns a snapshot of the recording.
    pub fn trace(&self) -> Trace {
        Trace {
            header: self.header.clone(),
            records: self.records.lock().clone(),
        }
    }
}

impl Subscriber for TraceRecorder {
    fn on_event(&mut self, event: &Event) -> Vec<EventPayload> {
        self.records.lock().push(TraceRecord::from(event));
        Vec::new()
    }
}

/// Compares a live trace against a golden one.
///
/// Headers are compared through their JSON form; records are compared in
/// order and the first differing field is reported.
pub fn compare(golden: &Trace, live: &Trace) -> Result<(), TraceError> {
    let expected = serde_json::to_value(&golden.header)?;
    let actual = serde_json::to_value(&live.header)?;
    if let Some(field) = first_difference(&expected, &actual, "header") {
        return Err(TraceError::HeaderMismatch(field));
    }

    for (index, (g, l)) in golden.records.iter().zip(&live.records).enumerate() {
        let field = if g.sim_time != l.sim_time {
            Some("sim_time".to_string())
        } else if g.topic != l.topic {
            Some("topic".to_string())
        } else {
            let expected = serde_json::to_value(&g.payload)?;
            let actual = serde_json::to_value(&l.payload)?;
            first_difference(&expected, &actual, "payload")
        };
        if let Some(field) = field {
            return Err(TraceError::Mismatch {
                index,
                sim_time: g.sim_time,
                field,
            });
        }
    }

    if golden.records.len() != live.records.len() {
        return Err(TraceError::LengthMismatch {
            expected: golden.records.len(),
            actual: live.records.len(),
        });
    }
    Ok(())
}

/// Returns the dotted path of the first differing field, if any.
fn first_difference(a: &serde_json::Value, b: &serde_json::Value, path: &str) -> Option<String> {
    use serde_json::Value;

    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            for (key, va) in x {
                let child = format!("{}.{}", path, key);
                match y.get(key) {
                    Some(vb) => {
                        if let Some(diff) = first_difference(va, vb, &child) {
                            return Some(diff);
                        }
                    }
                    None => return Some(child),
                }
            }
            y.keys()
                .find(|k| !x.contains_key(*k))
                .map(|k| format!("{}.{}", path, k))
        }
        (Value::Array(x), Value::Array(y)) => {
            if x.len() != y.len() {
                return Some(path.to_string());
            }
            x.iter()
                .zip(y)
                .enumerate()
                .find_map(|(i, (va, vb))| first_difference(va, vb, &format!("{}[{}]", path, i)))
        }
        _ if a == b => None,
        _ => Some(path.to_string()),
    }
}

/// Re-publishes a recorded trace at its original times.
///
/// The replay kernel is built from the trace header with its periodic tick
/// disabled, since recorded ticks are re-published like any other record.
/// Subscribers registered on the replayer see the replayed stream exactly as
/// they would have seen the live run.
pub struct Replayer {
    golden: Trace,
    kernel: Kernel,
    recorder: TraceRecorder,
}

impl Replayer {
    pub fn new(golden: Trace) -> SimResult<Self> {
        let payloads = golden.records.iter().map(|r| r.payload.clone()).collect();
        let mut kernel = Kernel::for_replay(golden.header.config.clone(), payloads)?;
        for (index, record) in golden.records.iter().enumerate() {
            kernel.schedule_replay(record.sim_time, index)?;
        }
        let recorder = TraceRecorder::new(golden.header.clone());
        kernel.subscribe(TopicFilter::All, recorder.clone());
        Ok(Self {
            golden,
            kernel,
            recorder,
        })
    }

    /// Registers a consumer of the replayed events.
    pub fn subscribe(
        &mut self,
        filter: impl Into<TopicFilter>,
        handler: impl Subscriber + 'static,
    ) -> SubscriptionId {
        self.kernel.subscribe(filter, handler)
    }

    /// Runs the replay to the last record and compares the result with the
    /// golden trace. Returns the replayed trace on success.
    pub fn run(mut self) -> SimResult<Trace> {
        let end = self.golden.records.last().map_or(0, |r| r.sim_time);
        self.kernel.run_until(end)?;
        let live = self.recorder.trace();
        compare(&self.golden, &live)?;
        tracing::debug!(records = live.len(), "replay matched");
        Ok(live)
    }
}

impl std::fmt::Debug for Replayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replayer")
            .field("records", &self.golden.records.len())
            .field("replayed", &self.recorder.len())
            .finish()
    }
}
