//! Experiment-tracking sinks.
//!
//! Every curve is plotted against `train/epoch_float`. Records that do not
//! carry it themselves (learning rates, validation metrics) are stamped with
//! the most recent value the sink has seen.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::training::metrics::MetricsRecord;

/// Destination for named scalar metrics.
pub trait TrackingSink {
    /// Declare `step_key` as the x-axis for every key under `namespaces`.
    fn define_step_metric(&mut self, step_key: &str, namespaces: &[&str]) -> anyhow::Result<()>;

    fn log(&mut self, record: &MetricsRecord) -> anyhow::Result<()>;
}

/// Remembers the last step value and stamps records that lack one.
#[derive(Debug, Clone, Default)]
struct StepAxis {
    key: Option<String>,
    last: f64,
}

impl StepAxis {
    fn define(&mut self, key: &str) {
        self.key = Some(key.to_string());
    }

    fn stamp(&mut self, record: &MetricsRecord) -> MetricsRecord {
        let mut out = record.clone();
        if let Some(key) = &self.key {
            match record.get_raw(key) {
                Some(v) => self.last = v,
                None => out.insert_raw(key.clone(), self.last),
            }
        }
        out
    }
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingSink {
    axis: StepAxis,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrackingSink for TracingSink {
    fn define_step_metric(&mut self, step_key: &str, namespaces: &[&str]) -> anyhow::Result<()> {
        self.axis.define(step_key);
        tracing::debug!(step_key, ?namespaces, "Defined step metric");
        Ok(())
    }

    fn log(&mut self, record: &MetricsRecord) -> anyhow::Result<()> {
        let stamped = self.axis.stamp(record);
        tracing::info!(step = self.axis.last, "{stamped}");
        Ok(())
    }
}

/// Appends one JSON object per `log` call to a `.jsonl` file.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
    axis: StepAxis,
}

impl JsonlSink {
    /// Open (or create) `path` for appending.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            axis: StepAxis::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrackingSink for JsonlSink {
    fn define_step_metric(&mut self, step_key: &str, _namespaces: &[&str]) -> anyhow::Result<()> {
        self.axis.define(step_key);
        Ok(())
    }

    fn log(&mut self, record: &MetricsRecord) -> anyhow::Result<()> {
        let stamped = self.axis.stamp(record);
        serde_json::to_writer(&mut self.writer, &stamped)?;
        self.writer.write_all(b"\n")?;
        self.writer
            .flush()
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

/// Keeps every logged record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub step_key: Option<String>,
    pub namespaces: Vec<String>,
    pub records: Vec<MetricsRecord>,
    axis: StepAxis,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records containing `key`, in logging order.
    pub fn values(&self, key: &str) -> Vec<f64> {
        self.records.iter().filter_map(|r| r.get_raw(key)).collect()
    }
}

impl TrackingSink for MemorySink {
    fn define_step_metric(&mut self, step_key: &str, namespaces: &[&str]) -> anyhow::Result<()> {
        self.axis.define(step_key);
        self.step_key = Some(step_key.to_string());
        self.namespaces = namespaces.iter().map(|s| s.to_string()).collect();
        Ok(())
    }

    fn log(&mut self, record: &MetricsRecord) -> anyhow::Result<()> {
        let stamped = self.axis.stamp(record);
        self.records.push(stamped);
        Ok(())
    }
}

/// Fans every call out to several sinks.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn TrackingSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl TrackingSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl TrackingSink for MultiSink {
    fn define_step_metric(&mut self, step_key: &str, namespaces: &[&str]) -> anyhow::Result<()> {
        for sink in &mut self.sinks {
            sink.define_step_metric(step_key, namespaces)?;
        }
        Ok(())
    }

    fn log(&mut self, record: &MetricsRecord) -> anyhow::Result<()> {
        for sink in &mut self.sinks {
            sink.log(record)?;
        }
        Ok(())
    }
}
