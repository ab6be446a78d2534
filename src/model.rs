// Metric model - the canonical sample every input produces
//
// Inputs never build output batches directly. They push samples into an
// `Accumulator`, and the pipeline stamps, tags and prefixes them afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag set attached to a sample. Ordered so that grouping and output are stable.
pub type Tags = BTreeMap<String, String>;

/// A single measurement.
///
/// `timestamp` is in milliseconds since the epoch. Inputs may leave it at zero;
/// the pipeline overwrites it with the start of the collection window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,

    #[serde(default)]
    pub tags: Tags,

    #[serde(default)]
    pub timestamp: i64,

    pub value: f64,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Metric {
            name: name.into(),
            tags: Tags::new(),
            timestamp: 0,
            value,
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Sink for samples produced during one collection round.
pub trait Accumulator: Send {
    fn add_metric(&mut self, metric: Metric);

    fn add_value(&mut self, name: &str, tags: Tags, value: f64) {
        self.add_metric(Metric::new(name, value).with_tags(tags));
    }
}

/// Accumulator that keeps every sample of a round in memory.
///
/// Bounded only by what a single round produces; a fresh one is created per round.
#[derive(Debug, Default)]
pub struct MemoryAccumulator {
    metrics: Vec<Metric>,
}

impl MemoryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn into_metrics(self) -> Vec<Metric> {
        self.metrics
    }
}

impl Accumulator for MemoryAccumulator {
    fn add_metric(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }
}
