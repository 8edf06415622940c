//! Accumulation of agent metric samples into summaries.
//!
//! Series are keyed by `(agent, name, attributes)`. A `sum` sample adds to
//! the series, a `gauge` sample replaces it. The number of series is capped;
//! once full, samples for new series are dropped while existing series keep
//! updating. Nothing is evicted for the life of the process.

use super::model::{MetricKind, MetricSample, MetricSummary, limit_attributes};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{trace, warn};

/// Default cap on distinct series.
pub const DEFAULT_MAX_SERIES: usize = 1000;

type SeriesKey = (String, String, BTreeMap<String, String>);

/// Thread-safe metric accumulator.
pub struct MetricAggregator {
    max_series: usize,
    series: Mutex<HashMap<SeriesKey, f64>>,
}

impl MetricAggregator {
    /// Create an aggregator holding at most `max_series` series.
    pub fn new(max_series: usize) -> Self {
        Self {
            max_series,
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Fold one sample into its series.
    ///
    /// Returns `false` if the sample was rejected: empty name, non-finite
    /// value, or a new series while the cap is reached.
    pub fn record(&self, agent: &str, sample: MetricSample) -> bool {
        if sample.name.is_empty() || !sample.value.is_finite() {
            trace!("Ignoring unusable sample {:?}", sample.name);
            return false;
        }

        let key = (
            agent.to_string(),
            sample.name,
            limit_attributes(sample.attributes),
        );

        let mut series = self.series.lock();
        if let Some(value) = series.get_mut(&key) {
            match sample.kind {
                // Finite inputs can still overflow; keep the total a JSON number
                MetricKind::Sum => *value = (*value + sample.value).clamp(f64::MIN, f64::MAX),
                MetricKind::Gauge => *value = sample.value,
            }
            return true;
        }

        if series.len() >= self.max_series {
            warn!(
                "Metric series limit ({}) reached, dropping {} from {}",
                self.max_series, key.1, key.0
            );
            return false;
        }
        series.insert(key, sample.value);
        true
    }

    /// Fold a batch of samples; returns how many were accepted.
    pub fn record_all(&self, agent: &str, samples: impl IntoIterator<Item = MetricSample>) -> usize {
        samples
            .into_iter()
            .map(|s| self.record(agent, s))
            .filter(|accepted| *accepted)
            .count()
    }

    /// All summaries, sorted by agent, then name, then attributes.
    pub fn summaries(&self) -> Vec<MetricSummary> {
        let series = self.series.lock();
        let mut out: Vec<MetricSummary> = series
            .iter()
            .map(|((agent, name, attributes), value)| MetricSummary {
                name: name.clone(),
                agent: agent.clone(),
                value: *value,
                attributes: attributes.clone(),
            })
            .collect();
        drop(series);

        out.sort_by(|a, b| {
            a.agent
                .cmp(&b.agent)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.attributes.cmp(&b.attributes))
        });
        out
    }

    /// Summaries grouped by agent.
    pub fn by_agent(&self) -> BTreeMap<String, Vec<MetricSummary>> {
        let mut grouped: BTreeMap<String, Vec<MetricSummary>> = BTreeMap::new();
        for summary in self.summaries() {
            grouped.entry(summary.agent.clone()).or_default().push(summary);
        }
        grouped
    }

    /// Number of distinct series.
    pub fn len(&self) -> usize {
        self.series.lock().len()
    }

    /// Whether no series has been recorded.
    pub fn is_empty(&self) -> bool {
        self.series.lock().is_empty()
    }
}

impl Default for MetricAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SERIES)
    }
}
