use crate::Result;
use prometheus::{GaugeVec, Opts, Registry};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

pub const PERCENT_DONE_METRIC: &str = "reindexing.percent.done";

pub type Dimensions = BTreeMap<String, String>;

/// Gauge sink: each sample replaces the previous value for the same name and dimensions.
pub trait Metric: Send + Sync {
    fn set(&self, name: &str, dimensions: &Dimensions, value: f64);
}

/// Keeps the last sample per name and dimensions in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetric {
    values: Mutex<BTreeMap<String, BTreeMap<Dimensions, f64>>>,
}

impl InMemoryMetric {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn metrics(&self) -> BTreeMap<String, BTreeMap<Dimensions, f64>> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Metric for InMemoryMetric {
    fn set(&self, name: &str, dimensions: &Dimensions, value: f64) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .insert(dimensions.clone(), value);
    }
}

/// Exports samples as Prometheus gauges, one `GaugeVec` per metric name.
///
/// Dots in names become underscores, and the label set of a gauge is fixed by the dimensions of
/// its first sample.
pub struct PrometheusMetric {
    registry: Registry,
    gauges: Mutex<HashMap<String, GaugeVec>>,
}

impl PrometheusMetric {
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            gauges: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    fn try_set(&self, name: &str, dimensions: &Dimensions, value: f64) -> Result<()> {
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        let gauge = match gauges.get(name) {
            Some(gauge) => gauge.clone(),
            None => {
                let labels: Vec<&str> = dimensions.keys().map(String::as_str).collect();
                let gauge = GaugeVec::new(
                    Opts::new(prometheus_name(name), format!("Reindexing gauge {name}")),
                    &labels,
                )?;
                self.registry.register(Box::new(gauge.clone()))?;
                gauges.insert(name.to_string(), gauge.clone());
                gauge
            }
        };
        drop(gauges);

        let values: Vec<&str> = dimensions.values().map(String::as_str).collect();
        gauge.get_metric_with_label_values(&values)?.set(value);
        Ok(())
    }
}

impl Metric for PrometheusMetric {
    fn set(&self, name: &str, dimensions: &Dimensions, value: f64) {
        if let Err(err) = self.try_set(name, dimensions, value) {
            log::warn!("Failed to export metric {name}: {err}");
        }
    }
}

fn prometheus_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | ':' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dims(state: &str) -> Dimensions {
        [
            ("documenttype", "music"),
            ("clusterid", "cluster"),
            ("state", state),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn in_memory_keeps_last_value_per_dimensions() {
        let metric = InMemoryMetric::new();
        metric.set(PERCENT_DONE_METRIC, &dims("ready"), 10.0);
        metric.set(PERCENT_DONE_METRIC, &dims("ready"), 40.0);
        metric.set(PERCENT_DONE_METRIC, &dims("successful"), 100.0);

        let expected = BTreeMap::from([(
            PERCENT_DONE_METRIC.to_string(),
            BTreeMap::from([(dims("ready"), 40.0), (dims("successful"), 100.0)]),
        )]);
        assert_eq!(metric.metrics(), expected);

        metric.clear();
        assert!(metric.metrics().is_empty());
    }

    #[test]
    fn prometheus_exports_sanitized_gauge() {
        let metric = PrometheusMetric::new(Registry::new());
        metric.set(PERCENT_DONE_METRIC, &dims("ready"), 25.0);
        metric.set(PERCENT_DONE_METRIC, &dims("ready"), 75.0);

        let families = metric.registry().gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "reindexing_percent_done");
        let samples = families[0].get_metric();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].get_gauge().get_value(), 75.0);
    }

    #[test]
    fn prometheus_ignores_mismatched_labels() {
        let metric = PrometheusMetric::new(Registry::new());
        metric.set(PERCENT_DONE_METRIC, &dims("ready"), 25.0);
        metric.set(PERCENT_DONE_METRIC, &Dimensions::new(), 50.0);

        let families = metric.registry().gather();
        assert_eq!(families[0].get_metric().len(), 1);
    }
}
