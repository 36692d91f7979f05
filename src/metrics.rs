//! # Metrics — Prometheus Exposition for the Supervisor
//!
//! A small, bounded set of operational gauges/counters (§10.6): the
//! original has no metrics surface beyond its log lines and MTTF/MTTR
//! estimates, but the teacher stack ships `prometheus-client` for exactly
//! this shape of thing, so the supervisor exposes the handful of numbers an
//! operator dashboard would actually want.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `depman_host_set_size` | Gauge | Cores currently assigned to the simulation |
//! | `depman_checkpoints_total` | Gauge | Number of validated checkpoints |
//! | `depman_mttf_seconds` | Gauge | Current mean time to failure estimate |
//! | `depman_mttr_seconds` | Gauge | Current mean time to repair estimate |
//! | `depman_countermeasures_total` | Counter (by kind) | Countermeasure attempts |

use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Label set distinguishing countermeasures by kind (`restart_simulation`,
/// `core_reboot`, `platform_reinitialization`).
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CountermeasureLabel {
    pub kind: String,
}

/// Thread-safe metrics registry for a supervisor run.
pub struct Metrics {
    pub registry: Registry,
    pub host_set_size: Gauge,
    pub checkpoints_total: Gauge,
    pub mttf_seconds: Gauge<f64, AtomicU64>,
    pub mttr_seconds: Gauge<f64, AtomicU64>,
    pub countermeasures_total: Family<CountermeasureLabel, Counter>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let host_set_size = Gauge::default();
        registry.register(
            "depman_host_set_size",
            "Cores currently assigned to the simulation",
            host_set_size.clone(),
        );

        let checkpoints_total = Gauge::default();
        registry.register(
            "depman_checkpoints_total",
            "Number of validated checkpoints",
            checkpoints_total.clone(),
        );

        let mttf_seconds = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "depman_mttf_seconds",
            "Current mean time to failure estimate",
            mttf_seconds.clone(),
        );

        let mttr_seconds = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "depman_mttr_seconds",
            "Current mean time to repair estimate",
            mttr_seconds.clone(),
        );

        let countermeasures_total = Family::<CountermeasureLabel, Counter>::default();
        registry.register(
            "depman_countermeasures",
            "Countermeasure attempts by kind",
            countermeasures_total.clone(),
        );

        Metrics {
            registry,
            host_set_size,
            checkpoints_total,
            mttf_seconds,
            mttr_seconds,
            countermeasures_total,
        }
    }

    pub fn record_countermeasure(&self, kind: &'static str) {
        self.countermeasures_total
            .get_or_create(&CountermeasureLabel { kind: kind.to_string() })
            .inc();
    }

    /// Render the current registry state in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        let _ = encode(&mut buf, &self.registry);
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_includes_registered_metric_names() {
        let metrics = Metrics::new();
        metrics.host_set_size.set(4);
        metrics.record_countermeasure("restart_simulation");
        let text = metrics.encode();
        assert!(text.contains("depman_host_set_size"));
        assert!(text.contains("depman_countermeasures"));
    }
}
