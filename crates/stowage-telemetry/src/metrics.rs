//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes a minimal set of counters/gauges relevant to Stowage services.

use std::convert::TryFrom;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: std::sync::Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    build_steps_total: IntCounterVec,
    layer_cache_total: IntCounterVec,
    events_emitted_total: IntCounterVec,
    container_exits_total: IntCounterVec,
    containers_running: IntGauge,
    build_duration_ms: IntGauge,
    build_failures_total: IntCounter,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Current number of running containers.
    pub containers_running: i64,
    /// Duration (ms) of the most recent build.
    pub build_duration_ms: i64,
    /// Total count of failed builds observed.
    pub build_failures_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let build_steps_total = IntCounterVec::new(
            Opts::new(
                "build_steps_total",
                "Bootstrap build steps executed by status",
            ),
            &["step", "status"],
        )?;
        let layer_cache_total = IntCounterVec::new(
            Opts::new("layer_cache_total", "Layer cache lookups by outcome"),
            &["outcome"],
        )?;
        let events_emitted_total = IntCounterVec::new(
            Opts::new("events_emitted_total", "Domain events emitted by type"),
            &["type"],
        )?;
        let container_exits_total = IntCounterVec::new(
            Opts::new("container_exits_total", "Container exits by outcome"),
            &["outcome"],
        )?;
        let containers_running = IntGauge::with_opts(Opts::new(
            "containers_running",
            "Number of running containers",
        ))?;
        let build_duration_ms = IntGauge::with_opts(Opts::new(
            "build_duration_ms",
            "Duration of the most recent build (ms)",
        ))?;
        let build_failures_total =
            IntCounter::with_opts(Opts::new("build_failures_total", "Failed builds"))?;

        registry.register(Box::new(build_steps_total.clone()))?;
        registry.register(Box::new(layer_cache_total.clone()))?;
        registry.register(Box::new(events_emitted_total.clone()))?;
        registry.register(Box::new(container_exits_total.clone()))?;
        registry.register(Box::new(containers_running.clone()))?;
        registry.register(Box::new(build_duration_ms.clone()))?;
        registry.register(Box::new(build_failures_total.clone()))?;

        Ok(Self {
            inner: std::sync::Arc::new(MetricsInner {
                registry,
                build_steps_total,
                layer_cache_total,
                events_emitted_total,
                container_exits_total,
                containers_running,
                build_duration_ms,
                build_failures_total,
            }),
        })
    }

    /// Increment the build step counter for the given step and status.
    pub fn inc_build_step(&self, step: &str, status: &str) {
        self.inner
            .build_steps_total
            .with_label_values(&[step, status])
            .inc();
    }

    /// Increment the layer cache counter (`hit` or `miss`).
    pub fn inc_layer_cache(&self, outcome: &str) {
        self.inner
            .layer_cache_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Increment the emitted event counter for the specific event type.
    pub fn inc_event(&self, event_type: &str) {
        self.inner
            .events_emitted_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Increment the container exit counter (`clean` or `failed`).
    pub fn inc_container_exit(&self, outcome: &str) {
        self.inner
            .container_exits_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Set the running container gauge.
    pub fn set_containers_running(&self, count: i64) {
        self.inner.containers_running.set(count);
    }

    /// Record the duration of the most recent build.
    pub fn observe_build_duration(&self, duration: Duration) {
        self.inner
            .build_duration_ms
            .set(Self::duration_to_ms(duration));
    }

    /// Increment the failed build counter.
    pub fn inc_build_failure(&self) {
        self.inner.build_failures_total.inc();
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("failed to encode Prometheus metrics")?;
        String::from_utf8(buffer).context("metrics output was not valid UTF-8")
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            containers_running: self.inner.containers_running.get(),
            build_duration_ms: self.inner.build_duration_ms.get(),
            build_failures_total: self.inner.build_failures_total.get(),
        }
    }

    /// Convert a duration to milliseconds saturating at `i64::MAX`.
    pub(crate) fn duration_to_ms(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn duration_to_ms_saturates_on_large_values() {
        let duration = Duration::from_secs(u64::MAX / 2);
        assert_eq!(Metrics::duration_to_ms(duration), i64::MAX);
    }

    #[test]
    fn metrics_snapshot_reflects_updates() -> Result<()> {
        let metrics = Metrics::new()?;
        metrics.inc_build_step("install_dependencies", "completed");
        metrics.inc_layer_cache("hit");
        metrics.inc_event("build_started");
        metrics.inc_container_exit("clean");
        metrics.set_containers_running(1);
        metrics.observe_build_duration(Duration::from_millis(420));
        metrics.inc_build_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.containers_running, 1);
        assert_eq!(snapshot.build_duration_ms, 420);
        assert_eq!(snapshot.build_failures_total, 1);

        let rendered = metrics.render()?;
        assert!(rendered.contains("build_steps_total"));
        assert!(rendered.contains(r#"layer_cache_total{outcome="hit"} 1"#));
        assert!(rendered.contains("containers_running"));
        Ok(())
    }
}
