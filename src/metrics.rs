// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics collection for the flag service.
//!
//! Tracks evaluation outcomes, usage queue health and admin activity.

use prometheus::core::Collector;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

use crate::error::AppError;
use crate::evaluator::EvaluationReason;

/// Metrics collector for the flag service
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,

    // Evaluation metrics
    pub evaluations: IntCounterVec,
    pub evaluation_reasons: IntCounterVec,
    pub dependency_cycles: IntCounter,
    pub malformed_variant_tables: IntCounter,
    pub lookup_failures: IntCounter,

    // Usage queue metrics
    pub usage_enqueued: IntCounter,
    pub usage_dropped: IntCounter,
    pub usage_written: IntCounter,
    pub usage_write_failures: IntCounter,

    // Admin metrics
    pub admin_mutations: IntCounterVec,
    pub flags_total: IntGauge,

    // Request metrics
    pub request_duration: Histogram,
}

fn metric_error(e: prometheus::Error) -> AppError {
    AppError::internal("Failed to create metric", e)
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> Result<C, AppError> {
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| AppError::internal("Failed to register metric", e))?;
    Ok(metric)
}

impl Metrics {
    pub fn new() -> Result<Self, AppError> {
        let registry = Registry::new();

        let evaluations = register(
            &registry,
            IntCounterVec::new(
                Opts::new("fleetflags_evaluations_total", "Flag evaluations by result"),
                &["result"],
            )
            .map_err(metric_error)?,
        )?;

        let evaluation_reasons = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "fleetflags_evaluation_reasons_total",
                    "Flag evaluations by deciding reason",
                ),
                &["reason"],
            )
            .map_err(metric_error)?,
        )?;

        let dependency_cycles = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "fleetflags_dependency_cycles_total",
                "Evaluations that hit a dependency cycle",
            ))
            .map_err(metric_error)?,
        )?;

        let malformed_variant_tables = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "fleetflags_malformed_variant_tables_total",
                "Evaluations that fell back to the default variant due to a bad variant table",
            ))
            .map_err(metric_error)?,
        )?;

        let lookup_failures = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "fleetflags_lookup_failures_total",
                "Evaluation requests answered disabled because the store was unavailable",
            ))
            .map_err(metric_error)?,
        )?;

        let usage_enqueued = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "fleetflags_usage_enqueued_total",
                "Usage events queued for the writer",
            ))
            .map_err(metric_error)?,
        )?;

        let usage_dropped = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "fleetflags_usage_dropped_total",
                "Usage events dropped because the queue was full or closed",
            ))
            .map_err(metric_error)?,
        )?;

        let usage_written = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "fleetflags_usage_written_total",
                "Usage events persisted by the writer",
            ))
            .map_err(metric_error)?,
        )?;

        let usage_write_failures = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "fleetflags_usage_write_failures_total",
                "Usage events the writer failed to persist",
            ))
            .map_err(metric_error)?,
        )?;

        let admin_mutations = register(
            &registry,
            IntCounterVec::new(
                Opts::new("fleetflags_admin_mutations_total", "Admin flag mutations by action"),
                &["action"],
            )
            .map_err(metric_error)?,
        )?;

        let flags_total = register(
            &registry,
            IntGauge::with_opts(Opts::new(
                "fleetflags_flags",
                "Number of flag definitions seen at the last listing",
            ))
            .map_err(metric_error)?,
        )?;

        let request_duration = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "fleetflags_request_duration_seconds",
                    "HTTP request duration in seconds",
                )
                .buckets(vec![
                    0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0,
                ]),
            )
            .map_err(metric_error)?,
        )?;

        Ok(Self {
            registry: Arc::new(registry),
            evaluations,
            evaluation_reasons,
            dependency_cycles,
            malformed_variant_tables,
            lookup_failures,
            usage_enqueued,
            usage_dropped,
            usage_written,
            usage_write_failures,
            admin_mutations,
            flags_total,
            request_duration,
        })
    }

    /// Record the outcome of one flag evaluation
    pub fn record_evaluation(&self, reason: EvaluationReason, malformed_variants: bool) {
        let result = if reason.is_enabled() { "enabled" } else { "disabled" };
        self.evaluations.with_label_values(&[result]).inc();
        self.evaluation_reasons
            .with_label_values(&[reason.as_str()])
            .inc();

        if reason == EvaluationReason::DependencyCycle {
            self.dependency_cycles.inc();
        }
        if malformed_variants {
            self.malformed_variant_tables.inc();
        }
    }

    pub fn record_lookup_failure(&self) {
        self.lookup_failures.inc();
    }

    pub fn record_usage_enqueued(&self) {
        self.usage_enqueued.inc();
    }

    pub fn record_usage_dropped(&self) {
        self.usage_dropped.inc();
    }

    pub fn record_usage_written(&self) {
        self.usage_written.inc();
    }

    pub fn record_usage_write_failure(&self) {
        self.usage_write_failures.inc();
    }

    pub fn record_admin_mutation(&self, action: &str) {
        self.admin_mutations.with_label_values(&[action]).inc();
    }

    pub fn update_flag_count(&self, count: usize) {
        self.flags_total.set(count as i64);
    }

    /// Observe request latency in seconds
    pub fn record_request_duration(&self, seconds: f64) {
        self.request_duration.observe(seconds);
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String, AppError> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| AppError::internal("Failed to encode metrics", e))?;

        String::from_utf8(buffer)
            .map_err(|e| AppError::internal("Failed to convert metrics to string", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_evaluation(EvaluationReason::Enabled, false);
        metrics.record_evaluation(EvaluationReason::DependencyCycle, false);
        metrics.record_evaluation(EvaluationReason::Enabled, true);

        assert_eq!(metrics.evaluations.with_label_values(&["enabled"]).get(), 2);
        assert_eq!(metrics.evaluations.with_label_values(&["disabled"]).get(), 1);
        assert_eq!(metrics.dependency_cycles.get(), 1);
        assert_eq!(metrics.malformed_variant_tables.get(), 1);
    }

    #[test]
    fn test_export_contains_registered_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.record_usage_enqueued();
        metrics.record_admin_mutation("create");

        let text = metrics.export().unwrap();
        assert!(text.contains("fleetflags_usage_enqueued_total 1"));
        assert!(text.contains("fleetflags_admin_mutations_total{action=\"create\"} 1"));
    }
}
