/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::rollouts::k8s::rollout::RolloutPhase;

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static ROLLOUT_PHASE: OnceLock<IntGaugeVec> = OnceLock::new();
static WORKQUEUE_DEPTH: OnceLock<IntGaugeVec> = OnceLock::new();
static WORKQUEUE_RETRIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static INFORMER_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("rollouts".to_string()), None)
            .expect("failed to initialise rollouts metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register rollouts metric collector");
    collector
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn controller_reconcile_duration() -> &'static HistogramVec {
    CONTROLLER_RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "controller_reconcile_duration_seconds",
            "Latency distribution of a single reconcile call",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]);
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("failed to build controller reconcile histogram");
        register_collector(histogram)
    })
}

fn rollout_phase() -> &'static IntGaugeVec {
    ROLLOUT_PHASE.get_or_init(|| {
        let opts = Opts::new(
            "rollout_phase",
            "Current phase of each Rollout, 1 for the active phase",
        );
        let gauge = IntGaugeVec::new(opts, &["namespace", "rollout", "phase"])
            .expect("failed to build rollout phase gauge");
        register_collector(gauge)
    })
}

fn workqueue_depth() -> &'static IntGaugeVec {
    WORKQUEUE_DEPTH.get_or_init(|| {
        let opts = Opts::new("depth", "Items waiting in a work queue").subsystem("workqueue");
        let gauge =
            IntGaugeVec::new(opts, &["queue"]).expect("failed to build workqueue depth gauge");
        register_collector(gauge)
    })
}

fn workqueue_retries_total() -> &'static IntCounterVec {
    WORKQUEUE_RETRIES_TOTAL.get_or_init(|| {
        let opts = Opts::new("retries_total", "Rate limited requeues per work queue")
            .subsystem("workqueue");
        let counter = IntCounterVec::new(opts, &["queue"])
            .expect("failed to build workqueue retries counter");
        register_collector(counter)
    })
}

fn informer_events_total() -> &'static IntCounterVec {
    INFORMER_EVENTS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "events_total",
            "Cache events delivered by informers grouped by kind and event type",
        )
        .subsystem("informer");
        let counter = IntCounterVec::new(opts, &["kind", "event"])
            .expect("failed to build informer events counter");
        register_collector(counter)
    })
}

#[derive(Copy, Clone, Debug)]
pub enum ControllerReconcileResult {
    Success,
    Error,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Error => "error",
        }
    }
}

pub fn record_controller_reconcile(controller: &str, result: ControllerReconcileResult) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
}

pub fn observe_reconcile_duration(controller: &str, elapsed: Duration) {
    controller_reconcile_duration()
        .with_label_values(&[controller])
        .observe(elapsed.as_secs_f64());
}

/// Sets the gauge of the Rollout's current phase to 1 and every other phase to 0.
pub fn record_rollout_phase(namespace: &str, rollout: &str, phase: RolloutPhase) {
    let gauge = rollout_phase();
    for candidate in RolloutPhase::ALL {
        let value = if candidate == phase { 1 } else { 0 };
        gauge
            .with_label_values(&[namespace, rollout, candidate.as_str()])
            .set(value);
    }
}

/// Drops the phase series of a deleted Rollout.
pub fn clear_rollout_phase(namespace: &str, rollout: &str) {
    let gauge = rollout_phase();
    for candidate in RolloutPhase::ALL {
        let _ = gauge.remove_label_values(&[namespace, rollout, candidate.as_str()]);
    }
}

pub fn set_workqueue_depth(queue: &str, depth: usize) {
    workqueue_depth()
        .with_label_values(&[queue])
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn record_workqueue_retry(queue: &str) {
    workqueue_retries_total().with_label_values(&[queue]).inc();
}

pub fn record_informer_event(kind: &str, event: &str) {
    informer_events_total()
        .with_label_values(&[kind, event])
        .inc();
}

/// Encodes all registered metrics using the Prometheus text exposition
/// format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_outcomes_are_counted() {
        let success = controller_reconciles_total().with_label_values(&["metrics-test", "success"]);
        let before = success.get();
        record_controller_reconcile("metrics-test", ControllerReconcileResult::Success);
        record_controller_reconcile("metrics-test", ControllerReconcileResult::Error);
        assert_eq!(success.get(), before + 1);

        observe_reconcile_duration("metrics-test", Duration::from_millis(3));
        let body = gather().expect("metrics encoded");
        let text = String::from_utf8(body).expect("utf8");
        assert!(text.contains("rollouts_controller_reconciles_total"));
        assert!(text.contains("result=\"error\""));
        assert!(text.contains("rollouts_controller_reconcile_duration_seconds_sum"));
    }

    #[test]
    fn phase_gauge_marks_only_current_phase() {
        record_rollout_phase("metrics-ns", "web", RolloutPhase::Progressing);
        record_rollout_phase("metrics-ns", "web", RolloutPhase::Healthy);

        let gauge = rollout_phase();
        assert_eq!(
            gauge.with_label_values(&["metrics-ns", "web", "Healthy"]).get(),
            1
        );
        assert_eq!(
            gauge
                .with_label_values(&["metrics-ns", "web", "Progressing"])
                .get(),
            0
        );

        clear_rollout_phase("metrics-ns", "web");
        let text = String::from_utf8(gather().expect("metrics encoded")).expect("utf8");
        assert!(!text.contains("namespace=\"metrics-ns\""));
    }

    #[test]
    fn workqueue_metrics_update() {
        set_workqueue_depth("metrics-queue", 4);
        record_workqueue_retry("metrics-queue");
        record_informer_event("MetricsKind", "added");

        let text = String::from_utf8(gather().expect("metrics encoded")).expect("utf8");
        assert!(text.contains("rollouts_workqueue_depth{queue=\"metrics-queue\"} 4"));
        assert!(text.contains("rollouts_workqueue_retries_total{queue=\"metrics-queue\"}"));
        assert!(text.contains("rollouts_informer_events_total"));
    }
}
