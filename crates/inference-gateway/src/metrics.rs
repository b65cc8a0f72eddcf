use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder};
use lazy_static::lazy_static;
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static BACKEND_LOADS: OnceLock<IntCounterVec> = OnceLock::new();
static INFERENCE_CALLS: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_BACKENDS: OnceLock<IntGauge> = OnceLock::new();
static KIND_LOCK_WAIT: OnceLock<Histogram> = OnceLock::new();

pub fn init_metrics() {
    install(&BACKEND_LOADS, "backend_loads_total", || {
        IntCounterVec::new(
            prometheus::opts!("backend_loads_total", "Backend load attempts per kind"),
            &["kind", "status"],
        )
    });
    install(&INFERENCE_CALLS, "inference_calls_total", || {
        IntCounterVec::new(
            prometheus::opts!("inference_calls_total", "Backend inference calls per kind"),
            &["kind", "status"],
        )
    });
    install(&ACTIVE_BACKENDS, "active_backends", || {
        IntGauge::new("active_backends", "Backend handles currently registered")
    });
    install(&KIND_LOCK_WAIT, "kind_lock_wait_seconds", || {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "kind_lock_wait_seconds",
            "Time spent waiting for the per-kind inference lock",
        ))
    });
}

fn install<M, F>(cell: &OnceLock<M>, name: &str, build: F)
where
    M: Collector + Clone + 'static,
    F: FnOnce() -> prometheus::Result<M>,
{
    if cell.get().is_some() {
        return;
    }
    let metric = match build() {
        Ok(metric) => metric,
        Err(e) => {
            warn!("Failed creating metric {}: {}", name, e);
            return;
        }
    };
    if cell.set(metric.clone()).is_ok() {
        if let Err(e) = REGISTRY.register(Box::new(metric)) {
            warn!("Failed registering metric {}: {}", name, e);
        }
    }
}

pub fn inc_backend_load(kind: &str, status: &str) {
    if let Some(counter) = BACKEND_LOADS.get() {
        counter.with_label_values(&[kind, status]).inc();
    }
}

pub fn inc_inference(kind: &str, status: &str) {
    if let Some(counter) = INFERENCE_CALLS.get() {
        counter.with_label_values(&[kind, status]).inc();
    }
}

pub fn inc_active_backends() {
    if let Some(gauge) = ACTIVE_BACKENDS.get() {
        gauge.inc();
    }
}

pub fn dec_active_backends() {
    if let Some(gauge) = ACTIVE_BACKENDS.get() {
        gauge.dec();
    }
}

pub fn observe_kind_lock_wait(seconds: f64) {
    if let Some(histogram) = KIND_LOCK_WAIT.get() {
        histogram.observe(seconds);
    }
}

/// Prometheus text exposition of everything registered so far.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
