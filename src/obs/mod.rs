//! PII-safe metrics collector.
//!
//! Thin wrapper over the prometheus registry with a strict label policy:
//! every label value is sanitized to `[A-Za-z0-9_\-./]`, truncated at 64
//! characters, and empty values become the literal `unknown`. Cardinality
//! stays bounded because every label is either a closed set or a sanitized
//! identifier.
//!
//! Emission is gated by `AR_ENABLE_METRICS=1`; when disabled every helper is
//! a no-op and the registry still serves (empty) families for scraping.

pub mod assert_gate;
pub mod exporter;

use std::time::Instant;

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Latency buckets in milliseconds, tuned for model-backed steps. Alert and
/// SLO definitions depend on these exact bounds.
pub const STEP_LATENCY_BUCKETS_MS: [f64; 12] = [
    50.0, 100.0, 200.0, 400.0, 800.0, 1500.0, 3000.0, 5000.0, 8000.0, 12000.0, 20000.0, 40000.0,
];

const MAX_LABEL_LEN: usize = 64;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static FLOW_STARTED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "flow_started_total",
        "Flows started",
        &["flow_id", "persona", "exec_mode", "branch"],
    )
});

static FLOW_SUCCESS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "flow_success_total",
        "Flows succeeded",
        &["flow_id", "persona", "exec_mode", "branch"],
    )
});

static FLOW_FAIL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "flow_fail_total",
        "Flows failed",
        &["flow_id", "persona", "exec_mode", "branch", "reason"],
    )
});

static STEP_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new("step_latency_ms", "Step latency in milliseconds")
            .buckets(STEP_LATENCY_BUCKETS_MS.to_vec()),
        &["flow_id", "step_id", "persona", "model", "exec_mode"],
    )
    .expect("step_latency_ms definition");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("step_latency_ms registration");
    histogram
});

static STEP_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "step_retries_total",
        "Retries per step",
        &["flow_id", "step_id", "persona"],
    )
});

static TOKENS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "tokens_total",
        "Tokens used",
        &["direction", "model", "persona"],
    )
});

static INFLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("inflight_steps", "Steps currently running"),
        &["flow_id"],
    )
    .expect("inflight_steps definition");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("inflight_steps registration");
    gauge
});

fn counter(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|e| panic!("{name} definition: {e}"));
    REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|e| panic!("{name} registration: {e}"));
    counter
}

/// Force registration of every metric family so a scrape sees them even
/// before the first event.
pub fn init() {
    Lazy::force(&FLOW_STARTED);
    Lazy::force(&FLOW_SUCCESS);
    Lazy::force(&FLOW_FAIL);
    Lazy::force(&STEP_LATENCY_MS);
    Lazy::force(&STEP_RETRIES);
    Lazy::force(&TOKENS);
    Lazy::force(&INFLIGHT);
}

pub fn metrics_enabled() -> bool {
    std::env::var("AR_ENABLE_METRICS").as_deref() == Ok("1")
}

/// Sanitize a label value: disallowed characters become `_`, output is
/// truncated at 64 characters, and empty input becomes `unknown`.
pub fn sanitize(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .take(MAX_LABEL_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}

pub fn flow_start(flow_id: &str, persona: &str, exec_mode: &str, branch: &str) {
    if !metrics_enabled() {
        return;
    }
    FLOW_STARTED
        .with_label_values(&[
            &sanitize(flow_id),
            &sanitize(persona),
            &sanitize(exec_mode),
            &sanitize(branch),
        ])
        .inc();
}

pub fn flow_end(
    flow_id: &str,
    persona: &str,
    exec_mode: &str,
    branch: &str,
    success: bool,
    reason: &str,
) {
    if !metrics_enabled() {
        return;
    }
    if success {
        FLOW_SUCCESS
            .with_label_values(&[
                &sanitize(flow_id),
                &sanitize(persona),
                &sanitize(exec_mode),
                &sanitize(branch),
            ])
            .inc();
    } else {
        FLOW_FAIL
            .with_label_values(&[
                &sanitize(flow_id),
                &sanitize(persona),
                &sanitize(exec_mode),
                &sanitize(branch),
                &sanitize(reason),
            ])
            .inc();
    }
}

pub fn step_retry(flow_id: &str, step_id: &str, persona: &str) {
    if !metrics_enabled() {
        return;
    }
    STEP_RETRIES
        .with_label_values(&[&sanitize(flow_id), &sanitize(step_id), &sanitize(persona)])
        .inc();
}

pub fn add_tokens(direction: &str, model: &str, persona: &str, n: u64) {
    if !metrics_enabled() {
        return;
    }
    TOKENS
        .with_label_values(&[&sanitize(direction), &sanitize(model), &sanitize(persona)])
        .inc_by(n);
}

/// Scope guard that tracks one step attempt: increments `inflight_steps` on
/// creation and, on drop, observes the elapsed time in `step_latency_ms`
/// exactly once and decrements the gauge.
///
/// Enablement is captured at creation so the observe/dec pair always matches
/// the inc.
pub fn step_timer(
    flow_id: &str,
    step_id: &str,
    persona: &str,
    model: &str,
    exec_mode: &str,
) -> StepTimer {
    step_timer_gated(
        metrics_enabled(),
        flow_id,
        step_id,
        persona,
        model,
        exec_mode,
    )
}

fn step_timer_gated(
    enabled: bool,
    flow_id: &str,
    step_id: &str,
    persona: &str,
    model: &str,
    exec_mode: &str,
) -> StepTimer {
    if !enabled {
        return StepTimer {
            labels: None,
            started: Instant::now(),
        };
    }
    let labels = [
        sanitize(flow_id),
        sanitize(step_id),
        sanitize(persona),
        sanitize(model),
        sanitize(exec_mode),
    ];
    INFLIGHT.with_label_values(&[labels[0].as_str()]).inc();
    StepTimer {
        labels: Some(labels),
        started: Instant::now(),
    }
}

pub struct StepTimer {
    labels: Option<[String; 5]>,
    started: Instant,
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        let Some(labels) = self.labels.take() else {
            return;
        };
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        STEP_LATENCY_MS
            .with_label_values(&[
                labels[0].as_str(),
                labels[1].as_str(),
                labels[2].as_str(),
                labels[3].as_str(),
                labels[4].as_str(),
            ])
            .observe(elapsed_ms);
        INFLIGHT.with_label_values(&[labels[0].as_str()]).dec();
    }
}

/// Encode the registry in the Prometheus text exposition format.
pub fn gather_text() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
