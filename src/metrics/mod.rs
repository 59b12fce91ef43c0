//! Prometheus metrics registration and export.
//!
//! All metrics are optional: recording helpers are no-ops until
//! [`init_metrics`] has run, so library consumers and tests pay nothing.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global registry for all gradeforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Submissions reaching a terminal state, labeled by status and template.
pub static SUBMISSIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Pipeline step duration in seconds, labeled by step name.
pub static STEP_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Sandbox environments currently leased out.
pub static SANDBOXES_LEASED: OnceLock<Gauge> = OnceLock::new();

/// Feedback generations that fell back to the degraded path.
pub static FEEDBACK_DEGRADED: OnceLock<IntCounter> = OnceLock::new();

/// Initializes and registers all metrics. Call once at startup.
///
/// # Errors
///
/// Returns a `prometheus::Error` on duplicate registration.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let submissions_total = CounterVec::new(
        Opts::new(
            "gradeforge_submissions_total",
            "Submissions reaching a terminal state",
        ),
        &["status", "template"],
    )?;

    let step_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "gradeforge_step_duration_seconds",
            "Pipeline step duration in seconds",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0]),
        &["step"],
    )?;

    let sandboxes_leased = Gauge::new(
        "gradeforge_sandboxes_leased",
        "Sandbox environments currently leased out",
    )?;

    let feedback_degraded = IntCounter::new(
        "gradeforge_feedback_degraded_total",
        "Feedback generations that fell back to the degraded path",
    )?;

    registry.register(Box::new(submissions_total.clone()))?;
    registry.register(Box::new(step_duration.clone()))?;
    registry.register(Box::new(sandboxes_leased.clone()))?;
    registry.register(Box::new(feedback_degraded.clone()))?;

    let _ = SUBMISSIONS_TOTAL.set(submissions_total);
    let _ = STEP_DURATION.set(step_duration);
    let _ = SANDBOXES_LEASED.set(sandboxes_leased);
    let _ = FEEDBACK_DEGRADED.set(feedback_degraded);
    let _ = REGISTRY.set(registry);

    Ok(())
}

/// Records a terminal submission.
pub fn observe_submission(status: &str, template: &str) {
    if let Some(counter) = SUBMISSIONS_TOTAL.get() {
        counter.with_label_values(&[status, template]).inc();
    }
}

/// Records one step's wall-clock duration.
pub fn observe_step(step: &str, seconds: f64) {
    if let Some(histogram) = STEP_DURATION.get() {
        histogram.with_label_values(&[step]).observe(seconds);
    }
}

/// Updates the leased-sandboxes gauge.
pub fn observe_pool(leased: usize) {
    if let Some(gauge) = SANDBOXES_LEASED.get() {
        gauge.set(leased as f64);
    }
}

/// Counts a degraded feedback generation.
pub fn inc_feedback_degraded() {
    if let Some(counter) = FEEDBACK_DEGRADED.get() {
        counter.inc();
    }
}

/// Renders all registered metrics in the Prometheus text format.
pub fn render() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
