use tracing::trace;

// Counters are emitted as trace events; the Prometheus handle in main only
// renders the exporter's own registry.

pub fn inc_requests(route: &'static str) {
    trace!(target = "konnect.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "konnect.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn outcome(code: &str) {
    trace!(target = "konnect.metrics", outcome = code, "pipeline_outcomes_total_inc");
}
