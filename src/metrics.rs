use tracing::trace;

// Counters are emitted as trace events under `studio.metrics`; the Prometheus
// recorder installed in main only renders what is registered with it.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "studio.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "studio.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn enhancement_outcome(strategy: &str, status: &'static str) {
    trace!(
        target = "studio.metrics",
        strategy = strategy,
        status = status,
        "enhancement_outcome_inc"
    );
}

pub fn sessions_reaped(count: usize) {
    trace!(
        target = "studio.metrics",
        count = count as u64,
        "sessions_reaped_inc"
    );
}
