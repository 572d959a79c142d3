use tracing::trace;

// Lightweight metrics helpers layered on tracing so demo builds stay lean;
// the Prometheus recorder in main.rs picks up the request counters.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "pampero.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "pampero.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn orders_aggregated(count: usize) {
    trace!(
        target = "pampero.metrics",
        count = count as u64,
        "orders_aggregated"
    );
}
