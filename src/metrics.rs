//! Metric name constants and registration.
//!
//! All instrumentation goes through the `metrics` facade; the Prometheus
//! exporter installed in `main` owns the scrape listener. Keeping the names
//! in one module prevents label drift between the pool, the pipeline and the
//! circuit breaker.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

pub const CIRCUIT_OPEN: &str = "browser_circuit_open";
pub const CIRCUIT_TRIPS_TOTAL: &str = "browser_circuit_trips_total";
pub const LAUNCHES_TOTAL: &str = "browser_launches_total";
pub const LAUNCH_FAILURES_TOTAL: &str = "browser_launch_failures_total";
pub const DISCONNECTS_TOTAL: &str = "browser_disconnects_total";
pub const RESTARTS_TOTAL: &str = "browser_restarts_total";

pub const EXTRACTIONS_TOTAL: &str = "extractions_total";
pub const EXTRACTION_DURATION_SECONDS: &str = "extraction_duration_seconds";
pub const QUEUE_DEPTH: &str = "extraction_queue_depth";
pub const ACTIVE_EXTRACTIONS: &str = "extractions_active";
pub const QUEUE_WAIT_SECONDS: &str = "extraction_queue_wait_seconds";
pub const CONTEXT_CREATION_SECONDS: &str = "extraction_context_creation_seconds";
pub const MANIFEST_DETECTION_SECONDS: &str = "extraction_manifest_detection_seconds";

pub fn describe() {
    describe_gauge!(CIRCUIT_OPEN, "Whether the browser launch circuit is open");
    describe_counter!(
        CIRCUIT_TRIPS_TOTAL,
        "Times the launch circuit breaker tripped open"
    );
    describe_counter!(LAUNCHES_TOTAL, "Browser launch attempts");
    describe_counter!(LAUNCH_FAILURES_TOTAL, "Browser launches that failed");
    describe_counter!(
        DISCONNECTS_TOTAL,
        "Unexpected disconnects of a live browser"
    );
    describe_counter!(
        RESTARTS_TOTAL,
        "Deliberate browser restarts, labelled by reason"
    );
    describe_counter!(
        EXTRACTIONS_TOTAL,
        "Completed extractions, labelled by status and error_type"
    );
    describe_histogram!(
        EXTRACTION_DURATION_SECONDS,
        Unit::Seconds,
        "End-to-end extraction duration, labelled by status"
    );
    describe_gauge!(QUEUE_DEPTH, "Submissions waiting for admission");
    describe_gauge!(ACTIVE_EXTRACTIONS, "Admitted extractions currently running");
    describe_histogram!(
        QUEUE_WAIT_SECONDS,
        Unit::Seconds,
        "Time between submission and admission"
    );
    describe_histogram!(
        CONTEXT_CREATION_SECONDS,
        Unit::Seconds,
        "Time to create a fresh browser context"
    );
    describe_histogram!(
        MANIFEST_DETECTION_SECONDS,
        Unit::Seconds,
        "Time between submission and the first manifest sighting"
    );
}
