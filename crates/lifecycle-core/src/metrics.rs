//! Lifecycle metrics.
//!
//! Counters and histograms for jobs, events and the control plane. Recording
//! is a no-op until the binary installs a recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Jobs finished, labelled by job and outcome.
pub const JOBS_TOTAL: &str = "lifecycle_jobs_total";

/// Job wall-clock duration.
pub const JOB_DURATION: &str = "lifecycle_job_duration_seconds";

/// Step retries after transient failures.
pub const STEP_RETRIES: &str = "lifecycle_step_retries_total";

/// Events published, labelled by event name.
pub const EVENTS_PUBLISHED: &str = "lifecycle_events_published_total";

/// Events rejected at the publish boundary.
pub const EVENTS_REJECTED: &str = "lifecycle_events_rejected_total";

/// Registrations republished by the reconciliation sweep.
pub const RECONCILED: &str = "lifecycle_reconciled_total";

/// Registers metric descriptions.
///
/// Call once at startup after installing the recorder.
pub fn register_metrics() {
    describe_counter!(JOBS_TOTAL, "Lifecycle jobs finished");
    describe_histogram!(JOB_DURATION, "Lifecycle job duration in seconds");
    describe_counter!(STEP_RETRIES, "Job step retries after transient failures");
    describe_counter!(EVENTS_PUBLISHED, "Lifecycle events published");
    describe_counter!(EVENTS_REJECTED, "Lifecycle events rejected at publish");
    describe_counter!(RECONCILED, "Registrations republished by reconciliation");
}

/// Records a finished job.
pub fn record_job(job: &'static str, outcome: &'static str, duration_secs: f64) {
    counter!(JOBS_TOTAL, "job" => job, "outcome" => outcome).increment(1);
    histogram!(JOB_DURATION, "job" => job).record(duration_secs);
}

/// Records a step retry.
pub fn record_retry(step: &'static str) {
    counter!(STEP_RETRIES, "step" => step).increment(1);
}

/// Records a published event.
pub fn record_published(event: &'static str) {
    counter!(EVENTS_PUBLISHED, "event" => event).increment(1);
}

/// Records a rejected event.
pub fn record_rejected(event: &'static str) {
    counter!(EVENTS_REJECTED, "event" => event).increment(1);
}

/// Records registrations republished by one sweep.
pub fn record_reconciled(count: usize) {
    counter!(RECONCILED).increment(count as u64);
}
