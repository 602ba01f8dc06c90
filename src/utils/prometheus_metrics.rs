// src/utils/prometheus_metrics.rs

use once_cell::sync::Lazy;
use prometheus::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};

// Metrics from the gateway
pub static DOCUMENTS_UPLOADED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gateway_documents_uploaded_total",
        "Total number of documents accepted for processing."
    )
    .expect("Failed to register DOCUMENTS_UPLOADED_TOTAL counter")
});

pub static UPLOAD_ERRORS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gateway_upload_errors_total",
        "Total number of uploads rejected or failed before enqueueing."
    )
    .expect("Failed to register UPLOAD_ERRORS_TOTAL counter")
});

pub static STATUS_UPDATES_RELAYED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "gateway_status_updates_relayed_total",
        "Total number of status snapshots relayed to live channels."
    )
    .expect("Failed to register STATUS_UPDATES_RELAYED_TOTAL counter")
});

pub static CONNECTED_STATUS_SUBSCRIBERS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "gateway_connected_status_subscribers",
        "Number of currently connected live status subscribers."
    )
    .expect("Failed to register CONNECTED_STATUS_SUBSCRIBERS gauge")
});

// Metrics shared by the stage workers
pub static STAGE_TASKS_PROCESSED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "stage_tasks_processed_total",
        "Total number of stage tasks that completed successfully."
    )
    .expect("Failed to register STAGE_TASKS_PROCESSED_TOTAL counter")
});

pub static STAGE_TASKS_FAILED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "stage_tasks_failed_total",
        "Total number of stage tasks that ended in FAILED feedback."
    )
    .expect("Failed to register STAGE_TASKS_FAILED_TOTAL counter")
});

pub static TASK_DESERIALIZATION_ERRORS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "stage_task_deserialization_errors_total",
        "Total number of errors deserializing incoming task messages."
    )
    .expect("Failed to register TASK_DESERIALIZATION_ERRORS_TOTAL counter")
});

pub static TASK_PROCESSING_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "stage_task_processing_duration_seconds",
        "Histogram of task processing durations (from message receipt to outcome published/error)."
    )
    .expect("Failed to register TASK_PROCESSING_DURATION_SECONDS histogram")
});

pub static ACTIVE_PROCESSING_TASKS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "stage_active_processing_tasks",
        "Number of tasks currently being processed concurrently."
    )
    .expect("Failed to register ACTIVE_PROCESSING_TASKS gauge")
});

pub static FEEDBACK_PUBLISH_ERRORS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "stage_feedback_publish_errors_total",
        "Total number of errors publishing feedback messages."
    )
    .expect("Failed to register FEEDBACK_PUBLISH_ERRORS_TOTAL counter")
});

pub static CIRCUIT_BREAKER_OPEN_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "stage_circuit_breaker_open_total",
        "Total number of calls short-circuited by an open breaker."
    )
    .expect("Failed to register CIRCUIT_BREAKER_OPEN_TOTAL counter")
});

// Metrics from the retry / dead-letter layer
pub static RETRY_ATTEMPTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "retry_attempts_total",
        "Total number of failed attempts that were retried or exhausted."
    )
    .expect("Failed to register RETRY_ATTEMPTS_TOTAL counter")
});

pub static RETRY_EXHAUSTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "retry_exhausted_total",
        "Total number of messages that exhausted their retries."
    )
    .expect("Failed to register RETRY_EXHAUSTED_TOTAL counter")
});

pub static DEAD_LETTERS_CONSUMED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "dead_letters_consumed_total",
        "Total number of dead-letter messages that terminally failed a document."
    )
    .expect("Failed to register DEAD_LETTERS_CONSUMED_TOTAL counter")
});

// Metrics from the feedback dispatcher
pub static FEEDBACK_MESSAGES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "feedback_messages_total",
        "Total number of feedback messages dispatched to a handler."
    )
    .expect("Failed to register FEEDBACK_MESSAGES_TOTAL counter")
});

pub static FEEDBACK_DROPPED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "feedback_dropped_total",
        "Total number of feedback messages dropped (unknown stage, unknown document, late increment)."
    )
    .expect("Failed to register FEEDBACK_DROPPED_TOTAL counter")
});

pub static DOCUMENTS_PROCESSED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "documents_processed_total",
        "Total number of documents that reached PROCESSED."
    )
    .expect("Failed to register DOCUMENTS_PROCESSED_TOTAL counter")
});

pub static DOCUMENTS_FAILED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "documents_failed_total",
        "Total number of documents that reached FAILED."
    )
    .expect("Failed to register DOCUMENTS_FAILED_TOTAL counter")
});

// Metrics from the processing state store
pub static STATE_STORE_FALLBACK_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "state_store_fallback_total",
        "Total number of operations served by the in-process fallback map."
    )
    .expect("Failed to register STATE_STORE_FALLBACK_TOTAL counter")
});

pub static STATUS_BROADCAST_ERRORS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "status_broadcast_errors_total",
        "Total number of status snapshots that could not be published."
    )
    .expect("Failed to register STATUS_BROADCAST_ERRORS_TOTAL counter")
});
