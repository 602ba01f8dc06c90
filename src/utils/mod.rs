// Utils

pub mod metrics_server;
pub mod prometheus_metrics;
