// src/bin/extraction_worker.rs

use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use ReceiptFlow::clients::{CircuitBreaker, HttpTextExtractor, LocalBlobStore};
use ReceiptFlow::config::{extraction::Args, load_settings};
use ReceiptFlow::error::{PipelineError, Result};
use ReceiptFlow::messaging::{connect_rabbitmq, run_consumer, setup_stage_channels, RetryPolicy};
use ReceiptFlow::stages::ExtractionStage;
use ReceiptFlow::utils::metrics_server::spawn_metrics_server;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(filter).init();

    let settings = load_settings(&args.settings)?;
    if args.validate_config {
        info!("Settings file '{}' is valid.", args.settings.display());
        return Ok(());
    }

    spawn_metrics_server(args.metrics_port);

    info!("Extraction worker starting.");
    info!(
        "Consuming from '{}', publishing to '{}' @ {}",
        args.task_queue, args.next_queue, args.amqp_addr
    );
    info!("Prefetch count: {}", args.prefetch_count);

    let conn = connect_rabbitmq(&args.amqp_addr).await.map_err(|e| {
        PipelineError::QueueError(format!("Extraction worker failed to connect: {}", e))
    })?;
    let (publish_channel, consumer) = setup_stage_channels(
        &conn,
        &args.task_queue,
        &[
            &args.next_queue,
            &args.feedback_queue,
            &args.dead_letter_queue,
        ],
        args.prefetch_count,
        "extraction",
    )
    .await?;

    let stage = ExtractionStage::new(
        Arc::new(LocalBlobStore::new(args.blob_root)),
        Arc::new(HttpTextExtractor::new(
            args.extractor_url,
            settings.timeouts.http(),
        )?),
        CircuitBreaker::from_settings("blob_store", &settings.circuit_breaker),
        CircuitBreaker::from_settings("text_extractor", &settings.circuit_breaker),
        RetryPolicy::from_settings(&settings.retry),
        publish_channel,
        args.next_queue,
        args.feedback_queue,
        args.dead_letter_queue,
    );

    run_consumer(consumer, Arc::new(stage)).await
}
