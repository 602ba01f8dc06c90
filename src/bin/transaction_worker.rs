// src/bin/transaction_worker.rs

use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use ReceiptFlow::clients::{CircuitBreaker, HttpTransactionGateway};
use ReceiptFlow::config::{load_settings, transaction::Args};
use ReceiptFlow::error::{PipelineError, Result};
use ReceiptFlow::messaging::{connect_rabbitmq, run_consumer, setup_stage_channels};
use ReceiptFlow::stages::TransactionStage;
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

    info!("Transaction worker starting.");
    info!(
        "Consuming from '{}', feedback to '{}' @ {}",
        args.task_queue, args.feedback_queue, args.amqp_addr
    );
    info!("Prefetch count: {}", args.prefetch_count);

    let conn = connect_rabbitmq(&args.amqp_addr).await.map_err(|e| {
        PipelineError::QueueError(format!("Transaction worker failed to connect: {}", e))
    })?;
    let (publish_channel, consumer) = setup_stage_channels(
        &conn,
        &args.task_queue,
        &[&args.feedback_queue],
        args.prefetch_count,
        "transaction",
    )
    .await?;

    let stage = TransactionStage::new(
        Arc::new(HttpTransactionGateway::new(
            args.transactions_url,
            settings.timeouts.http(),
        )?),
        CircuitBreaker::from_settings("transaction_gateway", &settings.circuit_breaker),
        publish_channel,
        args.feedback_queue,
    );

    run_consumer(consumer, Arc::new(stage)).await
}
