// src/bin/feedback_worker.rs
//
// Runs the two consumers that close the loop: stage feedback (progress
// counting + status transitions) and the dead-letter queue (terminal
// failures). Both write document status through the same state manager, so
// snapshots always travel the status queue toward the gateway.

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use ReceiptFlow::config::{feedback::Args, load_settings};
use ReceiptFlow::documents::{DocumentStateManager, PgDocumentRepository};
use ReceiptFlow::error::{PipelineError, Result};
use ReceiptFlow::messaging::{connect_rabbitmq, run_consumer, setup_stage_channels};
use ReceiptFlow::processing::feedback::{DeadLetterConsumer, FeedbackConsumer};
use ReceiptFlow::processing::{
    AmqpBroadcaster, FeedbackDispatcher, InMemoryStateStore, ProcessingStateStore, RedisStateStore,
    ResilientStateStore,
};
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

    info!("Feedback worker starting.");
    info!(
        "Consuming feedback from '{}' and dead letters from '{}' @ {}",
        args.feedback_queue, args.dead_letter_queue, args.amqp_addr
    );
    info!("Prefetch count: {}", args.prefetch_count);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&args.database_url)
        .await?;

    let conn = connect_rabbitmq(&args.amqp_addr).await.map_err(|e| {
        PipelineError::QueueError(format!("Feedback worker failed to connect: {}", e))
    })?;
    let (status_channel, feedback_consumer) = setup_stage_channels(
        &conn,
        &args.feedback_queue,
        &[&args.status_queue],
        args.prefetch_count,
        "feedback",
    )
    .await?;
    let (_, dead_letter_consumer) = setup_stage_channels(
        &conn,
        &args.dead_letter_queue,
        &[],
        args.prefetch_count,
        "dead_letter",
    )
    .await?;

    let fallback = Arc::new(InMemoryStateStore::new(settings.state_store.ttl()));
    let state_store: Arc<dyn ProcessingStateStore> =
        match RedisStateStore::connect(&args.redis_url, settings.state_store.ttl()).await {
            Ok(redis) => Arc::new(ResilientStateStore::new(
                Arc::new(redis),
                fallback,
                &settings.state_store,
            )),
            Err(e) => {
                // Counters kept in-process are lost on restart; acceptable
                // until Redis comes back and the worker is restarted.
                warn!(error = %e, "Redis unreachable at startup; using in-process counters only");
                fallback
            }
        };

    let state_manager = Arc::new(DocumentStateManager::new(
        Arc::new(PgDocumentRepository::new(pool)),
        Arc::new(AmqpBroadcaster::new(status_channel, args.status_queue)),
    ));

    let dispatcher = Arc::new(FeedbackDispatcher::standard(
        state_manager.clone(),
        state_store.clone(),
    ));

    let feedback = run_consumer(feedback_consumer, Arc::new(FeedbackConsumer { dispatcher }));
    let dead_letters = run_consumer(
        dead_letter_consumer,
        Arc::new(DeadLetterConsumer {
            state_manager,
            state_store,
        }),
    );
    tokio::try_join!(feedback, dead_letters)?;

    Ok(())
}
