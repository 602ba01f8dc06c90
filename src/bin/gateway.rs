// src/bin/gateway.rs

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use ReceiptFlow::clients::LocalBlobStore;
use ReceiptFlow::config::{gateway::Args, load_settings};
use ReceiptFlow::documents::{DocumentStateManager, PgDocumentRepository};
use ReceiptFlow::error::{PipelineError, Result};
use ReceiptFlow::messaging::{connect_rabbitmq, run_consumer, setup_stage_channels};
use ReceiptFlow::processing::{ChannelBroadcaster, StatusBroadcaster};
use ReceiptFlow::server::{run_server, AppState, StatusRelay};

// The relay only fans snapshots into in-memory channels; a deep prefetch
// keeps it from becoming the pipeline's bottleneck.
const STATUS_RELAY_PREFETCH: u16 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(filter).init();

    // The gateway has no tunables of its own yet, but a broken settings file
    // should fail here rather than in the workers.
    load_settings(&args.settings)?;
    if args.validate_config {
        info!("Settings file '{}' is valid.", args.settings.display());
        return Ok(());
    }

    info!("Gateway starting.");
    info!(
        "Publishing extraction tasks to '{}', consuming status from '{}' @ {}",
        args.extraction_queue, args.status_queue, args.amqp_addr
    );

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&args.database_url)
        .await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| PipelineError::ConfigError(format!("Failed to run migrations: {}", e)))?;

    let conn = connect_rabbitmq(&args.amqp_addr)
        .await
        .map_err(|e| PipelineError::QueueError(format!("Gateway failed to connect: {}", e)))?;
    let (publish_channel, status_consumer) = setup_stage_channels(
        &conn,
        &args.status_queue,
        &[&args.extraction_queue],
        STATUS_RELAY_PREFETCH,
        "gateway",
    )
    .await?;

    let broadcaster = Arc::new(ChannelBroadcaster::new());
    let state_manager = Arc::new(DocumentStateManager::new(
        Arc::new(PgDocumentRepository::new(pool)),
        broadcaster.clone() as Arc<dyn StatusBroadcaster>,
    ));

    let app_state = Arc::new(AppState {
        state_manager,
        broadcaster: broadcaster.clone(),
        blob_store: Arc::new(LocalBlobStore::new(args.blob_root)),
        publish_channel,
        extraction_queue: args.extraction_queue,
    });

    // Worker-side status snapshots arrive over the broker and are fanned into
    // this process's per-user channels.
    tokio::spawn(async move {
        if let Err(e) = run_consumer(status_consumer, Arc::new(StatusRelay { broadcaster })).await {
            error!(error = %e, "Status relay stopped");
        }
    });

    run_server(app_state, &args.listen_addr).await
}
