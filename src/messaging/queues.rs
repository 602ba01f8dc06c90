// src/messaging/queues.rs

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer, Result as LapinResult,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::error::{PipelineError, Result};

// Helper function to connect to RabbitMQ with retry (already here)
pub async fn connect_rabbitmq(addr: &str) -> LapinResult<Connection> {
    let options = ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio);

    let mut attempts = 0;
    loop {
        match Connection::connect(addr, options.clone()).await {
            Ok(conn) => {
                info!("Successfully connected to RabbitMQ at {}", addr);
                return Ok(conn);
            }
            Err(e) => {
                attempts += 1;
                error!(
                    attempt = attempts,
                    error = %e,
                    "Failed to connect to RabbitMQ. Retrying in 5 seconds..."
                );
                if attempts >= 5 {
                    return Err(e);
                }
                sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Declares one consume queue plus every queue the component publishes to,
/// sets QoS and starts the consumer. All queues are durable; payloads are
/// JSON published with delivery_mode 2 so work survives broker restarts.
pub async fn setup_stage_channels(
    conn: &Connection,
    consume_queue: &str,
    publish_queues: &[&str],
    prefetch_count: u16,
    component: &str,
) -> Result<(Channel, Consumer)> {
    let consume_channel = conn.create_channel().await.map_err(|e| {
        PipelineError::QueueError(format!(
            "{} failed to create consume channel: {}",
            component, e
        ))
    })?;
    let publish_channel = conn.create_channel().await.map_err(|e| {
        PipelineError::QueueError(format!(
            "{} failed to create publish channel: {}",
            component, e
        ))
    })?;

    consume_channel
        .queue_declare(
            consume_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            PipelineError::QueueError(format!(
                "{} failed to declare queue '{}': {}",
                component, consume_queue, e
            ))
        })?;

    for queue in publish_queues {
        publish_channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                PipelineError::QueueError(format!(
                    "{} failed to declare queue '{}': {}",
                    component, queue, e
                ))
            })?;
    }

    consume_channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|e| PipelineError::QueueError(format!("Failed to set QoS: {}", e)))?;

    let consumer_tag = format!(
        "{}-{}-{}",
        component,
        std::process::id(),
        chrono::Utc::now().timestamp()
    );
    let consumer = consume_channel
        .basic_consume(
            consume_queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok((publish_channel, consumer))
}

/// Publishes a message as persistent JSON and waits for the broker confirm.
pub async fn publish_json<T: Serialize>(channel: &Channel, queue: &str, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            &payload,
            AMQPProperties::default().with_delivery_mode(2),
        )
        .await?
        .await?;
    Ok(())
}

/// One consumer group member. Implementations must swallow their own errors:
/// a bad message is logged and dropped, never allowed to kill the loop, since
/// that would stall every document sharing the consumer group.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, payload: &[u8]);
}

/// Drives a consumer stream, spawning one task per delivery and acking after
/// the handler returns. Mirrors the worker loop shape: receive, spawn, ack.
pub async fn run_consumer(mut consumer: Consumer, handler: Arc<dyn MessageHandler>) -> Result<()> {
    info!(handler = handler.name(), "Started consuming. Waiting for messages...");

    while let Some(delivery_result) = consumer.next().await {
        match delivery_result {
            Ok(delivery) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    process_delivery(delivery, handler).await;
                });
            }
            Err(e) => {
                error!(error = %e, "Error receiving delivery from consumer stream");
            }
        }
    }

    info!(handler = handler.name(), "Consumer stream ended.");
    Ok(())
}

async fn process_delivery(delivery: Delivery, handler: Arc<dyn MessageHandler>) {
    handler.handle(&delivery.data).await;

    if let Err(ack_err) = delivery.ack(BasicAckOptions::default()).await {
        error!(error = %ack_err, handler = handler.name(), "Failed to ack message");
    }
}
