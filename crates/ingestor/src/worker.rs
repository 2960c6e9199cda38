use broker::{Acker, Consumer, ConsumerConfig, Delivery};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::metrics;
use crate::pipeline::{self, Outcome};
use crate::router::{self, AckDecision};

/// Pending entries idle this long are reclaimed from their consumer.
const RECLAIM_IDLE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub stream: String,
    pub group: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub block: Duration,
    pub parallel_jobs: usize,
    pub shutdown_grace: Duration,
}

/// The consumer loop: read batches sized to the free worker slots, hand
/// each event to its own task, ack according to the router's decision.
/// Blocks until `shutdown` fires, then drains in-flight events within
/// the grace period.
pub async fn run(
    ctx: Arc<AppContext>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut consumer = Consumer::new(
        ctx.broker_conn.clone(),
        ConsumerConfig {
            stream: config.stream.clone(),
            group: config.group.clone(),
            consumer_name: config.consumer_name.clone(),
            batch_size: config.batch_size,
            block: config.block,
            reclaim_idle: RECLAIM_IDLE,
        },
    )
    .await?;
    let acker = consumer.acker();

    let slots = Arc::new(Semaphore::new(config.parallel_jobs));
    let mut tasks: JoinSet<()> = JoinSet::new();
    // Cancelled only after the grace period, aborting stragglers at
    // their next suspension point.
    let hard_stop = CancellationToken::new();

    tracing::info!(
        consumer = %config.consumer_name,
        parallel_jobs = config.parallel_jobs,
        "ingestion worker started"
    );

    loop {
        while tasks.try_join_next().is_some() {}

        // Backpressure: no free slot, no new reads.
        let free = slots.available_permits();
        if free == 0 {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => drop(permit),
            }
            continue;
        }

        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = consumer.read_batch(free) => match read {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::error!(error = %err, "stream read failed; backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            },
        };

        for delivery in batch {
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .expect("slot semaphore is never closed");
            metrics::MESSAGES_TOTAL.inc();
            if delivery.reclaimed {
                metrics::RECLAIMED_TOTAL.inc();
            }

            let ctx = ctx.clone();
            let acker = acker.clone();
            let cancel = hard_stop.clone();
            tasks.spawn(async move {
                let _permit = permit;
                handle_delivery(ctx, acker, delivery, cancel).await;
            });
        }
    }

    tracing::info!(
        in_flight = tasks.len(),
        grace_secs = config.shutdown_grace.as_secs(),
        "draining in-flight events"
    );
    if tokio::time::timeout(config.shutdown_grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        tracing::warn!("grace period elapsed; cancelling remaining events");
        hard_stop.cancel();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

/// One event from receipt to ack decision. Cancellation drops the
/// pipeline future at its next suspension point: temp files are removed
/// by their guards, the entry stays unacked, and the job row keeps its
/// non-terminal state for the re-delivered attempt.
async fn handle_delivery(
    ctx: Arc<AppContext>,
    acker: Acker,
    delivery: Delivery,
    cancel: CancellationToken,
) {
    let received_at = Instant::now();
    metrics::MESSAGES_INFLIGHT.inc();

    let attempt_count = pipeline::attempt_count(
        delivery
            .fields
            .get("retry_count")
            .and_then(|raw| raw.parse().ok()),
        delivery.delivery_count,
    );

    let result = tokio::select! {
        _ = cancel.cancelled() => None,
        result = pipeline::process_event(&ctx, &delivery.fields, attempt_count) => Some(result),
    };

    let ack = match result {
        None => {
            tracing::info!(
                stream_id = %delivery.stream_id,
                "event cancelled mid-flight; releasing for re-delivery"
            );
            false
        }
        Some(Ok(Outcome::Completed(stats))) => {
            metrics::PROCESSING_DURATION_SECONDS.observe(received_at.elapsed().as_secs_f64());
            tracing::info!(
                external_event_id = %stats.envelope.external_event_id,
                trace_id = %stats.envelope.trace_id,
                conversation_id = %stats.conversation_id,
                segments = stats.segments,
                chunks = stats.chunks,
                nlp_source = %stats.nlp_source,
                nlp_partial = stats.nlp_partial,
                "event completed"
            );
            true
        }
        Some(Ok(Outcome::Duplicate { envelope })) => {
            metrics::DUPLICATES_TOTAL.inc();
            tracing::info!(
                external_event_id = %envelope.external_event_id,
                trace_id = %envelope.trace_id,
                "duplicate event acked without effect"
            );
            true
        }
        Some(Err(failure)) => {
            metrics::PROCESSING_DURATION_SECONDS.observe(received_at.elapsed().as_secs_f64());
            router::route_failure(&ctx, &delivery.fields, failure, attempt_count).await
                == AckDecision::Ack
        }
    };

    if ack {
        match acker.ack(&delivery.stream_id).await {
            Ok(()) => metrics::ACK_LATENCY_SECONDS.observe(received_at.elapsed().as_secs_f64()),
            Err(err) => {
                // The entry will be re-delivered; duplicate detection
                // keeps the replay harmless.
                tracing::error!(
                    stream_id = %delivery.stream_id,
                    error = %err,
                    "ack failed; event will re-deliver as a duplicate"
                );
            }
        }
    }

    metrics::MESSAGES_INFLIGHT.dec();
}
