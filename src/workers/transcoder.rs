use crate::modules::conversion::repository::TaskRepository;
use crate::modules::conversion::transcode::{FfmpegEngine, TranscodeAdapter};
use crate::state::AppState;
use crate::workers::admission::AdmissionGate;
use crate::workers::runner::{InboundMessage, JobRunner, Outcome, RunnerOptions, Settlement};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

#[async_trait]
impl InboundMessage for Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn settle(self, settlement: Settlement) -> anyhow::Result<()> {
        match settlement {
            Settlement::Ack => {
                self.acker
                    .ack(BasicAckOptions::default())
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to ack message: {}", e))?;
            }
            Settlement::Nack { requeue } => {
                self.acker
                    .nack(BasicNackOptions {
                        requeue,
                        ..BasicNackOptions::default()
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to nack message: {}", e))?;
            }
        }
        Ok(())
    }
}

fn build_runner(state: &AppState) -> Arc<JobRunner> {
    let config = &state.config;
    let engine = FfmpegEngine::new(config.ffmpeg_bin.clone()).with_timeout(config.transcode_timeout);

    Arc::new(JobRunner::new(
        AdmissionGate::new(config.max_concurrent_jobs),
        TranscodeAdapter::new(Arc::new(engine)),
        Arc::new(TaskRepository::new(state.db.clone())),
        RunnerOptions {
            output_dir: config.output_dir.clone(),
            dead_letter_malformed: config.dead_letter_malformed,
        },
    ))
}

/// Consumes conversion jobs until `shutdown` fires, then waits for in-flight jobs.
pub async fn start_transcoder_worker(
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let runner = build_runner(&state);
    let queue_name = state.config.amqp_queue.clone();
    let consumer_tag = format!("converter-{}", Uuid::new_v4());
    let tracker = TaskTracker::new();

    info!(
        profile = state.config.profile.as_str(),
        output_dir = %state.config.output_dir.display(),
        "🎥 Starting Transcoder Worker '{}' with {} max concurrent jobs",
        consumer_tag,
        runner.gate().capacity()
    );

    'subscription: while !shutdown.is_cancelled() {
        let mut consumer = match state
            .queue
            .subscribe(&queue_name, &consumer_tag, state.config.amqp_prefetch)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                error!("Failed to subscribe to '{}': {}", queue_name, e);
                if wait_or_shutdown(&shutdown).await {
                    break;
                }
                if let Err(e) = state.queue.reconnect().await {
                    error!("Reconnect failed: {}", e);
                }
                continue;
            }
        };

        info!("🎥 Transcoder Worker listening on '{}'", queue_name);

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break 'subscription,
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    debug!(delivery_tag = delivery.delivery_tag, "📦 Received transcoding job");
                    let runner = Arc::clone(&runner);
                    tracker.spawn(async move {
                        let outcome = runner.handle(delivery).await;
                        debug!(?outcome, "Delivery settled");
                        if outcome == Outcome::Rejected {
                            warn!("Malformed message dropped after redelivery");
                        }
                    });
                }
                Some(Err(e)) => {
                    error!("Consumer error: {}", e);
                }
                None => {
                    warn!("Consumer stream for '{}' ended", queue_name);
                    break;
                }
            }
        }

        if wait_or_shutdown(&shutdown).await {
            break;
        }
        if let Err(e) = state.queue.reconnect().await {
            error!("Reconnect failed: {}", e);
        }
    }

    tracker.close();
    info!(
        in_flight = runner.gate().in_flight(),
        "Waiting for in-flight jobs to complete..."
    );
    tracker.wait().await;
    info!("Transcoder Worker stopped");
    Ok(())
}

/// Sleeps before a resubscribe attempt. Returns `true` if shutdown was requested meanwhile.
async fn wait_or_shutdown(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => false,
    }
}
