//! Per-message job lifecycle: admit, decode, transcode, record, settle.
//!
//! Every admitted message ends in exactly one settlement. The job is acked
//! once its outcome, success or classified failure, is durably recorded.
//! Otherwise it is nacked so the broker hands it out again. Messages the gate
//! refuses are nacked untouched.

use crate::modules::conversion::job::JobDescriptor;
use crate::modules::conversion::model::{JobOutcome, Recorded};
use crate::modules::conversion::repository::StatusStore;
use crate::modules::conversion::transcode::TranscodeAdapter;
use crate::workers::admission::AdmissionGate;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How a delivery is handed back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// Terminal state of one delivery as seen by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Gate was full. Nothing was decoded; the message goes back to the queue.
    Denied,
    Acknowledged,
    Redelivered,
    /// Nacked without requeue. Only reachable with the dead-letter policy on.
    Rejected,
}

impl From<Settlement> for Outcome {
    fn from(settlement: Settlement) -> Self {
        match settlement {
            Settlement::Ack => Outcome::Acknowledged,
            Settlement::Nack { requeue: true } => Outcome::Redelivered,
            Settlement::Nack { requeue: false } => Outcome::Rejected,
        }
    }
}

/// A delivered message that can be settled exactly once.
#[async_trait]
pub trait InboundMessage: Send + 'static {
    fn payload(&self) -> &[u8];

    /// Whether the broker has handed this message out before.
    fn redelivered(&self) -> bool;

    async fn settle(self, settlement: Settlement) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Where `file_name`-style destinations are written.
    pub output_dir: PathBuf,
    /// Drop (or dead-letter) a malformed message the second time it is seen
    /// instead of requeueing it forever.
    pub dead_letter_malformed: bool,
}

pub struct JobRunner {
    gate: AdmissionGate,
    adapter: TranscodeAdapter,
    store: Arc<dyn StatusStore>,
    options: RunnerOptions,
}

impl JobRunner {
    pub fn new(
        gate: AdmissionGate,
        adapter: TranscodeAdapter,
        store: Arc<dyn StatusStore>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            gate,
            adapter,
            store,
            options,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Drives one delivery to its terminal state. Never panics and never
    /// returns an error: every failure ends up as a settlement.
    pub async fn handle<M: InboundMessage>(self: &Arc<Self>, message: M) -> Outcome {
        let Some(token) = self.gate.try_admit() else {
            debug!(
                capacity = self.gate.capacity(),
                "Admission denied, handing message back to the queue"
            );
            Self::settle(message, Settlement::Nack { requeue: true }).await;
            return Outcome::Denied;
        };

        let payload = message.payload().to_vec();
        let redelivered = message.redelivered();
        let runner = Arc::clone(self);

        // The pipeline runs on its own task so a panic is contained here
        // and the token is dropped during unwinding.
        let execution = tokio::spawn(async move {
            let settlement = runner.execute(&payload, redelivered).await;
            token.release();
            settlement
        });

        let settlement = match execution.await {
            Ok(settlement) => settlement,
            Err(e) => {
                error!("Job task aborted ({}), message will be redelivered", e);
                Settlement::Nack { requeue: true }
            }
        };

        Self::settle(message, settlement).await;
        settlement.into()
    }

    async fn execute(&self, payload: &[u8], redelivered: bool) -> Settlement {
        let job = match JobDescriptor::decode(payload, &self.options.output_dir) {
            Ok(job) => job,
            Err(e) => {
                let requeue = !(self.options.dead_letter_malformed && redelivered);
                warn!(
                    redelivered,
                    requeue,
                    payload_sample = e.payload_sample(),
                    "Rejecting malformed job payload: {}",
                    e
                );
                return Settlement::Nack { requeue };
            }
        };

        info!(
            job_id = %job.job_id,
            format = %job.target_format,
            redelivered,
            "Processing conversion job"
        );

        let outcome = match self.adapter.run(&job).await {
            Ok(result) => {
                debug!(
                    job_id = %job.job_id,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "Conversion succeeded"
                );
                JobOutcome::Success {
                    start: result.start,
                    end: result.end,
                }
            }
            Err(e) => {
                warn!(job_id = %job.job_id, "Conversion failed, recording failure: {}", e);
                JobOutcome::Failure
            }
        };

        match self.store.record(&job.job_id, outcome).await {
            Ok(Recorded::Applied(status)) => {
                info!(job_id = %job.job_id, %status, "Job status recorded");
                Settlement::Ack
            }
            Ok(Recorded::AlreadyTerminal(status)) => {
                warn!(
                    job_id = %job.job_id,
                    %status,
                    "Job already terminal, treating delivery as a duplicate"
                );
                Settlement::Ack
            }
            Err(e) => {
                error!(job_id = %job.job_id, "Failed to record job status: {}", e);
                Settlement::Nack { requeue: true }
            }
        }
    }

    async fn settle<M: InboundMessage>(message: M, settlement: Settlement) {
        if let Err(e) = message.settle(settlement).await {
            error!(?settlement, "Failed to settle message: {}", e);
        }
    }
}
