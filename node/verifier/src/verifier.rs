use crate::backend::{SubmissionReceipt, VerdictStatus, VerifierBackend};
use crate::retry::{retry_with_backoff, RetryPolicy};
use chrono::Utc;
use ethers::types::H256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{info, warn};
use veritask_common::{ComputeCommitment, VerificationConfig, VerificationError, VerificationResult, Verdict};

/// Drives commitments through the verifier and waits for a verdict
pub struct VerifierClient {
    backend: Arc<dyn VerifierBackend>,
    retry: RetryPolicy,
    confirmation_timeout: Duration,
    poll_interval: Duration,
    resolved: Mutex<HashMap<H256, VerificationResult>>,
}

impl VerifierClient {
    pub fn new(backend: Arc<dyn VerifierBackend>, config: &VerificationConfig) -> Self {
        Self {
            backend,
            retry: RetryPolicy::from(config),
            confirmation_timeout: config.confirmation_timeout(),
            poll_interval: config.poll_interval(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    fn resolved(&self) -> MutexGuard<'_, HashMap<H256, VerificationResult>> {
        self.resolved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a commitment and wait for its verdict.
    ///
    /// Transient backend failures are retried with backoff. A rejection is
    /// returned as [`VerificationError::Rejected`] and never retried. A digest
    /// that already reached a final verdict is answered from cache without
    /// touching the backend.
    pub async fn submit(
        &self,
        commitment: &ComputeCommitment,
    ) -> Result<VerificationResult, VerificationError> {
        let digest = commitment.digest;

        let cached = self.resolved().get(&digest).cloned();
        if let Some(result) = cached {
            info!(task_id = %commitment.task_id, ?digest, "digest already resolved, not resubmitting");
            return into_outcome(result);
        }

        let receipt = retry_with_backoff(|| self.backend.submit(commitment), &self.retry)
            .await
            .map_err(|e| {
                warn!(task_id = %commitment.task_id, ?digest, attempts = e.attempts, "submission failed: {}", e.error);
                VerificationError::SubmissionFailure {
                    attempts: e.attempts,
                    reason: e.error.to_string(),
                }
            })?;

        match receipt {
            SubmissionReceipt::Submitted { chain_reference } => {
                info!(task_id = %commitment.task_id, attempt = commitment.attempt, ?digest, ?chain_reference, "commitment submitted");
            }
            SubmissionReceipt::Duplicate => {
                info!(task_id = %commitment.task_id, ?digest, "verifier already holds digest");
            }
        }

        let status = self.await_verdict(digest).await?;
        let result = VerificationResult {
            task_id: commitment.task_id,
            attempt: commitment.attempt,
            digest,
            verdict: status.verdict,
            chain_reference: status.chain_reference,
            verified_at: Utc::now(),
        };

        self.resolved().insert(digest, result.clone());
        info!(task_id = %commitment.task_id, attempt = commitment.attempt, verdict = ?result.verdict, "verdict received");
        into_outcome(result)
    }

    /// Poll until the verdict is final or the confirmation window closes.
    /// One query per poll, each cut off at the deadline.
    async fn await_verdict(&self, digest: H256) -> Result<VerdictStatus, VerificationError> {
        let started = Instant::now();
        let deadline = started + self.confirmation_timeout;

        loop {
            match timeout_at(deadline, self.backend.verdict(digest)).await {
                Ok(Ok(status)) if status.verdict != Verdict::Pending => return Ok(status),
                Ok(Ok(_)) => {}
                // keep polling: the commitment is already on the wire
                Ok(Err(e)) => warn!(?digest, "verdict query failed: {}", e),
                Err(_) => warn!(?digest, "verdict query outlived the confirmation window"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(VerificationError::Timeout {
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

fn into_outcome(result: VerificationResult) -> Result<VerificationResult, VerificationError> {
    match result.verdict {
        Verdict::Rejected => Err(VerificationError::Rejected(Box::new(result))),
        _ => Ok(result),
    }
}
