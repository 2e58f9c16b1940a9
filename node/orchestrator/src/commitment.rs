use ethers::types::H256;
use std::sync::Arc;
use veritask_common::{
    canonical::commitment_preimage,
    crypto::{sha256, ProverSigner},
    CommitmentError, ComputeCommitment, ExecStatus, ExecutionTrace, TaskDescriptor,
};

/// Digest binding a descriptor to one execution trace
pub fn commitment_digest(task: &TaskDescriptor, trace: &ExecutionTrace) -> H256 {
    sha256(&commitment_preimage(task, trace))
}

/// Derives signed proof-of-compute artifacts from successful traces
pub struct CommitmentBuilder {
    signer: Arc<dyn ProverSigner>,
}

impl CommitmentBuilder {
    pub fn new(signer: Arc<dyn ProverSigner>) -> Self {
        Self { signer }
    }

    /// Pure in its inputs: the same descriptor and trace always yield the same
    /// digest, and the same signature for deterministic schemes.
    pub fn build(
        &self,
        task: &TaskDescriptor,
        trace: &ExecutionTrace,
    ) -> Result<ComputeCommitment, CommitmentError> {
        if trace.task_id != task.task_id {
            return Err(CommitmentError::TaskMismatch {
                descriptor: task.task_id,
                trace: trace.task_id,
            });
        }
        if trace.status != ExecStatus::Success {
            return Err(CommitmentError::InvalidTraceStatus {
                task_id: trace.task_id,
                attempt: trace.attempt,
                status: trace.status,
            });
        }

        let digest = commitment_digest(task, trace);

        Ok(ComputeCommitment {
            task_id: task.task_id,
            attempt: trace.attempt,
            digest,
            scheme: self.signer.scheme().to_string(),
            prover_key: self.signer.public_key(),
            prover_signature: self.signer.sign(&digest),
            submitted_at: trace.finished_at,
        })
    }
}
