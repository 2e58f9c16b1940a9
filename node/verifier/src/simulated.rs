use crate::backend::{BackendError, SubmissionReceipt, VerdictStatus, VerifierBackend};
use async_trait::async_trait;
use ethers::types::H256;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};
use veritask_common::{crypto, ChainReference, ComputeCommitment, Verdict};

#[derive(Debug, Default)]
struct SimState {
    verdicts: HashMap<H256, VerdictStatus>,
    block: u64,
    submissions: u32,
    transient_failures: u32,
    unavailable: bool,
    reject_all: bool,
    hold_pending: bool,
}

/// Off-chain stand-in for the verifier contract.
///
/// Accepts a commitment when its prover signature checks out, remembers every
/// digest so a resubmission is reported as a duplicate, and can be scripted to
/// fail, reject or stall.
#[derive(Debug, Default)]
pub struct SimulatedVerifier {
    state: Mutex<SimState>,
}

impl SimulatedVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` submissions with a transient error
    pub fn fail_next(&self, n: u32) {
        self.state().transient_failures = n;
    }

    /// Fail every submission with a transient error until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn reject_all(&self, reject: bool) {
        self.state().reject_all = reject;
    }

    /// Leave new submissions pending until [`decide`](Self::decide) is called
    pub fn hold_pending(&self, hold: bool) {
        self.state().hold_pending = hold;
    }

    pub fn decide(&self, digest: H256, verdict: Verdict) {
        let mut state = self.state();
        state.block += 1;
        let chain_reference = Some(simulated_reference(digest, state.block));
        state.verdicts.insert(digest, VerdictStatus { verdict, chain_reference });
    }

    /// Submissions that reached the simulated chain (failed ones excluded)
    pub fn submission_count(&self) -> u32 {
        self.state().submissions
    }
}

fn simulated_reference(digest: H256, block: u64) -> ChainReference {
    let mut preimage = digest.as_bytes().to_vec();
    preimage.extend_from_slice(&block.to_be_bytes());
    ChainReference {
        block,
        tx_hash: crypto::sha256(&preimage),
    }
}

#[async_trait]
impl VerifierBackend for SimulatedVerifier {
    async fn submit(&self, commitment: &ComputeCommitment) -> Result<SubmissionReceipt, BackendError> {
        let mut state = self.state();

        if state.unavailable {
            return Err(BackendError::Transient("simulated verifier unavailable".into()));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(BackendError::Transient("simulated chain congestion".into()));
        }
        if state.verdicts.contains_key(&commitment.digest) {
            debug!(digest = ?commitment.digest, "duplicate submission");
            return Ok(SubmissionReceipt::Duplicate);
        }

        state.submissions += 1;
        state.block += 1;
        let chain_reference = simulated_reference(commitment.digest, state.block);

        let verdict = if state.hold_pending {
            Verdict::Pending
        } else if state.reject_all {
            Verdict::Rejected
        } else if let Err(e) = crypto::verify_commitment(commitment) {
            warn!(digest = ?commitment.digest, "rejecting commitment: {}", e);
            Verdict::Rejected
        } else {
            Verdict::Accepted
        };

        let status = match verdict {
            Verdict::Pending => VerdictStatus::pending(),
            _ => VerdictStatus { verdict, chain_reference: Some(chain_reference) },
        };
        state.verdicts.insert(commitment.digest, status);

        Ok(SubmissionReceipt::Submitted { chain_reference: Some(chain_reference) })
    }

    async fn verdict(&self, digest: H256) -> Result<VerdictStatus, BackendError> {
        self.state()
            .verdicts
            .get(&digest)
            .copied()
            .ok_or_else(|| BackendError::Fatal(format!("digest {:?} was never submitted", digest)))
    }
}
