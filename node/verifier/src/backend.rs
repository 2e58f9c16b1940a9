use crate::retry::{retry_with_backoff, RetryPolicy, Retryable};
use anyhow::Context;
use async_trait::async_trait;
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, H256},
};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use veritask_common::{
    contracts::{
        Client, VerifierContractClient, VERDICT_ACCEPTED, VERDICT_PENDING, VERDICT_REJECTED,
    },
    ChainReference, ComputeCommitment, Verdict,
};

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Network or chain congestion; worth retrying
    #[error("transient verifier failure: {0}")]
    Transient(String),

    #[error("verifier failure: {0}")]
    Fatal(String),
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionReceipt {
    Submitted { chain_reference: Option<ChainReference> },
    /// The verifier already holds this digest; no second effect was produced
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerdictStatus {
    pub verdict: Verdict,
    pub chain_reference: Option<ChainReference>,
}

impl VerdictStatus {
    pub fn pending() -> Self {
        Self { verdict: Verdict::Pending, chain_reference: None }
    }
}

/// The verifier contract, on chain or simulated
#[async_trait]
pub trait VerifierBackend: Send + Sync {
    async fn submit(&self, commitment: &ComputeCommitment) -> Result<SubmissionReceipt, BackendError>;

    async fn verdict(&self, digest: H256) -> Result<VerdictStatus, BackendError>;
}

/// Determine if a chain error is retryable: reverts are final, the rest is
/// treated as infrastructure trouble
fn classify(err: anyhow::Error) -> BackendError {
    let msg = format!("{:#}", err);
    if msg.contains("revert") || msg.contains("execution reverted") {
        BackendError::Fatal(msg)
    } else {
        BackendError::Transient(msg)
    }
}

/// Verifier contract reached through an ethers signer
pub struct OnChainVerifier {
    contract: VerifierContractClient,
}

impl OnChainVerifier {
    pub fn new(contract: VerifierContractClient) -> Self {
        Self { contract }
    }

    pub fn connect(client: Arc<Client>, contract_addr: &str) -> anyhow::Result<Self> {
        let address = Address::from_str(contract_addr).context("invalid verifier address")?;
        info!(verifier = ?address, "using on-chain verifier contract");
        Ok(Self::new(VerifierContractClient::new(address, client)))
    }
}

/// Build a signing client with the chain id read from the node
pub async fn connect_signer(rpc_url: &str, private_key: &str) -> anyhow::Result<Arc<Client>> {
    let provider = Provider::<Http>::try_from(rpc_url).context("invalid RPC URL")?;
    let wallet: LocalWallet = private_key.parse().context("invalid private key")?;

    // get chain ID with retry
    let chain_id = retry_with_backoff(
        || async { provider.get_chainid().await.map_err(|e| classify(e.into())) },
        &RetryPolicy::default(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to read chain id after {} attempts: {}", e.attempts, e.error))?
    .as_u64();

    info!(chain_id, "connected to chain");

    Ok(Arc::new(SignerMiddleware::new(
        provider,
        wallet.with_chain_id(chain_id),
    )))
}

#[async_trait]
impl VerifierBackend for OnChainVerifier {
    async fn submit(&self, commitment: &ComputeCommitment) -> Result<SubmissionReceipt, BackendError> {
        if self.contract.is_submitted(commitment.digest).await.map_err(classify)? {
            return Ok(SubmissionReceipt::Duplicate);
        }

        let receipt = self
            .contract
            .submit_commitment(
                commitment.digest,
                commitment.task_id.as_bytes32(),
                commitment.attempt,
                &commitment.prover_key,
                &commitment.prover_signature,
            )
            .await
            .map_err(classify)?;

        Ok(SubmissionReceipt::Submitted {
            chain_reference: Some(ChainReference {
                block: receipt.block,
                tx_hash: receipt.tx_hash,
            }),
        })
    }

    async fn verdict(&self, digest: H256) -> Result<VerdictStatus, BackendError> {
        let (code, block, tx_hash) = self.contract.verdict_of(digest).await.map_err(classify)?;

        let verdict = match code {
            VERDICT_PENDING => return Ok(VerdictStatus::pending()),
            VERDICT_ACCEPTED => Verdict::Accepted,
            VERDICT_REJECTED => Verdict::Rejected,
            other => return Err(BackendError::Fatal(format!("unknown verdict code {}", other))),
        };

        Ok(VerdictStatus {
            verdict,
            chain_reference: Some(ChainReference { block, tx_hash }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverts_are_fatal() {
        assert!(!classify(anyhow::anyhow!("execution reverted: bad signature")).is_retryable());
        assert!(classify(anyhow::anyhow!("connection refused")).is_retryable());
    }
}
