use ethers::{
    contract::abigen,
    middleware::SignerMiddleware,
    providers::{Http, Middleware, PendingTransaction, Provider},
    signers::LocalWallet,
    types::{Address, H256, U256},
};
use anyhow::{Context, Result};
use std::sync::Arc;

// Generate contract bindings
abigen!(
    ProofVerifier,
    r#"[
        function submitCommitment(bytes32 digest, bytes32 taskId, uint32 attempt, bytes proverKey, bytes signature) external
        function verdictOf(bytes32 digest) external view returns (uint8 verdict, uint64 blockNumber, bytes32 txHash)
        function isSubmitted(bytes32 digest) external view returns (bool)
    ]"#
);

abigen!(
    SettlementToken,
    r#"[
        function transfer(address to, uint256 amount) external returns (bool)
        function balanceOf(address account) external view returns (uint256)
        function decimals() external view returns (uint8)
    ]"#
);

abigen!(
    StakingPool,
    r#"[
        function stake(address validator, uint256 amount) external
    ]"#
);

pub type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// On-chain verdict codes returned by `verdictOf`
pub const VERDICT_PENDING: u8 = 0;
pub const VERDICT_ACCEPTED: u8 = 1;
pub const VERDICT_REJECTED: u8 = 2;

/// Receipt of a mined transaction
#[derive(Debug, Clone, Copy)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block: u64,
}

/// Verifier contract client
#[derive(Clone)]
pub struct VerifierContractClient {
    contract: ProofVerifier<Client>,
}

impl VerifierContractClient {
    pub fn new(contract_addr: Address, client: Arc<Client>) -> Self {
        let contract = ProofVerifier::new(contract_addr, client);
        Self { contract }
    }

    /// Submit a commitment for verification and wait for it to be mined
    pub async fn submit_commitment(
        &self,
        digest: H256,
        task_id: [u8; 32],
        attempt: u32,
        prover_key: &[u8],
        signature: &[u8],
    ) -> Result<TxReceipt> {
        let call = self.contract.submit_commitment(
            digest.into(),
            task_id,
            attempt,
            prover_key.to_vec().into(),
            signature.to_vec().into(),
        );
        let receipt = call
            .send()
            .await?
            .await?
            .context("submission transaction dropped from mempool")?;

        Ok(TxReceipt {
            tx_hash: receipt.transaction_hash,
            block: receipt.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        })
    }

    /// Current verdict for a digest: (code, block, tx)
    pub async fn verdict_of(&self, digest: H256) -> Result<(u8, u64, H256)> {
        let (code, block, tx) = self.contract.verdict_of(digest.into()).call().await?;
        Ok((code, block, H256::from(tx)))
    }

    pub async fn is_submitted(&self, digest: H256) -> Result<bool> {
        Ok(self.contract.is_submitted(digest.into()).call().await?)
    }
}

/// Settlement token and staking pool client used by value-moving operations.
///
/// Broadcast and confirmation are separate calls so a caller can record the
/// transaction hash before waiting on the receipt.
#[derive(Clone)]
pub struct TokenClient {
    client: Arc<Client>,
    token: SettlementToken<Client>,
    staking: StakingPool<Client>,
}

impl TokenClient {
    pub fn new(token_addr: Address, staking_addr: Address, client: Arc<Client>) -> Self {
        Self {
            token: SettlementToken::new(token_addr, client.clone()),
            staking: StakingPool::new(staking_addr, client.clone()),
            client,
        }
    }

    /// Broadcast a transfer, returning once the node has accepted it
    pub async fn send_transfer(&self, to: Address, amount: U256) -> Result<H256> {
        let call = self.token.transfer(to, amount);
        let pending = call.send().await?;
        Ok(pending.tx_hash())
    }

    pub async fn send_stake(&self, validator: Address, amount: U256) -> Result<H256> {
        let call = self.staking.stake(validator, amount);
        let pending = call.send().await?;
        Ok(pending.tx_hash())
    }

    /// Wait for a broadcast transaction to be mined
    pub async fn confirm(&self, tx_hash: H256) -> Result<TxReceipt> {
        let receipt = PendingTransaction::new(tx_hash, self.client.provider())
            .await?
            .with_context(|| format!("transaction {:?} dropped from mempool", tx_hash))?;

        Ok(TxReceipt {
            tx_hash: receipt.transaction_hash,
            block: receipt.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        })
    }

    pub async fn decimals(&self) -> Result<u8> {
        Ok(self.token.decimals().call().await?)
    }
}
