use async_trait::async_trait;
use ethers::types::{Address, H256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};
use veritask_common::{
    contracts::{TokenClient, TxReceipt},
    Amount, ExecutionError, ExternalCall, SideEffect, TaskDescriptor,
};

pub const TRANSFER_SCHEMA: &str = "veritask.transfer.v1";
pub const STAKE_SCHEMA: &str = "veritask.stake.v1";

/// Ceilings applied to one execution attempt
#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub fuel_limit: u64,
    pub memory_limit: u64,
    pub max_output_size: usize,
}

#[derive(Debug, Default)]
struct Recorder {
    external_calls: Vec<ExternalCall>,
    side_effect: SideEffect,
    memory_high_watermark: u64,
    fuel_consumed: u64,
}

/// What an attempt observed, taken after the operation returns or is aborted
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    pub external_calls: Vec<ExternalCall>,
    pub side_effect: SideEffect,
    pub memory_high_watermark: u64,
    pub fuel_consumed: u64,
}

/// Per-attempt recorder shared between the executor and the running operation.
///
/// Operations must record a side effect here as soon as it is started, and
/// again once it is final, before doing anything else that could fail or be
/// interrupted; the executor reads it even when the operation future is dropped.
#[derive(Clone)]
pub struct ExecutionContext {
    limits: ExecutionLimits,
    recorder: Arc<Mutex<Recorder>>,
}

impl ExecutionContext {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            recorder: Arc::new(Mutex::new(Recorder::default())),
        }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    fn recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_call(&self, target: impl Into<String>, request: Vec<u8>, response: Vec<u8>) {
        self.recorder().external_calls.push(ExternalCall {
            target: target.into(),
            request,
            response,
        });
    }

    /// Mark a side effect as in flight; it stays pending unless completed
    pub fn begin_side_effect(&self, reference: Vec<u8>) {
        self.recorder().side_effect = SideEffect::Pending { reference };
    }

    pub fn complete_side_effect(&self, receipt: Vec<u8>) {
        self.recorder().side_effect = SideEffect::Completed { receipt };
    }

    pub fn observe_memory(&self, bytes: u64) {
        let mut recorder = self.recorder();
        recorder.memory_high_watermark = recorder.memory_high_watermark.max(bytes);
    }

    pub fn add_fuel(&self, fuel: u64) {
        let mut recorder = self.recorder();
        recorder.fuel_consumed = recorder.fuel_consumed.saturating_add(fuel);
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let recorder = self.recorder();
        ContextSnapshot {
            external_calls: recorder.external_calls.clone(),
            side_effect: recorder.side_effect.clone(),
            memory_high_watermark: recorder.memory_high_watermark,
            fuel_consumed: recorder.fuel_consumed,
        }
    }

    /// Decode a JSON payload after checking its declared schema
    pub fn decode_payload<T: DeserializeOwned>(
        &self,
        task: &TaskDescriptor,
        schema: &str,
    ) -> Result<T, ExecutionError> {
        if task.input_payload.schema != schema {
            return Err(ExecutionError::OperationFailure(format!(
                "expected payload schema {}, got {}",
                schema, task.input_payload.schema
            )));
        }
        serde_json::from_slice(&task.input_payload.bytes)
            .map_err(|e| ExecutionError::OperationFailure(format!("malformed {} payload: {}", schema, e)))
    }
}

/// Handler for one operation kind
#[async_trait]
pub trait Operation: Send + Sync {
    async fn run(
        &self,
        task: &TaskDescriptor,
        ctx: &ExecutionContext,
    ) -> Result<Vec<u8>, ExecutionError>;
}

/// Value-moving chain calls used by transfer and stake tasks.
///
/// `send_*` returns as soon as the transaction is broadcast; `confirm` waits
/// for it to be mined.
#[async_trait]
pub trait ChainActions: Send + Sync {
    async fn send_transfer(&self, to: Address, amount: Amount) -> anyhow::Result<H256>;

    async fn send_stake(&self, validator: Address, amount: Amount) -> anyhow::Result<H256>;

    async fn confirm(&self, tx_hash: H256) -> anyhow::Result<TxReceipt>;
}

#[async_trait]
impl ChainActions for TokenClient {
    async fn send_transfer(&self, to: Address, amount: Amount) -> anyhow::Result<H256> {
        let units = amount
            .to_token_units()
            .ok_or_else(|| anyhow::anyhow!("cannot transfer negative amount {}", amount))?;
        TokenClient::send_transfer(self, to, units).await
    }

    async fn send_stake(&self, validator: Address, amount: Amount) -> anyhow::Result<H256> {
        let units = amount
            .to_token_units()
            .ok_or_else(|| anyhow::anyhow!("cannot stake negative amount {}", amount))?;
        TokenClient::send_stake(self, validator, units).await
    }

    async fn confirm(&self, tx_hash: H256) -> anyhow::Result<TxReceipt> {
        TokenClient::confirm(self, tx_hash).await
    }
}

/// Payload of `transfer` and `stake` tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueRequest {
    pub to: Address,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueAction {
    Transfer,
    Stake,
}

impl ValueAction {
    fn schema(self) -> &'static str {
        match self {
            Self::Transfer => TRANSFER_SCHEMA,
            Self::Stake => STAKE_SCHEMA,
        }
    }

    fn target(self) -> &'static str {
        match self {
            Self::Transfer => "token.transfer",
            Self::Stake => "staking.stake",
        }
    }
}

/// Transfer or stake through [`ChainActions`], recording the receipt as a side effect
pub struct ChainOperation {
    action: ValueAction,
    chain: Arc<dyn ChainActions>,
}

impl ChainOperation {
    pub fn transfer(chain: Arc<dyn ChainActions>) -> Self {
        Self { action: ValueAction::Transfer, chain }
    }

    pub fn stake(chain: Arc<dyn ChainActions>) -> Self {
        Self { action: ValueAction::Stake, chain }
    }

    fn call_failed(
        &self,
        task: &TaskDescriptor,
        ctx: &ExecutionContext,
        e: anyhow::Error,
    ) -> ExecutionError {
        warn!(task_id = %task.task_id, "{} failed: {:#}", self.action.target(), e);
        ctx.record_call(
            self.action.target(),
            task.input_payload.bytes.clone(),
            format!("error: {:#}", e).into_bytes(),
        );
        ExecutionError::OperationFailure(format!("{:#}", e))
    }
}

/// Receipt bytes: tx hash followed by big-endian block number
fn encode_receipt(receipt: &TxReceipt) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend_from_slice(receipt.tx_hash.as_bytes());
    out.extend_from_slice(&receipt.block.to_be_bytes());
    out
}

#[async_trait]
impl Operation for ChainOperation {
    async fn run(
        &self,
        task: &TaskDescriptor,
        ctx: &ExecutionContext,
    ) -> Result<Vec<u8>, ExecutionError> {
        let request: ValueRequest = ctx.decode_payload(task, self.action.schema())?;
        if request.amount.micros() <= 0 {
            return Err(ExecutionError::OperationFailure(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }

        let sent = match self.action {
            ValueAction::Transfer => self.chain.send_transfer(request.to, request.amount).await,
            ValueAction::Stake => self.chain.send_stake(request.to, request.amount).await,
        };
        let tx_hash = sent.map_err(|e| self.call_failed(task, ctx, e))?;

        // from here on the transaction may land whatever happens to this attempt
        ctx.begin_side_effect(tx_hash.as_bytes().to_vec());
        info!(task_id = %task.task_id, tx = ?tx_hash, "{} broadcast", self.action.target());

        let receipt = self
            .chain
            .confirm(tx_hash)
            .await
            .map_err(|e| self.call_failed(task, ctx, e))?;

        let bytes = encode_receipt(&receipt);
        ctx.complete_side_effect(bytes.clone());
        ctx.record_call(self.action.target(), task.input_payload.bytes.clone(), bytes.clone());
        info!(
            task_id = %task.task_id,
            tx = ?receipt.tx_hash,
            block = receipt.block,
            "{} confirmed",
            self.action.target()
        );
        Ok(bytes)
    }
}
