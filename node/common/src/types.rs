use crate::amount::Amount;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique task identifier, assigned when a descriptor is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Left-padded to 32 bytes for `bytes32` contract arguments
    pub fn as_bytes32(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[16..].copy_from_slice(self.0.as_bytes());
        out
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operation an agent asks to have executed and proven
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Compute,
    Transfer,
    Stake,
    Custom(String),
}

impl OperationKind {
    /// Stable tag used by canonical encoding
    pub fn tag(&self) -> u8 {
        match self {
            Self::Compute => 0,
            Self::Transfer => 1,
            Self::Stake => 2,
            Self::Custom(_) => 3,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Compute => "compute",
            Self::Transfer => "transfer",
            Self::Stake => "stake",
            Self::Custom(name) => name,
        }
    }
}

/// Opaque input bytes plus the schema they claim to follow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub schema: String,
    #[serde(with = "hex")]
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn new(schema: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            schema: schema.into(),
            bytes: bytes.into(),
        }
    }

    pub fn empty(schema: impl Into<String>) -> Self {
        Self::new(schema, Vec::new())
    }
}

/// Unit of work submitted for verifiable execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub operation_kind: OperationKind,
    pub input_payload: Payload,
    pub max_budget: Amount,
    pub created_at: DateTime<Utc>,
}

impl TaskDescriptor {
    pub fn new(
        agent_id: AgentId,
        operation_kind: OperationKind,
        input_payload: Payload,
        max_budget: Amount,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            agent_id,
            operation_kind,
            input_payload,
            max_budget,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_time_us: u64,
    pub memory_high_watermark: u64,
    pub external_calls: u32,
    pub fuel_consumed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecStatus {
    pub fn tag(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::TimedOut => 2,
            Self::Cancelled => 3,
        }
    }
}

/// External interaction captured verbatim during execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCall {
    pub target: String,
    #[serde(with = "hex")]
    pub request: Vec<u8>,
    #[serde(with = "hex")]
    pub response: Vec<u8>,
}

/// Whether a real-world effect (e.g. a token transfer) happened
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    #[default]
    None,
    /// Broadcast but never confirmed; it may or may not have landed
    Pending {
        #[serde(with = "hex")]
        reference: Vec<u8>,
    },
    Completed {
        #[serde(with = "hex")]
        receipt: Vec<u8>,
    },
}

impl SideEffect {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

/// Record of one execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub task_id: TaskId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "hex")]
    pub output_payload: Vec<u8>,
    pub resource_usage: ResourceUsage,
    pub status: ExecStatus,
    pub external_calls: Vec<ExternalCall>,
    pub side_effect: SideEffect,
}

/// Proof-of-compute artifact for one successful attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeCommitment {
    pub task_id: TaskId,
    pub attempt: u32,
    pub digest: H256,
    pub scheme: String,
    #[serde(with = "hex")]
    pub prover_key: Vec<u8>,
    #[serde(with = "hex")]
    pub prover_signature: Vec<u8>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected,
    Pending,
}

/// Where on chain a verdict was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReference {
    pub block: u64,
    pub tx_hash: H256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub task_id: TaskId,
    pub attempt: u32,
    pub digest: H256,
    pub verdict: Verdict,
    pub chain_reference: Option<ChainReference>,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    DebitForCompute,
    CreditRefund,
    Deposit,
}

/// Append-only ledger record; `balance_after` is the fold of all prior entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub agent_id: AgentId,
    pub task_id: Option<TaskId>,
    pub attempt: u32,
    pub amount: Amount,
    pub reason: LedgerReason,
    pub balance_after: Amount,
    pub recorded_at: DateTime<Utc>,
}
