use crate::amount::Amount;
use crate::types::{ExecStatus, TaskId, VerificationResult, Verdict};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat error classification reported through task status queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ResourceExceeded,
    OperationFailure,
    Cancelled,
    InvalidTraceStatus,
    TaskMismatch,
    SubmissionFailure,
    VerificationTimeout,
    Rejected,
    InsufficientBudget,
    NotAccepted,
    AlreadySettled,
    InvalidAmount,
    Overflow,
    AttemptMismatch,
    DigestMismatch,
    InvalidTransition,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("execution exceeded {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("resource ceiling exceeded: {0}")]
    ResourceExceeded(String),

    #[error("operation failed: {0}")]
    OperationFailure(String),

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ResourceExceeded(_) => ErrorKind::ResourceExceeded,
            Self::OperationFailure(_) => ErrorKind::OperationFailure,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Trace status recorded for this failure
    pub fn trace_status(&self) -> ExecStatus {
        match self {
            Self::Timeout { .. } => ExecStatus::TimedOut,
            Self::Cancelled => ExecStatus::Cancelled,
            Self::ResourceExceeded(_) | Self::OperationFailure(_) => ExecStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitmentError {
    #[error("cannot commit to trace of task {task_id} attempt {attempt} with status {status:?}")]
    InvalidTraceStatus {
        task_id: TaskId,
        attempt: u32,
        status: ExecStatus,
    },

    #[error("trace belongs to task {trace}, not {descriptor}")]
    TaskMismatch { descriptor: TaskId, trace: TaskId },
}

impl CommitmentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTraceStatus { .. } => ErrorKind::InvalidTraceStatus,
            Self::TaskMismatch { .. } => ErrorKind::TaskMismatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("submission failed after {attempts} attempts: {reason}")]
    SubmissionFailure { attempts: u32, reason: String },

    #[error("no verdict within {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("commitment rejected by verifier")]
    Rejected(Box<VerificationResult>),
}

impl VerificationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SubmissionFailure { .. } => ErrorKind::SubmissionFailure,
            Self::Timeout { .. } => ErrorKind::VerificationTimeout,
            Self::Rejected(_) => ErrorKind::Rejected,
        }
    }

    /// Infrastructure failures may be retried with a new attempt; rejection is final
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("settlement requires an accepted verdict, got {0:?}")]
    NotAccepted(Verdict),

    #[error("balance {balance} minus {debit} would breach floor {floor}")]
    InsufficientBudget {
        balance: Amount,
        debit: Amount,
        floor: Amount,
    },

    #[error("task {task_id} already settled under attempt {attempt}")]
    AlreadySettled { task_id: TaskId, attempt: u32 },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("ledger arithmetic overflow")]
    Overflow,

    #[error("record belongs to task {found}, not {expected}")]
    TaskMismatch { expected: TaskId, found: TaskId },

    #[error("verdict is for attempt {verdict}, trace is attempt {trace}")]
    AttemptMismatch { trace: u32, verdict: u32 },

    #[error("cannot settle a trace with status {0:?}")]
    UnsuccessfulTrace(ExecStatus),

    #[error("verdict digest does not commit to this trace")]
    DigestMismatch,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAccepted(_) => ErrorKind::NotAccepted,
            Self::InsufficientBudget { .. } => ErrorKind::InsufficientBudget,
            Self::AlreadySettled { .. } => ErrorKind::AlreadySettled,
            Self::InvalidAmount(_) => ErrorKind::InvalidAmount,
            Self::Overflow => ErrorKind::Overflow,
            Self::TaskMismatch { .. } => ErrorKind::TaskMismatch,
            Self::AttemptMismatch { .. } => ErrorKind::AttemptMismatch,
            Self::UnsuccessfulTrace(_) => ErrorKind::InvalidTraceStatus,
            Self::DigestMismatch => ErrorKind::DigestMismatch,
        }
    }
}

/// Last error recorded against a task, as shown to the agent runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ExecutionError> for ErrorReport {
    fn from(err: &ExecutionError) -> Self {
        Self { kind: err.kind(), message: err.to_string() }
    }
}

impl From<&CommitmentError> for ErrorReport {
    fn from(err: &CommitmentError) -> Self {
        Self { kind: err.kind(), message: err.to_string() }
    }
}

impl From<&VerificationError> for ErrorReport {
    fn from(err: &VerificationError) -> Self {
        Self { kind: err.kind(), message: err.to_string() }
    }
}

impl From<&LedgerError> for ErrorReport {
    fn from(err: &LedgerError) -> Self {
        Self { kind: err.kind(), message: err.to_string() }
    }
}
