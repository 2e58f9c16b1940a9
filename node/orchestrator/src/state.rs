//! Per-task lifecycle.
//!
//! Every legal move is one arm of [`TaskState::apply`]; anything else is an
//! [`InvalidTransition`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Executing { attempt: u32 },
    Committed { attempt: u32 },
    Submitted { attempt: u32 },
    /// `resubmit` is set when the last trace completed a side effect, so the
    /// next attempt reuses its commitment instead of executing again
    Retrying { attempt: u32, resubmit: bool },
    Settled { attempt: u32, entry_seq: u64 },
    Failed { attempt: u32 },
    Rejected { attempt: u32 },
    Cancelled,
    /// Accepted, but the ledger refused the debit
    Disputed { attempt: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Dispatch,
    Committed,
    CommitFailed,
    ExecutionFailed { retry: bool },
    Submit,
    Settle { attempt: u32, entry_seq: u64 },
    Reject,
    SubmissionFailed { retry: bool, resubmit: bool },
    SettlementFailed,
    Retry,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event:?} is not valid in state {from}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub event: TaskEvent,
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Executing { .. } => "executing",
            Self::Committed { .. } => "committed",
            Self::Submitted { .. } => "submitted",
            Self::Retrying { .. } => "retrying",
            Self::Settled { .. } => "settled",
            Self::Failed { .. } => "failed",
            Self::Rejected { .. } => "rejected",
            Self::Cancelled => "cancelled",
            Self::Disputed { .. } => "disputed",
        }
    }

    /// Attempt the task is on, zero before dispatch
    pub fn attempt(&self) -> u32 {
        match *self {
            Self::Created | Self::Cancelled => 0,
            Self::Executing { attempt }
            | Self::Committed { attempt }
            | Self::Submitted { attempt }
            | Self::Retrying { attempt, .. }
            | Self::Settled { attempt, .. }
            | Self::Failed { attempt }
            | Self::Rejected { attempt }
            | Self::Disputed { attempt } => attempt,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Settled { .. }
                | Self::Failed { .. }
                | Self::Rejected { .. }
                | Self::Cancelled
                | Self::Disputed { .. }
        )
    }

    /// A commitment on the wire must resolve, so only pre-commit states qualify
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Executing { .. } | Self::Retrying { resubmit: false, .. }
        )
    }

    pub fn apply(self, event: &TaskEvent) -> Result<TaskState, InvalidTransition> {
        use TaskEvent as E;

        let next = match (self, *event) {
            (Self::Created, E::Dispatch) => Self::Executing { attempt: 1 },

            (Self::Executing { attempt }, E::Committed) => Self::Committed { attempt },
            (Self::Executing { attempt }, E::CommitFailed) => Self::Failed { attempt },
            (Self::Executing { attempt }, E::ExecutionFailed { retry: true }) => {
                Self::Retrying { attempt, resubmit: false }
            }
            (Self::Executing { attempt }, E::ExecutionFailed { retry: false }) => {
                Self::Failed { attempt }
            }

            (Self::Committed { attempt }, E::Submit) => Self::Submitted { attempt },

            (Self::Submitted { .. }, E::Settle { attempt, entry_seq }) => {
                Self::Settled { attempt, entry_seq }
            }
            (Self::Submitted { attempt }, E::Reject) => Self::Rejected { attempt },
            (Self::Submitted { attempt }, E::SettlementFailed) => Self::Disputed { attempt },
            (Self::Submitted { attempt }, E::SubmissionFailed { retry: true, resubmit }) => {
                Self::Retrying { attempt, resubmit }
            }
            (Self::Submitted { attempt }, E::SubmissionFailed { retry: false, .. }) => {
                Self::Failed { attempt }
            }

            (Self::Retrying { attempt, resubmit: false }, E::Retry) => {
                Self::Executing { attempt: attempt + 1 }
            }
            (Self::Retrying { attempt, resubmit: true }, E::Retry) => {
                Self::Committed { attempt: attempt + 1 }
            }

            (state, E::Cancel) if state.is_cancellable() => Self::Cancelled,

            (state, event) => {
                return Err(InvalidTransition {
                    from: state.name(),
                    event,
                })
            }
        };
        Ok(next)
    }
}
