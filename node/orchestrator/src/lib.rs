pub mod commitment;
pub mod ledger;
pub mod lease;
pub mod orchestrator;
pub mod state;

pub use commitment::{commitment_digest, CommitmentBuilder};
pub use ledger::{replay_balance, ReplayMismatch, SettlementLedger};
pub use lease::{LeaseTable, TaskLease};
pub use orchestrator::{
    Escalation, EscalationReason, Orchestrator, SubmitError, TaskAudit, TaskStatus,
};
pub use state::{InvalidTransition, TaskEvent, TaskState};
