use crate::commitment::CommitmentBuilder;
use crate::ledger::SettlementLedger;
use crate::lease::{LeaseTable, TaskLease};
use crate::state::{InvalidTransition, TaskEvent, TaskState};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};
use veritask_common::{
    AgentId, Amount, ComputeCommitment, ErrorKind, ErrorReport, ExecutionTrace, LedgerEntry,
    PipelineConfig, TaskDescriptor, TaskId, VerificationError, VerificationResult,
};
use veritask_executor::Executor;
use veritask_verifier::VerifierClient;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("task {0} was already submitted")]
    DuplicateTask(TaskId),

    #[error("task budget must not be negative, got {0}")]
    InvalidBudget(Amount),
}

/// What the agent runtime sees for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub attempt: u32,
    pub last_error: Option<ErrorReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Verified but the ledger refused the debit
    Unpaid,
    /// A real side effect happened and its proof was rejected
    SideEffectRejected,
    /// Attempt budget spent
    Exhausted,
    /// A side effect was broadcast but never confirmed; re-running could repeat it
    SideEffectUnconfirmed,
}

/// A task outcome the pipeline cannot resolve on its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escalation {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub attempt: u32,
    pub reason: EscalationReason,
    pub error: ErrorReport,
}

/// Everything the pipeline recorded for one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskAudit {
    pub descriptor: TaskDescriptor,
    pub state: TaskState,
    pub traces: Vec<ExecutionTrace>,
    pub commitments: Vec<ComputeCommitment>,
    pub verifications: Vec<VerificationResult>,
    pub ledger_entries: Vec<LedgerEntry>,
}

struct TaskRecord {
    descriptor: TaskDescriptor,
    state: TaskState,
    last_error: Option<ErrorReport>,
    cancel_requested: bool,
    cancel_tx: watch::Sender<bool>,
    state_tx: watch::Sender<TaskState>,
    traces: Vec<ExecutionTrace>,
    commitments: Vec<ComputeCommitment>,
    verifications: Vec<VerificationResult>,
}

impl TaskRecord {
    fn apply(&mut self, event: TaskEvent) -> Result<TaskState, InvalidTransition> {
        let next = self.state.apply(&event)?;
        info!(
            task_id = %self.descriptor.task_id,
            from = self.state.name(),
            to = next.name(),
            attempt = next.attempt(),
            "task transition"
        );
        self.state = next;
        self.state_tx.send_replace(next);
        Ok(next)
    }

    /// Park a task whose driver hit an illegal transition so waiters resolve
    fn fail_stuck(&mut self, err: &InvalidTransition) {
        if self.state.is_terminal() {
            return;
        }
        let next = TaskState::Failed { attempt: self.state.attempt() };
        error!(
            task_id = %self.descriptor.task_id,
            from = self.state.name(),
            "task driver stopped: {}",
            err
        );
        self.last_error = Some(ErrorReport {
            kind: ErrorKind::InvalidTransition,
            message: err.to_string(),
        });
        self.state = next;
        self.state_tx.send_replace(next);
    }
}

type Record = Arc<Mutex<TaskRecord>>;

fn lock(record: &Record) -> MutexGuard<'_, TaskRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    config: PipelineConfig,
    executor: Executor,
    builder: CommitmentBuilder,
    verifier: VerifierClient,
    ledger: Arc<SettlementLedger>,
    tasks: Mutex<HashMap<TaskId, Record>>,
    leases: LeaseTable,
    workers: Semaphore,
    escalation_tx: mpsc::UnboundedSender<Escalation>,
    escalation_rx: Mutex<Option<mpsc::UnboundedReceiver<Escalation>>>,
}

/// Drives tasks through execute, commit, verify and settle
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        executor: Executor,
        builder: CommitmentBuilder,
        verifier: VerifierClient,
        ledger: Arc<SettlementLedger>,
    ) -> Self {
        let (escalation_tx, escalation_rx) = mpsc::unbounded_channel();
        let workers = Semaphore::new(config.concurrency_limit.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                executor,
                builder,
                verifier,
                ledger,
                tasks: Mutex::new(HashMap::new()),
                leases: LeaseTable::new(),
                workers,
                escalation_tx,
                escalation_rx: Mutex::new(Some(escalation_rx)),
            }),
        }
    }

    pub fn ledger(&self) -> &Arc<SettlementLedger> {
        &self.inner.ledger
    }

    /// Take the escalation stream; only the first caller gets it
    pub fn escalations(&self) -> Option<mpsc::UnboundedReceiver<Escalation>> {
        self.inner
            .escalation_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Record>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, task_id: TaskId) -> Option<Record> {
        self.tasks().get(&task_id).cloned()
    }

    /// Accept a task and start driving it. Must be called inside a Tokio runtime.
    pub fn submit_task(&self, descriptor: TaskDescriptor) -> Result<TaskId, SubmitError> {
        let task_id = descriptor.task_id;
        if descriptor.max_budget.is_negative() {
            return Err(SubmitError::InvalidBudget(descriptor.max_budget));
        }

        let mut tasks = self.tasks();
        if tasks.contains_key(&task_id) {
            return Err(SubmitError::DuplicateTask(task_id));
        }
        let lease = self
            .inner
            .leases
            .try_acquire(task_id)
            .ok_or(SubmitError::DuplicateTask(task_id))?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(TaskState::Created);
        let record = Arc::new(Mutex::new(TaskRecord {
            descriptor: descriptor.clone(),
            state: TaskState::Created,
            last_error: None,
            cancel_requested: false,
            cancel_tx,
            state_tx,
            traces: Vec::new(),
            commitments: Vec::new(),
            verifications: Vec::new(),
        }));
        tasks.insert(task_id, record.clone());
        drop(tasks);

        info!(
            %task_id,
            agent_id = %descriptor.agent_id,
            kind = descriptor.operation_kind.name(),
            budget = %descriptor.max_budget,
            "task submitted"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.drive(descriptor, record.clone(), lease, cancel_rx).await {
                lock(&record).fail_stuck(&e);
            }
        });

        Ok(task_id)
    }

    pub fn task_status(&self, task_id: TaskId) -> Option<TaskStatus> {
        let record = self.record(task_id)?;
        let record = lock(&record);
        Some(TaskStatus {
            task_id,
            state: record.state,
            attempt: record.state.attempt(),
            last_error: record.last_error.clone(),
        })
    }

    /// Request cancellation. Returns false for unknown tasks and for tasks
    /// whose commitment may already be on the wire.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        let Some(record) = self.record(task_id) else {
            return false;
        };
        let mut record = lock(&record);
        if !record.state.is_cancellable() {
            info!(%task_id, state = record.state.name(), "cancel refused");
            return false;
        }

        record.cancel_requested = true;
        record.cancel_tx.send_replace(true);
        if record.state == TaskState::Created {
            // nothing running yet
            if let Err(e) = record.apply(TaskEvent::Cancel) {
                error!(%task_id, "{}", e);
                return false;
            }
        }
        info!(%task_id, "cancel requested");
        true
    }

    /// Resolves once the task reaches a terminal state
    pub async fn wait_for_terminal(&self, task_id: TaskId) -> Option<TaskStatus> {
        let mut rx = {
            let record = self.record(task_id)?;
            let record = lock(&record);
            record.state_tx.subscribe()
        };
        // the sender lives in the record, which outlives this call
        let reached = rx.wait_for(|state| state.is_terminal()).await.is_ok();
        if !reached {
            return None;
        }
        self.task_status(task_id)
    }

    pub async fn audit(&self, task_id: TaskId) -> Option<TaskAudit> {
        let (descriptor, audit) = {
            let record = self.record(task_id)?;
            let record = lock(&record);
            let audit = TaskAudit {
                descriptor: record.descriptor.clone(),
                state: record.state,
                traces: record.traces.clone(),
                commitments: record.commitments.clone(),
                verifications: record.verifications.clone(),
                ledger_entries: Vec::new(),
            };
            (record.descriptor.clone(), audit)
        };
        let ledger_entries = self
            .inner
            .ledger
            .entries_for_task(&descriptor.agent_id, task_id)
            .await;
        Some(TaskAudit { ledger_entries, ..audit })
    }
}

impl Inner {
    fn escalate(&self, task: &TaskDescriptor, attempt: u32, reason: EscalationReason, error: ErrorReport) {
        warn!(
            task_id = %task.task_id,
            agent_id = %task.agent_id,
            attempt,
            ?reason,
            "escalating: {}",
            error.message
        );
        // a dropped receiver means nobody is listening
        let _ = self.escalation_tx.send(Escalation {
            task_id: task.task_id,
            agent_id: task.agent_id.clone(),
            attempt,
            reason,
            error,
        });
    }

    async fn drive(
        &self,
        task: TaskDescriptor,
        record: Record,
        _lease: TaskLease,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), InvalidTransition> {
        let _permit = tokio::select! {
            permit = self.workers.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(task_id = %task.task_id, "worker pool closed");
                    return Ok(());
                }
            },
            _ = async {
                let _ = cancel.wait_for(|cancelled| *cancelled).await;
            } => return Ok(()),
        };

        {
            let mut rec = lock(&record);
            if rec.state.is_terminal() {
                return Ok(());
            }
            rec.apply(TaskEvent::Dispatch)?;
        }

        let max_attempts = self.config.max_attempts;
        // the trace and commitment currently being verified
        let mut committed: Option<(ExecutionTrace, ComputeCommitment)> = None;

        loop {
            let state = lock(&record).state;
            match state {
                TaskState::Executing { attempt } => {
                    let outcome = self.executor.execute_with_cancel(&task, attempt, cancel.clone()).await;
                    let mut rec = lock(&record);

                    let trace = match outcome {
                        Ok(trace) => trace,
                        Err(failure) => {
                            let unconfirmed = failure.trace.side_effect.is_pending();
                            rec.traces.push(failure.trace);
                            rec.last_error = Some(ErrorReport::from(&failure.error));
                            if unconfirmed {
                                // the effect may have landed; neither retry nor cancel is safe
                                let error = ErrorReport::from(&failure.error);
                                rec.apply(TaskEvent::ExecutionFailed { retry: false })?;
                                drop(rec);
                                self.escalate(&task, attempt, EscalationReason::SideEffectUnconfirmed, error);
                                return Ok(());
                            }
                            if rec.cancel_requested {
                                rec.apply(TaskEvent::Cancel)?;
                                return Ok(());
                            }
                            let retry = attempt < max_attempts;
                            rec.apply(TaskEvent::ExecutionFailed { retry })?;
                            if !retry {
                                let error = ErrorReport::from(&failure.error);
                                drop(rec);
                                self.escalate(&task, attempt, EscalationReason::Exhausted, error);
                                return Ok(());
                            }
                            continue;
                        }
                    };

                    rec.traces.push(trace.clone());
                    if rec.cancel_requested && !trace.side_effect.is_completed() {
                        rec.apply(TaskEvent::Cancel)?;
                        return Ok(());
                    }

                    match self.builder.build(&task, &trace) {
                        Ok(commitment) => {
                            info!(
                                task_id = %task.task_id,
                                attempt,
                                digest = ?commitment.digest,
                                "commitment built"
                            );
                            rec.commitments.push(commitment.clone());
                            rec.apply(TaskEvent::Committed)?;
                            committed = Some((trace, commitment));
                        }
                        Err(e) => {
                            rec.last_error = Some(ErrorReport::from(&e));
                            rec.apply(TaskEvent::CommitFailed)?;
                            return Ok(());
                        }
                    }
                }

                TaskState::Committed { attempt } => {
                    let Some((trace, commitment)) = committed.clone() else {
                        // unreachable by construction: Committed always follows a build
                        lock(&record).apply(TaskEvent::CommitFailed)?;
                        return Ok(());
                    };
                    lock(&record).apply(TaskEvent::Submit)?;

                    let outcome = self.verifier.submit(&commitment).await;
                    match outcome {
                        Ok(result) => {
                            lock(&record).verifications.push(result.clone());
                            let settled = self.ledger.settle(&task, &trace, &result).await;
                            let mut rec = lock(&record);
                            match settled {
                                Ok(entry) => {
                                    rec.apply(TaskEvent::Settle {
                                        attempt: result.attempt,
                                        entry_seq: entry.seq,
                                    })?;
                                }
                                Err(e) => {
                                    let report = ErrorReport::from(&e);
                                    rec.last_error = Some(report.clone());
                                    rec.apply(TaskEvent::SettlementFailed)?;
                                    drop(rec);
                                    self.escalate(&task, attempt, EscalationReason::Unpaid, report);
                                }
                            }
                            return Ok(());
                        }
                        Err(VerificationError::Rejected(result)) => {
                            let report = ErrorReport::from(&VerificationError::Rejected(result.clone()));
                            let mut rec = lock(&record);
                            rec.verifications.push(*result);
                            rec.last_error = Some(report.clone());
                            rec.apply(TaskEvent::Reject)?;
                            drop(rec);
                            if trace.side_effect.is_completed() {
                                self.escalate(&task, attempt, EscalationReason::SideEffectRejected, report);
                            }
                            return Ok(());
                        }
                        Err(e) => {
                            let report = ErrorReport::from(&e);
                            let retry = attempt < max_attempts;
                            let resubmit = trace.side_effect.is_completed();
                            let mut rec = lock(&record);
                            rec.last_error = Some(report.clone());
                            rec.apply(TaskEvent::SubmissionFailed { retry, resubmit })?;
                            drop(rec);
                            if !retry {
                                self.escalate(&task, attempt, EscalationReason::Exhausted, report);
                                return Ok(());
                            }
                            if !resubmit {
                                committed = None;
                            }
                        }
                    }
                }

                TaskState::Retrying { attempt, resubmit } => {
                    let mut rec = lock(&record);
                    if rec.cancel_requested && !resubmit {
                        rec.apply(TaskEvent::Cancel)?;
                        return Ok(());
                    }
                    info!(task_id = %task.task_id, attempt = attempt + 1, resubmit, "retrying");
                    rec.apply(TaskEvent::Retry)?;
                }

                TaskState::Created | TaskState::Submitted { .. } => {
                    // Created is left before the loop; Submitted is resolved inline
                    return Err(InvalidTransition {
                        from: state.name(),
                        event: TaskEvent::Retry,
                    });
                }

                TaskState::Settled { .. }
                | TaskState::Failed { .. }
                | TaskState::Rejected { .. }
                | TaskState::Cancelled
                | TaskState::Disputed { .. } => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veritask_common::{OperationKind, Payload};

    fn record(state: TaskState) -> (TaskRecord, watch::Receiver<TaskState>) {
        let (cancel_tx, _) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(state);
        let record = TaskRecord {
            descriptor: TaskDescriptor::new(
                AgentId::new("agent-s"),
                OperationKind::Compute,
                Payload::empty("none"),
                Amount::from_units(1),
            ),
            state,
            last_error: None,
            cancel_requested: false,
            cancel_tx,
            state_tx,
            traces: Vec::new(),
            commitments: Vec::new(),
            verifications: Vec::new(),
        };
        (record, state_rx)
    }

    #[test]
    fn test_stuck_driver_fails_task() {
        let (mut rec, state_rx) = record(TaskState::Submitted { attempt: 2 });
        let err = rec.apply(TaskEvent::Retry).unwrap_err();

        rec.fail_stuck(&err);
        assert_eq!(rec.state, TaskState::Failed { attempt: 2 });
        assert!(state_rx.borrow().is_terminal());
        let report = rec.last_error.clone().unwrap();
        assert_eq!(report.kind, ErrorKind::InvalidTransition);
        assert!(report.message.contains("submitted"));
    }

    #[test]
    fn test_stuck_driver_keeps_terminal_state() {
        let settled = TaskState::Settled { attempt: 1, entry_seq: 3 };
        let (mut rec, _state_rx) = record(settled);
        let err = InvalidTransition { from: "settled", event: TaskEvent::Retry };

        rec.fail_stuck(&err);
        assert_eq!(rec.state, settled);
        assert!(rec.last_error.is_none());
    }
}
