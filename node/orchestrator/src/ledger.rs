//! Append-only settlement ledger.
//!
//! Each agent has its own book behind an async mutex, so appends for one
//! agent are totally ordered while different agents settle in parallel.
//! Balances are never stored; they are the fold of the book's entries.

use crate::commitment::commitment_digest;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use veritask_common::{
    AgentId, Amount, CostPolicy, ExecStatus, ExecutionTrace, LedgerEntry, LedgerError,
    LedgerReason, TaskDescriptor, TaskId, Verdict, VerificationResult,
};

#[derive(Debug, Default)]
struct AgentBook {
    entries: Vec<LedgerEntry>,
    /// task -> index of its settlement entry
    settled: HashMap<TaskId, usize>,
}

impl AgentBook {
    fn balance(&self) -> Amount {
        self.entries.last().map(|e| e.balance_after).unwrap_or(Amount::ZERO)
    }

    fn append(
        &mut self,
        agent_id: &AgentId,
        task_id: Option<TaskId>,
        attempt: u32,
        amount: Amount,
        reason: LedgerReason,
    ) -> Result<LedgerEntry, LedgerError> {
        let balance_after = self.balance().checked_add(amount).ok_or(LedgerError::Overflow)?;
        let entry = LedgerEntry {
            seq: self.entries.len() as u64,
            agent_id: agent_id.clone(),
            task_id,
            attempt,
            amount,
            reason,
            balance_after,
            recorded_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }
}

/// Replaying a book found an entry whose `balance_after` disagrees with the fold
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("entry {seq} records balance {recorded}, replay gives {replayed}")]
pub struct ReplayMismatch {
    pub seq: u64,
    pub recorded: Amount,
    pub replayed: Amount,
}

/// Fold entries in order, checking every recorded running balance
pub fn replay_balance(entries: &[LedgerEntry]) -> Result<Amount, ReplayMismatch> {
    let mut balance = Amount::ZERO;
    for entry in entries {
        balance = balance.saturating_add(entry.amount);
        if balance != entry.balance_after {
            return Err(ReplayMismatch {
                seq: entry.seq,
                recorded: entry.balance_after,
                replayed: balance,
            });
        }
    }
    Ok(balance)
}

fn check_binding(
    task: &TaskDescriptor,
    trace: &ExecutionTrace,
    result: &VerificationResult,
) -> Result<(), LedgerError> {
    for found in [trace.task_id, result.task_id] {
        if found != task.task_id {
            return Err(LedgerError::TaskMismatch { expected: task.task_id, found });
        }
    }
    if trace.attempt != result.attempt {
        return Err(LedgerError::AttemptMismatch {
            trace: trace.attempt,
            verdict: result.attempt,
        });
    }
    if trace.status != ExecStatus::Success {
        return Err(LedgerError::UnsuccessfulTrace(trace.status));
    }
    if result.digest != commitment_digest(task, trace) {
        return Err(LedgerError::DigestMismatch);
    }
    Ok(())
}

pub struct SettlementLedger {
    floor: Amount,
    cost_policy: Arc<dyn CostPolicy>,
    books: RwLock<HashMap<AgentId, Arc<Mutex<AgentBook>>>>,
}

impl SettlementLedger {
    pub fn new(floor: Amount, cost_policy: Arc<dyn CostPolicy>) -> Self {
        Self {
            floor,
            cost_policy,
            books: RwLock::new(HashMap::new()),
        }
    }

    pub fn floor(&self) -> Amount {
        self.floor
    }

    async fn book(&self, agent_id: &AgentId) -> Arc<Mutex<AgentBook>> {
        if let Some(book) = self.books.read().await.get(agent_id) {
            return book.clone();
        }
        self.books
            .write()
            .await
            .entry(agent_id.clone())
            .or_default()
            .clone()
    }

    /// Debit for an attempt: the policy's price, capped at the task's budget
    pub fn quote(&self, task: &TaskDescriptor, trace: &ExecutionTrace) -> Amount {
        let cost = self.cost_policy.cost(&task.operation_kind, &trace.resource_usage);
        cost.clamp(Amount::ZERO, task.max_budget.max(Amount::ZERO))
    }

    /// Top up an agent's compute budget
    pub async fn deposit(&self, agent_id: &AgentId, amount: Amount) -> Result<LedgerEntry, LedgerError> {
        if amount <= Amount::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let book = self.book(agent_id).await;
        let mut book = book.lock().await;
        let entry = book.append(agent_id, None, 0, amount, LedgerReason::Deposit)?;
        info!(agent_id = %agent_id, %amount, balance = %entry.balance_after, "deposit recorded");
        Ok(entry)
    }

    /// Debit the agent for a verified attempt.
    ///
    /// The verdict must be an acceptance of exactly this trace: same task, same
    /// attempt, and a digest that commits to the pair.
    /// Settling the same (task, attempt) again returns the original entry.
    /// A task settles at most once, whatever the attempt.
    pub async fn settle(
        &self,
        task: &TaskDescriptor,
        trace: &ExecutionTrace,
        result: &VerificationResult,
    ) -> Result<LedgerEntry, LedgerError> {
        if result.verdict != Verdict::Accepted {
            return Err(LedgerError::NotAccepted(result.verdict));
        }
        check_binding(task, trace, result)?;

        let agent_id = &task.agent_id;
        let book = self.book(agent_id).await;
        let mut book = book.lock().await;

        if let Some(&index) = book.settled.get(&task.task_id) {
            let existing = &book.entries[index];
            if existing.attempt == result.attempt {
                return Ok(existing.clone());
            }
            return Err(LedgerError::AlreadySettled {
                task_id: task.task_id,
                attempt: existing.attempt,
            });
        }

        let debit = self.quote(task, trace);
        let balance = book.balance();
        let remaining = balance.checked_sub(debit).ok_or(LedgerError::Overflow)?;
        if remaining < self.floor {
            warn!(
                agent_id = %agent_id,
                task_id = %task.task_id,
                %balance,
                %debit,
                floor = %self.floor,
                "settlement would breach floor"
            );
            return Err(LedgerError::InsufficientBudget {
                balance,
                debit,
                floor: self.floor,
            });
        }

        let amount = debit.checked_neg().ok_or(LedgerError::Overflow)?;
        let entry = book.append(
            agent_id,
            Some(task.task_id),
            result.attempt,
            amount,
            LedgerReason::DebitForCompute,
        )?;
        let index = book.entries.len() - 1;
        book.settled.insert(task.task_id, index);

        info!(
            agent_id = %agent_id,
            task_id = %task.task_id,
            attempt = result.attempt,
            %amount,
            balance = %entry.balance_after,
            "settled"
        );
        Ok(entry)
    }

    /// Credit an agent back for a disputed task
    pub async fn refund(
        &self,
        agent_id: &AgentId,
        task_id: TaskId,
        attempt: u32,
        amount: Amount,
    ) -> Result<LedgerEntry, LedgerError> {
        if amount <= Amount::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let book = self.book(agent_id).await;
        let mut book = book.lock().await;
        let entry = book.append(agent_id, Some(task_id), attempt, amount, LedgerReason::CreditRefund)?;
        info!(agent_id = %agent_id, task_id = %task_id, %amount, "refund recorded");
        Ok(entry)
    }

    pub async fn balance(&self, agent_id: &AgentId) -> Amount {
        match self.books.read().await.get(agent_id) {
            Some(book) => book.lock().await.balance(),
            None => Amount::ZERO,
        }
    }

    pub async fn entries(&self, agent_id: &AgentId) -> Vec<LedgerEntry> {
        match self.books.read().await.get(agent_id) {
            Some(book) => book.lock().await.entries.clone(),
            None => Vec::new(),
        }
    }

    pub async fn entries_for_task(&self, agent_id: &AgentId, task_id: TaskId) -> Vec<LedgerEntry> {
        self.entries(agent_id)
            .await
            .into_iter()
            .filter(|e| e.task_id == Some(task_id))
            .collect()
    }

    /// The debit entry for a task, if it settled
    pub async fn settlement_for(&self, agent_id: &AgentId, task_id: TaskId) -> Option<LedgerEntry> {
        let books = self.books.read().await;
        let book = books.get(agent_id)?.lock().await;
        let entry = book.settled.get(&task_id).map(|&i| book.entries[i].clone());
        entry
    }
}
