use crate::operation::{ChainActions, ChainOperation, ContextSnapshot, ExecutionContext, ExecutionLimits, Operation};
use crate::sandbox::{WasmCompute, WasmSandbox};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use veritask_common::{
    ExecStatus, ExecutionError, ExecutionTrace, OperationKind, PipelineConfig, ResourceUsage,
    SideEffect, TaskDescriptor,
};

/// Set to `true` to abort an attempt
pub type CancelSignal = watch::Receiver<bool>;

/// A failed attempt: the trace is kept for audit, the error explains it
#[derive(Debug, Clone, Error)]
#[error("task {} attempt {}: {}", .trace.task_id, .trace.attempt, .error)]
pub struct ExecutionFailure {
    pub trace: ExecutionTrace,
    pub error: ExecutionError,
}

/// Runs tasks and records what happened
pub struct Executor {
    operations: HashMap<OperationKind, Arc<dyn Operation>>,
    limits: ExecutionLimits,
}

impl Executor {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            operations: HashMap::new(),
            limits,
        }
    }

    pub fn limits_from_config(config: &PipelineConfig) -> ExecutionLimits {
        ExecutionLimits {
            timeout: config.execution_timeout(),
            fuel_limit: config.fuel_limit,
            memory_limit: config.memory_limit,
            max_output_size: config.max_output_size,
        }
    }

    /// Executor with the built-in handlers: wasm compute, and transfer/stake
    /// when chain access is available
    pub fn with_builtins(
        config: &PipelineConfig,
        chain: Option<Arc<dyn ChainActions>>,
    ) -> anyhow::Result<Self> {
        let sandbox = Arc::new(WasmSandbox::new()?);
        let mut executor = Self::new(Self::limits_from_config(config))
            .with_operation(OperationKind::Compute, WasmCompute::new(sandbox));

        if let Some(chain) = chain {
            executor = executor
                .with_operation(OperationKind::Transfer, ChainOperation::transfer(chain.clone()))
                .with_operation(OperationKind::Stake, ChainOperation::stake(chain));
        }

        Ok(executor)
    }

    pub fn with_operation(mut self, kind: OperationKind, operation: impl Operation + 'static) -> Self {
        self.register(kind, Arc::new(operation));
        self
    }

    pub fn register(&mut self, kind: OperationKind, operation: Arc<dyn Operation>) {
        self.operations.insert(kind, operation);
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Execute one attempt without a cancellation source
    pub async fn execute(
        &self,
        task: &TaskDescriptor,
        attempt: u32,
    ) -> Result<ExecutionTrace, ExecutionFailure> {
        let (_keep, cancel) = watch::channel(false);
        self.execute_with_cancel(task, attempt, cancel).await
    }

    /// Execute one attempt, aborting on timeout or when `cancel` flips to `true`.
    ///
    /// A side effect recorded by the operation before the abort turns the
    /// attempt into a success: the effect is real and must be committed.
    /// A side effect still pending stays a failure, but the trace carries it
    /// so the caller knows the attempt must not be repeated blindly.
    pub async fn execute_with_cancel(
        &self,
        task: &TaskDescriptor,
        attempt: u32,
        mut cancel: CancelSignal,
    ) -> Result<ExecutionTrace, ExecutionFailure> {
        let ctx = ExecutionContext::new(self.limits);
        let started_at = Utc::now();
        let clock = Instant::now();

        info!(task_id = %task.task_id, attempt, kind = task.operation_kind.name(), "executing");

        let outcome = match self.operations.get(&task.operation_kind) {
            None => Err(ExecutionError::OperationFailure(format!(
                "no handler registered for operation {}",
                task.operation_kind.name()
            ))),
            Some(operation) => {
                tokio::select! {
                    biased;
                    _ = wait_cancelled(&mut cancel) => Err(ExecutionError::Cancelled),
                    result = tokio::time::timeout(self.limits.timeout, operation.run(task, &ctx)) => {
                        result.unwrap_or(Err(ExecutionError::Timeout {
                            limit_ms: self.limits.timeout.as_millis() as u64,
                        }))
                    }
                }
            }
        };

        let snapshot = ctx.snapshot();
        let usage = ResourceUsage {
            cpu_time_us: clock.elapsed().as_micros() as u64,
            memory_high_watermark: snapshot.memory_high_watermark,
            external_calls: snapshot.external_calls.len() as u32,
            fuel_consumed: snapshot.fuel_consumed,
        };

        let outcome = outcome.and_then(|output| self.check_ceilings(&usage, output));
        let outcome = match (outcome, &snapshot.side_effect) {
            (Err(error), SideEffect::Completed { receipt }) => {
                warn!(
                    task_id = %task.task_id,
                    attempt,
                    %error,
                    "side effect already completed, recording attempt as success"
                );
                Ok(receipt.clone())
            }
            (Err(error), SideEffect::Pending { .. }) => {
                warn!(
                    task_id = %task.task_id,
                    attempt,
                    %error,
                    "side effect broadcast but unconfirmed"
                );
                Err(error)
            }
            (outcome, _) => outcome,
        };

        let ContextSnapshot { external_calls, side_effect, .. } = snapshot;
        let mut trace = ExecutionTrace {
            task_id: task.task_id,
            attempt,
            started_at,
            finished_at: Utc::now(),
            output_payload: Vec::new(),
            resource_usage: usage,
            status: ExecStatus::Success,
            external_calls,
            side_effect,
        };

        match outcome {
            Ok(output) => {
                trace.output_payload = output;
                info!(
                    task_id = %task.task_id,
                    attempt,
                    cpu_us = usage.cpu_time_us,
                    fuel = usage.fuel_consumed,
                    "execution succeeded"
                );
                Ok(trace)
            }
            Err(error) => {
                trace.status = error.trace_status();
                warn!(task_id = %task.task_id, attempt, %error, "execution failed");
                Err(ExecutionFailure { trace, error })
            }
        }
    }

    fn check_ceilings(&self, usage: &ResourceUsage, output: Vec<u8>) -> Result<Vec<u8>, ExecutionError> {
        if usage.memory_high_watermark > self.limits.memory_limit {
            return Err(ExecutionError::ResourceExceeded(format!(
                "memory high watermark {} exceeds {}",
                usage.memory_high_watermark, self.limits.memory_limit
            )));
        }
        if output.len() > self.limits.max_output_size {
            return Err(ExecutionError::ResourceExceeded(format!(
                "output of {} bytes exceeds {}",
                output.len(),
                self.limits.max_output_size
            )));
        }
        Ok(output)
    }
}

async fn wait_cancelled(cancel: &mut CancelSignal) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // sender gone: cancellation can no longer arrive
            std::future::pending::<()>().await;
        }
    }
}
