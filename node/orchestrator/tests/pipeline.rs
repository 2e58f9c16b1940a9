use async_trait::async_trait;
use ethers::types::{Address, H256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use veritask_common::{
    contracts::TxReceipt, crypto::Ed25519Signer, AgentId, Amount, CostPolicy, ErrorKind, ExecStatus, ExecutionError,
    LedgerReason, MeteredCostPolicy, OperationKind, Payload, PipelineConfig, ResourceUsage, SideEffect,
    TaskDescriptor, TaskId, Verdict, VerificationConfig,
};
use veritask_executor::{
    ChainActions, ChainOperation, ComputeRequest, ExecutionContext, Executor, Operation, ValueRequest,
    COMPUTE_SCHEMA, TRANSFER_SCHEMA,
};
use veritask_orchestrator::{
    commitment_digest, replay_balance, CommitmentBuilder, EscalationReason, Orchestrator,
    SettlementLedger, SubmitError, TaskState,
};
use veritask_verifier::{SimulatedVerifier, VerifierClient};

/// Succeeds after timing out on its first `hang_first` calls
struct Flaky {
    calls: AtomicU32,
    hang_first: u32,
}

impl Flaky {
    fn new(hang_first: u32) -> Self {
        Self { calls: AtomicU32::new(0), hang_first }
    }
}

#[async_trait]
impl Operation for Flaky {
    async fn run(&self, _: &TaskDescriptor, ctx: &ExecutionContext) -> Result<Vec<u8>, ExecutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.add_fuel(1_000);
        if call <= self.hang_first {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        Ok(format!("call {}", call).into_bytes())
    }
}

/// Moves value in the outside world and reports the receipt
struct Wire {
    calls: AtomicU32,
}

#[async_trait]
impl Operation for Wire {
    async fn run(&self, _: &TaskDescriptor, ctx: &ExecutionContext) -> Result<Vec<u8>, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.record_call("bank.wire", b"send 5".to_vec(), b"ok".to_vec());
        ctx.complete_side_effect(b"wire-7781".to_vec());
        Ok(b"wire-7781".to_vec())
    }
}

struct Stuck;

#[async_trait]
impl Operation for Stuck {
    async fn run(&self, _: &TaskDescriptor, _: &ExecutionContext) -> Result<Vec<u8>, ExecutionError> {
        std::future::pending().await
    }
}

/// Broadcasts instantly; the receipt takes longer than any attempt is allowed
struct SlowChain {
    sends: Arc<AtomicU32>,
}

#[async_trait]
impl ChainActions for SlowChain {
    async fn send_transfer(&self, _to: Address, _amount: Amount) -> anyhow::Result<H256> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(H256::repeat_byte(0x5e))
    }

    async fn send_stake(&self, _validator: Address, _amount: Amount) -> anyhow::Result<H256> {
        anyhow::bail!("not used")
    }

    async fn confirm(&self, tx_hash: H256) -> anyhow::Result<TxReceipt> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(TxReceipt { tx_hash, block: 1 })
    }
}

fn config(max_attempts: u32) -> PipelineConfig {
    PipelineConfig {
        max_attempts,
        execution_timeout_ms: 100,
        concurrency_limit: 8,
        verification: VerificationConfig {
            max_submit_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_base: 2.0,
            confirmation_timeout_ms: 2_000,
            poll_interval_ms: 5,
        },
        ..PipelineConfig::default()
    }
}

fn flat_cost(micros: i64) -> Arc<dyn CostPolicy> {
    Arc::new(move |_: &OperationKind, _: &ResourceUsage| Amount::from_micros(micros))
}

fn pipeline(
    config: PipelineConfig,
    operation: impl Operation + 'static,
    sim: Arc<SimulatedVerifier>,
    cost: Arc<dyn CostPolicy>,
) -> Orchestrator {
    let executor = Executor::new(Executor::limits_from_config(&config))
        .with_operation(OperationKind::Compute, operation);
    let ledger = Arc::new(SettlementLedger::new(config.ledger_floor, cost));
    let verifier = VerifierClient::new(sim, &config.verification);
    let builder = CommitmentBuilder::new(Arc::new(Ed25519Signer::from_seed(&[5u8; 32])));
    Orchestrator::new(config, executor, builder, verifier, ledger)
}

fn task(agent: &str, budget: Amount) -> TaskDescriptor {
    TaskDescriptor::new(
        AgentId::new(agent),
        OperationKind::Compute,
        Payload::new("test.v1", b"{}".to_vec()),
        budget,
    )
}

async fn wait_for_state(orch: &Orchestrator, id: TaskId, name: &str) {
    for _ in 0..500 {
        if orch.task_status(id).map(|s| s.state.name()) == Some(name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task never reached {}", name);
}

#[tokio::test]
async fn test_accepted_task_debits_cost() {
    let sim = Arc::new(SimulatedVerifier::new());
    let orch = pipeline(config(3), Flaky::new(0), sim, flat_cost(4_500_000));
    let agent = AgentId::new("agent-a");
    orch.ledger().deposit(&agent, Amount::from_units(20)).await.unwrap();

    let id = orch.submit_task(task("agent-a", Amount::from_units(10))).unwrap();
    let status = orch.wait_for_terminal(id).await.unwrap();

    let entry = orch.ledger().settlement_for(&agent, id).await.unwrap();
    assert_eq!(status.state, TaskState::Settled { attempt: 1, entry_seq: entry.seq });
    assert_eq!(status.last_error, None);
    assert_eq!(entry.amount, "-4.500000".parse().unwrap());
    assert_eq!(entry.reason, LedgerReason::DebitForCompute);
    assert_eq!(entry.balance_after, Amount::from_micros(15_500_000));
}

#[tokio::test]
async fn test_two_timeouts_then_settled() {
    let sim = Arc::new(SimulatedVerifier::new());
    let mut cfg = config(3);
    cfg.ledger_floor = Amount::from_units(-100);
    let orch = pipeline(cfg, Flaky::new(2), sim, flat_cost(1_000_000));

    let id = orch.submit_task(task("agent-b", Amount::from_units(10))).unwrap();
    let status = orch.wait_for_terminal(id).await.unwrap();
    assert!(matches!(status.state, TaskState::Settled { attempt: 3, .. }));

    let audit = orch.audit(id).await.unwrap();
    let statuses: Vec<_> = audit.traces.iter().map(|t| t.status).collect();
    assert_eq!(statuses, vec![ExecStatus::TimedOut, ExecStatus::TimedOut, ExecStatus::Success]);
    assert_eq!(audit.commitments.len(), 1);
    assert_eq!(audit.commitments[0].attempt, 3);
    assert_eq!(audit.ledger_entries.len(), 1);
    assert_eq!(audit.ledger_entries[0].attempt, 3);
}

#[tokio::test]
async fn test_submission_failure_exhausts_attempts() {
    let sim = Arc::new(SimulatedVerifier::new());
    sim.set_unavailable(true);
    let orch = pipeline(config(2), Flaky::new(0), sim, flat_cost(1));
    let mut escalations = orch.escalations().unwrap();

    let id = orch.submit_task(task("agent-c", Amount::from_units(10))).unwrap();
    let status = orch.wait_for_terminal(id).await.unwrap();

    assert_eq!(status.state, TaskState::Failed { attempt: 2 });
    assert_eq!(status.last_error.unwrap().kind, ErrorKind::SubmissionFailure);

    let audit = orch.audit(id).await.unwrap();
    assert_eq!(audit.traces.len(), 2);
    assert!(audit.verifications.is_empty());
    assert!(audit.ledger_entries.is_empty());

    let escalation = escalations.recv().await.unwrap();
    assert_eq!(escalation.task_id, id);
    assert_eq!(escalation.reason, EscalationReason::Exhausted);
}

#[tokio::test]
async fn test_cancel_while_executing() {
    let sim = Arc::new(SimulatedVerifier::new());
    let mut cfg = config(3);
    cfg.execution_timeout_ms = 30_000;
    let orch = pipeline(cfg, Stuck, sim.clone(), flat_cost(1));

    let id = orch.submit_task(task("agent-d", Amount::from_units(10))).unwrap();
    wait_for_state(&orch, id, "executing").await;
    assert!(orch.cancel_task(id));

    let status = orch.wait_for_terminal(id).await.unwrap();
    assert_eq!(status.state, TaskState::Cancelled);
    assert_eq!(status.last_error.unwrap().kind, ErrorKind::Cancelled);

    let audit = orch.audit(id).await.unwrap();
    assert_eq!(audit.traces.len(), 1);
    assert_eq!(audit.traces[0].status, ExecStatus::Cancelled);
    assert!(audit.commitments.is_empty());
    assert!(audit.ledger_entries.is_empty());
    assert_eq!(sim.submission_count(), 0);
    assert!(!orch.cancel_task(id));
}

#[tokio::test]
async fn test_cancel_while_queued() {
    let sim = Arc::new(SimulatedVerifier::new());
    let mut cfg = config(1);
    cfg.execution_timeout_ms = 30_000;
    cfg.concurrency_limit = 1;
    let orch = pipeline(cfg, Stuck, sim, flat_cost(1));

    let running = orch.submit_task(task("agent-e", Amount::from_units(1))).unwrap();
    wait_for_state(&orch, running, "executing").await;

    let queued = orch.submit_task(task("agent-e", Amount::from_units(1))).unwrap();
    assert_eq!(orch.task_status(queued).unwrap().state, TaskState::Created);
    assert!(orch.cancel_task(queued));
    assert_eq!(orch.task_status(queued).unwrap().state, TaskState::Cancelled);
    assert!(orch.audit(queued).await.unwrap().traces.is_empty());

    assert!(orch.cancel_task(running));
    orch.wait_for_terminal(running).await.unwrap();
}

#[tokio::test]
async fn test_no_cancel_once_submitted() {
    let sim = Arc::new(SimulatedVerifier::new());
    sim.hold_pending(true);
    let mut cfg = config(3);
    cfg.ledger_floor = Amount::from_units(-10);
    let orch = pipeline(cfg, Flaky::new(0), sim.clone(), flat_cost(2_000_000));

    let id = orch.submit_task(task("agent-f", Amount::from_units(10))).unwrap();
    wait_for_state(&orch, id, "submitted").await;
    assert!(!orch.cancel_task(id));

    let digest = orch.audit(id).await.unwrap().commitments[0].digest;
    sim.decide(digest, Verdict::Accepted);

    let status = orch.wait_for_terminal(id).await.unwrap();
    assert!(matches!(status.state, TaskState::Settled { attempt: 1, .. }));
}

#[tokio::test]
async fn test_rejected_verdict_never_settles() {
    let sim = Arc::new(SimulatedVerifier::new());
    sim.reject_all(true);
    let orch = pipeline(config(3), Flaky::new(0), sim, flat_cost(1_000_000));
    let agent = AgentId::new("agent-g");
    orch.ledger().deposit(&agent, Amount::from_units(5)).await.unwrap();

    let id = orch.submit_task(task("agent-g", Amount::from_units(10))).unwrap();
    let status = orch.wait_for_terminal(id).await.unwrap();

    assert_eq!(status.state, TaskState::Rejected { attempt: 1 });
    assert_eq!(status.last_error.unwrap().kind, ErrorKind::Rejected);

    let audit = orch.audit(id).await.unwrap();
    assert_eq!(audit.verifications.len(), 1);
    assert_eq!(audit.verifications[0].verdict, Verdict::Rejected);
    assert!(audit.ledger_entries.is_empty());
    assert_eq!(orch.ledger().balance(&agent).await, Amount::from_units(5));
}

#[tokio::test]
async fn test_rejected_side_effect_is_escalated() {
    let sim = Arc::new(SimulatedVerifier::new());
    sim.reject_all(true);
    let orch = pipeline(config(3), Wire { calls: AtomicU32::new(0) }, sim, flat_cost(1));
    let mut escalations = orch.escalations().unwrap();

    let id = orch.submit_task(task("agent-h", Amount::from_units(10))).unwrap();
    orch.wait_for_terminal(id).await.unwrap();

    let escalation = escalations.recv().await.unwrap();
    assert_eq!(escalation.reason, EscalationReason::SideEffectRejected);
    assert_eq!(escalation.error.kind, ErrorKind::Rejected);
}

#[tokio::test]
async fn test_unpaid_task_is_disputed() {
    let sim = Arc::new(SimulatedVerifier::new());
    let orch = pipeline(config(3), Flaky::new(0), sim, flat_cost(4_500_000));
    let mut escalations = orch.escalations().unwrap();

    let id = orch.submit_task(task("agent-i", Amount::from_units(10))).unwrap();
    let status = orch.wait_for_terminal(id).await.unwrap();

    assert_eq!(status.state, TaskState::Disputed { attempt: 1 });
    assert_eq!(status.last_error.unwrap().kind, ErrorKind::InsufficientBudget);

    let escalation = escalations.recv().await.unwrap();
    assert_eq!(escalation.reason, EscalationReason::Unpaid);
    assert_eq!(escalation.agent_id, AgentId::new("agent-i"));
    assert!(orch.audit(id).await.unwrap().ledger_entries.is_empty());
}

#[tokio::test]
async fn test_side_effect_resubmitted_not_reexecuted() {
    let sim = Arc::new(SimulatedVerifier::new());
    // exhaust the first submission's retries
    sim.fail_next(2);
    let wire = Wire { calls: AtomicU32::new(0) };
    let mut cfg = config(3);
    cfg.ledger_floor = Amount::from_units(-10);
    let orch = pipeline(cfg, wire, sim.clone(), flat_cost(1_000_000));

    let id = orch.submit_task(task("agent-j", Amount::from_units(10))).unwrap();
    let status = orch.wait_for_terminal(id).await.unwrap();
    assert!(matches!(status.state, TaskState::Settled { attempt: 1, .. }));

    let audit = orch.audit(id).await.unwrap();
    assert_eq!(audit.traces.len(), 1);
    assert_eq!(audit.commitments.len(), 1);
    assert_eq!(audit.ledger_entries.len(), 1);
    assert_eq!(sim.submission_count(), 1);
}

#[tokio::test]
async fn test_unconfirmed_transfer_escalated_not_rebroadcast() {
    let sim = Arc::new(SimulatedVerifier::new());
    let sends = Arc::new(AtomicU32::new(0));
    let chain = Arc::new(SlowChain { sends: sends.clone() });
    let orch = pipeline(config(3), ChainOperation::transfer(chain), sim.clone(), flat_cost(1));
    let mut escalations = orch.escalations().unwrap();

    let request = ValueRequest { to: Address::repeat_byte(9), amount: Amount::from_units(2) };
    let descriptor = TaskDescriptor::new(
        AgentId::new("agent-t"),
        OperationKind::Compute,
        Payload::new(TRANSFER_SCHEMA, serde_json::to_vec(&request).unwrap()),
        Amount::from_units(5),
    );
    let id = orch.submit_task(descriptor).unwrap();
    let status = orch.wait_for_terminal(id).await.unwrap();

    assert_eq!(status.state, TaskState::Failed { attempt: 1 });
    assert_eq!(status.last_error.unwrap().kind, ErrorKind::Timeout);
    assert_eq!(sends.load(Ordering::SeqCst), 1);

    let audit = orch.audit(id).await.unwrap();
    assert_eq!(audit.traces.len(), 1);
    assert_eq!(audit.traces[0].status, ExecStatus::TimedOut);
    assert_eq!(
        audit.traces[0].side_effect,
        SideEffect::Pending { reference: H256::repeat_byte(0x5e).as_bytes().to_vec() }
    );
    assert!(audit.commitments.is_empty());
    assert_eq!(sim.submission_count(), 0);

    let escalation = escalations.recv().await.unwrap();
    assert_eq!(escalation.task_id, id);
    assert_eq!(escalation.attempt, 1);
    assert_eq!(escalation.reason, EscalationReason::SideEffectUnconfirmed);
}

#[tokio::test]
async fn test_verification_timeout_reexecutes() {
    let sim = Arc::new(SimulatedVerifier::new());
    sim.hold_pending(true);
    let mut cfg = config(2);
    cfg.verification.confirmation_timeout_ms = 50;
    let orch = pipeline(cfg, Flaky::new(0), sim.clone(), flat_cost(1));
    let mut escalations = orch.escalations().unwrap();

    let id = orch.submit_task(task("agent-v", Amount::from_units(1))).unwrap();
    let status = orch.wait_for_terminal(id).await.unwrap();

    assert_eq!(status.state, TaskState::Failed { attempt: 2 });
    assert_eq!(status.last_error.unwrap().kind, ErrorKind::VerificationTimeout);

    let audit = orch.audit(id).await.unwrap();
    let outputs: Vec<_> = audit.traces.iter().map(|t| t.output_payload.clone()).collect();
    assert_eq!(outputs, vec![b"call 1".to_vec(), b"call 2".to_vec()]);
    let attempts: Vec<_> = audit.commitments.iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_ne!(audit.commitments[0].digest, audit.commitments[1].digest);
    assert!(audit.verifications.is_empty());
    assert!(audit.ledger_entries.is_empty());
    assert_eq!(sim.submission_count(), 2);

    let escalation = escalations.recv().await.unwrap();
    assert_eq!(escalation.reason, EscalationReason::Exhausted);
    assert_eq!(escalation.error.kind, ErrorKind::VerificationTimeout);
}

#[tokio::test]
async fn test_duplicate_task_refused() {
    let sim = Arc::new(SimulatedVerifier::new());
    let mut cfg = config(1);
    cfg.ledger_floor = Amount::from_units(-10);
    let orch = pipeline(cfg, Flaky::new(0), sim, flat_cost(1));

    let descriptor = task("agent-k", Amount::from_units(1));
    let id = orch.submit_task(descriptor.clone()).unwrap();
    assert_eq!(orch.submit_task(descriptor), Err(SubmitError::DuplicateTask(id)));

    orch.wait_for_terminal(id).await.unwrap();
    assert_eq!(
        orch.ledger().entries_for_task(&AgentId::new("agent-k"), id).await.len(),
        1
    );
}

#[tokio::test]
async fn test_many_tasks_in_flight() {
    let sim = Arc::new(SimulatedVerifier::new());
    let mut cfg = config(3);
    cfg.concurrency_limit = 4;
    let orch = pipeline(cfg, Flaky::new(0), sim, flat_cost(250_000));

    let agents = ["agent-x", "agent-y", "agent-z"];
    for agent in agents {
        orch.ledger().deposit(&AgentId::new(agent), Amount::from_units(100)).await.unwrap();
    }

    let ids: Vec<_> = (0..30)
        .map(|i| orch.submit_task(task(agents[i % agents.len()], Amount::from_units(1))).unwrap())
        .collect();

    for id in &ids {
        let status = orch.wait_for_terminal(*id).await.unwrap();
        assert!(matches!(status.state, TaskState::Settled { .. }), "{:?}", status);
    }

    for agent in agents {
        let agent = AgentId::new(agent);
        let entries = orch.ledger().entries(&agent).await;
        assert_eq!(entries.len(), 11);
        let balance = replay_balance(&entries).unwrap();
        assert_eq!(balance, orch.ledger().balance(&agent).await);
        assert_eq!(balance, Amount::from_micros(97_500_000));
    }
}

const ECHO: &str = r#"
    (module
      (import "env" "memory" (memory 1))
      (func (export "main") (param $ptr i32) (param $len i32) (result i32)
        (i32.store (i32.const 1024) (local.get $len))
        (memory.copy (i32.const 1028) (local.get $ptr) (local.get $len))
        (i32.const 1024)))
"#;

#[tokio::test]
async fn test_wasm_compute_end_to_end() {
    let cfg = PipelineConfig {
        execution_timeout_ms: 5_000,
        ..config(3)
    };
    let executor = Executor::with_builtins(&cfg, None).unwrap();
    let ledger = Arc::new(SettlementLedger::new(
        cfg.ledger_floor,
        Arc::new(MeteredCostPolicy::default()),
    ));
    let orch = Orchestrator::new(
        cfg.clone(),
        executor,
        CommitmentBuilder::new(Arc::new(Ed25519Signer::from_seed(&[6u8; 32]))),
        VerifierClient::new(Arc::new(SimulatedVerifier::new()), &cfg.verification),
        ledger,
    );
    let agent = AgentId::new("agent-w");
    orch.ledger().deposit(&agent, Amount::from_units(10)).await.unwrap();

    let request = ComputeRequest {
        module: wat::parse_str(ECHO).unwrap(),
        input: b"price feed".to_vec(),
    };
    let descriptor = TaskDescriptor::new(
        agent.clone(),
        OperationKind::Compute,
        Payload::new(COMPUTE_SCHEMA, serde_json::to_vec(&request).unwrap()),
        Amount::from_units(1),
    );
    let id = orch.submit_task(descriptor.clone()).unwrap();
    let status = orch.wait_for_terminal(id).await.unwrap();
    assert!(matches!(status.state, TaskState::Settled { attempt: 1, .. }), "{:?}", status);

    let audit = orch.audit(id).await.unwrap();
    let trace = &audit.traces[0];
    assert_eq!(trace.output_payload, b"price feed");
    assert!(trace.resource_usage.fuel_consumed > 0);
    assert_eq!(audit.commitments[0].digest, commitment_digest(&descriptor, trace));

    let debit = orch.ledger().quote(&descriptor, trace);
    assert!(debit > Amount::ZERO);
    assert_eq!(audit.ledger_entries[0].amount, debit.checked_neg().unwrap());
}
