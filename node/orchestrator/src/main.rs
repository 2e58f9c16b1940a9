use anyhow::{bail, Context, Result};
use clap::Parser;
use ed25519_dalek::SigningKey;
use ethers::types::Address;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use veritask_common::{
    contracts::TokenClient, crypto::Ed25519Signer, AgentId, Amount, MeteredCostPolicy,
    OperationKind, Payload, PipelineConfig, TaskDescriptor,
};
use veritask_executor::{ChainActions, Executor};
use veritask_orchestrator::{CommitmentBuilder, Orchestrator, SettlementLedger};
use veritask_verifier::{connect_signer, OnChainVerifier, SimulatedVerifier, VerifierBackend, VerifierClient};

#[derive(Parser, Debug)]
#[command(name = "veritaskd", about = "Execute agent tasks, prove them and settle their cost")]
struct Args {
    /// Chain RPC endpoint
    #[arg(long, env = "ARBITRUM_RPC")]
    rpc: Option<String>,

    /// Wallet key used for verifier and token calls
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// ProofVerifier contract address; without it a simulated verifier is used
    #[arg(long, env = "VERIFIER_ADDRESS")]
    verifier: Option<String>,

    /// Settlement token address, enables transfer tasks
    #[arg(long, env = "TOKEN_ADDRESS")]
    token: Option<String>,

    /// Staking pool address, enables stake tasks
    #[arg(long, env = "STAKING_ADDRESS")]
    staking: Option<String>,

    /// Hex ed25519 seed for signing commitments (random if omitted)
    #[arg(long, env = "PROVER_KEY", hide_env_values = true)]
    prover_key: Option<String>,

    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    #[arg(long, default_value_t = 30_000)]
    execution_timeout_ms: u64,

    #[arg(long, default_value_t = 16)]
    concurrency_limit: usize,

    #[arg(long, default_value = "0")]
    ledger_floor: Amount,

    #[arg(long, default_value_t = 10_000_000)]
    fuel_limit: u64,

    /// Initial budget as agent:amount, repeatable
    #[arg(long = "deposit", value_parser = parse_deposit)]
    deposits: Vec<(AgentId, Amount)>,
}

fn parse_deposit(s: &str) -> Result<(AgentId, Amount), String> {
    let (agent, amount) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected agent:amount, got {}", s))?;
    let amount = amount.parse::<Amount>().map_err(|e| e.to_string())?;
    Ok((AgentId::new(agent), amount))
}

/// One line of stdin
#[derive(Debug, Deserialize)]
struct TaskRequest {
    agent_id: AgentId,
    operation_kind: OperationKind,
    payload: Payload,
    max_budget: Amount,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = PipelineConfig {
        max_attempts: args.max_attempts,
        execution_timeout_ms: args.execution_timeout_ms,
        concurrency_limit: args.concurrency_limit,
        ledger_floor: args.ledger_floor,
        fuel_limit: args.fuel_limit,
        ..PipelineConfig::default()
    };
    config.validate()?;

    info!("Starting veritaskd");

    let signer = match &args.prover_key {
        Some(seed) => Ed25519Signer::from_hex(seed).context("invalid prover key")?,
        None => {
            warn!("no prover key given, generating an ephemeral one");
            Ed25519Signer::new(SigningKey::generate(&mut rand::rngs::OsRng))
        }
    };

    let client = match (&args.rpc, &args.private_key) {
        (Some(rpc), Some(key)) => Some(connect_signer(rpc, key).await?),
        (None, None) => None,
        _ => bail!("--rpc and --private-key must be given together"),
    };

    let backend: Arc<dyn VerifierBackend> = match (&client, &args.verifier) {
        (Some(client), Some(addr)) => Arc::new(OnChainVerifier::connect(client.clone(), addr)?),
        _ => {
            info!("using simulated verifier");
            Arc::new(SimulatedVerifier::new())
        }
    };

    let chain: Option<Arc<dyn ChainActions>> = match (&client, &args.token, &args.staking) {
        (Some(client), Some(token), Some(staking)) => {
            let token = Address::from_str(token).context("invalid token address")?;
            let staking = Address::from_str(staking).context("invalid staking address")?;
            Some(Arc::new(TokenClient::new(token, staking, client.clone())) as Arc<dyn ChainActions>)
        }
        _ => None,
    };

    let ledger = Arc::new(SettlementLedger::new(
        config.ledger_floor,
        Arc::new(MeteredCostPolicy::default()),
    ));
    for (agent, amount) in &args.deposits {
        ledger.deposit(agent, *amount).await?;
    }

    let orchestrator = Orchestrator::new(
        config.clone(),
        Executor::with_builtins(&config, chain)?,
        CommitmentBuilder::new(Arc::new(signer)),
        VerifierClient::new(backend, &config.verification),
        ledger,
    );

    if let Some(mut escalations) = orchestrator.escalations() {
        tokio::spawn(async move {
            while let Some(escalation) = escalations.recv().await {
                match serde_json::to_string(&serde_json::json!({ "escalation": escalation })) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("failed to encode escalation: {}", e),
                }
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: TaskRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("skipping malformed task request: {}", e);
                continue;
            }
        };

        let descriptor = TaskDescriptor::new(
            request.agent_id,
            request.operation_kind,
            request.payload,
            request.max_budget,
        );
        let task_id = match orchestrator.submit_task(descriptor) {
            Ok(task_id) => task_id,
            Err(e) => {
                warn!("task refused: {}", e);
                continue;
            }
        };

        let orchestrator = orchestrator.clone();
        pending.push(tokio::spawn(async move {
            if let Some(status) = orchestrator.wait_for_terminal(task_id).await {
                match serde_json::to_string(&status) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(%task_id, "failed to encode status: {}", e),
                }
            }
        }));
    }

    for handle in pending {
        handle.await?;
    }

    info!("all tasks finished");
    Ok(())
}
