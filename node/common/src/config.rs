use crate::amount::Amount;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pipeline settings consumed by the orchestrator and its components
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_attempts: u32,
    pub execution_timeout_ms: u64,
    pub concurrency_limit: usize,
    pub ledger_floor: Amount,
    pub fuel_limit: u64,
    pub memory_limit: u64,
    pub max_output_size: usize,
    pub verification: VerificationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            execution_timeout_ms: 30_000,
            concurrency_limit: 16,
            ledger_floor: Amount::ZERO,
            fuel_limit: 10_000_000,
            memory_limit: 16 * 1024 * 1024,
            max_output_size: 64 * 1024,
            verification: VerificationConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.execution_timeout_ms == 0 {
            bail!("execution_timeout_ms must be positive");
        }
        if self.concurrency_limit == 0 {
            bail!("concurrency_limit must be at least 1");
        }

        // Memory limits (pages of 64KB, 64MB engine ceiling)
        const PAGE_SIZE: u64 = 65536;
        if self.memory_limit < PAGE_SIZE || self.memory_limit > 64 * 1024 * 1024 {
            bail!("invalid memory limit: {} bytes", self.memory_limit);
        }
        if self.fuel_limit == 0 || self.fuel_limit > u64::MAX / 2 {
            bail!("invalid fuel limit: {}", self.fuel_limit);
        }

        self.verification.validate()
    }
}

/// Verifier submission and confirmation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub max_submit_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_base: f64,
    pub confirmation_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_submit_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_base: 2.0,
            confirmation_timeout_ms: 120_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl VerificationConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_submit_attempts == 0 {
            bail!("max_submit_attempts must be at least 1");
        }
        if self.backoff_base < 1.0 {
            bail!("backoff_base must be >= 1.0, got {}", self.backoff_base);
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be positive");
        }
        Ok(())
    }
}
