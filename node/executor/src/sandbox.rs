use crate::operation::{ExecutionContext, Operation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use veritask_common::{ExecutionError, TaskDescriptor};
use wasmparser::{Validator, WasmFeatures};
use wasmtime::*;

pub const COMPUTE_SCHEMA: &str = "veritask.compute.v1";

const PAGE_SIZE: u64 = 65536;
const MAX_MODULE_SIZE: usize = 24 * 1024;
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Resource ceilings for a single module run
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub fuel_limit: u64,
    pub memory_limit: u64,
    pub max_output_size: usize,
    pub timeout: Duration,
}

impl SandboxLimits {
    fn epoch_ticks(&self) -> u64 {
        (self.timeout.as_millis() / EPOCH_TICK.as_millis()) as u64 + 1
    }
}

/// Outcome of a module run, with usage reported even when the run traps
#[derive(Debug)]
pub struct SandboxRun {
    pub outcome: Result<Vec<u8>, ExecutionError>,
    pub fuel_consumed: u64,
    pub memory_high_watermark: u64,
}

/// Advances the engine epoch so long-running modules hit their deadline
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        std::thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                std::thread::sleep(EPOCH_TICK);
                engine.increment_epoch();
            }
        });
        Self { stop }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Deterministic Wasm sandbox
pub struct WasmSandbox {
    engine: Engine,
    _ticker: EpochTicker,
}

impl WasmSandbox {
    /// Create sandbox with deterministic settings
    pub fn new() -> anyhow::Result<Self> {
        let mut config = Config::new();

        // Determinism settings
        config.wasm_threads(false);
        config.wasm_simd(false);
        config.wasm_relaxed_simd(false);
        config.wasm_reference_types(false);
        config.cranelift_nan_canonicalization(true);
        config.consume_fuel(true);
        config.epoch_interruption(true);

        // Memory limits
        config.static_memory_maximum_size(64 * 1024 * 1024); // 64MB max
        config.max_wasm_stack(1024 * 1024); // 1MB stack

        let engine = Engine::new(&config)?;
        let ticker = EpochTicker::start(engine.clone());
        Ok(Self { engine, _ticker: ticker })
    }

    /// Validate Wasm module for determinism
    pub fn validate(&self, wasm: &[u8]) -> Result<(), ExecutionError> {
        // Size constraint (24KB max for on-chain storage)
        if wasm.len() > MAX_MODULE_SIZE {
            return Err(ExecutionError::ResourceExceeded(format!(
                "module exceeds 24KB limit: {} bytes",
                wasm.len()
            )));
        }

        if wasm.len() < 8 || &wasm[0..4] != b"\0asm" {
            return Err(ExecutionError::OperationFailure("invalid wasm magic".into()));
        }
        if wasm[4..8] != [1, 0, 0, 0] {
            return Err(ExecutionError::OperationFailure("unsupported wasm version".into()));
        }

        // Float types and instructions are rejected outright
        let features = WasmFeatures {
            floats: false,
            simd: false,
            relaxed_simd: false,
            threads: false,
            reference_types: false,
            ..WasmFeatures::default()
        };
        Validator::new_with_features(features)
            .validate_all(wasm)
            .map_err(|e| ExecutionError::OperationFailure(format!("module rejected: {}", e)))?;

        Ok(())
    }

    /// Execute Wasm with resource limits
    pub fn execute(&self, wasm: &[u8], input: &[u8], limits: &SandboxLimits) -> SandboxRun {
        let mut store = Store::new(&self.engine, ());
        let mut memory = None;

        let outcome = self.run(&mut store, &mut memory, wasm, input, limits);

        let fuel_consumed = store
            .get_fuel()
            .map(|left| limits.fuel_limit.saturating_sub(left))
            .unwrap_or(0);
        let memory_high_watermark = memory
            .map(|m: Memory| m.data_size(&store) as u64)
            .unwrap_or(0);

        SandboxRun {
            outcome,
            fuel_consumed,
            memory_high_watermark,
        }
    }

    fn run(
        &self,
        store: &mut Store<()>,
        memory_out: &mut Option<Memory>,
        wasm: &[u8],
        input: &[u8],
        limits: &SandboxLimits,
    ) -> Result<Vec<u8>, ExecutionError> {
        let module = Module::new(&self.engine, wasm).map_err(operation_failure)?;

        // Set fuel with bounds check
        if limits.fuel_limit == 0 || limits.fuel_limit > u64::MAX / 2 {
            return Err(ExecutionError::OperationFailure(format!(
                "invalid fuel limit: {}",
                limits.fuel_limit
            )));
        }
        store.set_fuel(limits.fuel_limit).map_err(operation_failure)?;
        store.set_epoch_deadline(limits.epoch_ticks());

        // Memory limits (pages of 64KB)
        let mut linker = Linker::new(&self.engine);
        let max_pages = (limits.memory_limit / PAGE_SIZE) as u32;
        let memory_ty = MemoryType::new(1, Some(max_pages));
        let memory = Memory::new(&mut *store, memory_ty).map_err(operation_failure)?;
        *memory_out = Some(memory);
        linker
            .define(&mut *store, "env", "memory", memory)
            .map_err(operation_failure)?;

        let instance = linker
            .instantiate(&mut *store, &module)
            .map_err(|e| classify_trap(e, limits))?;

        let main = instance
            .get_typed_func::<(i32, i32), i32>(&mut *store, "main")
            .map_err(operation_failure)?;

        // Write input to memory
        if input.len() > memory.data_size(&*store) {
            return Err(ExecutionError::ResourceExceeded(format!(
                "input of {} bytes does not fit initial memory",
                input.len()
            )));
        }
        memory
            .write(&mut *store, 0, input)
            .map_err(|e| operation_failure(e.into()))?;

        let output_ptr = main
            .call(&mut *store, (0, input.len() as i32))
            .map_err(|e| classify_trap(e, limits))? as u32 as usize;

        // Output layout: u32 little-endian length, then the bytes
        let mut len_bytes = [0u8; 4];
        memory
            .read(&*store, output_ptr, &mut len_bytes)
            .map_err(|e| ExecutionError::OperationFailure(format!("output pointer out of bounds: {}", e)))?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > limits.max_output_size {
            return Err(ExecutionError::ResourceExceeded(format!(
                "output of {} bytes exceeds {} byte limit",
                len, limits.max_output_size
            )));
        }

        let mut output = vec![0u8; len];
        memory
            .read(&*store, output_ptr + 4, &mut output)
            .map_err(|e| ExecutionError::OperationFailure(format!("output out of bounds: {}", e)))?;

        Ok(output)
    }
}

fn operation_failure(e: anyhow::Error) -> ExecutionError {
    ExecutionError::OperationFailure(format!("{:#}", e))
}

fn classify_trap(e: anyhow::Error, limits: &SandboxLimits) -> ExecutionError {
    match e.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => {
            ExecutionError::ResourceExceeded(format!("fuel limit {} exhausted", limits.fuel_limit))
        }
        Some(Trap::Interrupt) => ExecutionError::Timeout {
            limit_ms: limits.timeout.as_millis() as u64,
        },
        _ => operation_failure(e),
    }
}

/// Payload of a `compute` task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeRequest {
    #[serde(with = "hex")]
    pub module: Vec<u8>,
    #[serde(with = "hex")]
    pub input: Vec<u8>,
}

/// Runs `compute` tasks inside the sandbox
pub struct WasmCompute {
    sandbox: Arc<WasmSandbox>,
}

impl WasmCompute {
    pub fn new(sandbox: Arc<WasmSandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Operation for WasmCompute {
    async fn run(
        &self,
        task: &TaskDescriptor,
        ctx: &ExecutionContext,
    ) -> Result<Vec<u8>, ExecutionError> {
        let request: ComputeRequest = ctx.decode_payload(task, COMPUTE_SCHEMA)?;
        self.sandbox.validate(&request.module)?;

        let limits = SandboxLimits {
            fuel_limit: ctx.limits().fuel_limit,
            memory_limit: ctx.limits().memory_limit,
            max_output_size: ctx.limits().max_output_size,
            timeout: ctx.limits().timeout,
        };

        // Wasm runs on a blocking thread so other tasks keep making progress
        let sandbox = self.sandbox.clone();
        let run = tokio::task::spawn_blocking(move || {
            sandbox.execute(&request.module, &request.input, &limits)
        })
        .await
        .map_err(|e| ExecutionError::OperationFailure(format!("sandbox thread failed: {}", e)))?;

        debug!(
            task_id = %task.task_id,
            fuel = run.fuel_consumed,
            memory = run.memory_high_watermark,
            "wasm run finished"
        );

        ctx.add_fuel(run.fuel_consumed);
        ctx.observe_memory(run.memory_high_watermark);
        run.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO: &str = r#"
        (module
          (import "env" "memory" (memory 1))
          (func (export "main") (param $ptr i32) (param $len i32) (result i32)
            (i32.store (i32.const 1024) (local.get $len))
            (memory.copy (i32.const 1028) (local.get $ptr) (local.get $len))
            (i32.const 1024)))
    "#;

    const SPIN: &str = r#"
        (module
          (import "env" "memory" (memory 1))
          (func (export "main") (param i32 i32) (result i32)
            (loop $l (br $l))
            (i32.const 0)))
    "#;

    const FLOATS: &str = r#"
        (module
          (import "env" "memory" (memory 1))
          (func (export "main") (param i32 i32) (result i32)
            (drop (f32.add (f32.const 1) (f32.const 2)))
            (i32.const 0)))
    "#;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            fuel_limit: 1_000_000,
            memory_limit: 1024 * 1024,
            max_output_size: 4096,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_echo_is_deterministic() {
        let sandbox = WasmSandbox::new().unwrap();
        let wasm = wat::parse_str(ECHO).unwrap();
        sandbox.validate(&wasm).unwrap();

        let first = sandbox.execute(&wasm, b"agent input", &limits());
        let second = sandbox.execute(&wasm, b"agent input", &limits());

        assert_eq!(first.outcome.as_deref().unwrap(), b"agent input");
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.fuel_consumed, second.fuel_consumed);
        assert!(first.fuel_consumed > 0);
        assert_eq!(first.memory_high_watermark, PAGE_SIZE);
    }

    #[test]
    fn test_fuel_exhaustion_is_resource_exceeded() {
        let sandbox = WasmSandbox::new().unwrap();
        let wasm = wat::parse_str(SPIN).unwrap();

        let run = sandbox.execute(&wasm, b"", &SandboxLimits { fuel_limit: 10_000, ..limits() });
        assert!(matches!(run.outcome, Err(ExecutionError::ResourceExceeded(_))));
        assert_eq!(run.fuel_consumed, 10_000);
    }

    #[test]
    fn test_epoch_deadline_is_timeout() {
        let sandbox = WasmSandbox::new().unwrap();
        let wasm = wat::parse_str(SPIN).unwrap();

        let run = sandbox.execute(
            &wasm,
            b"",
            &SandboxLimits {
                fuel_limit: u64::MAX / 4,
                timeout: Duration::from_millis(50),
                ..limits()
            },
        );
        assert!(matches!(run.outcome, Err(ExecutionError::Timeout { limit_ms: 50 })));
    }

    #[test]
    fn test_float_modules_rejected() {
        let sandbox = WasmSandbox::new().unwrap();
        let wasm = wat::parse_str(FLOATS).unwrap();
        assert!(matches!(
            sandbox.validate(&wasm),
            Err(ExecutionError::OperationFailure(_))
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let sandbox = WasmSandbox::new().unwrap();
        assert!(sandbox.validate(b"not wasm at all").is_err());
    }

    #[test]
    fn test_output_limit_enforced() {
        let sandbox = WasmSandbox::new().unwrap();
        let wasm = wat::parse_str(ECHO).unwrap();
        let run = sandbox.execute(
            &wasm,
            &[1u8; 64],
            &SandboxLimits { max_output_size: 16, ..limits() },
        );
        assert!(matches!(run.outcome, Err(ExecutionError::ResourceExceeded(_))));
    }
}
