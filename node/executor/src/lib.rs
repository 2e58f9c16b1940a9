pub mod executor;
pub mod operation;
pub mod sandbox;

pub use executor::{CancelSignal, ExecutionFailure, Executor};
pub use operation::{
    ChainActions, ChainOperation, ExecutionContext, ExecutionLimits, Operation, ValueRequest,
    STAKE_SCHEMA, TRANSFER_SCHEMA,
};
pub use sandbox::{ComputeRequest, WasmCompute, WasmSandbox, COMPUTE_SCHEMA};
