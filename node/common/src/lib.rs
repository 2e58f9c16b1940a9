pub mod amount;
pub mod canonical;
pub mod config;
pub mod contracts;
pub mod cost;
pub mod crypto;
pub mod error;
pub mod types;

pub use amount::Amount;
pub use config::{PipelineConfig, VerificationConfig};
pub use cost::{CostPolicy, MeteredCostPolicy};
pub use error::{CommitmentError, ErrorKind, ErrorReport, ExecutionError, LedgerError, VerificationError};
pub use types::*;
