pub mod backend;
pub mod retry;
pub mod simulated;
pub mod verifier;

pub use backend::{connect_signer, BackendError, OnChainVerifier, SubmissionReceipt, VerdictStatus, VerifierBackend};
pub use retry::{retry_with_backoff, RetryPolicy, Retryable};
pub use simulated::SimulatedVerifier;
pub use verifier::VerifierClient;
