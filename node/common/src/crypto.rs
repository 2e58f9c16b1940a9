use crate::types::ComputeCommitment;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use ethers::types::H256;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Compute SHA256 hash
pub fn sha256(data: &[u8]) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    H256::from_slice(&hasher.finalize())
}

pub const ED25519_SCHEME: &str = "ed25519";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("unsupported signature scheme: {0}")]
    UnsupportedScheme(String),
    #[error("malformed public key")]
    MalformedKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature verification failed: {0}")]
    Invalid(String),
}

/// Signing capability bound to the executing node's identity
pub trait ProverSigner: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn public_key(&self) -> Vec<u8>;

    fn sign(&self, digest: &H256) -> Vec<u8>;
}

/// Ed25519 prover key
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(seed))
    }

    /// Parse a hex-encoded 32-byte seed (optional `0x` prefix)
    pub fn from_hex(seed: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(seed.trim_start_matches("0x"))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("prover key must be 32 bytes"))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl ProverSigner for Ed25519Signer {
    fn scheme(&self) -> &'static str {
        ED25519_SCHEME
    }

    fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }

    fn sign(&self, digest: &H256) -> Vec<u8> {
        self.signing_key.sign(digest.as_bytes()).to_bytes().to_vec()
    }
}

/// Verify Ed25519 signature
pub fn verify_signature(
    msg: &[u8],
    signature: &[u8; 64],
    public_key: &VerifyingKey,
) -> Result<(), SignatureError> {
    let sig = Signature::from_bytes(signature);
    public_key
        .verify_strict(msg, &sig)
        .map_err(|e| SignatureError::Invalid(e.to_string()))
}

/// Check a commitment's signature over its digest with its embedded key
pub fn verify_commitment(commitment: &ComputeCommitment) -> Result<(), SignatureError> {
    if commitment.scheme != ED25519_SCHEME {
        return Err(SignatureError::UnsupportedScheme(commitment.scheme.clone()));
    }

    let key: [u8; 32] = commitment
        .prover_key
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::MalformedKey)?;
    let public_key = VerifyingKey::from_bytes(&key).map_err(|_| SignatureError::MalformedKey)?;

    let signature: [u8; 64] = commitment
        .prover_signature
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::MalformedSignature)?;

    verify_signature(commitment.digest.as_bytes(), &signature, &public_key)
}
