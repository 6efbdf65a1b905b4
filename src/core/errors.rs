//! Error types shared by the reconciler, its adapters and the worker binary.

use ethers::types::Address;
use thiserror::Error;

/// Errors that cross the reconciler boundary.
///
/// Domain-level ambiguity (confirmation missing, state still undetermined) is
/// never an error; it is reported through [`crate::core::domain::Outcome`].
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The stored confirmation belongs to another Safe than the one requested.
    #[error("Integrity violation: confirmation belongs to safe {found:?}, expected {expected:?}")]
    Integrity { expected: Address, found: Address },

    /// RPC / transport failures while querying the chain.
    #[error("Blockchain error: {0}")]
    Blockchain(String),

    /// Persistence failures.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed address, hash or stored value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ReconcileError {
    /// Whether the caller may re-run the invocation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Blockchain(_) | ReconcileError::Storage(_))
    }

    /// Whether the error points at corrupted data or a caller bug.
    pub fn is_critical(&self) -> bool {
        matches!(self, ReconcileError::Integrity { .. })
    }
}

impl From<sqlx::Error> for ReconcileError {
    fn from(err: sqlx::Error) -> Self {
        ReconcileError::Storage(err.to_string())
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
