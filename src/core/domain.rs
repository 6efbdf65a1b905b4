//! Domain records for Safe multisig transactions and their owner confirmations.

use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The Safe transaction being collectively approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigTransaction {
    /// Safe transaction hash (the hash owners approve).
    pub contract_transaction_hash: H256,
    pub safe: Address,
    /// Sequence number within the Safe.
    pub nonce: u64,
    pub mined: bool,
}

impl MultisigTransaction {
    /// A transaction is executed once the Safe's on-chain nonce moved past it.
    pub fn is_executed_at(&self, safe_nonce: u64) -> bool {
        self.nonce < safe_nonce
    }
}

/// One owner's approval of a [`MultisigTransaction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigConfirmation {
    /// Store row id.
    pub id: i64,
    pub contract_transaction_hash: H256,
    /// Hash of the on-chain `approveHash` transaction, absent until submitted.
    pub transaction_hash: Option<H256>,
    pub owner: Address,
    /// Block at which the approval was last observed.
    pub block_number: u64,
    pub mined: bool,
}

/// A confirmation loaded together with its parent transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConfirmation {
    pub confirmation: MultisigConfirmation,
    pub transaction: MultisigTransaction,
}

/// Everything needed to (re)run one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfirmationKey {
    pub safe: Address,
    pub contract_transaction_hash: H256,
    pub transaction_hash: H256,
    pub owner: Address,
}

impl fmt::Display for ConfirmationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "safe={:?} safe_tx_hash={:?} tx_hash={:?} owner={:?}",
            self.safe, self.contract_transaction_hash, self.transaction_hash, self.owner
        )
    }
}

/// Result of a single reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// The confirmation was orphaned by a reorg and removed.
    Deleted,
    /// The parent transaction is executed and marked mined.
    MarkedTransactionMined,
    /// The owner's approval is on chain and the confirmation is marked mined.
    MarkedConfirmationMined,
    /// The approval moved to another block; nothing else could be decided.
    BlockNumberUpdated,
    /// Still undetermined, the caller should check again later.
    RetryScheduled,
    /// Still undetermined and retries are disabled.
    NoOp,
    /// No confirmation matches the key.
    NotFound,
}

impl Outcome {
    pub fn is_retry(&self) -> bool {
        matches!(self, Outcome::RetryScheduled)
    }

    /// Whether the store was mutated.
    pub fn mutated_store(&self) -> bool {
        matches!(
            self,
            Outcome::Deleted
                | Outcome::MarkedTransactionMined
                | Outcome::MarkedConfirmationMined
                | Outcome::BlockNumberUpdated
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Deleted => "deleted",
            Outcome::MarkedTransactionMined => "transaction_mined",
            Outcome::MarkedConfirmationMined => "confirmation_mined",
            Outcome::BlockNumberUpdated => "block_number_updated",
            Outcome::RetryScheduled => "retry_scheduled",
            Outcome::NoOp => "noop",
            Outcome::NotFound => "not_found",
        };
        f.write_str(s)
    }
}
