use async_trait::async_trait;
use ethers::types::{Address, BlockId, BlockNumber, H256};
use serde::{Deserialize, Serialize};

use crate::core::errors::ReconcileError;

/// Block at which a state query is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

impl From<BlockTag> for BlockId {
    fn from(tag: BlockTag) -> Self {
        match tag {
            BlockTag::Latest => BlockId::Number(BlockNumber::Latest),
            BlockTag::Number(n) => BlockId::Number(BlockNumber::Number(n.into())),
        }
    }
}

/// A transaction the node reports as mined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: H256,
    pub block_number: u64,
}

/// Read-only view of the ledger needed to reconcile confirmations.
///
/// Implementations answer queries for historical blocks on a best-effort basis;
/// only transport failures are reported as errors.
#[async_trait]
pub trait ChainOracle: Send + Sync {
    /// Latest known block height.
    async fn current_block_number(&self) -> Result<u64, ReconcileError>;

    /// Mined transaction by hash. `None` when the node does not know it, or
    /// knows it but has not mined it yet.
    async fn transaction_by_hash(&self, hash: H256)
        -> Result<Option<TransactionRecord>, ReconcileError>;

    /// Whether `owner` approved `contract_transaction_hash` on `safe` as of `block`.
    async fn is_hash_approved(
        &self,
        safe: Address,
        owner: Address,
        contract_transaction_hash: H256,
        block: BlockTag,
    ) -> Result<bool, ReconcileError>;

    /// The Safe's nonce as of `block`.
    async fn safe_nonce(&self, safe: Address, block: BlockTag) -> Result<u64, ReconcileError>;

    /// Returns the name of the network (e.g., "ethereum", "gnosis").
    fn network_name(&self) -> &str;
}
