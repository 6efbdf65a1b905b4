// tests/util.rs
// Shared test helpers: a scripted chain oracle and an in-memory confirmation store.
#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, H256};
use parking_lot::Mutex;
use safe_reconciler::blockchain::{BlockTag, ChainOracle, TransactionRecord};
use safe_reconciler::core::domain::{MultisigTransaction, StoredConfirmation};
use safe_reconciler::storage::{ConfirmationStore, NewConfirmation, SqliteConfirmationStore};
use safe_reconciler::{ConfirmationKey, ReconcileError, Reconciler};
use std::collections::HashMap;
use std::sync::Arc;

pub fn safe() -> Address {
    Address::repeat_byte(0x5a)
}

pub fn owner() -> Address {
    Address::repeat_byte(0x0a)
}

pub fn safe_tx_hash() -> H256 {
    H256::repeat_byte(0xc0)
}

pub fn approve_tx_hash() -> H256 {
    H256::repeat_byte(0xa1)
}

/// What the scripted node answers.
#[derive(Debug, Clone, Default)]
pub struct ChainState {
    pub current_block: u64,
    /// Added to `current_block` after every height query.
    pub block_step: u64,
    pub safe_nonce: u64,
    pub approved_latest: bool,
    pub approved_at_safe_block: bool,
    /// Mined transactions by hash.
    pub transactions: HashMap<H256, u64>,
    /// Height queries that fail with a transport error before the node recovers.
    pub failures_left: usize,
}

#[derive(Debug, Default)]
pub struct ScriptedOracle {
    state: Mutex<ChainState>,
    height_queries: Mutex<usize>,
    historical_blocks: Mutex<Vec<u64>>,
}

impl ScriptedOracle {
    pub fn new(state: ChainState) -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(state), ..Default::default() })
    }

    pub fn update(&self, f: impl FnOnce(&mut ChainState)) {
        f(&mut self.state.lock());
    }

    /// One per reconciliation attempt.
    pub fn height_queries(&self) -> usize {
        *self.height_queries.lock()
    }

    pub fn historical_blocks(&self) -> Vec<u64> {
        self.historical_blocks.lock().clone()
    }
}

#[async_trait]
impl ChainOracle for ScriptedOracle {
    async fn current_block_number(&self) -> Result<u64, ReconcileError> {
        *self.height_queries.lock() += 1;
        let mut state = self.state.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(ReconcileError::Blockchain("connection refused".into()));
        }
        let current = state.current_block;
        state.current_block += state.block_step;
        Ok(current)
    }

    async fn transaction_by_hash(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionRecord>, ReconcileError> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .get(&hash)
            .map(|block| TransactionRecord { hash, block_number: *block }))
    }

    async fn is_hash_approved(
        &self,
        _safe: Address,
        _owner: Address,
        _contract_transaction_hash: H256,
        block: BlockTag,
    ) -> Result<bool, ReconcileError> {
        match block {
            BlockTag::Latest => Ok(self.state.lock().approved_latest),
            BlockTag::Number(n) => {
                self.historical_blocks.lock().push(n);
                Ok(self.state.lock().approved_at_safe_block)
            }
        }
    }

    async fn safe_nonce(&self, _safe: Address, _block: BlockTag) -> Result<u64, ReconcileError> {
        Ok(self.state.lock().safe_nonce)
    }

    fn network_name(&self) -> &str {
        "scripted"
    }
}

pub async fn memory_store() -> Arc<SqliteConfirmationStore> {
    Arc::new(SqliteConfirmationStore::new_with_url("sqlite::memory:", 1).await.expect("memory store"))
}

/// Stores a multisig transaction (if new) and one confirmation for it.
pub async fn seed(
    store: &SqliteConfirmationStore,
    contract_transaction_hash: H256,
    nonce: u64,
    owner: Address,
    transaction_hash: H256,
    block_number: u64,
) -> ConfirmationKey {
    store
        .insert_transaction(&MultisigTransaction {
            contract_transaction_hash,
            safe: safe(),
            nonce,
            mined: false,
        })
        .await
        .expect("insert transaction");
    store
        .insert_confirmation(&NewConfirmation {
            contract_transaction_hash,
            transaction_hash: Some(transaction_hash),
            owner,
            block_number,
        })
        .await
        .expect("insert confirmation");

    ConfirmationKey { safe: safe(), contract_transaction_hash, transaction_hash, owner }
}

/// The default fixture: nonce 4, stored at `block_number`.
pub async fn seed_default(store: &SqliteConfirmationStore, block_number: u64) -> ConfirmationKey {
    seed(store, safe_tx_hash(), 4, owner(), approve_tx_hash(), block_number).await
}

pub async fn load(store: &SqliteConfirmationStore, key: &ConfirmationKey) -> Option<StoredConfirmation> {
    store
        .find(key.contract_transaction_hash, key.owner, key.transaction_hash)
        .await
        .expect("find")
}

pub fn reconciler(
    oracle: &Arc<ScriptedOracle>,
    store: &Arc<SqliteConfirmationStore>,
    reorg_blocks: u64,
) -> Reconciler {
    Reconciler::new(oracle.clone(), store.clone(), reorg_blocks)
}
