//! Reorg-aware reconciliation of a single owner confirmation.
//!
//! A confirmation is checked against two views of the chain: the latest block
//! and the block `reorg_blocks` behind it. An approval that was present in the
//! older view, is gone from the latest one and is not explained by the Safe
//! executing the transaction was erased by a reorg.

use ethers::types::{Address, H256};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::blockchain::traits::{BlockTag, ChainOracle};
use crate::core::config::ReconcilerConfig;
use crate::core::domain::{
    ConfirmationKey, MultisigConfirmation, MultisigTransaction, Outcome, StoredConfirmation,
};
use crate::core::errors::{ReconcileError, Result};
use crate::storage::ConfirmationStore;

/// Chain state gathered for one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSnapshot {
    /// Safe nonce at the latest block moved past the transaction nonce.
    pub is_executed_latest: bool,
    /// Approval hash present in contract storage at the latest block.
    pub is_approved_latest: bool,
    /// Approval hash present at the reorg-safe block.
    pub is_approved_safe: bool,
}

impl ChainSnapshot {
    /// Approved at the safe block, neither approved nor executed now.
    ///
    /// Approval hashes are cleared from storage when the transaction executes,
    /// so a missing approval only means a reorg if the nonce did not advance.
    pub fn indicates_reorg(&self) -> bool {
        self.is_approved_safe && !self.is_approved_latest && !self.is_executed_latest
    }
}

/// Applies the on-chain status of stored confirmations to the store.
pub struct Reconciler {
    oracle: Arc<dyn ChainOracle>,
    store: Arc<dyn ConfirmationStore>,
    reorg_blocks: u64,
}

impl Reconciler {
    pub fn new(
        oracle: Arc<dyn ChainOracle>,
        store: Arc<dyn ConfirmationStore>,
        reorg_blocks: u64,
    ) -> Self {
        Self { oracle, store, reorg_blocks }
    }

    pub fn from_config(
        oracle: Arc<dyn ChainOracle>,
        store: Arc<dyn ConfirmationStore>,
        config: &ReconcilerConfig,
    ) -> Self {
        Self::new(oracle, store, config.reorg_blocks)
    }

    pub fn reorg_blocks(&self) -> u64 {
        self.reorg_blocks
    }

    pub async fn reconcile_key(&self, key: &ConfirmationKey, allow_retry: bool) -> Result<Outcome> {
        self.reconcile(
            key.safe,
            key.contract_transaction_hash,
            key.transaction_hash,
            key.owner,
            allow_retry,
        )
        .await
    }

    /// Decide the on-chain status of one confirmation and apply it to the store.
    ///
    /// Returns [`Outcome::RetryScheduled`] (or [`Outcome::NoOp`] when
    /// `allow_retry` is false) if nothing could be decided yet. Fails with
    /// [`ReconcileError::Integrity`] before touching the store if the
    /// confirmation belongs to another Safe.
    #[instrument(level = "debug", skip(self))]
    pub async fn reconcile(
        &self,
        safe: Address,
        contract_transaction_hash: H256,
        transaction_hash: H256,
        owner: Address,
        allow_retry: bool,
    ) -> Result<Outcome> {
        let current_block = self.oracle.current_block_number().await?;
        let safe_block = current_block.saturating_sub(self.reorg_blocks);

        let Some(StoredConfirmation { confirmation, transaction }) =
            self.store.find(contract_transaction_hash, owner, transaction_hash).await?
        else {
            warn!(
                "Multisig confirmation for safe={:?} and transaction_hash={:?} does not exist",
                safe, transaction_hash
            );
            return Ok(Outcome::NotFound);
        };

        if transaction.safe != safe {
            error!(
                expected = ?safe,
                found = ?transaction.safe,
                confirmation_id = confirmation.id,
                "Confirmation belongs to another safe"
            );
            return Err(ReconcileError::Integrity { expected: safe, found: transaction.safe });
        }

        let snapshot = self.snapshot(&confirmation, &transaction, safe_block).await?;
        debug!(current_block, safe_block, ?snapshot, "Chain state");

        let mut block_updated = false;
        match self.oracle.transaction_by_hash(transaction_hash).await? {
            Some(record) => {
                if record.block_number != confirmation.block_number {
                    if snapshot.indicates_reorg() {
                        return self.delete_orphaned(&confirmation, allow_retry).await;
                    }
                    if !self.store.update_block_number(&confirmation, record.block_number).await? {
                        debug!("Confirmation changed concurrently, leaving it for the next check");
                        return Ok(undetermined(allow_retry));
                    }
                    info!(
                        old_block = confirmation.block_number,
                        new_block = record.block_number,
                        "Confirmation moved to another block"
                    );
                    block_updated = true;
                }

                // The latest-block flags were read before the update above and are still used.
                if snapshot.is_executed_latest {
                    if !transaction.mined && self.store.mark_transaction_mined(&transaction).await? {
                        info!(nonce = transaction.nonce, "Multisig transaction marked as mined");
                    }
                    return Ok(Outcome::MarkedTransactionMined);
                }
                if snapshot.is_approved_latest {
                    if self.store.mark_confirmation_mined(&confirmation).await? {
                        info!(owner = ?confirmation.owner, "Confirmation marked as mined");
                    }
                    return Ok(Outcome::MarkedConfirmationMined);
                }
            }
            None => {
                let unseen_for = current_block.saturating_sub(confirmation.block_number);
                if unseen_for > self.reorg_blocks {
                    debug!(unseen_for, "Transaction unknown past the reorg window");
                    return self.delete_orphaned(&confirmation, allow_retry).await;
                }
            }
        }

        Ok(match (allow_retry, block_updated) {
            (true, _) => Outcome::RetryScheduled,
            (false, true) => Outcome::BlockNumberUpdated,
            (false, false) => Outcome::NoOp,
        })
    }

    async fn snapshot(
        &self,
        confirmation: &MultisigConfirmation,
        transaction: &MultisigTransaction,
        safe_block: u64,
    ) -> Result<ChainSnapshot> {
        let safe = transaction.safe;
        let (nonce_latest, is_approved_latest, is_approved_safe) = futures::try_join!(
            self.oracle.safe_nonce(safe, BlockTag::Latest),
            self.oracle.is_hash_approved(
                safe,
                confirmation.owner,
                confirmation.contract_transaction_hash,
                BlockTag::Latest,
            ),
            self.oracle.is_hash_approved(
                safe,
                confirmation.owner,
                confirmation.contract_transaction_hash,
                BlockTag::Number(safe_block),
            ),
        )?;

        Ok(ChainSnapshot {
            is_executed_latest: transaction.is_executed_at(nonce_latest),
            is_approved_latest,
            is_approved_safe,
        })
    }

    async fn delete_orphaned(
        &self,
        confirmation: &MultisigConfirmation,
        allow_retry: bool,
    ) -> Result<Outcome> {
        if self.store.delete(confirmation).await? {
            info!(
                confirmation_id = confirmation.id,
                block_number = confirmation.block_number,
                "Reorg detected, confirmation removed"
            );
            Ok(Outcome::Deleted)
        } else {
            debug!("Confirmation changed concurrently, leaving it for the next check");
            Ok(undetermined(allow_retry))
        }
    }
}

fn undetermined(allow_retry: bool) -> Outcome {
    if allow_retry {
        Outcome::RetryScheduled
    } else {
        Outcome::NoOp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(true, false, false => true ; "approval erased by reorg")]
    #[test_case(true, false, true => false ; "approval cleared by execution")]
    #[test_case(true, true, false => false ; "still approved")]
    #[test_case(false, false, false => false ; "never approved at safe block")]
    #[test_case(false, true, false => false ; "approved only recently")]
    fn reorg_signature(approved_safe: bool, approved_latest: bool, executed: bool) -> bool {
        ChainSnapshot {
            is_executed_latest: executed,
            is_approved_latest: approved_latest,
            is_approved_safe: approved_safe,
        }
        .indicates_reorg()
    }

    #[test]
    fn undetermined_respects_retry_flag() {
        assert_eq!(undetermined(true), Outcome::RetryScheduled);
        assert_eq!(undetermined(false), Outcome::NoOp);
    }
}
