use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, H256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::domain::{
    ConfirmationKey, MultisigConfirmation, MultisigTransaction, StoredConfirmation,
};
use crate::core::errors::{ReconcileError, Result};

/// Persistence operations the reconciler relies on.
///
/// Every mutation is a single conditional statement so two reconciliations of
/// the same confirmation can't interleave a delete with an update.
#[async_trait]
pub trait ConfirmationStore: Send + Sync {
    /// Confirmation plus its parent transaction, `None` if it does not exist.
    async fn find(
        &self,
        contract_transaction_hash: H256,
        owner: Address,
        transaction_hash: H256,
    ) -> Result<Option<StoredConfirmation>>;

    /// Deletes the row as it was read. Returns `false` if it was removed or
    /// modified concurrently.
    async fn delete(&self, confirmation: &MultisigConfirmation) -> Result<bool>;

    /// Compare-and-swap on the block number read with `confirmation`.
    async fn update_block_number(
        &self,
        confirmation: &MultisigConfirmation,
        new_block: u64,
    ) -> Result<bool>;

    /// Returns `false` when the confirmation was already mined or is gone.
    async fn mark_confirmation_mined(&self, confirmation: &MultisigConfirmation) -> Result<bool>;

    /// Returns `false` when the transaction was already mined.
    async fn mark_transaction_mined(&self, transaction: &MultisigTransaction) -> Result<bool>;

    /// Keys of every confirmation that has an on-chain hash and is not mined yet.
    async fn pending_confirmations(&self) -> Result<Vec<ConfirmationKey>>;
}

/// Input for [`SqliteConfirmationStore::insert_confirmation`].
#[derive(Debug, Clone)]
pub struct NewConfirmation {
    pub contract_transaction_hash: H256,
    pub transaction_hash: Option<H256>,
    pub owner: Address,
    pub block_number: u64,
}

#[derive(Debug, Clone)]
pub struct SqliteConfirmationStore {
    pool: SqlitePool,
    is_memory: bool,
}

impl SqliteConfirmationStore {
    pub async fn new_with_url(database_url: &str, max_connections: u32) -> Result<Self> {
        // normalize sqlite URLs: accept "sqlite:" or "sqlite://"
        let mut db_url = database_url.trim().to_string();
        if db_url.starts_with("sqlite:") && !db_url.starts_with("sqlite://") {
            db_url = db_url.replacen("sqlite:", "sqlite://", 1);
        }
        let is_memory = db_url.contains(":memory:");

        // ensure parent directory exists for file-backed sqlite URLs
        if let Some(path) = db_url.strip_prefix("sqlite://") {
            let path_only = path.split_once('?').map(|(p, _)| p).unwrap_or(path);
            if !is_memory && !path_only.is_empty() {
                if let Some(parent) = std::path::Path::new(path_only).parent() {
                    if !parent.as_os_str().is_empty() {
                        if let Err(e) = std::fs::create_dir_all(parent) {
                            warn!("Failed to create database dir {:?}: {}", parent, e);
                        }
                    }
                }
            }
        }

        let safe_db_url_info = match db_url.split_once("://") {
            Some((scheme, rest)) => format!("{}://(redacted, len={})", scheme, rest.len()),
            None => "(invalid db_url format)".to_string(),
        };
        info!(db = %safe_db_url_info, "[storage] connecting to database");

        let mut connect_options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| ReconcileError::Config(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true);
        if !is_memory {
            connect_options = connect_options
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        // An in-memory database lives as long as its connections; keep exactly one.
        let max_connections = if is_memory { 1 } else { max_connections.max(1) };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(if is_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(if is_memory { None } else { Some(Duration::from_secs(1800)) })
            .connect_with(connect_options)
            .await?;

        let storage = Self { pool, is_memory };
        storage.initialize_schema().await?;

        info!("Confirmation storage initialized");
        Ok(storage)
    }

    pub fn is_in_memory(&self) -> bool {
        self.is_memory
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing database schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS multisig_transactions (
                contract_transaction_hash TEXT PRIMARY KEY,
                safe TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                mined BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS multisig_confirmations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contract_transaction_hash TEXT NOT NULL,
                transaction_hash TEXT,
                owner TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                mined BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                UNIQUE (contract_transaction_hash, owner, transaction_hash),
                FOREIGN KEY (contract_transaction_hash)
                    REFERENCES multisig_transactions (contract_transaction_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_confirmations_tx_hash ON multisig_confirmations (transaction_hash)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_safe ON multisig_transactions (safe, nonce)",
        )
        .execute(&self.pool)
        .await?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Inserts or refreshes a multisig transaction. The mined flag is never reset.
    pub async fn insert_transaction(&self, tx: &MultisigTransaction) -> Result<()> {
        debug!("Storing multisig transaction: {:?}", tx.contract_transaction_hash);

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO multisig_transactions (contract_transaction_hash, safe, nonce, mined, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(contract_transaction_hash) DO UPDATE SET
                safe = excluded.safe,
                nonce = excluded.nonce,
                mined = MAX(mined, excluded.mined),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(hex_string(tx.contract_transaction_hash.as_bytes()))
        .bind(hex_string(tx.safe.as_bytes()))
        .bind(to_i64(tx.nonce, "nonce")?)
        .bind(tx.mined)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stores an owner confirmation and returns its row id.
    pub async fn insert_confirmation(&self, new: &NewConfirmation) -> Result<i64> {
        let now = Utc::now();
        let res = sqlx::query(
            r#"
            INSERT INTO multisig_confirmations
                (contract_transaction_hash, transaction_hash, owner, block_number, mined, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)
            "#,
        )
        .bind(hex_string(new.contract_transaction_hash.as_bytes()))
        .bind(new.transaction_hash.map(|h| hex_string(h.as_bytes())))
        .bind(hex_string(new.owner.as_bytes()))
        .bind(to_i64(new.block_number, "block_number")?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = res.last_insert_rowid();
        debug!(id, "Confirmation stored");
        Ok(id)
    }

    pub async fn get_transaction(
        &self,
        contract_transaction_hash: H256,
    ) -> Result<Option<MultisigTransaction>> {
        let row = sqlx::query(
            "SELECT contract_transaction_hash, safe, nonce, mined FROM multisig_transactions WHERE contract_transaction_hash = ?1",
        )
        .bind(hex_string(contract_transaction_hash.as_bytes()))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<MultisigTransaction> {
            Ok(MultisigTransaction {
                contract_transaction_hash: parse_h256(row.try_get("contract_transaction_hash")?)?,
                safe: parse_address(row.try_get("safe")?)?,
                nonce: to_u64(row.try_get("nonce")?, "nonce")?,
                mined: row.try_get("mined")?,
            })
        })
        .transpose()
    }

    pub async fn count_confirmations(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM multisig_confirmations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    fn stored_from_row(row: &SqliteRow) -> Result<StoredConfirmation> {
        let contract_transaction_hash = parse_h256(row.try_get("contract_transaction_hash")?)?;
        let transaction_hash: Option<String> = row.try_get("transaction_hash")?;

        Ok(StoredConfirmation {
            confirmation: MultisigConfirmation {
                id: row.try_get("id")?,
                contract_transaction_hash,
                transaction_hash: transaction_hash.as_deref().map(parse_h256).transpose()?,
                owner: parse_address(row.try_get("owner")?)?,
                block_number: to_u64(row.try_get("block_number")?, "block_number")?,
                mined: row.try_get("mined")?,
            },
            transaction: MultisigTransaction {
                contract_transaction_hash,
                safe: parse_address(row.try_get("safe")?)?,
                nonce: to_u64(row.try_get("nonce")?, "nonce")?,
                mined: row.try_get("tx_mined")?,
            },
        })
    }
}

#[async_trait]
impl ConfirmationStore for SqliteConfirmationStore {
    async fn find(
        &self,
        contract_transaction_hash: H256,
        owner: Address,
        transaction_hash: H256,
    ) -> Result<Option<StoredConfirmation>> {
        let row = sqlx::query(
            r#"
            SELECT c.id, c.contract_transaction_hash, c.transaction_hash, c.owner, c.block_number, c.mined,
                   t.safe, t.nonce, t.mined AS tx_mined
            FROM multisig_confirmations c
            JOIN multisig_transactions t ON t.contract_transaction_hash = c.contract_transaction_hash
            WHERE c.contract_transaction_hash = ?1 AND c.owner = ?2 AND c.transaction_hash = ?3
            "#,
        )
        .bind(hex_string(contract_transaction_hash.as_bytes()))
        .bind(hex_string(owner.as_bytes()))
        .bind(hex_string(transaction_hash.as_bytes()))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::stored_from_row).transpose()
    }

    async fn delete(&self, confirmation: &MultisigConfirmation) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM multisig_confirmations WHERE id = ?1 AND block_number = ?2",
        )
        .bind(confirmation.id)
        .bind(to_i64(confirmation.block_number, "block_number")?)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected() == 1;
        if deleted {
            warn!(id = confirmation.id, owner = ?confirmation.owner, "Confirmation deleted");
        }
        Ok(deleted)
    }

    async fn update_block_number(
        &self,
        confirmation: &MultisigConfirmation,
        new_block: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE multisig_confirmations SET block_number = ?1, updated_at = ?2 WHERE id = ?3 AND block_number = ?4",
        )
        .bind(to_i64(new_block, "block_number")?)
        .bind(Utc::now())
        .bind(confirmation.id)
        .bind(to_i64(confirmation.block_number, "block_number")?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_confirmation_mined(&self, confirmation: &MultisigConfirmation) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE multisig_confirmations SET mined = 1, updated_at = ?1 WHERE id = ?2 AND mined = 0",
        )
        .bind(Utc::now())
        .bind(confirmation.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_transaction_mined(&self, transaction: &MultisigTransaction) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE multisig_transactions SET mined = 1, updated_at = ?1 WHERE contract_transaction_hash = ?2 AND mined = 0",
        )
        .bind(Utc::now())
        .bind(hex_string(transaction.contract_transaction_hash.as_bytes()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending_confirmations(&self) -> Result<Vec<ConfirmationKey>> {
        let rows = sqlx::query(
            r#"
            SELECT t.safe, c.contract_transaction_hash, c.transaction_hash, c.owner
            FROM multisig_confirmations c
            JOIN multisig_transactions t ON t.contract_transaction_hash = c.contract_transaction_hash
            WHERE c.mined = 0 AND c.transaction_hash IS NOT NULL
            ORDER BY c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let keys = rows
            .iter()
            .map(|row| -> Result<ConfirmationKey> {
                Ok(ConfirmationKey {
                    safe: parse_address(row.try_get("safe")?)?,
                    contract_transaction_hash: parse_h256(row.try_get("contract_transaction_hash")?)?,
                    transaction_hash: parse_h256(row.try_get("transaction_hash")?)?,
                    owner: parse_address(row.try_get("owner")?)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Found {} pending confirmations", keys.len());
        Ok(keys)
    }
}

/// Canonical 0x-prefixed lowercase hex used for every stored address and hash.
fn hex_string(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn parse_h256(value: &str) -> Result<H256> {
    H256::from_str(value)
        .map_err(|e| ReconcileError::InvalidInput(format!("Invalid stored hash '{}': {}", value, e)))
}

fn parse_address(value: &str) -> Result<Address> {
    Address::from_str(value)
        .map_err(|e| ReconcileError::InvalidInput(format!("Invalid stored address '{}': {}", value, e)))
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| ReconcileError::InvalidInput(format!("{} too large to store: {}", field, value)))
}

fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| ReconcileError::InvalidInput(format!("negative {} in store: {}", field, value)))
}
