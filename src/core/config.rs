use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::errors::ReconcileError;

/// Reorg window and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Number of blocks after which chain state is considered final
    #[serde(default = "ReconcilerConfig::default_reorg_blocks")]
    pub reorg_blocks: u64,

    /// Delay before an undetermined confirmation is checked again (seconds)
    #[serde(default = "ReconcilerConfig::default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Re-invocations after the first attempt
    #[serde(default = "ReconcilerConfig::default_max_retries")]
    pub max_retries: u32,
}

impl ReconcilerConfig {
    fn default_reorg_blocks() -> u64 { 10 }
    fn default_retry_delay_secs() -> u64 { 60 }
    fn default_max_retries() -> u32 { 3 }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reorg_blocks: Self::default_reorg_blocks(),
            retry_delay_secs: Self::default_retry_delay_secs(),
            max_retries: Self::default_max_retries(),
        }
    }
}

/// Ethereum node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "NetworkConfig::default_rpc_url")]
    pub rpc_url: String,
    /// Expected chain id; checked against the node when set
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default = "NetworkConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl NetworkConfig {
    fn default_rpc_url() -> String { "http://localhost:8545".to_string() }
    fn default_request_timeout_secs() -> u64 { 10 }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_url: Self::default_rpc_url(),
            chain_id: None,
            request_timeout_secs: Self::default_request_timeout_secs(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_database_url")]
    pub database_url: String,
    #[serde(default = "StorageConfig::default_max_connections")]
    pub max_connections: u32,
}

impl StorageConfig {
    fn default_database_url() -> String { "sqlite://./data/reconciler.db?mode=rwc".to_string() }
    fn default_max_connections() -> u32 { 10 }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: Self::default_database_url(),
            max_connections: Self::default_max_connections(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Confirmations reconciled in parallel during a sweep
    #[serde(default = "WorkerConfig::default_concurrency")]
    pub concurrency: usize,
}

impl WorkerConfig {
    fn default_concurrency() -> usize { 8 }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { concurrency: Self::default_concurrency() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse configuration: {}", e))?;
        Ok(config)
    }

    /// Load from `path` (or `CONFIG_PATH`, or `config.toml`), apply env overrides and validate.
    /// A missing file falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("CONFIG_PATH")
                .unwrap_or_else(|_| "config.toml".to_string())
                .into(),
        };

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            info!("Loaded configuration from {}", path.display());
            Self::from_toml_str(&content)?
        } else {
            debug!("No configuration file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ReconcileError> {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Ok(url) = std::env::var("ETHEREUM_RPC_URL") {
            self.network.rpc_url = url;
        }
        if let Some(v) = env_number::<u64>("SAFE_REORG_BLOCKS")? {
            self.reconciler.reorg_blocks = v;
        }
        if let Some(v) = env_number::<u64>("RETRY_DELAY_SECS")? {
            self.reconciler.retry_delay_secs = v;
        }
        if let Some(v) = env_number::<u32>("MAX_RETRIES")? {
            self.reconciler.max_retries = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.network.rpc_url.trim().is_empty() {
            return Err(ReconcileError::Config("network.rpc_url must not be empty".into()));
        }
        if self.storage.database_url.trim().is_empty() {
            return Err(ReconcileError::Config("storage.database_url must not be empty".into()));
        }
        if self.worker.concurrency == 0 {
            return Err(ReconcileError::Config("worker.concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ReconcileError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ReconcileError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in ["DATABASE_URL", "ETHEREUM_RPC_URL", "SAFE_REORG_BLOCKS", "RETRY_DELAY_SECS", "MAX_RETRIES"] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.reconciler.reorg_blocks, 10);
        assert_eq!(config.reconciler.retry_delay(), Duration::from_secs(60));
        assert_eq!(config.reconciler.max_retries, 3);
        assert_eq!(config.worker.concurrency, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [reconciler]
            reorg_blocks = 64

            [network]
            rpc_url = "https://rpc.example.org"
            chain_id = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.reconciler.reorg_blocks, 64);
        assert_eq!(config.reconciler.retry_delay_secs, 60);
        assert_eq!(config.network.chain_id, Some(100));
        assert_eq!(config.network.request_timeout_secs, 10);
    }

    #[test]
    fn test_validate_rejects_empty_rpc_url() {
        let mut config = AppConfig::default();
        config.network.rpc_url = "  ".into();
        assert!(matches!(config.validate(), Err(ReconcileError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("SAFE_REORG_BLOCKS", "20");
        std::env::set_var("MAX_RETRIES", "0");
        std::env::set_var("DATABASE_URL", "sqlite::memory:");
        let mut config = AppConfig::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.reconciler.reorg_blocks, 20);
        assert_eq!(config.reconciler.max_retries, 0);
        assert_eq!(config.storage.database_url, "sqlite::memory:");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_rejects_garbage() {
        clear_env();
        std::env::set_var("RETRY_DELAY_SECS", "soon");
        let mut config = AppConfig::default();
        assert!(config.apply_env_overrides().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reconciler.toml");
        std::fs::write(&path, "[worker]\nconcurrency = 2\n").unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.worker.concurrency, 2);

        let missing = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(missing.worker.concurrency, 8);
    }
}
