use anyhow::Result;
use async_trait::async_trait;
use ethers::{
    contract::abigen,
    providers::{Http, JsonRpcClient, Middleware, Provider},
    types::{Address, BlockId, H256, U256},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::traits::{BlockTag, ChainOracle, TransactionRecord};
use crate::core::errors::ReconcileError;

abigen!(
    GnosisSafe,
    r#"[
        function nonce() external view returns (uint256)
        function approvedHashes(address owner, bytes32 hash) external view returns (uint256)
    ]"#
);

#[derive(Clone)]
pub struct EthereumClient<P: JsonRpcClient + Clone = Http> {
    provider: Arc<Provider<P>>,
    network_name: String,
    chain_id: u64,
}

impl EthereumClient<Http> {
    pub async fn new(rpc_url: &str, timeout: Duration) -> Result<Self> {
        let rpc_url_clean = rpc_url.trim();
        let parsed_url = reqwest::Url::parse(rpc_url_clean).map_err(|e| {
            anyhow::anyhow!(
                "Invalid Ethereum RPC URL '{}': {}. Please check config.toml or ETHEREUM_RPC_URL.",
                rpc_url_clean,
                e
            )
        })?;

        info!("Connecting to Ethereum node: {}", parsed_url.host_str().unwrap_or("<unknown>"));
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Ok(proxy) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("HTTP_PROXY")) {
            if let Ok(p) = reqwest::Proxy::all(proxy) {
                builder = builder.proxy(p);
            }
        }
        let client =
            builder.build().map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        let provider = Provider::new(Http::new_with_client(parsed_url.clone(), client));

        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| {
                anyhow::anyhow!("Failed to get chain ID from {}. Error: {}. This might be due to a network issue, firewall, or an invalid RPC URL.", parsed_url, e)
            })?
            .as_u64();

        let network_name = network_name_for(chain_id);
        info!("Connected to {} (Chain ID: {})", network_name, chain_id);

        Ok(Self { provider: Arc::new(provider), network_name, chain_id })
    }
}

impl<P> EthereumClient<P>
where
    P: JsonRpcClient + Clone + 'static,
{
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Creates a new EthereumClient with a given provider.
    /// This is useful for testing with a `MockProvider`.
    pub fn new_with_provider(provider: Provider<P>) -> EthereumClient<P> {
        EthereumClient {
            provider: Arc::new(provider),
            network_name: "test".to_string(),
            chain_id: 1,
        }
    }

    fn safe_contract(&self, safe: Address) -> GnosisSafe<Provider<P>> {
        GnosisSafe::new(safe, self.provider.clone())
    }
}

fn network_name_for(chain_id: u64) -> String {
    match chain_id {
        1 => "ethereum".to_string(),
        5 => "goerli".to_string(),
        10 => "optimism".to_string(),
        100 => "gnosis".to_string(),
        137 => "polygon".to_string(),
        11155111 => "sepolia".to_string(),
        _ => format!("ethereum-{}", chain_id),
    }
}

fn u256_to_u64(value: U256, what: &str) -> Result<u64, ReconcileError> {
    if value > U256::from(u64::MAX) {
        return Err(ReconcileError::Blockchain(format!("{} out of range: {}", what, value)));
    }
    Ok(value.as_u64())
}

#[async_trait]
impl<P> ChainOracle for EthereumClient<P>
where
    P: JsonRpcClient + Clone + 'static,
{
    async fn current_block_number(&self) -> Result<u64, ReconcileError> {
        let block_number = self.provider.get_block_number().await.map_err(|e| {
            ReconcileError::Blockchain(format!("Failed to get block number: {}", e))
        })?;

        Ok(block_number.as_u64())
    }

    async fn transaction_by_hash(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionRecord>, ReconcileError> {
        debug!(tx_hash = ?hash, "Fetching transaction");

        let tx = self.provider.get_transaction(hash).await.map_err(|e| {
            warn!("Failed to get transaction {:?}: {}", hash, e);
            ReconcileError::Blockchain(format!("Failed to get transaction: {}", e))
        })?;

        // Known but still pending transactions carry no block number.
        Ok(tx.and_then(|tx| {
            tx.block_number.map(|block| TransactionRecord { hash, block_number: block.as_u64() })
        }))
    }

    async fn is_hash_approved(
        &self,
        safe: Address,
        owner: Address,
        contract_transaction_hash: H256,
        block: BlockTag,
    ) -> Result<bool, ReconcileError> {
        let approved = self
            .safe_contract(safe)
            .approved_hashes(owner, contract_transaction_hash.to_fixed_bytes())
            .block(BlockId::from(block))
            .call()
            .await
            .map_err(|e| {
                ReconcileError::Blockchain(format!("Failed to read approvedHashes: {}", e))
            })?;

        debug!(safe = ?safe, owner = ?owner, ?block, approved = %approved, "approvedHashes");
        Ok(!approved.is_zero())
    }

    async fn safe_nonce(&self, safe: Address, block: BlockTag) -> Result<u64, ReconcileError> {
        let nonce = self
            .safe_contract(safe)
            .nonce()
            .block(BlockId::from(block))
            .call()
            .await
            .map_err(|e| ReconcileError::Blockchain(format!("Failed to read Safe nonce: {}", e)))?;

        u256_to_u64(nonce, "Safe nonce")
    }

    fn network_name(&self) -> &str {
        &self.network_name
    }
}
