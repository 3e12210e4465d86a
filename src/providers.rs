// src/providers.rs

//! # Chain Access Capabilities
//!
//! Everything the engine needs from a blockchain node is expressed as the
//! [`ChainClient`] trait. Production clients wrap an `ethers` HTTP provider and are
//! created per configured node by a [`ClientFactory`]; tests inject in-memory
//! clients through the same factory seam.
//!
//! The narrower [`ChainGateway`] and [`TransactionBroadcaster`] traits are what the
//! transaction monitor and external callers see. The load balancer implements
//! both, so nothing downstream of it ever picks a node on its own.

use crate::config::NodeConfig;
use crate::errors::NodeError;
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Bytes, SyncingStatus, Transaction, H256};
use std::sync::Arc;
use tracing::debug;

/// Outcome of a mined transaction, reduced to what failure analysis needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptInfo {
    pub transaction_hash: H256,
    pub block_number: Option<u64>,
    pub success: bool,
    pub gas_used: Option<u64>,
}

/// Raw JSON-RPC capability of a single node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, NodeError>;
    async fn block_number(&self) -> Result<u64, NodeError>;
    async fn syncing(&self) -> Result<bool, NodeError>;
    async fn transaction_receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, NodeError>;
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, NodeError>;
    /// The node's pending pool, or an empty list when the node does not expose one.
    async fn pending_transactions(&self) -> Result<Vec<Transaction>, NodeError>;
}

/// Creates one client per configured node.
pub trait ClientFactory: Send + Sync {
    fn create_client(&self, node: &NodeConfig) -> Result<Arc<dyn ChainClient>, NodeError>;
}

/// Broadcast capability: `Submit(signed bytes) -> hash`.
#[async_trait]
pub trait TransactionBroadcaster: Send + Sync {
    async fn submit(&self, raw: Bytes) -> Result<H256, NodeError>;
}

/// Submit/query surface the transaction monitor depends on.
#[async_trait]
pub trait ChainGateway: TransactionBroadcaster {
    async fn transaction_receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, NodeError>;
    async fn block_number(&self) -> Result<u64, NodeError>;
}

/// A production client factory backed by `ethers` HTTP providers.
#[derive(Debug, Default, Clone)]
pub struct EthersClientFactory;

impl EthersClientFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientFactory for EthersClientFactory {
    fn create_client(&self, node: &NodeConfig) -> Result<Arc<dyn ChainClient>, NodeError> {
        let provider = Provider::<Http>::try_from(node.url.as_str())
            .map_err(|e| NodeError::Network(format!("invalid url for node {}: {}", node.id, e)))?;
        debug!(node = %node.id, chain = %node.chain, "Created HTTP provider");
        Ok(Arc::new(EthersChainClient {
            node_id: node.id.clone(),
            provider,
        }))
    }
}

#[derive(Debug)]
pub struct EthersChainClient {
    node_id: String,
    provider: Provider<Http>,
}

fn map_provider_error(e: impl std::fmt::Display) -> NodeError {
    NodeError::from_provider_message(e.to_string())
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn chain_id(&self) -> Result<u64, NodeError> {
        let id = self.provider.get_chainid().await.map_err(map_provider_error)?;
        Ok(id.low_u64())
    }

    async fn block_number(&self) -> Result<u64, NodeError> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(map_provider_error)?;
        Ok(block.as_u64())
    }

    async fn syncing(&self) -> Result<bool, NodeError> {
        let status = self.provider.syncing().await.map_err(map_provider_error)?;
        Ok(!matches!(status, SyncingStatus::IsFalse))
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, NodeError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(map_provider_error)?;
        Ok(receipt.map(|r| ReceiptInfo {
            transaction_hash: r.transaction_hash,
            block_number: r.block_number.map(|b| b.as_u64()),
            success: r.status.map(|s| s.as_u64() == 1).unwrap_or(false),
            gas_used: r.gas_used.map(|g| g.low_u64()),
        }))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, NodeError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(map_provider_error)?;
        Ok(pending.tx_hash())
    }

    async fn pending_transactions(&self) -> Result<Vec<Transaction>, NodeError> {
        match self.provider.txpool_content().await {
            Ok(content) => Ok(content
                .pending
                .into_values()
                .flat_map(|by_nonce| by_nonce.into_values())
                .collect()),
            Err(e) => {
                let err = map_provider_error(e);
                // Nodes without the txpool namespace answer with method-not-found.
                if let NodeError::Rpc(msg) = &err {
                    if msg.contains("method") || msg.contains("-32601") {
                        debug!(node = %self.node_id, "txpool namespace unavailable");
                        return Ok(Vec::new());
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_malformed_urls() {
        let node = NodeConfig::new("bad", "ethereum", "not a url");
        let result = EthersClientFactory::new().create_client(&node);
        assert!(matches!(result, Err(NodeError::Network(_))));
    }

    #[test]
    fn factory_builds_http_clients() {
        let node = NodeConfig::new("local", "ethereum", "http://127.0.0.1:8545");
        assert!(EthersClientFactory::new().create_client(&node).is_ok());
    }
}
