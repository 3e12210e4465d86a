// src/mempool/source.rs

use crate::errors::NodeError;
use crate::node_pool::LoadBalancer;
use async_trait::async_trait;
use ethers::types::Transaction;
use std::sync::Arc;

/// Session id the pending feed pins itself to.
pub const FEED_SESSION: &str = "mempool-feed";

/// Snapshot feed of the pending pool.
#[async_trait]
pub trait PendingTransactionSource: Send + Sync {
    /// The full pending set as currently seen by one node.
    async fn fetch_pending(&self) -> Result<Vec<Transaction>, NodeError>;
}

/// Pending feed routed through the load balancer with a sticky session, so
/// consecutive snapshots come from the same node while it stays healthy.
#[derive(Clone)]
pub struct BalancedPendingFeed {
    balancer: Arc<LoadBalancer>,
    session: String,
}

impl BalancedPendingFeed {
    pub fn new(balancer: Arc<LoadBalancer>) -> Self {
        Self {
            balancer,
            session: FEED_SESSION.to_string(),
        }
    }

    pub fn with_session(balancer: Arc<LoadBalancer>, session: impl Into<String>) -> Self {
        Self {
            balancer,
            session: session.into(),
        }
    }
}

#[async_trait]
impl PendingTransactionSource for BalancedPendingFeed {
    async fn fetch_pending(&self) -> Result<Vec<Transaction>, NodeError> {
        self.balancer.pending_transactions(&self.session).await
    }
}
