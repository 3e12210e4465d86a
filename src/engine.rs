// src/engine.rs

//! # Reliability Engine
//!
//! Owns every long-running component and exposes the query surface. Dependencies
//! run one way: the monitor talks to the load balancer, the balancer reads node
//! health, and nothing below calls back up.
//!
//! A fresh cancellation token is created on every `start`, so an engine can be
//! stopped and started again.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::errors::{EngineError, MempoolError};
use crate::gas_oracle::GasPriceOracle;
use crate::mempool::source::BalancedPendingFeed;
use crate::mempool::{MempoolAnalysis, MempoolAnalyzer, OptimalGasPrice};
use crate::monitor::{
    channels_from_config, AlertManager, ReplacementSigner, RetryManager, TrackedTransaction,
    TransactionMonitor,
};
use crate::node_pool::{LoadBalancer, NodePool};
use crate::providers::{ClientFactory, TransactionBroadcaster};
use ethers::types::{Bytes, H256, U256};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub struct ReliabilityEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    pool: Arc<NodePool>,
    balancer: Arc<LoadBalancer>,
    mempool: Arc<MempoolAnalyzer>,
    monitor: Arc<TransactionMonitor>,
    running: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for ReliabilityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliabilityEngine")
            .field("chain", &self.config.chain)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ReliabilityEngine {
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn ClientFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        Self::build(config, factory, clock, None)
    }

    /// Like [`ReliabilityEngine::new`], with retries re-signed at the bumped gas price.
    pub fn with_signer(
        config: EngineConfig,
        factory: Arc<dyn ClientFactory>,
        clock: Arc<dyn Clock>,
        signer: Arc<dyn ReplacementSigner>,
    ) -> Result<Self, EngineError> {
        Self::build(config, factory, clock, Some(signer))
    }

    fn build(
        config: EngineConfig,
        factory: Arc<dyn ClientFactory>,
        clock: Arc<dyn Clock>,
        signer: Option<Arc<dyn ReplacementSigner>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let pool = Arc::new(NodePool::new(&config.node_pool, factory, clock.clone())?);
        let balancer = Arc::new(LoadBalancer::new(
            pool.clone(),
            config.node_pool.load_balancer.clone(),
            config.chain.clone(),
        ));

        let feed = Arc::new(BalancedPendingFeed::new(balancer.clone()));
        let mempool = Arc::new(MempoolAnalyzer::new(
            config.mempool.clone(),
            clock.clone(),
            Some(feed),
        ));

        let alerts = Arc::new(AlertManager::new(
            &config.alerts,
            channels_from_config(&config.alerts),
            clock.clone(),
        ));
        let oracle: Arc<dyn GasPriceOracle> = mempool.clone();
        let retries = RetryManager::new(
            config.monitor.retry.clone(),
            balancer.clone(),
            Some(oracle),
            signer,
        );
        let monitor = Arc::new(TransactionMonitor::new(
            config.monitor.clone(),
            balancer.clone(),
            retries,
            alerts,
            clock.clone(),
        ));

        info!(
            chain = %config.chain,
            nodes = config.node_pool.nodes.len(),
            strategy = %config.node_pool.load_balancer.strategy,
            "Reliability engine initialized"
        );

        Ok(Self {
            config,
            clock,
            pool,
            balancer,
            mempool,
            monitor,
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn mempool(&self) -> &Arc<MempoolAnalyzer> {
        &self.mempool
    }

    pub fn monitor(&self) -> &Arc<TransactionMonitor> {
        &self.monitor
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Starts health checking, mempool analysis and transaction monitoring.
    /// The pool starts last because it is the only component that cannot
    /// refuse, so a failed start leaves nothing running.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        self.mempool.start(&cancel)?;
        if let Err(e) = self.monitor.start(&cancel) {
            cancel.cancel();
            self.mempool.abort();
            return Err(e.into());
        }
        self.pool.start(&cancel);
        *running = Some(cancel);
        info!(chain = %self.config.chain, "Reliability engine started");
        Ok(())
    }

    /// Stops every component, each bounded by the shutdown grace period.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let Some(cancel) = self.running.lock().take() else {
            return Err(EngineError::NotRunning);
        };
        cancel.cancel();
        let grace = self.config.monitor.shutdown_grace();
        self.monitor.stop().await;
        self.mempool.stop(grace).await;
        self.pool.stop(grace).await;
        info!("Reliability engine stopped");
        Ok(())
    }

    /// Broadcasts a signed transaction and starts tracking it. The balancer
    /// already fails over between nodes, so errors come back as they are;
    /// `NoHealthyNode` in particular is returned at once for the caller to back off.
    #[instrument(skip(self, raw, metadata))]
    pub async fn submit_and_track(
        &self,
        raw: Bytes,
        gas_price: U256,
        gas_limit: U256,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<H256, EngineError> {
        let hash = self.balancer.submit(raw.clone()).await?;

        let tx = TrackedTransaction::new(hash, gas_price, gas_limit, self.clock.now())
            .with_raw(raw)
            .with_metadata(metadata);
        self.monitor.track_transaction(tx)?;
        Ok(hash)
    }

    pub fn get_mempool_analysis(&self) -> Result<MempoolAnalysis, MempoolError> {
        self.mempool.get_mempool_analysis()
    }

    pub fn get_optimal_gas_price(&self) -> Result<OptimalGasPrice, MempoolError> {
        self.mempool.get_optimal_gas_price()
    }

    pub async fn get_transaction_status(&self, hash: H256) -> Result<TrackedTransaction, EngineError> {
        Ok(self.monitor.get_transaction_status(hash).await?)
    }

    /// Flat snapshot for dashboards and the CLI status log.
    pub fn get_metrics(&self) -> HashMap<String, serde_json::Value> {
        let mut out = HashMap::new();
        let pool = self.pool.metrics();
        out.insert("total_nodes".into(), serde_json::json!(pool.total_nodes));
        out.insert("healthy_nodes".into(), serde_json::json!(pool.healthy_nodes));
        out.insert("total_requests".into(), serde_json::json!(pool.total_requests));
        out.insert("failed_requests".into(), serde_json::json!(pool.failed_requests));
        out.insert("avg_latency_ms".into(), serde_json::json!(pool.avg_latency_ms));
        out.insert("active_sessions".into(), serde_json::json!(self.balancer.active_sessions()));
        insert_serialized(&mut out, "nodes", &self.pool.node_stats());
        insert_serialized(&mut out, "mempool", &self.mempool.get_metrics());

        let summary = self.monitor.summary();
        out.insert("tracked_transactions".into(), serde_json::json!(summary.total_tracked));
        out.insert("active_alerts".into(), serde_json::json!(summary.active_alerts));
        insert_serialized(&mut out, "transactions", &summary);
        out
    }
}

fn insert_serialized<T: serde::Serialize>(
    out: &mut HashMap<String, serde_json::Value>,
    key: &str,
    value: &T,
) {
    match serde_json::to_value(value) {
        Ok(v) => {
            out.insert(key.to_string(), v);
        }
        Err(e) => warn!(key, error = %e, "Failed to serialize metrics section"),
    }
}

impl Drop for ReliabilityEngine {
    fn drop(&mut self) {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::NodeConfig;
    use crate::node_pool::test_support::{pool_config, StubFactory};
    use std::time::Duration;

    fn engine() -> ReliabilityEngine {
        let mut config = EngineConfig {
            node_pool: pool_config(&["a", "b"]),
            ..EngineConfig::default()
        };
        config.chain = config.node_pool.nodes[0].chain.clone();
        ReliabilityEngine::new(
            config,
            Arc::new(StubFactory::default()),
            Arc::new(ManualClock::default()),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_fails_fast() {
        let config = EngineConfig {
            node_pool: crate::config::NodePoolConfig {
                nodes: vec![NodeConfig::new("a", "ethereum", "")],
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        let result = ReliabilityEngine::new(
            config,
            Arc::new(StubFactory::default()),
            Arc::new(ManualClock::default()),
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_stop_is_idempotent() {
        let engine = engine();
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));
        engine.stop().await.unwrap();
        assert!(matches!(engine.stop().await, Err(EngineError::NotRunning)));
        engine.start().unwrap();
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_start_leaves_nothing_running() {
        let engine = engine();
        let outside = CancellationToken::new();
        engine.monitor().start(&outside).unwrap();

        assert!(matches!(engine.start(), Err(EngineError::Monitor(_))));

        // Neither the pool nor the mempool loop kept its running slot.
        let scratch = CancellationToken::new();
        assert!(engine.pool().start(&scratch));
        engine.mempool().start(&scratch).unwrap();
        scratch.cancel();
        engine.pool().stop(Duration::from_millis(50)).await;
        engine.mempool().stop(Duration::from_millis(50)).await;

        engine.monitor().stop().await;
        engine.start().unwrap();
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn no_analysis_before_first_cycle() {
        let engine = engine();
        assert!(matches!(
            engine.get_optimal_gas_price(),
            Err(MempoolError::NoAnalysis)
        ));
        let metrics = engine.get_metrics();
        assert_eq!(metrics["total_nodes"], serde_json::json!(2));
        assert_eq!(metrics["tracked_transactions"], serde_json::json!(0));
    }
}
