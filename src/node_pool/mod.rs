// src/node_pool/mod.rs

//! # Node Pool
//!
//! Owns every configured RPC endpoint together with its client, request counters
//! and health record. Nodes are registered once and never removed; operators can
//! only disable them. Health state is written exclusively by the
//! [`HealthChecker`](health::HealthChecker), which also receives request outcomes
//! from the [`LoadBalancer`](balancer::LoadBalancer).

pub mod balancer;
pub mod health;

use crate::clock::Clock;
use crate::config::{HealthCheckConfig, NodeConfig, NodePoolConfig};
use crate::errors::{ConfigError, EngineError};
use crate::providers::{ChainClient, ClientFactory};
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use balancer::LoadBalancer;
pub use health::HealthChecker;

/// Mutable health record of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeHealth {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_latency: Option<Duration>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub block_height: Option<u64>,
    pub syncing: bool,
    pub total_checks: u64,
    pub successful_checks: u64,
}

impl NodeHealth {
    fn initial() -> Self {
        Self {
            is_healthy: true,
            ..Default::default()
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 1.0;
        }
        self.successful_checks as f64 / self.total_checks as f64
    }
}

/// A registered RPC endpoint.
pub struct Node {
    config: NodeConfig,
    client: Arc<dyn ChainClient>,
    health: RwLock<NodeHealth>,
    enabled: AtomicBool,
    in_flight: AtomicUsize,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_latency_us: AtomicU64,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.config.id)
            .field("chain", &self.config.chain)
            .field("enabled", &self.is_enabled())
            .field("health", &*self.health.read())
            .finish()
    }
}

impl Node {
    pub fn new(config: NodeConfig, client: Arc<dyn ChainClient>) -> Self {
        let limiter = config
            .requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| GovernorRateLimiter::direct(Quota::per_second(rps)));
        let enabled = config.enabled;
        Self {
            config,
            client,
            health: RwLock::new(NodeHealth::initial()),
            enabled: AtomicBool::new(enabled),
            in_flight: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            limiter,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn chain(&self) -> &str {
        &self.config.chain
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn client(&self) -> Arc<dyn ChainClient> {
        self.client.clone()
    }

    pub fn health(&self) -> NodeHealth {
        self.health.read().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.read().is_healthy
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Only enabled and healthy nodes may receive traffic.
    pub fn is_selectable(&self) -> bool {
        self.is_enabled() && self.is_healthy()
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.health.read().last_latency
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Reserves a request slot. Fails when the node is at its in-flight limit
    /// (or `extra_cap`, whichever is lower) or its rate limiter has no capacity.
    pub fn try_acquire(self: &Arc<Self>, extra_cap: Option<usize>) -> Option<InFlightGuard> {
        let limit = extra_cap
            .map(|cap| cap.min(self.config.max_in_flight))
            .unwrap_or(self.config.max_in_flight);
        let reserved = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .is_ok();
        if !reserved {
            return None;
        }
        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
        }
        Some(InFlightGuard { node: self.clone() })
    }

    pub(crate) fn health_mut(&self) -> parking_lot::RwLockWriteGuard<'_, NodeHealth> {
        self.health.write()
    }

    pub(crate) fn record_request(&self, latency: Duration, failed: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        if failed {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> NodeStats {
        let health = self.health();
        let total = self.total_requests.load(Ordering::Relaxed);
        let avg_latency_ms = if total > 0 {
            self.total_latency_us.load(Ordering::Relaxed) as f64 / total as f64 / 1000.0
        } else {
            0.0
        };
        NodeStats {
            id: self.config.id.clone(),
            chain: self.config.chain.clone(),
            enabled: self.is_enabled(),
            healthy: health.is_healthy,
            in_flight: self.in_flight(),
            total_requests: total,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            avg_latency_ms,
            last_latency_ms: health.last_latency.map(|d| d.as_millis() as u64),
            success_rate: health.success_rate(),
            block_height: health.block_height,
            last_error: health.last_error,
        }
    }
}

/// Releases the node's in-flight slot when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    node: Arc<Node>,
}

impl InFlightGuard {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.node.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub id: String,
    pub chain: String,
    pub enabled: bool,
    pub healthy: bool,
    pub in_flight: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub last_latency_ms: Option<u64>,
    pub success_rate: f64,
    pub block_height: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub total_nodes: usize,
    pub enabled_nodes: usize,
    pub healthy_nodes: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
}

pub struct NodePool {
    nodes: RwLock<Vec<Arc<Node>>>,
    factory: Arc<dyn ClientFactory>,
    checker: Arc<HealthChecker>,
    running: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodePool {
    /// Builds the pool and registers every configured node.
    pub fn new(
        config: &NodePoolConfig,
        factory: Arc<dyn ClientFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let pool = Self::empty(config.health_check.clone(), factory, clock);
        for node in &config.nodes {
            pool.register_node(node.clone())?;
        }
        Ok(pool)
    }

    pub fn empty(
        health: HealthCheckConfig,
        factory: Arc<dyn ClientFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            factory,
            checker: Arc::new(HealthChecker::new(health, clock)),
            running: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn register_node(&self, config: NodeConfig) -> Result<Arc<Node>, EngineError> {
        config.validate()?;
        if self.node(&config.id).is_some() {
            return Err(ConfigError::DuplicateNode(config.id).into());
        }
        let client = self.factory.create_client(&config)?;
        let node = Arc::new(Node::new(config, client));
        health::publish_health(&node);
        {
            let mut nodes = self.nodes.write();
            if nodes.iter().any(|n| n.id() == node.id()) {
                return Err(ConfigError::DuplicateNode(node.id().to_string()).into());
            }
            nodes.push(node.clone());
        }
        info!(node = %node.id(), chain = %node.chain(), url = %node.config().url, "Registered RPC node");

        if let Some(cancel) = self.running.lock().clone() {
            let handle = self.checker.clone().spawn(node.clone(), cancel);
            self.tasks.lock().push(handle);
        }
        Ok(node)
    }

    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.read().iter().find(|n| n.id() == id).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ConfigError> {
        let node = self
            .node(id)
            .ok_or_else(|| ConfigError::UnknownNode(id.to_string()))?;
        node.enabled.store(enabled, Ordering::Release);
        health::publish_health(&node);
        info!(node = %id, enabled, "Node enablement changed");
        Ok(())
    }

    /// Selectable nodes for `chain`, ordered by priority.
    pub fn healthy_nodes(&self, chain: &str) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self
            .nodes
            .read()
            .iter()
            .filter(|n| n.chain() == chain && n.is_selectable())
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.config().priority);
        nodes
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    /// Runs one health check on every enabled node concurrently.
    pub async fn check_all(&self) {
        let nodes: Vec<Arc<Node>> = self.nodes().into_iter().filter(|n| n.is_enabled()).collect();
        let checks = nodes.iter().map(|node| self.checker.check_node(node));
        futures::future::join_all(checks).await;
    }

    /// Spawns one health-check task per registered node.
    pub fn start(&self, parent: &CancellationToken) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        let cancel = parent.child_token();
        let handles: Vec<JoinHandle<()>> = self
            .nodes()
            .into_iter()
            .map(|node| self.checker.clone().spawn(node, cancel.clone()))
            .collect();
        info!(tasks = handles.len(), "Node health checking started");
        *self.tasks.lock() = handles;
        *running = Some(cancel);
        true
    }

    /// Cancels the health tasks and waits up to `grace` for them to finish.
    pub async fn stop(&self, grace: Duration) {
        let Some(cancel) = self.running.lock().take() else {
            return;
        };
        cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Health check tasks did not stop within the grace period, aborting");
            aborts.iter().for_each(|a| a.abort());
        }
        info!("Node health checking stopped");
    }

    pub fn metrics(&self) -> PoolMetrics {
        let stats: Vec<NodeStats> = self.nodes.read().iter().map(|n| n.stats()).collect();
        let total_requests: u64 = stats.iter().map(|s| s.total_requests).sum();
        let weighted_latency: f64 = stats
            .iter()
            .map(|s| s.avg_latency_ms * s.total_requests as f64)
            .sum();
        PoolMetrics {
            total_nodes: stats.len(),
            enabled_nodes: stats.iter().filter(|s| s.enabled).count(),
            healthy_nodes: stats.iter().filter(|s| s.enabled && s.healthy).count(),
            total_requests,
            failed_requests: stats.iter().map(|s| s.failed_requests).sum(),
            avg_latency_ms: if total_requests > 0 {
                weighted_latency / total_requests as f64
            } else {
                0.0
            },
        }
    }

    pub fn node_stats(&self) -> Vec<NodeStats> {
        self.nodes.read().iter().map(|n| n.stats()).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::clock::SystemClock;

    fn pool(ids: &[&str]) -> (NodePool, Arc<StubFactory>) {
        let factory = Arc::new(StubFactory::default());
        let pool = NodePool::new(&pool_config(ids), factory.clone(), Arc::new(SystemClock)).unwrap();
        (pool, factory)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (pool, _) = pool(&["a", "b"]);
        let err = pool
            .register_node(NodeConfig::new("a", "ethereum", "http://other"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::DuplicateNode(_))));
        assert_eq!(pool.nodes().len(), 2);
    }

    #[test]
    fn disabled_nodes_are_never_selectable() {
        let (pool, _) = pool(&["a", "b"]);
        pool.set_enabled("a", false).unwrap();
        let healthy: Vec<String> = pool
            .healthy_nodes("ethereum")
            .iter()
            .map(|n| n.id().to_string())
            .collect();
        assert_eq!(healthy, vec!["b".to_string()]);
        assert!(pool.node("a").is_some());
        assert!(matches!(
            pool.set_enabled("zzz", true),
            Err(ConfigError::UnknownNode(_))
        ));
    }

    #[test]
    fn healthy_nodes_are_filtered_by_chain_and_sorted_by_priority() {
        let (pool, _) = pool(&["a", "b"]);
        let mut other = NodeConfig::new("c", "polygon", "http://c.local");
        other.priority = 0;
        pool.register_node(other).unwrap();
        let ids: Vec<String> = pool
            .healthy_nodes("ethereum")
            .iter()
            .map(|n| n.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn in_flight_slots_are_bounded_and_released() {
        let (pool, _) = pool(&["a"]);
        let node = pool.node("a").unwrap();
        let first = node.try_acquire(Some(2)).unwrap();
        let _second = node.try_acquire(Some(2)).unwrap();
        assert!(node.try_acquire(Some(2)).is_none());
        drop(first);
        assert_eq!(node.in_flight(), 1);
        assert!(node.try_acquire(Some(2)).is_some());
    }

    #[test]
    fn rate_limited_node_refuses_slots() {
        let (pool, _) = pool(&[]);
        let mut cfg = NodeConfig::new("slow", "ethereum", "http://slow.local");
        cfg.requests_per_second = Some(1);
        let node = pool.register_node(cfg).unwrap();
        let first = node.try_acquire(None);
        assert!(first.is_some());
        drop(first);
        assert!(node.try_acquire(None).is_none());
        assert_eq!(node.in_flight(), 0);
    }

    #[tokio::test]
    async fn pool_metrics_count_health() {
        let (pool, factory) = pool(&["a", "b", "c"]);
        factory.client("c").fail.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            pool.check_all().await;
        }
        let metrics = pool.metrics();
        assert_eq!(metrics.total_nodes, 3);
        assert_eq!(metrics.healthy_nodes, 2);
    }
}
