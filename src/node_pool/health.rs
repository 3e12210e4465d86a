// src/node_pool/health.rs

//! # Health Checker
//!
//! Periodically probes each node on its own task and applies hysteresis to the
//! result: a healthy node is marked unhealthy after exactly `unhealthy_threshold`
//! consecutive failures, and an unhealthy node recovers after exactly
//! `healthy_threshold` consecutive successes. Request outcomes reported by the
//! load balancer go through the same accounting.

use super::Node;
use crate::clock::Clock;
use crate::config::{HealthCheckConfig, HealthProbe};
use crate::errors::NodeError;
use crate::metrics::{HEALTH_CHECKS_TOTAL, NODE_HEALTH_STATUS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What a successful round of probes observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub latency: Duration,
    pub chain_id: Option<u64>,
    pub block_height: Option<u64>,
    pub syncing: bool,
}

/// Transition produced by recording one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    BecameHealthy,
    BecameUnhealthy,
}

#[derive(Debug)]
pub struct HealthChecker {
    config: HealthCheckConfig,
    clock: Arc<dyn Clock>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Runs the configured probes against `node` and records the outcome.
    #[instrument(skip(self, node), fields(node = %node.id()), level = "debug")]
    pub async fn check_node(&self, node: &Arc<Node>) -> Result<ProbeReport, NodeError> {
        let timeout = self.config.timeout();
        let result = match tokio::time::timeout(timeout, self.run_probes(node)).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout(timeout.as_millis() as u64)),
        };

        match &result {
            Ok(report) => {
                HEALTH_CHECKS_TOTAL.with_label_values(&[node.id(), "success"]).inc();
                self.record_success(node, Some(report));
            }
            Err(e) => {
                HEALTH_CHECKS_TOTAL.with_label_values(&[node.id(), "failure"]).inc();
                debug!(node = %node.id(), error = %e, "Health check failed");
                self.record_failure(node, e, true);
            }
        }
        result
    }

    async fn run_probes(&self, node: &Arc<Node>) -> Result<ProbeReport, NodeError> {
        let client = node.client();
        let started = Instant::now();
        let mut report = ProbeReport::default();

        for probe in &self.config.probes {
            match probe {
                HealthProbe::ChainId => {
                    let id = client.chain_id().await?;
                    if let Some(expected) = node.config().expected_chain_id {
                        if id != expected {
                            return Err(NodeError::ChainIdMismatch {
                                expected,
                                actual: id,
                            });
                        }
                    }
                    report.chain_id = Some(id);
                }
                HealthProbe::BlockNumber => {
                    report.block_height = Some(client.block_number().await?);
                }
                HealthProbe::SyncStatus => {
                    if client.syncing().await? {
                        report.syncing = true;
                        return Err(NodeError::Syncing);
                    }
                }
            }
        }

        report.latency = started.elapsed();
        let limit = self.config.max_latency();
        if report.latency > limit {
            return Err(NodeError::TooSlow {
                latency_ms: report.latency.as_millis() as u64,
                limit_ms: limit.as_millis() as u64,
            });
        }
        Ok(report)
    }

    /// Outcome of a request routed by the load balancer. Transaction-level
    /// rejections say nothing about the node and are only counted as requests.
    pub fn report_request(&self, node: &Node, latency: Duration, outcome: Result<(), &NodeError>) {
        node.record_request(latency, outcome.is_err());
        match outcome {
            Ok(()) => {
                let mut health = node.health_mut();
                health.last_latency = Some(latency);
                health.consecutive_failures = 0;
            }
            Err(e) if e.counts_against_node() => {
                self.record_failure(node, e, false);
            }
            Err(_) => {}
        }
    }

    pub fn record_success(&self, node: &Node, report: Option<&ProbeReport>) -> HealthTransition {
        let transition = {
            let mut health = node.health_mut();
            health.consecutive_failures = 0;
            health.consecutive_successes = health.consecutive_successes.saturating_add(1);
            health.total_checks += 1;
            health.successful_checks += 1;
            health.last_check = Some(self.clock.now());
            health.last_error = None;
            if let Some(report) = report {
                health.last_latency = Some(report.latency);
                health.syncing = report.syncing;
                if report.block_height.is_some() {
                    health.block_height = report.block_height;
                }
            }
            if !health.is_healthy && health.consecutive_successes >= self.config.healthy_threshold {
                health.is_healthy = true;
                HealthTransition::BecameHealthy
            } else {
                HealthTransition::Unchanged
            }
        };
        if transition == HealthTransition::BecameHealthy {
            info!(node = %node.id(), chain = %node.chain(), "Node recovered, marking healthy");
            publish_health(node);
        }
        transition
    }

    fn record_failure(&self, node: &Node, error: &NodeError, from_check: bool) -> HealthTransition {
        let transition = {
            let mut health = node.health_mut();
            health.consecutive_successes = 0;
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            if from_check {
                health.total_checks += 1;
                health.last_check = Some(self.clock.now());
            }
            if matches!(error, NodeError::Syncing) {
                health.syncing = true;
            }
            health.last_error = Some(error.to_string());
            if health.is_healthy && health.consecutive_failures >= self.config.unhealthy_threshold {
                health.is_healthy = false;
                HealthTransition::BecameUnhealthy
            } else {
                HealthTransition::Unchanged
            }
        };
        if transition == HealthTransition::BecameUnhealthy {
            warn!(
                node = %node.id(),
                chain = %node.chain(),
                error = %error,
                threshold = self.config.unhealthy_threshold,
                "Node exceeded failure threshold, marking unhealthy"
            );
            publish_health(node);
        }
        transition
    }

    /// Spawns the periodic check loop for one node. Disabled nodes are skipped
    /// on each tick rather than stopping the loop, so re-enabling takes effect.
    pub fn spawn(self: Arc<Self>, node: Arc<Node>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if node.is_enabled() {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = self.check_node(&node) => {}
                            }
                        }
                    }
                }
            }
            debug!(node = %node.id(), "Health check loop exited");
        })
    }
}

pub(crate) fn publish_health(node: &Node) {
    NODE_HEALTH_STATUS
        .with_label_values(&[node.id(), node.chain()])
        .set(i64::from(node.is_selectable()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::NodeConfig;
    use crate::node_pool::test_support::StubClient;
    use std::sync::atomic::Ordering;

    fn checker(unhealthy: u32, healthy: u32) -> HealthChecker {
        let config = HealthCheckConfig {
            unhealthy_threshold: unhealthy,
            healthy_threshold: healthy,
            ..HealthCheckConfig::default()
        };
        HealthChecker::new(config, Arc::new(SystemClock))
    }

    fn node_with(client: Arc<StubClient>) -> Arc<Node> {
        Arc::new(Node::new(NodeConfig::new("n1", "ethereum", "http://n1"), client))
    }

    #[tokio::test]
    async fn flips_unhealthy_exactly_at_threshold() {
        let client = Arc::new(StubClient::default());
        client.fail.store(true, Ordering::SeqCst);
        let node = node_with(client);
        let checker = checker(3, 2);

        assert!(checker.check_node(&node).await.is_err());
        assert!(node.is_healthy());
        assert!(checker.check_node(&node).await.is_err());
        assert!(node.is_healthy());
        assert!(checker.check_node(&node).await.is_err());
        assert!(!node.is_healthy());
        assert_eq!(node.health().consecutive_failures, 3);
    }

    #[tokio::test]
    async fn recovers_exactly_at_healthy_threshold() {
        let client = Arc::new(StubClient::default());
        client.fail.store(true, Ordering::SeqCst);
        let node = node_with(client.clone());
        let checker = checker(1, 2);

        let _ = checker.check_node(&node).await;
        assert!(!node.is_healthy());

        client.fail.store(false, Ordering::SeqCst);
        assert!(checker.check_node(&node).await.is_ok());
        assert!(!node.is_healthy());
        assert!(checker.check_node(&node).await.is_ok());
        assert!(node.is_healthy());
        assert_eq!(node.health().block_height, Some(100));
    }

    #[tokio::test]
    async fn a_success_resets_the_failure_streak() {
        let client = Arc::new(StubClient::default());
        let node = node_with(client.clone());
        let checker = checker(3, 1);

        client.fail.store(true, Ordering::SeqCst);
        let _ = checker.check_node(&node).await;
        let _ = checker.check_node(&node).await;
        client.fail.store(false, Ordering::SeqCst);
        let _ = checker.check_node(&node).await;
        client.fail.store(true, Ordering::SeqCst);
        let _ = checker.check_node(&node).await;
        let _ = checker.check_node(&node).await;
        assert!(node.is_healthy());
        assert_eq!(node.health().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn chain_id_mismatch_is_a_failure() {
        let mut cfg = NodeConfig::new("n1", "ethereum", "http://n1");
        cfg.expected_chain_id = Some(137);
        let node = Arc::new(Node::new(cfg, Arc::new(StubClient::default())));
        let result = checker(3, 1).check_node(&node).await;
        assert_eq!(
            result,
            Err(NodeError::ChainIdMismatch {
                expected: 137,
                actual: 1
            })
        );
        assert!(node.health().last_error.is_some());
    }

    #[test]
    fn transaction_rejections_do_not_count_against_node() {
        let node = node_with(Arc::new(StubClient::default()));
        let checker = checker(1, 1);
        let rejection = NodeError::Rpc("nonce too low".into());
        checker.report_request(&node, Duration::from_millis(5), Err(&rejection));
        assert!(node.is_healthy());
        checker.report_request(&node, Duration::from_millis(5), Err(&NodeError::Timeout(5)));
        assert!(!node.is_healthy());
        assert_eq!(node.stats().failed_requests, 2);
    }
}
