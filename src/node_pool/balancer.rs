// src/node_pool/balancer.rs

//! # Load Balancer / Failover Controller
//!
//! Routes each logical request to one healthy node chosen by the configured
//! strategy and, when the node fails, retries on a different healthy node. A
//! node is reused within the same call only when it is the sole healthy one.
//! Callers that need node affinity pass a session id; the pin lasts for the
//! session timeout and is dropped as soon as the pinned node stops being
//! selectable.

use super::{InFlightGuard, Node, NodePool};
use crate::config::{BalancingStrategy, LoadBalancerConfig};
use crate::errors::NodeError;
use crate::metrics::{RPC_FAILOVERS_COUNTER, RPC_LATENCY_HISTOGRAM, RPC_REQUESTS_TOTAL};
use crate::providers::{ChainClient, ChainGateway, ReceiptInfo, TransactionBroadcaster};
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Bytes, Transaction, H256};
use futures::Future;
use rand::distributions::{Distribution, WeightedIndex};
use rand::thread_rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Clone)]
struct StickySession {
    node_id: String,
    expires_at: Instant,
}

pub struct LoadBalancer {
    pool: Arc<NodePool>,
    config: LoadBalancerConfig,
    chain: String,
    rr_cursor: AtomicUsize,
    sessions: DashMap<String, StickySession>,
}

impl LoadBalancer {
    pub fn new(pool: Arc<NodePool>, config: LoadBalancerConfig, chain: impl Into<String>) -> Self {
        Self {
            pool,
            config,
            chain: chain.into(),
            rr_cursor: AtomicUsize::new(0),
            sessions: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn strategy(&self) -> BalancingStrategy {
        self.config.strategy
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Node currently pinned to `session`, if the pin is still live.
    pub fn session_node(&self, session: &str) -> Option<String> {
        self.sessions
            .get(session)
            .filter(|s| s.expires_at > Instant::now())
            .map(|s| s.node_id.clone())
    }

    /// Executes `call` against a healthy node, failing over on error.
    #[instrument(skip(self, call), fields(chain = %self.chain), level = "debug")]
    pub async fn execute<T, F, Fut>(
        &self,
        session: Option<&str>,
        method: &str,
        call: F,
    ) -> Result<T, NodeError>
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        let max_attempts = self.config.max_retries as usize + 1;
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error: Option<NodeError> = None;

        for attempt in 0..max_attempts {
            let healthy = self.pool.healthy_nodes(&self.chain);
            if healthy.is_empty() {
                return Err(match last_error {
                    None => NodeError::NoHealthyNode,
                    Some(last) => NodeError::PoolExhausted {
                        attempts: attempt,
                        last: Box::new(last),
                    },
                });
            }

            let untried: Vec<Arc<Node>> = healthy
                .iter()
                .filter(|n| !tried.contains(n.id()))
                .cloned()
                .collect();
            let candidates = if !untried.is_empty() {
                untried
            } else if healthy.len() == 1 {
                healthy
            } else {
                break;
            };

            let Some(guard) = self.select(session, &candidates) else {
                let err = NodeError::RateLimited("no healthy node has spare capacity".to_string());
                return Err(match last_error {
                    None => err,
                    Some(last) => NodeError::PoolExhausted {
                        attempts: attempt,
                        last: Box::new(last),
                    },
                });
            };
            let node = guard.node().clone();
            tried.insert(node.id().to_string());

            if attempt > 0 {
                RPC_FAILOVERS_COUNTER.with_label_values(&[method]).inc();
                debug!(node = %node.id(), method, attempt, "Failing over to another node");
            }

            let started = Instant::now();
            let timeout = node.config().timeout();
            let result = match tokio::time::timeout(timeout, call(node.client())).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout(timeout.as_millis() as u64)),
            };
            let elapsed = started.elapsed();
            drop(guard);

            match result {
                Ok(value) => {
                    self.pool.checker().report_request(&node, elapsed, Ok(()));
                    RPC_LATENCY_HISTOGRAM
                        .with_label_values(&[method])
                        .observe(elapsed.as_secs_f64());
                    RPC_REQUESTS_TOTAL
                        .with_label_values(&[node.id(), method, "success"])
                        .inc();
                    trace!(node = %node.id(), method, duration_ms = elapsed.as_millis() as u64, "RPC call succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    self.pool.checker().report_request(&node, elapsed, Err(&e));
                    RPC_REQUESTS_TOTAL
                        .with_label_values(&[node.id(), method, "failure"])
                        .inc();
                    if let Some(sid) = session {
                        self.sessions.remove_if(sid, |_, s| s.node_id == node.id());
                    }
                    if !e.is_failover() {
                        debug!(node = %node.id(), method, error = %e, "Non-failover error, returning to caller");
                        return Err(e);
                    }
                    warn!(node = %node.id(), method, attempt, error = %e, "RPC call failed");
                    last_error = Some(e);
                }
            }
        }

        let attempts = tried.len();
        Err(match last_error {
            Some(last) => NodeError::PoolExhausted {
                attempts,
                last: Box::new(last),
            },
            None => NodeError::NoHealthyNode,
        })
    }

    /// Picks a node among `candidates` (all healthy) and reserves a slot on it.
    fn select(&self, session: Option<&str>, candidates: &[Arc<Node>]) -> Option<InFlightGuard> {
        let session = session.filter(|_| self.config.sticky_sessions);

        if let Some(sid) = session {
            if let Some(guard) = self.select_pinned(sid, candidates) {
                return Some(guard);
            }
        }

        let cap = Some(self.config.max_requests_per_node);
        let guard = match self.config.strategy {
            BalancingStrategy::RoundRobin => self.round_robin(candidates, cap),
            BalancingStrategy::WeightedRoundRobin => self.weighted(candidates, cap),
            BalancingStrategy::LeastConnections => {
                let mut ordered = candidates.to_vec();
                ordered.sort_by_key(|n| (n.in_flight(), n.config().priority));
                first_available(&ordered, cap)
            }
            BalancingStrategy::LowestLatency => {
                let mut ordered = candidates.to_vec();
                ordered.sort_by_key(|n| (n.last_latency().unwrap_or(std::time::Duration::MAX), n.config().priority));
                first_available(&ordered, cap)
            }
        }?;

        if let Some(sid) = session {
            self.pin(sid, guard.node().id());
        }
        Some(guard)
    }

    /// Pinned traffic is not held to `max_requests_per_node`, only to the node's own limit.
    fn select_pinned(&self, session: &str, candidates: &[Arc<Node>]) -> Option<InFlightGuard> {
        let pinned = self.session_node(session)?;
        match candidates.iter().find(|n| n.id() == pinned) {
            Some(node) => {
                let guard = node.try_acquire(None)?;
                self.pin(session, &pinned);
                Some(guard)
            }
            None => {
                let still_selectable = self
                    .pool
                    .node(&pinned)
                    .map(|n| n.is_selectable())
                    .unwrap_or(false);
                if !still_selectable {
                    debug!(session, node = %pinned, "Dropping sticky session to unavailable node");
                    self.sessions.remove(session);
                }
                None
            }
        }
    }

    fn pin(&self, session: &str, node_id: &str) {
        let now = Instant::now();
        let entry = StickySession {
            node_id: node_id.to_string(),
            expires_at: now + self.config.session_timeout(),
        };
        if self.sessions.insert(session.to_string(), entry).is_none() {
            self.sessions.retain(|_, s| s.expires_at > now);
        }
    }

    fn round_robin(&self, candidates: &[Arc<Node>], cap: Option<usize>) -> Option<InFlightGuard> {
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        (0..candidates.len())
            .map(|offset| &candidates[(start + offset) % candidates.len()])
            .find_map(|node| node.try_acquire(cap))
    }

    fn weighted(&self, candidates: &[Arc<Node>], cap: Option<usize>) -> Option<InFlightGuard> {
        let weights: Vec<u32> = candidates.iter().map(|n| n.config().weight).collect();
        if let Ok(dist) = WeightedIndex::new(&weights) {
            let idx = dist.sample(&mut thread_rng());
            if let Some(guard) = candidates[idx].try_acquire(cap) {
                return Some(guard);
            }
        }
        first_available(candidates, cap)
    }

    /// Pending-pool snapshot, pinned to one node per session so consecutive
    /// polls see a consistent view.
    pub async fn pending_transactions(&self, session: &str) -> Result<Vec<Transaction>, NodeError> {
        self.execute(Some(session), "txpool_content", |client| async move {
            client.pending_transactions().await
        })
        .await
    }
}

fn first_available(candidates: &[Arc<Node>], cap: Option<usize>) -> Option<InFlightGuard> {
    candidates.iter().find_map(|node| node.try_acquire(cap))
}

#[async_trait]
impl TransactionBroadcaster for LoadBalancer {
    async fn submit(&self, raw: Bytes) -> Result<H256, NodeError> {
        self.execute(None, "eth_sendRawTransaction", move |client| {
            let raw = raw.clone();
            async move { client.send_raw_transaction(raw).await }
        })
        .await
    }
}

#[async_trait]
impl ChainGateway for LoadBalancer {
    async fn transaction_receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, NodeError> {
        self.execute(None, "eth_getTransactionReceipt", move |client| async move {
            client.transaction_receipt(hash).await
        })
        .await
    }

    async fn block_number(&self) -> Result<u64, NodeError> {
        self.execute(None, "eth_blockNumber", |client| async move {
            client.block_number().await
        })
        .await
    }
}
