//! RPC failover, mempool gas analytics and transaction lifecycle monitoring
//! for EVM chains.
//!
//! [`engine::ReliabilityEngine`] wires the pieces together: a health-checked
//! [`node_pool::NodePool`] behind a failover [`node_pool::LoadBalancer`], a
//! [`mempool::MempoolAnalyzer`] producing gas price recommendations, and a
//! [`monitor::TransactionMonitor`] driving submitted transactions to a terminal
//! state with retries and alerts.

pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod gas_oracle;
pub mod mempool;
pub mod mempool_stats;
pub mod metrics;
pub mod monitor;
pub mod node_pool;
pub mod providers;
pub mod retry;
pub mod stats;

pub use engine::ReliabilityEngine;
