#![allow(dead_code)]

pub mod mocks;

use chrono::{TimeZone, Utc};
use ethers::types::{Address, H256, U256};
use std::sync::Arc;

use tx_sentinel::{
    clock::ManualClock,
    config::{EngineConfig, NodeConfig, NodePoolConfig},
    mempool::{gwei, PendingTransaction},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tx_sentinel=debug")
        .with_test_writer()
        .try_init();
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()))
}

/// Nodes `ids` on chain "ethereum", priority in list order.
pub fn pool_config(ids: &[&str]) -> NodePoolConfig {
    let mut config = NodePoolConfig::default();
    config.nodes = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let mut node = NodeConfig::new(id, "ethereum", &format!("http://{id}.test"));
            node.priority = i as u32;
            node
        })
        .collect();
    config.health_check.unhealthy_threshold = 3;
    config.health_check.healthy_threshold = 2;
    config.load_balancer.sticky_sessions = false;
    config
}

pub fn engine_config(ids: &[&str]) -> EngineConfig {
    EngineConfig {
        chain: "ethereum".to_string(),
        node_pool: pool_config(ids),
        ..EngineConfig::default()
    }
}

pub fn tx_hash(n: u64) -> H256 {
    H256::from_low_u64_be(n)
}

/// `count` legacy transactions priced around `median_gwei`, one gwei apart.
pub fn window_around(median_gwei: u64, count: u64, clock: &ManualClock) -> Vec<PendingTransaction> {
    use tx_sentinel::clock::Clock;
    let start = median_gwei - count / 2;
    (0..count)
        .map(|i| {
            let mut tx = PendingTransaction::legacy(tx_hash(1_000 + i), gwei(start + i), clock.now());
            tx.from = Address::from_low_u64_be(1_000 + i);
            tx
        })
        .collect()
}

pub fn price(gwei_value: u64) -> U256 {
    gwei(gwei_value)
}
