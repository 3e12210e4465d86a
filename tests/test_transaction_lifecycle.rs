mod common;

use async_trait::async_trait;
use common::mocks::{MockChainClient, MockClientFactory, RecordingChannel};
use common::{engine_config, init_tracing, manual_clock, price, tx_hash, window_around};
use ethers::types::{Bytes, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tx_sentinel::clock::{Clock, ManualClock};
use tx_sentinel::config::{AlertConfig, EngineConfig, MonitorConfig};
use tx_sentinel::errors::{EngineError, MonitorError, NodeError};
use tx_sentinel::monitor::{
    AlertManager, AlertSeverity, AlertType, FailureKind, NotificationChannel, ReplacementSigner, RetryManager,
    TrackedTransaction, TransactionMonitor, TransactionStatus,
};
use tx_sentinel::node_pool::{LoadBalancer, NodePool};
use tx_sentinel::ReliabilityEngine;

const NODES: [&str; 2] = ["a", "b"];

fn factory() -> Arc<MockClientFactory> {
    let factory = Arc::new(MockClientFactory::default());
    for (i, id) in NODES.iter().enumerate() {
        factory.insert(id, MockChainClient::new(100 + i as u64));
    }
    factory
}

fn engine_with(config: EngineConfig, factory: &Arc<MockClientFactory>, clock: &Arc<ManualClock>) -> ReliabilityEngine {
    init_tracing();
    ReliabilityEngine::new(config, factory.clone(), clock.clone()).unwrap()
}

fn set_receipt_everywhere(factory: &MockClientFactory, hash: H256, success: bool, gas_used: u64) {
    for id in NODES {
        factory.client(id).set_receipt(hash, success, gas_used);
    }
}

fn set_submit_everywhere(factory: &MockClientFactory, result: Result<H256, NodeError>) {
    for id in NODES {
        factory.client(id).set_submit_result(result.clone());
    }
}

fn raw() -> Bytes {
    Bytes::from(vec![0xf8, 0x6c, 0x01])
}

/// Re-signs by encoding the new price, so rebroadcasts are distinguishable.
struct PriceSigner;

#[async_trait]
impl ReplacementSigner for PriceSigner {
    async fn resign(&self, _tx: &TrackedTransaction, gas_price: U256) -> Result<Bytes, MonitorError> {
        let mut bytes = [0u8; 32];
        gas_price.to_big_endian(&mut bytes);
        Ok(Bytes::from(bytes.to_vec()))
    }
}

#[tokio::test]
async fn cheap_transaction_confirms_after_required_polls() {
    let factory = factory();
    let clock = manual_clock();
    let engine = engine_with(engine_config(&NODES), &factory, &clock);

    engine.mempool().ingest(window_around(50, 21, &clock));
    let analysis = engine.mempool().run_cycle().unwrap();
    assert_eq!(analysis.gas_statistics.median, 50.0);
    let cheap = engine.mempool().estimate_confirmation_time(price(20)).unwrap();
    let fair = engine.mempool().estimate_confirmation_time(price(50)).unwrap();
    assert!(cheap.expected_wait >= fair.expected_wait);

    let hash = engine
        .submit_and_track(raw(), price(20), U256::from(21_000u64), HashMap::new())
        .await
        .unwrap();
    assert_eq!(hash, H256::repeat_byte(0xab));
    set_receipt_everywhere(&factory, hash, true, 21_000);

    let monitor = engine.monitor();
    let mut seen = Vec::new();
    for _ in 0..3 {
        let tx = monitor.poll_transaction(hash).await.unwrap();
        assert!(tx.confirmations < 3 || tx.status == TransactionStatus::Confirmed);
        seen.push(tx.confirmations);
    }
    assert_eq!(seen, vec![1, 2, 3]);

    let tx = engine.get_transaction_status(hash).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Confirmed);
    assert!(tx.confirmed_at.is_some());

    let fourth = monitor.poll_transaction(hash).await.unwrap();
    assert_eq!(fourth.confirmations, 3);
    assert_eq!(fourth.status, TransactionStatus::Confirmed);
}

#[tokio::test]
async fn two_hour_old_transaction_is_retried_at_a_higher_price() {
    let factory = factory();
    let clock = manual_clock();
    init_tracing();
    let engine = ReliabilityEngine::with_signer(
        engine_config(&NODES),
        factory.clone(),
        clock.clone(),
        Arc::new(PriceSigner),
    )
    .unwrap();

    let hash = engine
        .submit_and_track(raw(), price(20), U256::from(21_000u64), HashMap::new())
        .await
        .unwrap();

    clock.advance(Duration::from_secs(2 * 3_600));
    let failed = engine.monitor().poll_transaction(hash).await.unwrap();
    assert_eq!(failed.status, TransactionStatus::Failed);
    let failure = failed.failure.clone().unwrap();
    assert!(failure.is_failed);
    assert!(failure.is_retryable);
    assert_eq!(failure.kind, Some(FailureKind::Timeout));

    set_submit_everywhere(&factory, Ok(H256::repeat_byte(0xcd)));
    let outcome = engine.monitor().schedule_retry(hash).await.unwrap();
    assert!(outcome.gas_price >= price(20));
    assert!(outcome.resigned);

    let tx = engine.get_transaction_status(hash).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(tx.retry_attempts, 1);
    assert!(tx.gas_price >= failed.gas_price);
    assert_eq!(tx.current_hash, H256::repeat_byte(0xcd));
    assert_eq!(tx.previous_hashes, vec![hash]);

    // A receipt for the replacement confirms the transaction tracked under the original hash.
    set_receipt_everywhere(&factory, H256::repeat_byte(0xcd), true, 21_000);
    let confirming = engine.monitor().poll_transaction(hash).await.unwrap();
    assert_eq!(confirming.status, TransactionStatus::Confirming);
}

#[tokio::test]
async fn node_outage_is_not_a_transaction_failure() {
    let factory = factory();
    let clock = manual_clock();
    let engine = engine_with(engine_config(&NODES), &factory, &clock);
    let hash = engine
        .submit_and_track(raw(), price(30), U256::from(21_000u64), HashMap::new())
        .await
        .unwrap();

    for id in NODES {
        factory.client(id).set_failing(true);
    }
    for _ in 0..5 {
        let tx = engine.monitor().poll_transaction(hash).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.last_error.is_some());
    }
    assert_eq!(engine.pool().healthy_nodes("ethereum").len(), 0);

    let started = Instant::now();
    let result = engine
        .submit_and_track(raw(), price(30), U256::from(21_000u64), HashMap::new())
        .await;
    assert!(matches!(result, Err(EngineError::Node(NodeError::NoHealthyNode))));
    // Returned straight away; backing off is left to the caller.
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(engine.monitor().summary().total_tracked, 1);
}

#[tokio::test]
async fn status_query_answers_while_a_slow_poll_is_in_flight() {
    let factory = factory();
    let clock = manual_clock();
    let engine = engine_with(engine_config(&NODES), &factory, &clock);
    let hash = engine
        .submit_and_track(raw(), price(30), U256::from(21_000u64), HashMap::new())
        .await
        .unwrap();

    for id in NODES {
        *factory.client(id).latency.lock().unwrap() = Some(Duration::from_secs(2));
    }
    let monitor = engine.monitor().clone();
    let poll = tokio::spawn(async move { monitor.poll_transaction(hash).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!poll.is_finished());

    let tx = tokio::time::timeout(Duration::from_millis(500), engine.get_transaction_status(hash))
        .await
        .expect("status query waited on the poll")
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    let summary = engine.monitor().summary();
    assert_eq!(summary.total_tracked, 1);
    assert_eq!(summary.by_status["pending"], 1);

    poll.abort();
}

#[tokio::test]
async fn exhausted_retries_raise_one_critical_alert() {
    init_tracing();
    let factory = factory();
    let clock = manual_clock();
    let config = engine_config(&NODES);
    let pool = Arc::new(NodePool::new(&config.node_pool, factory.clone(), clock.clone()).unwrap());
    let balancer = Arc::new(LoadBalancer::new(pool, config.node_pool.load_balancer.clone(), "ethereum"));
    let recording = Arc::new(RecordingChannel::default());
    let channel: Arc<dyn NotificationChannel> = recording.clone();
    let alerts = Arc::new(AlertManager::new(&AlertConfig::default(), vec![channel], clock.clone()));
    let mut monitor_config = MonitorConfig::default();
    monitor_config.retry.max_retry_attempts = 2;
    monitor_config.retry.base_delay_ms = 1_000;
    monitor_config.retry.max_delay_ms = 1_000;
    let retries = RetryManager::new(monitor_config.retry.clone(), balancer.clone(), None, None);
    let monitor = TransactionMonitor::new(monitor_config, balancer, retries, alerts.clone(), clock.clone());

    let hash = tx_hash(7);
    monitor
        .track_transaction(
            TrackedTransaction::new(hash, price(25), U256::from(21_000u64), clock.now()).with_raw(raw()),
        )
        .unwrap();

    let mut attempts_seen = Vec::new();
    for _ in 0..3 {
        clock.advance(Duration::from_secs(2 * 3_600));
        let failed = monitor.poll_transaction(hash).await.unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        clock.advance(Duration::from_secs(5));
        let after = monitor.poll_transaction(hash).await.unwrap();
        attempts_seen.push(after.retry_attempts);
    }
    assert_eq!(attempts_seen, vec![1, 2, 2]);
    assert!(attempts_seen.windows(2).all(|w| w[0] <= w[1]));

    let tx = monitor.get_transaction_status(hash).await.unwrap();
    assert!(tx.is_terminal());
    assert_eq!(
        monitor.schedule_retry(hash).await,
        Err(MonitorError::RetryBudgetExhausted(2))
    );

    let critical: Vec<_> = alerts
        .alerts_for(hash)
        .into_iter()
        .filter(|a| a.alert_type == AlertType::RetryExhausted)
        .collect();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].severity, AlertSeverity::Critical);
    assert!(critical[0].action_required);

    for _ in 0..100 {
        if recording.alerts().iter().any(|a| a.alert_type == AlertType::RetryExhausted) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(recording
        .alerts()
        .iter()
        .any(|a| a.alert_type == AlertType::RetryExhausted));
}

#[tokio::test]
async fn polls_run_concurrently_and_isolate_transactions() {
    init_tracing();
    let factory = factory();
    let clock = manual_clock();
    let mut config = engine_config(&NODES);
    config.monitor.max_concurrent_polls = 4;
    let engine = Arc::new(engine_with(config, &factory, &clock));
    let monitor = engine.monitor().clone();

    for n in 1..=20u64 {
        let hash = tx_hash(n);
        monitor
            .track_transaction(TrackedTransaction::new(hash, price(30), U256::from(50_000u64), clock.now()))
            .unwrap();
        if n % 2 == 0 {
            set_receipt_everywhere(&factory, hash, true, 30_000);
        } else if n == 5 {
            set_receipt_everywhere(&factory, hash, false, 30_000);
        }
    }

    monitor.poll_all().await;

    for n in 1..=20u64 {
        let tx = monitor.get_transaction_status(tx_hash(n)).await.unwrap();
        let expected = match n {
            5 => TransactionStatus::Failed,
            n if n % 2 == 0 => TransactionStatus::Confirming,
            _ => TransactionStatus::Pending,
        };
        assert_eq!(tx.status, expected, "tx {n}");
    }
    let summary = monitor.summary();
    assert_eq!(summary.by_status["confirming"], 10);
    assert_eq!(summary.by_status["failed"], 1);
    assert_eq!(summary.by_status["pending"], 9);
}

#[tokio::test]
async fn running_engine_confirms_in_the_background() {
    init_tracing();
    let factory = factory();
    let clock = manual_clock();
    let mut config = engine_config(&NODES);
    config.monitor.poll_interval_ms = 10;
    config.monitor.shutdown_grace_ms = 500;
    config.mempool.update_interval_ms = 20;
    config.node_pool.health_check.interval_ms = 20;
    let engine = engine_with(config, &factory, &clock);
    engine.start().unwrap();

    let hash = engine
        .submit_and_track(raw(), price(30), U256::from(21_000u64), HashMap::new())
        .await
        .unwrap();
    set_receipt_everywhere(&factory, hash, true, 21_000);

    let mut status = TransactionStatus::Pending;
    for _ in 0..200 {
        status = engine.get_transaction_status(hash).await.unwrap().status;
        if status == TransactionStatus::Confirmed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, TransactionStatus::Confirmed);

    let metrics = engine.get_metrics();
    assert_eq!(metrics["tracked_transactions"], serde_json::json!(1));

    tokio::time::timeout(Duration::from_secs(2), engine.stop())
        .await
        .expect("stop must respect the grace period")
        .unwrap();
}
