use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Bytes, Transaction, H256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tx_sentinel::{
    config::NodeConfig,
    errors::{AlertError, NodeError},
    monitor::{Alert, NotificationChannel},
    providers::{ChainClient, ClientFactory, ReceiptInfo},
};

// === Mock Chain Client ===
#[derive(Debug)]
pub struct MockChainClient {
    pub chain_id: u64,
    pub block: u64,
    pub failing: AtomicBool,
    pub failure: Mutex<NodeError>,
    pub latency: Mutex<Option<Duration>>,
    pub receipts: Mutex<HashMap<H256, ReceiptInfo>>,
    pub pending: Mutex<Vec<Transaction>>,
    pub submit_result: Mutex<Result<H256, NodeError>>,
    pub submitted: Mutex<Vec<Bytes>>,
    pub calls: AtomicUsize,
}

impl MockChainClient {
    pub fn new(block: u64) -> Self {
        Self {
            chain_id: 1,
            block,
            failing: AtomicBool::new(false),
            failure: Mutex::new(NodeError::Timeout(10)),
            latency: Mutex::new(None),
            receipts: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            submit_result: Mutex::new(Ok(H256::repeat_byte(0xab))),
            submitted: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_with(&self, error: NodeError) {
        *self.failure.lock().unwrap() = error;
        self.set_failing(true);
    }

    pub fn set_receipt(&self, hash: H256, success: bool, gas_used: u64) {
        self.receipts.lock().unwrap().insert(
            hash,
            ReceiptInfo {
                transaction_hash: hash,
                block_number: Some(self.block),
                success,
                gas_used: Some(gas_used),
            },
        );
    }

    pub fn set_submit_result(&self, result: Result<H256, NodeError>) {
        *self.submit_result.lock().unwrap() = result;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn answer<T>(&self, value: T) -> Result<T, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.failure.lock().unwrap().clone());
        }
        Ok(value)
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn chain_id(&self) -> Result<u64, NodeError> {
        self.answer(self.chain_id).await
    }

    async fn block_number(&self) -> Result<u64, NodeError> {
        self.answer(self.block).await
    }

    async fn syncing(&self) -> Result<bool, NodeError> {
        self.answer(false).await
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, NodeError> {
        let receipt = self.receipts.lock().unwrap().get(&hash).cloned();
        self.answer(receipt).await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, NodeError> {
        let result = self.submit_result.lock().unwrap().clone();
        let result = self.answer(result).await?;
        if result.is_ok() {
            self.submitted.lock().unwrap().push(raw);
        }
        result
    }

    async fn pending_transactions(&self) -> Result<Vec<Transaction>, NodeError> {
        let pending = self.pending.lock().unwrap().clone();
        self.answer(pending).await
    }
}

// === Mock Client Factory ===
/// Hands out one client per node id. Clients created on demand answer with
/// block height 1; pre-register with [`MockClientFactory::insert`] to script them.
#[derive(Default)]
pub struct MockClientFactory {
    pub clients: DashMap<String, Arc<MockChainClient>>,
}

impl MockClientFactory {
    pub fn insert(&self, id: &str, client: MockChainClient) -> Arc<MockChainClient> {
        let client = Arc::new(client);
        self.clients.insert(id.to_string(), client.clone());
        client
    }

    pub fn client(&self, id: &str) -> Arc<MockChainClient> {
        self.clients
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(MockChainClient::new(1)))
            .clone()
    }
}

impl ClientFactory for MockClientFactory {
    fn create_client(&self, node: &NodeConfig) -> Result<Arc<dyn ChainClient>, NodeError> {
        Ok(self.client(&node.id))
    }
}

// === Recording Notification Channel ===
#[derive(Debug, Default)]
pub struct RecordingChannel {
    pub sent: Mutex<Vec<Alert>>,
    pub fail: AtomicBool,
}

impl RecordingChannel {
    pub fn alerts(&self) -> Vec<Alert> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AlertError::Delivery {
                channel: "recording".to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        self.sent.lock().unwrap().push(alert.clone());
        Ok(())
    }
}
