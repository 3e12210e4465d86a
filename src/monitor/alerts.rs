// src/monitor/alerts.rs

//! # Alert Manager
//!
//! Creates structured alerts for notable transaction events and fans them out
//! to every enabled [`NotificationChannel`]. Deliveries run concurrently, each
//! under its own timeout, and a failing channel is logged and counted without
//! affecting the others. A bounded history keeps recent alerts queryable and
//! acknowledgeable.

use crate::clock::Clock;
use crate::config::{AlertConfig, ChannelConfig};
use crate::errors::AlertError;
use crate::metrics::{ALERTS_TOTAL, ALERT_DELIVERY_FAILURES};
use crate::retry::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }

    /// Scales with how far past the expected confirmation time a transaction is.
    pub fn for_overdue(elapsed: Duration, expected: Duration) -> Self {
        let expected = expected.as_secs_f64().max(1.0);
        let ratio = elapsed.as_secs_f64() / expected;
        if ratio < 2.0 {
            AlertSeverity::Info
        } else if ratio < 5.0 {
            AlertSeverity::Warning
        } else if ratio < 10.0 {
            AlertSeverity::Error
        } else {
            AlertSeverity::Critical
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    TransactionFailed,
    RetryScheduled,
    RetryExhausted,
    Stuck,
    HighGasUsage,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::TransactionFailed => "transaction_failed",
            AlertType::RetryScheduled => "retry_scheduled",
            AlertType::RetryExhausted => "retry_exhausted",
            AlertType::Stuck => "stuck",
            AlertType::HighGasUsage => "high_gas_usage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: String,
    pub transaction_hash: H256,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub acknowledged: bool,
    pub action_required: bool,
    pub recommended_actions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Parameters for a new alert.
#[derive(Debug, Clone)]
pub struct AlertSpec {
    pub transaction_hash: H256,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub recommended_actions: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AlertSpec {
    pub fn new(
        transaction_hash: H256,
        alert_type: AlertType,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            transaction_hash,
            alert_type,
            severity,
            title: title.into(),
            message: message.into(),
            recommended_actions: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recommended_actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Alert sink. Implementations must be cheap to call concurrently.
#[async_trait]
pub trait NotificationChannel: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn is_enabled(&self) -> bool;
    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

#[derive(Debug, Clone)]
pub struct LogChannel {
    enabled: bool,
}

impl LogChannel {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let hash = format!("{:?}", alert.transaction_hash);
        match alert.severity {
            AlertSeverity::Info => {
                info!(alert_id = %alert.id, tx = %hash, kind = alert.alert_type.as_str(), "{}", alert.message)
            }
            AlertSeverity::Warning => {
                warn!(alert_id = %alert.id, tx = %hash, kind = alert.alert_type.as_str(), "{}", alert.message)
            }
            AlertSeverity::Error | AlertSeverity::Critical => error!(
                alert_id = %alert.id,
                tx = %hash,
                kind = alert.alert_type.as_str(),
                severity = %alert.severity,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

async fn post_json(
    client: &reqwest::Client,
    channel: &str,
    url: &str,
    body: &serde_json::Value,
) -> Result<(), AlertError> {
    let policy = delivery_policy();
    retry_with_backoff(
        &policy,
        &CancellationToken::new(),
        |failure: &DeliveryFailure| failure.transient,
        move |_| async move {
            let response = client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|e| DeliveryFailure {
                    reason: e.to_string(),
                    transient: !e.is_builder(),
                })?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(DeliveryFailure {
                    reason: format!("HTTP {status}"),
                    transient: is_transient_status(status),
                })
            }
        },
    )
    .await
    .map_err(|e| AlertError::Delivery {
        channel: channel.to_string(),
        reason: e
            .into_inner()
            .map(|failure| failure.reason)
            .unwrap_or_else(|| "delivery cancelled".to_string()),
    })
}

/// Short schedule; the dispatcher's per-channel timeout bounds the total.
fn delivery_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(250),
        backoff_factor: 2.0,
        max_delay: Duration::from_secs(2),
        jitter: 0.1,
    }
}

/// Rate limiting and server errors may clear up; other statuses will not.
fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

#[derive(Debug)]
struct DeliveryFailure {
    reason: String,
    transient: bool,
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Posts the alert as JSON to an arbitrary endpoint.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    enabled: bool,
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, enabled: bool, client: reqwest::Client) -> Self {
        Self {
            enabled,
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let body = serde_json::to_value(alert).map_err(|e| AlertError::Delivery {
            channel: self.name().to_string(),
            reason: e.to_string(),
        })?;
        post_json(&self.client, self.name(), &self.url, &body).await
    }
}

#[derive(Debug, Clone)]
pub struct SlackChannel {
    enabled: bool,
    webhook_url: String,
    channel: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(
        webhook_url: impl Into<String>,
        channel: Option<String>,
        enabled: bool,
        client: reqwest::Client,
    ) -> Self {
        Self {
            enabled,
            webhook_url: webhook_url.into(),
            channel,
            client,
        }
    }

    fn payload(&self, alert: &Alert) -> serde_json::Value {
        let color = match alert.severity {
            AlertSeverity::Info => "#439FE0",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error | AlertSeverity::Critical => "danger",
        };
        let mut body = json!({
            "text": format!("[{}] {}", alert.severity.as_str().to_uppercase(), alert.title),
            "attachments": [{
                "color": color,
                "text": alert.message,
                "fields": [
                    { "title": "Transaction", "value": format!("{:?}", alert.transaction_hash), "short": false },
                    { "title": "Type", "value": alert.alert_type.as_str(), "short": true },
                    { "title": "Action required", "value": alert.action_required.to_string(), "short": true },
                ],
            }],
        });
        if let Some(channel) = &self.channel {
            body["channel"] = json!(channel);
        }
        body
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        post_json(&self.client, self.name(), &self.webhook_url, &self.payload(alert)).await
    }
}

/// Hands the alert to an HTTP mail relay.
#[derive(Debug, Clone)]
pub struct EmailChannel {
    enabled: bool,
    relay_url: String,
    from: String,
    to: Vec<String>,
    client: reqwest::Client,
}

impl EmailChannel {
    pub fn new(
        relay_url: impl Into<String>,
        from: impl Into<String>,
        to: Vec<String>,
        enabled: bool,
        client: reqwest::Client,
    ) -> Self {
        Self {
            enabled,
            relay_url: relay_url.into(),
            from: from.into(),
            to,
            client,
        }
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let mut body = format!("{}\n\nTransaction: {:?}\n", alert.message, alert.transaction_hash);
        if !alert.recommended_actions.is_empty() {
            body.push_str("\nRecommended actions:\n");
            for action in &alert.recommended_actions {
                body.push_str(&format!("- {}\n", action));
            }
        }
        let payload = json!({
            "from": self.from,
            "to": self.to,
            "subject": format!("[{}] {}", alert.severity, alert.title),
            "text": body,
        });
        post_json(&self.client, self.name(), &self.relay_url, &payload).await
    }
}

/// Builds the configured channels sharing one HTTP client.
pub fn channels_from_config(cfg: &AlertConfig) -> Vec<Arc<dyn NotificationChannel>> {
    let client = reqwest::Client::builder()
        .timeout(cfg.channel_timeout())
        .build()
        .unwrap_or_default();
    cfg.channels
        .iter()
        .map(|channel| -> Arc<dyn NotificationChannel> {
            match channel {
                ChannelConfig::Log { enabled } => Arc::new(LogChannel::new(*enabled)),
                ChannelConfig::Webhook { enabled, url } => {
                    Arc::new(WebhookChannel::new(url.clone(), *enabled, client.clone()))
                }
                ChannelConfig::Slack {
                    enabled,
                    webhook_url,
                    channel,
                } => Arc::new(SlackChannel::new(
                    webhook_url.clone(),
                    channel.clone(),
                    *enabled,
                    client.clone(),
                )),
                ChannelConfig::Email {
                    enabled,
                    relay_url,
                    from,
                    to,
                } => Arc::new(EmailChannel::new(
                    relay_url.clone(),
                    from.clone(),
                    to.clone(),
                    *enabled,
                    client.clone(),
                )),
            }
        })
        .collect()
}

/// Per-channel result of one dispatch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, AlertError)>,
}

#[derive(Debug)]
pub struct AlertManager {
    channels: Vec<Arc<dyn NotificationChannel>>,
    history: RwLock<VecDeque<Alert>>,
    max_history: usize,
    channel_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl AlertManager {
    pub fn new(cfg: &AlertConfig, channels: Vec<Arc<dyn NotificationChannel>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            channels,
            history: RwLock::new(VecDeque::new()),
            max_history: cfg.max_history,
            channel_timeout: cfg.channel_timeout(),
            clock,
        }
    }

    /// Records a new alert in the history. Delivery is a separate step.
    pub fn create_alert(&self, spec: AlertSpec) -> Alert {
        let action_required = spec.severity >= AlertSeverity::Error;
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            transaction_hash: spec.transaction_hash,
            alert_type: spec.alert_type,
            severity: spec.severity,
            title: spec.title,
            message: spec.message,
            acknowledged: false,
            action_required,
            recommended_actions: spec.recommended_actions,
            created_at: self.clock.now(),
            metadata: spec.metadata,
        };
        ALERTS_TOTAL
            .with_label_values(&[alert.alert_type.as_str(), alert.severity.as_str()])
            .inc();

        let mut history = self.history.write();
        while history.len() >= self.max_history {
            history.pop_front();
        }
        history.push_back(alert.clone());
        alert
    }

    /// Delivers to every enabled channel concurrently.
    pub async fn dispatch(&self, alert: &Alert) -> DispatchReport {
        let deliveries = self
            .channels
            .iter()
            .filter(|channel| channel.is_enabled())
            .map(|channel| async move {
                let name = channel.name().to_string();
                let result = match tokio::time::timeout(self.channel_timeout, channel.send(alert)).await {
                    Ok(result) => result,
                    Err(_) => Err(AlertError::Timeout { channel: name.clone() }),
                };
                (name, result)
            });

        let mut report = DispatchReport::default();
        for (name, result) in futures::future::join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered.push(name),
                Err(e) => {
                    warn!(channel = %name, alert_id = %alert.id, error = %e, "Alert delivery failed");
                    ALERT_DELIVERY_FAILURES.with_label_values(&[&name]).inc();
                    report.failed.push((name, e));
                }
            }
        }
        debug!(
            alert_id = %alert.id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Alert dispatched"
        );
        report
    }

    /// Creates the alert and delivers it in the background.
    pub fn raise(self: &Arc<Self>, spec: AlertSpec) -> Alert {
        let alert = self.create_alert(spec);
        let manager = Arc::clone(self);
        let delivery = alert.clone();
        tokio::spawn(async move {
            manager.dispatch(&delivery).await;
        });
        alert
    }

    pub fn acknowledge(&self, id: &str) -> Result<(), AlertError> {
        let mut history = self.history.write();
        let alert = history
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| AlertError::UnknownAlert(id.to_string()))?;
        alert.acknowledged = true;
        Ok(())
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.history.read().iter().filter(|a| !a.acknowledged).cloned().collect()
    }

    pub fn alerts_for(&self, hash: H256) -> Vec<Alert> {
        self.history
            .read()
            .iter()
            .filter(|a| a.transaction_hash == hash)
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}
