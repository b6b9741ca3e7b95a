use anyhow::Result;
use async_trait::async_trait;
use delivery_api::Platform;
use serde::Serialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::DbPool;
use crate::devices::{self, DeviceAddress};

/// Content of an out-of-band notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The provider reports the address can never be delivered to again.
    #[error("address is no longer registered")]
    InvalidAddress,
    #[error("push provider failure: {0}")]
    Transient(String),
}

/// A push provider delivers a single notification to a single address.
#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn push(&self, device: &DeviceAddress, note: &Notification) -> Result<(), PushError>;
}

/// Provider that only logs what would have been pushed.
#[derive(Clone, Default)]
pub struct LogProvider;

#[async_trait]
impl PushProvider for LogProvider {
    async fn push(&self, device: &DeviceAddress, note: &Notification) -> Result<(), PushError> {
        info!(
            user_id = %device.user_id,
            platform = device.platform.as_str(),
            title = %note.title,
            "push notification"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    to: &'a str,
    platform: Platform,
    title: &'a str,
    body: &'a str,
    data: &'a Value,
}

/// Provider that forwards notifications as JSON to an HTTP push relay.
///
/// 404 and 410 responses, or a body carrying `"error": "DeviceNotRegistered"`,
/// mark the address as permanently invalid. Everything else is transient.
#[derive(Clone)]
pub struct WebhookProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookProvider {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl PushProvider for WebhookProvider {
    async fn push(&self, device: &DeviceAddress, note: &Notification) -> Result<(), PushError> {
        let payload = WebhookPayload {
            to: &device.address,
            platform: device.platform,
            title: &note.title,
            body: &note.body,
            data: &note.data,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PushError::Transient(e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(PushError::InvalidAddress);
        }
        if !status.is_success() {
            return Err(PushError::Transient(format!("status {status}")));
        }
        let body: Option<Value> = resp.json().await.ok();
        match body.as_ref().and_then(|b| b.get("error")).and_then(Value::as_str) {
            Some("DeviceNotRegistered") => Err(PushError::InvalidAddress),
            Some(other) => Err(PushError::Transient(other.to_string())),
            None => Ok(()),
        }
    }
}

/// Summary of one `notify` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NotifyReport {
    pub attempted: usize,
    pub delivered: usize,
    pub invalidated: usize,
}

/// Best-effort delivery to every active address of a user.
pub struct NotificationGateway {
    pool: DbPool,
    provider: Arc<dyn PushProvider>,
    preview_chars: usize,
}

impl NotificationGateway {
    pub fn new(pool: DbPool, provider: Arc<dyn PushProvider>, preview_chars: usize) -> Self {
        Self {
            pool,
            provider,
            preview_chars,
        }
    }

    /// Shorten message text for use as a notification body.
    pub fn preview(&self, text: &str) -> String {
        truncate_preview(text, self.preview_chars)
    }

    /// Push to all active addresses, deactivating any the provider rejects as
    /// invalid. Failures are logged and never returned.
    pub async fn notify(&self, user_id: &str, title: &str, body: &str, data: Value) -> NotifyReport {
        let mut report = NotifyReport::default();
        let targets = match self
            .pool
            .get()
            .map_err(anyhow::Error::from)
            .and_then(|conn| devices::active_addresses(&conn, user_id))
        {
            Ok(t) => t,
            Err(e) => {
                warn!(user_id, error = %e, "could not load notification addresses");
                return report;
            }
        };
        if targets.is_empty() {
            debug!(user_id, "no active notification addresses");
            return report;
        }
        let note = Notification {
            title: title.to_string(),
            body: body.to_string(),
            data,
        };
        for device in &targets {
            report.attempted += 1;
            match self.provider.push(device, &note).await {
                Ok(()) => report.delivered += 1,
                Err(PushError::InvalidAddress) => {
                    warn!(user_id, address = %device.address, "deactivating invalid address");
                    match self
                        .pool
                        .get()
                        .map_err(anyhow::Error::from)
                        .and_then(|conn| devices::deactivate_address(&conn, user_id, &device.address))
                    {
                        Ok(_) => report.invalidated += 1,
                        Err(e) => warn!(user_id, error = %e, "could not deactivate address"),
                    }
                }
                Err(e) => warn!(user_id, address = %device.address, error = %e, "push failed"),
            }
        }
        report
    }

    /// Run `notify` in the background. The caller never observes the outcome.
    pub fn spawn_notify(
        self: &Arc<Self>,
        user_id: String,
        title: String,
        body: String,
        data: Value,
    ) -> JoinHandle<NotifyReport> {
        let gateway = self.clone();
        tokio::spawn(async move { gateway.notify(&user_id, &title, &body, data).await })
    }

    pub fn register_address(&self, user_id: &str, address: &str, platform: Platform) -> Result<()> {
        let conn = self.pool.get()?;
        devices::register_address(&conn, user_id, address, platform)
    }

    pub fn deregister_address(&self, user_id: &str, address: &str) -> Result<()> {
        let conn = self.pool.get()?;
        devices::deactivate_address(&conn, user_id, address)?;
        Ok(())
    }

    pub fn addresses(&self, user_id: &str) -> Result<Vec<DeviceAddress>> {
        let conn = self.pool.get()?;
        devices::all_addresses(&conn, user_id)
    }
}

/// Cut `text` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_preview(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}
