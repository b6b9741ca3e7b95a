use anyhow::Result;
use delivery_api::SendResponse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{QueueStore, QueuedMessage};
use crate::transport::{Transport, TransportError};

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SEND_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Pause after each successful send while draining.
    pub send_delay: Duration,
    /// Entries older than this are discarded without a send attempt.
    pub expiry: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            send_delay: DEFAULT_SEND_DELAY,
            expiry: DEFAULT_EXPIRY,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub expired: usize,
    /// Entries the server refused permanently; dropped without retry.
    pub rejected: usize,
    pub remaining: usize,
    /// Another drain pass was already running; nothing was done.
    pub skipped: bool,
}

/// Result of [`OfflineQueue::send_or_enqueue`].
#[derive(Debug)]
pub enum SendAttempt {
    Sent(SendResponse),
    Queued(QueuedMessage),
    /// Validation or entitlement failure; the message was not queued.
    Rejected(TransportError),
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Durable backlog of messages the server has not acknowledged yet.
///
/// Entries leave the queue when the transport reports success, when the
/// server rejects them permanently, or when they expire. Draining is strictly
/// in enqueue order and stops at the first retryable failure.
pub struct OfflineQueue {
    store: QueueStore,
    pending: Mutex<Vec<QueuedMessage>>,
    transport: Arc<dyn Transport>,
    options: QueueOptions,
    draining: AtomicBool,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OfflineQueue {
    /// Load any persisted backlog from `store`.
    pub async fn open(
        store: QueueStore,
        transport: Arc<dyn Transport>,
        options: QueueOptions,
    ) -> Result<Self> {
        let pending = store.load().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), file = %store.path().display(), "loaded offline backlog");
        }
        Ok(Self {
            store,
            pending: Mutex::new(pending),
            transport,
            options,
            draining: AtomicBool::new(false),
        })
    }

    pub async fn enqueue(&self, conversation_id: Uuid, text: &str) -> Result<QueuedMessage> {
        self.enqueue_at(conversation_id, text, now_ms()).await
    }

    pub async fn enqueue_at(
        &self,
        conversation_id: Uuid,
        text: &str,
        created_at: i64,
    ) -> Result<QueuedMessage> {
        let entry = QueuedMessage {
            client_temp_id: Uuid::new_v4().to_string(),
            conversation_id,
            text: text.to_string(),
            created_at,
        };
        self.push(entry.clone()).await?;
        Ok(entry)
    }

    async fn push(&self, entry: QueuedMessage) -> Result<()> {
        let mut pending = self.pending.lock().await;
        pending.push(entry);
        self.store.save(&pending).await
    }

    pub async fn pending(&self) -> Vec<QueuedMessage> {
        self.pending.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Try the server straight away. Connectivity and transient failures land
    /// in the queue; permanent rejections go back to the caller. A non-empty
    /// backlog is never overtaken.
    pub async fn send_or_enqueue(&self, conversation_id: Uuid, text: &str) -> Result<SendAttempt> {
        let entry = QueuedMessage {
            client_temp_id: Uuid::new_v4().to_string(),
            conversation_id,
            text: text.to_string(),
            created_at: now_ms(),
        };
        if !self.is_empty().await {
            debug!(client_temp_id = %entry.client_temp_id, "backlog pending, queueing behind it");
            self.push(entry.clone()).await?;
            return Ok(SendAttempt::Queued(entry));
        }
        match self.transport.send(&entry).await {
            Ok(resp) => Ok(SendAttempt::Sent(resp)),
            Err(e) if e.is_permanent() => {
                warn!(client_temp_id = %entry.client_temp_id, error = %e, "send rejected");
                Ok(SendAttempt::Rejected(e))
            }
            Err(e) => {
                warn!(client_temp_id = %entry.client_temp_id, error = %e, "send failed, queued for later");
                self.push(entry.clone()).await?;
                Ok(SendAttempt::Queued(entry))
            }
        }
    }

    async fn remove(&self, client_temp_id: &str) -> Result<()> {
        let mut pending = self.pending.lock().await;
        pending.retain(|m| m.client_temp_id != client_temp_id);
        self.store.save(&pending).await
    }

    /// One pass over the backlog. Returns immediately with `skipped` set if a
    /// pass is already running. A permanently rejected head is dropped and the
    /// pass continues; any other failure ends it.
    pub async fn drain(&self) -> Result<DrainReport> {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("drain already in progress");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = DrainGuard(&self.draining);
        let expiry_ms = i64::try_from(self.options.expiry.as_millis()).unwrap_or(i64::MAX);
        let mut report = DrainReport::default();

        loop {
            let Some(head) = self.pending.lock().await.first().cloned() else {
                break;
            };
            if now_ms() - head.created_at > expiry_ms {
                info!(client_temp_id = %head.client_temp_id, "dropping expired queued message");
                self.remove(&head.client_temp_id).await?;
                report.expired += 1;
                continue;
            }
            match self.transport.send(&head).await {
                Ok(resp) => {
                    debug!(client_temp_id = %head.client_temp_id, message_id = %resp.message_id, "queued message sent");
                    self.remove(&head.client_temp_id).await?;
                    report.sent += 1;
                    if !self.is_empty().await && !self.options.send_delay.is_zero() {
                        tokio::time::sleep(self.options.send_delay).await;
                    }
                }
                Err(e) if e.is_permanent() => {
                    warn!(client_temp_id = %head.client_temp_id, error = %e, "dropping rejected queued message");
                    self.remove(&head.client_temp_id).await?;
                    report.rejected += 1;
                }
                Err(e) => {
                    warn!(client_temp_id = %head.client_temp_id, error = %e, "drain stopped");
                    break;
                }
            }
        }

        report.remaining = self.len().await;
        if report.sent > 0 || report.expired > 0 || report.rejected > 0 {
            info!(
                sent = report.sent,
                expired = report.expired,
                rejected = report.rejected,
                remaining = report.remaining,
                "offline queue drained"
            );
        }
        Ok(report)
    }
}

/// Drain `queue` every time `online` flips to `true`, including at start if it
/// already is. The task ends when the sender side is dropped.
pub fn spawn_drain_on_reconnect(
    queue: Arc<OfflineQueue>,
    mut online: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let is_online = *online.borrow_and_update();
            if is_online {
                if let Err(e) = queue.drain().await {
                    warn!(error = %e, "drain failed");
                }
            }
            if online.changed().await.is_err() {
                break;
            }
        }
    })
}
