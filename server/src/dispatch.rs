use delivery_api::{
    Conversation, ConversationSummary, DeliveryStatus, MarkReadRequest, MarkReadResponse,
    MessageRecord, SendRequest, ServerFrame,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::conversations;
use crate::db::DbPool;
use crate::entitlements::Entitlements;
use crate::error::DispatchError;
use crate::messages;
use crate::notify::NotificationGateway;
use crate::presence::PresenceRegistry;
use crate::receipts;

pub const MAX_TEXT_CHARS: usize = 4000;
pub const MAX_TEMP_ID_LEN: usize = 128;

/// How a freshly persisted message left the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Handed to the recipient's live connection.
    Live,
    /// Recipient had no live connection; a notification was queued.
    Notified,
    /// Recipient disconnected between lookup and hand-off. The message stays
    /// durable and is picked up on the next history fetch.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: MessageRecord,
    /// True when the idempotency token matched an earlier send.
    pub replayed: bool,
    /// `None` for replays, which are never delivered a second time.
    pub path: Option<DeliveryPath>,
}

/// Validates, persists and routes messages between conversation participants.
pub struct Dispatcher {
    pool: DbPool,
    presence: Arc<PresenceRegistry>,
    gateway: Arc<NotificationGateway>,
    entitlements: Arc<dyn Entitlements>,
}

impl Dispatcher {
    pub fn new(
        pool: DbPool,
        presence: Arc<PresenceRegistry>,
        gateway: Arc<NotificationGateway>,
        entitlements: Arc<dyn Entitlements>,
    ) -> Self {
        Self {
            pool,
            presence,
            gateway,
            entitlements,
        }
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    pub fn gateway(&self) -> &Arc<NotificationGateway> {
        &self.gateway
    }

    fn participant_conversation(
        &self,
        conn: &rusqlite::Connection,
        conversation_id: &Uuid,
        user_id: &str,
    ) -> Result<Conversation, DispatchError> {
        let conversation = conversations::get_conversation(conn, conversation_id)?
            .ok_or_else(|| DispatchError::not_found("conversation"))?;
        if !conversation.has_participant(user_id) {
            return Err(DispatchError::not_participant());
        }
        Ok(conversation)
    }

    /// Persist a message and route it to the recipient.
    ///
    /// Presence is consulted exactly once after the write. Live delivery and
    /// the notification fallback are mutually exclusive per send; a recipient
    /// reconnecting in between may see the message through both the
    /// notification and history (at-least-once).
    pub fn send(&self, sender: &Identity, req: SendRequest) -> Result<SendOutcome, DispatchError> {
        let text = req.text.trim();
        if text.is_empty() {
            return Err(DispatchError::invalid("text must not be empty"));
        }
        if text.chars().count() > MAX_TEXT_CHARS {
            return Err(DispatchError::invalid("text is too long"));
        }
        let temp_id = req.client_temp_id.as_deref().filter(|t| !t.is_empty());
        if temp_id.map_or(false, |t| t.len() > MAX_TEMP_ID_LEN) {
            return Err(DispatchError::invalid("client_temp_id is too long"));
        }

        let mut conn = self.pool.get()?;
        let conversation =
            self.participant_conversation(&conn, &req.conversation_id, &sender.user_id)?;

        if let Some(key) = temp_id {
            if let Some(existing) = messages::find_by_temp_id(&conn, &conversation.id, &sender.user_id, key)? {
                debug!(client_temp_id = key, message_id = %existing.id, "replayed send");
                return Ok(SendOutcome {
                    message: existing,
                    replayed: true,
                    path: None,
                });
            }
        }

        if !self.entitlements.can_send(&sender.user_id)? {
            info!(user_id = %sender.user_id, "send rejected, message limit reached");
            return Err(DispatchError::Entitlement);
        }

        let persisted =
            messages::create_message(&mut conn, &conversation.id, &sender.user_id, text, temp_id)?;
        drop(conn);
        if persisted.replayed {
            return Ok(SendOutcome {
                message: persisted.message,
                replayed: true,
                path: None,
            });
        }

        let mut message = persisted.message;
        let recipient = conversation
            .peer_of(&sender.user_id)
            .unwrap_or_default()
            .to_string();
        let path = self.route(&message, &recipient, &sender.display_name);
        if path == DeliveryPath::Live {
            message.status = DeliveryStatus::Delivered;
        }
        info!(
            conversation_id = %conversation.id,
            message_id = %message.id,
            path = ?path,
            "message dispatched"
        );
        Ok(SendOutcome {
            message,
            replayed: false,
            path: Some(path),
        })
    }

    fn route(&self, message: &MessageRecord, recipient: &str, sender_name: &str) -> DeliveryPath {
        match self.presence.lookup(recipient) {
            Some(handle) => {
                let mut frame = message.clone();
                frame.client_temp_id = None;
                frame.status = DeliveryStatus::Delivered;
                if !handle.deliver(ServerFrame::Message(frame)) {
                    warn!(
                        user_id = recipient,
                        message_id = %message.id,
                        "recipient went away before live delivery"
                    );
                    return DeliveryPath::Dropped;
                }
                if let Err(e) = self.mark_delivered(&message.id) {
                    warn!(message_id = %message.id, error = %e, "could not record delivery");
                }
                DeliveryPath::Live
            }
            None => {
                let body = self.gateway.preview(&message.text);
                let data = json!({
                    "type": "new_message",
                    "conversation_id": message.conversation_id,
                    "message_id": message.id,
                });
                self.gateway
                    .spawn_notify(recipient.to_string(), sender_name.to_string(), body, data);
                DeliveryPath::Notified
            }
        }
    }

    fn mark_delivered(&self, id: &Uuid) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        messages::advance_status(&conn, &[*id], DeliveryStatus::Delivered)?;
        Ok(())
    }

    /// Record receipts and tell the original sender, if live.
    pub fn mark_read(
        &self,
        reader: &Identity,
        req: MarkReadRequest,
    ) -> Result<MarkReadResponse, DispatchError> {
        let mut conn = self.pool.get()?;
        let conversation =
            self.participant_conversation(&conn, &req.conversation_id, &reader.user_id)?;
        let marked = receipts::mark_read(
            &mut conn,
            &conversation.id,
            &reader.user_id,
            req.message_ids.as_deref(),
        )?;
        drop(conn);
        if !marked.is_empty() {
            if let Some(peer) = conversation.peer_of(&reader.user_id) {
                if let Some(handle) = self.presence.lookup(peer) {
                    handle.deliver(ServerFrame::Read {
                        conversation_id: conversation.id,
                        reader_id: reader.user_id.clone(),
                        message_ids: marked.clone(),
                    });
                }
            }
        }
        Ok(MarkReadResponse {
            count: marked.len(),
            message_ids: marked,
        })
    }

    pub fn unread_count(&self, user: &Identity, conversation_id: &Uuid) -> Result<u32, DispatchError> {
        let conn = self.pool.get()?;
        let conversation = self.participant_conversation(&conn, conversation_id, &user.user_id)?;
        Ok(receipts::unread_count(&conn, &conversation.id, &user.user_id)?)
    }

    /// Create or fetch the conversation between the caller and `peer_id`.
    pub fn open_conversation(&self, user: &Identity, peer_id: &str) -> Result<Conversation, DispatchError> {
        let peer_id = peer_id.trim();
        if peer_id.is_empty() {
            return Err(DispatchError::invalid("peer_id is required"));
        }
        if peer_id == user.user_id {
            return Err(DispatchError::invalid("cannot open a conversation with yourself"));
        }
        let conn = self.pool.get()?;
        Ok(conversations::get_or_create_conversation(&conn, &user.user_id, peer_id)?)
    }

    pub fn list_conversations(&self, user: &Identity) -> Result<Vec<ConversationSummary>, DispatchError> {
        let conn = self.pool.get()?;
        let mut out = Vec::new();
        for conversation in conversations::list_conversations_for_user(&conn, &user.user_id)? {
            let unread_count = receipts::unread_count(&conn, &conversation.id, &user.user_id)?;
            let peer_id = conversation
                .peer_of(&user.user_id)
                .unwrap_or_default()
                .to_string();
            out.push(ConversationSummary {
                conversation,
                peer_id,
                unread_count,
            });
        }
        Ok(out)
    }

    /// Unmatch: remove the conversation and everything in it.
    pub fn delete_conversation(&self, user: &Identity, conversation_id: &Uuid) -> Result<(), DispatchError> {
        let mut conn = self.pool.get()?;
        let conversation = self.participant_conversation(&conn, conversation_id, &user.user_id)?;
        conversations::delete_conversation(&mut conn, &conversation.id)?;
        drop(conn);
        info!(conversation_id = %conversation.id, user_id = %user.user_id, "conversation deleted");
        if let Some(peer) = conversation.peer_of(&user.user_id) {
            if let Some(handle) = self.presence.lookup(peer) {
                handle.deliver(ServerFrame::ConversationDeleted {
                    conversation_id: conversation.id,
                });
            }
        }
        Ok(())
    }

    /// Chronological history. A conversation that no longer exists has no
    /// messages rather than being an error.
    pub fn history(
        &self,
        user: &Identity,
        conversation_id: &Uuid,
        since: Option<i64>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DispatchError> {
        let conn = self.pool.get()?;
        match conversations::get_conversation(&conn, conversation_id)? {
            None => Ok(Vec::new()),
            Some(c) if !c.has_participant(&user.user_id) => Err(DispatchError::not_participant()),
            Some(c) => Ok(messages::list_messages(&conn, &c.id, since, limit)?),
        }
    }
}
