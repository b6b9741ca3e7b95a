pub use delivery_api::{DeliveryStatus, MessageRecord};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::db::{now_ms, uuid_col};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, text, created_at, status, client_temp_id";

/// Upper bound on a single history page.
pub const MAX_PAGE: usize = 200;

/// Outcome of persisting a send.
#[derive(Debug, Clone)]
pub struct Persisted {
    pub message: MessageRecord,
    /// True when the idempotency token matched an earlier send and nothing was written.
    pub replayed: bool,
}

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let status: String = row.get(5)?;
    Ok(MessageRecord {
        id: uuid_col(row, 0)?,
        conversation_id: uuid_col(row, 1)?,
        sender_id: row.get(2)?,
        text: row.get(3)?,
        created_at: row.get(4)?,
        status: DeliveryStatus::parse(&status).unwrap_or(DeliveryStatus::Sent),
        client_temp_id: row.get(6)?,
    })
}

/// Look up an earlier send by its client idempotency token. Tokens are scoped
/// to one conversation.
pub fn find_by_temp_id(
    conn: &Connection,
    conversation_id: &Uuid,
    sender_id: &str,
    client_temp_id: &str,
) -> Result<Option<MessageRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE sender_id = ?1 AND client_temp_id = ?2 AND conversation_id = ?3"
    ))?;
    let msg = stmt
        .query_row(
            params![sender_id, client_temp_id, conversation_id.to_string()],
            row_to_msg,
        )
        .optional()?;
    Ok(msg)
}

pub fn get_message(conn: &Connection, id: &Uuid) -> Result<Option<MessageRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
    let msg = stmt.query_row([id.to_string()], row_to_msg).optional()?;
    Ok(msg)
}

/// Persist a new message with a server timestamp strictly greater than every
/// earlier message in the same conversation.
pub fn create_message(
    conn: &mut Connection,
    conversation_id: &Uuid,
    sender_id: &str,
    text: &str,
    client_temp_id: Option<&str>,
) -> Result<Persisted> {
    if text.trim().is_empty() {
        return Err(anyhow!("empty_message"));
    }
    if let Some(key) = client_temp_id {
        if let Some(existing) = find_by_temp_id(conn, conversation_id, sender_id, key)? {
            return Ok(Persisted {
                message: existing,
                replayed: true,
            });
        }
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let last: Option<i64> = tx.query_row(
        "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
        [conversation_id.to_string()],
        |row| row.get(0),
    )?;
    let now = now_ms();
    let created_at = match last {
        Some(last) if last >= now => last + 1,
        _ => now,
    };
    let id = Uuid::new_v4();
    let res = tx.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, text, created_at, status, client_temp_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id.to_string(),
            conversation_id.to_string(),
            sender_id,
            text,
            created_at,
            DeliveryStatus::Sent.as_str(),
            client_temp_id
        ],
    );
    match res {
        Ok(_) => {}
        Err(e)
            if client_temp_id.is_some()
                && e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) =>
        {
            // A concurrent send with the same token won the insert.
            drop(tx);
            let key = client_temp_id.unwrap_or_default();
            let existing = find_by_temp_id(conn, conversation_id, sender_id, key)?
                .ok_or_else(|| anyhow!("idempotency_conflict"))?;
            return Ok(Persisted {
                message: existing,
                replayed: true,
            });
        }
        Err(e) => return Err(e.into()),
    }
    tx.commit()?;

    Ok(Persisted {
        message: MessageRecord {
            id,
            conversation_id: *conversation_id,
            sender_id: sender_id.into(),
            text: text.into(),
            created_at,
            status: DeliveryStatus::Sent,
            client_temp_id: client_temp_id.map(str::to_string),
        },
        replayed: false,
    })
}

/// Chronological history, optionally only messages strictly newer than `since`.
/// An unknown conversation yields an empty list.
pub fn list_messages(
    conn: &Connection,
    conversation_id: &Uuid,
    since: Option<i64>,
    limit: usize,
) -> Result<Vec<MessageRecord>> {
    let limit = limit.clamp(1, MAX_PAGE);
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 AND created_at > ?2 \
         ORDER BY created_at ASC LIMIT ?3"
    ))?;
    let msgs = stmt
        .query_map(
            params![conversation_id.to_string(), since.unwrap_or(i64::MIN), limit as i64],
            row_to_msg,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(msgs)
}

/// Move messages forward to `status`; messages already at or past it are untouched.
/// Returns the number of rows that changed.
pub fn advance_status(conn: &Connection, ids: &[Uuid], status: DeliveryStatus) -> Result<usize> {
    let sql = match status {
        DeliveryStatus::Sent => return Ok(0),
        DeliveryStatus::Delivered => {
            "UPDATE messages SET status = 'delivered' WHERE id = ?1 AND status = 'sent'"
        }
        DeliveryStatus::Read => {
            "UPDATE messages SET status = 'read' WHERE id = ?1 AND status IN ('sent', 'delivered')"
        }
    };
    let mut stmt = conn.prepare(sql)?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute([id.to_string()])?;
    }
    Ok(changed)
}

/// Number of messages a user has sent since `since_ms`.
pub fn count_sent_since(conn: &Connection, sender_id: &str, since_ms: i64) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE sender_id = ?1 AND created_at >= ?2",
        params![sender_id, since_ms],
        |row| row.get::<_, u32>(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conversations, db};

    fn setup() -> (Connection, Uuid) {
        let conn = db::init_db(":memory:").unwrap();
        let c = conversations::get_or_create_conversation(&conn, "alice", "bob").unwrap();
        (conn, c.id)
    }

    #[test]
    fn create_and_validate() {
        let (mut conn, cid) = setup();
        assert!(create_message(&mut conn, &cid, "alice", "  ", None).is_err());
        let m = create_message(&mut conn, &cid, "alice", "hi", None).unwrap();
        assert!(!m.replayed);
        assert_eq!(m.message.text, "hi");
        assert_eq!(m.message.status, DeliveryStatus::Sent);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let (mut conn, cid) = setup();
        let mut last = i64::MIN;
        for i in 0..20 {
            let sender = if i % 2 == 0 { "alice" } else { "bob" };
            let m = create_message(&mut conn, &cid, sender, "burst", None).unwrap();
            assert!(m.message.created_at > last);
            last = m.message.created_at;
        }
        let all = list_messages(&conn, &cid, None, 50).unwrap();
        assert_eq!(all.len(), 20);
        assert!(all.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[test]
    fn temp_id_replays_existing() {
        let (mut conn, cid) = setup();
        let first = create_message(&mut conn, &cid, "alice", "hi", Some("tmp-1")).unwrap();
        let second = create_message(&mut conn, &cid, "alice", "hi", Some("tmp-1")).unwrap();
        assert!(second.replayed);
        assert_eq!(first.message.id, second.message.id);
        // the same token from a different sender is a different send
        let other = create_message(&mut conn, &cid, "bob", "hi", Some("tmp-1")).unwrap();
        assert!(!other.replayed);
        assert_eq!(list_messages(&conn, &cid, None, 50).unwrap().len(), 2);
    }

    #[test]
    fn temp_id_is_scoped_to_conversation() {
        let (mut conn, bob_cid) = setup();
        let carol_cid = conversations::get_or_create_conversation(&conn, "alice", "carol")
            .unwrap()
            .id;
        let to_bob = create_message(&mut conn, &bob_cid, "alice", "to bob", Some("t1")).unwrap();
        let to_carol =
            create_message(&mut conn, &carol_cid, "alice", "to carol", Some("t1")).unwrap();
        assert!(!to_carol.replayed);
        assert_ne!(to_bob.message.id, to_carol.message.id);
        assert_eq!(to_carol.message.conversation_id, carol_cid);
        let carol_history = list_messages(&conn, &carol_cid, None, 50).unwrap();
        assert_eq!(carol_history.len(), 1);
        assert_eq!(carol_history[0].text, "to carol");
    }

    #[test]
    fn since_cursor_and_unknown_conversation() {
        let (mut conn, cid) = setup();
        let m1 = create_message(&mut conn, &cid, "alice", "one", None).unwrap();
        create_message(&mut conn, &cid, "alice", "two", None).unwrap();
        let newer = list_messages(&conn, &cid, Some(m1.message.created_at), 50).unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].text, "two");
        assert!(list_messages(&conn, &Uuid::new_v4(), None, 50)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn status_only_moves_forward() {
        let (mut conn, cid) = setup();
        let m = create_message(&mut conn, &cid, "alice", "hi", None).unwrap();
        let ids = [m.message.id];
        assert_eq!(advance_status(&conn, &ids, DeliveryStatus::Read).unwrap(), 1);
        assert_eq!(advance_status(&conn, &ids, DeliveryStatus::Delivered).unwrap(), 0);
        let stored = get_message(&conn, &m.message.id).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Read);
    }
}
