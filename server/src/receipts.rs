use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use uuid::Uuid;

use crate::db::{now_ms, uuid_col};
use crate::messages::{self, DeliveryStatus};

/// Record receipts for `reader_id` in one transaction.
///
/// With `message_ids` set only those messages are considered; otherwise every
/// message from the other participant is. Messages outside the conversation or
/// sent by the reader are skipped, and existing receipts are left untouched.
/// Returns the ids that received a receipt in this call.
pub fn mark_read(
    conn: &mut Connection,
    conversation_id: &Uuid,
    reader_id: &str,
    message_ids: Option<&[Uuid]>,
) -> Result<Vec<Uuid>> {
    let tx = conn.transaction()?;
    let candidates: Vec<Uuid> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM messages m WHERE conversation_id = ?1 AND sender_id <> ?2 \
             AND NOT EXISTS (SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.reader_id = ?2) \
             ORDER BY created_at",
        )?;
        let unread = stmt
            .query_map(params![conversation_id.to_string(), reader_id], |row| {
                uuid_col(row, 0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        match message_ids {
            Some(wanted) => {
                let wanted: HashSet<&Uuid> = wanted.iter().collect();
                unread.into_iter().filter(|id| wanted.contains(id)).collect()
            }
            None => unread,
        }
    };

    let now = now_ms();
    let mut marked = Vec::with_capacity(candidates.len());
    {
        let mut insert = tx.prepare(
            "INSERT OR IGNORE INTO read_receipts (message_id, reader_id, read_at) VALUES (?1, ?2, ?3)",
        )?;
        for id in candidates {
            if insert.execute(params![id.to_string(), reader_id, now])? == 1 {
                marked.push(id);
            }
        }
    }
    messages::advance_status(&tx, &marked, DeliveryStatus::Read)?;
    tx.commit()?;
    Ok(marked)
}

/// Messages from the other participant that `user_id` has no receipt for.
pub fn unread_count(conn: &Connection, conversation_id: &Uuid, user_id: &str) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM messages m WHERE m.conversation_id = ?1 AND m.sender_id <> ?2 \
         AND NOT EXISTS (SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.reader_id = ?2)",
        params![conversation_id.to_string(), user_id],
        |row| row.get::<_, u32>(0),
    )?;
    Ok(count)
}
