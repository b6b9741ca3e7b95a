pub use delivery_api::Conversation;
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::{now_ms, uuid_col};

/// Normalize an unordered pair so that the lexically smaller identity comes first.
pub fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_col(row, 0)?,
        user_a: row.get(1)?,
        user_b: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Create the conversation for a pair, or return the one that already exists.
pub fn get_or_create_conversation(conn: &Connection, a: &str, b: &str) -> Result<Conversation> {
    if a == b {
        return Err(anyhow!("self_conversation"));
    }
    let (user_a, user_b) = ordered_pair(a, b);
    conn.execute(
        "INSERT INTO conversations (id, user_a, user_b, created_at) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(user_a, user_b) DO NOTHING",
        params![Uuid::new_v4().to_string(), user_a, user_b, now_ms()],
    )?;
    let conversation = conn.query_row(
        "SELECT id, user_a, user_b, created_at FROM conversations WHERE user_a = ?1 AND user_b = ?2",
        params![user_a, user_b],
        row_to_conversation,
    )?;
    Ok(conversation)
}

pub fn get_conversation(conn: &Connection, id: &Uuid) -> Result<Option<Conversation>> {
    let mut stmt =
        conn.prepare("SELECT id, user_a, user_b, created_at FROM conversations WHERE id = ?1")?;
    let conversation = stmt
        .query_row([id.to_string()], row_to_conversation)
        .optional()?;
    Ok(conversation)
}

/// List conversations a user takes part in, oldest first.
pub fn list_conversations_for_user(conn: &Connection, user_id: &str) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_a, user_b, created_at FROM conversations \
         WHERE user_a = ?1 OR user_b = ?1 ORDER BY created_at",
    )?;
    let conversations = stmt
        .query_map([user_id], row_to_conversation)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(conversations)
}

/// Delete a conversation together with its messages and their receipts.
/// Returns false when nothing was deleted.
pub fn delete_conversation(conn: &mut Connection, id: &Uuid) -> Result<bool> {
    let id = id.to_string();
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM read_receipts WHERE message_id IN \
         (SELECT id FROM messages WHERE conversation_id = ?1)",
        [&id],
    )?;
    tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [&id])?;
    let removed = tx.execute("DELETE FROM conversations WHERE id = ?1", [&id])?;
    tx.commit()?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, messages};

    #[test]
    fn creation_is_idempotent_per_pair() {
        let conn = db::init_db(":memory:").unwrap();
        let first = get_or_create_conversation(&conn, "alice", "bob").unwrap();
        let again = get_or_create_conversation(&conn, "bob", "alice").unwrap();
        assert_eq!(first, again);
        let other = get_or_create_conversation(&conn, "alice", "carol").unwrap();
        assert_ne!(first.id, other.id);
        assert_eq!(list_conversations_for_user(&conn, "alice").unwrap().len(), 2);
        assert_eq!(list_conversations_for_user(&conn, "bob").unwrap().len(), 1);
        assert!(get_or_create_conversation(&conn, "alice", "alice").is_err());
    }

    #[test]
    fn delete_cascades_to_messages() {
        let mut conn = db::init_db(":memory:").unwrap();
        let c = get_or_create_conversation(&conn, "alice", "bob").unwrap();
        messages::create_message(&mut conn, &c.id, "alice", "hi", None).unwrap();
        messages::create_message(&mut conn, &c.id, "bob", "hey", None).unwrap();
        assert!(delete_conversation(&mut conn, &c.id).unwrap());
        assert!(get_conversation(&conn, &c.id).unwrap().is_none());
        assert!(messages::list_messages(&conn, &c.id, None, 50).unwrap().is_empty());
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
        assert!(!delete_conversation(&mut conn, &c.id).unwrap());
    }

    #[test]
    fn pair_order_is_canonical() {
        assert_eq!(ordered_pair("b", "a"), ("a", "b"));
        assert_eq!(ordered_pair("a", "b"), ("a", "b"));
    }
}
