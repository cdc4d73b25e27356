use crate::Database;
use crate::models::{MessageRow, NewMessage, ReadAdvance, UserRow, from_micros, now_micros};
use anyhow::Result;
use rusqlite::{Connection, Row, TransactionBehavior};

use parley_types::models::{ConversationId, MessageId, UserId};

/// Message columns, plus whether the recipient (the participant who is not
/// the sender) has a cursor at or past the message.
pub(crate) const MESSAGE_COLUMNS: &str = "
    m.id, m.conversation_id, m.sender_id, m.content, m.attachment_ref, m.is_system, m.created_at,
    m.id <= COALESCE(
        (SELECT rc.last_read_message_id FROM read_cursors rc
          WHERE rc.conversation_id = m.conversation_id AND rc.user_id != m.sender_id),
        0)";

impl Database {
    // -- Users --

    /// Insert or refresh a platform identity.
    pub fn upsert_user(&self, id: UserId, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    updated_at = excluded.updated_at",
                rusqlite::params![id, username, now_micros()],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT id, username FROM users WHERE id = ?1", [id], |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                })
            })
            .optional()
        })
    }

    // -- Messages --

    /// Append a message. `created_at` is clamped so it never precedes the
    /// newest message already in the conversation.
    pub fn append_message(&self, msg: &NewMessage<'_>) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let newest: Option<i64> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                [msg.conversation_id],
                |row| row.get(0),
            )?;
            let created_at = newest.map_or(now_micros(), |newest| newest.max(now_micros()));

            tx.execute(
                "INSERT INTO messages (conversation_id, sender_id, content, attachment_ref, is_system, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    msg.conversation_id,
                    msg.sender_id,
                    msg.content,
                    msg.attachment_ref,
                    msg.is_system,
                    created_at
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(MessageRow {
                id,
                conversation_id: msg.conversation_id,
                sender_id: msg.sender_id,
                content: msg.content.to_string(),
                attachment_ref: msg.attachment_ref.map(str::to_string),
                is_system: msg.is_system,
                created_at: from_micros(created_at),
                is_read: false,
            })
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"),
                [id],
                message_from_row,
            )
            .optional()
        })
    }

    /// A page of messages in ascending `(created_at, id)` order. `before`
    /// restricts the page to messages older than that id.
    pub fn list_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, conversation_id, before, limit))
    }

    // -- Read state --

    pub fn read_cursor(&self, conversation_id: ConversationId, user_id: UserId) -> Result<MessageId> {
        self.with_conn(|conn| query_cursor(conn, conversation_id, user_id))
    }

    /// Move the cursor to `max(current, message_id)`. Returns the resulting position.
    pub fn advance_read_cursor(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<MessageId> {
        self.with_conn(|conn| {
            upsert_cursor(conn, conversation_id, user_id, message_id)?;
            query_cursor(conn, conversation_id, user_id)
        })
    }

    /// Mark everything in the conversation read for `user_id`.
    ///
    /// Records a receipt for each peer message past the cursor and advances
    /// the cursor to the newest message, all in one transaction. Only
    /// receipts inserted by this call are returned, so concurrent or
    /// repeated calls never report the same message twice.
    pub fn mark_read(&self, conversation_id: ConversationId, user_id: UserId) -> Result<ReadAdvance> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let cursor = query_cursor(&tx, conversation_id, user_id)?;
            let newest: Option<MessageId> = tx.query_row(
                "SELECT MAX(id) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )?;

            let Some(newest) = newest.filter(|newest| *newest > cursor) else {
                return Ok(ReadAdvance {
                    cursor,
                    newly_read: vec![],
                });
            };

            let candidates = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m
                     WHERE m.conversation_id = ?1 AND m.id > ?2 AND m.id <= ?3 AND m.sender_id != ?4
                     ORDER BY m.created_at, m.id"
                ))?;
                stmt.query_map(
                    rusqlite::params![conversation_id, cursor, newest, user_id],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let read_at = now_micros();
            let mut newly_read = Vec::with_capacity(candidates.len());
            for mut message in candidates {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![message.id, user_id, read_at],
                )?;
                if inserted == 1 {
                    message.is_read = true;
                    newly_read.push(message);
                }
            }

            upsert_cursor(&tx, conversation_id, user_id, newest)?;
            let cursor = query_cursor(&tx, conversation_id, user_id)?;
            tx.commit()?;

            Ok(ReadAdvance { cursor, newly_read })
        })
    }

    /// Number of receipts recorded for a message.
    pub fn receipt_count(&self, message_id: MessageId) -> Result<u32> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM read_receipts WHERE message_id = ?1",
                [message_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        attachment_ref: row.get(4)?,
        is_system: row.get(5)?,
        created_at: from_micros(row.get(6)?),
        is_read: row.get(7)?,
    })
}

fn query_messages(
    conn: &Connection,
    conversation_id: ConversationId,
    before: Option<MessageId>,
    limit: u32,
) -> Result<Vec<MessageRow>> {
    // Newest page first, then flipped so callers get chronological order
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m
         WHERE m.conversation_id = ?1 AND (?2 IS NULL OR m.id < ?2)
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?3"
    ))?;

    let mut rows = stmt
        .query_map(rusqlite::params![conversation_id, before, limit], message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.reverse();

    Ok(rows)
}

fn query_cursor(conn: &Connection, conversation_id: ConversationId, user_id: UserId) -> Result<MessageId> {
    let cursor = conn
        .query_row(
            "SELECT last_read_message_id FROM read_cursors WHERE conversation_id = ?1 AND user_id = ?2",
            [conversation_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(cursor.unwrap_or(0))
}

pub(crate) fn upsert_cursor(
    conn: &Connection,
    conversation_id: ConversationId,
    user_id: UserId,
    message_id: MessageId,
) -> Result<()> {
    conn.execute(
        "INSERT INTO read_cursors (conversation_id, user_id, last_read_message_id, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(conversation_id, user_id) DO UPDATE SET
            last_read_message_id = MAX(last_read_message_id, excluded.last_read_message_id),
            updated_at = excluded.updated_at",
        rusqlite::params![conversation_id, user_id, message_id, now_micros()],
    )?;
    Ok(())
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, ConversationId) {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(1, "alice").unwrap();
        db.upsert_user(2, "bob").unwrap();
        let (conversation, _) = db.find_or_create_conversation(1, 2).unwrap();
        (db, conversation.id)
    }

    fn send(db: &Database, conversation_id: ConversationId, sender_id: UserId, content: &str) -> MessageRow {
        db.append_message(&NewMessage {
            conversation_id,
            sender_id,
            content,
            attachment_ref: None,
            is_system: false,
        })
        .unwrap()
    }

    #[test]
    fn upsert_user_refreshes_username() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(7, "carol").unwrap();
        db.upsert_user(7, "caroline").unwrap();
        assert_eq!(db.get_user(7).unwrap().unwrap().username, "caroline");
        assert!(db.get_user(8).unwrap().is_none());
    }

    #[test]
    fn messages_come_back_in_send_order() {
        let (db, cid) = setup();
        let sent: Vec<MessageId> = (0..20)
            .map(|i| send(&db, cid, if i % 2 == 0 { 1 } else { 2 }, &format!("m{i}")).id)
            .collect();

        let rows = db.list_messages(cid, None, 100).unwrap();
        assert_eq!(rows.iter().map(|m| m.id).collect::<Vec<_>>(), sent);
        for pair in rows.windows(2) {
            assert!(
                (pair[0].created_at, pair[0].id) < (pair[1].created_at, pair[1].id),
                "ordering must be by created_at then id"
            );
        }
    }

    #[test]
    fn pagination_walks_backwards() {
        let (db, cid) = setup();
        let ids: Vec<MessageId> = (0..5).map(|i| send(&db, cid, 1, &format!("m{i}")).id).collect();

        let page = db.list_messages(cid, None, 2).unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..].to_vec());

        let older = db.list_messages(cid, Some(page[0].id), 2).unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[1..3].to_vec());
    }

    #[test]
    fn attachment_and_system_flag_round_trip() {
        let (db, cid) = setup();
        let row = db
            .append_message(&NewMessage {
                conversation_id: cid,
                sender_id: 1,
                content: "contact unlocked",
                attachment_ref: Some("files/abc"),
                is_system: true,
            })
            .unwrap();
        let stored = db.get_message(row.id).unwrap().unwrap();
        assert_eq!(stored, row);
    }

    #[test]
    fn mark_read_reports_each_peer_message_once() {
        let (db, cid) = setup();
        let a = send(&db, cid, 1, "hi");
        let b = send(&db, cid, 1, "are you there?");
        send(&db, cid, 2, "yes");

        let first = db.mark_read(cid, 2).unwrap();
        assert_eq!(
            first.newly_read.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );
        assert!(first.newly_read.iter().all(|m| m.is_read));

        let second = db.mark_read(cid, 2).unwrap();
        assert_eq!(second.cursor, first.cursor);
        assert!(second.newly_read.is_empty());
        assert_eq!(db.receipt_count(a.id).unwrap(), 1);
    }

    #[test]
    fn is_read_tracks_recipient_cursor() {
        let (db, cid) = setup();
        let from_alice = send(&db, cid, 1, "hi");
        assert!(!db.get_message(from_alice.id).unwrap().unwrap().is_read);

        // Alice reading her own conversation does not mark her message read
        db.mark_read(cid, 1).unwrap();
        assert!(!db.get_message(from_alice.id).unwrap().unwrap().is_read);

        db.mark_read(cid, 2).unwrap();
        assert!(db.get_message(from_alice.id).unwrap().unwrap().is_read);
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let (db, cid) = setup();
        let early = send(&db, cid, 1, "one");
        let late = send(&db, cid, 1, "two");

        assert_eq!(db.advance_read_cursor(cid, 2, late.id).unwrap(), late.id);
        assert_eq!(db.advance_read_cursor(cid, 2, early.id).unwrap(), late.id);
        assert_eq!(db.read_cursor(cid, 2).unwrap(), late.id);

        // Nothing left to report once the cursor is past everything
        assert!(db.mark_read(cid, 2).unwrap().newly_read.is_empty());
    }

    #[test]
    fn mark_read_on_empty_conversation_is_noop() {
        let (db, cid) = setup();
        let advance = db.mark_read(cid, 1).unwrap();
        assert_eq!(advance.cursor, 0);
        assert!(advance.newly_read.is_empty());
    }
}
