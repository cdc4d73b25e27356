//! Conversation directory: pair lookup, inbox listing and user search.

use anyhow::{Result, bail};
use rusqlite::{Connection, TransactionBehavior};

use parley_types::models::{ConversationId, MessageId, UserId};

use crate::Database;
use crate::models::{ConversationListing, ConversationRow, UserRow, from_micros, now_micros};
use crate::queries::{MESSAGE_COLUMNS, OptionalExt, message_from_row, upsert_cursor};

impl Database {
    /// Return the conversation for the unordered pair, creating it (with a
    /// zeroed read cursor per participant) if it does not exist yet.
    ///
    /// The `UNIQUE(user_low, user_high)` constraint makes the insert atomic
    /// across handles; every concurrent caller reads back the same row.
    /// The flag is true only for the caller whose insert created the row.
    pub fn find_or_create_conversation(&self, a: UserId, b: UserId) -> Result<(ConversationRow, bool)> {
        if a == b {
            bail!("conversation needs two distinct users, got {} twice", a);
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let created = tx.execute(
                "INSERT OR IGNORE INTO conversations (user_low, user_high, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![low, high, now_micros()],
            )? == 1;

            let conversation = tx.query_row(
                "SELECT id, user_low, user_high, created_at FROM conversations
                 WHERE user_low = ?1 AND user_high = ?2",
                [low, high],
                conversation_from_row,
            )?;

            if created {
                upsert_cursor(&tx, conversation.id, low, 0)?;
                upsert_cursor(&tx, conversation.id, high, 0)?;
            }

            tx.commit()?;
            Ok((conversation, created))
        })
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_low, user_high, created_at FROM conversations WHERE id = ?1",
                [id],
                conversation_from_row,
            )
            .optional()
        })
    }

    /// Every conversation `user_id` takes part in, most recently active first.
    pub fn list_conversations_for_user(&self, user_id: UserId) -> Result<Vec<ConversationListing>> {
        self.with_conn(|conn| query_listings(conn, user_id, None))
    }

    /// Inbox entry for one conversation, as `user_id` sees it. `None` when the
    /// conversation does not exist or `user_id` is not in it.
    pub fn conversation_listing(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationListing>> {
        self.with_conn(|conn| Ok(query_listings(conn, user_id, Some(conversation_id))?.pop()))
    }

    /// The conversation for exactly this pair, if any.
    pub fn find_conversation(&self, a: UserId, b: UserId) -> Result<Option<ConversationRow>> {
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_low, user_high, created_at FROM conversations
                 WHERE user_low = ?1 AND user_high = ?2",
                [low, high],
                conversation_from_row,
            )
            .optional()
        })
    }

    /// Users that share a conversation with `user_id`.
    pub fn conversation_peers(&self, user_id: UserId) -> Result<Vec<UserId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT CASE WHEN user_low = ?1 THEN user_high ELSE user_low END
                 FROM conversations WHERE user_low = ?1 OR user_high = ?1",
            )?;
            let peers = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(peers)
        })
    }

    /// Case-insensitive substring match on username, excluding `exclude`.
    /// LIKE folds ASCII case only.
    pub fn search_users(&self, keyword: &str, exclude: UserId, limit: u32) -> Result<Vec<UserRow>> {
        let pattern = format!("%{}%", escape_like(keyword));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username FROM users
                 WHERE id != ?1 AND username LIKE ?2 ESCAPE '\\'
                 ORDER BY username COLLATE NOCASE, id
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![exclude, pattern, limit], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        user_low: row.get(1)?,
        user_high: row.get(2)?,
        created_at: from_micros(row.get(3)?),
    })
}

/// Inbox rows with their newest message, in one statement. `only` narrows
/// the result to a single conversation.
fn query_listings(
    conn: &Connection,
    user_id: UserId,
    only: Option<ConversationId>,
) -> Result<Vec<ConversationListing>> {
    // Message columns come first so message_from_row can read them in place
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS},
                c.id, c.user_low, c.user_high, c.created_at,
                peer.id, peer.username,
                COALESCE(cur.last_read_message_id, 0),
                (SELECT COUNT(*) FROM messages u
                  WHERE u.conversation_id = c.id
                    AND u.id > COALESCE(cur.last_read_message_id, 0)
                    AND u.sender_id != ?1)
         FROM conversations c
         JOIN users peer
           ON peer.id = CASE WHEN c.user_low = ?1 THEN c.user_high ELSE c.user_low END
         LEFT JOIN read_cursors cur
           ON cur.conversation_id = c.id AND cur.user_id = ?1
         LEFT JOIN messages m
           ON m.id = (SELECT MAX(l.id) FROM messages l WHERE l.conversation_id = c.id)
         WHERE (c.user_low = ?1 OR c.user_high = ?1)
           AND (?2 IS NULL OR c.id = ?2)
         ORDER BY COALESCE(m.created_at, c.created_at) DESC, c.id DESC"
    ))?;

    let rows = stmt
        .query_map(rusqlite::params![user_id, only], |row| {
            let last_message = match row.get::<_, Option<MessageId>>(0)? {
                Some(_) => Some(message_from_row(row)?),
                None => None,
            };
            Ok(ConversationListing {
                conversation: ConversationRow {
                    id: row.get(8)?,
                    user_low: row.get(9)?,
                    user_high: row.get(10)?,
                    created_at: from_micros(row.get(11)?),
                },
                peer: UserRow {
                    id: row.get(12)?,
                    username: row.get(13)?,
                },
                last_message,
                cursor: row.get(14)?,
                unread_count: row.get(15)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn escape_like(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
