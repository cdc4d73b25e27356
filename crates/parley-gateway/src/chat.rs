//! Conversation state machine.
//!
//! Every inbound event that touches the store goes through [`ChatService`],
//! which validates it, performs the store mutation and decides the fanout.
//! The acting user is always an explicit argument.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use anyhow::anyhow;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use parley_db::Database;
use parley_db::models::{ConversationListing, ConversationRow, MessageRow, NewMessage};
use parley_types::events::{ClientEvent, ServerEvent};
use parley_types::models::{
    ConversationId, ConversationSummary, DeliveryStatus, MessageDto, MessageId, UserId,
    UserSummary,
};

use crate::auth::Identity;
use crate::bus::Fanout;
use crate::error::ChatError;

/// Drop idle conversation locks once the table grows past this.
const LOCK_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone)]
pub struct ChatLimits {
    /// Longest accepted message body, in characters.
    pub max_message_len: usize,
    /// Cap on `search_user` results.
    pub search_limit: u32,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for ChatLimits {
    fn default() -> Self {
        Self {
            max_message_len: 4000,
            search_limit: 20,
            default_page_size: 50,
            max_page_size: 200,
        }
    }
}

/// How a client names the other side of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressee {
    Conversation(ConversationId),
    Peer(UserId),
}

impl Addressee {
    /// A conversation id wins over a peer id when both are given.
    pub fn from_ids(
        conversation_id: Option<ConversationId>,
        peer_id: Option<UserId>,
    ) -> Result<Self, ChatError> {
        match (conversation_id, peer_id) {
            (Some(id), _) => Ok(Self::Conversation(id)),
            (None, Some(peer)) => Ok(Self::Peer(peer)),
            (None, None) => Err(ChatError::validation("conversation_id or peer_id is required")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub conversation_id: ConversationId,
    pub cursor: MessageId,
    /// Messages this call transitioned to read, oldest first.
    pub newly_read: Vec<MessageId>,
}

#[derive(Clone)]
pub struct ChatService {
    inner: Arc<ChatInner>,
}

struct ChatInner {
    db: Arc<Database>,
    fanout: Fanout,
    locks: ConversationLocks,
    limits: ChatLimits,
}

impl ChatService {
    pub fn new(db: Arc<Database>, fanout: Fanout, limits: ChatLimits) -> Self {
        Self {
            inner: Arc::new(ChatInner {
                db,
                fanout,
                locks: ConversationLocks::default(),
                limits,
            }),
        }
    }

    pub fn fanout(&self) -> &Fanout {
        &self.inner.fanout
    }

    pub fn limits(&self) -> &ChatLimits {
        &self.inner.limits
    }

    /// Route one client event. Returns the reply meant for the caller only,
    /// if the event has one; everything else travels through the fanout.
    pub async fn handle_event(
        &self,
        user_id: UserId,
        event: ClientEvent,
    ) -> Result<Option<ServerEvent>, ChatError> {
        match event {
            ClientEvent::Send {
                conversation_id,
                peer_id,
                content,
                attachment_ref,
            } => {
                let to = Addressee::from_ids(conversation_id, peer_id)?;
                // The caller sees the persisted message through its own group
                self.send(user_id, to, &content, attachment_ref.as_deref()).await?;
                Ok(None)
            }

            ClientEvent::Typing {
                peer_id,
                conversation_id,
                is_typing,
            } => {
                let to = Addressee::from_ids(conversation_id, peer_id)?;
                self.typing(user_id, to, is_typing).await?;
                Ok(None)
            }

            ClientEvent::Read { conversation_id } => {
                self.mark_read(user_id, conversation_id).await?;
                Ok(None)
            }

            ClientEvent::Delivered { message_id } => {
                self.delivered(user_id, message_id).await?;
                Ok(None)
            }

            ClientEvent::SearchUser { keyword } => {
                let users = self.search_users(user_id, &keyword).await?;
                Ok(Some(ServerEvent::SearchResults { users }))
            }

            ClientEvent::StartConversation { peer_id } => {
                let conversation = self.start_conversation(user_id, peer_id).await?;
                Ok(Some(ServerEvent::ConversationStarted { conversation }))
            }

            ClientEvent::ListConversations => {
                let conversations = self.list_conversations(user_id).await?;
                Ok(Some(ServerEvent::Conversations { conversations }))
            }

            ClientEvent::ListMessages {
                conversation_id,
                before,
                limit,
            } => {
                let messages = self
                    .list_messages(user_id, conversation_id, before, limit)
                    .await?;
                Ok(Some(ServerEvent::Messages {
                    conversation_id,
                    messages,
                }))
            }

            ClientEvent::Unknown => Ok(None),
        }
    }

    /// Mirror an authenticated identity into the user directory.
    pub async fn register_user(&self, identity: &Identity) -> Result<(), ChatError> {
        let (id, username) = (identity.user_id, identity.username.clone());
        self.blocking(move |db| db.upsert_user(id, &username)).await
    }

    /// Persist a message and fan it out to both participants. The sender's
    /// own group receives it too so every tab stays in sync.
    pub async fn send(
        &self,
        sender: UserId,
        to: Addressee,
        content: &str,
        attachment_ref: Option<&str>,
    ) -> Result<MessageDto, ChatError> {
        let content = self.validate_content(content, attachment_ref)?;
        let conversation = match to {
            Addressee::Conversation(id) => self.participant_conversation(sender, id).await?,
            Addressee::Peer(peer) => self.find_or_create(sender, peer).await?.0,
        };

        self.append_and_publish(sender, &conversation, content, attachment_ref, false)
            .await
    }

    /// Append a message flagged as system-generated, on behalf of `actor`.
    pub async fn post_system_message(
        &self,
        actor: UserId,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<MessageDto, ChatError> {
        let content = self.validate_content(content, None)?;
        let conversation = self.participant_conversation(actor, conversation_id).await?;
        self.append_and_publish(actor, &conversation, content, None, true)
            .await
    }

    /// Ephemeral; nothing is stored and nothing is replayed later.
    pub async fn typing(&self, sender: UserId, to: Addressee, is_typing: bool) -> Result<(), ChatError> {
        let (conversation_id, peer) = match to {
            Addressee::Conversation(id) => {
                let conversation = self.participant_conversation(sender, id).await?;
                (Some(conversation.id), peer_in(&conversation, sender)?)
            }
            Addressee::Peer(peer) => {
                if peer == sender {
                    return Err(ChatError::validation("cannot send typing state to yourself"));
                }
                let existing = self
                    .blocking(move |db| {
                        if db.get_user(peer)?.is_none() {
                            return Ok(None);
                        }
                        db.find_conversation(sender, peer).map(Some)
                    })
                    .await?
                    .ok_or(ChatError::NotFound("user"))?;
                (existing.map(|c| c.id), peer)
            }
        };

        self.inner.fanout.publish_to_user(
            peer,
            ServerEvent::Typing {
                conversation_id,
                user_id: sender,
                is_typing,
            },
        );
        Ok(())
    }

    /// Advance `user_id`'s cursor to the newest message and tell the peer,
    /// once per message, which of its messages were just seen.
    pub async fn mark_read(&self, user_id: UserId, conversation_id: ConversationId) -> Result<ReadOutcome, ChatError> {
        self.participant_conversation(user_id, conversation_id).await?;

        let advance = self
            .detached(move |chat| async move {
                let _guard = chat.inner.locks.lock(conversation_id).await;
                let advance = chat
                    .blocking(move |db| db.mark_read(conversation_id, user_id))
                    .await?;

                for message in &advance.newly_read {
                    chat.inner.fanout.publish_to_user(
                        message.sender_id,
                        ServerEvent::MessageStatus {
                            message_id: message.id,
                            conversation_id,
                            status: DeliveryStatus::Seen,
                            user_id,
                        },
                    );
                }
                Ok(advance)
            })
            .await?;

        if !advance.newly_read.is_empty() {
            debug!(
                "User {} read {} message(s) in conversation {}",
                user_id,
                advance.newly_read.len(),
                conversation_id
            );
        }

        Ok(ReadOutcome {
            conversation_id,
            cursor: advance.cursor,
            newly_read: advance.newly_read.iter().map(|m| m.id).collect(),
        })
    }

    /// Informational ack from the recipient's client. Safe to repeat.
    pub async fn delivered(&self, user_id: UserId, message_id: MessageId) -> Result<(), ChatError> {
        let message = self
            .blocking(move |db| db.get_message(message_id))
            .await?
            .ok_or(ChatError::NotFound("message"))?;
        self.participant_conversation(user_id, message.conversation_id)
            .await
            .map_err(|e| match e {
                ChatError::NotFound(_) => ChatError::NotFound("message"),
                other => other,
            })?;

        if message.sender_id == user_id {
            return Ok(());
        }

        self.inner.fanout.publish_to_user(
            message.sender_id,
            ServerEvent::MessageStatus {
                message_id,
                conversation_id: message.conversation_id,
                status: DeliveryStatus::Delivered,
                user_id,
            },
        );
        Ok(())
    }

    pub async fn start_conversation(&self, user_id: UserId, peer: UserId) -> Result<ConversationSummary, ChatError> {
        let (conversation, created) = self.find_or_create(user_id, peer).await?;
        if created {
            info!(
                "Conversation {} started between {} and {}",
                conversation.id, user_id, peer
            );
        }

        let conversation_id = conversation.id;
        let listing = self
            .blocking(move |db| db.conversation_listing(user_id, conversation_id))
            .await?
            .ok_or(ChatError::NotFound("conversation"))?;

        Ok(conversation_summary(listing, user_id))
    }

    pub async fn list_conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>, ChatError> {
        let listings = self
            .blocking(move |db| db.list_conversations_for_user(user_id))
            .await?;
        Ok(listings
            .into_iter()
            .map(|listing| conversation_summary(listing, user_id))
            .collect())
    }

    pub async fn list_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: Option<u32>,
    ) -> Result<Vec<MessageDto>, ChatError> {
        self.participant_conversation(user_id, conversation_id).await?;

        let limits = &self.inner.limits;
        let limit = limit
            .unwrap_or(limits.default_page_size)
            .clamp(1, limits.max_page_size);
        let rows = self
            .blocking(move |db| db.list_messages(conversation_id, before, limit))
            .await?;
        Ok(rows.into_iter().map(message_dto).collect())
    }

    pub async fn search_users(&self, user_id: UserId, keyword: &str) -> Result<Vec<UserSummary>, ChatError> {
        let keyword = keyword.trim().to_string();
        if keyword.is_empty() {
            return Err(ChatError::validation("keyword is required"));
        }

        let limit = self.inner.limits.search_limit;
        let rows = self
            .blocking(move |db| db.search_users(&keyword, user_id, limit))
            .await?;
        Ok(rows
            .into_iter()
            .map(|u| UserSummary {
                id: u.id,
                username: u.username,
            })
            .collect())
    }

    /// Tell every counterparty of `user_id` that they came online or went
    /// offline. Best-effort: a store failure is logged, never surfaced.
    pub async fn announce_presence(&self, user_id: UserId, online: bool) {
        let peers = match self.blocking(move |db| db.conversation_peers(user_id)).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Presence for user {} not announced: {}", user_id, e);
                return;
            }
        };

        for peer in peers {
            self.inner
                .fanout
                .publish_to_user(peer, ServerEvent::Presence { user_id, online });
        }
    }

    // -- internals --

    async fn append_and_publish(
        &self,
        sender: UserId,
        conversation: &ConversationRow,
        content: String,
        attachment_ref: Option<&str>,
        is_system: bool,
    ) -> Result<MessageDto, ChatError> {
        let peer = peer_in(conversation, sender)?;
        let conversation_id = conversation.id;
        let attachment_ref = attachment_ref.map(str::to_string);

        self.detached(move |chat| async move {
            // Held across store + publish so fanout order matches store order
            let _guard = chat.inner.locks.lock(conversation_id).await;
            let row = chat
                .blocking(move |db| {
                    db.append_message(&NewMessage {
                        conversation_id,
                        sender_id: sender,
                        content: &content,
                        attachment_ref: attachment_ref.as_deref(),
                        is_system,
                    })
                })
                .await?;

            let message = message_dto(row);
            let event = ServerEvent::Message {
                message: message.clone(),
            };
            let fanout = &chat.inner.fanout;
            let delivered = fanout.publish_to_user(peer, event.clone()) + fanout.publish_to_user(sender, event);
            debug!(
                "Message {} in conversation {} handed to {} connection(s)",
                message.id, conversation_id, delivered
            );

            Ok(message)
        })
        .await
    }

    fn validate_content(&self, content: &str, attachment_ref: Option<&str>) -> Result<String, ChatError> {
        let content = content.trim();
        if content.is_empty() && attachment_ref.is_none_or(|a| a.trim().is_empty()) {
            return Err(ChatError::validation("content is required"));
        }
        let max = self.inner.limits.max_message_len;
        if content.chars().count() > max {
            return Err(ChatError::validation(format!(
                "content exceeds {} characters",
                max
            )));
        }
        Ok(content.to_string())
    }

    async fn find_or_create(&self, user_id: UserId, peer: UserId) -> Result<(ConversationRow, bool), ChatError> {
        if peer == user_id {
            return Err(ChatError::validation("cannot start a conversation with yourself"));
        }
        self.blocking(move |db| {
            if db.get_user(peer)?.is_none() {
                return Ok(None);
            }
            db.find_or_create_conversation(user_id, peer).map(Some)
        })
        .await?
        .ok_or(ChatError::NotFound("user"))
    }

    /// Load a conversation the user takes part in. Conversations the user is
    /// not part of are reported as missing.
    async fn participant_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationRow, ChatError> {
        self.blocking(move |db| db.get_conversation(conversation_id))
            .await?
            .filter(|c| c.has_participant(user_id))
            .ok_or(ChatError::NotFound("conversation"))
    }

    /// Run a locked mutation and its fanout on its own task. Once started it
    /// finishes even if the caller is dropped, so a committed write is never
    /// left unpublished.
    async fn detached<F, Fut, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(ChatService) -> Fut,
        Fut: Future<Output = Result<T, ChatError>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(f(self.clone()))
            .await
            .map_err(|e| ChatError::Store(anyhow!("chat task failed: {}", e)))?
    }

    /// Run a store call off the async runtime. The call runs to completion
    /// even if the awaiting task is dropped.
    async fn blocking<F, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| ChatError::Store(anyhow!("store task failed: {}", e)))?
            .map_err(ChatError::Store)
    }
}

fn peer_in(conversation: &ConversationRow, user_id: UserId) -> Result<UserId, ChatError> {
    conversation
        .peer_of(user_id)
        .ok_or(ChatError::NotFound("conversation"))
}

fn message_dto(row: MessageRow) -> MessageDto {
    MessageDto {
        id: row.id,
        conversation_id: row.conversation_id,
        sender: row.sender_id,
        content: row.content,
        attachment_ref: row.attachment_ref,
        is_system: row.is_system,
        created_at: row.created_at,
        is_read: row.is_read,
    }
}

fn conversation_summary(listing: ConversationListing, user_id: UserId) -> ConversationSummary {
    let has_unread = listing.has_unread(user_id);
    ConversationSummary {
        id: listing.conversation.id,
        peer: UserSummary {
            id: listing.peer.id,
            username: listing.peer.username,
        },
        last_message: listing.last_message.map(message_dto),
        has_unread,
        unread_count: listing.unread_count,
    }
}

/// One async mutex per conversation. Different conversations never contend.
#[derive(Default)]
struct ConversationLocks {
    locks: std::sync::Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    async fn lock(&self, conversation_id: ConversationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() >= LOCK_PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
