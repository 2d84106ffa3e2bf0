/// Chats
///
/// A chat groups participants; each participant tracks when it last read
/// the chat, which drives unread counts. Messages are never hard-deleted:
/// a deleted message keeps its row with the content replaced and the type
/// forced to `system`.
use crate::{
    error::{HubError, HubResult},
    notify::{FanOut, MessageNotice},
    realtime::{LiveList, SyncHandle, ViewOrder, ViewSync},
    store::{self, patch, tables, timestamp, Direction, Filter, Query, Record, RecordStore},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Content left behind by a soft delete
pub const DELETED_MESSAGE_CONTENT: &str = "This message was deleted";

/// Longest accepted message body
const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
    Booking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub kind: ChatKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub booking_id: Option<String>,
    pub created_by: String,
    #[serde(default, with = "timestamp::option")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Record for Chat {
    const TABLE: &'static str = tables::CHATS;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatParticipant {
    /// `{chat_id}:{user_id}`, so a user joins a chat at most once
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub display_name: String,
    pub role: ParticipantRole,
    #[serde(with = "timestamp")]
    pub joined_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Record for ChatParticipant {
    const TABLE: &'static str = tables::CHAT_PARTICIPANTS;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, with = "timestamp::option")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, with = "timestamp::option")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Record for ChatMessage {
    const TABLE: &'static str = tables::CHAT_MESSAGES;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Chat creation request
#[derive(Debug, Clone)]
pub struct NewChat {
    pub kind: ChatKind,
    pub title: Option<String>,
    pub booking_id: Option<String>,
    /// `(user_id, display_name)` of the creator
    pub creator: (String, String),
    /// `(user_id, display_name)` of everyone else
    pub members: Vec<(String, String)>,
}

/// Outgoing message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Text,
            attachment: None,
        }
    }
}

fn participant_id(chat_id: &str, user_id: &str) -> String {
    format!("{}:{}", chat_id, user_id)
}

fn validate_content(content: &str) -> HubResult<()> {
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(HubError::Validation(format!(
            "Message exceeds {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    Ok(())
}

/// Chat operations
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn RecordStore>,
    fanout: FanOut,
}

impl ChatService {
    pub fn new(store: Arc<dyn RecordStore>, fanout: FanOut) -> Self {
        Self { store, fanout }
    }

    pub async fn create_chat(&self, request: NewChat) -> HubResult<Chat> {
        let (creator_id, creator_name) = request.creator;
        if creator_id.trim().is_empty() {
            return Err(HubError::Validation("Chat creator is required".to_string()));
        }
        let mut members: Vec<(String, String)> = Vec::new();
        for (user_id, name) in request.members {
            if user_id != creator_id && !members.iter().any(|(id, _)| *id == user_id) {
                members.push((user_id, name));
            }
        }
        if members.is_empty() {
            return Err(HubError::Validation(
                "A chat needs at least one other participant".to_string(),
            ));
        }
        if request.kind == ChatKind::Direct && members.len() != 1 {
            return Err(HubError::Validation(
                "A direct chat has exactly two participants".to_string(),
            ));
        }

        let now = timestamp::now();
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            kind: request.kind,
            title: request.title,
            booking_id: request.booking_id,
            created_by: creator_id.clone(),
            last_message_at: None,
            created_at: now,
        };
        let chat = store::insert(self.store.as_ref(), &chat).await?;

        let everyone = std::iter::once((creator_id, creator_name, ParticipantRole::Owner)).chain(
            members
                .into_iter()
                .map(|(id, name)| (id, name, ParticipantRole::Member)),
        );
        for (user_id, display_name, role) in everyone {
            let participant = ChatParticipant {
                id: participant_id(&chat.id, &user_id),
                chat_id: chat.id.clone(),
                user_id,
                display_name,
                role,
                joined_at: now,
                last_read_at: None,
            };
            store::insert(self.store.as_ref(), &participant).await?;
        }

        info!(chat_id = %chat.id, "Created chat");
        Ok(chat)
    }

    pub async fn get_chat(&self, id: &str) -> HubResult<Chat> {
        store::fetch(self.store.as_ref(), id).await
    }

    /// Participants in join order
    pub async fn participants(&self, chat_id: &str) -> HubResult<Vec<ChatParticipant>> {
        let query = Query::filtered(Filter::new().eq("chat_id", chat_id))
            .order_by("joined_at", Direction::Asc);
        store::select(self.store.as_ref(), &query).await
    }

    async fn participant(&self, chat_id: &str, user_id: &str) -> HubResult<ChatParticipant> {
        store::find(self.store.as_ref(), &participant_id(chat_id, user_id))
            .await?
            .ok_or_else(|| {
                HubError::Validation(format!("{} is not a participant of chat {}", user_id, chat_id))
            })
    }

    /// Send a message and notify every other participant best-effort
    pub async fn send_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        message: NewMessage,
    ) -> HubResult<ChatMessage> {
        if message.content.trim().is_empty() && message.attachment.is_none() {
            return Err(HubError::Validation("Message is empty".to_string()));
        }
        validate_content(&message.content)?;
        if matches!(message.kind, MessageKind::Image | MessageKind::File)
            && message.attachment.is_none()
        {
            return Err(HubError::Validation(
                "Image and file messages need an attachment".to_string(),
            ));
        }

        self.get_chat(chat_id).await?;
        let sender = self.participant(chat_id, sender_id).await?;

        let now = timestamp::now();
        let record = ChatMessage {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            content: message.content,
            kind: message.kind,
            attachment: message.attachment,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
        };
        let record = store::insert(self.store.as_ref(), &record).await?;

        let stamp = timestamp::value(&now);
        self.store
            .update(tables::CHATS, chat_id, patch(json!({ "last_message_at": stamp.clone() })))
            .await?;
        self.store
            .update(
                tables::CHAT_PARTICIPANTS,
                &sender.id,
                patch(json!({ "last_read_at": stamp })),
            )
            .await?;

        match self.participants(chat_id).await {
            Ok(participants) => {
                let recipients: Vec<String> =
                    participants.into_iter().map(|p| p.user_id).collect();
                let notice = MessageNotice {
                    chat_id,
                    message_id: &record.id,
                    sender_id,
                    sender_name: &sender.display_name,
                    content: &record.content,
                };
                let deliveries = self.fanout.new_message(&notice, &recipients).await;
                let missed = deliveries.iter().filter(|d| !d.is_delivered()).count();
                if missed > 0 {
                    warn!(chat_id, missed, "Some participants were not notified");
                }
            }
            Err(e) => warn!(chat_id, error = %e, "Skipping message notifications"),
        }

        debug!(chat_id, message_id = %record.id, "Sent message");
        Ok(record)
    }

    async fn own_message(&self, message_id: &str, user_id: &str) -> HubResult<ChatMessage> {
        let message: ChatMessage = store::fetch(self.store.as_ref(), message_id).await?;
        if message.sender_id != user_id {
            return Err(HubError::Validation(
                "Only the sender can change a message".to_string(),
            ));
        }
        Ok(message)
    }

    pub async fn edit_message(
        &self,
        message_id: &str,
        editor_id: &str,
        content: &str,
    ) -> HubResult<ChatMessage> {
        if content.trim().is_empty() {
            return Err(HubError::Validation("Message is empty".to_string()));
        }
        validate_content(content)?;
        self.own_message(message_id, editor_id).await?;

        let edited = patch(json!({
            "content": content,
            "is_edited": true,
            "edited_at": timestamp::value(&timestamp::now()),
        }));
        match self
            .store
            .update_where(
                tables::CHAT_MESSAGES,
                message_id,
                &Filter::new().neq("is_deleted", true),
                edited,
            )
            .await?
        {
            Some(row) => store::from_row(row),
            None => Err(HubError::Constraint(format!(
                "Message {} was deleted and cannot be edited",
                message_id
            ))),
        }
    }

    /// Soft delete; deleting twice returns the deleted message unchanged
    pub async fn delete_message(&self, message_id: &str, user_id: &str) -> HubResult<ChatMessage> {
        let message = self.own_message(message_id, user_id).await?;
        if message.is_deleted {
            return Ok(message);
        }

        let deleted = patch(json!({
            "content": DELETED_MESSAGE_CONTENT,
            "type": MessageKind::System,
            "attachment": Value::Null,
            "is_deleted": true,
            "deleted_at": timestamp::value(&timestamp::now()),
        }));
        let row = self
            .store
            .update(tables::CHAT_MESSAGES, message_id, deleted)
            .await?;
        info!(message_id, "Deleted message");
        store::from_row(row)
    }

    /// Messages in chronological order; with a limit, the most recent ones
    pub async fn list_messages(
        &self,
        chat_id: &str,
        limit: Option<i64>,
        before: Option<DateTime<Utc>>,
    ) -> HubResult<Vec<ChatMessage>> {
        let mut filter = Filter::new().eq("chat_id", chat_id);
        if let Some(before) = before {
            filter = filter.lt("created_at", timestamp::value(&before));
        }

        match limit {
            Some(limit) if limit <= 0 => {
                Err(HubError::Validation("Limit must be positive".to_string()))
            }
            Some(limit) => {
                let query = Query::filtered(filter)
                    .order_by("created_at", Direction::Desc)
                    .limit(limit);
                let mut messages: Vec<ChatMessage> =
                    store::select(self.store.as_ref(), &query).await?;
                messages.reverse();
                Ok(messages)
            }
            None => {
                let query = Query::filtered(filter).order_by("created_at", Direction::Asc);
                store::select(self.store.as_ref(), &query).await
            }
        }
    }

    /// Record that a participant has read everything so far
    pub async fn mark_read(&self, chat_id: &str, user_id: &str) -> HubResult<ChatParticipant> {
        let participant = self.participant(chat_id, user_id).await?;
        let row = self
            .store
            .update(
                tables::CHAT_PARTICIPANTS,
                &participant.id,
                patch(json!({ "last_read_at": timestamp::value(&timestamp::now()) })),
            )
            .await?;
        store::from_row(row)
    }

    /// Messages from others since the participant last read the chat
    pub async fn unread_count(&self, chat_id: &str, user_id: &str) -> HubResult<i64> {
        let participant = self.participant(chat_id, user_id).await?;
        let mut filter = Filter::new()
            .eq("chat_id", chat_id)
            .neq("sender_id", user_id)
            .neq("is_deleted", true);
        if let Some(last_read) = participant.last_read_at {
            filter = filter.gt("created_at", timestamp::value(&last_read));
        }
        self.store.count(tables::CHAT_MESSAGES, &filter).await
    }

    /// Live transcript of a chat, kept current by the change feed
    pub async fn subscribe_messages(
        &self,
        sync: &ViewSync,
        chat_id: &str,
    ) -> HubResult<(LiveList<ChatMessage>, SyncHandle)> {
        let list = LiveList::new(ViewOrder::Chronological);
        let handle = sync
            .bind_list_seeded(Filter::new().eq("chat_id", chat_id), list.clone(), || {
                self.list_messages(chat_id, None, None)
            })
            .await?;
        Ok((list, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::notify::{NotificationType, Notifier};
    use crate::realtime::{ChangeFeed, LocalChangeFeed};
    use crate::store::SqliteRecordStore;
    use std::time::Duration;

    struct Fixture {
        chats: ChatService,
        notifier: Notifier,
        feed: Arc<LocalChangeFeed>,
    }

    async fn fixture() -> Fixture {
        let feed = Arc::new(LocalChangeFeed::new(64));
        let store = Arc::new(
            SqliteRecordStore::new(db::connect_in_memory().await.unwrap())
                .with_change_feed(feed.clone()),
        );
        let notifier = Notifier::new(store.clone(), 30);
        Fixture {
            chats: ChatService::new(store, FanOut::new(notifier.clone())),
            notifier,
            feed,
        }
    }

    fn group() -> NewChat {
        NewChat {
            kind: ChatKind::Group,
            title: Some("Wedding crew".to_string()),
            booking_id: None,
            creator: ("u1".to_string(), "Ana".to_string()),
            members: vec![
                ("u2".to_string(), "Bruno".to_string()),
                ("u3".to_string(), "Carla".to_string()),
                ("u2".to_string(), "Bruno".to_string()),
            ],
        }
    }

    #[tokio::test]
    async fn test_create_chat_dedups_participants() {
        let f = fixture().await;
        let chat = f.chats.create_chat(group()).await.unwrap();

        let participants = f.chats.participants(&chat.id).await.unwrap();
        assert_eq!(participants.len(), 3);
        assert_eq!(participants[0].role, ParticipantRole::Owner);
        assert_eq!(participants[0].user_id, "u1");
    }

    #[tokio::test]
    async fn test_direct_chat_needs_two() {
        let f = fixture().await;
        let mut request = group();
        request.kind = ChatKind::Direct;
        assert!(matches!(
            f.chats.create_chat(request).await.unwrap_err(),
            HubError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_send_message_notifies_others() {
        let f = fixture().await;
        let chat = f.chats.create_chat(group()).await.unwrap();

        let message = f
            .chats
            .send_message(&chat.id, "u1", NewMessage::text("See you at noon"))
            .await
            .unwrap();
        assert_eq!(message.kind, MessageKind::Text);

        for user in ["u2", "u3"] {
            let inbox = f.notifier.list_for_user(user, false, None).await.unwrap();
            assert_eq!(inbox.len(), 1);
            assert_eq!(inbox[0].kind, NotificationType::Message);
            assert_eq!(inbox[0].title, "New message from Ana");
            assert_eq!(inbox[0].action_url, Some(format!("/chat/{}", chat.id)));
        }
        assert_eq!(f.notifier.unread_count("u1").await.unwrap(), 0);

        let chat = f.chats.get_chat(&chat.id).await.unwrap();
        assert_eq!(chat.last_message_at, Some(message.created_at));
    }

    #[tokio::test]
    async fn test_non_participant_cannot_send() {
        let f = fixture().await;
        let chat = f.chats.create_chat(group()).await.unwrap();
        assert!(matches!(
            f.chats
                .send_message(&chat.id, "stranger", NewMessage::text("hi"))
                .await
                .unwrap_err(),
            HubError::Validation(_)
        ));
        assert!(matches!(
            f.chats
                .send_message("missing", "u1", NewMessage::text("hi"))
                .await
                .unwrap_err(),
            HubError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_edit_and_soft_delete() {
        let f = fixture().await;
        let chat = f.chats.create_chat(group()).await.unwrap();
        let message = f
            .chats
            .send_message(
                &chat.id,
                "u1",
                NewMessage {
                    content: "photo".to_string(),
                    kind: MessageKind::Image,
                    attachment: Some(Attachment {
                        url: "http://localhost/storage/chat-attachments/x.jpg".to_string(),
                        name: "x.jpg".to_string(),
                        size: 10,
                        mime_type: "image/jpeg".to_string(),
                    }),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            f.chats
                .edit_message(&message.id, "u2", "hijack")
                .await
                .unwrap_err(),
            HubError::Validation(_)
        ));

        let edited = f
            .chats
            .edit_message(&message.id, "u1", "our photo")
            .await
            .unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content, "our photo");

        let deleted = f.chats.delete_message(&message.id, "u1").await.unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.content, DELETED_MESSAGE_CONTENT);
        assert_eq!(deleted.kind, MessageKind::System);
        assert!(deleted.attachment.is_none());

        // Row survives, edits are refused, deleting again is harmless
        assert_eq!(f.chats.list_messages(&chat.id, None, None).await.unwrap().len(), 1);
        assert!(matches!(
            f.chats
                .edit_message(&message.id, "u1", "again")
                .await
                .unwrap_err(),
            HubError::Constraint(_)
        ));
        assert!(f.chats.delete_message(&message.id, "u1").await.unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_unread_counts_follow_last_read() {
        let f = fixture().await;
        let chat = f.chats.create_chat(group()).await.unwrap();

        f.chats
            .send_message(&chat.id, "u1", NewMessage::text("one"))
            .await
            .unwrap();
        f.chats
            .send_message(&chat.id, "u1", NewMessage::text("two"))
            .await
            .unwrap();

        assert_eq!(f.chats.unread_count(&chat.id, "u2").await.unwrap(), 2);
        assert_eq!(f.chats.unread_count(&chat.id, "u1").await.unwrap(), 0);

        f.chats.mark_read(&chat.id, "u2").await.unwrap();
        assert_eq!(f.chats.unread_count(&chat.id, "u2").await.unwrap(), 0);

        f.chats
            .send_message(&chat.id, "u3", NewMessage::text("three"))
            .await
            .unwrap();
        assert_eq!(f.chats.unread_count(&chat.id, "u2").await.unwrap(), 1);
        assert_eq!(f.chats.unread_count(&chat.id, "u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_messages_with_limit_keeps_latest() {
        let f = fixture().await;
        let chat = f.chats.create_chat(group()).await.unwrap();
        for text in ["a", "b", "c"] {
            f.chats
                .send_message(&chat.id, "u1", NewMessage::text(text))
                .await
                .unwrap();
        }

        let latest = f.chats.list_messages(&chat.id, Some(2), None).await.unwrap();
        let contents: Vec<_> = latest.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_subscribe_messages_tracks_changes() {
        let f = fixture().await;
        let sync = ViewSync::new(f.feed.clone());
        let chat = f.chats.create_chat(group()).await.unwrap();
        f.chats
            .send_message(&chat.id, "u1", NewMessage::text("before"))
            .await
            .unwrap();

        let (transcript, handle) = f.chats.subscribe_messages(&sync, &chat.id).await.unwrap();
        assert_eq!(transcript.len().await, 1);

        let sent = f
            .chats
            .send_message(&chat.id, "u2", NewMessage::text("after"))
            .await
            .unwrap();
        f.chats.delete_message(&sent.id, "u2").await.unwrap();

        let mut converged = false;
        for _ in 0..100 {
            let snapshot = transcript.snapshot().await;
            if snapshot.len() == 2 && snapshot[1].is_deleted {
                converged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(converged);

        drop(handle);
        assert_eq!(f.feed.active_channels(), 0);
    }
}
