//! Chats and messages held in memory by the account.
//!
//! [`ChatList`] is an arena: chats are addressed by [`ChatId`], messages by
//! [`MessageId`]. Other components (the delivery correlator in particular)
//! hold ids, never references, so deleting a chat simply makes their ids
//! resolve to nothing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::Recipients;

/// Arena index of a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatId(pub u64);

/// Arena index of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the network.
    In,
    /// Sent by us.
    Out,
}

impl Direction {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(Self::In),
            "out" => Some(Self::Out),
            _ => None,
        }
    }
}

/// Transport a message travelled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain SMS through the modem queue.
    Sms,
    /// MMS through the delegate service.
    Mms,
}

impl MessageKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Mms => "mms",
        }
    }
}

/// Lifecycle status of a message.
///
/// Outbound: `Draft -> Sending -> Sent -> Delivered`, or `SendFailed` from
/// any pre-delivery state. Inbound messages are `Received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Composed, not yet handed to a device.
    Draft,
    /// Submitted to the device, awaiting confirmation.
    Sending,
    /// Confirmed sent by the device.
    Sent,
    /// Delivery confirmed by a status report.
    Delivered,
    /// Validation, submission or delivery failed.
    SendFailed,
    /// Inbound message.
    Received,
}

impl MessageStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::SendFailed => "send_failed",
            Self::Received => "received",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "send_failed" => Some(Self::SendFailed),
            "received" => Some(Self::Received),
            _ => None,
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Arena id (process-local).
    pub id: MessageId,
    /// Stable identifier used as the persistence key.
    pub uid: String,
    /// Inbound or outbound.
    pub direction: Direction,
    /// SMS or MMS.
    pub kind: MessageKind,
    /// Current status.
    pub status: MessageStatus,
    /// Text body.
    pub body: String,
    /// Normalized sender number for inbound messages.
    pub sender: Option<String>,
    /// When the message was sent or received.
    pub timestamp: DateTime<Utc>,
    /// When the network reported delivery.
    pub delivered_at: Option<DateTime<Utc>>,
}

/// A conversation with a fixed participant set.
#[derive(Debug, Clone)]
pub struct Chat {
    /// Arena id.
    pub id: ChatId,
    /// Canonical recipient key.
    pub key: String,
    /// Ordered members (same numbers as the key).
    pub members: Vec<String>,
    /// Display name, if a contact or the user named it.
    pub name: Option<String>,
    /// Inbound messages not yet read.
    pub unread_count: u32,
    /// Hidden from the main chat list until new activity.
    pub archived: bool,
    /// Messages seen during this process lifetime.
    pub messages: Vec<Message>,
}

impl Chat {
    /// Display title: the name if known, else the key.
    pub fn title(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.key)
    }

    /// Snapshot without the message list.
    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            key: self.key.clone(),
            members: self.members.clone(),
            name: self.name.clone(),
            unread_count: self.unread_count,
            archived: self.archived,
            last_message: self.messages.last().map(|m| m.body.clone()),
        }
    }
}

/// Chat state shared with observers and the history store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    /// Canonical recipient key.
    pub key: String,
    /// Ordered members.
    pub members: Vec<String>,
    /// Display name.
    pub name: Option<String>,
    /// Unread inbound messages.
    pub unread_count: u32,
    /// Archive flag.
    pub archived: bool,
    /// Body of the most recent message, if any.
    pub last_message: Option<String>,
}

/// Arena of chats, indexed by canonical key and by message id.
#[derive(Debug, Default)]
pub struct ChatList {
    chats: HashMap<ChatId, Chat>,
    by_key: HashMap<String, ChatId>,
    by_message: HashMap<MessageId, ChatId>,
    next_chat: u64,
    next_message: u64,
}

impl ChatList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chats.
    pub fn len(&self) -> usize {
        self.chats.len()
    }

    /// Whether there are no chats.
    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    /// Restore a chat loaded from history.
    pub fn restore(&mut self, summary: ChatSummary) -> ChatId {
        let id = self.insert(summary.key, summary.members);
        if let Some(chat) = self.chats.get_mut(&id) {
            chat.name = summary.name;
            chat.unread_count = summary.unread_count;
            chat.archived = summary.archived;
        }
        id
    }

    /// Find the chat for `recipients`, creating it if absent.
    ///
    /// Returns the id and whether a new chat was created.
    pub fn find_or_create(&mut self, recipients: &Recipients) -> (ChatId, bool) {
        if let Some(id) = self.by_key.get(&recipients.key) {
            return (*id, false);
        }
        let id = self.insert(recipients.key.clone(), recipients.members.clone());
        (id, true)
    }

    fn insert(&mut self, key: String, members: Vec<String>) -> ChatId {
        if let Some(id) = self.by_key.get(&key) {
            return *id;
        }
        let id = ChatId(self.next_chat);
        self.next_chat = self.next_chat.saturating_add(1);
        self.by_key.insert(key.clone(), id);
        self.chats.insert(
            id,
            Chat {
                id,
                key,
                members,
                name: None,
                unread_count: 0,
                archived: false,
                messages: Vec::new(),
            },
        );
        id
    }

    /// Look up a chat by canonical key.
    pub fn by_key(&self, key: &str) -> Option<&Chat> {
        self.by_key.get(key).and_then(|id| self.chats.get(id))
    }

    /// Look up a chat by id.
    pub fn get(&self, id: ChatId) -> Option<&Chat> {
        self.chats.get(&id)
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: ChatId) -> Option<&mut Chat> {
        self.chats.get_mut(&id)
    }

    /// Iterate over all chats.
    pub fn iter(&self) -> impl Iterator<Item = &Chat> {
        self.chats.values()
    }

    /// Allocate a message id.
    pub fn next_message_id(&mut self) -> MessageId {
        let id = MessageId(self.next_message);
        self.next_message = self.next_message.saturating_add(1);
        id
    }

    /// Append a message to a chat.
    ///
    /// Inbound messages bump the unread count. Any new message un-archives
    /// the chat. Returns `false` if the chat no longer exists.
    pub fn append(&mut self, chat: ChatId, message: Message) -> bool {
        let Some(c) = self.chats.get_mut(&chat) else {
            return false;
        };
        if message.direction == Direction::In {
            c.unread_count = c.unread_count.saturating_add(1);
        }
        c.archived = false;
        self.by_message.insert(message.id, chat);
        c.messages.push(message);
        true
    }

    /// Chat owning a message.
    pub fn chat_of(&self, message: MessageId) -> Option<ChatId> {
        self.by_message.get(&message).copied()
    }

    /// Look up a message and its chat.
    pub fn message(&self, id: MessageId) -> Option<(&Chat, &Message)> {
        let chat = self.chats.get(self.by_message.get(&id)?)?;
        let message = chat.messages.iter().rev().find(|m| m.id == id)?;
        Some((chat, message))
    }

    /// Mutable message lookup.
    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let chat = self.chats.get_mut(self.by_message.get(&id)?)?;
        chat.messages.iter_mut().rev().find(|m| m.id == id)
    }

    /// Find an outbound message by persistence uid.
    pub fn find_by_uid(&self, uid: &str) -> Option<MessageId> {
        self.chats
            .values()
            .flat_map(|c| c.messages.iter())
            .find(|m| m.uid == uid)
            .map(|m| m.id)
    }

    /// Set a message's status. Returns `false` if the message is gone.
    pub fn set_status(&mut self, id: MessageId, status: MessageStatus) -> bool {
        match self.message_mut(id) {
            Some(m) => {
                m.status = status;
                true
            }
            None => false,
        }
    }

    /// Reset a chat's unread count.
    pub fn mark_read(&mut self, key: &str) -> bool {
        let Some(id) = self.by_key.get(key) else {
            return false;
        };
        match self.chats.get_mut(id) {
            Some(c) => {
                c.unread_count = 0;
                true
            }
            None => false,
        }
    }

    /// Set a chat's archive flag.
    pub fn set_archived(&mut self, key: &str, archived: bool) -> bool {
        let Some(id) = self.by_key.get(key) else {
            return false;
        };
        match self.chats.get_mut(id) {
            Some(c) => {
                c.archived = archived;
                true
            }
            None => false,
        }
    }

    /// Remove a chat and invalidate its message ids.
    pub fn remove(&mut self, key: &str) -> Option<Chat> {
        let id = self.by_key.remove(key)?;
        let chat = self.chats.remove(&id)?;
        for m in &chat.messages {
            self.by_message.remove(&m.id);
        }
        Some(chat)
    }
}
