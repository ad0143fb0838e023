//! User notifications and contact-name resolution.
//!
//! Inbound-message notifications are deferred until the contacts provider is
//! ready, so the notification can show a name instead of a bare number.
//! [`PendingNotifications`] holds them meanwhile; the account flushes it when
//! told the provider is ready.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::chat::{ChatId, ChatSummary, Message};

/// Presentation boundary for user-visible alerts.
///
/// Implementations must return quickly: they are called from the account's
/// event loop.
pub trait Notifier: Send + Sync {
    /// A new inbound message arrived in `chat`.
    fn message_received(&self, chat: &ChatSummary, title: &str, message: &Message);

    /// An outbound message could not be sent.
    fn send_failed(&self, chat: &ChatSummary, message: &Message, reason: &str);
}

/// Resolves phone numbers to display names.
pub trait ContactsProvider: Send + Sync {
    /// Display name for a normalized number, if known.
    fn lookup(&self, number: &str) -> Option<String>;
}

/// Notifier that emits structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn message_received(&self, chat: &ChatSummary, title: &str, message: &Message) {
        info!(
            chat = %chat.key,
            from = %title,
            unread = chat.unread_count,
            preview = %preview(&message.body),
            "new message"
        );
    }

    fn send_failed(&self, chat: &ChatSummary, message: &Message, reason: &str) {
        warn!(chat = %chat.key, message = %message.id, reason, "message could not be sent");
    }
}

/// Contacts from a fixed `number -> name` table (the `[contacts]` config).
#[derive(Debug, Default, Clone)]
pub struct StaticContacts {
    names: HashMap<String, String>,
}

impl StaticContacts {
    /// Build from raw config entries, normalizing each number.
    pub fn new(entries: &HashMap<String, String>, country: Option<&str>) -> Self {
        let names = entries
            .iter()
            .map(|(number, name)| {
                let key = crate::phone::normalize(number, country).unwrap_or_else(|_| number.clone());
                (key, name.clone())
            })
            .collect();
        Self { names }
    }
}

impl ContactsProvider for StaticContacts {
    fn lookup(&self, number: &str) -> Option<String> {
        self.names.get(number).cloned()
    }
}

/// Title for a chat: its own name, a contact name for one-to-one chats, or
/// the member list.
pub fn chat_title(chat: &ChatSummary, contacts: &dyn ContactsProvider) -> String {
    if let Some(name) = &chat.name {
        return name.clone();
    }
    let names: Vec<String> = chat
        .members
        .iter()
        .map(|m| contacts.lookup(m).unwrap_or_else(|| m.clone()))
        .collect();
    if names.is_empty() {
        chat.key.clone()
    } else {
        names.join(", ")
    }
}

/// Inbound notifications waiting for the contacts provider.
///
/// Keeps only the latest message per chat; one notification per chat is
/// enough once names can be shown.
#[derive(Debug, Default)]
pub struct PendingNotifications {
    ready: bool,
    queued: Vec<(ChatId, Message)>,
}

impl PendingNotifications {
    /// Create a queue; `ready` is whether contacts are already available.
    pub fn new(ready: bool) -> Self {
        Self {
            ready,
            queued: Vec::new(),
        }
    }

    /// Whether notifications go out immediately.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Queue a notification. Returns it back if it should be shown now.
    pub fn defer(&mut self, chat: ChatId, message: Message) -> Option<(ChatId, Message)> {
        if self.ready {
            return Some((chat, message));
        }
        self.queued.retain(|(c, _)| *c != chat);
        self.queued.push((chat, message));
        None
    }

    /// Mark contacts ready and drain everything queued so far.
    pub fn mark_ready(&mut self) -> Vec<(ChatId, Message)> {
        self.ready = true;
        std::mem::take(&mut self.queued)
    }

    /// Number of queued notifications.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Drop any queued notification for a chat that went away.
    pub fn forget(&mut self, chat: ChatId) {
        self.queued.retain(|(c, _)| *c != chat);
    }
}

fn preview(body: &str) -> String {
    body.chars().take(40).collect()
}
