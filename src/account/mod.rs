//! The cellular messaging account.
//!
//! [`Account`] is an actor. One task owns every piece of mutable state: the
//! device registry, the chat list, the delivery correlator, the stuck-message
//! reaper, the pending-notification queue and the set of queue entries
//! currently being processed. Nothing else touches that state, so nothing is
//! locked.
//!
//! The actor reacts to four inputs on one `select!` loop:
//!
//! 1. Commands from [`AccountHandle`]s (request/reply over `oneshot`).
//! 2. Bus signals ([`TransportEvent`]).
//! 3. MMS delegate completions ([`MmsEvent`]).
//! 4. Completions of its own background work.
//!
//! Every bus round trip, history write and timer runs as a task in one
//! [`JoinSet`]; each task ends by returning a [`Completion`] that the loop
//! feeds back into a synchronous handler. Handlers never await. Aborting the
//! set at teardown cancels everything still in flight.

pub mod correlator;
pub mod reaper;
pub mod registry;

mod receive;
mod send;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::canonical;
use crate::chat::{
    ChatId, ChatList, ChatSummary, Direction, Message, MessageId, MessageKind, MessageStatus,
};
use crate::config::{AccountConfig, Config, ReaperConfig};
use crate::history::{HistoryError, HistoryStore};
use crate::mms::{MmsDelegate, MmsError, MmsEvent};
use crate::modem::{
    DeviceInfo, DevicePath, ModemTransport, SmsEntry, SmsPath, TransportError, TransportEvent,
};
use crate::notify::{chat_title, ContactsProvider, Notifier, PendingNotifications};

use self::correlator::Correlator;
use self::reaper::Reaper;
use self::registry::Registry;

/// Capacity of the notice broadcast channel.
const NOTICE_CAPACITY: usize = 256;

/// Aggregate connectivity of the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountStatus {
    /// At least one modem can carry messages.
    Connected,
    /// No modem is attached.
    Disconnected,
    /// Modems are attached but none is usable yet.
    Unknown,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Errors returned to callers of [`AccountHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    /// The recipient is not a usable phone number.
    #[error("invalid phone number: {0:?}")]
    InvalidNumber(String),

    /// No modem is available to send through.
    #[error("no modem available")]
    NoModem,

    /// A group message was requested but no MMS service is available.
    #[error("MMS service unavailable")]
    MmsUnavailable,

    /// Refused to send an empty message.
    #[error("message is empty")]
    EmptyMessage,

    /// No chat has this key.
    #[error("no chat {0:?}")]
    ChatNotFound(String),

    /// The account task has stopped.
    #[error("account is shut down")]
    Closed,
}

/// Changes observers may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountNotice {
    /// Aggregate connectivity changed.
    StatusChanged(AccountStatus),
    /// A chat was created or its metadata changed.
    ChatChanged(ChatSummary),
    /// A chat was deleted.
    ChatDeleted(String),
    /// A message was added or moved to a new status.
    MessageStatus {
        /// Key of the chat holding the message.
        chat: String,
        /// The message.
        message: MessageId,
        /// Its new status.
        status: MessageStatus,
    },
    /// A write of a message to history finished.
    MessageStored {
        /// Key of the chat holding the message.
        chat: String,
        /// The message.
        message: MessageId,
        /// Status of the written copy.
        status: MessageStatus,
        /// `false` if the write failed.
        saved: bool,
    },
}

/// Collaborators the account talks to.
pub struct AccountDeps {
    /// Modem management bus.
    pub transport: Arc<dyn ModemTransport>,
    /// Durable chat history.
    pub history: Arc<dyn HistoryStore>,
    /// User-visible alerts.
    pub notifier: Arc<dyn Notifier>,
    /// Number-to-name lookup for notification titles.
    pub contacts: Arc<dyn ContactsProvider>,
    /// External MMS service.
    pub mms: Arc<dyn MmsDelegate>,
}

/// Requests from handles.
enum Command {
    Send {
        recipients: String,
        text: String,
        reply: oneshot::Sender<Result<MessageId, AccountError>>,
    },
    FindChat {
        recipients: String,
        reply: oneshot::Sender<Option<ChatSummary>>,
    },
    Chats {
        reply: oneshot::Sender<Vec<ChatSummary>>,
    },
    Messages {
        key: String,
        reply: oneshot::Sender<Result<Vec<Message>, AccountError>>,
    },
    MarkRead {
        key: String,
        reply: oneshot::Sender<Result<(), AccountError>>,
    },
    SetArchived {
        key: String,
        archived: bool,
        reply: oneshot::Sender<Result<(), AccountError>>,
    },
    DeleteChat {
        key: String,
        reply: oneshot::Sender<Result<(), AccountError>>,
    },
    SetCountry {
        country: Option<String>,
        reply: oneshot::Sender<()>,
    },
    ContactsReady {
        reply: oneshot::Sender<usize>,
    },
    PendingReferences {
        reply: oneshot::Sender<Vec<u32>>,
    },
    StuckEntries {
        reply: oneshot::Sender<Vec<SmsPath>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Why a queue entry is being deleted outside the send and receive paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cleanup {
    StatusReport,
    Stuck,
    FailedSend,
}

/// Outcome of a background task, fed back into the actor.
enum Completion {
    Devices(Result<Vec<DeviceInfo>, TransportError>),
    Listed {
        device: DevicePath,
        result: Result<Vec<SmsEntry>, TransportError>,
    },
    Read {
        device: DevicePath,
        result: Result<SmsEntry, TransportError>,
    },
    Created {
        message: MessageId,
        device: DevicePath,
        result: Result<SmsPath, TransportError>,
    },
    Submitted {
        message: MessageId,
        device: DevicePath,
        sms: SmsPath,
        result: Result<(), TransportError>,
    },
    Reference {
        message: MessageId,
        device: DevicePath,
        sms: SmsPath,
        result: Result<u32, TransportError>,
    },
    SendQueueDeleted {
        message: MessageId,
        sms: SmsPath,
        result: Result<(), TransportError>,
    },
    InboundStored {
        device: DevicePath,
        sms: SmsPath,
        persisted: Result<(), HistoryError>,
        deleted: Option<Result<(), TransportError>>,
    },
    Deleted {
        device: DevicePath,
        sms: SmsPath,
        cleanup: Cleanup,
        result: Result<(), TransportError>,
    },
    StuckExpired {
        sms: SmsPath,
    },
    Persisted {
        chat: String,
        message: MessageId,
        uid: String,
        status: MessageStatus,
        result: Result<(), HistoryError>,
    },
    ChatStored {
        key: String,
        result: Result<(), HistoryError>,
    },
    MmsSubmitted {
        message: MessageId,
        result: Result<(), MmsError>,
    },
    MmsStored {
        id: String,
        chat: String,
        message: MessageId,
        status: MessageStatus,
        persisted: Result<(), HistoryError>,
        acknowledged: Option<Result<(), MmsError>>,
    },
    MmsAcknowledged {
        id: String,
        result: Result<(), MmsError>,
    },
}

/// Cloneable client for a running [`Account`].
#[derive(Debug, Clone)]
pub struct AccountHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<AccountStatus>,
    notices: broadcast::Sender<AccountNotice>,
}

impl AccountHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, AccountError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| AccountError::Closed)?;
        rx.await.map_err(|_| AccountError::Closed)
    }

    /// Send `text` to a comma-separated recipient list.
    ///
    /// Returns once the message is handed to a modem (or the MMS delegate);
    /// later progress is reported through [`AccountNotice::MessageStatus`].
    ///
    /// # Errors
    ///
    /// Validation failures ([`AccountError::InvalidNumber`],
    /// [`AccountError::NoModem`], [`AccountError::MmsUnavailable`]) are
    /// returned immediately; the message is still recorded as failed.
    pub async fn send_message(
        &self,
        recipients: &str,
        text: &str,
    ) -> Result<MessageId, AccountError> {
        self.request(|reply| Command::Send {
            recipients: recipients.to_owned(),
            text: text.to_owned(),
            reply,
        })
        .await?
    }

    /// Chat for a recipient list, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Closed`] if the account has stopped.
    pub async fn find_chat(&self, recipients: &str) -> Result<Option<ChatSummary>, AccountError> {
        self.request(|reply| Command::FindChat {
            recipients: recipients.to_owned(),
            reply,
        })
        .await
    }

    /// All chats, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Closed`] if the account has stopped.
    pub async fn chats(&self) -> Result<Vec<ChatSummary>, AccountError> {
        self.request(|reply| Command::Chats { reply }).await
    }

    /// Messages of a chat seen since the account started.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::ChatNotFound`] for unknown keys.
    pub async fn messages(&self, key: &str) -> Result<Vec<Message>, AccountError> {
        self.request(|reply| Command::Messages {
            key: key.to_owned(),
            reply,
        })
        .await?
    }

    /// Reset a chat's unread count.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::ChatNotFound`] for unknown keys.
    pub async fn mark_read(&self, key: &str) -> Result<(), AccountError> {
        self.request(|reply| Command::MarkRead {
            key: key.to_owned(),
            reply,
        })
        .await?
    }

    /// Archive or un-archive a chat.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::ChatNotFound`] for unknown keys.
    pub async fn set_archived(&self, key: &str, archived: bool) -> Result<(), AccountError> {
        self.request(|reply| Command::SetArchived {
            key: key.to_owned(),
            archived,
            reply,
        })
        .await?
    }

    /// Delete a chat and its history.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::ChatNotFound`] for unknown keys.
    pub async fn delete_chat(&self, key: &str) -> Result<(), AccountError> {
        self.request(|reply| Command::DeleteChat {
            key: key.to_owned(),
            reply,
        })
        .await?
    }

    /// Set (or clear) the user-chosen region for number normalization.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Closed`] if the account has stopped.
    pub async fn set_country(&self, country: Option<&str>) -> Result<(), AccountError> {
        self.request(|reply| Command::SetCountry {
            country: country.map(str::to_owned),
            reply,
        })
        .await
    }

    /// Tell the account contact names can be resolved. Flushes deferred
    /// notifications and returns how many were shown.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Closed`] if the account has stopped.
    pub async fn contacts_ready(&self) -> Result<usize, AccountError> {
        self.request(|reply| Command::ContactsReady { reply }).await
    }

    /// Message references awaiting a status report.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Closed`] if the account has stopped.
    pub async fn pending_references(&self) -> Result<Vec<u32>, AccountError> {
        self.request(|reply| Command::PendingReferences { reply })
            .await
    }

    /// Incomplete queue entries with a running deletion timer.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Closed`] if the account has stopped.
    pub async fn stuck_entries(&self) -> Result<Vec<SmsPath>, AccountError> {
        self.request(|reply| Command::StuckEntries { reply }).await
    }

    /// Current aggregate connectivity.
    pub fn status(&self) -> AccountStatus {
        *self.status.borrow()
    }

    /// Watch connectivity changes.
    pub fn status_watch(&self) -> watch::Receiver<AccountStatus> {
        self.status.clone()
    }

    /// Subscribe to account notices.
    pub fn subscribe(&self) -> broadcast::Receiver<AccountNotice> {
        self.notices.subscribe()
    }

    /// Stop the account, cancelling all in-flight work.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Closed`] if the account had already stopped.
    pub async fn shutdown(&self) -> Result<(), AccountError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// The account actor. Build with [`Account::new`], drive with
/// [`Account::run`] (or both at once with [`Account::spawn`]).
pub struct Account {
    settings: AccountConfig,
    reaper_config: ReaperConfig,
    deps: AccountDeps,
    user_country: Option<String>,
    registry: Registry,
    chats: ChatList,
    correlator: Correlator,
    reaper: Reaper,
    notifications: PendingNotifications,
    /// Queue entries whose persist or delete is still running.
    in_flight: HashSet<SmsPath>,
    /// Handled queue entries and their modem; a stale listing must not
    /// process them again. Pruned when a listing no longer shows them.
    retired: HashMap<SmsPath, DevicePath>,
    tasks: JoinSet<Completion>,
    commands: mpsc::Receiver<Command>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    mms_events: Option<mpsc::Receiver<MmsEvent>>,
    status: watch::Sender<AccountStatus>,
    notices: broadcast::Sender<AccountNotice>,
}

impl Account {
    /// Build an account and its handle. Nothing runs until [`Account::run`].
    pub fn new(
        config: &Config,
        deps: AccountDeps,
        transport_events: mpsc::Receiver<TransportEvent>,
        mms_events: Option<mpsc::Receiver<MmsEvent>>,
    ) -> (Self, AccountHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.account.event_buffer.max(1));
        let registry = Registry::new();
        let (status_tx, status_rx) = watch::channel(registry.status());
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        let handle = AccountHandle {
            commands: cmd_tx,
            status: status_rx,
            notices: notice_tx.clone(),
        };
        let account = Self {
            settings: config.account.clone(),
            reaper_config: config.reaper.clone(),
            deps,
            user_country: config.account.country.clone(),
            registry,
            chats: ChatList::new(),
            correlator: Correlator::new(),
            reaper: Reaper::new(),
            notifications: PendingNotifications::new(false),
            in_flight: HashSet::new(),
            retired: HashMap::new(),
            tasks: JoinSet::new(),
            commands: cmd_rx,
            transport_events: Some(transport_events),
            mms_events,
            status: status_tx,
            notices: notice_tx,
        };
        (account, handle)
    }

    /// Build an account and run it on a new task.
    pub fn spawn(
        config: &Config,
        deps: AccountDeps,
        transport_events: mpsc::Receiver<TransportEvent>,
        mms_events: Option<mpsc::Receiver<MmsEvent>>,
    ) -> (AccountHandle, JoinHandle<()>) {
        let (account, handle) = Self::new(config, deps, transport_events, mms_events);
        (handle, tokio::spawn(account.run()))
    }

    /// Run until shut down or until every handle is dropped.
    pub async fn run(mut self) {
        info!(country = ?self.country(), "account started");
        self.restore().await;
        self.enumerate_devices();

        let ack = loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => break Some(reply),
                    Some(cmd) => self.on_command(cmd),
                    None => break None,
                },
                event = next_event(&mut self.transport_events) => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        debug!("transport event channel closed");
                        self.transport_events = None;
                    }
                },
                event = next_event(&mut self.mms_events) => match event {
                    Some(event) => self.on_mms_event(event),
                    None => {
                        debug!("MMS event channel closed");
                        self.mms_events = None;
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.on_joined(joined);
                }
            }
        };

        self.teardown().await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        info!("account stopped");
    }

    async fn restore(&mut self) {
        match self.deps.history.load_chats().await {
            Ok(chats) => {
                let count = chats.len();
                for summary in chats {
                    self.chats.restore(summary);
                }
                info!(chats = count, "restored chat history");
            }
            Err(e) => warn!(error = %e, "could not load chat history"),
        }
    }

    async fn teardown(&mut self) {
        self.reaper.clear();
        self.tasks.shutdown().await;
        debug!("account tasks cancelled");
    }

    /// Region used for number normalization: the user's choice, else the SIM's.
    fn country(&self) -> Option<String> {
        self.user_country
            .clone()
            .or_else(|| self.registry.sim_country().map(str::to_owned))
    }

    fn publish(&self, notice: AccountNotice) {
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }

    fn refresh_status(&mut self) {
        let status = self.registry.status();
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!(%status, devices = self.registry.len(), "account status changed");
            self.publish(AccountNotice::StatusChanged(status));
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send {
                recipients,
                text,
                reply,
            } => {
                let result = self.start_send(&recipients, &text);
                let _ = reply.send(result);
            }
            Command::FindChat { recipients, reply } => {
                let country = self.country();
                let target = canonical::canonicalize(&recipients, country.as_deref());
                let _ = reply.send(self.chats.by_key(&target.key).map(|c| c.summary()));
            }
            Command::Chats { reply } => {
                let mut chats: Vec<ChatSummary> = self.chats.iter().map(|c| c.summary()).collect();
                chats.sort_by(|a, b| a.key.cmp(&b.key));
                let _ = reply.send(chats);
            }
            Command::Messages { key, reply } => {
                let result = self
                    .chats
                    .by_key(&key)
                    .map(|c| c.messages.clone())
                    .ok_or(AccountError::ChatNotFound(key));
                let _ = reply.send(result);
            }
            Command::MarkRead { key, reply } => {
                let result = if self.chats.mark_read(&key) {
                    self.chat_updated(&key);
                    Ok(())
                } else {
                    Err(AccountError::ChatNotFound(key))
                };
                let _ = reply.send(result);
            }
            Command::SetArchived {
                key,
                archived,
                reply,
            } => {
                let result = if self.chats.set_archived(&key, archived) {
                    self.chat_updated(&key);
                    Ok(())
                } else {
                    Err(AccountError::ChatNotFound(key))
                };
                let _ = reply.send(result);
            }
            Command::DeleteChat { key, reply } => {
                let _ = reply.send(self.delete_chat(key));
            }
            Command::SetCountry { country, reply } => {
                let country = country
                    .map(|c| c.trim().to_ascii_uppercase())
                    .filter(|c| !c.is_empty());
                info!(country = ?country, "country changed");
                self.user_country = country;
                let _ = reply.send(());
            }
            Command::ContactsReady { reply } => {
                let queued = self.notifications.mark_ready();
                let count = queued.len();
                for (chat, message) in queued {
                    self.show_notification(chat, &message);
                }
                debug!(flushed = count, "contacts ready");
                let _ = reply.send(count);
            }
            Command::PendingReferences { reply } => {
                let _ = reply.send(self.correlator.references());
            }
            Command::StuckEntries { reply } => {
                let _ = reply.send(self.reaper.paths());
            }
            Command::Shutdown { reply } => {
                // handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    fn chat_updated(&mut self, key: &str) {
        let Some(summary) = self.chats.by_key(key).map(|c| c.summary()) else {
            return;
        };
        self.publish(AccountNotice::ChatChanged(summary.clone()));
        let history = Arc::clone(&self.deps.history);
        self.tasks.spawn(async move {
            let result = history.update_chat(&summary).await;
            Completion::ChatStored {
                key: summary.key,
                result,
            }
        });
    }

    fn delete_chat(&mut self, key: String) -> Result<(), AccountError> {
        let Some(chat) = self.chats.remove(&key) else {
            return Err(AccountError::ChatNotFound(key));
        };
        self.notifications.forget(chat.id);
        info!(chat = %key, messages = chat.messages.len(), "chat deleted");
        self.publish(AccountNotice::ChatDeleted(key.clone()));
        let history = Arc::clone(&self.deps.history);
        self.tasks.spawn(async move {
            let result = history.delete_chat(&key).await;
            Completion::ChatStored { key, result }
        });
        Ok(())
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ServiceAppeared => {
                info!("modem service appeared");
                self.enumerate_devices();
            }
            TransportEvent::ServiceVanished => {
                warn!("modem service vanished");
                for device in self.registry.clear() {
                    self.reaper.evict_device(&device);
                }
                // object paths are only unique per service lifetime
                self.retired.clear();
                self.refresh_status();
            }
            TransportEvent::DeviceAdded(info) => self.add_device(info),
            TransportEvent::DeviceRemoved(device) => self.remove_device(&device),
            TransportEvent::ModemStateChanged { device, state } => {
                if self.registry.set_state(&device, state) {
                    self.refresh_status();
                }
            }
            TransportEvent::MessageAdded {
                device,
                sms,
                received,
            } => {
                if received && self.registry.contains(&device) {
                    debug!(device = %device, sms = %sms, "message added");
                    self.list_messages(device);
                } else {
                    trace!(device = %device, sms = %sms, "ignoring locally created message");
                }
            }
            TransportEvent::SmsStateChanged { sms, state } => self.on_sms_state_changed(sms, state),
        }
    }

    fn enumerate_devices(&mut self) {
        let transport = Arc::clone(&self.deps.transport);
        self.tasks
            .spawn(async move { Completion::Devices(transport.devices().await) });
    }

    fn add_device(&mut self, info: DeviceInfo) {
        let device = info.path.clone();
        if !self.registry.add(info) {
            return;
        }
        self.refresh_status();
        // pick up anything that arrived before we were watching
        self.list_messages(device);
    }

    fn remove_device(&mut self, device: &DevicePath) {
        if self.registry.remove(device).is_none() {
            return;
        }
        let evicted = self.reaper.evict_device(device);
        if !evicted.is_empty() {
            debug!(device = %device, count = evicted.len(), "dropped stuck-message timers");
        }
        self.retired.retain(|_, owner| owner != device);
        self.refresh_status();
    }

    fn on_joined(&mut self, joined: Result<Completion, JoinError>) {
        match joined {
            Ok(completion) => self.on_completion(completion),
            Err(e) if e.is_cancelled() => trace!("account task cancelled"),
            Err(e) => error!(error = %e, "account task failed"),
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Devices(Ok(devices)) => {
                debug!(count = devices.len(), "enumerated modems");
                for info in devices {
                    self.add_device(info);
                }
                self.refresh_status();
            }
            Completion::Devices(Err(e)) => {
                warn!(error = %e, "could not enumerate modems");
                self.refresh_status();
            }
            Completion::Listed { device, result } => self.on_listed(device, result),
            Completion::Read { device, result } => self.on_read(device, result),
            Completion::Created {
                message,
                device,
                result,
            } => self.on_created(message, device, result),
            Completion::Submitted {
                message,
                device,
                sms,
                result,
            } => self.on_submitted(message, device, sms, result),
            Completion::Reference {
                message,
                device,
                sms,
                result,
            } => self.on_reference(message, device, sms, result),
            Completion::SendQueueDeleted {
                message,
                sms,
                result,
            } => self.on_send_queue_deleted(message, sms, result),
            Completion::InboundStored {
                device,
                sms,
                persisted,
                deleted,
            } => self.on_inbound_stored(device, sms, persisted, deleted),
            Completion::Deleted {
                device,
                sms,
                cleanup,
                result,
            } => self.on_deleted(device, sms, cleanup, result),
            Completion::StuckExpired { sms } => self.on_stuck_expired(sms),
            Completion::Persisted {
                chat,
                message,
                uid,
                status,
                result,
            } => {
                match &result {
                    Ok(()) => trace!(uid = %uid, "message persisted"),
                    Err(e) => error!(uid = %uid, error = %e, "could not persist message"),
                }
                self.publish(AccountNotice::MessageStored {
                    chat,
                    message,
                    status,
                    saved: result.is_ok(),
                });
            }
            Completion::ChatStored { key, result } => {
                if let Err(e) = result {
                    error!(chat = %key, error = %e, "could not update chat history");
                }
            }
            Completion::MmsSubmitted { message, result } => self.on_mms_submitted(message, result),
            Completion::MmsStored {
                id,
                chat,
                message,
                status,
                persisted,
                acknowledged,
            } => {
                self.publish(AccountNotice::MessageStored {
                    chat,
                    message,
                    status,
                    saved: persisted.is_ok(),
                });
                self.on_mms_stored(id, persisted, acknowledged);
            }
            Completion::MmsAcknowledged { id, result } => {
                if let Err(e) = result {
                    warn!(mms = %id, error = %e, "could not acknowledge stale MMS event");
                }
            }
        }
    }

    /// Append a message and tell observers. Inbound messages also queue a
    /// notification.
    fn append(&mut self, chat: ChatId, message: Message) -> MessageId {
        let id = message.id;
        let status = message.status;
        let inbound = (message.direction == Direction::In).then(|| message.clone());
        if !self.chats.append(chat, message) {
            return id;
        }
        if let Some(summary) = self.chats.get(chat).map(|c| c.summary()) {
            self.publish(AccountNotice::MessageStatus {
                chat: summary.key.clone(),
                message: id,
                status,
            });
            self.publish(AccountNotice::ChatChanged(summary));
        }
        if let Some(message) = inbound {
            if let Some((chat, message)) = self.notifications.defer(chat, message) {
                self.show_notification(chat, &message);
            }
        }
        id
    }

    fn show_notification(&self, chat: ChatId, message: &Message) {
        let Some(chat) = self.chats.get(chat) else {
            return;
        };
        let summary = chat.summary();
        let title = chat_title(&summary, self.deps.contacts.as_ref());
        self.deps.notifier.message_received(&summary, &title, message);
    }

    /// Move a message to `status` and tell observers. `false` if the message
    /// no longer exists.
    fn set_status(&mut self, message: MessageId, status: MessageStatus) -> bool {
        if !self.chats.set_status(message, status) {
            return false;
        }
        if let Some((chat, _)) = self.chats.message(message) {
            let key = chat.key.clone();
            self.publish(AccountNotice::MessageStatus {
                chat: key,
                message,
                status,
            });
        }
        true
    }

    /// Write a message's current state to history in the background.
    fn persist(&mut self, message: MessageId) {
        let Some((chat, msg)) = self.chats.message(message) else {
            debug!(message = %message, "not persisting message of deleted chat");
            return;
        };
        let summary = chat.summary();
        let msg = msg.clone();
        let history = Arc::clone(&self.deps.history);
        self.tasks.spawn(async move {
            let result = history.add_message(&summary, &msg).await;
            Completion::Persisted {
                chat: summary.key,
                message: msg.id,
                uid: msg.uid,
                status: msg.status,
                result,
            }
        });
    }

    /// Mark an outbound message failed, persist it and alert the user.
    fn fail_send(&mut self, message: MessageId, reason: &str) {
        if !self.set_status(message, MessageStatus::SendFailed) {
            debug!(message = %message, reason, "failed message no longer exists");
            return;
        }
        warn!(message = %message, reason, "send failed");
        self.persist(message);
        if let Some((chat, msg)) = self.chats.message(message) {
            self.deps.notifier.send_failed(&chat.summary(), msg, reason);
        }
    }

    fn delete_entry(&mut self, device: DevicePath, sms: SmsPath, cleanup: Cleanup) {
        let transport = Arc::clone(&self.deps.transport);
        self.tasks.spawn(async move {
            let result = transport.delete_message(&device, &sms).await;
            Completion::Deleted {
                device,
                sms,
                cleanup,
                result,
            }
        });
    }

    fn on_deleted(
        &mut self,
        device: DevicePath,
        sms: SmsPath,
        cleanup: Cleanup,
        result: Result<(), TransportError>,
    ) {
        self.in_flight.remove(&sms);
        match result {
            Ok(()) => {
                debug!(sms = %sms, ?cleanup, "queue entry deleted");
                if cleanup == Cleanup::StatusReport {
                    self.retired.insert(sms, device);
                }
            }
            Err(e) => warn!(sms = %sms, ?cleanup, error = %e, "could not delete queue entry"),
        }
    }
}

async fn next_event<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Fresh message with a random uid.
fn new_message(
    chats: &mut ChatList,
    direction: Direction,
    kind: MessageKind,
    status: MessageStatus,
    body: String,
    timestamp: DateTime<Utc>,
) -> Message {
    Message {
        id: chats.next_message_id(),
        uid: uuid::Uuid::new_v4().to_string(),
        direction,
        kind,
        status,
        body,
        sender: None,
        timestamp,
        delivered_at: None,
    }
}
