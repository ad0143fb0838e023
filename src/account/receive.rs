//! Receive pipeline.
//!
//! A listing reads every entry in a modem's queue and classifies each one:
//! outbound entries are left to the send pipeline, status reports go to the
//! correlator, complete inbound messages are appended, persisted and then
//! deleted, and incomplete ones are handed to the reaper until their state
//! changes.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use crate::canonical;
use crate::chat::{Direction, MessageId, MessageKind, MessageStatus};
use crate::history::HistoryError;
use crate::mms::{MmsError, MmsEvent};
use crate::modem::{
    DevicePath, ModemTransport, PduKind, SmsEntry, SmsPath, SmsState, TransportError,
};
use crate::phone;

use super::correlator::Resolution;
use super::reaper::stuck_deadline;
use super::{new_message, Account, AccountNotice, Cleanup, Completion};

impl Account {
    /// Read a device's whole queue in the background.
    pub(super) fn list_messages(&mut self, device: DevicePath) {
        let transport = Arc::clone(&self.deps.transport);
        self.tasks.spawn(async move {
            let result = read_queue(transport.as_ref(), &device).await;
            Completion::Listed { device, result }
        });
    }

    pub(super) fn on_listed(
        &mut self,
        device: DevicePath,
        result: Result<Vec<SmsEntry>, TransportError>,
    ) {
        let entries = match result {
            Ok(entries) => entries,
            Err(e) => {
                warn!(device = %device, error = %e, "could not list modem messages");
                return;
            }
        };
        if !self.registry.contains(&device) {
            debug!(device = %device, "discarding listing of removed modem");
            return;
        }
        debug!(device = %device, count = entries.len(), "listed modem messages");
        // a retired path missing from its device's queue is gone for good
        let listed: HashSet<&SmsPath> = entries.iter().map(|e| &e.path).collect();
        self.retired
            .retain(|sms, owner| *owner != device || listed.contains(sms));
        for entry in entries {
            self.classify(&device, entry);
        }
    }

    pub(super) fn on_read(&mut self, device: DevicePath, result: Result<SmsEntry, TransportError>) {
        match result {
            Ok(entry) if self.registry.contains(&device) => self.classify(&device, entry),
            Ok(entry) => debug!(sms = %entry.path, "discarding entry of removed modem"),
            Err(e) => warn!(device = %device, error = %e, "could not read completed message"),
        }
    }

    fn classify(&mut self, device: &DevicePath, entry: SmsEntry) {
        if self.in_flight.contains(&entry.path) || self.retired.contains_key(&entry.path) {
            trace!(sms = %entry.path, "entry already being handled");
            return;
        }
        if matches!(entry.state, SmsState::Sending | SmsState::Sent) {
            trace!(sms = %entry.path, "skipping outbound entry");
            return;
        }

        match entry.pdu {
            PduKind::StatusReport => self.on_status_report(device, entry),
            PduKind::Deliver | PduKind::CdmaDeliver => match entry.state {
                SmsState::Received | SmsState::Stored => {
                    self.reaper.complete(&entry.path);
                    self.on_complete_deliver(device, entry);
                }
                SmsState::Receiving => self.watch_stuck(device, &entry),
                SmsState::Sending | SmsState::Sent | SmsState::Unknown => {
                    trace!(sms = %entry.path, state = ?entry.state, "skipping entry");
                }
            },
            PduKind::Submit | PduKind::CdmaSubmit => {
                trace!(sms = %entry.path, "skipping outbound entry");
            }
            PduKind::CdmaOther(_) | PduKind::Unknown(_) => {
                debug!(sms = %entry.path, pdu = ?entry.pdu, "ignoring unsupported PDU");
            }
        }
    }

    fn on_complete_deliver(&mut self, device: &DevicePath, entry: SmsEntry) {
        let country = self.country();
        let sender = phone::normalize(&entry.number, country.as_deref())
            .unwrap_or_else(|_| entry.number.trim().to_owned());
        let target = canonical::canonicalize(&sender, country.as_deref());
        let (chat, created) = self.chats.find_or_create(&target);
        if created {
            if let Some(summary) = self.chats.get(chat).map(|c| c.summary()) {
                self.publish(AccountNotice::ChatChanged(summary));
            }
        }

        let mut message = new_message(
            &mut self.chats,
            Direction::In,
            MessageKind::Sms,
            MessageStatus::Received,
            entry.text,
            entry.timestamp.unwrap_or_else(Utc::now),
        );
        message.sender = Some(sender);
        let id = self.append(chat, message);
        info!(sms = %entry.path, chat = %target.key, message = %id, "SMS received");

        let Some((chat, message)) = self.chats.message(id) else {
            return;
        };
        let summary = chat.summary();
        let message = message.clone();

        // Persist first; the modem copy is our only backup until then.
        self.in_flight.insert(entry.path.clone());
        let history = Arc::clone(&self.deps.history);
        let transport = Arc::clone(&self.deps.transport);
        let device = device.clone();
        let sms = entry.path;
        self.tasks.spawn(async move {
            let persisted = history.add_message(&summary, &message).await;
            let deleted = match persisted {
                Ok(()) => Some(transport.delete_message(&device, &sms).await),
                Err(_) => None,
            };
            Completion::InboundStored {
                device,
                sms,
                persisted,
                deleted,
            }
        });
    }

    pub(super) fn on_inbound_stored(
        &mut self,
        device: DevicePath,
        sms: SmsPath,
        persisted: Result<(), HistoryError>,
        deleted: Option<Result<(), TransportError>>,
    ) {
        self.in_flight.remove(&sms);
        if let Err(e) = persisted {
            // left in the queue; the next listing delivers it again
            warn!(sms = %sms, error = %e, "could not persist received SMS, leaving it on the modem");
            return;
        }
        match deleted {
            Some(Err(e)) => {
                warn!(sms = %sms, error = %e, "could not delete received SMS from modem");
            }
            Some(Ok(())) | None => trace!(sms = %sms, "received SMS stored"),
        }
        self.retired.insert(sms, device);
    }

    fn on_status_report(&mut self, device: &DevicePath, entry: SmsEntry) {
        let reference = entry.message_reference;
        match self.correlator.resolve(reference, entry.delivery_state) {
            Resolution::Delivered(message) => {
                let delivered_at = entry.discharge_timestamp.unwrap_or_else(Utc::now);
                if let Some(m) = self.chats.message_mut(message) {
                    m.delivered_at = Some(delivered_at);
                }
                if self.set_status(message, MessageStatus::Delivered) {
                    info!(message = %message, reference, "SMS delivered");
                    self.persist(message);
                } else {
                    debug!(reference, "delivered message no longer exists");
                }
            }
            Resolution::Failed(message) => {
                let reason = format!("delivery failed ({:?})", entry.delivery_state);
                self.fail_send(message, &reason);
            }
            Resolution::Pending(message) => {
                debug!(message = %message, reference, state = ?entry.delivery_state, "delivery still pending");
            }
            Resolution::Unmatched => {
                debug!(reference, "dropping unmatched status report");
            }
        }

        // The report is useless from here on, matched or not.
        self.in_flight.insert(entry.path.clone());
        self.delete_entry(device.clone(), entry.path, Cleanup::StatusReport);
    }

    fn watch_stuck(&mut self, device: &DevicePath, entry: &SmsEntry) {
        if self.reaper.contains(&entry.path) {
            return;
        }
        let delay = stuck_deadline(entry.timestamp, Utc::now(), &self.reaper_config);
        let sms = entry.path.clone();
        let timer = self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            Completion::StuckExpired { sms }
        });
        self.reaper.watch(entry.path.clone(), device.clone(), timer);
        debug!(sms = %entry.path, device = %device, delay_secs = delay.as_secs(), "watching incomplete message");
    }

    pub(super) fn on_sms_state_changed(&mut self, sms: SmsPath, state: SmsState) {
        if !matches!(state, SmsState::Received | SmsState::Stored) {
            trace!(sms = %sms, state = ?state, "SMS state changed");
            return;
        }
        let Some(device) = self.reaper.complete(&sms) else {
            return;
        };
        debug!(sms = %sms, "incomplete message finished");
        let transport = Arc::clone(&self.deps.transport);
        self.tasks.spawn(async move {
            let result = transport.read_message(&sms).await;
            Completion::Read { device, result }
        });
    }

    pub(super) fn on_stuck_expired(&mut self, sms: SmsPath) {
        let Some(device) = self.reaper.expire(&sms) else {
            return;
        };
        info!(sms = %sms, device = %device, "deleting stuck message");
        self.delete_entry(device, sms, Cleanup::Stuck);
    }

    pub(super) fn on_mms_event(&mut self, event: MmsEvent) {
        // one of ours, reporting its outcome
        if let Some(message) = event.uid.as_deref().and_then(|uid| self.chats.find_by_uid(uid)) {
            self.set_status(message, event.status);
            if event.status == MessageStatus::SendFailed {
                if let Some((chat, msg)) = self.chats.message(message) {
                    self.deps
                        .notifier
                        .send_failed(&chat.summary(), msg, "MMS delivery failed");
                }
            }
            self.persist_then_acknowledge(message, event.id);
            return;
        }
        if let Some(uid) = event.uid {
            // its chat was deleted meanwhile
            debug!(mms = %event.id, uid = %uid, "dropping MMS event for a removed message");
            let mms = Arc::clone(&self.deps.mms);
            self.tasks.spawn(async move {
                let result = mms.acknowledge(&event.id).await;
                Completion::MmsAcknowledged {
                    id: event.id,
                    result,
                }
            });
            return;
        }

        let country = self.country();
        let mut members = event.recipients;
        if event.direction == Direction::In {
            members.push(event.sender.clone());
        }
        let target = canonical::canonicalize_excluding(
            &members,
            &self.registry.own_numbers(),
            country.as_deref(),
        );
        let (chat, created) = self.chats.find_or_create(&target);
        if created {
            if let Some(summary) = self.chats.get(chat).map(|c| c.summary()) {
                self.publish(AccountNotice::ChatChanged(summary));
            }
        }

        let mut message = new_message(
            &mut self.chats,
            event.direction,
            MessageKind::Mms,
            event.status,
            event.body,
            event.timestamp,
        );
        if event.direction == Direction::In {
            message.sender = Some(
                phone::normalize(&event.sender, country.as_deref())
                    .unwrap_or_else(|_| event.sender.trim().to_owned()),
            );
        }
        let id = self.append(chat, message);
        info!(mms = %event.id, chat = %target.key, message = %id, "MMS recorded");
        self.persist_then_acknowledge(id, event.id);
    }

    /// Persist an MMS and drop it from the delegate queue only once stored.
    fn persist_then_acknowledge(&mut self, message: MessageId, id: String) {
        let Some((chat, msg)) = self.chats.message(message) else {
            return;
        };
        let summary = chat.summary();
        let msg = msg.clone();
        let history = Arc::clone(&self.deps.history);
        let mms = Arc::clone(&self.deps.mms);
        self.tasks.spawn(async move {
            let persisted = history.add_message(&summary, &msg).await;
            let acknowledged = match persisted {
                Ok(()) => Some(mms.acknowledge(&id).await),
                Err(_) => None,
            };
            Completion::MmsStored {
                id,
                chat: summary.key,
                message: msg.id,
                status: msg.status,
                persisted,
                acknowledged,
            }
        });
    }

    pub(super) fn on_mms_stored(
        &mut self,
        id: String,
        persisted: Result<(), HistoryError>,
        acknowledged: Option<Result<(), MmsError>>,
    ) {
        if let Err(e) = persisted {
            warn!(mms = %id, error = %e, "could not persist MMS, leaving it with the delegate");
            return;
        }
        if let Some(Err(e)) = acknowledged {
            warn!(mms = %id, error = %e, "could not acknowledge MMS");
        }
    }
}

/// List a queue and read every entry. Entries that vanish between the two
/// calls are skipped.
async fn read_queue(
    transport: &dyn ModemTransport,
    device: &DevicePath,
) -> Result<Vec<SmsEntry>, TransportError> {
    let paths = transport.list_messages(device).await?;
    let mut entries = Vec::with_capacity(paths.len());
    for sms in paths {
        match transport.read_message(&sms).await {
            Ok(entry) => entries.push(entry),
            Err(e) => debug!(sms = %sms, error = %e, "could not read queue entry"),
        }
    }
    Ok(entries)
}
