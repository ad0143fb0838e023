//! Send pipeline.
//!
//! `start_send` validates and records the message, then each modem round
//! trip is a task whose completion schedules the next one:
//!
//! create -> send -> read reference -> register -> delete -> persist.
//!
//! The send-queue entry is deleted only after its reference is registered,
//! and the message is persisted only after the delete returned.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::canonical::{self, Recipients, SEPARATOR};
use crate::chat::{Direction, MessageId, MessageKind, MessageStatus};
use crate::mms::{MmsError, MmsRequest};
use crate::modem::{CreateRequest, DevicePath, SmsPath, TransportError, UNKNOWN_REFERENCE};
use crate::phone;

use super::{new_message, Account, AccountError, AccountNotice, Cleanup, Completion};

impl Account {
    pub(super) fn start_send(
        &mut self,
        recipients: &str,
        text: &str,
    ) -> Result<MessageId, AccountError> {
        if text.trim().is_empty() {
            return Err(AccountError::EmptyMessage);
        }
        let country = self.country();
        let tokens: Vec<String> = recipients.split(SEPARATOR).map(str::to_owned).collect();
        let mut target = canonical::canonicalize_excluding(
            &tokens,
            &self.registry.own_numbers(),
            country.as_deref(),
        );
        if target.is_empty() {
            // texting only ourselves
            target = canonical::canonicalize(recipients, country.as_deref());
        }
        if target.is_empty() {
            return Err(AccountError::InvalidNumber(recipients.trim().to_owned()));
        }

        if target.is_group() {
            return self.start_mms(&target, text);
        }

        let message = self.record_outbound(&target, MessageKind::Sms, text);

        // 1. The destination must be a dialable number.
        let raw = target.members.first().cloned().unwrap_or_default();
        let number = match phone::normalize(&raw, country.as_deref()) {
            Ok(n) => n,
            Err(e) => {
                self.fail_send(message, &e.to_string());
                return Err(AccountError::InvalidNumber(raw));
            }
        };

        // 2. Some modem must be able to take it.
        let Some(device) = self.registry.pick().cloned() else {
            self.fail_send(message, "no modem available");
            return Err(AccountError::NoModem);
        };

        // 3. Create the queue entry.
        self.set_status(message, MessageStatus::Sending);
        let request = CreateRequest {
            text: text.to_owned(),
            number,
            delivery_report: self.settings.delivery_reports,
            validity: self.settings.validity(),
        };
        debug!(message = %message, device = %device, number = %request.number, "creating SMS");
        let transport = Arc::clone(&self.deps.transport);
        self.tasks.spawn(async move {
            let result = transport.create_message(&device, &request).await;
            Completion::Created {
                message,
                device,
                result,
            }
        });
        Ok(message)
    }

    /// Find or create the chat and append a draft to it.
    fn record_outbound(&mut self, target: &Recipients, kind: MessageKind, text: &str) -> MessageId {
        let (chat, created) = self.chats.find_or_create(target);
        if created {
            if let Some(summary) = self.chats.get(chat).map(|c| c.summary()) {
                self.publish(AccountNotice::ChatChanged(summary));
            }
        }
        let message = new_message(
            &mut self.chats,
            Direction::Out,
            kind,
            MessageStatus::Draft,
            text.to_owned(),
            Utc::now(),
        );
        self.append(chat, message)
    }

    pub(super) fn on_created(
        &mut self,
        message: MessageId,
        device: DevicePath,
        result: Result<SmsPath, TransportError>,
    ) {
        let sms = match result {
            Ok(sms) => sms,
            Err(e) => {
                self.fail_send(message, &e.to_string());
                return;
            }
        };

        // 4. Submit it.
        let transport = Arc::clone(&self.deps.transport);
        self.tasks.spawn(async move {
            let result = transport.send_message(&sms).await;
            Completion::Submitted {
                message,
                device,
                sms,
                result,
            }
        });
    }

    pub(super) fn on_submitted(
        &mut self,
        message: MessageId,
        device: DevicePath,
        sms: SmsPath,
        result: Result<(), TransportError>,
    ) {
        if let Err(e) = result {
            self.fail_send(message, &e.to_string());
            // the created entry would otherwise sit in the queue forever
            self.delete_entry(device, sms, Cleanup::FailedSend);
            return;
        }

        // 5. Sent; learn the reference the network will report against.
        self.set_status(message, MessageStatus::Sent);
        info!(message = %message, sms = %sms, "SMS sent");
        let transport = Arc::clone(&self.deps.transport);
        let retry = self.settings.reference_retry();
        self.tasks.spawn(async move {
            let mut result = transport.message_reference(&sms).await;
            if matches!(result, Ok(UNKNOWN_REFERENCE)) {
                // some modems publish the reference a little after the send returns
                tokio::time::sleep(retry).await;
                result = transport.message_reference(&sms).await;
            }
            Completion::Reference {
                message,
                device,
                sms,
                result,
            }
        });
    }

    pub(super) fn on_reference(
        &mut self,
        message: MessageId,
        device: DevicePath,
        sms: SmsPath,
        result: Result<u32, TransportError>,
    ) {
        match result {
            Ok(UNKNOWN_REFERENCE) => {
                warn!(message = %message, "message reference unknown, delivery will not be tracked");
            }
            Ok(reference) => {
                if let Some(previous) = self.correlator.register(reference, message) {
                    warn!(reference, previous = %previous, "message reference reused before its report arrived");
                }
                debug!(message = %message, reference, "awaiting delivery report");
            }
            Err(e) => {
                warn!(message = %message, error = %e, "could not read message reference");
            }
        }

        // 6. Only now may the send-queue entry go.
        let transport = Arc::clone(&self.deps.transport);
        self.tasks.spawn(async move {
            let result = transport.delete_message(&device, &sms).await;
            Completion::SendQueueDeleted {
                message,
                sms,
                result,
            }
        });
    }

    pub(super) fn on_send_queue_deleted(
        &mut self,
        message: MessageId,
        sms: SmsPath,
        result: Result<(), TransportError>,
    ) {
        if let Err(e) = result {
            warn!(message = %message, sms = %sms, error = %e, "could not delete sent SMS from modem");
        }
        self.persist(message);
    }

    fn start_mms(&mut self, target: &Recipients, text: &str) -> Result<MessageId, AccountError> {
        let message = self.record_outbound(target, MessageKind::Mms, text);
        if !self.deps.mms.is_available() {
            self.fail_send(message, "MMS service unavailable");
            return Err(AccountError::MmsUnavailable);
        }
        let Some(uid) = self.chats.message(message).map(|(_, m)| m.uid.clone()) else {
            return Err(AccountError::ChatNotFound(target.key.clone()));
        };

        self.set_status(message, MessageStatus::Sending);
        let request = MmsRequest {
            uid,
            recipients: target.members.clone(),
            body: text.to_owned(),
        };
        debug!(message = %message, recipients = request.recipients.len(), "handing MMS to delegate");
        let mms = Arc::clone(&self.deps.mms);
        self.tasks.spawn(async move {
            let result = mms.send_mms(request).await;
            Completion::MmsSubmitted { message, result }
        });
        Ok(message)
    }

    pub(super) fn on_mms_submitted(&mut self, message: MessageId, result: Result<(), MmsError>) {
        match result {
            // the delegate reports the outcome through an MmsEvent
            Ok(()) => debug!(message = %message, "MMS queued by delegate"),
            Err(e) => self.fail_send(message, &e.to_string()),
        }
    }
}
