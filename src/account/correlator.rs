//! Delivery correlator: matches status reports to sent messages.
//!
//! Correlation keys on the message reference alone. Modems recycle
//! references, so a new registration silently replaces an older one.

use std::collections::HashMap;

use tracing::debug;

use crate::chat::MessageId;
use crate::modem::{DeliveryState, UNKNOWN_REFERENCE};

/// What a status report means for the message it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The message reached the recipient.
    Delivered(MessageId),
    /// The network gave up on the message.
    Failed(MessageId),
    /// Matched, but the network will report again later.
    Pending(MessageId),
    /// No sent message carries this reference.
    Unmatched,
}

/// Sent messages awaiting a status report, keyed by message reference.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<u32, MessageId>,
}

impl Correlator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for a report on `reference`.
    ///
    /// Returns the message previously registered under the same reference,
    /// which will never be matched now. The unknown-reference sentinel is
    /// never registered.
    pub fn register(&mut self, reference: u32, message: MessageId) -> Option<MessageId> {
        if reference == UNKNOWN_REFERENCE {
            return None;
        }
        self.pending.insert(reference, message)
    }

    /// Apply a status report.
    ///
    /// Terminal outcomes remove the pending entry; temporary ones keep it.
    pub fn resolve(&mut self, reference: u32, state: DeliveryState) -> Resolution {
        let Some(message) = self.pending.get(&reference).copied() else {
            debug!(reference, "status report matches no sent message");
            return Resolution::Unmatched;
        };
        match state {
            DeliveryState::Completed(_) => {
                self.pending.remove(&reference);
                Resolution::Delivered(message)
            }
            DeliveryState::Failed(_) => {
                self.pending.remove(&reference);
                Resolution::Failed(message)
            }
            DeliveryState::Temporary(_) | DeliveryState::Unknown => Resolution::Pending(message),
        }
    }

    /// References currently awaiting a report, ascending.
    pub fn references(&self) -> Vec<u32> {
        let mut refs: Vec<u32> = self.pending.keys().copied().collect();
        refs.sort_unstable();
        refs
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
