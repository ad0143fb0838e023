//! MMS delegate seam.
//!
//! MMS encoding and transfer belong to an external service. The account
//! hands it outbound messages through [`MmsDelegate::send_mms`] and learns
//! about completed inbound and outbound MMS through [`MmsEvent`]s on a
//! channel. The delegate keeps its own queue; [`MmsDelegate::acknowledge`]
//! removes an entry once the account has persisted it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chat::{Direction, MessageStatus};

/// Errors from the MMS delegate.
#[derive(Debug, thiserror::Error)]
pub enum MmsError {
    /// No MMS service is configured or reachable.
    #[error("MMS service unavailable")]
    Unavailable,

    /// The service rejected the request.
    #[error("MMS service rejected request: {0}")]
    Rejected(String),
}

/// An outbound MMS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmsRequest {
    /// Persistence uid of the message; echoed back in completion events.
    pub uid: String,
    /// Normalized recipient numbers.
    pub recipients: Vec<String>,
    /// Text body.
    pub body: String,
}

/// A completed MMS as reported by the delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmsEvent {
    /// Delegate queue identifier, passed back to [`MmsDelegate::acknowledge`].
    pub id: String,
    /// Uid of our outbound message, for outbound completions.
    pub uid: Option<String>,
    /// Sender number.
    pub sender: String,
    /// All recipient numbers (may include our own).
    pub recipients: Vec<String>,
    /// Inbound or outbound.
    pub direction: Direction,
    /// Status already decided by the delegate.
    pub status: MessageStatus,
    /// Text body.
    pub body: String,
    /// Send or receive time.
    pub timestamp: DateTime<Utc>,
}

/// External MMS service.
#[async_trait]
pub trait MmsDelegate: Send + Sync {
    /// Whether outbound MMS can be attempted at all.
    fn is_available(&self) -> bool;

    /// Queue an outbound MMS.
    async fn send_mms(&self, request: MmsRequest) -> Result<(), MmsError>;

    /// Drop a delegate queue entry after it was persisted.
    async fn acknowledge(&self, id: &str) -> Result<(), MmsError>;
}

/// Delegate used when no MMS service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledMms;

#[async_trait]
impl MmsDelegate for DisabledMms {
    fn is_available(&self) -> bool {
        false
    }

    async fn send_mms(&self, _request: MmsRequest) -> Result<(), MmsError> {
        Err(MmsError::Unavailable)
    }

    async fn acknowledge(&self, _id: &str) -> Result<(), MmsError> {
        Ok(())
    }
}
