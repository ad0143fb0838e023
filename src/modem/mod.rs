//! Modem transport: the hardware management bus as seen by the account.
//!
//! [`ModemTransport`] is the seam between the account and ModemManager.
//! Calls are plain async round trips; bus signals are delivered separately
//! as [`TransportEvent`]s on a channel, so the account can treat both as
//! events on its own loop. [`dbus::ModemManagerTransport`] is the real
//! implementation.

pub mod dbus;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};

/// Object path of a modem exposing the messaging interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePath(pub String);

/// Object path of one entry in a modem's message queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SmsPath(pub String);

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SmsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Modem state as reported by ModemManager (`MMModemState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModemState {
    /// The modem is unusable.
    Failed,
    /// State unknown.
    Unknown,
    /// Being initialized.
    Initializing,
    /// SIM locked.
    Locked,
    /// Powered down.
    Disabled,
    /// Powering down.
    Disabling,
    /// Powering up.
    Enabling,
    /// Powered up, not registered.
    Enabled,
    /// Searching for a network.
    Searching,
    /// Registered on a network.
    Registered,
    /// Tearing down a data connection.
    Disconnecting,
    /// Bringing up a data connection.
    Connecting,
    /// Data connection active.
    Connected,
}

impl ModemState {
    /// Decode the wire value.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            -1 => Self::Failed,
            1 => Self::Initializing,
            2 => Self::Locked,
            3 => Self::Disabled,
            4 => Self::Disabling,
            5 => Self::Enabling,
            6 => Self::Enabled,
            7 => Self::Searching,
            8 => Self::Registered,
            9 => Self::Disconnecting,
            10 => Self::Connecting,
            11 => Self::Connected,
            _ => Self::Unknown,
        }
    }

    /// Whether the modem can carry messages (state at or above enabled).
    pub fn is_usable(self) -> bool {
        self >= Self::Enabled
    }
}

/// State of a queue entry (`MMSmsState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmsState {
    /// Unknown.
    Unknown,
    /// Stored, not yet sent (outbound) or complete (inbound on some modems).
    Stored,
    /// Multipart inbound message still being assembled.
    Receiving,
    /// Inbound message complete.
    Received,
    /// Outbound message being sent.
    Sending,
    /// Outbound message sent.
    Sent,
}

impl SmsState {
    /// Decode the wire value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Stored,
            2 => Self::Receiving,
            3 => Self::Received,
            4 => Self::Sending,
            5 => Self::Sent,
            _ => Self::Unknown,
        }
    }
}

/// Kind of PDU held by a queue entry (`MMSmsPduType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduKind {
    /// GSM SMS-DELIVER: an inbound message.
    Deliver,
    /// GSM SMS-SUBMIT: an outbound message.
    Submit,
    /// GSM SMS-STATUS-REPORT: a delivery report for an earlier submit.
    StatusReport,
    /// CDMA inbound message.
    CdmaDeliver,
    /// CDMA outbound message.
    CdmaSubmit,
    /// Other CDMA teleservice PDUs (cancellation, acknowledgements).
    CdmaOther(u32),
    /// Not reported or not recognised.
    Unknown(u32),
}

impl PduKind {
    /// Decode the wire value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Deliver,
            2 => Self::Submit,
            3 => Self::StatusReport,
            32 => Self::CdmaDeliver,
            33 => Self::CdmaSubmit,
            34..=37 => Self::CdmaOther(raw),
            other => Self::Unknown(other),
        }
    }
}

/// Outcome class of a status report (`MMSmsDeliveryState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Delivered (received, forwarded unconfirmed, or replaced by the SC).
    Completed(u32),
    /// The network is still trying; another report will follow.
    Temporary(u32),
    /// Delivery failed for good.
    Failed(u32),
    /// No state reported.
    Unknown,
}

impl DeliveryState {
    /// Decode the wire value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x00..=0x02 => Self::Completed(raw),
            0x20..=0x3f => Self::Temporary(raw),
            0x40..=0x5f | 0x60..=0xff => Self::Failed(raw),
            _ => Self::Unknown,
        }
    }
}

/// A modem's messaging endpoint as discovered on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Modem object path.
    pub path: DevicePath,
    /// Whether the modem exposes the messaging interface.
    pub messaging: bool,
    /// Current modem state.
    pub state: ModemState,
    /// Subscriber numbers reported by the modem.
    pub own_numbers: Vec<String>,
    /// IMSI of the inserted SIM, if any.
    pub imsi: Option<String>,
}

/// One entry of a modem's message queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsEntry {
    /// Entry object path.
    pub path: SmsPath,
    /// Entry state.
    pub state: SmsState,
    /// PDU kind.
    pub pdu: PduKind,
    /// Remote number (sender for deliver, recipient for submit/report).
    pub number: String,
    /// Text body, empty for status reports.
    pub text: String,
    /// Service-centre timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// Discharge time carried by status reports.
    pub discharge_timestamp: Option<DateTime<Utc>>,
    /// Delivery outcome carried by status reports.
    pub delivery_state: DeliveryState,
    /// Message reference (`0` when not yet known).
    pub message_reference: u32,
}

/// Parameters for creating an outbound queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Message text.
    pub text: String,
    /// Normalized destination number.
    pub number: String,
    /// Ask the network for a delivery report.
    pub delivery_report: bool,
    /// Relative validity period.
    pub validity: u32,
}

/// Sentinel the modem reports until a message reference is assigned.
pub const UNKNOWN_REFERENCE: u32 = 0;

/// Signals from the bus, delivered in order on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The management service appeared on the bus.
    ServiceAppeared,
    /// The management service left the bus.
    ServiceVanished,
    /// A modem was added.
    DeviceAdded(DeviceInfo),
    /// A modem was removed.
    DeviceRemoved(DevicePath),
    /// A modem changed state.
    ModemStateChanged {
        /// The modem.
        device: DevicePath,
        /// Its new state.
        state: ModemState,
    },
    /// A new entry appeared in a modem's queue.
    MessageAdded {
        /// The modem.
        device: DevicePath,
        /// The new entry.
        sms: SmsPath,
        /// Whether the entry was received (vs. created locally).
        received: bool,
    },
    /// A queue entry changed state.
    SmsStateChanged {
        /// The entry.
        sms: SmsPath,
        /// Its new state.
        state: SmsState,
    },
}

/// Errors from bus round trips.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The management service is not on the bus.
    #[error("modem service unavailable")]
    ServiceUnavailable,

    /// The object no longer exists.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// The modem rejected the request.
    #[error("modem rejected request: {0}")]
    Rejected(String),

    /// A reply could not be decoded.
    #[error("malformed reply: {0}")]
    Malformed(String),

    /// Underlying D-Bus failure.
    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),
}

/// Round trips to the modem management service.
#[async_trait]
pub trait ModemTransport: Send + Sync {
    /// Enumerate modems currently known to the service.
    async fn devices(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// List the entries in a modem's message queue.
    async fn list_messages(&self, device: &DevicePath) -> Result<Vec<SmsPath>, TransportError>;

    /// Read one queue entry.
    async fn read_message(&self, sms: &SmsPath) -> Result<SmsEntry, TransportError>;

    /// Create an outbound entry in a modem's queue.
    async fn create_message(
        &self,
        device: &DevicePath,
        request: &CreateRequest,
    ) -> Result<SmsPath, TransportError>;

    /// Submit a created entry to the network.
    async fn send_message(&self, sms: &SmsPath) -> Result<(), TransportError>;

    /// Remove an entry from a modem's queue.
    async fn delete_message(&self, device: &DevicePath, sms: &SmsPath)
        -> Result<(), TransportError>;

    /// Read the network-assigned message reference of a sent entry.
    async fn message_reference(&self, sms: &SmsPath) -> Result<u32, TransportError> {
        Ok(self.read_message(sms).await?.message_reference)
    }
}

/// Parse a ModemManager timestamp.
///
/// ModemManager renders offsets as `+HH` on some versions, so the value is
/// retried with `:00` appended before giving up.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::<FixedOffset>::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::<FixedOffset>::parse_from_rfc3339(&format!("{raw}:00")) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}
