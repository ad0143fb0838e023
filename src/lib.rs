//! cellchat: an SMS/MMS account for ModemManager modems.
//!
//! Sends and receives text messages through the modem's message queue,
//! tracks delivery reports, keeps multi-recipient chats under a stable
//! identity and keeps the modem's small queue from filling up with
//! messages that will never complete.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod canonical;
pub mod chat;
pub mod config;
pub mod logging;
pub mod phone;

pub mod history;
pub mod mms;
pub mod modem;
pub mod notify;

pub mod account;

pub use account::{Account, AccountDeps, AccountError, AccountHandle, AccountNotice, AccountStatus};
