//! cellchat CLI entry point.
//!
//! Provides `start`, `send`, `chats` and `key` subcommands for running the
//! account service, sending one message, listing stored chats, or printing
//! the canonical chat key of a recipient list.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use cellchat::chat::MessageStatus;
use cellchat::config::Config;
use cellchat::history::{HistoryStore, SqliteHistory};
use cellchat::mms::DisabledMms;
use cellchat::modem::dbus::ModemManagerTransport;
use cellchat::notify::{LogNotifier, StaticContacts};
use cellchat::{canonical, logging};
use cellchat::{Account, AccountDeps, AccountHandle, AccountNotice, AccountStatus};

/// cellchat: SMS/MMS over ModemManager.
#[derive(Parser)]
#[command(name = "cellchat", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the account service until interrupted.
    Start,
    /// Send one message and wait for its outcome.
    Send {
        /// Comma-separated recipient numbers.
        recipients: String,
        /// Message text.
        text: String,
        /// How long to wait for a modem and for the send to finish.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// List stored chats.
    Chats,
    /// Print the canonical chat key for a recipient list.
    Key {
        /// Comma-separated recipient numbers.
        recipients: String,
        /// ISO 3166 region used for numbers without a country code.
        #[arg(long)]
        country: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start().await,
        Command::Send {
            recipients,
            text,
            timeout_secs,
        } => handle_send(&recipients, &text, Duration::from_secs(timeout_secs)).await,
        Command::Chats => handle_chats().await,
        Command::Key {
            recipients,
            country,
        } => handle_key(&recipients, country),
    }
}

/// Run the account against ModemManager until Ctrl-C.
async fn handle_start() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let logs_dir = config.logs_dir()?;
    let _logging_guard = logging::init_production(&logs_dir, &config.logging.level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "cellchat starting");
    let (handle, task) = start_account(&config).await?;

    let mut notices = handle.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("interrupted, shutting down");
                break;
            }
            notice = notices.recv() => match notice {
                Ok(AccountNotice::StatusChanged(status)) => info!(%status, "account status"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "notice stream lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "account already stopped");
    }
    task.await.context("account task failed")?;
    info!("cellchat stopped");
    Ok(())
}

/// Send one message, waiting first for a usable modem.
async fn handle_send(recipients: &str, text: &str, timeout: Duration) -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    logging::init_cli(&config.logging.level);

    let (handle, task) = start_account(&config).await?;
    let outcome = tokio::time::timeout(timeout, send_and_wait(&handle, recipients, text)).await;

    let _ = handle.shutdown().await;
    task.await.context("account task failed")?;

    match outcome {
        Ok(Ok(status)) => {
            println!("{}", status.as_str());
            if status == MessageStatus::SendFailed {
                anyhow::bail!("message could not be sent");
            }
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => anyhow::bail!("timed out after {}s", timeout.as_secs()),
    }
}

async fn send_and_wait(
    handle: &AccountHandle,
    recipients: &str,
    text: &str,
) -> anyhow::Result<MessageStatus> {
    let mut status = handle.status_watch();
    status
        .wait_for(|s| *s == AccountStatus::Connected)
        .await
        .context("account stopped before a modem appeared")?;

    // the chain ends with the history write, after the send-queue delete
    let mut notices = handle.subscribe();
    let id = handle.send_message(recipients, text).await?;
    loop {
        match notices.recv().await {
            Ok(AccountNotice::MessageStored {
                message,
                status,
                saved,
                ..
            }) if message == id => match status {
                MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::SendFailed => {
                    if !saved {
                        anyhow::bail!("message {} but not written to history", status.as_str());
                    }
                    return Ok(status);
                }
                MessageStatus::Draft | MessageStatus::Sending | MessageStatus::Received => {}
            },
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("account stopped before the message was sent")
            }
        }
    }
}

/// Print stored chats.
async fn handle_chats() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    logging::init_cli(&config.logging.level);

    let db_path = config.database_path()?;
    let history = SqliteHistory::open(&db_path).await?;
    let chats = history
        .load_chats()
        .await
        .context("failed to load chats")?;

    if chats.is_empty() {
        println!("no chats");
    }
    for chat in chats {
        let name = chat.name.as_deref().unwrap_or("-");
        let archived = if chat.archived { " (archived)" } else { "" };
        println!(
            "{}\t{}\t{} unread{}\t{}",
            chat.key,
            name,
            chat.unread_count,
            archived,
            chat.last_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Print the canonical key of a recipient list.
fn handle_key(recipients: &str, country: Option<String>) -> anyhow::Result<()> {
    let country = match country {
        Some(c) => Some(c),
        None => Config::load()
            .context("failed to load configuration")?
            .account
            .country,
    };
    let target = canonical::canonicalize(recipients, country.as_deref());
    if target.is_empty() {
        anyhow::bail!("no recipients in {recipients:?}");
    }
    println!("{}", target.key);
    Ok(())
}

/// Wire the account to ModemManager, the history database and the bundled
/// notifier and contacts.
async fn start_account(
    config: &Config,
) -> anyhow::Result<(AccountHandle, tokio::task::JoinHandle<()>)> {
    let db_path = config.database_path()?;
    let history = SqliteHistory::open(&db_path).await?;

    let transport = ModemManagerTransport::system()
        .await
        .context("failed to connect to the system bus")?;
    if !transport.service_present().await {
        warn!("ModemManager is not running; waiting for it to appear");
    }
    let (event_tx, event_rx) = mpsc::channel(config.account.event_buffer.max(1));
    let _watcher = transport.spawn_watcher(event_tx);

    let contacts = StaticContacts::new(&config.contacts, config.account.country.as_deref());
    let deps = AccountDeps {
        transport: Arc::new(transport),
        history: Arc::new(history),
        notifier: Arc::new(LogNotifier),
        contacts: Arc::new(contacts),
        mms: Arc::new(DisabledMms),
    };
    let (handle, task) = Account::spawn(config, deps, event_rx, None);
    handle
        .contacts_ready()
        .await
        .context("account stopped during startup")?;
    Ok((handle, task))
}
