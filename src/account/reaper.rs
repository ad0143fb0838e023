//! Stuck-message reaper.
//!
//! Multipart inbound messages sit in the modem queue in the `Receiving`
//! state until every part arrives. The queue is small; a message whose
//! parts never arrive blocks later ones. Each such entry gets a timer, and
//! when it fires the entry is deleted.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::AbortHandle;

use crate::config::ReaperConfig;
use crate::modem::{DevicePath, SmsPath};

/// How long to wait before deleting an incomplete entry.
///
/// With a timestamp the entry may live until `timestamp + long_timeout`.
/// If that moment has passed the entry goes after the minimal delay. When
/// the timestamp lies further in the future than the skew tolerance, the
/// local clock cannot be trusted and the short window applies, as it does
/// when there is no timestamp at all.
pub fn stuck_deadline(
    timestamp: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &ReaperConfig,
) -> Duration {
    let Some(ts) = timestamp else {
        return config.short_timeout();
    };
    if ts.signed_duration_since(now) > to_delta(config.clock_skew_tolerance()) {
        return config.short_timeout();
    }
    let Some(deadline) = ts.checked_add_signed(to_delta(config.long_timeout())) else {
        return config.short_timeout();
    };
    match deadline.signed_duration_since(now).to_std() {
        Ok(remaining) if !remaining.is_zero() => remaining,
        _ => config.minimal_timeout(),
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[derive(Debug)]
struct StuckEntry {
    device: DevicePath,
    timer: AbortHandle,
}

/// Incomplete entries and their deletion timers.
#[derive(Debug, Default)]
pub struct Reaper {
    entries: HashMap<SmsPath, StuckEntry>,
}

impl Reaper {
    /// Create an empty reaper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching an entry. A previous timer for the same entry is
    /// cancelled.
    pub fn watch(&mut self, sms: SmsPath, device: DevicePath, timer: AbortHandle) {
        if let Some(old) = self.entries.insert(sms, StuckEntry { device, timer }) {
            old.timer.abort();
        }
    }

    /// Whether an entry is being watched.
    pub fn contains(&self, sms: &SmsPath) -> bool {
        self.entries.contains_key(sms)
    }

    /// The entry completed on its own: cancel its timer.
    pub fn complete(&mut self, sms: &SmsPath) -> Option<DevicePath> {
        let entry = self.entries.remove(sms)?;
        entry.timer.abort();
        Some(entry.device)
    }

    /// The entry's timer fired: forget it and return the device to delete
    /// it from. `None` if it completed or its device went away meanwhile.
    pub fn expire(&mut self, sms: &SmsPath) -> Option<DevicePath> {
        self.entries.remove(sms).map(|e| e.device)
    }

    /// Cancel every timer tied to a device.
    pub fn evict_device(&mut self, device: &DevicePath) -> Vec<SmsPath> {
        let doomed: Vec<SmsPath> = self
            .entries
            .iter()
            .filter(|(_, e)| &e.device == device)
            .map(|(sms, _)| sms.clone())
            .collect();
        for sms in &doomed {
            if let Some(entry) = self.entries.remove(sms) {
                entry.timer.abort();
            }
        }
        doomed
    }

    /// Cancel everything.
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
        }
    }

    /// Watched entries, sorted.
    pub fn paths(&self) -> Vec<SmsPath> {
        let mut paths: Vec<SmsPath> = self.entries.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of watched entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
