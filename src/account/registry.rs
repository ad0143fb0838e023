//! Device registry: the set of modems that can carry messages.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::modem::{DeviceInfo, DevicePath, ModemState};
use crate::phone;

use super::AccountStatus;

/// One modem's messaging endpoint.
#[derive(Debug, Clone)]
pub struct Device {
    /// Modem object path.
    pub path: DevicePath,
    /// Last reported modem state.
    pub state: ModemState,
    /// Subscriber numbers reported by the modem.
    pub own_numbers: Vec<String>,
    /// Region derived from the SIM, if any.
    pub country: Option<&'static str>,
}

/// Tracks attached devices and derives aggregate connectivity.
///
/// Keyed by path in a sorted map so device selection is deterministic.
#[derive(Debug, Default)]
pub struct Registry {
    devices: BTreeMap<DevicePath, Device>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly discovered modem.
    ///
    /// Returns `false` (and tracks nothing) if the modem lacks the messaging
    /// interface or is already known.
    pub fn add(&mut self, info: DeviceInfo) -> bool {
        if !info.messaging {
            debug!(device = %info.path, "ignoring modem without messaging");
            return false;
        }
        if self.devices.contains_key(&info.path) {
            return false;
        }
        let country = info.imsi.as_deref().and_then(phone::country_from_imsi);
        info!(device = %info.path, state = ?info.state, country, "modem added");
        self.devices.insert(
            info.path.clone(),
            Device {
                path: info.path,
                state: info.state,
                own_numbers: info.own_numbers,
                country,
            },
        );
        true
    }

    /// Drop a device. Returns it if it was tracked.
    pub fn remove(&mut self, path: &DevicePath) -> Option<Device> {
        let device = self.devices.remove(path)?;
        info!(device = %path, "modem removed");
        Some(device)
    }

    /// Drop every device (the management service went away).
    pub fn clear(&mut self) -> Vec<DevicePath> {
        let paths: Vec<DevicePath> = self.devices.keys().cloned().collect();
        self.devices.clear();
        paths
    }

    /// Record a modem state change. Returns `false` for unknown devices.
    pub fn set_state(&mut self, path: &DevicePath, state: ModemState) -> bool {
        match self.devices.get_mut(path) {
            Some(d) => {
                debug!(device = %path, from = ?d.state, to = ?state, "modem state changed");
                d.state = state;
                true
            }
            None => false,
        }
    }

    /// Whether a device is tracked.
    pub fn contains(&self, path: &DevicePath) -> bool {
        self.devices.contains_key(path)
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is tracked.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// First device able to send right now.
    pub fn pick(&self) -> Option<&DevicePath> {
        self.devices
            .values()
            .find(|d| d.state.is_usable())
            .map(|d| &d.path)
    }

    /// Own numbers across all devices.
    pub fn own_numbers(&self) -> Vec<String> {
        self.devices
            .values()
            .flat_map(|d| d.own_numbers.iter().cloned())
            .collect()
    }

    /// Region of the first device whose SIM revealed one.
    pub fn sim_country(&self) -> Option<&'static str> {
        self.devices.values().find_map(|d| d.country)
    }

    /// Aggregate connectivity.
    pub fn status(&self) -> AccountStatus {
        if self.devices.is_empty() {
            AccountStatus::Disconnected
        } else if self.devices.values().any(|d| d.state.is_usable()) {
            AccountStatus::Connected
        } else {
            AccountStatus::Unknown
        }
    }
}
