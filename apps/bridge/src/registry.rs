use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;

/// Liveness of one bulb as seen from the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Seen over HTTP or UDP but no command has round-tripped yet.
    Pending,
    /// At least one command round-tripped.
    Active,
    /// No contact within the liveness window. Computed at read time;
    /// stale records are never deleted automatically because rediscovery
    /// is expensive; eviction is a manual operation.
    Stale,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub address: Option<IpAddr>,
    /// Bridge-issued token handed back on registration. Absent for
    /// placeholder records that have only been heard over UDP.
    pub session_id: Option<String>,
    pub user_id: String,
    pub product_code: String,
    pub type_code: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: DeviceStatus,
}

impl DeviceRecord {
    fn new(device_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            address: None,
            session_id: None,
            user_id: String::new(),
            product_code: "wifielement".to_string(),
            type_code: "W31-N11".to_string(),
            registered_at: now,
            last_seen_at: now,
            status: DeviceStatus::Pending,
        }
    }
}

/// Fields a registration call may carry. `None` leaves the stored value
/// untouched; present fields win last-writer-wins.
#[derive(Debug, Default)]
pub struct RegistrationFields {
    pub address: Option<IpAddr>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub product_code: Option<String>,
    pub type_code: Option<String>,
}

/// In-memory table of every bulb the bridge has heard from, keyed by the
/// vendor device id. The sole shared mutable state in the process: HTTP
/// handlers and the UDP listener mutate it concurrently, so all updates go
/// through the per-key map entry.
pub struct Registry {
    devices: DashMap<String, DeviceRecord>,
    stale_after: Duration,
}

impl Registry {
    pub fn new(stale_after: std::time::Duration) -> Self {
        Self {
            devices: DashMap::new(),
            stale_after: Duration::from_std(stale_after).unwrap_or_else(|_| Duration::seconds(300)),
        }
    }

    /// Creates or merges the record for `device_id`. Concurrent upserts on
    /// one id serialize on the map entry and can never produce duplicates.
    pub fn upsert(&self, device_id: &str, fields: RegistrationFields) -> DeviceRecord {
        let now = Utc::now();

        // A device that first showed up over UDP lives under a placeholder
        // id. When it later registers over HTTP from the same address, fold
        // the placeholder in so it does not linger as a ghost entry.
        let mut first_seen = None;
        if let Some(addr) = fields.address {
            if let Some(ghost) = self.take_placeholder(device_id, addr) {
                first_seen = Some(ghost.registered_at);
            }
        }

        let mut entry = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord::new(device_id, now));
        if let Some(registered_at) = first_seen {
            entry.registered_at = entry.registered_at.min(registered_at);
        }
        if let Some(addr) = fields.address {
            entry.address = Some(addr);
        }
        if fields.session_id.is_some() {
            entry.session_id = fields.session_id;
        }
        if let Some(user_id) = fields.user_id {
            entry.user_id = user_id;
        }
        if let Some(product_code) = fields.product_code {
            entry.product_code = product_code;
        }
        if let Some(type_code) = fields.type_code {
            entry.type_code = type_code;
        }
        entry.last_seen_at = now;
        self.resolve(entry.clone())
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices
            .get(device_id)
            .map(|record| self.resolve(record.clone()))
    }

    /// The record owning `address`. DHCP churn means several records can
    /// carry the same address over time; the most recently touched one is
    /// the live one.
    pub fn find_by_address(&self, address: IpAddr) -> Option<DeviceRecord> {
        self.devices
            .iter()
            .filter(|record| record.address == Some(address))
            .max_by_key(|record| record.last_seen_at)
            .map(|record| self.resolve(record.clone()))
    }

    /// Bumps `last_seen_at` and promotes Pending to Active on the first
    /// successful command round-trip.
    pub fn touch(&self, device_id: &str) {
        if let Some(mut record) = self.devices.get_mut(device_id) {
            record.last_seen_at = Utc::now();
            if record.status == DeviceStatus::Pending {
                record.status = DeviceStatus::Active;
            }
        }
    }

    /// The UDP-listener path: inbound datagrams arrive keyed by address,
    /// not device id. Unknown addresses get a placeholder record so bulbs
    /// that never finished HTTP registration still show up for probing.
    pub fn touch_address(&self, address: IpAddr) -> DeviceRecord {
        if let Some(record) = self.find_by_address(address) {
            self.touch(&record.device_id);
            return self.get(&record.device_id).unwrap_or(record);
        }
        let device_id = placeholder_id(address);
        let now = Utc::now();
        let entry = self
            .devices
            .entry(device_id.clone())
            .or_insert_with(|| {
                let mut record = DeviceRecord::new(&device_id, now);
                record.address = Some(address);
                record
            })
            .clone();
        entry
    }

    /// Stable snapshot for diagnostics; order is not meaningful.
    pub fn list(&self) -> Vec<DeviceRecord> {
        self.devices
            .iter()
            .map(|record| self.resolve(record.clone()))
            .collect()
    }

    /// Manual eviction; the registry never expires records on its own.
    pub fn evict(&self, device_id: &str) -> bool {
        self.devices.remove(device_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn resolve(&self, mut record: DeviceRecord) -> DeviceRecord {
        if Utc::now() - record.last_seen_at > self.stale_after {
            record.status = DeviceStatus::Stale;
        }
        record
    }

    fn take_placeholder(&self, device_id: &str, address: IpAddr) -> Option<DeviceRecord> {
        let ghost_id = placeholder_id(address);
        if ghost_id == device_id {
            return None;
        }
        // Only fold records that are actually placeholders for this address.
        let matches = self
            .devices
            .get(&ghost_id)
            .map(|record| record.address == Some(address))
            .unwrap_or(false);
        if matches {
            self.devices.remove(&ghost_id).map(|(_, record)| record)
        } else {
            None
        }
    }
}

fn placeholder_id(address: IpAddr) -> String {
    format!("udp-{address}")
}
