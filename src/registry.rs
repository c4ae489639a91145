//! Connection Registry
//!
//! Tracks live device and client connections and resolves the "best"
//! device/client for the user's current selection. Connections churn
//! independently of user intent: a device can reconnect under a new
//! connection object with the same identity key, and the selection must
//! re-attach to the new object transparently. The resolvers here encode
//! that precedence.
//!
//! The registry is mutated only by the gateway in response to discrete
//! events (connect, disconnect, plugin-set change); everything else reads
//! snapshots.

use crate::connection::{ClientQuery, Connection, DeviceInfo};
use log::debug;
use std::collections::HashMap;

/// Pick the best device to select.
///
/// Precedence: the device owning `explicit_client` if given, else the
/// currently selected device if still known, else the device whose title
/// matches the user's preferred device, else the fallback, else the first
/// known device.
pub fn find_best_device<'a>(
    explicit_client: Option<&ClientQuery>,
    known_devices: &'a [DeviceInfo],
    currently_selected: Option<&DeviceInfo>,
    fallback: Option<&'a DeviceInfo>,
    preferred_title: Option<&str>,
) -> Option<&'a DeviceInfo> {
    if let Some(client) = explicit_client {
        if let Some(device) = known_devices
            .iter()
            .find(|d| d.serial == client.device_serial)
        {
            return Some(device);
        }
    }
    if let Some(selected) = currently_selected {
        // Match by identity key, not object: after a reconnect the selection
        // must re-attach to the new device record.
        if let Some(device) = known_devices
            .iter()
            .find(|d| d.device_key() == selected.device_key())
        {
            return Some(device);
        }
        debug!("selected device {} is gone, falling back", selected.title);
    }
    if let Some(title) = preferred_title {
        if let Some(device) = known_devices.iter().find(|d| d.title == title) {
            return Some(device);
        }
    }
    fallback.or_else(|| known_devices.first())
}

/// Pick the best client to select: the current selection if still connected,
/// else the user's preferred client if connected, else none.
pub fn find_best_client<'a>(
    known_clients: &'a [&'a Connection],
    currently_selected_id: Option<&str>,
    preferred_id: Option<&str>,
) -> Option<&'a Connection> {
    let live_by_id = |id: &str| {
        known_clients
            .iter()
            .find(|c| c.client_id() == id && c.is_connected())
            .copied()
    };
    currently_selected_id
        .and_then(live_by_id)
        .or_else(|| preferred_id.and_then(live_by_id))
}

/// Live device and client connection tables.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Devices keyed by identity key (serial + os).
    devices: HashMap<String, DeviceInfo>,
    /// Client connections keyed by connection id. Identity keys can recur
    /// across reconnects; connection ids cannot.
    clients: HashMap<String, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a device, replacing any previous record with the same key.
    pub fn register_device(&mut self, device: DeviceInfo) {
        self.devices.insert(device.device_key(), device);
    }

    pub fn device_by_serial(&self, serial: &str) -> Option<&DeviceInfo> {
        self.devices.values().find(|d| d.serial == serial)
    }

    /// Snapshot of known devices, ordered by identity key for determinism.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.device_key().cmp(&b.device_key()));
        devices
    }

    /// Record a new client connection, returning its connection id.
    pub fn register_client(&mut self, connection: Connection) -> String {
        let id = connection.connection_id.clone();
        self.clients.insert(id.clone(), connection);
        id
    }

    pub fn client(&self, connection_id: &str) -> Option<&Connection> {
        self.clients.get(connection_id)
    }

    pub fn client_mut(&mut self, connection_id: &str) -> Option<&mut Connection> {
        self.clients.get_mut(connection_id)
    }

    /// Live connections in no particular order.
    pub fn clients(&self) -> Vec<&Connection> {
        self.clients.values().collect()
    }

    /// Mark the connection disconnected, failing its pending requests.
    ///
    /// The record itself stays until [`ConnectionRegistry::release_client`]
    /// is called, which must happen only after the connection's plugin
    /// instances are destroyed.
    pub fn disconnect_client(&mut self, connection_id: &str) -> bool {
        match self.clients.get_mut(connection_id) {
            Some(connection) => {
                connection.disconnect();
                true
            }
            None => false,
        }
    }

    /// Drop the connection record entirely, releasing its resources.
    pub fn release_client(&mut self, connection_id: &str) -> bool {
        self.clients.remove(connection_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> Vec<DeviceInfo> {
        vec![
            DeviceInfo::new("serial-a", "Pixel 7", "Android"),
            DeviceInfo::new("serial-b", "iPhone 15", "iOS"),
            DeviceInfo::new("serial-c", "Galaxy S24", "Android"),
        ]
    }

    #[test]
    fn test_best_device_prefers_explicit_client() {
        let known = devices();
        let client = ClientQuery::new("App", "iOS", "serial-b", 4);
        let selected = known[0].clone();
        let best = find_best_device(
            Some(&client),
            &known,
            Some(&selected),
            Some(&known[2]),
            Some("Galaxy S24"),
        );
        assert_eq!(best.unwrap().serial, "serial-b");
    }

    #[test]
    fn test_best_device_prefers_current_selection() {
        let known = devices();
        let selected = known[1].clone();
        let best = find_best_device(None, &known, Some(&selected), Some(&known[2]), Some("Pixel 7"));
        assert_eq!(best.unwrap().serial, "serial-b");
    }

    #[test]
    fn test_best_device_reattaches_selection_after_reconnect() {
        let known = devices();
        // Same identity, different record object.
        let stale = DeviceInfo {
            connected: false,
            ..known[1].clone()
        };
        let best = find_best_device(None, &known, Some(&stale), None, None);
        assert!(best.unwrap().connected);
        assert_eq!(best.unwrap().serial, "serial-b");
    }

    #[test]
    fn test_best_device_prefers_title_match() {
        let known = devices();
        let gone = DeviceInfo::new("serial-x", "Gone", "Android");
        let best = find_best_device(None, &known, Some(&gone), Some(&known[0]), Some("Galaxy S24"));
        assert_eq!(best.unwrap().serial, "serial-c");
    }

    #[test]
    fn test_best_device_falls_back() {
        let known = devices();
        let best = find_best_device(None, &known, None, Some(&known[2]), None);
        assert_eq!(best.unwrap().serial, "serial-c");
    }

    #[test]
    fn test_best_device_first_available() {
        let known = devices();
        let best = find_best_device(None, &known, None, None, None);
        assert_eq!(best.unwrap().serial, "serial-a");
        assert!(find_best_device(None, &[], None, None, None).is_none());
    }

    #[test]
    fn test_best_client_precedence() {
        let current = Connection::new(ClientQuery::new("A", "Android", "s1", 4), vec![]);
        let preferred = Connection::new(ClientQuery::new("B", "Android", "s1", 4), vec![]);
        let current_id = current.client_id();
        let preferred_id = preferred.client_id();
        let known = [&current, &preferred];

        let best = find_best_client(&known, Some(&current_id), Some(&preferred_id));
        assert_eq!(best.unwrap().client_id(), current_id);

        let best = find_best_client(&known, Some("gone#Android#s9#sdk1"), Some(&preferred_id));
        assert_eq!(best.unwrap().client_id(), preferred_id);

        assert!(find_best_client(&known, None, None).is_none());
    }

    #[test]
    fn test_best_client_skips_disconnected() {
        let mut current = Connection::new(ClientQuery::new("A", "Android", "s1", 4), vec![]);
        let current_id = current.client_id();
        current.disconnect();
        let known = [&current];
        assert!(find_best_client(&known, Some(&current_id), None).is_none());
    }

    #[test]
    fn test_registry_lifecycle() {
        let mut registry = ConnectionRegistry::new();
        registry.register_device(DeviceInfo::new("s1", "Pixel", "Android"));
        assert!(registry.device_by_serial("s1").is_some());

        let connection = Connection::new(ClientQuery::new("App", "Android", "s1", 4), vec![]);
        let id = registry.register_client(connection);
        assert!(registry.client(&id).unwrap().is_connected());

        assert!(registry.disconnect_client(&id));
        assert!(!registry.client(&id).unwrap().is_connected());

        assert!(registry.release_client(&id));
        assert!(registry.client(&id).is_none());
        assert!(!registry.release_client(&id));
    }
}
