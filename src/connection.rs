//! Connection data model
//!
//! A [`Connection`] represents one live peer: an application client running
//! on a device. Devices themselves are tracked as [`DeviceInfo`] records.
//! Identity keys are derived from the peer's attributes so that a peer
//! reconnecting under a new transport connection maps back to the same
//! logical identity, while the connection object itself stays distinct.
//!
//! Each connection owns a pending-request table mapping correlation ids to
//! oneshot senders. Correlation ids come from a monotonically increasing
//! counter that is never reused within the connection's lifetime.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

/// A physical or virtual host running the inspected application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device serial number.
    pub serial: String,
    /// Human-readable device title.
    pub title: String,
    /// Operating system name.
    pub os: String,
    /// Whether the device is currently connected.
    pub connected: bool,
}

impl DeviceInfo {
    pub fn new(serial: &str, title: &str, os: &str) -> Self {
        Self {
            serial: serial.to_string(),
            title: title.to_string(),
            os: os.to_string(),
            connected: true,
        }
    }

    /// Stable identity key: serial plus OS.
    pub fn device_key(&self) -> String {
        format!("{}#{}", self.serial, self.os)
    }
}

/// Attributes a client announces during its handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientQuery {
    /// Application name.
    pub app: String,
    /// Operating system of the hosting device.
    pub os: String,
    /// Serial of the hosting device.
    pub device_serial: String,
    /// SDK version the client was built against.
    pub sdk_version: u32,
}

impl ClientQuery {
    pub fn new(app: &str, os: &str, device_serial: &str, sdk_version: u32) -> Self {
        Self {
            app: app.to_string(),
            os: os.to_string(),
            device_serial: device_serial.to_string(),
            sdk_version,
        }
    }

    /// Stable identity key for the client, shared across reconnects.
    pub fn client_id(&self) -> String {
        format!(
            "{}#{}#{}#sdk{}",
            self.app, self.os, self.device_serial, self.sdk_version
        )
    }
}

/// Errors surfaced to callers awaiting a correlated response.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RequestError {
    #[error("connection disconnected before the response arrived")]
    Disconnected,

    #[error("peer returned an error: {0}")]
    Peer(JsonValue),
}

/// Handle on which a caller awaits the correlated response to a request.
pub type ResponseReceiver = oneshot::Receiver<Result<JsonValue, RequestError>>;
type ResponseSender = oneshot::Sender<Result<JsonValue, RequestError>>;

/// One live peer connection.
///
/// Created on handshake. On transport close the liveness flag flips and all
/// outstanding requests fail; the record is released by the registry only
/// after the connection's plugin instances have been destroyed.
#[derive(Debug)]
pub struct Connection {
    /// Unique id of this connection object. A reconnecting peer gets a new
    /// connection id while keeping the same client identity key.
    pub connection_id: String,
    /// Handshake attributes.
    pub query: ClientQuery,
    /// Plugin ids the peer advertises support for, in announcement order.
    plugins: Vec<String>,
    connected: bool,
    next_request_id: u64,
    pending: HashMap<u64, ResponseSender>,
}

impl Connection {
    pub fn new(query: ClientQuery, plugins: Vec<String>) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            query,
            plugins,
            connected: true,
            next_request_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Client identity key, stable across reconnects.
    pub fn client_id(&self) -> String {
        self.query.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Plugin ids the peer advertises support for.
    pub fn advertised_plugins(&self) -> &[String] {
        &self.plugins
    }

    /// Replace the advertised plugin set (the peer can load plugins late).
    pub fn set_advertised_plugins(&mut self, plugins: Vec<String>) {
        self.plugins = plugins;
    }

    /// Allocate a correlation id and register a pending entry for it.
    ///
    /// Returns the id to put on the wire and the receiver the caller awaits.
    /// Ids are monotonic and never reused for this connection.
    pub fn start_request(&mut self) -> (u64, ResponseReceiver) {
        self.next_request_id += 1;
        let id = self.next_request_id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Resolve the pending request with the given correlation id.
    ///
    /// Returns false when the id is unknown (already resolved, or never
    /// issued); the caller drops such responses.
    pub fn resolve_pending(&mut self, id: u64, result: Result<JsonValue, RequestError>) -> bool {
        match self.pending.remove(&id) {
            Some(tx) => {
                // The awaiting side may have been dropped; that is not an error.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Number of requests still awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Mark the connection as gone and fail every outstanding request.
    ///
    /// Each pending caller is notified exactly once with
    /// [`RequestError::Disconnected`]. Idempotent.
    pub fn disconnect(&mut self) {
        self.connected = false;
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(RequestError::Disconnected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query() -> ClientQuery {
        ClientQuery::new("Facebook", "Android", "emulator-5554", 4)
    }

    #[test]
    fn test_identity_keys() {
        assert_eq!(query().client_id(), "Facebook#Android#emulator-5554#sdk4");
        let device = DeviceInfo::new("emulator-5554", "Pixel 7", "Android");
        assert_eq!(device.device_key(), "emulator-5554#Android");
    }

    #[test]
    fn test_reconnect_gets_new_connection_id_same_client_id() {
        let a = Connection::new(query(), vec![]);
        let b = Connection::new(query(), vec![]);
        assert_ne!(a.connection_id, b.connection_id);
        assert_eq!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_correlation_ids_are_monotonic() {
        let mut conn = Connection::new(query(), vec![]);
        let (first, _rx1) = conn.start_request();
        let (second, _rx2) = conn.start_request();
        assert!(second > first);
        assert_eq!(conn.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_pending_delivers_once() {
        let mut conn = Connection::new(query(), vec![]);
        let (id, rx) = conn.start_request();
        assert!(conn.resolve_pending(id, Ok(json!({"ok": true}))));
        assert_eq!(rx.await.unwrap(), Ok(json!({"ok": true})));
        // Second resolution for the same id is reported as unknown.
        assert!(!conn.resolve_pending(id, Ok(json!(null))));
    }

    #[test]
    fn test_unknown_correlation_id_dropped() {
        let mut conn = Connection::new(query(), vec![]);
        assert!(!conn.resolve_pending(99, Ok(json!(null))));
    }

    #[tokio::test]
    async fn test_disconnect_fails_all_pending_exactly_once() {
        let mut conn = Connection::new(query(), vec![]);
        let receivers: Vec<ResponseReceiver> =
            (0..3).map(|_| conn.start_request().1).collect();
        conn.disconnect();
        assert!(!conn.is_connected());
        assert_eq!(conn.pending_len(), 0);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(RequestError::Disconnected));
        }
    }

    #[test]
    fn test_disconnect_with_no_pending_is_quiet() {
        let mut conn = Connection::new(query(), vec![]);
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.pending_len(), 0);
    }
}
