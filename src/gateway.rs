//! Inspector Gateway
//!
//! The wiring layer between the external transport and the routing core.
//! The transport delivers raw bytes per connection; the gateway decodes
//! envelopes, feeds chunked responses through the per-connection
//! reassembler, routes events to plugin instances, correlates responses
//! against pending requests and encodes outbound traffic back through the
//! [`Transport`].
//!
//! All entry points run synchronously on the caller's thread: routing is a
//! reaction to one inbound event at a time, and messages from a single
//! connection are processed in arrival order. Disconnecting a connection
//! immediately marks it non-live, fails its pending requests and destroys
//! its plugin instances; queued messages that drain afterwards are refused.

use crate::bus::MessageBus;
use crate::catalog::{ActiveSets, PluginCatalog};
use crate::chunks::{ChunkAssembler, Ingest};
use crate::connection::{ClientQuery, Connection, DeviceInfo, RequestError, ResponseReceiver};
use crate::envelope::{Envelope, ResponseOutcome};
use crate::registry::ConnectionRegistry;
use crate::router::{PluginModule, PluginRouter, RouterError};
use log::{debug, warn};
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Outbound byte channel back to a peer. Supplied by the embedding
/// application; the gateway never owns sockets.
pub trait Transport: Send + Sync {
    fn send(&self, connection_id: &str, bytes: Vec<u8>) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Events published on the gateway's bus for telemetry and UI consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    ClientConnected { connection_id: String },
    ClientDisconnected { connection_id: String },
    /// An event envelope was routed to a plugin; `bytes` is the payload size.
    BytesReceived { plugin: String, bytes: usize },
    /// The client's advertised plugin set changed.
    PluginsChanged { connection_id: String },
}

/// Gateway-level errors surfaced to embedding callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown connection {0}")]
    UnknownConnection(String),

    #[error("connection {0} is no longer live")]
    DisconnectedTarget(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// The connection and plugin-message routing core.
pub struct InspectorGateway {
    registry: ConnectionRegistry,
    catalog: PluginCatalog,
    router: PluginRouter,
    bus: MessageBus<BusEvent>,
    transport: Arc<dyn Transport>,
    /// Installed plugin runtime modules by plugin id.
    modules: HashMap<String, Arc<PluginModule>>,
    /// Per-connection chunk reassemblers, torn down with the connection.
    assemblers: HashMap<String, ChunkAssembler>,
    /// Plugin ids the user enabled, keyed by app name.
    starred: HashMap<String, HashSet<String>>,
}

impl InspectorGateway {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            catalog: PluginCatalog::new(),
            router: PluginRouter::new(),
            bus: MessageBus::new(),
            transport,
            modules: HashMap::new(),
            assemblers: HashMap::new(),
            starred: HashMap::new(),
        }
    }

    /// Install a plugin runtime module: registers its definition with the
    /// catalog and keeps the module for instance creation. Install replaces.
    pub fn install_module(&mut self, module: PluginModule) {
        let definition = module.definition.clone();
        self.modules
            .insert(definition.id.clone(), Arc::new(module));
        self.catalog.register(vec![definition]);
    }

    pub fn catalog_mut(&mut self) -> &mut PluginCatalog {
        &mut self.catalog
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn router(&self) -> &PluginRouter {
        &self.router
    }

    pub fn bus_mut(&mut self) -> &mut MessageBus<BusEvent> {
        &mut self.bus
    }

    /// Record a device connection.
    pub fn register_device(&mut self, device: DeviceInfo) {
        self.registry.register_device(device);
    }

    /// Mark plugin ids enabled or disabled for an app.
    pub fn star_plugin(&mut self, app: &str, plugin_id: &str, starred: bool) {
        let entry = self.starred.entry(app.to_string()).or_default();
        if starred {
            entry.insert(plugin_id.to_string());
        } else {
            entry.remove(plugin_id);
        }
    }

    /// Handle a peer handshake: record the connection, resolve the active
    /// plugin set and create instances for the enabled plugins.
    ///
    /// Returns the new connection id.
    pub fn connect_client(&mut self, query: ClientQuery, advertised: Vec<String>) -> String {
        let connection = Connection::new(query, advertised);
        let connection_id = self.registry.register_client(connection);
        self.assemblers
            .insert(connection_id.clone(), ChunkAssembler::new());
        self.activate_enabled_plugins(&connection_id);
        self.bus.publish(&BusEvent::ClientConnected {
            connection_id: connection_id.clone(),
        });
        connection_id
    }

    /// Resolve the plugin buckets for a connection against its device.
    pub fn active_sets(&self, connection_id: &str) -> Result<ActiveSets, GatewayError> {
        let connection = self
            .registry
            .client(connection_id)
            .ok_or_else(|| GatewayError::UnknownConnection(connection_id.to_string()))?;
        let device = self
            .registry
            .device_by_serial(&connection.query.device_serial)
            .cloned()
            .unwrap_or_else(|| {
                DeviceInfo::new(
                    &connection.query.device_serial,
                    &connection.query.device_serial,
                    &connection.query.os,
                )
            });
        let starred = self.starred_for(&connection.query.app);
        Ok(self.catalog.compute_active_sets(
            &device,
            &connection.query,
            connection.advertised_plugins(),
            &starred,
        ))
    }

    /// Inbound raw bytes from the transport for one connection.
    ///
    /// Decode and routing failures are logged and dropped; nothing here
    /// raises back to the transport layer.
    pub fn on_message(&mut self, connection_id: &str, bytes: &[u8]) {
        match self.registry.client(connection_id) {
            Some(connection) if connection.is_connected() => {}
            Some(_) => {
                debug!(
                    "refusing message for disconnected connection {}",
                    connection_id
                );
                return;
            }
            None => {
                debug!("dropping message for unknown connection {}", connection_id);
                return;
            }
        }
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!("dropping malformed envelope on {}: {}", connection_id, error);
                return;
            }
        };
        match envelope {
            Envelope::Event {
                plugin,
                method,
                payload,
            } => self.handle_event(connection_id, &plugin, &method, payload),
            Envelope::Response { id, outcome } => {
                self.handle_response(connection_id, id, outcome)
            }
            Envelope::Request { id, method, params } => {
                self.handle_peer_request(connection_id, id, &method, params)
            }
        }
    }

    /// Transport-level close for one connection.
    ///
    /// Within this call: the liveness flag flips, every pending request is
    /// failed exactly once, plugin instances are destroyed, and only then is
    /// the connection record released.
    pub fn on_disconnect(&mut self, connection_id: &str) {
        if !self.registry.disconnect_client(connection_id) {
            debug!("disconnect for unknown connection {}", connection_id);
            return;
        }
        self.router.destroy_connection(connection_id);
        self.assemblers.remove(connection_id);
        self.registry.release_client(connection_id);
        self.bus.remove_owner(connection_id);
        self.bus.publish(&BusEvent::ClientDisconnected {
            connection_id: connection_id.to_string(),
        });
    }

    /// Send a correlated request to a peer. Returns the receiver on which
    /// the caller awaits the response; the correlation entry is failed on
    /// disconnect.
    pub fn send_request(
        &mut self,
        connection_id: &str,
        method: &str,
        params: JsonValue,
    ) -> Result<ResponseReceiver, GatewayError> {
        let connection = self
            .registry
            .client_mut(connection_id)
            .ok_or_else(|| GatewayError::UnknownConnection(connection_id.to_string()))?;
        if !connection.is_connected() {
            return Err(GatewayError::DisconnectedTarget(connection_id.to_string()));
        }
        let (id, receiver) = connection.start_request();
        let bytes = Envelope::request(id, method, params).encode();
        self.transport.send(connection_id, bytes)?;
        Ok(receiver)
    }

    /// Enable or disable a plugin for a connection's app, creating or
    /// destroying the instance accordingly.
    pub fn set_plugin_enabled(
        &mut self,
        connection_id: &str,
        plugin_id: &str,
        enabled: bool,
    ) -> Result<(), GatewayError> {
        let app = self
            .registry
            .client(connection_id)
            .ok_or_else(|| GatewayError::UnknownConnection(connection_id.to_string()))?
            .query
            .app
            .clone();
        self.star_plugin(&app, plugin_id, enabled);
        if enabled {
            let module = match self.modules.get(plugin_id) {
                Some(module) => module.clone(),
                None => {
                    debug!("no module installed for plugin '{}'", plugin_id);
                    return Ok(());
                }
            };
            self.router.create_instance(connection_id, module)?;
        } else {
            self.router.destroy_instance(connection_id, plugin_id);
        }
        Ok(())
    }

    /// Uninstall a plugin: unregister the definition and destroy every
    /// instance across connections.
    pub fn uninstall_plugin(&mut self, plugin_id: &str) {
        self.catalog.unregister_by_name(&[plugin_id.to_string()]);
        self.modules.remove(plugin_id);
        self.router.destroy_plugin(plugin_id);
    }

    /// Replace a connection's advertised plugin set and re-resolve: newly
    /// enabled plugins gain instances, plugins no longer advertised lose
    /// theirs.
    pub fn update_client_plugins(
        &mut self,
        connection_id: &str,
        plugins: Vec<String>,
    ) -> Result<(), GatewayError> {
        let connection = self
            .registry
            .client_mut(connection_id)
            .ok_or_else(|| GatewayError::UnknownConnection(connection_id.to_string()))?;
        let advertised: HashSet<String> = plugins.iter().cloned().collect();
        let previous: Vec<String> = connection.advertised_plugins().to_vec();
        connection.set_advertised_plugins(plugins);

        for plugin_id in previous {
            if !advertised.contains(&plugin_id) {
                self.router.destroy_instance(connection_id, &plugin_id);
            }
        }
        self.activate_enabled_plugins(connection_id);
        self.bus.publish(&BusEvent::PluginsChanged {
            connection_id: connection_id.to_string(),
        });
        Ok(())
    }

    fn starred_for(&self, app: &str) -> HashSet<String> {
        self.starred.get(app).cloned().unwrap_or_default()
    }

    /// Create instances for every plugin the resolution activates for the
    /// connection: enabled client plugins and compatible device plugins.
    /// Pairs already active or terminally destroyed are skipped, not
    /// errors: re-resolution runs after every catalog or plugin-set change.
    fn activate_enabled_plugins(&mut self, connection_id: &str) {
        let sets = match self.active_sets(connection_id) {
            Ok(sets) => sets,
            Err(_) => return,
        };
        for plugin_id in sets.activatable_ids() {
            let module = match self.modules.get(&plugin_id) {
                Some(module) => module.clone(),
                None => continue,
            };
            match self.router.create_instance(connection_id, module) {
                Ok(_) => {}
                Err(RouterError::DuplicateInstance { .. })
                | Err(RouterError::InstanceDestroyed { .. }) => {}
                Err(error) => warn!("failed to activate plugin '{}': {}", plugin_id, error),
            }
        }
    }

    fn handle_event(
        &mut self,
        connection_id: &str,
        plugin: &str,
        method: &str,
        payload: JsonValue,
    ) {
        let bytes = payload.to_string().len();
        self.router
            .dispatch_event(connection_id, plugin, method, &payload);
        self.bus.publish(&BusEvent::BytesReceived {
            plugin: plugin.to_string(),
            bytes,
        });
    }

    fn handle_response(&mut self, connection_id: &str, id: u64, outcome: ResponseOutcome) {
        let result = match outcome {
            ResponseOutcome::Success(payload) => {
                if is_chunked(&payload) {
                    match self.ingest_chunk(connection_id, id, payload) {
                        Some(completed) => Ok(completed),
                        None => return, // pending or dropped
                    }
                } else {
                    Ok(payload)
                }
            }
            ResponseOutcome::Failure(error) => Err(RequestError::Peer(error)),
        };
        let connection = match self.registry.client_mut(connection_id) {
            Some(connection) => connection,
            None => return,
        };
        if !connection.resolve_pending(id, result) {
            debug!(
                "dropping response with unknown correlation id {} on {}",
                id, connection_id
            );
        }
    }

    /// Feed a partial response through the connection's reassembler.
    /// Chunks without an explicit response id inherit the correlation id.
    fn ingest_chunk(
        &mut self,
        connection_id: &str,
        correlation_id: u64,
        mut payload: JsonValue,
    ) -> Option<JsonValue> {
        if payload.get("id").is_none() {
            payload["id"] = json!(correlation_id.to_string());
        }
        let assembler = self.assemblers.get_mut(connection_id)?;
        match assembler.ingest(payload) {
            Ok(Ingest::Complete(completed)) => Some(completed),
            Ok(Ingest::Pending) => None,
            Err(error) => {
                warn!("dropping bad chunk on {}: {}", connection_id, error);
                None
            }
        }
    }

    /// Requests initiated by the peer. The desktop side answers a small
    /// fixed set of methods; anything else gets an error response.
    fn handle_peer_request(
        &mut self,
        connection_id: &str,
        id: u64,
        method: &str,
        _params: JsonValue,
    ) {
        let reply = match method {
            "getPlugins" => Envelope::success(id, json!({"plugins": self.catalog.installed_ids()})),
            other => Envelope::failure(id, json!({"message": format!("Unknown method: {}", other)})),
        };
        if let Err(error) = self.transport.send(connection_id, reply.encode()) {
            warn!("failed to answer peer request on {}: {}", connection_id, error);
        }
    }
}

/// A success payload carrying both `index` and `totalChunks` is a partial
/// response fragment.
fn is_chunked(payload: &JsonValue) -> bool {
    payload.get("index").is_some() && payload.get("totalChunks").is_some()
}
