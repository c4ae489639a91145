//! Plugin Instance Router
//!
//! Owns the mapping from (connection, plugin id) to a running plugin
//! instance. Each pair walks a small state machine:
//!
//! ```text
//! ABSENT → ACTIVE → DESTROYED
//! ```
//!
//! Creating an instance for an already-ACTIVE pair is a programming error
//! and is rejected, never silently duplicated. DESTROYED is terminal for
//! the pair; the same plugin on a new connection object is an independent
//! state machine. Destruction is idempotent.
//!
//! Plugin code is untrusted at the seam: handlers return results, and a
//! failing handler is logged and isolated so one broken plugin cannot block
//! delivery to others.

use crate::catalog::PluginDefinition;
use log::{debug, warn};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Error returned by a plugin event handler.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("{0}")]
pub struct PluginHandlerError(pub String);

/// Event handler supplied by a plugin module. Receives the instance's
/// mutable state container and the event payload.
pub type EventHandler =
    Arc<dyn Fn(&mut JsonValue, &JsonValue) -> Result<(), PluginHandlerError> + Send + Sync>;

/// A plugin's runtime contract: the definition plus a state initializer and
/// an event-handler map. The router calls these synchronously and does not
/// assume they are pure.
#[derive(Clone)]
pub struct PluginModule {
    pub definition: PluginDefinition,
    init_state: Arc<dyn Fn() -> JsonValue + Send + Sync>,
    handlers: HashMap<String, EventHandler>,
}

impl fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginModule")
            .field("definition", &self.definition)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginModule {
    pub fn new(definition: PluginDefinition) -> Self {
        Self {
            definition,
            init_state: Arc::new(|| JsonValue::Null),
            handlers: HashMap::new(),
        }
    }

    /// Set the state-initialization function run on instance creation.
    pub fn with_state<F>(mut self, init: F) -> Self
    where
        F: Fn() -> JsonValue + Send + Sync + 'static,
    {
        self.init_state = Arc::new(init);
        self
    }

    /// Register a handler for an event method.
    pub fn on<F>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(&mut JsonValue, &JsonValue) -> Result<(), PluginHandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(method.to_string(), Arc::new(handler));
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.definition.id
    }
}

/// Lifecycle state of a (connection, plugin) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Absent,
    Active,
    Destroyed,
}

/// A running plugin instance bound to exactly one (connection, plugin) pair.
#[derive(Debug)]
pub struct PluginInstance {
    pub connection_id: String,
    module: Arc<PluginModule>,
    state: JsonValue,
    destroyed: bool,
}

impl PluginInstance {
    fn new(connection_id: &str, module: Arc<PluginModule>) -> Self {
        let state = (module.init_state)();
        Self {
            connection_id: connection_id.to_string(),
            module,
            state,
            destroyed: false,
        }
    }

    pub fn plugin_id(&self) -> &str {
        self.module.plugin_id()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Read-only view of the state container.
    pub fn state(&self) -> &JsonValue {
        &self.state
    }

    /// Serialize the state container. Only legal while the instance is
    /// active; the persistence boundary guarantees it is never called on a
    /// destroyed instance.
    pub fn export_state(&self) -> Result<JsonValue, RouterError> {
        if self.destroyed {
            return Err(RouterError::InstanceDestroyed {
                connection_id: self.connection_id.clone(),
                plugin_id: self.plugin_id().to_string(),
            });
        }
        Ok(self.state.clone())
    }

    /// Replace the state container with previously exported state.
    pub fn import_state(&mut self, state: JsonValue) -> Result<(), RouterError> {
        if self.destroyed {
            return Err(RouterError::InstanceDestroyed {
                connection_id: self.connection_id.clone(),
                plugin_id: self.plugin_id().to_string(),
            });
        }
        self.state = state;
        Ok(())
    }
}

/// Router errors. `UnknownRoute` and handler failures are non-fatal and are
/// dropped with a log line by the caller; `DuplicateInstance` signals a
/// programming error without crashing the router.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RouterError {
    #[error("instance for plugin '{plugin_id}' on connection {connection_id} already exists")]
    DuplicateInstance {
        connection_id: String,
        plugin_id: String,
    },

    #[error("instance for plugin '{plugin_id}' on connection {connection_id} was destroyed")]
    InstanceDestroyed {
        connection_id: String,
        plugin_id: String,
    },

    #[error("no active instance for plugin '{plugin_id}' on connection {connection_id}")]
    UnknownRoute {
        connection_id: String,
        plugin_id: String,
    },
}

/// Outcome of dispatching an inbound event envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// The handler ran and succeeded.
    Delivered,
    /// No ACTIVE instance for the pair; the event was dropped.
    NoInstance,
    /// The instance has no handler for the method; the event was dropped.
    NoHandler,
    /// The handler failed; the failure was logged and isolated.
    HandlerFailed(PluginHandlerError),
}

/// Routing table of live plugin instances.
#[derive(Debug, Default)]
pub struct PluginRouter {
    instances: HashMap<(String, String), PluginInstance>,
    /// Pairs that reached DESTROYED. Terminal per pair: re-creation is
    /// rejected until the peer reconnects under a new connection object.
    destroyed: HashSet<(String, String)>,
}

impl PluginRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// ABSENT → ACTIVE. Creates exactly one instance for the pair.
    pub fn create_instance(
        &mut self,
        connection_id: &str,
        module: Arc<PluginModule>,
    ) -> Result<&PluginInstance, RouterError> {
        let key = (connection_id.to_string(), module.plugin_id().to_string());
        if self.destroyed.contains(&key) {
            return Err(RouterError::InstanceDestroyed {
                connection_id: key.0,
                plugin_id: key.1,
            });
        }
        if self.instances.contains_key(&key) {
            return Err(RouterError::DuplicateInstance {
                connection_id: key.0,
                plugin_id: key.1,
            });
        }
        let instance = PluginInstance::new(connection_id, module);
        Ok(self.instances.entry(key).or_insert(instance))
    }

    /// ACTIVE → DESTROYED. Idempotent: destroying an absent or already
    /// destroyed pair is a no-op returning false.
    pub fn destroy_instance(&mut self, connection_id: &str, plugin_id: &str) -> bool {
        let key = (connection_id.to_string(), plugin_id.to_string());
        match self.instances.remove(&key) {
            Some(mut instance) => {
                instance.destroyed = true;
                instance.state = JsonValue::Null;
                self.destroyed.insert(key);
                true
            }
            None => false,
        }
    }

    /// Destroy every instance owned by a connection. Returns the destroyed
    /// plugin ids. Also forgets the connection's terminal-pair markers since
    /// the connection object will never dispatch again.
    pub fn destroy_connection(&mut self, connection_id: &str) -> Vec<String> {
        let plugin_ids: Vec<String> = self
            .instances
            .keys()
            .filter(|(conn, _)| conn == connection_id)
            .map(|(_, plugin)| plugin.clone())
            .collect();
        for plugin_id in &plugin_ids {
            self.destroy_instance(connection_id, plugin_id);
        }
        self.destroyed.retain(|(conn, _)| conn != connection_id);
        plugin_ids
    }

    /// Destroy every instance of a plugin across all connections, as on
    /// uninstall. Returns the affected connection ids.
    pub fn destroy_plugin(&mut self, plugin_id: &str) -> Vec<String> {
        let connection_ids: Vec<String> = self
            .instances
            .keys()
            .filter(|(_, plugin)| plugin == plugin_id)
            .map(|(conn, _)| conn.clone())
            .collect();
        for connection_id in &connection_ids {
            self.destroy_instance(connection_id, plugin_id);
        }
        connection_ids
    }

    pub fn instance(&self, connection_id: &str, plugin_id: &str) -> Option<&PluginInstance> {
        self.instances
            .get(&(connection_id.to_string(), plugin_id.to_string()))
    }

    pub fn instance_mut(
        &mut self,
        connection_id: &str,
        plugin_id: &str,
    ) -> Option<&mut PluginInstance> {
        self.instances
            .get_mut(&(connection_id.to_string(), plugin_id.to_string()))
    }

    /// Lifecycle state of a pair.
    pub fn lifecycle(&self, connection_id: &str, plugin_id: &str) -> Lifecycle {
        let key = (connection_id.to_string(), plugin_id.to_string());
        if self.instances.contains_key(&key) {
            Lifecycle::Active
        } else if self.destroyed.contains(&key) {
            Lifecycle::Destroyed
        } else {
            Lifecycle::Absent
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Deliver an inbound event to the ACTIVE instance for the pair.
    ///
    /// Never raises to the transport layer: missing routes and handler
    /// failures are logged and reported in the outcome.
    pub fn dispatch_event(
        &mut self,
        connection_id: &str,
        plugin_id: &str,
        method: &str,
        payload: &JsonValue,
    ) -> Dispatch {
        let instance = match self.instance_mut(connection_id, plugin_id) {
            Some(instance) => instance,
            None => {
                debug!(
                    "dropping event '{}' for plugin '{}': no active instance on connection {}",
                    method, plugin_id, connection_id
                );
                return Dispatch::NoInstance;
            }
        };
        let handler = match instance.module.handlers.get(method) {
            Some(handler) => handler.clone(),
            None => {
                debug!(
                    "dropping event '{}': plugin '{}' has no handler for it",
                    method, plugin_id
                );
                return Dispatch::NoHandler;
            }
        };
        match handler(&mut instance.state, payload) {
            Ok(()) => Dispatch::Delivered,
            Err(failure) => {
                warn!(
                    "handler '{}' of plugin '{}' failed: {}",
                    method, plugin_id, failure
                );
                Dispatch::HandlerFailed(failure)
            }
        }
    }
}
