//! probehub - Connection and plugin-message routing core for a device inspector
//!
//! This library is the protocol/state-machine heart of a desktop inspector
//! tool: it accepts connections from remote device/app processes, resolves
//! which plugins are active for each connection, multiplexes JSON envelopes
//! between connections and plugin instances, reassembles chunked responses
//! and keeps plugin availability state consistent as catalogs change at
//! runtime.
//!
//! The transport (sockets), the UI and the plugin implementations are all
//! external collaborators: the core consumes `on_message`/`on_disconnect`
//! callbacks and talks back through the [`gateway::Transport`] trait.

pub mod bus;
pub mod catalog;
pub mod chunks;
pub mod connection;
pub mod envelope;
pub mod gateway;
pub mod registry;
pub mod router;
pub mod usage;


pub use bus::{MessageBus, Subscription};
pub use catalog::{ActiveSets, PluginCatalog, PluginDefinition, PluginKind, UnavailablePlugin};
pub use chunks::{ChunkAssembler, ChunkError, Ingest};
pub use connection::{ClientQuery, Connection, DeviceInfo, RequestError, ResponseReceiver};
pub use envelope::{Envelope, EnvelopeError, ResponseOutcome};
pub use gateway::{BusEvent, GatewayError, InspectorGateway, Transport, TransportError};
pub use registry::{find_best_client, find_best_device, ConnectionRegistry};
pub use router::{
    Dispatch, EventHandler, Lifecycle, PluginHandlerError, PluginInstance, PluginModule,
    PluginRouter, RouterError,
};
pub use usage::{compute_usage_summary, TimeSpent, TrackingEvent, UsageSummary, NO_PLUGIN};
