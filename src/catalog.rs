//! Plugin Catalog
//!
//! Tracks every known plugin definition (installed, gatekept, bundled,
//! downloadable) and resolves, for a device/client pair, which plugins are
//! active, disabled or unavailable and why. The catalog is a process-wide
//! singleton mutated only in response to discrete events (install,
//! uninstall, marketplace refresh); consumers read resolved snapshots.
//!
//! Resolution places every plugin id in at most one of five buckets; the
//! precedence order in [`PluginCatalog::compute_active_sets`] doubles as the
//! tie-breaking order.

use crate::connection::{ClientQuery, DeviceInfo};
use log::error;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Compatibility predicate over devices.
pub type DevicePredicate = Arc<dyn Fn(&DeviceInfo) -> bool + Send + Sync>;
/// Compatibility predicate over client handshake attributes.
pub type ClientPredicate = Arc<dyn Fn(&ClientQuery) -> bool + Send + Sync>;

/// Whether a plugin runs against a device or a client application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Device-scoped plugin (logs, screenshots).
    Device,
    /// Client-scoped plugin (talks to an application process).
    Client,
}

/// Immutable plugin descriptor. Identity is the id; installing a new version
/// replaces the old one, multiple versions are never held simultaneously.
#[derive(Clone, Serialize)]
pub struct PluginDefinition {
    pub id: String,
    pub title: String,
    pub version: String,
    pub icon: Option<String>,
    pub kind: PluginKind,
    /// Entitlement gate restricting visibility, if any.
    pub gatekeeper: Option<String>,
    /// Bundled plugins ship with the application and need no download.
    pub bundled: bool,
    #[serde(skip)]
    device_compat: Option<DevicePredicate>,
    #[serde(skip)]
    client_compat: Option<ClientPredicate>,
}

impl fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("version", &self.version)
            .field("kind", &self.kind)
            .field("gatekeeper", &self.gatekeeper)
            .field("bundled", &self.bundled)
            .finish()
    }
}

impl PluginDefinition {
    /// Create a client plugin descriptor.
    pub fn client(id: &str, title: &str) -> Self {
        Self::new(id, title, PluginKind::Client)
    }

    /// Create a device plugin descriptor.
    pub fn device(id: &str, title: &str) -> Self {
        Self::new(id, title, PluginKind::Device)
    }

    fn new(id: &str, title: &str, kind: PluginKind) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            version: "0.0.0".to_string(),
            icon: None,
            kind,
            gatekeeper: None,
            bundled: false,
            device_compat: None,
            client_compat: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_icon(mut self, icon: &str) -> Self {
        self.icon = Some(icon.to_string());
        self
    }

    pub fn with_gatekeeper(mut self, name: &str) -> Self {
        self.gatekeeper = Some(name.to_string());
        self
    }

    pub fn bundled(mut self) -> Self {
        self.bundled = true;
        self
    }

    pub fn with_device_compat<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DeviceInfo) -> bool + Send + Sync + 'static,
    {
        self.device_compat = Some(Arc::new(predicate));
        self
    }

    pub fn with_client_compat<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ClientQuery) -> bool + Send + Sync + 'static,
    {
        self.client_compat = Some(Arc::new(predicate));
        self
    }

    /// Whether the plugin supports the given device. Plugins without a
    /// device predicate support every device.
    pub fn supports_device(&self, device: &DeviceInfo) -> bool {
        match &self.device_compat {
            Some(predicate) => predicate(device),
            None => true,
        }
    }

    /// Whether the plugin supports the given client. Plugins without a
    /// client predicate support every client.
    pub fn supports_client(&self, client: &ClientQuery) -> bool {
        match &self.client_compat {
            Some(predicate) => predicate(client),
            None => true,
        }
    }
}

/// An unavailable plugin paired with a human-readable reason.
#[derive(Debug, Clone, Serialize)]
pub struct UnavailablePlugin {
    pub definition: PluginDefinition,
    pub reason: String,
}

/// Resolved plugin buckets for one device/client pair. Buckets are disjoint:
/// every plugin id appears in at most one of the five.
#[derive(Debug, Default, Serialize)]
pub struct ActiveSets {
    /// Device-scoped plugins compatible with the selected device.
    pub device_plugins: Vec<PluginDefinition>,
    /// Client plugins the user enabled for this app.
    pub enabled_plugins: Vec<PluginDefinition>,
    /// Client plugins the peer supports but the user has not enabled.
    pub disabled_plugins: Vec<PluginDefinition>,
    /// Plugins that cannot run here, with the reason.
    pub unavailable_plugins: Vec<UnavailablePlugin>,
    /// Plugins the peer advertises that could be installed from the
    /// marketplace or activated from the bundle.
    pub downloadable_plugins: Vec<PluginDefinition>,
}

impl ActiveSets {
    /// Ids of the enabled client plugins.
    pub fn enabled_ids(&self) -> Vec<String> {
        self.enabled_plugins.iter().map(|p| p.id.clone()).collect()
    }

    /// Ids of every plugin that should hold a live instance for the
    /// connection: enabled client plugins plus resolved device plugins.
    pub fn activatable_ids(&self) -> Vec<String> {
        self.enabled_plugins
            .iter()
            .chain(&self.device_plugins)
            .map(|p| p.id.clone())
            .collect()
    }
}

/// Process-wide catalog of plugin definitions.
#[derive(Debug, Default)]
pub struct PluginCatalog {
    /// Installed definitions, gatekept ones included.
    installed: BTreeMap<String, PluginDefinition>,
    /// Marketplace and bundled descriptors available for download/activation.
    marketplace: BTreeMap<String, PluginDefinition>,
    /// Gatekeepers the current user is entitled to.
    granted_gatekeepers: HashSet<String>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register installed plugin definitions. Install replaces: a definition
    /// with an id already present supersedes the old one.
    pub fn register(&mut self, defs: Vec<PluginDefinition>) {
        for def in defs {
            self.installed.insert(def.id.clone(), def);
        }
    }

    /// Remove installed definitions by id. Unknown ids are ignored.
    pub fn unregister_by_name(&mut self, ids: &[String]) {
        for id in ids {
            self.installed.remove(id);
        }
    }

    /// Register gatekept definitions. These are installed definitions whose
    /// visibility is restricted to entitled users.
    pub fn add_gatekept(&mut self, defs: Vec<PluginDefinition>) {
        for def in defs {
            debug_assert!(
                def.gatekeeper.is_some(),
                "gatekept definition {} has no gatekeeper name",
                def.id
            );
            self.installed.insert(def.id.clone(), def);
        }
    }

    /// Register marketplace/bundled descriptors available for download.
    pub fn register_marketplace(&mut self, defs: Vec<PluginDefinition>) {
        for def in defs {
            self.marketplace.insert(def.id.clone(), def);
        }
    }

    /// Set the gatekeepers the current user is entitled to.
    pub fn set_granted_gatekeepers(&mut self, names: impl IntoIterator<Item = String>) {
        self.granted_gatekeepers = names.into_iter().collect();
    }

    /// Look up an installed definition.
    pub fn installed_plugin(&self, id: &str) -> Option<&PluginDefinition> {
        self.installed.get(id)
    }

    /// Ids of all installed plugins.
    pub fn installed_ids(&self) -> Vec<String> {
        self.installed.keys().cloned().collect()
    }

    /// Resolve the five plugin buckets for a device/client pair.
    ///
    /// `starred` is the set of plugin ids the user enabled for the client's
    /// app. Resolution order is precedence order; the first matching bucket
    /// wins, so the buckets partition the id space.
    pub fn compute_active_sets(
        &self,
        device: &DeviceInfo,
        client: &ClientQuery,
        advertised: &[String],
        starred: &HashSet<String>,
    ) -> ActiveSets {
        let mut sets = ActiveSets::default();
        let advertised_set: HashSet<&str> = advertised.iter().map(String::as_str).collect();

        for def in self.installed.values() {
            // 1. Device plugins either run against the device or are
            //    unavailable for it; the client plays no part.
            if def.kind == PluginKind::Device {
                if def.supports_device(device) {
                    sets.device_plugins.push(def.clone());
                } else {
                    sets.unavailable_plugins.push(UnavailablePlugin {
                        definition: def.clone(),
                        reason: format!(
                            "Plugin '{}' is not supported by the current device type",
                            def.title
                        ),
                    });
                }
                continue;
            }

            // 2. Client plugins the peer does not advertise cannot run,
            //    unless they ship bundled and support the client anyway.
            //    Checked before the gatekeeper so the more actionable reason
            //    wins when both apply.
            if !advertised_set.contains(def.id.as_str())
                && !(def.bundled && def.supports_client(client))
            {
                sets.unavailable_plugins.push(UnavailablePlugin {
                    definition: def.clone(),
                    reason: format!(
                        "Plugin '{}' is installed but not supported by the client application",
                        def.title
                    ),
                });
                continue;
            }

            // 3. Gatekept plugins need an entitlement.
            if let Some(gatekeeper) = &def.gatekeeper {
                if !self.granted_gatekeepers.contains(gatekeeper) {
                    sets.unavailable_plugins.push(UnavailablePlugin {
                        definition: def.clone(),
                        reason: format!(
                            "Plugin '{}' is only available to members of gatekeeper '{}'",
                            def.title, gatekeeper
                        ),
                    });
                    continue;
                }
            }

            // 4. Advertised and installed: enabled or disabled per user choice.
            if starred.contains(&def.id) {
                sets.enabled_plugins.push(def.clone());
            } else {
                sets.disabled_plugins.push(def.clone());
            }
        }

        // 5. Advertised but not installed: downloadable when a compatible
        //    descriptor exists, otherwise unavailable.
        for id in advertised {
            if self.installed.contains_key(id) {
                continue;
            }
            match self.marketplace.get(id) {
                Some(descriptor) if descriptor.supports_client(client) => {
                    sets.downloadable_plugins.push(descriptor.clone());
                }
                _ => {
                    sets.unavailable_plugins.push(UnavailablePlugin {
                        definition: PluginDefinition::client(id, id),
                        reason: format!(
                            "Plugin '{}' is not installed and not supported by the client application",
                            id
                        ),
                    });
                }
            }
        }

        sort_by_title(&mut sets.device_plugins);
        sort_by_title(&mut sets.enabled_plugins);
        sort_by_title(&mut sets.disabled_plugins);
        sort_by_title(&mut sets.downloadable_plugins);
        sets.unavailable_plugins
            .sort_by(|a, b| a.definition.title.cmp(&b.definition.title));

        verify_partition(&sets);
        sets
    }
}

fn sort_by_title(plugins: &mut [PluginDefinition]) {
    plugins.sort_by(|a, b| a.title.cmp(&b.title));
}

/// A plugin id resolving into two buckets is an internal bug worth loud
/// logging; resolution precedence should make it impossible.
fn verify_partition(sets: &ActiveSets) {
    let mut seen: HashMap<&str, u32> = HashMap::new();
    let all = sets
        .device_plugins
        .iter()
        .chain(&sets.enabled_plugins)
        .chain(&sets.disabled_plugins)
        .chain(&sets.downloadable_plugins)
        .map(|p| p.id.as_str())
        .chain(sets.unavailable_plugins.iter().map(|u| u.definition.id.as_str()));
    for id in all {
        let count = seen.entry(id).or_insert(0);
        *count += 1;
        if *count > 1 {
            error!("plugin '{}' resolved into more than one bucket", id);
            debug_assert!(false, "plugin '{}' resolved into more than one bucket", id);
        }
    }
}
