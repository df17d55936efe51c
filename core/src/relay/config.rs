//! Relay configuration: the local node's options plus the site map
//! describing each reachable site's bridge clusters.
//!
//! Options load from a JSON file or are built programmatically with the
//! fluent setters. Validation clamps out-of-range numeric options with a
//! warning and rejects fatally broken configurations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("site cannot be empty")]
    MissingSite,
    #[error("site configuration for \"{0}\" not found")]
    UnknownSite(String),
    #[error("unknown site master picker \"{0}\"")]
    UnknownPicker(String),
    #[error("cannot read config {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("cannot parse config: {0}")]
    Parse(String),
}

/// One bridge a site master joins: a named inter-site cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub cluster: String,
}

/// A site's bridge list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,
}

impl SiteConfig {
    pub fn with_bridge(cluster: impl Into<String>) -> Self {
        SiteConfig { bridges: vec![BridgeConfig { cluster: cluster.into() }] }
    }
}

/// A forwarding rule: messages for `to` may be routed through the site
/// master of `gateway`. `to` is an exact site name or `"*"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardConfig {
    pub to: String,
    pub gateway: String,
}

fn default_cluster() -> String {
    "relaymesh".to_string()
}

fn default_max_site_masters() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_picker() -> String {
    "random".to_string()
}

fn default_topo_wait_ms() -> u64 {
    2_000
}

fn default_suppress_ms() -> u64 {
    60_000
}

/// All options of the relay engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayOptions {
    /// Name of the local site; must appear in `sites`.
    pub site: String,
    /// Name of the local cluster the engine joins.
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// Upper bound on elected site masters.
    #[serde(default = "default_max_site_masters")]
    pub max_site_masters: usize,
    /// Ratio of members that are site masters, in [0,1]. 0 disables the
    /// ratio and only `max_site_masters` applies.
    #[serde(default)]
    pub site_masters_ratio: f64,
    #[serde(default = "default_true")]
    pub can_become_site_master: bool,
    /// When true, this node joins views tagged with its site-master
    /// eligibility flag. Untagged members are always eligible.
    #[serde(default)]
    pub enable_address_tagging: bool,
    /// Run bridge startup off the view-delivery thread.
    #[serde(default = "default_true")]
    pub async_relay_creation: bool,
    /// Named picker plugin; see [`crate::relay::picker::picker_from_name`].
    #[serde(default = "default_picker")]
    pub site_master_picker: String,
    #[serde(default = "default_topo_wait_ms")]
    pub topo_wait_time_ms: u64,
    /// Window for suppressing identical "no route to site" errors.
    /// 0 disables suppression.
    #[serde(default = "default_suppress_ms")]
    pub suppress_time_no_route_errors_ms: u64,
    /// Site name to bridge clusters, for every reachable site.
    #[serde(default)]
    pub sites: HashMap<String, SiteConfig>,
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,

    // Accepted for config compatibility; ignored.
    #[serde(default, skip_serializing)]
    relay_multicasts: Option<bool>,
    #[serde(default, skip_serializing)]
    can_forward_local_cluster: Option<bool>,
}

impl RelayOptions {
    pub fn new(site: impl Into<String>) -> Self {
        RelayOptions {
            site: site.into(),
            cluster: default_cluster(),
            max_site_masters: default_max_site_masters(),
            site_masters_ratio: 0.0,
            can_become_site_master: true,
            enable_address_tagging: false,
            async_relay_creation: true,
            site_master_picker: default_picker(),
            topo_wait_time_ms: default_topo_wait_ms(),
            suppress_time_no_route_errors_ms: default_suppress_ms(),
            sites: HashMap::new(),
            forwards: Vec::new(),
            relay_multicasts: None,
            can_forward_local_cluster: None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&data)
    }

    // Fluent setters for programmatic assembly.

    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn max_site_masters(mut self, max: usize) -> Self {
        self.max_site_masters = max;
        self
    }

    pub fn site_masters_ratio(mut self, ratio: f64) -> Self {
        self.site_masters_ratio = ratio;
        self
    }

    pub fn can_become_site_master(mut self, flag: bool) -> Self {
        self.can_become_site_master = flag;
        self
    }

    pub fn enable_address_tagging(mut self, flag: bool) -> Self {
        self.enable_address_tagging = flag;
        self
    }

    pub fn async_relay_creation(mut self, flag: bool) -> Self {
        self.async_relay_creation = flag;
        self
    }

    pub fn site_master_picker(mut self, name: impl Into<String>) -> Self {
        self.site_master_picker = name.into();
        self
    }

    pub fn suppress_time_no_route_errors(mut self, window: Duration) -> Self {
        self.suppress_time_no_route_errors_ms = window.as_millis() as u64;
        self
    }

    pub fn add_site(mut self, name: impl Into<String>, cfg: SiteConfig) -> Self {
        self.sites.insert(name.into(), cfg);
        self
    }

    pub fn add_forward(mut self, to: impl Into<String>, gateway: impl Into<String>) -> Self {
        self.forwards.push(ForwardConfig { to: to.into(), gateway: gateway.into() });
        self
    }

    /// Clamps out-of-range numeric options and rejects fatally broken
    /// configurations.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.site.is_empty() {
            return Err(ConfigError::MissingSite);
        }
        if !self.sites.contains_key(&self.site) {
            return Err(ConfigError::UnknownSite(self.site.clone()));
        }
        if self.max_site_masters < 1 {
            warn!("max_site_masters was {}, changed to 1", self.max_site_masters);
            self.max_site_masters = 1;
        }
        if self.site_masters_ratio < 0.0 {
            warn!("changing incorrect site_masters_ratio of {:.2} to 0", self.site_masters_ratio);
            self.site_masters_ratio = 0.0;
        } else if self.site_masters_ratio > 1.0 {
            warn!("changing incorrect site_masters_ratio of {:.2} to 1", self.site_masters_ratio);
            self.site_masters_ratio = 1.0;
        }
        if self.relay_multicasts.is_some() {
            warn!("option relay_multicasts is deprecated and will be ignored");
        }
        if self.can_forward_local_cluster.is_some() {
            warn!("option can_forward_local_cluster is deprecated and will be ignored");
        }
        Ok(())
    }

    pub fn topo_wait_time(&self) -> Duration {
        Duration::from_millis(self.topo_wait_time_ms)
    }

    pub fn suppress_window(&self) -> Duration {
        Duration::from_millis(self.suppress_time_no_route_errors_ms)
    }

    /// The local site's bridge list.
    pub fn local_site_config(&self) -> Option<&SiteConfig> {
        self.sites.get(&self.site)
    }

    /// All configured site names, sorted.
    pub fn site_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sites.keys().cloned().collect();
        names.sort();
        names
    }
}
