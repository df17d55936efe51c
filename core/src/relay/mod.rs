// Relay module: cross-site message relaying via elected site masters and
// bridge channels

pub mod config;
pub mod engine;
pub mod header;
pub mod picker;
pub mod relayer;
pub mod route;
pub mod suppress;
pub mod topology;

pub use config::{BridgeConfig, ConfigError, ForwardConfig, RelayOptions, SiteConfig};
pub use engine::{
    determine_site_masters, RelayDelegate, RelayEngine, RouteStatusListener, SiteMasterListener,
};
pub use header::{
    MemberInfo, Members, RelayHeader, RelayHeaderType, TopoHeader, TopoHeaderType, RELAY_PROTO_ID,
    TOPO_PROTO_ID,
};
pub use picker::{picker_from_name, RandomSiteMasterPicker, SiteMasterPicker};
pub use relayer::Relayer;
pub use route::{Route, RouteStatus};
pub use suppress::{SuppressLevel, SuppressLog};
pub use topology::Topology;
