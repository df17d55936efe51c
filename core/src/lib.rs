// relaymesh core: cross-site message relay
//
// A protocol layer that lets autonomous clusters ("sites") exchange
// point-to-point and multicast messages via elected site masters which
// maintain inter-site bridge channels. The transport below is a contract;
// an in-process implementation ships for tests and demos.

pub mod address;
pub mod bundler;
pub mod message;
pub mod relay;
pub mod stats;
pub mod transport;

use thiserror::Error;

pub use address::{Addr, AddrFlags, NodeId, SiteAddr, SiteMaster, SiteUuid, View, ViewMember};
pub use bundler::{BatchingBundler, Bundler, BundlerOptions, DirectBundler};
pub use message::{CodecError, Message, MsgFlags};
pub use relay::{
    ConfigError, RelayDelegate, RelayEngine, RelayOptions, RouteStatusListener, SiteConfig,
    SiteMasterPicker,
};
pub use transport::{Channel, Connector, LocalNetwork, Receiver, Transport, TransportError};

/// Errors surfaced by the relay engine.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("already running")]
    AlreadyRunning,
    #[error("not running")]
    NotRunning,
    #[error("site master is null")]
    NoSiteMaster,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
