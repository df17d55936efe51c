//! Relay protocol headers and the topology exchange payload.
//!
//! Header type codes are written as explicit `u8` values on the wire and
//! must stay stable across releases for interop.

use crate::address::SiteAddr;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Protocol id of the relay header in the header map.
pub const RELAY_PROTO_ID: u16 = 980;

/// Protocol id of the topology sub-header. Fixed for interop with existing
/// deployments.
pub const TOPO_PROTO_ID: u16 = 560;

/// Relay header type. Wire codes are part of the protocol contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayHeaderType {
    Data,
    SiteUnreachable,
    SitesUp,
    SitesDown,
}

impl RelayHeaderType {
    pub fn as_u8(&self) -> u8 {
        match self {
            RelayHeaderType::Data => 1,
            RelayHeaderType::SiteUnreachable => 2,
            RelayHeaderType::SitesUp => 3,
            RelayHeaderType::SitesDown => 4,
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(RelayHeaderType::Data),
            2 => Some(RelayHeaderType::SiteUnreachable),
            3 => Some(RelayHeaderType::SitesUp),
            4 => Some(RelayHeaderType::SitesDown),
            _ => None,
        }
    }
}

impl Serialize for RelayHeaderType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for RelayHeaderType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        RelayHeaderType::from_u8(code)
            .ok_or_else(|| de::Error::custom(format!("unknown relay header type {code}")))
    }
}

impl fmt::Display for RelayHeaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayHeaderType::Data => "DATA",
            RelayHeaderType::SiteUnreachable => "SITE_UNREACHABLE",
            RelayHeaderType::SitesUp => "SITES_UP",
            RelayHeaderType::SitesDown => "SITES_DOWN",
        };
        write!(f, "{s}")
    }
}

/// Metadata attached to messages crossing bridges: the end-to-end identity
/// plus the breadcrumbs needed for admin signalling and cycle prevention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayHeader {
    pub ty: RelayHeaderType,
    /// Ultimate destination; `None` for multicast relays.
    pub final_dest: Option<SiteAddr>,
    pub original_sender: Option<SiteAddr>,
    /// Affected site names (admin types).
    pub sites: Option<BTreeSet<String>>,
    /// Sites a multicast has already been forwarded through.
    pub visited_sites: Option<BTreeSet<String>>,
}

impl RelayHeader {
    pub fn new(ty: RelayHeaderType) -> Self {
        RelayHeader { ty, final_dest: None, original_sender: None, sites: None, visited_sites: None }
    }

    pub fn data(final_dest: Option<SiteAddr>, original_sender: Option<SiteAddr>) -> Self {
        RelayHeader { ty: RelayHeaderType::Data, final_dest, original_sender, sites: None, visited_sites: None }
    }

    pub fn with_sites<I, S>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sites = Some(sites.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_visited_sites(mut self, visited: BTreeSet<String>) -> Self {
        self.visited_sites = Some(visited);
        self
    }

    pub fn has_visited_sites(&self) -> bool {
        self.visited_sites.as_ref().is_some_and(|v| !v.is_empty())
    }
}

impl fmt::Display for RelayHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        if let Some(d) = &self.final_dest {
            write!(f, " dest={d}")?;
        }
        if let Some(s) = &self.original_sender {
            write!(f, " sender={s}")?;
        }
        if let Some(sites) = &self.sites {
            write!(f, " sites={sites:?}")?;
        }
        if let Some(visited) = &self.visited_sites {
            write!(f, " visited={visited:?}")?;
        }
        Ok(())
    }
}

/// Topology sub-header type. Wire codes are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopoHeaderType {
    Req,
    Rsp,
}

impl TopoHeaderType {
    pub fn as_u8(&self) -> u8 {
        match self {
            TopoHeaderType::Req => 1,
            TopoHeaderType::Rsp => 2,
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(TopoHeaderType::Req),
            2 => Some(TopoHeaderType::Rsp),
            _ => None,
        }
    }
}

impl Serialize for TopoHeaderType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for TopoHeaderType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        TopoHeaderType::from_u8(code)
            .ok_or_else(|| de::Error::custom(format!("unknown topo header type {code}")))
    }
}

/// Header of a topology request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopoHeader {
    pub ty: TopoHeaderType,
}

impl TopoHeader {
    pub fn req() -> Self {
        TopoHeader { ty: TopoHeaderType::Req }
    }

    pub fn rsp() -> Self {
        TopoHeader { ty: TopoHeaderType::Rsp }
    }
}

/// One member advertised in a topology response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub site: String,
    pub addr: SiteAddr,
    pub is_site_master: bool,
}

/// A site's membership advertisement, carried as the payload of a TOPO_RSP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Members {
    pub site: String,
    pub joined: Vec<MemberInfo>,
}

impl Members {
    pub fn new(site: impl Into<String>) -> Self {
        Members { site: site.into(), joined: Vec::new() }
    }

    pub fn add_joined(&mut self, info: MemberInfo) {
        self.joined.push(info);
    }
}
