//! Address types: cluster-local node identities, site-scoped addresses and
//! cluster views.
//!
//! A `SiteAddr` is the relay's polymorphic destination: either a concrete
//! member of a named site (`Member`) or the virtual "current site master of
//! site S" (`Master`), resolved at delivery time. Equality is type-aware:
//! a `Master` is equal only to another `Master` of the same site.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Cluster-unique node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        NodeId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Short printable form (first 8 hex chars), for logs.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

/// Flag set carried by tagged member addresses. The relay core only reads
/// `CAN_BECOME_SITE_MASTER`; other bits pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddrFlags(u16);

impl AddrFlags {
    /// Member is allowed to be elected site master.
    pub const CAN_BECOME_SITE_MASTER: u16 = 1 << 1;

    pub fn new(flags: u16) -> Self {
        AddrFlags(flags)
    }

    pub fn contains(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u16) {
        self.0 &= !flag;
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

/// A concrete member of a named site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteUuid {
    pub node: NodeId,
    pub site: String,
}

/// Virtual address for the current site master of a site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteMaster {
    pub site: String,
}

/// A site-scoped address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiteAddr {
    /// A concrete member of a named site.
    Member(SiteUuid),
    /// Whoever is currently site master of the named site.
    Master(SiteMaster),
}

impl SiteAddr {
    pub fn member(node: NodeId, site: impl Into<String>) -> Self {
        SiteAddr::Member(SiteUuid { node, site: site.into() })
    }

    pub fn master(site: impl Into<String>) -> Self {
        SiteAddr::Master(SiteMaster { site: site.into() })
    }

    /// The site this address belongs to.
    pub fn site(&self) -> &str {
        match self {
            SiteAddr::Member(m) => &m.site,
            SiteAddr::Master(m) => &m.site,
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, SiteAddr::Master(_))
    }
}

impl fmt::Display for SiteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiteAddr::Member(m) => write!(f, "{}@{}", m.node, m.site),
            SiteAddr::Master(m) => write!(f, "SiteMaster({})", m.site),
        }
    }
}

/// Any address a message can carry: a plain cluster member or a site-scoped
/// address that the relay resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Addr {
    Node(NodeId),
    Site(SiteAddr),
}

impl Addr {
    pub fn as_site(&self) -> Option<&SiteAddr> {
        match self {
            Addr::Site(s) => Some(s),
            Addr::Node(_) => None,
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Addr::Node(n) => Some(*n),
            Addr::Site(SiteAddr::Member(m)) => Some(m.node),
            Addr::Site(SiteAddr::Master(_)) => None,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Node(n) => write!(f, "{n}"),
            Addr::Site(s) => write!(f, "{s}"),
        }
    }
}

impl From<NodeId> for Addr {
    fn from(n: NodeId) -> Self {
        Addr::Node(n)
    }
}

impl From<SiteAddr> for Addr {
    fn from(s: SiteAddr) -> Self {
        Addr::Site(s)
    }
}

/// One member of a view. `flags` is `None` for untagged members; an
/// untagged member is always eligible for site-master election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMember {
    pub addr: Addr,
    pub flags: Option<AddrFlags>,
}

impl ViewMember {
    pub fn untagged(addr: Addr) -> Self {
        ViewMember { addr, flags: None }
    }

    pub fn tagged(addr: Addr, flags: AddrFlags) -> Self {
        ViewMember { addr, flags: Some(flags) }
    }
}

/// An ordered snapshot of cluster membership. Views are delivered
/// monotonically; each view supersedes the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: u64,
    pub members: Vec<ViewMember>,
}

impl View {
    pub fn new(id: u64, members: Vec<ViewMember>) -> Self {
        View { id, members }
    }

    /// The coordinator is the first member of the view.
    pub fn coord(&self) -> Option<&Addr> {
        self.members.first().map(|m| &m.addr)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, addr: &Addr) -> bool {
        self.members.iter().any(|m| &m.addr == addr)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] (", self.id)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", m.addr)?;
        }
        write!(f, ")")
    }
}
