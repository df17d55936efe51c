//! In-process transport: named clusters with synchronous delivery.
//!
//! `LocalNetwork` is a hub of clusters living in one process. Joining a
//! cluster bumps its view id and pushes the new view to every member,
//! including the joiner. Delivery is synchronous on the caller's thread;
//! no lock is held while receiver callbacks run, so receivers may send
//! from within their callbacks.

use crate::address::{Addr, AddrFlags, View, ViewMember};
use crate::message::Message;
use crate::transport::abstraction::{Channel, Connector, Receiver, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

struct MemberSlot {
    addr: Addr,
    flags: Option<AddrFlags>,
    receiver: Arc<dyn Receiver>,
}

#[derive(Default)]
struct ClusterState {
    view_id: u64,
    members: Vec<MemberSlot>,
}

impl ClusterState {
    fn view(&self) -> View {
        let members = self
            .members
            .iter()
            .map(|m| ViewMember { addr: m.addr.clone(), flags: m.flags })
            .collect();
        View::new(self.view_id, members)
    }
}

/// An in-process hub of named clusters.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    clusters: Arc<Mutex<HashMap<String, ClusterState>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current view of a cluster, if it has members.
    pub fn view_of(&self, cluster: &str) -> Option<View> {
        let clusters = self.clusters.lock();
        clusters.get(cluster).filter(|c| !c.members.is_empty()).map(|c| c.view())
    }

    fn install_view(&self, cluster: &str) {
        let (view, receivers) = {
            let mut clusters = self.clusters.lock();
            let state = match clusters.get_mut(cluster) {
                Some(s) => s,
                None => return,
            };
            state.view_id += 1;
            let receivers: Vec<_> = state.members.iter().map(|m| Arc::clone(&m.receiver)).collect();
            (state.view(), receivers)
        };
        trace!("cluster {}: installing view {}", cluster, view);
        for r in receivers {
            r.on_view(view.clone());
        }
    }

    fn leave(&self, cluster: &str, addr: &Addr) {
        let removed = {
            let mut clusters = self.clusters.lock();
            match clusters.get_mut(cluster) {
                Some(state) => {
                    let before = state.members.len();
                    state.members.retain(|m| &m.addr != addr);
                    let removed = state.members.len() != before;
                    if state.members.is_empty() {
                        clusters.remove(cluster);
                        return;
                    }
                    removed
                }
                None => return,
            }
        };
        if removed {
            self.install_view(cluster);
        }
    }

    fn deliver(&self, cluster: &str, msg: Message) -> Result<(), TransportError> {
        let targets: Vec<Arc<dyn Receiver>> = {
            let clusters = self.clusters.lock();
            let state = clusters
                .get(cluster)
                .ok_or_else(|| TransportError::NotConnected(cluster.to_string()))?;
            match &msg.dest {
                None => state.members.iter().map(|m| Arc::clone(&m.receiver)).collect(),
                Some(dest) => {
                    let slot = state.members.iter().find(|m| &m.addr == dest).ok_or_else(|| {
                        TransportError::NoSuchMember(dest.to_string(), cluster.to_string())
                    })?;
                    vec![Arc::clone(&slot.receiver)]
                }
            }
        };
        for r in targets {
            r.on_message(msg.clone());
        }
        Ok(())
    }
}

impl Connector for LocalNetwork {
    fn connect(
        &self,
        cluster: &str,
        local: Addr,
        flags: Option<AddrFlags>,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        {
            let mut clusters = self.clusters.lock();
            let state = clusters.entry(cluster.to_string()).or_default();
            // A rejoining address replaces its previous registration.
            state.members.retain(|m| m.addr != local);
            state.members.push(MemberSlot { addr: local.clone(), flags, receiver });
        }
        self.install_view(cluster);
        Ok(Arc::new(LocalChannel {
            net: self.clone(),
            cluster: cluster.to_string(),
            local,
            closed: AtomicBool::new(false),
        }))
    }
}

/// One member's connection into a [`LocalNetwork`] cluster.
pub struct LocalChannel {
    net: LocalNetwork,
    cluster: String,
    local: Addr,
    closed: AtomicBool,
}

impl Channel for LocalChannel {
    fn local_addr(&self) -> Addr {
        self.local.clone()
    }

    fn cluster(&self) -> String {
        self.cluster.clone()
    }

    fn send(&self, mut msg: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if msg.src.is_none() {
            msg.src = Some(self.local.clone());
        }
        self.net.deliver(&self.cluster, msg)
    }

    fn view(&self) -> View {
        self.net.view_of(&self.cluster).unwrap_or_else(|| View::new(0, Vec::new()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.net.leave(&self.cluster, &self.local);
    }
}
