//! A path to a remote site through one bridge channel.

use crate::address::{Addr, SiteAddr};
use crate::message::Message;
use crate::relay::header::RelayHeader;
use crate::stats::RelayCounters;
use crate::transport::{Channel, TransportError};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Up,
    Down,
}

/// One directional path to a remote site: the bridge channel plus the
/// address of the remote site master on that bridge. Owned by the relayer;
/// a route does not outlive its bridge.
pub struct Route {
    site: String,
    bridge: Arc<dyn Channel>,
    site_master: Addr,
    up: AtomicBool,
    counters: Arc<RelayCounters>,
}

impl Route {
    pub(crate) fn new(
        site: impl Into<String>,
        bridge: Arc<dyn Channel>,
        site_master: Addr,
        counters: Arc<RelayCounters>,
    ) -> Self {
        Route { site: site.into(), bridge, site_master, up: AtomicBool::new(true), counters }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn site_master(&self) -> &Addr {
        &self.site_master
    }

    pub fn bridge(&self) -> &Arc<dyn Channel> {
        &self.bridge
    }

    pub fn status(&self) -> RouteStatus {
        if self.up.load(Ordering::Acquire) {
            RouteStatus::Up
        } else {
            RouteStatus::Down
        }
    }

    pub fn set_status(&self, status: RouteStatus) {
        self.up.store(status == RouteStatus::Up, Ordering::Release);
    }

    /// Wraps `msg` with a DATA relay header and forwards it over the
    /// bridge: to the remote site master, or as a bridge multicast when
    /// `final_dest` is `None`.
    pub fn send(
        &self,
        final_dest: Option<&SiteAddr>,
        original_sender: &SiteAddr,
        msg: &Message,
    ) -> Result<(), TransportError> {
        self.send_with_visited(final_dest, original_sender, msg, None)
    }

    /// As [`Route::send`], additionally recording the sites the message has
    /// already been forwarded through.
    pub fn send_with_visited(
        &self,
        final_dest: Option<&SiteAddr>,
        original_sender: &SiteAddr,
        msg: &Message,
        visited_sites: Option<&BTreeSet<String>>,
    ) -> Result<(), TransportError> {
        if self.status() == RouteStatus::Down {
            return Err(TransportError::SendFailed(format!("route to {} is down", self.site)));
        }
        let mut hdr = RelayHeader::data(final_dest.cloned(), Some(original_sender.clone()));
        if let Some(visited) = visited_sites {
            if !visited.is_empty() {
                hdr.visited_sites = Some(visited.clone());
            }
        }

        // The relay header carries the end-to-end identity; on the bridge
        // the message is addressed to the remote site master only.
        let mut copy = msg.stripped_copy();
        copy.dest = final_dest.map(|_| self.site_master.clone());
        copy.src = None;
        copy.put_relay_header(hdr);

        trace!(site = %self.site, master = %self.site_master, "relaying over bridge");
        let start = Instant::now();
        self.bridge.send(copy)?;
        self.counters.relayed.incr();
        self.counters.relayed_time_ns.add(start.elapsed().as_nanos() as u64);
        Ok(())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} (bridge {}, {:?})",
            self.site,
            self.site_master,
            self.bridge.cluster(),
            self.status()
        )
    }
}
