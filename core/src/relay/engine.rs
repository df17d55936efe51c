//! The relay engine: site-master election, view handling, and the down/up
//! message paths between the local cluster and the bridges.
//!
//! Decision flow for an outbound message: classify the destination
//! (local or remote site, member or virtual master), normalize the sender
//! to a site-scoped address, then either deliver in the local cluster,
//! forward to an elected site master, or hand the message to a route.
//! Inbound messages are classified by their relay header: admin types are
//! consumed, DATA is routed onward, multicasts fan out to the bridges with
//! visited-site breadcrumbs breaking relay cycles.

use crate::address::{Addr, AddrFlags, NodeId, SiteAddr, View, ViewMember};
use crate::message::{Message, MsgFlags};
use crate::relay::config::{ConfigError, RelayOptions, SiteConfig};
use crate::relay::header::{
    MemberInfo, Members, RelayHeader, RelayHeaderType, TopoHeader, TopoHeaderType,
};
use crate::relay::picker::{picker_from_name, SiteMasterPicker};
use crate::relay::relayer::{BridgeEvents, Relayer};
use crate::relay::suppress::{SuppressLevel, SuppressLog};
use crate::relay::topology::Topology;
use crate::stats::{ns_to_ms, RelayCounters};
use crate::transport::{Channel, Connector, Receiver};
use crate::RelayError;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Upward delegate: receives messages the relay delivers locally and
/// unreachable-site events for locally originated sends.
pub trait RelayDelegate: Send + Sync {
    fn deliver(&self, msg: Message);

    fn site_unreachable(&self, site: &str);
}

/// Observes route availability across sites.
pub trait RouteStatusListener: Send + Sync {
    fn sites_up(&self, sites: &[String]);

    fn sites_down(&self, sites: &[String]);

    fn sites_unreachable(&self, sites: &[String]);
}

/// Called with `true` when this node becomes site master, `false` when it
/// ceases to be.
pub type SiteMasterListener = dyn Fn(bool) + Send + Sync;

/// The cross-site relay protocol instance of one node.
#[derive(Clone)]
pub struct RelayEngine {
    inner: Arc<Inner>,
}

struct Inner {
    weak_self: Weak<Inner>,
    opts: RelayOptions,
    local: NodeId,
    connector: Arc<dyn Connector>,
    picker: Arc<dyn SiteMasterPicker>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    /// A view delivered during connect, before the channel handle exists.
    pending_view: Mutex<Option<View>>,
    delegate: RwLock<Option<Arc<dyn RelayDelegate>>>,
    route_status_listener: RwLock<Option<Arc<dyn RouteStatusListener>>>,
    site_master_listener: RwLock<Option<Arc<SiteMasterListener>>>,
    site_masters: RwLock<Vec<NodeId>>,
    is_site_master: AtomicBool,
    /// The first of all site masters narrates route changes to the local
    /// cluster.
    broadcast_route_notifications: AtomicBool,
    members: RwLock<Vec<ViewMember>>,
    relayer: RwLock<Option<Arc<Relayer>>>,
    /// Prevents duplicate sites-up notifications.
    site_cache: Mutex<HashSet<String>>,
    suppress_no_route: Option<SuppressLog<String>>,
    topo: Topology,
    counters: Arc<RelayCounters>,
    running: AtomicBool,
}

struct EngineReceiver(Weak<Inner>);

impl Receiver for EngineReceiver {
    fn on_message(&self, msg: Message) {
        if let Some(inner) = self.0.upgrade() {
            inner.up(msg);
        }
    }

    fn on_view(&self, view: View) {
        let Some(inner) = self.0.upgrade() else { return };
        if inner.channel.read().is_none() {
            *inner.pending_view.lock() = Some(view);
            return;
        }
        inner.handle_view(view);
    }
}

impl BridgeEvents for Inner {
    fn relay_received(&self, msg: Message) {
        self.handle_relay_message(msg);
    }

    fn routes_changed(&self, up: bool, sites: &[String]) {
        self.sites_change(!up, sites);
    }
}

impl RelayEngine {
    /// Builds an engine from validated options, resolving the configured
    /// picker name.
    pub fn new(opts: RelayOptions, connector: Arc<dyn Connector>) -> Result<Self, ConfigError> {
        let picker = picker_from_name(&opts.site_master_picker)
            .ok_or_else(|| ConfigError::UnknownPicker(opts.site_master_picker.clone()))?;
        Self::with_picker(opts, connector, picker)
    }

    /// As [`RelayEngine::new`] with an explicitly supplied picker.
    pub fn with_picker(
        mut opts: RelayOptions,
        connector: Arc<dyn Connector>,
        picker: Arc<dyn SiteMasterPicker>,
    ) -> Result<Self, ConfigError> {
        opts.validate()?;
        let suppress_no_route =
            (opts.suppress_time_no_route_errors_ms > 0).then(SuppressLog::new);
        let inner = Arc::new_cyclic(|weak| Inner {
            weak_self: weak.clone(),
            opts,
            local: NodeId::random(),
            connector,
            picker,
            channel: RwLock::new(None),
            pending_view: Mutex::new(None),
            delegate: RwLock::new(None),
            route_status_listener: RwLock::new(None),
            site_master_listener: RwLock::new(None),
            site_masters: RwLock::new(Vec::new()),
            is_site_master: AtomicBool::new(false),
            broadcast_route_notifications: AtomicBool::new(false),
            members: RwLock::new(Vec::new()),
            relayer: RwLock::new(None),
            site_cache: Mutex::new(HashSet::new()),
            suppress_no_route,
            topo: Topology::new(),
            counters: Arc::new(RelayCounters::new()),
            running: AtomicBool::new(false),
        });
        Ok(RelayEngine { inner })
    }

    pub fn local_addr(&self) -> NodeId {
        self.inner.local
    }

    pub fn site(&self) -> &str {
        &self.inner.opts.site
    }

    pub fn options(&self) -> &RelayOptions {
        &self.inner.opts
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn RelayDelegate>>) {
        *self.inner.delegate.write() = delegate;
    }

    pub fn set_route_status_listener(&self, listener: Option<Arc<dyn RouteStatusListener>>) {
        *self.inner.route_status_listener.write() = listener;
    }

    pub fn set_site_master_listener(&self, listener: Option<Arc<SiteMasterListener>>) {
        *self.inner.site_master_listener.write() = listener;
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Joins the local cluster and starts processing views and messages.
    pub fn start(&self) -> Result<(), RelayError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(RelayError::AlreadyRunning);
        }
        let receiver = Arc::new(EngineReceiver(self.inner.weak_self.clone()));
        let channel = match self.inner.connector.connect(
            &self.inner.opts.cluster,
            Addr::Node(self.inner.local),
            self.inner.member_flags(),
            receiver,
        ) {
            Ok(ch) => ch,
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        *self.inner.channel.write() = Some(channel.clone());
        // The first view may have raced past us while the channel handle
        // was still unset; process it now. Re-applying the same view later
        // is harmless as view handling is idempotent.
        let view = self.inner.pending_view.lock().take().unwrap_or_else(|| channel.view());
        self.inner.handle_view(view);
        Ok(())
    }

    /// Leaves the local cluster and stops any relayer.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.is_site_master.store(false, Ordering::Release);
        trace!("{}: ceased to be site master; closing bridges", self.inner.local);
        let relayer = self.inner.relayer.write().take();
        if let Some(relayer) = relayer {
            relayer.stop();
        }
        let channel = self.inner.channel.write().take();
        if let Some(channel) = channel {
            channel.close();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // PROTOCOL SURFACE
    // ------------------------------------------------------------------------

    /// The down path: sends an application message, relaying site-scoped
    /// destinations.
    pub fn send(&self, msg: Message) -> Result<(), RelayError> {
        self.inner.down(msg)
    }

    /// The up path for transports that deliver manually.
    pub fn up(&self, msg: Message) {
        self.inner.up(msg);
    }

    /// Batch form of the up path; unreachable-site notifications are
    /// coalesced per site within the batch.
    pub fn up_batch(&self, msgs: Vec<Message>) {
        self.inner.up_batch(msgs);
    }

    /// Applies a membership view. Idempotent: re-applying the current view
    /// neither flips site-master status nor restarts the relayer.
    pub fn handle_view(&self, view: View) {
        self.inner.handle_view(view);
    }

    // ------------------------------------------------------------------------
    // MANAGEMENT
    // ------------------------------------------------------------------------

    pub fn is_site_master(&self) -> bool {
        self.inner.is_site_master.load(Ordering::Acquire)
    }

    pub fn broadcast_route_notifications(&self) -> bool {
        self.inner.broadcast_route_notifications.load(Ordering::Acquire)
    }

    pub fn site_masters(&self) -> Vec<NodeId> {
        self.inner.site_masters.read().clone()
    }

    pub fn members(&self) -> Vec<ViewMember> {
        self.inner.members.read().clone()
    }

    /// All configured site names.
    pub fn site_names(&self) -> Vec<String> {
        self.inner.opts.site_names()
    }

    /// Sites currently reachable through routes, or `None` when this node
    /// is not a site master.
    pub fn current_sites(&self) -> Option<Vec<String>> {
        self.inner.relayer.read().as_ref().map(|r| r.site_names())
    }

    pub fn print_routes(&self) -> String {
        match self.inner.relayer.read().as_ref() {
            Some(relayer) => relayer.print_routes(),
            None => "n/a (not site master)".to_string(),
        }
    }

    pub fn print_sites(&self) -> String {
        match self.inner.relayer.read().as_ref() {
            Some(relayer) => relayer.site_names().join(", "),
            None => "n/a (not site master)".to_string(),
        }
    }

    pub fn print_topology(&self, all_sites: bool) -> String {
        if all_sites {
            self.inner.topo.print(None)
        } else {
            self.inner.topo.print(Some(&self.inner.opts.site))
        }
    }

    /// The membership view of a named bridge cluster, if this node is a
    /// site master that joined it.
    pub fn bridge_view(&self, cluster: &str) -> Option<View> {
        self.inner.relayer.read().as_ref().and_then(|r| r.bridge_view(cluster))
    }

    /// Sends a topology request to `site`'s master; with `wait`, blocks up
    /// to `topo_wait_time` for the response.
    pub fn refresh_topology(&self, site: &str, wait: bool) -> bool {
        let mut req = Message::to(SiteAddr::master(site));
        req.put_topo_header(TopoHeader::req());
        if let Err(e) = self.inner.down(req) {
            debug!("failed sending topology request for {site}: {e}");
            return false;
        }
        if wait {
            self.inner.topo.wait_for(site, self.inner.opts.topo_wait_time())
        } else {
            true
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topo
    }

    pub fn num_no_route_errors(&self) -> usize {
        self.inner.suppress_no_route.as_ref().map_or(0, |s| s.len())
    }

    pub fn clear_no_route_cache(&self) {
        if let Some(suppress) = &self.inner.suppress_no_route {
            suppress.clear();
        }
    }

    pub fn counters(&self) -> Arc<RelayCounters> {
        Arc::clone(&self.inner.counters)
    }

    pub fn num_forwarded_to_site_master(&self) -> u64 {
        self.inner.counters.forward_to_site_master.sum()
    }

    pub fn time_forwarding_to_sm_ms(&self) -> u64 {
        ns_to_ms(self.inner.counters.forward_sm_time_ns.sum())
    }

    pub fn num_relayed(&self) -> u64 {
        self.inner.counters.relayed.sum()
    }

    pub fn time_relaying_ms(&self) -> u64 {
        ns_to_ms(self.inner.counters.relayed_time_ns.sum())
    }

    pub fn num_forwarded_to_local_mbr(&self) -> u64 {
        self.inner.counters.forward_to_local_mbr.sum()
    }

    pub fn time_forwarding_to_local_mbr_ms(&self) -> u64 {
        ns_to_ms(self.inner.counters.forward_to_local_mbr_time_ns.sum())
    }

    pub fn reset_stats(&self) {
        self.inner.counters.reset();
        self.clear_no_route_cache();
    }
}

impl Inner {
    fn member_flags(&self) -> Option<AddrFlags> {
        if !self.opts.enable_address_tagging {
            return None;
        }
        let mut flags = AddrFlags::default();
        if self.opts.can_become_site_master {
            flags.set(AddrFlags::CAN_BECOME_SITE_MASTER);
        }
        Some(flags)
    }

    fn is_site_master(&self) -> bool {
        self.is_site_master.load(Ordering::Acquire)
    }

    fn is_local_target(&self, target: &SiteAddr) -> bool {
        matches!(target, SiteAddr::Member(su) if su.node == self.local && su.site == self.opts.site)
    }

    fn send_down(&self, msg: Message) -> Result<(), RelayError> {
        let channel = self.channel.read().clone().ok_or(RelayError::NotRunning)?;
        channel.send(msg).map_err(RelayError::from)
    }

    /// If the source is already site-scoped keep its site identity,
    /// otherwise the sender is this node in the local site.
    fn normalized_sender(&self, msg: &Message) -> SiteAddr {
        match &msg.src {
            Some(Addr::Site(SiteAddr::Master(m))) => SiteAddr::master(m.site.clone()),
            _ => SiteAddr::member(self.local, self.opts.site.clone()),
        }
    }

    // ------------------------------------------------------------------------
    // DOWN PATH
    // ------------------------------------------------------------------------

    fn down(&self, msg: Message) -> Result<(), RelayError> {
        let target = match &msg.dest {
            Some(Addr::Site(site_addr)) => site_addr.clone(),
            _ => return self.send_down(msg),
        };
        let sender = self.normalized_sender(&msg);

        if target.site() == self.opts.site {
            // The transport cannot address a virtual site master, so even
            // self-destined messages take a relay header.
            if self.is_local_target(&target) || (target.is_master() && self.is_site_master()) {
                self.forward_to(Addr::Node(self.local), &target, &sender, &msg, false)?;
            } else {
                self.deliver_locally(&target, &sender, &msg)?;
            }
            return Ok(());
        }

        if !self.is_site_master() {
            self.forward_to_site_master(&sender, &target, &msg)
        } else {
            self.route(&target, &sender, &msg);
            Ok(())
        }
    }

    fn forward_to(
        &self,
        next_dest: Addr,
        final_dest: &SiteAddr,
        original_sender: &SiteAddr,
        msg: &Message,
        forward_to_current_coord: bool,
    ) -> Result<(), RelayError> {
        trace!(
            "{}: forwarding message for {} to {}",
            self.local,
            final_dest,
            if forward_to_current_coord { "the current coordinator".to_string() } else { next_dest.to_string() }
        );
        let hdr = match msg.relay_header() {
            Some(existing) => {
                let mut hdr = existing.clone();
                hdr.final_dest = Some(final_dest.clone());
                hdr.original_sender = Some(original_sender.clone());
                hdr
            }
            None => RelayHeader::data(Some(final_dest.clone()), Some(original_sender.clone())),
        };
        let mut copy = msg.stripped_copy();
        copy.dest = Some(next_dest);
        copy.src = None;
        copy.put_relay_header(hdr);
        self.send_down(copy)
    }

    fn forward_to_site_master(
        &self,
        sender: &SiteAddr,
        final_dest: &SiteAddr,
        msg: &Message,
    ) -> Result<(), RelayError> {
        let start = Instant::now();
        let sender_addr = Addr::Site(sender.clone());
        let site_master =
            self.pick_site_master(Some(&sender_addr)).ok_or(RelayError::NoSiteMaster)?;
        self.forward_to(
            Addr::Node(site_master),
            final_dest,
            sender,
            msg,
            self.opts.max_site_masters == 1,
        )?;
        self.counters.forward_sm_time_ns.add(start.elapsed().as_nanos() as u64);
        self.counters.forward_to_site_master.incr();
        Ok(())
    }

    fn pick_site_master(&self, sender: Option<&Addr>) -> Option<NodeId> {
        let masters = self.site_masters.read().clone();
        if masters.len() == 1 {
            return masters.first().copied();
        }
        self.picker.pick_site_master(&masters, sender)
    }

    fn deliver_locally(
        &self,
        dest: &SiteAddr,
        sender: &SiteAddr,
        msg: &Message,
    ) -> Result<(), RelayError> {
        let (local_dest, to_coord) = match dest {
            SiteAddr::Master(_) => {
                let sender_addr = Addr::Site(sender.clone());
                let master =
                    self.pick_site_master(Some(&sender_addr)).ok_or(RelayError::NoSiteMaster)?;
                (Addr::Node(master), true)
            }
            SiteAddr::Member(su) => (Addr::Node(su.node), false),
        };
        trace!("{}: delivering message to {} in local cluster", self.local, dest);
        let start = Instant::now();
        self.forward_to(local_dest, dest, sender, msg, to_coord)?;
        self.counters.forward_to_local_mbr_time_ns.add(start.elapsed().as_nanos() as u64);
        self.counters.forward_to_local_mbr.incr();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // ROUTING (SITE MASTER)
    // ------------------------------------------------------------------------

    fn route(&self, dest: &SiteAddr, sender: &SiteAddr, msg: &Message) {
        let target_site = dest.site();
        if target_site == self.opts.site {
            if self.is_local_target(dest) || (self.is_site_master() && dest.is_master()) {
                self.deliver(Some(Addr::Site(dest.clone())), Some(Addr::Site(sender.clone())), msg);
            } else if let Err(e) = self.deliver_locally(dest, sender, msg) {
                error!("{}: failed delivering to {}: {}", self.local, dest, e);
            }
            return;
        }

        let Some(relayer) = self.relayer.read().clone() else {
            warn!("{}: not site master; dropping message for {}", self.local, dest);
            return;
        };
        let sender_addr = Addr::Site(sender.clone());
        let route = relayer
            .get_route(target_site, Some(&sender_addr), &*self.picker)
            .or_else(|| {
                relayer.get_forwarding_route_matching(target_site, Some(&sender_addr), &*self.picker)
            });
        match route {
            None => {
                let text = format!("{}: no route to {}; dropping message", self.local, target_site);
                match &self.suppress_no_route {
                    Some(suppress) => {
                        suppress.log(
                            SuppressLevel::Error,
                            target_site.to_string(),
                            self.opts.suppress_window(),
                            &text,
                        );
                    }
                    None => error!("{}", text),
                }
                self.send_site_unreachable_to(msg.src.as_ref(), target_site);
            }
            Some(route) => {
                if let Err(e) = route.send(Some(dest), sender, msg) {
                    error!("{}: failed relaying message to {}: {}", self.local, target_site, e);
                }
            }
        }
    }

    /// Sends SITE_UNREACHABLE back to the source. The source is always in
    /// the local cluster, so no routing is needed; a local source gets the
    /// event directly.
    fn send_site_unreachable_to(&self, src: Option<&Addr>, target_site: &str) {
        match src {
            // A missing source means the message came from the local node.
            None => self.trigger_site_unreachable(target_site),
            Some(addr) if addr.node_id() == Some(self.local) => {
                self.trigger_site_unreachable(target_site)
            }
            Some(addr) => {
                let mut msg = Message::to(addr.clone()).with_flag(MsgFlags::OOB);
                msg.put_relay_header(
                    RelayHeader::new(RelayHeaderType::SiteUnreachable).with_sites([target_site]),
                );
                if let Err(e) = self.down(msg) {
                    debug!("{}: failed sending SITE_UNREACHABLE: {}", self.local, e);
                }
            }
        }
    }

    fn trigger_site_unreachable(&self, site: &str) {
        if let Some(delegate) = self.delegate.read().clone() {
            delegate.site_unreachable(site);
        }
        if let Some(listener) = self.route_status_listener.read().clone() {
            listener.sites_unreachable(&[site.to_string()]);
        }
    }

    // ------------------------------------------------------------------------
    // UP PATH
    // ------------------------------------------------------------------------

    fn up(&self, msg: Message) {
        // Fan a multicast out to the bridges before anything else.
        if msg.dest.is_none() && self.is_site_master() && !msg.is_flag_set(MsgFlags::NO_RELAY) {
            self.send_to_bridges(&msg);
        }

        let hdr = msg.relay_header().cloned();
        match hdr {
            None => {
                if msg.topo_header().is_some() {
                    self.handle_topo(msg.src.clone(), &msg);
                    return;
                }
                self.deliver(msg.dest.clone(), msg.src.clone(), &msg);
            }
            Some(hdr) => {
                if self.handle_admin(&hdr) {
                    return;
                }
                if msg.dest.is_some() {
                    self.handle_message(&hdr, &msg);
                } else {
                    self.deliver(None, hdr.original_sender.clone().map(Addr::Site), &msg);
                }
            }
        }
    }

    fn up_batch(&self, msgs: Vec<Message>) {
        let mut unreachable_sites: Vec<String> = Vec::new();
        for msg in msgs {
            if msg.dest.is_none() && self.is_site_master() && !msg.is_flag_set(MsgFlags::NO_RELAY) {
                self.send_to_bridges(&msg);
            }
            let hdr = msg.relay_header().cloned();
            match hdr {
                None => {
                    if msg.topo_header().is_some() {
                        self.handle_topo(msg.src.clone(), &msg);
                        continue;
                    }
                    self.deliver(msg.dest.clone(), msg.src.clone(), &msg);
                }
                Some(hdr) => {
                    if self.handle_admin(&hdr) {
                        continue;
                    }
                    if msg.dest.is_some() {
                        if hdr.ty == RelayHeaderType::SiteUnreachable {
                            let site = hdr
                                .sites
                                .as_ref()
                                .and_then(|s| s.iter().next().cloned())
                                .or_else(|| hdr.final_dest.as_ref().map(|d| d.site().to_string()));
                            if let Some(site) = site {
                                if !unreachable_sites.contains(&site) {
                                    unreachable_sites.push(site);
                                }
                            }
                        } else {
                            self.handle_message(&hdr, &msg);
                        }
                    } else {
                        self.deliver(None, hdr.original_sender.clone().map(Addr::Site), &msg);
                    }
                }
            }
        }
        for site in unreachable_sites {
            self.trigger_site_unreachable(&site);
        }
    }

    /// Handles a message that arrived over a bridge.
    fn handle_relay_message(&self, msg: Message) {
        let Some(hdr) = msg.relay_header().cloned() else {
            debug!("{}: bridge message without relay header; dropping", self.local);
            return;
        };
        if hdr.final_dest.is_some() {
            self.handle_message(&hdr, &msg);
        } else {
            // Multicast locally, keeping the header so the visited-site
            // breadcrumbs survive the next relay round.
            let mut copy = msg.stripped_copy();
            copy.dest = None;
            copy.src = None;
            copy.put_relay_header(hdr);
            if let Err(e) = self.send_down(copy) {
                debug!("{}: failed multicasting relayed message: {}", self.local, e);
            }
        }
    }

    /// Consumes SITES_UP/SITES_DOWN. Returns whether the header was an
    /// admin type.
    fn handle_admin(&self, hdr: &RelayHeader) -> bool {
        if hdr.ty != RelayHeaderType::SitesUp && hdr.ty != RelayHeaderType::SitesDown {
            return false;
        }
        let listener = self.route_status_listener.read().clone();
        let (Some(listener), Some(sites)) = (listener, hdr.sites.clone()) else { return true };
        let mut sites = sites;
        sites.remove(&self.opts.site);
        if hdr.ty == RelayHeaderType::SitesUp {
            let mut cache = self.site_cache.lock();
            sites.retain(|s| !cache.contains(s));
            cache.extend(sites.iter().cloned());
            drop(cache);
            if sites.is_empty() {
                return true;
            }
            let sites: Vec<String> = sites.into_iter().collect();
            listener.sites_up(&sites);
        } else {
            if sites.is_empty() {
                return true;
            }
            let down: Vec<String> = sites.iter().cloned().collect();
            listener.sites_down(&down);
            let mut cache = self.site_cache.lock();
            for site in &down {
                cache.remove(site);
            }
            drop(cache);
            self.topo.remove_all(&down);
        }
        true
    }

    fn handle_message(&self, hdr: &RelayHeader, msg: &Message) {
        match hdr.ty {
            RelayHeaderType::Data => match (&hdr.final_dest, &hdr.original_sender) {
                (Some(dest), Some(sender)) => self.route(dest, sender, msg),
                _ => error!(
                    "{}: DATA message without final destination or original sender; dropping",
                    self.local
                ),
            },
            RelayHeaderType::SiteUnreachable => {
                let site = hdr.sites.as_ref().and_then(|s| s.iter().next().cloned());
                if let Some(site) = site {
                    self.trigger_site_unreachable(&site);
                }
            }
            other => error!("{}: type {} unknown", self.local, other),
        }
    }

    fn handle_topo(&self, sender: Option<Addr>, msg: &Message) {
        let Some(topo_hdr) = msg.topo_header() else { return };
        match topo_hdr.ty {
            TopoHeaderType::Req => {
                if self.is_site_master() {
                    if let Some(sender) = sender {
                        self.send_response_for(&sender);
                    }
                }
            }
            TopoHeaderType::Rsp => match bincode::deserialize::<Members>(&msg.payload) {
                Ok(members) => self.topo.handle_response(members),
                Err(e) => error!("{}: failed decoding topology response: {}", self.local, e),
            },
        }
    }

    fn send_response_for(&self, dest: &Addr) {
        let members = self.members.read().clone();
        let masters = self.site_masters.read().clone();
        let mut advertisement = Members::new(self.opts.site.clone());
        for member in &members {
            let Some(node) = member.addr.node_id() else { continue };
            advertisement.add_joined(MemberInfo {
                site: self.opts.site.clone(),
                addr: SiteAddr::member(node, self.opts.site.clone()),
                is_site_master: masters.contains(&node),
            });
        }
        let payload = match bincode::serialize(&advertisement) {
            Ok(p) => p,
            Err(e) => {
                error!("{}: failed encoding topology response: {}", self.local, e);
                return;
            }
        };
        let mut rsp = Message::to(dest.clone()).with_payload(payload);
        rsp.put_topo_header(TopoHeader::rsp());
        if let Err(e) = self.down(rsp) {
            debug!("{}: failed sending topology response: {}", self.local, e);
        }
    }

    // ------------------------------------------------------------------------
    // MULTICAST RELAYING
    // ------------------------------------------------------------------------

    /// Relays a multicast to every routed site not yet visited. The
    /// visited set attached to outgoing relays covers the local site, all
    /// sites targeted in this round and anything inherited from the
    /// header, so downstream relays cannot echo the message back.
    fn send_to_bridges(&self, msg: &Message) {
        let Some(relayer) = self.relayer.read().clone() else { return };
        let routes = relayer.routes_snapshot();
        if routes.is_empty() {
            return;
        }
        let hdr = msg.relay_header();
        let original_sender = hdr.and_then(|h| h.original_sender.clone()).unwrap_or_else(|| {
            let node = msg.src.as_ref().and_then(|a| a.node_id()).unwrap_or(self.local);
            SiteAddr::member(node, self.opts.site.clone())
        });

        let mut visited: BTreeSet<String> = routes.keys().cloned().collect();
        let mut to_visit: BTreeSet<String> = routes.keys().cloned().collect();
        visited.insert(self.opts.site.clone());
        to_visit.remove(&self.opts.site);
        if let Some(inherited) = hdr.and_then(|h| h.visited_sites.as_ref()) {
            for site in inherited {
                visited.insert(site.clone());
                to_visit.remove(site);
            }
        }

        for dest_site in &to_visit {
            let Some(candidates) = routes.get(dest_site) else { continue };
            // Try routes in order; stop at the first successful send.
            for route in candidates {
                trace!(
                    "{}: relaying multicast from {} via {}",
                    self.local, original_sender, route
                );
                match route.send_with_visited(None, &original_sender, msg, Some(&visited)) {
                    Ok(()) => break,
                    Err(e) => {
                        error!(
                            "{}: failed relaying multicast from {} via {}: {}",
                            self.local, original_sender, route, e
                        );
                    }
                }
            }
        }
    }

    /// Broadcasts SITES_UP/SITES_DOWN to the local cluster if this node
    /// narrates route changes.
    fn sites_change(&self, down: bool, sites: &[String]) {
        if !self.broadcast_route_notifications.load(Ordering::Acquire) || sites.is_empty() {
            return;
        }
        let ty = if down { RelayHeaderType::SitesDown } else { RelayHeaderType::SitesUp };
        let mut msg = Message::multicast();
        msg.put_relay_header(RelayHeader::new(ty).with_sites(sites.iter().cloned()));
        if let Err(e) = self.send_down(msg) {
            debug!("{}: failed broadcasting route notification: {}", self.local, e);
        }
    }

    // ------------------------------------------------------------------------
    // LOCAL DELIVERY
    // ------------------------------------------------------------------------

    /// Strips the relay header and hands the message to the delegate.
    /// Topology exchanges are intercepted here.
    fn deliver(&self, dest: Option<Addr>, sender: Option<Addr>, msg: &Message) {
        if msg.topo_header().is_some() {
            self.handle_topo(sender, msg);
            return;
        }
        let mut copy = msg.stripped_copy();
        copy.dest = dest;
        copy.src = sender;
        trace!("{}: delivering message from {:?}", self.local, copy.src);
        match self.delegate.read().clone() {
            Some(delegate) => delegate.deliver(copy),
            None => debug!("{}: no delegate registered; message dropped", self.local),
        }
    }

    // ------------------------------------------------------------------------
    // VIEWS & ELECTION
    // ------------------------------------------------------------------------

    fn handle_view(&self, view: View) {
        debug!("{}: new view {}", self.local, view);
        *self.members.write() = view.members.clone();

        let mut max_num_site_masters = self.opts.max_site_masters;
        if self.opts.site_masters_ratio > 0.0 {
            max_num_site_masters = std::cmp::max(
                max_num_site_masters,
                (self.opts.site_masters_ratio * view.len() as f64) as usize,
            );
        }

        let new_masters = determine_site_masters(&view, max_num_site_masters);
        let old_masters = self.site_masters.read().clone();
        let became = new_masters.contains(&self.local) && !old_masters.contains(&self.local);
        let cease = old_masters.contains(&self.local) && !new_masters.contains(&self.local);
        *self.site_masters.write() = new_masters.clone();

        if new_masters.first() == Some(&self.local) {
            self.broadcast_route_notifications.store(true, Ordering::Release);
        }

        if became {
            self.is_site_master.store(true, Ordering::Release);
            let bridge_name = format!("_{}", self.local.short());
            let old = self.relayer.write().take();
            if let Some(old) = old {
                old.stop();
            }
            let relayer = Relayer::new(
                self.opts.site.clone(),
                self.opts.forwards.clone(),
                Arc::clone(&self.counters),
                self.weak_self.clone() as Weak<dyn BridgeEvents>,
            );
            *self.relayer.write() = Some(Arc::clone(&relayer));
            let site_config = self.opts.local_site_config().cloned().unwrap_or_default();
            let connector = Arc::clone(&self.connector);
            let local = self.local;
            if self.opts.async_relay_creation {
                std::thread::spawn(move || {
                    start_relayer(&relayer, &site_config, &connector, &bridge_name, local);
                });
            } else {
                start_relayer(&relayer, &site_config, &connector, &bridge_name, local);
            }
            self.notify_site_master_listener(true);
        } else if cease {
            self.is_site_master.store(false, Ordering::Release);
            self.notify_site_master_listener(false);
            trace!("{}: ceased to be site master; closing bridges", self.local);
            let relayer = self.relayer.write().take();
            if let Some(relayer) = relayer {
                relayer.stop();
            }
        }

        if let Some(suppress) = &self.suppress_no_route {
            suppress.remove_expired(self.opts.suppress_window());
        }
        self.topo.adjust(&self.opts.site, &view.members, &new_masters);
    }

    fn notify_site_master_listener(&self, flag: bool) {
        if let Some(listener) = self.site_master_listener.read().clone() {
            listener(flag);
        }
    }
}

fn start_relayer(
    relayer: &Arc<Relayer>,
    site_config: &SiteConfig,
    connector: &Arc<dyn Connector>,
    bridge_name: &str,
    local: NodeId,
) {
    trace!("{}: became site master; starting bridges", local);
    if let Err(e) = relayer.start(site_config, connector, bridge_name, local) {
        error!("{}: failed starting relayer: {}", local, e);
    }
}

/// Walks the view in order, selecting members whose site-master flag is
/// set (untagged members always qualify), up to `max_num_site_masters`.
/// Falls back to the coordinator if nobody qualifies. Deterministic:
/// identical views yield identical selections.
pub fn determine_site_masters(view: &View, max_num_site_masters: usize) -> Vec<NodeId> {
    let mut result = Vec::new();
    for member in &view.members {
        if let Some(flags) = member.flags {
            if !flags.contains(AddrFlags::CAN_BECOME_SITE_MASTER) {
                continue;
            }
        }
        let Some(node) = member.addr.node_id() else { continue };
        if result.len() < max_num_site_masters {
            result.push(node);
        } else {
            break;
        }
    }
    if result.is_empty() {
        if let Some(coord) = view.coord().and_then(|a| a.node_id()) {
            result.push(coord);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::config::SiteConfig;
    use crate::transport::LocalNetwork;

    fn tagged_member(can_become: bool) -> (ViewMember, NodeId) {
        let node = NodeId::random();
        let mut flags = AddrFlags::default();
        if can_become {
            flags.set(AddrFlags::CAN_BECOME_SITE_MASTER);
        }
        (ViewMember::tagged(Addr::Node(node), flags), node)
    }

    #[test]
    fn test_election_respects_cap_and_order() {
        let nodes: Vec<NodeId> = (0..4).map(|_| NodeId::random()).collect();
        let members = nodes.iter().map(|n| ViewMember::untagged(Addr::Node(*n))).collect();
        let view = View::new(1, members);

        assert_eq!(determine_site_masters(&view, 1), vec![nodes[0]]);
        assert_eq!(determine_site_masters(&view, 2), vec![nodes[0], nodes[1]]);
        assert_eq!(determine_site_masters(&view, 10), nodes);
    }

    #[test]
    fn test_election_skips_flagless_members() {
        let (a, node_a) = tagged_member(true);
        let (b, node_b) = tagged_member(true);
        let (c, _) = tagged_member(false);
        let view = View::new(1, vec![a, b, c]);
        assert_eq!(determine_site_masters(&view, 2), vec![node_a, node_b]);
    }

    #[test]
    fn test_election_falls_back_to_coordinator() {
        let (a, node_a) = tagged_member(false);
        let (b, _) = tagged_member(false);
        let (c, _) = tagged_member(false);
        let view = View::new(1, vec![a, b, c]);
        assert_eq!(determine_site_masters(&view, 2), vec![node_a]);
    }

    #[test]
    fn test_election_is_deterministic() {
        let nodes: Vec<NodeId> = (0..5).map(|_| NodeId::random()).collect();
        let members: Vec<ViewMember> =
            nodes.iter().map(|n| ViewMember::untagged(Addr::Node(*n))).collect();
        let view = View::new(7, members);
        let first = determine_site_masters(&view, 3);
        for _ in 0..10 {
            assert_eq!(determine_site_masters(&view, 3), first);
        }
    }

    fn engine(net: &LocalNetwork, site: &str, cluster: &str) -> RelayEngine {
        let opts = RelayOptions::new(site)
            .cluster(cluster)
            .async_relay_creation(false)
            .add_site(site, SiteConfig::default());
        RelayEngine::new(opts, Arc::new(net.clone())).unwrap()
    }

    #[test]
    fn test_unknown_picker_is_fatal() {
        let net = LocalNetwork::new();
        let opts = RelayOptions::new("LON")
            .add_site("LON", SiteConfig::default())
            .site_master_picker("no-such-picker");
        let result = RelayEngine::new(opts, Arc::new(net));
        assert!(matches!(result, Err(ConfigError::UnknownPicker(_))));
    }

    #[test]
    fn test_lifecycle() {
        let net = LocalNetwork::new();
        let engine = engine(&net, "LON", "lon-cluster");
        assert!(!engine.is_running());

        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(RelayError::AlreadyRunning)));

        // Sole member: elected site master immediately.
        assert!(engine.is_site_master());
        assert_eq!(engine.site_masters(), vec![engine.local_addr()]);
        assert!(engine.broadcast_route_notifications());

        engine.stop();
        assert!(!engine.is_running());
        assert!(!engine.is_site_master());
    }

    #[test]
    fn test_second_member_is_not_site_master() {
        let net = LocalNetwork::new();
        let first = engine(&net, "LON", "lon-cluster");
        first.start().unwrap();
        let second = engine(&net, "LON", "lon-cluster");
        second.start().unwrap();

        assert!(first.is_site_master());
        assert!(!second.is_site_master());
        assert_eq!(first.site_masters(), second.site_masters());
    }

    #[test]
    fn test_view_application_is_idempotent() {
        let net = LocalNetwork::new();
        let engine = engine(&net, "LON", "lon-cluster");
        engine.start().unwrap();

        let masters_before = engine.site_masters();
        let view = View::new(99, engine.members());
        engine.handle_view(view.clone());
        engine.handle_view(view);
        assert_eq!(engine.site_masters(), masters_before);
        assert!(engine.is_site_master());
    }

    #[test]
    fn test_site_master_listener_fires_on_transitions() {
        let net = LocalNetwork::new();
        let engine = engine(&net, "LON", "lon-cluster");
        let events: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        engine.set_site_master_listener(Some(Arc::new(move |flag| sink.lock().push(flag))));

        engine.start().unwrap();
        assert_eq!(events.lock().as_slice(), &[true]);

        // A view without us: we cease to be site master.
        let other = NodeId::random();
        engine.handle_view(View::new(50, vec![ViewMember::untagged(Addr::Node(other))]));
        assert_eq!(events.lock().as_slice(), &[true, false]);
    }

    #[test]
    fn test_ratio_raises_master_count() {
        let nodes: Vec<NodeId> = (0..10).map(|_| NodeId::random()).collect();
        let members: Vec<ViewMember> =
            nodes.iter().map(|n| ViewMember::untagged(Addr::Node(*n))).collect();
        let view = View::new(1, members);
        // max(1, 10 * 0.3) = 3
        let max = std::cmp::max(1, (0.3 * view.len() as f64) as usize);
        assert_eq!(determine_site_masters(&view, max).len(), 3);
    }

    #[test]
    fn test_non_site_dest_passes_through() {
        let net = LocalNetwork::new();
        let a = engine(&net, "LON", "lon-cluster");
        a.start().unwrap();
        let b = engine(&net, "LON", "lon-cluster");
        b.start().unwrap();

        #[derive(Default)]
        struct Collect(Mutex<Vec<Message>>);
        impl RelayDelegate for Collect {
            fn deliver(&self, msg: Message) {
                self.0.lock().push(msg);
            }
            fn site_unreachable(&self, _site: &str) {}
        }
        let sink = Arc::new(Collect::default());
        b.set_delegate(Some(sink.clone()));

        a.send(Message::to(b.local_addr()).with_payload(vec![7])).unwrap();
        let msgs = sink.0.lock();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, vec![7]);
        // No relay header was involved.
        assert!(msgs[0].relay_header().is_none());
    }
}
