//! Owns the bridges a site master maintains and the routing table derived
//! from their views.
//!
//! Each bridge joins a named inter-site cluster. Bridge views drive route
//! registration: a view member whose site differs from ours is a site
//! master of that site, so a route through this bridge is added; members
//! leaving take their routes with them. Route additions and removals are
//! reported to the engine so it can narrate them to the local cluster.

use crate::address::{Addr, NodeId, SiteAddr, View};
use crate::message::Message;
use crate::relay::config::{ForwardConfig, SiteConfig};
use crate::relay::picker::SiteMasterPicker;
use crate::relay::route::Route;
use crate::stats::RelayCounters;
use crate::transport::{Channel, Connector, Receiver, TransportError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

/// Engine callbacks driven by bridge traffic and bridge views.
pub(crate) trait BridgeEvents: Send + Sync {
    /// A message arrived over a bridge.
    fn relay_received(&self, msg: Message);

    /// Routes to `sites` came up (`up == true`) or went away.
    fn routes_changed(&self, up: bool, sites: &[String]);
}

/// The site master's bridge and route owner.
pub struct Relayer {
    local_site: String,
    forwards: Vec<ForwardConfig>,
    routes: RwLock<HashMap<String, Vec<Arc<Route>>>>,
    bridges: RwLock<Vec<Arc<dyn Channel>>>,
    counters: Arc<RelayCounters>,
    events: Weak<dyn BridgeEvents>,
    stopped: AtomicBool,
}

impl Relayer {
    pub(crate) fn new(
        local_site: impl Into<String>,
        forwards: Vec<ForwardConfig>,
        counters: Arc<RelayCounters>,
        events: Weak<dyn BridgeEvents>,
    ) -> Arc<Self> {
        Arc::new(Relayer {
            local_site: local_site.into(),
            forwards,
            routes: RwLock::new(HashMap::new()),
            bridges: RwLock::new(Vec::new()),
            counters,
            events,
            stopped: AtomicBool::new(false),
        })
    }

    /// Opens one bridge per configured entry, joining each inter-site
    /// cluster as a site-scoped member. A failing bridge is logged and
    /// skipped; the routes it would have carried stay absent until a
    /// later view triggers a retry.
    pub(crate) fn start(
        self: &Arc<Self>,
        site_config: &SiteConfig,
        connector: &Arc<dyn Connector>,
        bridge_name: &str,
        local_node: NodeId,
    ) -> Result<(), TransportError> {
        for bridge_cfg in &site_config.bridges {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(());
            }
            debug!(bridge = bridge_name, cluster = %bridge_cfg.cluster, "connecting bridge");
            let local_addr = Addr::Site(SiteAddr::member(local_node, self.local_site.clone()));
            let receiver = Arc::new(BridgeReceiver {
                relayer: Arc::downgrade(self),
                local_addr: local_addr.clone(),
                channel: Mutex::new(None),
                pending_view: Mutex::new(None),
                prev_view: Mutex::new(None),
            });
            match connector.connect(
                &bridge_cfg.cluster,
                local_addr,
                None,
                receiver.clone() as Arc<dyn Receiver>,
            ) {
                Ok(channel) => {
                    self.bridges.write().push(channel.clone());
                    receiver.set_channel(channel);
                }
                Err(e) => {
                    error!(cluster = %bridge_cfg.cluster, error = %e, "failed starting bridge");
                }
            }
        }
        Ok(())
    }

    /// Closes every bridge and clears the routing table.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // Closing a bridge triggers remote view callbacks; do it with no
        // lock held.
        let bridges: Vec<Arc<dyn Channel>> = self.bridges.write().drain(..).collect();
        for bridge in bridges {
            bridge.close();
        }
        self.routes.write().clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn handle_bridge_view(&self, channel: &Arc<dyn Channel>, view: View, prev: Option<View>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let remote = |v: &View| -> Vec<(String, Addr)> {
            v.members
                .iter()
                .filter_map(|m| match &m.addr {
                    Addr::Site(SiteAddr::Member(su)) if su.site != self.local_site => {
                        Some((su.site.clone(), m.addr.clone()))
                    }
                    _ => None,
                })
                .collect()
        };
        let current = remote(&view);
        let previous = prev.as_ref().map(|v| remote(v)).unwrap_or_default();

        let mut sites_up = Vec::new();
        let mut sites_down = Vec::new();
        {
            let mut routes = self.routes.write();
            for (site, addr) in &current {
                if previous.iter().any(|(_, a)| a == addr) {
                    continue;
                }
                let list = routes.entry(site.clone()).or_default();
                if list.iter().any(|r| r.site_master() == addr) {
                    continue;
                }
                trace!(site = %site, master = %addr, "adding route");
                if list.is_empty() {
                    sites_up.push(site.clone());
                }
                list.push(Arc::new(Route::new(
                    site.clone(),
                    channel.clone(),
                    addr.clone(),
                    Arc::clone(&self.counters),
                )));
            }
            for (site, addr) in &previous {
                if current.iter().any(|(_, a)| a == addr) {
                    continue;
                }
                if let Some(list) = routes.get_mut(site) {
                    trace!(site = %site, master = %addr, "removing route");
                    list.retain(|r| r.site_master() != addr);
                    if list.is_empty() {
                        routes.remove(site);
                        sites_down.push(site.clone());
                    }
                }
            }
        }
        if let Some(events) = self.events.upgrade() {
            if !sites_up.is_empty() {
                events.routes_changed(true, &sites_up);
            }
            if !sites_down.is_empty() {
                events.routes_changed(false, &sites_down);
            }
        }
    }

    fn on_bridge_message(&self, msg: Message) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Some(events) = self.events.upgrade() {
            events.relay_received(msg);
        }
    }

    /// The primary UP route to `site`, chosen by the picker when several
    /// are available.
    pub fn get_route(
        &self,
        site: &str,
        sender: Option<&Addr>,
        picker: &dyn SiteMasterPicker,
    ) -> Option<Arc<Route>> {
        let routes = self.routes.read();
        let list = routes.get(site)?;
        let ups: Vec<Arc<Route>> = list
            .iter()
            .filter(|r| r.status() == crate::relay::route::RouteStatus::Up)
            .cloned()
            .collect();
        match ups.len() {
            0 => None,
            1 => ups.into_iter().next(),
            _ => picker.pick_route(&ups, sender),
        }
    }

    /// Fallback lookup through a configured gateway site: the first
    /// forwarding rule matching `site` exactly or by wildcard.
    pub fn get_forwarding_route_matching(
        &self,
        site: &str,
        sender: Option<&Addr>,
        picker: &dyn SiteMasterPicker,
    ) -> Option<Arc<Route>> {
        let rule = self.forwards.iter().find(|f| f.to == site || f.to == "*")?;
        if rule.gateway == site {
            return None;
        }
        self.get_route(&rule.gateway, sender, picker)
    }

    /// Sites with at least one route, sorted.
    pub fn site_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn print_routes(&self) -> String {
        let routes = self.routes.read();
        let mut names: Vec<&String> = routes.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let descriptions: Vec<String> =
                routes[name].iter().map(|r| r.to_string()).collect();
            let _ = writeln!(out, "{}: {}", name, descriptions.join(", "));
        }
        out
    }

    /// Snapshot of the full routing table for multicast fan-out.
    pub fn routes_snapshot(&self) -> HashMap<String, Vec<Arc<Route>>> {
        self.routes.read().clone()
    }

    /// The membership view of a named bridge cluster, if we joined it.
    pub fn bridge_view(&self, cluster: &str) -> Option<View> {
        self.bridges.read().iter().find(|b| b.cluster() == cluster).map(|b| b.view())
    }
}

/// Per-bridge receiver. Holds only weak references back so bridge closure
/// never keeps the relayer alive.
struct BridgeReceiver {
    relayer: Weak<Relayer>,
    local_addr: Addr,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    /// A view delivered during connect, before the channel handle exists.
    pending_view: Mutex<Option<View>>,
    prev_view: Mutex<Option<View>>,
}

impl BridgeReceiver {
    fn set_channel(&self, channel: Arc<dyn Channel>) {
        *self.channel.lock() = Some(channel);
        let pending = self.pending_view.lock().take();
        if let Some(view) = pending {
            self.apply_view(view);
        }
    }

    fn apply_view(&self, view: View) {
        let Some(channel) = self.channel.lock().clone() else { return };
        let prev = self.prev_view.lock().replace(view.clone());
        if let Some(relayer) = self.relayer.upgrade() {
            relayer.handle_bridge_view(&channel, view, prev);
        }
    }
}

impl Receiver for BridgeReceiver {
    fn on_message(&self, msg: Message) {
        // Bridge multicasts loop back; drop our own.
        if msg.src.as_ref() == Some(&self.local_addr) {
            return;
        }
        if let Some(relayer) = self.relayer.upgrade() {
            relayer.on_bridge_message(msg);
        }
    }

    fn on_view(&self, view: View) {
        if self.channel.lock().is_none() {
            *self.pending_view.lock() = Some(view);
            return;
        }
        self.apply_view(view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::config::SiteConfig;
    use crate::relay::picker::RandomSiteMasterPicker;
    use crate::transport::LocalNetwork;

    #[derive(Default)]
    struct RecordingEvents {
        msgs: Mutex<Vec<Message>>,
        changes: Mutex<Vec<(bool, Vec<String>)>>,
    }

    impl BridgeEvents for RecordingEvents {
        fn relay_received(&self, msg: Message) {
            self.msgs.lock().push(msg);
        }
        fn routes_changed(&self, up: bool, sites: &[String]) {
            self.changes.lock().push((up, sites.to_vec()));
        }
    }

    fn started_relayer(
        net: &LocalNetwork,
        site: &str,
        cluster: &str,
    ) -> (Arc<Relayer>, Arc<RecordingEvents>, NodeId) {
        let events = Arc::new(RecordingEvents::default());
        let relayer = Relayer::new(
            site,
            Vec::new(),
            Arc::new(RelayCounters::new()),
            Arc::downgrade(&events) as Weak<dyn BridgeEvents>,
        );
        let node = NodeId::random();
        let connector: Arc<dyn Connector> = Arc::new(net.clone());
        relayer
            .start(&SiteConfig::with_bridge(cluster), &connector, "_test", node)
            .unwrap();
        (relayer, events, node)
    }

    #[test]
    fn test_routes_added_when_remote_master_joins() {
        let net = LocalNetwork::new();
        let (lon, lon_events, _) = started_relayer(&net, "LON", "bridge-1");
        assert!(lon.site_names().is_empty());

        let (sfo, _, _) = started_relayer(&net, "SFO", "bridge-1");
        assert_eq!(lon.site_names(), vec!["SFO".to_string()]);
        assert_eq!(sfo.site_names(), vec!["LON".to_string()]);
        assert_eq!(lon_events.changes.lock().as_slice(), &[(true, vec!["SFO".to_string()])]);

        let picker = RandomSiteMasterPicker;
        let route = lon.get_route("SFO", None, &picker).unwrap();
        assert_eq!(route.site(), "SFO");
        assert!(lon.get_route("TOK", None, &picker).is_none());
    }

    #[test]
    fn test_routes_removed_when_remote_master_leaves() {
        let net = LocalNetwork::new();
        let (lon, lon_events, _) = started_relayer(&net, "LON", "bridge-1");
        let (sfo, _, _) = started_relayer(&net, "SFO", "bridge-1");
        assert_eq!(lon.site_names(), vec!["SFO".to_string()]);

        sfo.stop();
        assert!(lon.site_names().is_empty());
        let changes = lon_events.changes.lock();
        assert_eq!(changes.last().unwrap(), &(false, vec!["SFO".to_string()]));
    }

    #[test]
    fn test_second_master_of_same_site_is_failover_route() {
        let net = LocalNetwork::new();
        let (lon, lon_events, _) = started_relayer(&net, "LON", "bridge-1");
        let (_sfo_a, _, _) = started_relayer(&net, "SFO", "bridge-1");
        let (_sfo_b, _, _) = started_relayer(&net, "SFO", "bridge-1");

        let snapshot = lon.routes_snapshot();
        assert_eq!(snapshot["SFO"].len(), 2);
        // Only the first one raised a sites-up notification.
        let ups: Vec<_> = lon_events.changes.lock().iter().filter(|(up, _)| *up).cloned().collect();
        assert_eq!(ups.len(), 1);
    }

    #[test]
    fn test_bridge_messages_reach_events_but_own_are_skipped() {
        let net = LocalNetwork::new();
        let (_lon, lon_events, _) = started_relayer(&net, "LON", "bridge-1");
        let (sfo, sfo_events, _) = started_relayer(&net, "SFO", "bridge-1");

        let picker = RandomSiteMasterPicker;
        let route = sfo.get_route("LON", None, &picker).unwrap();
        let sender = SiteAddr::master("SFO");
        route.send(None, &sender, &Message::multicast().with_payload(vec![3])).unwrap();

        // The multicast reached LON's receiver and not SFO's own.
        assert_eq!(lon_events.msgs.lock().len(), 1);
        assert!(sfo_events.msgs.lock().is_empty());
    }

    #[test]
    fn test_stop_clears_routes_and_closes_bridges() {
        let net = LocalNetwork::new();
        let (lon, _, _) = started_relayer(&net, "LON", "bridge-1");
        let (_sfo, _, _) = started_relayer(&net, "SFO", "bridge-1");
        assert!(!lon.site_names().is_empty());

        lon.stop();
        assert!(lon.is_stopped());
        assert!(lon.site_names().is_empty());
        assert!(lon.bridge_view("bridge-1").is_none());
        assert!(lon.routes_snapshot().is_empty());
    }

    #[test]
    fn test_forwarding_route() {
        let net = LocalNetwork::new();
        let events = Arc::new(RecordingEvents::default());
        let relayer = Relayer::new(
            "LON",
            vec![ForwardConfig { to: "TOK".into(), gateway: "SFO".into() }],
            Arc::new(RelayCounters::new()),
            Arc::downgrade(&events) as Weak<dyn BridgeEvents>,
        );
        let connector: Arc<dyn Connector> = Arc::new(net.clone());
        relayer
            .start(&SiteConfig::with_bridge("bridge-1"), &connector, "_test", NodeId::random())
            .unwrap();
        let (_sfo, _, _) = started_relayer(&net, "SFO", "bridge-1");

        let picker = RandomSiteMasterPicker;
        let route = relayer.get_forwarding_route_matching("TOK", None, &picker).unwrap();
        assert_eq!(route.site(), "SFO");
        assert!(relayer.get_forwarding_route_matching("NYC", None, &picker).is_none());
    }

    #[test]
    fn test_print_routes() {
        let net = LocalNetwork::new();
        let (lon, _, _) = started_relayer(&net, "LON", "bridge-1");
        let (_sfo, _, _) = started_relayer(&net, "SFO", "bridge-1");
        let printed = lon.print_routes();
        assert!(printed.contains("SFO:"));
        assert!(printed.contains("bridge-1"));
    }
}
