//! Cache of member information per site, refreshed through the
//! TOPO_REQ/TOPO_RSP exchange. Has no effect on routing decisions.

use crate::address::{NodeId, SiteAddr, ViewMember};
use crate::relay::header::{MemberInfo, Members};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

type SiteEntries = BTreeMap<String, HashMap<SiteAddr, MemberInfo>>;

pub struct Topology {
    cache: Mutex<SiteEntries>,
    changed: Condvar,
}

impl Topology {
    pub fn new() -> Self {
        Topology { cache: Mutex::new(BTreeMap::new()), changed: Condvar::new() }
    }

    /// Rebuilds the local site's entries from the current cluster view.
    pub fn adjust(&self, local_site: &str, members: &[ViewMember], site_masters: &[NodeId]) {
        let mut entries = HashMap::with_capacity(members.len());
        for member in members {
            let Some(node) = member.addr.node_id() else { continue };
            let addr = SiteAddr::member(node, local_site);
            entries.insert(
                addr.clone(),
                MemberInfo {
                    site: local_site.to_string(),
                    addr,
                    is_site_master: site_masters.contains(&node),
                },
            );
        }
        self.cache.lock().insert(local_site.to_string(), entries);
        self.changed.notify_all();
    }

    /// Merges a peer's advertisement of another site's membership.
    pub fn handle_response(&self, members: Members) {
        let entries = members
            .joined
            .into_iter()
            .map(|info| (info.addr.clone(), info))
            .collect::<HashMap<_, _>>();
        self.cache.lock().insert(members.site, entries);
        self.changed.notify_all();
    }

    /// Drops entries for failed sites.
    pub fn remove_all<S: AsRef<str>>(&self, sites: &[S]) {
        let mut cache = self.cache.lock();
        for site in sites {
            cache.remove(site.as_ref());
        }
    }

    /// Blocks until the cache holds an entry for `site`, up to `timeout`.
    pub fn wait_for(&self, site: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cache = self.cache.lock();
        loop {
            if cache.contains_key(site) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let result = self.changed.wait_for(&mut cache, deadline - now);
            if result.timed_out() {
                return cache.contains_key(site);
            }
        }
    }

    pub fn sites(&self) -> Vec<String> {
        self.cache.lock().keys().cloned().collect()
    }

    pub fn members_of(&self, site: &str) -> Option<Vec<MemberInfo>> {
        self.cache.lock().get(site).map(|m| m.values().cloned().collect())
    }

    /// Renders one site, or every site when `site` is `None`.
    pub fn print(&self, site: Option<&str>) -> String {
        let cache = self.cache.lock();
        let mut out = String::new();
        for (name, members) in cache.iter() {
            if let Some(wanted) = site {
                if wanted != name {
                    continue;
                }
            }
            let mut lines: Vec<String> = members
                .values()
                .map(|info| {
                    if info.is_site_master {
                        format!("{} (site master)", info.addr)
                    } else {
                        info.addr.to_string()
                    }
                })
                .collect();
            lines.sort();
            let _ = writeln!(out, "{}: {}", name, lines.join(", "));
        }
        out
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}
