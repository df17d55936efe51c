//! Site-master and route selection plugins.

use crate::address::{Addr, NodeId};
use crate::relay::route::Route;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Chooses among multiple site masters and among multiple routes to the
/// same site. The original sender is available for sticky strategies.
pub trait SiteMasterPicker: Send + Sync {
    fn pick_site_master(
        &self,
        site_masters: &[NodeId],
        original_sender: Option<&Addr>,
    ) -> Option<NodeId>;

    fn pick_route(&self, routes: &[Arc<Route>], original_sender: Option<&Addr>)
        -> Option<Arc<Route>>;
}

/// The default picker: uniform random choice.
pub struct RandomSiteMasterPicker;

impl SiteMasterPicker for RandomSiteMasterPicker {
    fn pick_site_master(
        &self,
        site_masters: &[NodeId],
        _original_sender: Option<&Addr>,
    ) -> Option<NodeId> {
        site_masters.choose(&mut rand::thread_rng()).copied()
    }

    fn pick_route(
        &self,
        routes: &[Arc<Route>],
        _original_sender: Option<&Addr>,
    ) -> Option<Arc<Route>> {
        routes.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Resolves a configured picker name. Unknown names fail configuration.
pub fn picker_from_name(name: &str) -> Option<Arc<dyn SiteMasterPicker>> {
    match name {
        "random" => Some(Arc::new(RandomSiteMasterPicker)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_picker_returns_member_of_list() {
        let picker = RandomSiteMasterPicker;
        let masters = vec![NodeId::random(), NodeId::random(), NodeId::random()];
        for _ in 0..20 {
            let picked = picker.pick_site_master(&masters, None).unwrap();
            assert!(masters.contains(&picked));
        }
    }

    #[test]
    fn test_random_picker_empty_list() {
        let picker = RandomSiteMasterPicker;
        assert!(picker.pick_site_master(&[], None).is_none());
        assert!(picker.pick_route(&[], None).is_none());
    }

    #[test]
    fn test_picker_registry() {
        assert!(picker_from_name("random").is_some());
        assert!(picker_from_name("round-robin").is_none());
    }
}
