//! Rack connection pool — tracks live rack controller channels.
//!
//! The pool only reports which channels are live. It performs no retries and
//! applies no timeouts. Route knowledge (which racks recently did or did not
//! reach a pod) is kept in memory and never persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};
use vmhost_state::{PodId, RackId};

use crate::client::{RackClient, RackHandle};
use crate::error::{PoolError, PoolResult};

#[derive(Debug, Default, Clone)]
struct PodRoutes {
    routable: BTreeSet<RackId>,
    unroutable: BTreeSet<RackId>,
}

#[derive(Default)]
struct PoolInner {
    racks: BTreeMap<RackId, Arc<dyn RackClient>>,
    routes: HashMap<PodId, PodRoutes>,
}

/// Set of live rack controller channels.
#[derive(Clone, Default)]
pub struct RackConnectionPool {
    inner: Arc<RwLock<PoolInner>>,
}

impl RackConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the live channel to a rack controller.
    pub fn connect(&self, rack_id: impl Into<RackId>, client: Arc<dyn RackClient>) {
        let rack_id = rack_id.into();
        let replaced = self.write().racks.insert(rack_id.clone(), client).is_some();
        info!(%rack_id, replaced, "rack controller connected");
    }

    /// Drop the channel to a rack controller. Returns true if it was live.
    pub fn disconnect(&self, rack_id: &str) -> bool {
        let removed = self.write().racks.remove(rack_id).is_some();
        if removed {
            info!(%rack_id, "rack controller disconnected");
        }
        removed
    }

    /// Ids of every rack with a live channel, in id order.
    pub fn live_racks(&self) -> Vec<RackId> {
        self.read().racks.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.read().racks.is_empty()
    }

    /// Every live channel, regardless of route knowledge.
    ///
    /// Discovery asks all of them, since a rack that failed last time may
    /// reach the pod now.
    pub fn all_channels(&self) -> Vec<RackHandle> {
        self.read()
            .racks
            .iter()
            .map(|(id, client)| RackHandle::new(id.clone(), client.clone()))
            .collect()
    }

    /// Live channels that may reach `pod_id`.
    ///
    /// Racks known to route to the pod come first, then racks with no route
    /// knowledge. Racks whose last discovery of the pod failed are left out.
    pub fn channels_for(&self, pod_id: PodId) -> Vec<RackHandle> {
        let inner = self.read();
        let routes = inner.routes.get(&pod_id).cloned().unwrap_or_default();

        let mut known = Vec::new();
        let mut unknown = Vec::new();
        for (id, client) in &inner.racks {
            let handle = RackHandle::new(id.clone(), client.clone());
            if routes.routable.contains(id) {
                known.push(handle);
            } else if !routes.unroutable.contains(id) {
                unknown.push(handle);
            }
        }
        known.extend(unknown);
        known
    }

    /// A single usable channel for `pod_id`.
    pub fn any_channel_for(&self, pod_id: PodId) -> PoolResult<RackHandle> {
        self.channels_for(pod_id)
            .into_iter()
            .next()
            .ok_or(PoolError::NoChannel(pod_id))
    }

    /// Record which racks reached the pod in the latest discovery.
    ///
    /// Replaces any previous knowledge for the pod.
    pub fn record_routes<R, U>(&self, pod_id: PodId, routable: R, unroutable: U)
    where
        R: IntoIterator<Item = RackId>,
        U: IntoIterator<Item = RackId>,
    {
        let routes = PodRoutes {
            routable: routable.into_iter().collect(),
            unroutable: unroutable.into_iter().collect(),
        };
        debug!(
            pod_id,
            routable = routes.routable.len(),
            unroutable = routes.unroutable.len(),
            "pod routes recorded"
        );
        self.write().routes.insert(pod_id, routes);
    }

    /// Forget route knowledge for a removed pod.
    pub fn forget_pod(&self, pod_id: PodId) {
        self.write().routes.remove(&pod_id);
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRackClient;

    fn pool_with(racks: &[&str]) -> RackConnectionPool {
        let pool = RackConnectionPool::new();
        for id in racks {
            pool.connect(*id, Arc::new(ScriptedRackClient::new()));
        }
        pool
    }

    fn ids(handles: &[RackHandle]) -> Vec<&str> {
        handles.iter().map(|h| h.rack_id.as_str()).collect()
    }

    #[test]
    fn empty_pool_has_no_channel() {
        let pool = RackConnectionPool::new();
        assert!(pool.channels_for(1).is_empty());
        assert_eq!(pool.any_channel_for(1).unwrap_err(), PoolError::NoChannel(1));
    }

    #[test]
    fn unknown_routes_return_every_rack_in_id_order() {
        let pool = pool_with(&["rack-b", "rack-a"]);
        assert_eq!(ids(&pool.channels_for(1)), vec!["rack-a", "rack-b"]);
    }

    #[test]
    fn routable_racks_come_first_and_unroutable_are_omitted() {
        let pool = pool_with(&["rack-a", "rack-b", "rack-c"]);
        pool.record_routes(1, ["rack-c".to_string()], ["rack-a".to_string()]);

        assert_eq!(ids(&pool.channels_for(1)), vec!["rack-c", "rack-b"]);
        assert_eq!(pool.any_channel_for(1).unwrap().rack_id, "rack-c");
        // Other pods are unaffected.
        assert_eq!(pool.channels_for(2).len(), 3);
        // Discovery still sees every rack.
        assert_eq!(pool.all_channels().len(), 3);
    }

    #[test]
    fn disconnect_removes_channel() {
        let pool = pool_with(&["rack-a"]);
        assert!(pool.disconnect("rack-a"));
        assert!(!pool.disconnect("rack-a"));
        assert!(pool.is_empty());
    }

    #[test]
    fn forget_pod_clears_routes() {
        let pool = pool_with(&["rack-a"]);
        pool.record_routes(1, Vec::new(), ["rack-a".to_string()]);
        assert!(pool.channels_for(1).is_empty());

        pool.forget_pod(1);
        assert_eq!(pool.channels_for(1).len(), 1);
    }
}
