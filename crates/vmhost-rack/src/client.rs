//! The RPC seam to hypervisor drivers running behind a rack controller.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use vmhost_state::{InstanceRef, PodHints, RackId};

use crate::error::RpcResult;
use crate::payload::{ComposedMachine, Discovery, PodContext, RequestedMachine};

/// Boxed future alias for rack RPC results.
pub type RpcFuture<'a, T> = Pin<Box<dyn Future<Output = RpcResult<T>> + Send + 'a>>;

/// Calls a rack controller relays to the pod's driver.
///
/// Implementations own transport and encoding. They apply no timeout of their
/// own; callers bound each call.
pub trait RackClient: Send + Sync {
    /// Query the hypervisor for capacity, hints and topology.
    ///
    /// A host that belongs to a cluster answers for every member.
    fn discover_pod<'a>(&'a self, pod: &'a PodContext) -> RpcFuture<'a, Discovery>;

    /// Create a VM. Returns it along with the driver's post-compose hints.
    fn compose_machine<'a>(
        &'a self,
        pod: &'a PodContext,
        request: &'a RequestedMachine,
    ) -> RpcFuture<'a, ComposedMachine>;

    /// Tear down a VM. Returns the driver's post-decompose hints.
    fn decompose_machine<'a>(
        &'a self,
        pod: &'a PodContext,
        instance: &'a InstanceRef,
    ) -> RpcFuture<'a, PodHints>;
}

/// A live channel to one rack controller.
#[derive(Clone)]
pub struct RackHandle {
    pub rack_id: RackId,
    pub client: Arc<dyn RackClient>,
}

impl RackHandle {
    pub fn new(rack_id: impl Into<RackId>, client: Arc<dyn RackClient>) -> Self {
        Self {
            rack_id: rack_id.into(),
            client,
        }
    }
}

impl fmt::Debug for RackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RackHandle")
            .field("rack_id", &self.rack_id)
            .finish_non_exhaustive()
    }
}
