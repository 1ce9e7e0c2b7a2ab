//! vmhost-rack — rack controllers and the RPC boundary.
//!
//! Rack controllers are agents with network reachability to a pod's
//! hypervisor. Every discover, compose and decompose call is relayed through
//! one of them via the [`RackClient`] trait. The [`RackConnectionPool`]
//! tracks which controllers currently hold a live channel and which of them
//! are known to route to a given pod.
//!
//! Driver-specific details stay behind this boundary: payloads carry a
//! [`vmhost_state::PodType`] resolved once, plus tagged variants
//! ([`vmhost_state::InstanceRef`], [`DriverFacts`]) for the per-driver parts.

pub mod client;
pub mod error;
pub mod payload;
pub mod pool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{RackClient, RackHandle, RpcFuture};
pub use error::{PoolError, PoolResult, RpcError, RpcResult};
pub use payload::*;
pub use pool::RackConnectionPool;
