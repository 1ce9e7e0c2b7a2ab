//! Errors raised at the rack boundary.

use std::time::Duration;

use thiserror::Error;
use vmhost_state::PodId;

pub type RpcResult<T> = Result<T, RpcError>;
pub type PoolResult<T> = Result<T, PoolError>;

/// Failure of a single RPC relayed through one rack controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The rack controller has no driver for this pod type.
    #[error("'{0}' is an unknown pod type")]
    UnknownPodType(String),

    /// The driver exists but does not support the requested method.
    #[error("'{pod_type}' driver does not implement the '{method}' method")]
    NotImplemented { pod_type: String, method: String },

    #[error("Failed to complete pod action: {0}")]
    ActionFailed(String),

    #[error("Could not authenticate to pod: {0}")]
    Auth(String),

    #[error("Could not contact pod: {0}")]
    Connection(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Anything else the rack controller reported.
    #[error("Failed talking to pod: {0}")]
    Remote(String),
}

impl RpcError {
    /// Rank used to pick one error to surface when every rack failed.
    ///
    /// Driver action failures (including auth and connection problems raised
    /// by the driver) outrank a missing method, which outranks an unknown pod
    /// type, which outranks everything else.
    pub fn severity(&self) -> u8 {
        match self {
            RpcError::ActionFailed(_) | RpcError::Auth(_) | RpcError::Connection(_) => 3,
            RpcError::NotImplemented { .. } => 2,
            RpcError::UnknownPodType(_) => 1,
            RpcError::Timeout(_) | RpcError::Remote(_) => 0,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }
}

/// Errors from the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no rack controller has a live channel to pod {0}")]
    NoChannel(PodId),
}
