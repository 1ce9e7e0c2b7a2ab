//! Discovery error types.

use std::collections::BTreeMap;

use thiserror::Error;
use vmhost_rack::RpcError;
use vmhost_state::{PodId, RackId};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("pod {0} not found")]
    PodNotFound(PodId),

    /// Every rack failed, or none was connected. The pod record is unchanged.
    #[error("{message}")]
    ClusterUnavailable {
        message: String,
        failures: BTreeMap<RackId, RpcError>,
    },

    #[error("state store error: {0}")]
    State(#[from] vmhost_state::StateError),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
