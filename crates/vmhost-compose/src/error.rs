//! Engine error types.

use std::collections::BTreeMap;

use thiserror::Error;
use vmhost_capacity::CapacityError;
use vmhost_discovery::DiscoveryError;
use vmhost_rack::RpcError;
use vmhost_state::{MachineId, PodId, PodType, RackId, StateError, UnknownPodType};

/// Errors surfaced by the composition engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pod {0} not found")]
    PodNotFound(PodId),

    #[error("machine {machine_id} not found on pod {pod_id}")]
    MachineNotFound { pod_id: PodId, machine_id: MachineId },

    #[error("a pod named '{0}' already exists")]
    DuplicateName(String),

    #[error("pod {existing} already registers this {pod_type} host")]
    DuplicateHost { existing: PodId, pod_type: PodType },

    #[error(transparent)]
    UnknownPodType(#[from] UnknownPodType),

    #[error("pod {0} is being deleted")]
    PodDeleting(PodId),

    /// The request does not fit the pod's current hints. No remote call was made.
    #[error("Unable to compose machine because: {0}")]
    CapacityExceeded(CapacityError),

    #[error("Unable to compose machine because: {0}")]
    InvalidRequest(CapacityError),

    /// No rack controller holds a live channel to the pod.
    #[error("pod {0} is unreachable: no rack controller can reach it")]
    PodUnreachable(PodId),

    #[error("{message}")]
    ClusterUnavailable {
        message: String,
        failures: BTreeMap<RackId, RpcError>,
    },

    /// The compose RPC failed or timed out. Nothing was changed locally.
    #[error("{message}")]
    ComposeFailed { message: String, source: RpcError },

    /// The decompose RPC failed. The machine is flagged for cleanup.
    #[error("{message}")]
    DecomposeFailed {
        machine_id: MachineId,
        message: String,
        source: RpcError,
    },

    #[error("machine {machine_id} on pod {pod_id} is not flagged for cleanup")]
    NotFlagged { pod_id: PodId, machine_id: MachineId },

    #[error("invalid pod update: {0}")]
    InvalidUpdate(String),

    #[error("operation on pod {0} was interrupted")]
    Interrupted(PodId),

    #[error("state store error: {0}")]
    State(StateError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub(crate) fn compose_failed(source: RpcError) -> Self {
        EngineError::ComposeFailed {
            message: rpc_failure_message("compose", &source),
            source,
        }
    }

    pub(crate) fn decompose_failed(machine_id: MachineId, source: RpcError) -> Self {
        EngineError::DecomposeFailed {
            machine_id,
            message: rpc_failure_message("decompose", &source),
            source,
        }
    }

    /// True when nothing was changed and the call may simply be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::PodUnreachable(_)
                | EngineError::ClusterUnavailable { .. }
                | EngineError::ComposeFailed { .. }
        )
    }
}

fn rpc_failure_message(action: &str, err: &RpcError) -> String {
    match err {
        RpcError::UnknownPodType(pod_type) => {
            format!("Unable to {action} machine because '{pod_type}' is an unknown pod type.")
        }
        RpcError::NotImplemented { pod_type, .. } => format!(
            "Unable to {action} machine because '{pod_type}' driver does not implement the '{action}' method."
        ),
        other => format!("Unable to {action} machine because: {other}"),
    }
}

impl From<StateError> for EngineError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::PodNotFound(id) => EngineError::PodNotFound(id),
            StateError::MachineNotFound { pod_id, machine_id } => {
                EngineError::MachineNotFound { pod_id, machine_id }
            }
            other => EngineError::State(other),
        }
    }
}

impl From<CapacityError> for EngineError {
    fn from(err: CapacityError) -> Self {
        if err.is_capacity() {
            EngineError::CapacityExceeded(err)
        } else {
            EngineError::InvalidRequest(err)
        }
    }
}

impl From<DiscoveryError> for EngineError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::PodNotFound(id) => EngineError::PodNotFound(id),
            DiscoveryError::ClusterUnavailable { message, failures } => {
                EngineError::ClusterUnavailable { message, failures }
            }
            DiscoveryError::State(e) => e.into(),
        }
    }
}
