//! Error types for the pod registry.

use thiserror::Error;

use crate::types::{MachineId, PodId};

/// Result type alias for registry operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("pod {0} not found")]
    PodNotFound(PodId),

    #[error("machine {machine_id} not found on pod {pod_id}")]
    MachineNotFound { pod_id: PodId, machine_id: MachineId },
}
