//! Capacity error types.

use std::fmt;

use thiserror::Error;

/// A resource subject to the pre-flight capacity gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Cores,
    Memory,
    LocalStorage,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cores => f.write_str("cores"),
            Resource::Memory => f.write_str("MiB of memory"),
            Resource::LocalStorage => f.write_str("bytes of local storage"),
        }
    }
}

/// Errors raised while resolving or validating a compose request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("requested {requested} {resource} but the pod only has {available} available")]
    Exceeded {
        resource: Resource,
        requested: u64,
        available: u64,
    },

    #[error("requested {requested} bytes from storage pool '{pool}' but it only has {available} free")]
    StoragePoolExhausted {
        pool: String,
        requested: u64,
        available: u64,
    },

    #[error("architecture '{0}' is not supported by the pod")]
    UnsupportedArchitecture(String),

    #[error("pod reports no architectures; refresh it before composing")]
    NoArchitectures,

    #[error("unknown storage pool '{0}'")]
    UnknownStoragePool(String),

    #[error("invalid compose request: {0}")]
    Invalid(String),
}

impl CapacityError {
    /// Whether the failure is a capacity mismatch rather than a malformed request.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            CapacityError::Exceeded { .. } | CapacityError::StoragePoolExhausted { .. }
        )
    }
}

pub type CapacityResult<T> = Result<T, CapacityError>;
