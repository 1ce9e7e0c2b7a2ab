//! Compose requests and their resolution against a pod.

use serde::{Deserialize, Serialize};
use vmhost_rack::{RequestedDisk, RequestedMachine};
use vmhost_state::Pod;

use crate::error::{CapacityError, CapacityResult};

const GIB: u64 = 1024 * 1024 * 1024;

/// Caller-supplied constraints for a new machine. Unset fields take defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeRequest {
    pub hostname: Option<String>,
    pub architecture: Option<String>,
    pub cores: Option<u64>,
    /// Memory in MiB.
    pub memory: Option<u64>,
    /// Informational only; never gated.
    pub cpu_speed: Option<u64>,
    /// Disk sizes in bytes. Empty means one default-sized disk.
    #[serde(default)]
    pub storage: Vec<u64>,
    /// Pin every disk to this storage pool (id or name).
    pub storage_pool: Option<String>,
    pub interfaces: Option<u32>,
    pub resource_pool: Option<String>,
    pub zone: Option<String>,
    #[serde(default)]
    pub skip_commissioning: bool,
}

impl ComposeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cores(mut self, cores: u64) -> Self {
        self.cores = Some(cores);
        self
    }

    pub fn with_memory(mut self, memory: u64) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_disk(mut self, size: u64) -> Self {
        self.storage.push(size);
        self
    }

    pub fn with_storage_pool(mut self, pool: &str) -> Self {
        self.storage_pool = Some(pool.to_string());
        self
    }

    pub fn with_architecture(mut self, architecture: &str) -> Self {
        self.architecture = Some(architecture.to_string());
        self
    }
}

/// Values used for fields a request leaves unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposeDefaults {
    pub cores: u64,
    pub memory: u64,
    pub disk_bytes: u64,
    pub interfaces: u32,
}

impl Default for ComposeDefaults {
    fn default() -> Self {
        Self {
            cores: 1,
            memory: 1024,
            disk_bytes: 8 * GIB,
            interfaces: 1,
        }
    }
}

/// Fill in defaults and check the request against the pod's static
/// properties (architectures, storage pools). Capacity is checked separately
/// by [`crate::validate`].
pub fn resolve(
    pod: &Pod,
    request: &ComposeRequest,
    defaults: &ComposeDefaults,
) -> CapacityResult<RequestedMachine> {
    let architecture = match &request.architecture {
        Some(arch) if pod.supports_architecture(arch) => arch.clone(),
        Some(arch) => return Err(CapacityError::UnsupportedArchitecture(arch.clone())),
        None => pod
            .architectures
            .first()
            .cloned()
            .ok_or(CapacityError::NoArchitectures)?,
    };

    let cores = request.cores.unwrap_or(defaults.cores);
    if cores == 0 {
        return Err(CapacityError::Invalid("cores must be at least 1".into()));
    }
    let memory = request.memory.unwrap_or(defaults.memory);
    if memory == 0 {
        return Err(CapacityError::Invalid("memory must be at least 1 MiB".into()));
    }

    let storage_pool = match &request.storage_pool {
        Some(wanted) => Some(
            pod.storage_pool(wanted)
                .map(|p| p.name.clone())
                .ok_or_else(|| CapacityError::UnknownStoragePool(wanted.clone()))?,
        ),
        None => None,
    };

    let sizes = if request.storage.is_empty() {
        vec![defaults.disk_bytes]
    } else {
        request.storage.clone()
    };
    if sizes.iter().any(|s| *s == 0) {
        return Err(CapacityError::Invalid("disk size must be non-zero".into()));
    }
    let disks = sizes
        .into_iter()
        .map(|size| RequestedDisk {
            size,
            storage_pool: storage_pool.clone(),
        })
        .collect();

    Ok(RequestedMachine {
        hostname: request.hostname.clone(),
        architecture,
        cores,
        memory,
        cpu_speed: request.cpu_speed,
        disks,
        interfaces: request.interfaces.unwrap_or(defaults.interfaces).max(1),
    })
}
