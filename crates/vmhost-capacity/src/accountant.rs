//! Hint bookkeeping.
//!
//! Hints never exceed effective capacity and never go below zero. Validation
//! is the only user-facing gate; a debit that would underflow means the gate
//! was skipped or wrong, and panics.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use vmhost_rack::RequestedMachine;
use vmhost_state::{Machine, Pod, PodCapacity, PodHints, PodLockGuard};

use crate::error::{CapacityError, CapacityResult, Resource};

/// Resources consumed or released by one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceAmount {
    pub cores: u64,
    pub memory: u64,
    pub local_storage: u64,
}

impl ResourceAmount {
    pub fn from_request(request: &RequestedMachine) -> Self {
        Self {
            cores: request.cores,
            memory: request.memory,
            local_storage: request.local_storage(),
        }
    }

    pub fn from_machine(machine: &Machine) -> Self {
        Self {
            cores: machine.cores,
            memory: machine.memory,
            local_storage: machine.local_storage(),
        }
    }
}

/// Capacity offered for compose after over-commit.
///
/// Cores and memory are scaled by their ratios (rounded down). Local storage
/// and cpu speed are never over-committed.
pub fn effective_capacity(pod: &Pod) -> PodCapacity {
    PodCapacity {
        cores: scale(pod.capacity.cores, pod.over_commit.cpu),
        memory: scale(pod.capacity.memory, pod.over_commit.memory),
        local_storage: pod.capacity.local_storage,
        cpu_speed: pod.capacity.cpu_speed,
    }
}

fn scale(value: u64, ratio: f64) -> u64 {
    if !ratio.is_finite() || ratio <= 0.0 {
        return 0;
    }
    (value as f64 * ratio).floor() as u64
}

/// Check a resolved request against the pod's current hints.
///
/// Cores, memory and total storage are gated; cpu speed is not. Disks pinned
/// to a storage pool must also fit in that pool's free space.
pub fn validate(pod: &Pod, request: &RequestedMachine) -> CapacityResult<()> {
    gate(Resource::Cores, request.cores, pod.hints.cores)?;
    gate(Resource::Memory, request.memory, pod.hints.memory)?;
    let storage = total_size(request.disks.iter().map(|disk| disk.size))
        .ok_or_else(|| storage_overflow(pod))?;
    gate(Resource::LocalStorage, storage, pod.hints.local_storage)?;

    let mut per_pool: BTreeMap<&str, u64> = BTreeMap::new();
    for disk in &request.disks {
        if let Some(pool) = &disk.storage_pool {
            let sum = per_pool.entry(pool.as_str()).or_default();
            *sum = sum
                .checked_add(disk.size)
                .ok_or_else(|| storage_overflow(pod))?;
        }
    }
    for (name, requested) in per_pool {
        let pool = pod
            .storage_pool(name)
            .ok_or_else(|| CapacityError::UnknownStoragePool(name.to_string()))?;
        if requested > pool.free() {
            return Err(CapacityError::StoragePoolExhausted {
                pool: name.to_string(),
                requested,
                available: pool.free(),
            });
        }
    }
    Ok(())
}

fn total_size(sizes: impl IntoIterator<Item = u64>) -> Option<u64> {
    sizes
        .into_iter()
        .try_fold(0u64, |sum, size| sum.checked_add(size))
}

// Disk sizes adding up past u64::MAX can never fit any pod.
fn storage_overflow(pod: &Pod) -> CapacityError {
    debug!(pod_id = pod.id, "requested disk sizes overflow");
    CapacityError::Exceeded {
        resource: Resource::LocalStorage,
        requested: u64::MAX,
        available: pod.hints.local_storage,
    }
}

fn gate(resource: Resource, requested: u64, available: u64) -> CapacityResult<()> {
    if requested > available {
        debug!(%resource, requested, available, "capacity gate rejected request");
        return Err(CapacityError::Exceeded {
            resource,
            requested,
            available,
        });
    }
    Ok(())
}

/// Subtract consumed resources from the hints.
///
/// # Panics
///
/// If any hint would go below zero, or `lock` guards a different pod.
pub fn debit(pod: &mut Pod, lock: &PodLockGuard, consumed: ResourceAmount) {
    check_lock(pod, lock);
    let hints = &mut pod.hints;
    hints.cores = take(pod.id, Resource::Cores, hints.cores, consumed.cores);
    hints.memory = take(pod.id, Resource::Memory, hints.memory, consumed.memory);
    hints.local_storage = take(
        pod.id,
        Resource::LocalStorage,
        hints.local_storage,
        consumed.local_storage,
    );
}

fn take(pod_id: u64, resource: Resource, hint: u64, amount: u64) -> u64 {
    match hint.checked_sub(amount) {
        Some(left) => left,
        None => panic!(
            "hint underflow on pod {pod_id}: debiting {amount} {resource} from {hint}"
        ),
    }
}

/// Add released resources back to the hints, capped at effective capacity.
///
/// # Panics
///
/// If `lock` guards a different pod.
pub fn credit(pod: &mut Pod, lock: &PodLockGuard, released: ResourceAmount) {
    check_lock(pod, lock);
    let ceiling = effective_capacity(pod);
    let hints = &mut pod.hints;
    hints.cores = hints.cores.saturating_add(released.cores).min(ceiling.cores);
    hints.memory = hints.memory.saturating_add(released.memory).min(ceiling.memory);
    hints.local_storage = hints
        .local_storage
        .saturating_add(released.local_storage)
        .min(ceiling.local_storage);
}

/// Set hints straight from a driver answer, clamped to effective capacity.
///
/// The driver's figures win over locally tracked deltas. Values above the
/// ceiling are clamped and logged.
///
/// # Panics
///
/// If `lock` guards a different pod.
pub fn replace(pod: &mut Pod, lock: &PodLockGuard, reported: PodHints) {
    check_lock(pod, lock);
    let ceiling = effective_capacity(pod);
    let clamped = PodHints {
        cores: reported.cores.min(ceiling.cores),
        memory: reported.memory.min(ceiling.memory),
        local_storage: reported.local_storage.min(ceiling.local_storage),
        cpu_speed: reported.cpu_speed.min(ceiling.cpu_speed),
    };
    if clamped != reported {
        warn!(
            pod_id = pod.id,
            ?reported,
            ?ceiling,
            "driver hints exceed effective capacity; clamped"
        );
    }
    pod.hints = clamped;
}

fn check_lock(pod: &Pod, lock: &PodLockGuard) {
    assert_eq!(
        lock.pod_id(),
        pod.id,
        "hints of pod {} mutated under the lock of pod {}",
        pod.id,
        lock.pod_id()
    );
}
