//! Pod service: the boundary the API layer calls.
//!
//! Wires the registry, rack pool, lock table, discovery coordinator and
//! composer together from an [`EngineConfig`]. Writes to a pod record happen
//! under that pod's composition lock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vmhost_capacity::ComposeRequest;
use vmhost_discovery::{DiscoveryCoordinator, DiscoveryError};
use vmhost_rack::RackConnectionPool;
use vmhost_state::*;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::notify::MachineNotifier;
use crate::orchestrator::{CleanupOutcome, Composer, DeleteReport};

/// Caller-declared properties of a new pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPod {
    /// Generated from the id when absent.
    pub name: Option<String>,
    /// Driver type tag, parsed here.
    pub pod_type: String,
    pub parameters: PodParameters,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub resource_pool: Option<String>,
    pub zone: Option<String>,
    pub over_commit: Option<OverCommit>,
    pub default_macvlan_mode: Option<String>,
}

/// Changes to caller-owned pod fields. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodUpdate {
    pub name: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    pub parameters: Option<PodParameters>,
    pub resource_pool: Option<String>,
    pub zone: Option<String>,
    pub over_commit: Option<OverCommit>,
    /// `Some(None)` clears the mode.
    pub default_macvlan_mode: Option<Option<String>>,
}

/// What `delete_pod` observed before its wait ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Finished(DeleteReport),
    /// Still running in the background; poll the pod to see when it is gone.
    Pending,
}

/// Pod lifecycle and composition entry points.
pub struct PodService {
    state: StateStore,
    racks: RackConnectionPool,
    locks: PodLocks,
    discovery: DiscoveryCoordinator,
    composer: Composer,
    config: EngineConfig,
    /// Serializes name/host uniqueness checks with the writes they guard.
    registration: Mutex<()>,
}

impl PodService {
    pub fn new(
        state: StateStore,
        racks: RackConnectionPool,
        notifier: Arc<dyn MachineNotifier>,
        config: EngineConfig,
    ) -> Self {
        let locks = PodLocks::new();
        let discovery = DiscoveryCoordinator::new(state.clone(), racks.clone(), locks.clone())
            .with_call_timeout(config.discovery_timeout());
        let composer = Composer::new(state.clone(), racks.clone(), locks.clone(), notifier)
            .with_defaults(config.compose_defaults())
            .with_compose_timeout(config.compose_timeout())
            .with_decompose_timeout(config.decompose_call_timeout())
            .with_skip_commissioning(config.compose.skip_commissioning);
        Self {
            state,
            racks,
            locks,
            discovery,
            composer,
            config,
            registration: Mutex::new(()),
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn racks(&self) -> &RackConnectionPool {
        &self.racks
    }

    pub fn locks(&self) -> &PodLocks {
        &self.locks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Pod lifecycle ──────────────────────────────────────────────

    /// Register a pod and run its initial discovery.
    ///
    /// If discovery fails on every rack the pod is still created with the
    /// declared properties and zero capacity; the failure is recorded in
    /// `sync_error`.
    pub async fn create_pod(&self, declared: NewPod) -> EngineResult<Pod> {
        let pod_type: PodType = declared.pod_type.parse()?;
        if let Some(oc) = &declared.over_commit {
            check_over_commit(oc)?;
        }

        let (pod, guard) = {
            let _registration = self.registration.lock().await;
            let parameters = &declared.parameters;
            self.ensure_unique(None, declared.name.as_deref(), pod_type, parameters)?;
            let id = self.state.allocate_id("pod")?;
            let name = match declared.name {
                Some(name) => name,
                None => {
                    let name = format!("pod-{id}");
                    self.ensure_unique(None, Some(&name), pod_type, parameters)?;
                    name
                }
            };

            let now = epoch_secs();
            let pod = Pod {
                id,
                name,
                pod_type,
                parameters: declared.parameters,
                capabilities: BTreeSet::new(),
                architectures: Vec::new(),
                capacity: PodCapacity::default(),
                hints: PodHints::default(),
                over_commit: declared.over_commit.unwrap_or_default(),
                tags: declared.tags,
                resource_pool: declared
                    .resource_pool
                    .unwrap_or_else(|| "default".to_string()),
                zone: declared.zone.unwrap_or_else(|| "default".to_string()),
                storage_pools: Vec::new(),
                default_macvlan_mode: declared.default_macvlan_mode,
                cluster: None,
                status: PodStatus::Ready,
                last_sync: None,
                sync_error: None,
                created_at: now,
                updated_at: now,
            };
            let guard = self.locks.acquire(id).await;
            self.state.put_pod(&pod)?;
            (pod, guard)
        };
        info!(pod_id = pod.id, name = %pod.name, pod_type = %pod.pod_type, "pod registered");

        self.resync(pod, &guard).await
    }

    /// Apply caller-owned changes, then re-run discovery.
    ///
    /// Like creation, a failed discovery is recorded on the pod rather than
    /// failing the update.
    pub async fn update_pod(&self, pod_id: PodId, changes: PodUpdate) -> EngineResult<Pod> {
        if let Some(oc) = &changes.over_commit {
            check_over_commit(oc)?;
        }
        let guard = self.locks.acquire(pod_id).await;
        let mut pod = self.state.require_pod(pod_id)?;

        {
            let _registration = self.registration.lock().await;
            let name = changes.name.clone().unwrap_or_else(|| pod.name.clone());
            let parameters = changes
                .parameters
                .clone()
                .unwrap_or_else(|| pod.parameters.clone());
            self.ensure_unique(Some(pod_id), Some(&name), pod.pod_type, &parameters)?;

            pod.name = name;
            pod.parameters = parameters;
            if let Some(tags) = changes.tags {
                pod.tags = tags;
            }
            if let Some(pool) = changes.resource_pool {
                pod.resource_pool = pool;
            }
            if let Some(zone) = changes.zone {
                pod.zone = zone;
            }
            if let Some(mode) = changes.default_macvlan_mode {
                pod.default_macvlan_mode = mode;
            }
            if let Some(oc) = changes.over_commit {
                pod.over_commit = oc;
                // Lowered ratios may put the current hints above the new ceiling.
                let current = pod.hints;
                vmhost_capacity::replace(&mut pod, &guard, current);
            }
            pod.updated_at = epoch_secs();
            self.state.put_pod(&pod)?;
        }
        debug!(pod_id, "pod fields updated");

        self.resync(pod, &guard).await
    }

    /// Re-run discovery and return the reconciled pod.
    pub async fn refresh_pod(&self, pod_id: PodId) -> EngineResult<Pod> {
        Ok(self.discovery.refresh(pod_id).await?)
    }

    async fn resync(&self, mut pod: Pod, guard: &PodLockGuard) -> EngineResult<Pod> {
        match self.discovery.refresh_locked(guard).await {
            Ok(refreshed) => Ok(refreshed),
            Err(DiscoveryError::ClusterUnavailable { message, .. }) => {
                warn!(
                    pod_id = pod.id,
                    %message,
                    "discovery failed; pod saved without fresh capacity"
                );
                pod.sync_error = Some(message);
                self.state.put_pod(&pod)?;
                Ok(pod)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_unique(
        &self,
        own_id: Option<PodId>,
        name: Option<&str>,
        pod_type: PodType,
        parameters: &PodParameters,
    ) -> EngineResult<()> {
        for other in self.state.list_pods()? {
            if Some(other.id) == own_id {
                continue;
            }
            if let Some(name) = name.filter(|name| *name == other.name) {
                return Err(EngineError::DuplicateName(name.to_string()));
            }
            if other.pod_type == pod_type && &other.parameters == parameters {
                return Err(EngineError::DuplicateHost {
                    existing: other.id,
                    pod_type,
                });
            }
        }
        Ok(())
    }

    pub fn get_pod(&self, pod_id: PodId) -> EngineResult<Pod> {
        Ok(self.state.require_pod(pod_id)?)
    }

    pub fn list_pods(&self) -> EngineResult<Vec<Pod>> {
        Ok(self.state.list_pods()?)
    }

    pub fn list_machines(&self, pod_id: PodId) -> EngineResult<Vec<Machine>> {
        self.state.require_pod(pod_id)?;
        Ok(self.state.list_machines_for_pod(pod_id)?)
    }

    /// The pod's connection parameters. Admin only; not redacted.
    pub fn get_pod_parameters(&self, pod_id: PodId) -> EngineResult<PodParameters> {
        Ok(self.state.require_pod(pod_id)?.parameters)
    }

    // ── Tags ───────────────────────────────────────────────────────

    pub async fn add_tag(&self, pod_id: PodId, tag: &str) -> EngineResult<Pod> {
        self.edit_tags(pod_id, |tags| {
            tags.insert(tag.to_string());
        })
        .await
    }

    pub async fn remove_tag(&self, pod_id: PodId, tag: &str) -> EngineResult<Pod> {
        self.edit_tags(pod_id, |tags| {
            tags.remove(tag);
        })
        .await
    }

    async fn edit_tags(
        &self,
        pod_id: PodId,
        edit: impl FnOnce(&mut BTreeSet<String>),
    ) -> EngineResult<Pod> {
        let _guard = self.locks.acquire(pod_id).await;
        let mut pod = self.state.require_pod(pod_id)?;
        edit(&mut pod.tags);
        pod.updated_at = epoch_secs();
        self.state.put_pod(&pod)?;
        Ok(pod)
    }

    // ── Composition ────────────────────────────────────────────────

    pub async fn compose(&self, pod_id: PodId, request: ComposeRequest) -> EngineResult<Machine> {
        self.composer.compose(pod_id, request).await
    }

    pub async fn decompose_machine(
        &self,
        pod_id: PodId,
        machine_id: MachineId,
    ) -> EngineResult<()> {
        self.composer.decompose_machine(pod_id, machine_id).await
    }

    /// Delete a pod in the background and wait a bounded time for it.
    ///
    /// The wait is the configured delete timeout, multiplied for decompose
    /// deletes. When it runs out the deletion keeps going and `Pending` is
    /// returned.
    pub async fn delete_pod(&self, pod_id: PodId, decompose: bool) -> EngineResult<DeleteOutcome> {
        self.state.require_pod(pod_id)?;
        let composer = self.composer.clone();
        let task = tokio::spawn(async move { composer.run_delete(pod_id, decompose).await });

        let wait = self.config.delete_wait(decompose);
        match tokio::time::timeout(wait, task).await {
            Ok(Ok(result)) => result.map(DeleteOutcome::Finished),
            Ok(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Ok(Err(_)) => Err(EngineError::Interrupted(pod_id)),
            Err(_) => {
                info!(pod_id, decompose, ?wait, "pod deletion still running; poll for completion");
                Ok(DeleteOutcome::Pending)
            }
        }
    }

    pub async fn acknowledge_cleanup(
        &self,
        pod_id: PodId,
        machine_id: MachineId,
    ) -> EngineResult<CleanupOutcome> {
        self.composer.acknowledge_cleanup(pod_id, machine_id).await
    }
}

fn check_over_commit(oc: &OverCommit) -> EngineResult<()> {
    let valid = |r: f64| r.is_finite() && r >= 0.0;
    if !valid(oc.cpu) || !valid(oc.memory) {
        return Err(EngineError::InvalidUpdate(format!(
            "over-commit ratios must be finite and non-negative (cpu {}, memory {})",
            oc.cpu, oc.memory
        )));
    }
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
