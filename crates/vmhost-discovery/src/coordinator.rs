//! Discovery coordinator: fan-out, fan-in, merge.

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vmhost_rack::{
    ClusterMember, DiscoveredCluster, DiscoveredPod, Discovery, PodContext, RackConnectionPool,
    RackHandle, RpcError,
};
use vmhost_state::*;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::outcome::DiscoveryOutcome;

/// Discovers pods through every live rack and reconciles the answers.
#[derive(Clone)]
pub struct DiscoveryCoordinator {
    state: StateStore,
    racks: RackConnectionPool,
    locks: PodLocks,
    /// Bound on each individual discovery RPC.
    call_timeout: Duration,
}

impl DiscoveryCoordinator {
    pub fn new(state: StateStore, racks: RackConnectionPool, locks: PodLocks) -> Self {
        Self {
            state,
            racks,
            locks,
            call_timeout: Duration::from_secs(120),
        }
    }

    /// Set the per-call discovery timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Discover `pod` through every live rack controller.
    ///
    /// All calls run concurrently and each is bounded by the call timeout. A
    /// failing or hung rack never cancels or delays the collection of the
    /// others beyond that bound. Nothing is written.
    pub async fn discover(&self, pod: &PodContext) -> DiscoveryOutcome {
        let channels = self.racks.all_channels();
        let mut outcome = DiscoveryOutcome::default();
        if channels.is_empty() {
            warn!(pod_id = pod.pod_id, "no rack controllers connected");
            return outcome;
        }

        let mut tasks = JoinSet::new();
        for handle in channels {
            tasks.spawn(discover_via(handle, pod.clone(), self.call_timeout));
        }

        while let Some(joined) = tasks.join_next().await {
            let (rack_id, result) = match joined {
                Ok(res) => res,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                // Tasks are never aborted while the set is alive.
                Err(_) => continue,
            };
            match result {
                Ok(discovered) => {
                    debug!(pod_id = pod.pod_id, %rack_id, "rack discovered pod");
                    outcome.successes.insert(rack_id, discovered);
                }
                Err(err) => {
                    warn!(
                        pod_id = pod.pod_id,
                        %rack_id,
                        error = %err,
                        "rack failed to discover pod"
                    );
                    outcome.failures.insert(rack_id, err);
                }
            }
        }
        outcome
    }

    /// Lock the pod, re-run discovery and merge the result.
    ///
    /// Returns the reconciled pod. On total failure the stored record is left
    /// untouched and `ClusterUnavailable` carries every rack's error. When the
    /// host answers as a cluster member, the other members are synced as
    /// sibling pods.
    pub async fn refresh(&self, pod_id: PodId) -> DiscoveryResult<Pod> {
        let guard = self.locks.acquire(pod_id).await;
        self.refresh_locked(&guard).await
    }

    /// [`refresh`](Self::refresh) for a caller already holding the pod's lock.
    pub async fn refresh_locked(&self, guard: &PodLockGuard) -> DiscoveryResult<Pod> {
        let pod_id = guard.pod_id();
        let mut pod = self
            .state
            .get_pod(pod_id)?
            .ok_or(DiscoveryError::PodNotFound(pod_id))?;

        let outcome = self.discover(&PodContext::from_pod(&pod)).await;
        self.racks.record_routes(
            pod_id,
            outcome.successes.keys().cloned(),
            outcome.failures.keys().cloned(),
        );

        let Some((rack_id, answer)) = outcome.authoritative() else {
            let message = outcome.failure_message();
            warn!(
                pod_id,
                failures = outcome.failures.len(),
                %message,
                "discovery failed on every rack; pod left unchanged"
            );
            return Err(DiscoveryError::ClusterUnavailable {
                message,
                failures: outcome.failures,
            });
        };

        let (added, siblings) = match answer {
            Discovery::Host(discovered) => {
                pod.cluster = None;
                (self.merge(&mut pod, guard, rack_id, discovered)?, 0)
            }
            Discovery::Cluster(cluster) => {
                self.merge_cluster(&mut pod, guard, rack_id, cluster, &outcome)?
            }
        };
        info!(
            pod_id,
            %rack_id,
            succeeded = outcome.successes.len(),
            failed = outcome.failures.len(),
            discovered_machines = added,
            cluster_siblings = siblings,
            "pod refreshed"
        );
        Ok(pod)
    }

    /// Apply a cluster answer.
    ///
    /// The pod takes the figures of the member it stands for and is renamed
    /// after it. Every other member is synced as a sibling pod. Returns the
    /// machines recorded across all members and the number of siblings synced.
    fn merge_cluster(
        &self,
        pod: &mut Pod,
        guard: &PodLockGuard,
        rack_id: &RackId,
        cluster: &DiscoveredCluster,
        outcome: &DiscoveryOutcome,
    ) -> DiscoveryResult<(usize, usize)> {
        let membership = VmCluster {
            name: cluster.name.clone(),
            project: cluster.project.clone(),
        };
        let own = cluster.member_for(pod.power_address());

        let mut added = 0;
        let mut siblings = 0;
        for (index, member) in cluster.members.iter().enumerate() {
            if Some(index) == own {
                pod.name = member.name.clone();
                pod.cluster = Some(membership.clone());
                added += self.merge(pod, guard, rack_id, &member.pod)?;
            } else if let Some(recorded) =
                self.sync_member(pod, &membership, member, rack_id, outcome)?
            {
                added += recorded;
                siblings += 1;
            }
        }
        Ok((added, siblings))
    }

    /// Create or update the pod standing for another member of the cluster.
    ///
    /// A member matches an existing pod of the same type by power address, or
    /// by name within the same cluster. Only when neither matches is a new pod
    /// registered, carrying the origin's caller-owned fields. A sibling that
    /// is locked or being deleted is left alone.
    fn sync_member(
        &self,
        origin: &Pod,
        membership: &VmCluster,
        member: &ClusterMember,
        rack_id: &RackId,
        outcome: &DiscoveryOutcome,
    ) -> DiscoveryResult<Option<usize>> {
        let existing = self.state.list_pods()?.into_iter().find(|other| {
            other.id != origin.id
                && other.pod_type == origin.pod_type
                && (other.power_address() == Some(member.address.as_str())
                    || (other.cluster.as_ref() == Some(membership) && other.name == member.name))
        });
        let created = existing.is_none();
        let candidate = match &existing {
            Some(pod) => pod.id,
            None => self.state.allocate_id("pod")?,
        };
        let Some(guard) = self.locks.try_acquire(candidate) else {
            debug!(pod_id = candidate, member = %member.name, "cluster sibling busy; skipped");
            return Ok(None);
        };

        let mut sibling = if created {
            new_sibling(candidate, origin, member)
        } else {
            match self.state.get_pod(candidate)? {
                Some(current) if current.status == PodStatus::Ready => current,
                _ => return Ok(None),
            }
        };
        sibling.name = member.name.clone();
        sibling.cluster = Some(membership.clone());
        let added = self.merge(&mut sibling, &guard, rack_id, &member.pod)?;
        self.racks.record_routes(
            sibling.id,
            outcome.successes.keys().cloned(),
            outcome.failures.keys().cloned(),
        );
        info!(
            pod_id = sibling.id,
            cluster = %membership.name,
            member = %member.name,
            created,
            "cluster sibling synced"
        );
        Ok(Some(added))
    }

    /// Apply one rack's answer to the pod and commit it.
    ///
    /// Capacity, architectures, storage pools and capabilities are replaced
    /// wholesale; hints are replaced from the driver's figures. Caller-owned
    /// fields (tags, pool, zone, over-commit) are left alone. Machines the
    /// registry does not know yet are recorded in the same commit.
    fn merge(
        &self,
        pod: &mut Pod,
        guard: &PodLockGuard,
        rack_id: &RackId,
        discovered: &DiscoveredPod,
    ) -> DiscoveryResult<usize> {
        let now = epoch_secs();
        pod.architectures = discovered.architectures.clone();
        pod.capacity = discovered.capacity;
        pod.storage_pools = discovered.storage_pools.clone();
        pod.capabilities = discovered.capabilities.clone();
        vmhost_capacity::replace(pod, guard, discovered.hints);
        pod.last_sync = Some(SyncMarker {
            synced_at: now,
            rack_id: rack_id.clone(),
            driver_version: discovered.facts.version().map(str::to_string),
        });
        pod.sync_error = None;
        pod.updated_at = now;

        let known: HashSet<InstanceRef> = self
            .state
            .list_machines_for_pod(pod.id)?
            .into_iter()
            .map(|m| m.instance)
            .collect();

        let mut added = Vec::new();
        for found in &discovered.machines {
            if known.contains(&found.instance) {
                continue;
            }
            let id = self.state.allocate_id("machine")?;
            debug!(
                pod_id = pod.id,
                machine_id = id,
                instance = %found.instance,
                "recording pre-existing machine"
            );
            added.push(Machine {
                id,
                pod_id: pod.id,
                hostname: found.hostname.clone(),
                architecture: found.architecture.clone(),
                cores: found.cores,
                memory: found.memory,
                cpu_speed: found.cpu_speed,
                block_devices: found.block_devices.clone(),
                interfaces: found.interfaces.clone(),
                instance: found.instance.clone(),
                resource_pool: pod.resource_pool.clone(),
                zone: pod.zone.clone(),
                origin: MachineOrigin::Discovered,
                status: MachineStatus::Ready,
                created_at: now,
            });
        }

        self.state.commit_pod(pod, &added, &[])?;
        Ok(added.len())
    }
}

/// A fresh pod record for a cluster member not registered yet.
fn new_sibling(id: PodId, origin: &Pod, member: &ClusterMember) -> Pod {
    let now = epoch_secs();
    Pod {
        id,
        name: member.name.clone(),
        pod_type: origin.pod_type,
        parameters: origin
            .parameters
            .clone()
            .with("power_address", &member.address),
        capabilities: BTreeSet::new(),
        architectures: Vec::new(),
        capacity: PodCapacity::default(),
        hints: PodHints::default(),
        over_commit: origin.over_commit,
        tags: origin.tags.clone(),
        resource_pool: origin.resource_pool.clone(),
        zone: origin.zone.clone(),
        storage_pools: Vec::new(),
        default_macvlan_mode: origin.default_macvlan_mode.clone(),
        cluster: None,
        status: PodStatus::Ready,
        last_sync: None,
        sync_error: None,
        created_at: now,
        updated_at: now,
    }
}

/// One rack's discovery call, bounded by `timeout`.
async fn discover_via(
    handle: RackHandle,
    pod: PodContext,
    timeout: Duration,
) -> (RackId, Result<Discovery, RpcError>) {
    let result = match tokio::time::timeout(timeout, handle.client.discover_pod(&pod)).await {
        Ok(Ok(answer)) => check_answer(answer, pod.pod_type),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RpcError::Timeout(timeout)),
    };
    (handle.rack_id, result)
}

/// Reject answers that cannot be merged into a pod of `pod_type`.
fn check_answer(answer: Discovery, pod_type: PodType) -> Result<Discovery, RpcError> {
    if matches!(&answer, Discovery::Cluster(cluster) if cluster.members.is_empty()) {
        return Err(RpcError::Remote("cluster reported no members".to_string()));
    }
    let mismatch = answer
        .hosts()
        .into_iter()
        .map(|host| host.facts.pod_type())
        .find(|found| *found != pod_type);
    match mismatch {
        Some(found) => Err(RpcError::Remote(format!(
            "driver answered with {found} facts for a {pod_type} pod"
        ))),
        None => Ok(answer),
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
