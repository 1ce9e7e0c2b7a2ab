//! Composition orchestrator: drives compose and decompose end to end.
//!
//! Every operation takes the pod's composition lock first and keeps it until
//! the registry commit is done. Once a remote call is dispatched the rest of
//! the operation runs on its own task, which owns the lock guard; dropping
//! the caller's future after that point does not cancel the remote call or
//! release the lock early.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinSet;
use tracing::{error, info, warn};
use vmhost_capacity::{ComposeDefaults, ComposeRequest, ResourceAmount};
use vmhost_rack::{
    ComposedMachine, PodContext, RackConnectionPool, RackHandle, RequestedMachine, RpcError,
};
use vmhost_state::*;

use crate::error::{EngineError, EngineResult};
use crate::notify::MachineNotifier;
use crate::operation::{Operation, OperationKind, OperationState};

/// Result of a pod deletion that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub pod_id: PodId,
    /// Machines torn down on the hypervisor and removed from the registry.
    pub decomposed: Vec<MachineId>,
    /// Machines dropped from the registry without touching the hypervisor.
    pub released: Vec<MachineId>,
    /// Machines awaiting manual cleanup, either from a failed decompose or
    /// flagged before this deletion started.
    pub flagged: Vec<MachineId>,
    /// Whether the pod record itself is gone.
    pub pod_removed: bool,
}

/// Result of acknowledging a flagged machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    MachineRemoved,
    /// That was the last machine of a pod pending deletion; the pod is gone too.
    PodRemoved,
}

/// Drives compose and decompose operations against pods.
#[derive(Clone)]
pub struct Composer {
    state: StateStore,
    racks: RackConnectionPool,
    locks: PodLocks,
    notifier: Arc<dyn MachineNotifier>,
    defaults: ComposeDefaults,
    compose_timeout: Duration,
    decompose_timeout: Duration,
    skip_commissioning: bool,
}

impl Composer {
    pub fn new(
        state: StateStore,
        racks: RackConnectionPool,
        locks: PodLocks,
        notifier: Arc<dyn MachineNotifier>,
    ) -> Self {
        Self {
            state,
            racks,
            locks,
            notifier,
            defaults: ComposeDefaults::default(),
            compose_timeout: Duration::from_secs(120),
            decompose_timeout: Duration::from_secs(120),
            skip_commissioning: false,
        }
    }

    pub fn with_defaults(mut self, defaults: ComposeDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Set the bound on each compose RPC.
    pub fn with_compose_timeout(mut self, timeout: Duration) -> Self {
        self.compose_timeout = timeout;
        self
    }

    /// Set the bound on each decompose RPC.
    pub fn with_decompose_timeout(mut self, timeout: Duration) -> Self {
        self.decompose_timeout = timeout;
        self
    }

    /// Skip the commissioning hand-off for every compose.
    pub fn with_skip_commissioning(mut self, skip: bool) -> Self {
        self.skip_commissioning = skip;
        self
    }

    // ── Compose ────────────────────────────────────────────────────

    /// Create a machine on `pod_id`.
    ///
    /// Capacity is validated under the lock before any remote call. A failed
    /// or timed out RPC leaves the registry untouched. On success the pod's
    /// hints become exactly the driver's post-compose hints.
    pub async fn compose(&self, pod_id: PodId, request: ComposeRequest) -> EngineResult<Machine> {
        let mut op = Operation::new(OperationKind::Compose, pod_id);
        let guard = self.locks.acquire(pod_id).await;
        op.advance(OperationState::Validating);

        let (pod, requested, channel) = match self.prepare_compose(pod_id, &request) {
            Ok(prepared) => prepared,
            Err(e) => {
                op.fail(&e);
                return Err(e);
            }
        };

        op.advance(OperationState::Requesting);
        info!(
            pod_id,
            rack_id = %channel.rack_id,
            cores = requested.cores,
            memory = requested.memory,
            storage = requested.local_storage(),
            "composing machine"
        );
        let this = self.clone();
        detach(pod_id, async move {
            this.finish_compose(op, guard, pod, request, requested, channel)
                .await
        })
        .await
    }

    fn prepare_compose(
        &self,
        pod_id: PodId,
        request: &ComposeRequest,
    ) -> EngineResult<(Pod, RequestedMachine, RackHandle)> {
        let pod = self.state.require_pod(pod_id)?;
        if pod.status == PodStatus::Deleting {
            return Err(EngineError::PodDeleting(pod_id));
        }
        let requested = vmhost_capacity::resolve(&pod, request, &self.defaults)?;
        vmhost_capacity::validate(&pod, &requested)?;
        let channel = self
            .racks
            .any_channel_for(pod_id)
            .map_err(|_| EngineError::PodUnreachable(pod_id))?;
        Ok((pod, requested, channel))
    }

    async fn finish_compose(
        &self,
        mut op: Operation,
        guard: PodLockGuard,
        mut pod: Pod,
        request: ComposeRequest,
        requested: RequestedMachine,
        channel: RackHandle,
    ) -> EngineResult<Machine> {
        let ctx = PodContext::from_pod(&pod);
        let composed = match bounded(
            self.compose_timeout,
            channel.client.compose_machine(&ctx, &requested),
        )
        .await
        {
            Ok(composed) => composed,
            Err(rpc) => {
                let err = EngineError::compose_failed(rpc);
                op.fail(&err);
                return Err(err);
            }
        };

        op.advance(OperationState::Committing);
        let skip_commissioning = request.skip_commissioning || self.skip_commissioning;
        let machine = match self.commit_composed(
            &mut pod,
            &guard,
            &request,
            &requested,
            composed,
            skip_commissioning,
        ) {
            Ok(machine) => machine,
            Err(e) => {
                error!(pod_id = pod.id, error = %e, "composed machine could not be recorded");
                op.fail(&e);
                return Err(e);
            }
        };
        op.set_machine(machine.id);
        op.advance(OperationState::Done);
        drop(guard);

        info!(
            pod_id = pod.id,
            machine_id = machine.id,
            hostname = %machine.hostname,
            "machine composed"
        );
        if !skip_commissioning {
            self.notifier.machine_created(&machine);
        }
        Ok(machine)
    }

    fn commit_composed(
        &self,
        pod: &mut Pod,
        guard: &PodLockGuard,
        request: &ComposeRequest,
        requested: &RequestedMachine,
        composed: ComposedMachine,
        skip_commissioning: bool,
    ) -> EngineResult<Machine> {
        let now = epoch_secs();
        let found = composed.machine;
        let machine = Machine {
            id: self.state.allocate_id("machine")?,
            pod_id: pod.id,
            hostname: found.hostname,
            architecture: found.architecture,
            cores: found.cores,
            memory: found.memory,
            cpu_speed: found.cpu_speed,
            block_devices: found.block_devices,
            interfaces: found.interfaces,
            instance: found.instance,
            resource_pool: request
                .resource_pool
                .clone()
                .unwrap_or_else(|| pod.resource_pool.clone()),
            zone: request.zone.clone().unwrap_or_else(|| pod.zone.clone()),
            origin: MachineOrigin::Composed,
            status: if skip_commissioning {
                MachineStatus::Ready
            } else {
                MachineStatus::Commissioning
            },
            created_at: now,
        };

        let mut estimate = pod.clone();
        vmhost_capacity::debit(&mut estimate, guard, ResourceAmount::from_request(requested));
        vmhost_capacity::replace(pod, guard, composed.hints);
        if estimate.hints != pod.hints {
            info!(
                pod_id = pod.id,
                estimated = ?estimate.hints,
                reported = ?pod.hints,
                "driver hints differ from local estimate; using driver hints"
            );
        }
        pod.updated_at = now;

        self.state.commit_pod(pod, std::slice::from_ref(&machine), &[])?;
        Ok(machine)
    }

    // ── Decompose ──────────────────────────────────────────────────

    /// Tear down one machine.
    ///
    /// On success the record is removed and hints are taken from the driver.
    /// On failure the machine is flagged for cleanup and kept.
    pub async fn decompose_machine(
        &self,
        pod_id: PodId,
        machine_id: MachineId,
    ) -> EngineResult<()> {
        let mut op = Operation::for_machine(OperationKind::Decompose, pod_id, machine_id);
        let guard = self.locks.acquire(pod_id).await;
        op.advance(OperationState::Validating);

        let prepared = self.state.require_pod(pod_id).and_then(|pod| {
            let machine = self.state.require_machine(pod_id, machine_id)?;
            Ok((pod, machine))
        });
        let (pod, machine) = match prepared {
            Ok(p) => p,
            Err(e) => {
                let e = EngineError::from(e);
                op.fail(&e);
                return Err(e);
            }
        };
        let channel = match self.racks.any_channel_for(pod_id) {
            Ok(channel) => channel,
            Err(_) => {
                let e = EngineError::PodUnreachable(pod_id);
                op.fail(&e);
                return Err(e);
            }
        };

        op.advance(OperationState::Requesting);
        let this = self.clone();
        detach(pod_id, async move {
            this.finish_decompose(op, guard, pod, machine, channel).await
        })
        .await
    }

    async fn finish_decompose(
        &self,
        mut op: Operation,
        guard: PodLockGuard,
        mut pod: Pod,
        mut machine: Machine,
        channel: RackHandle,
    ) -> EngineResult<()> {
        let ctx = PodContext::from_pod(&pod);
        let result = bounded(
            self.decompose_timeout,
            channel.client.decompose_machine(&ctx, &machine.instance),
        )
        .await;

        op.advance(OperationState::Committing);
        match result {
            Ok(hints) => {
                vmhost_capacity::replace(&mut pod, &guard, hints);
                pod.updated_at = epoch_secs();
                if let Err(e) = self.state.commit_pod(&pod, &[], &[machine.id]) {
                    let e = EngineError::from(e);
                    op.fail(&e);
                    return Err(e);
                }
                op.advance(OperationState::Done);
                info!(pod_id = pod.id, machine_id = machine.id, "machine decomposed");
                Ok(())
            }
            Err(rpc) => {
                let err = EngineError::decompose_failed(machine.id, rpc);
                machine.status = MachineStatus::CleanupRequired {
                    reason: err.to_string(),
                };
                self.state.put_machine(&machine)?;
                op.fail(&err);
                Err(err)
            }
        }
    }

    // ── Pod deletion ───────────────────────────────────────────────

    /// Delete a pod, optionally decomposing every hosted machine first.
    ///
    /// With `decompose`, all machines are attempted concurrently and one
    /// failure never aborts the others. Decomposed machines are removed and
    /// their resources credited back; failed ones are flagged. Without it,
    /// machine records are released as they are, except those already
    /// flagged for cleanup. The pod record is removed only when no machine is
    /// flagged; otherwise it stays in `Deleting` until every flag is
    /// acknowledged.
    pub async fn run_delete(&self, pod_id: PodId, decompose: bool) -> EngineResult<DeleteReport> {
        let guard = self.locks.acquire(pod_id).await;
        let mut pod = self.state.require_pod(pod_id)?;
        let previous_status = pod.status;
        pod.status = PodStatus::Deleting;
        pod.updated_at = epoch_secs();
        self.state.put_pod(&pod)?;
        info!(pod_id, decompose, "deleting pod");

        let mut report = DeleteReport {
            pod_id,
            decomposed: Vec::new(),
            released: Vec::new(),
            flagged: Vec::new(),
            pod_removed: false,
        };

        let machines = self.state.list_machines_for_pod(pod_id)?;
        if !decompose {
            let (flagged, released): (Vec<_>, Vec<_>) =
                machines.into_iter().partition(Machine::needs_cleanup);
            report.flagged = flagged.iter().map(|m| m.id).collect();
            report.released = released.iter().map(|m| m.id).collect();
            if !report.flagged.is_empty() && !released.is_empty() {
                for machine in &released {
                    let amount = ResourceAmount::from_machine(machine);
                    vmhost_capacity::credit(&mut pod, &guard, amount);
                }
                self.state.commit_pod(&pod, &[], &report.released)?;
            }
        } else if !machines.is_empty() {
            let channel = match self.racks.any_channel_for(pod_id) {
                Ok(channel) => channel,
                Err(_) => {
                    pod.status = previous_status;
                    self.state.put_pod(&pod)?;
                    warn!(pod_id, "no rack can reach pod; deletion abandoned");
                    return Err(EngineError::PodUnreachable(pod_id));
                }
            };
            let flagged = self
                .decompose_all(&mut pod, &guard, channel, machines, &mut report)
                .await;
            self.state.commit_pod(&pod, &flagged, &report.decomposed)?;
        }

        if report.flagged.is_empty() {
            self.state.remove_pod(pod_id)?;
            self.racks.forget_pod(pod_id);
            report.pod_removed = true;
            info!(pod_id, decomposed = report.decomposed.len(), "pod deleted");
        } else {
            warn!(
                pod_id,
                flagged = ?report.flagged,
                "pod kept until flagged machines are acknowledged"
            );
        }
        Ok(report)
    }

    /// Issue one decompose per machine and wait for all of them.
    ///
    /// Returns the flagged machine records to persist.
    async fn decompose_all(
        &self,
        pod: &mut Pod,
        guard: &PodLockGuard,
        channel: RackHandle,
        machines: Vec<Machine>,
        report: &mut DeleteReport,
    ) -> Vec<Machine> {
        let ctx = PodContext::from_pod(pod);
        let mut tasks = JoinSet::new();
        for machine in machines {
            let client = channel.client.clone();
            let ctx = ctx.clone();
            let timeout = self.decompose_timeout;
            tasks.spawn(async move {
                let call = client.decompose_machine(&ctx, &machine.instance);
                let result = bounded(timeout, call).await;
                (machine, result)
            });
        }

        let mut flagged = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (mut machine, result) = match joined {
                Ok(res) => res,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => continue,
            };
            match result {
                Ok(_) => {
                    vmhost_capacity::credit(pod, guard, ResourceAmount::from_machine(&machine));
                    report.decomposed.push(machine.id);
                }
                Err(rpc) => {
                    let err = EngineError::decompose_failed(machine.id, rpc);
                    warn!(
                        pod_id = pod.id,
                        machine_id = machine.id,
                        error = %err,
                        "decompose failed; machine flagged for cleanup"
                    );
                    machine.status = MachineStatus::CleanupRequired {
                        reason: err.to_string(),
                    };
                    report.flagged.push(machine.id);
                    flagged.push(machine);
                }
            }
        }
        report.decomposed.sort_unstable();
        report.flagged.sort_unstable();
        flagged
    }

    /// Drop the record of a flagged machine once an operator has cleaned it up.
    ///
    /// Its resources are credited back. If the pod is pending deletion and
    /// this was its last machine, the pod record is removed as well.
    pub async fn acknowledge_cleanup(
        &self,
        pod_id: PodId,
        machine_id: MachineId,
    ) -> EngineResult<CleanupOutcome> {
        let guard = self.locks.acquire(pod_id).await;
        let mut pod = self.state.require_pod(pod_id)?;
        let machine = self.state.require_machine(pod_id, machine_id)?;
        if !machine.needs_cleanup() {
            return Err(EngineError::NotFlagged { pod_id, machine_id });
        }

        vmhost_capacity::credit(&mut pod, &guard, ResourceAmount::from_machine(&machine));
        pod.updated_at = epoch_secs();
        self.state.commit_pod(&pod, &[], &[machine_id])?;
        info!(pod_id, machine_id, "flagged machine acknowledged");

        if pod.status == PodStatus::Deleting
            && self.state.list_machines_for_pod(pod_id)?.is_empty()
        {
            self.state.remove_pod(pod_id)?;
            self.racks.forget_pod(pod_id);
            info!(pod_id, "pod deleted after last flagged machine was acknowledged");
            return Ok(CleanupOutcome::PodRemoved);
        }
        Ok(CleanupOutcome::MachineRemoved)
    }
}

/// Bound an RPC by `timeout`; expiry is reported as [`RpcError::Timeout`].
async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, RpcError>>,
) -> Result<T, RpcError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(RpcError::Timeout(timeout)))
}

/// Run the remainder of an operation on its own task and wait for it.
///
/// Dropping the returned future does not cancel the task.
async fn detach<T, F>(pod_id: PodId, fut: F) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(res) => res,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(EngineError::Interrupted(pod_id)),
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use vmhost_rack::RackClient;
    use vmhost_rack::testing::{Reply, ScriptedRackClient, discovered_machine, hints};

    const GIB: u64 = 1024 * 1024 * 1024;
    const TIB: u64 = 1 << 40;

    #[derive(Default)]
    struct RecordingNotifier {
        created: Mutex<Vec<MachineId>>,
    }

    impl MachineNotifier for RecordingNotifier {
        fn machine_created(&self, machine: &Machine) {
            self.created.lock().unwrap().push(machine.id);
        }
    }

    struct Fixture {
        state: StateStore,
        racks: RackConnectionPool,
        locks: PodLocks,
        notifier: Arc<RecordingNotifier>,
        composer: Composer,
    }

    fn fixture() -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let racks = RackConnectionPool::new();
        let locks = PodLocks::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let composer = Composer::new(
            state.clone(),
            racks.clone(),
            locks.clone(),
            notifier.clone() as Arc<dyn MachineNotifier>,
        )
        .with_compose_timeout(Duration::from_secs(30))
        .with_decompose_timeout(Duration::from_secs(30));
        Fixture {
            state,
            racks,
            locks,
            notifier,
            composer,
        }
    }

    fn put_pod(state: &StateStore) -> Pod {
        let capacity = PodCapacity {
            cores: 8,
            memory: 8192,
            local_storage: TIB,
            cpu_speed: 2400,
        };
        let pod = Pod {
            id: 1,
            name: "kvm-1".into(),
            pod_type: PodType::Virsh,
            parameters: PodParameters::new(),
            capabilities: BTreeSet::from(["composable".to_string()]),
            architectures: vec!["amd64/generic".into()],
            capacity,
            hints: PodHints {
                cores: 8,
                memory: 8192,
                local_storage: TIB,
                cpu_speed: 2400,
            },
            over_commit: OverCommit::default(),
            tags: BTreeSet::new(),
            resource_pool: "default".into(),
            zone: "default".into(),
            storage_pools: Vec::new(),
            default_macvlan_mode: None,
            cluster: None,
            status: PodStatus::Ready,
            last_sync: None,
            sync_error: None,
            created_at: 0,
            updated_at: 0,
        };
        state.put_pod(&pod).unwrap();
        pod
    }

    fn put_machine(state: &StateStore, id: MachineId, domain: &str) -> Machine {
        let found = discovered_machine(domain, 2, 2048, 10 * GIB);
        let machine = Machine {
            id,
            pod_id: 1,
            hostname: found.hostname,
            architecture: found.architecture,
            cores: found.cores,
            memory: found.memory,
            cpu_speed: None,
            block_devices: found.block_devices,
            interfaces: found.interfaces,
            instance: found.instance,
            resource_pool: "default".into(),
            zone: "default".into(),
            origin: MachineOrigin::Composed,
            status: MachineStatus::Ready,
            created_at: 0,
        };
        state.put_machine(&machine).unwrap();
        machine
    }

    fn connect(racks: &RackConnectionPool, client: ScriptedRackClient) -> Arc<ScriptedRackClient> {
        let client = Arc::new(client);
        racks.connect("rack-a", client.clone() as Arc<dyn RackClient>);
        client
    }

    fn composed(domain: &str, after: PodHints) -> Reply<ComposedMachine> {
        Reply::Ok(ComposedMachine {
            machine: discovered_machine(domain, 4, 4096, 10 * GIB),
            hints: after,
        })
    }

    // ── compose ───────────────────────────────────────────────────

    #[tokio::test]
    async fn compose_commits_machine_and_driver_hints() {
        let f = fixture();
        put_pod(&f.state);
        let client = connect(
            &f.racks,
            ScriptedRackClient::new()
                .with_compose([composed("vm-1", hints(4, 4096, TIB - 10 * GIB))]),
        );

        let request = ComposeRequest::new().with_cores(4).with_memory(4096).with_disk(10 * GIB);
        let machine = f.composer.compose(1, request).await.unwrap();

        assert_eq!(machine.hostname, "vm-1");
        assert_eq!(machine.status, MachineStatus::Commissioning);
        assert_eq!(machine.resource_pool, "default");
        let pod = f.state.require_pod(1).unwrap();
        assert_eq!(pod.hints, hints(4, 4096, TIB - 10 * GIB));
        assert_eq!(pod.capacity.cores, 8);
        assert_eq!(f.state.list_machines_for_pod(1).unwrap(), vec![machine.clone()]);
        assert_eq!(*f.notifier.created.lock().unwrap(), vec![machine.id]);
        assert_eq!(client.compose_calls()[0].cores, 4);
        assert!(f.locks.is_empty());
    }

    #[tokio::test]
    async fn compose_over_hints_makes_no_remote_call() {
        let f = fixture();
        put_pod(&f.state);
        let client = connect(&f.racks, ScriptedRackClient::new());

        let err = f
            .composer
            .compose(1, ComposeRequest::new().with_cores(9))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::CapacityExceeded(_)));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn overflowing_disks_are_rejected_before_dispatch() {
        let f = fixture();
        put_pod(&f.state);
        let client = connect(&f.racks, ScriptedRackClient::new());

        let request = ComposeRequest::new().with_disk(u64::MAX).with_disk(2);
        let err = f.composer.compose(1, request).await.unwrap_err();

        assert!(matches!(err, EngineError::CapacityExceeded(_)), "{err:?}");
        assert_eq!(client.call_count(), 0);
        assert!(f.locks.is_empty());
    }

    #[tokio::test]
    async fn compose_without_racks_is_unreachable() {
        let f = fixture();
        put_pod(&f.state);
        let err = f.composer.compose(1, ComposeRequest::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::PodUnreachable(1)));
    }

    #[tokio::test]
    async fn rpc_failure_leaves_registry_untouched() {
        let f = fixture();
        let before = put_pod(&f.state);
        connect(
            &f.racks,
            ScriptedRackClient::new()
                .with_compose([Reply::Err(RpcError::ActionFailed("no space".into()))]),
        );

        let err = f.composer.compose(1, ComposeRequest::new()).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "Unable to compose machine because: Failed to complete pod action: no space"
        );
        assert!(err.is_retryable());
        assert_eq!(f.state.require_pod(1).unwrap(), before);
        assert!(f.state.list_machines_for_pod(1).unwrap().is_empty());
        assert!(f.notifier.created.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_timeout_is_compose_failure() {
        let f = fixture();
        put_pod(&f.state);
        connect(&f.racks, ScriptedRackClient::new().with_compose([Reply::Hang]));

        let err = f.composer.compose(1, ComposeRequest::new()).await.unwrap_err();
        match err {
            EngineError::ComposeFailed { source, .. } => assert!(source.is_timeout()),
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.locks.is_empty());
    }

    #[tokio::test]
    async fn skip_commissioning_skips_notification() {
        let f = fixture();
        put_pod(&f.state);
        connect(
            &f.racks,
            ScriptedRackClient::new().with_compose([composed("vm-1", hints(4, 4096, TIB))]),
        );
        let mut request = ComposeRequest::new();
        request.skip_commissioning = true;
        request.zone = Some("edge".into());

        let machine = f.composer.compose(1, request).await.unwrap();
        assert_eq!(machine.status, MachineStatus::Ready);
        assert_eq!(machine.zone, "edge");
        assert!(f.notifier.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_pod_refuses_compose() {
        let f = fixture();
        let mut pod = put_pod(&f.state);
        pod.status = PodStatus::Deleting;
        f.state.put_pod(&pod).unwrap();

        let err = f.composer.compose(1, ComposeRequest::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::PodDeleting(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_still_commits_after_dispatch() {
        let f = fixture();
        put_pod(&f.state);
        connect(
            &f.racks,
            ScriptedRackClient::new()
                .with_compose([composed("vm-1", hints(4, 4096, TIB))])
                .with_latency(Duration::from_secs(5)),
        );

        let attempt = tokio::time::timeout(
            Duration::from_secs(1),
            f.composer.compose(1, ComposeRequest::new()),
        )
        .await;
        assert!(attempt.is_err());
        assert!(f.locks.is_locked(1));

        // The lock is released only once the remote answer is committed.
        let _guard = f.locks.acquire(1).await;
        assert_eq!(f.state.list_machines_for_pod(1).unwrap().len(), 1);
        assert_eq!(f.state.require_pod(1).unwrap().hints.cores, 4);
    }

    // ── decompose ─────────────────────────────────────────────────

    #[tokio::test]
    async fn decompose_machine_removes_record_and_takes_driver_hints() {
        let f = fixture();
        put_pod(&f.state);
        put_machine(&f.state, 5, "vm-5");
        connect(&f.racks, ScriptedRackClient::new().with_decompose(Reply::Ok(hints(8, 8192, TIB))));

        f.composer.decompose_machine(1, 5).await.unwrap();

        assert!(f.state.get_machine(1, 5).unwrap().is_none());
        assert_eq!(f.state.require_pod(1).unwrap().hints, hints(8, 8192, TIB));
    }

    #[tokio::test]
    async fn failed_decompose_flags_machine() {
        let f = fixture();
        put_pod(&f.state);
        put_machine(&f.state, 5, "vm-5");
        connect(
            &f.racks,
            ScriptedRackClient::new()
                .with_decompose(Reply::Err(RpcError::Connection("refused".into()))),
        );

        let err = f.composer.decompose_machine(1, 5).await.unwrap_err();
        assert!(matches!(err, EngineError::DecomposeFailed { machine_id: 5, .. }));
        assert!(f.state.require_machine(1, 5).unwrap().needs_cleanup());
    }

    #[tokio::test]
    async fn decompose_unknown_machine() {
        let f = fixture();
        put_pod(&f.state);
        let err = f.composer.decompose_machine(1, 77).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::MachineNotFound {
                pod_id: 1,
                machine_id: 77
            }
        ));
    }

    // ── delete ────────────────────────────────────────────────────

    #[tokio::test]
    async fn plain_delete_removes_pod_and_machines_without_rpc() {
        let f = fixture();
        put_pod(&f.state);
        put_machine(&f.state, 5, "vm-5");
        let client = connect(&f.racks, ScriptedRackClient::new());

        let report = f.composer.run_delete(1, false).await.unwrap();

        assert!(report.pod_removed);
        assert!(report.decomposed.is_empty());
        assert_eq!(report.released, vec![5]);
        assert_eq!(client.call_count(), 0);
        assert!(f.state.get_pod(1).unwrap().is_none());
        assert!(f.state.list_machines_for_pod(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn decompose_delete_keeps_pod_until_flags_acknowledged() {
        let f = fixture();
        put_pod(&f.state);
        put_machine(&f.state, 5, "vm-a");
        let b = put_machine(&f.state, 6, "vm-b");
        connect(
            &f.racks,
            ScriptedRackClient::new()
                .with_decompose(Reply::Ok(hints(8, 8192, TIB)))
                .with_decompose_for(
                    b.instance.clone(),
                    Reply::Err(RpcError::ActionFailed("locked".into())),
                ),
        );

        let report = f.composer.run_delete(1, true).await.unwrap();

        assert_eq!(report.decomposed, vec![5]);
        assert_eq!(report.flagged, vec![6]);
        assert!(!report.pod_removed);
        assert!(f.state.get_machine(1, 5).unwrap().is_none());
        assert!(f.state.require_machine(1, 6).unwrap().needs_cleanup());
        assert_eq!(f.state.require_pod(1).unwrap().status, PodStatus::Deleting);

        let outcome = f.composer.acknowledge_cleanup(1, 6).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::PodRemoved);
        assert!(f.state.get_pod(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn plain_delete_never_drops_flagged_machines() {
        let f = fixture();
        put_pod(&f.state);
        put_machine(&f.state, 5, "vm-a");
        let mut b = put_machine(&f.state, 6, "vm-b");
        b.status = MachineStatus::CleanupRequired {
            reason: "domain is locked".into(),
        };
        f.state.put_machine(&b).unwrap();
        let client = connect(&f.racks, ScriptedRackClient::new());

        let report = f.composer.run_delete(1, false).await.unwrap();

        assert_eq!(report.released, vec![5]);
        assert_eq!(report.flagged, vec![6]);
        assert!(!report.pod_removed);
        assert_eq!(client.call_count(), 0);
        assert!(f.state.get_machine(1, 5).unwrap().is_none());
        assert!(f.state.require_machine(1, 6).unwrap().needs_cleanup());
        assert_eq!(f.state.require_pod(1).unwrap().status, PodStatus::Deleting);

        let outcome = f.composer.acknowledge_cleanup(1, 6).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::PodRemoved);
    }

    #[tokio::test]
    async fn decompose_delete_without_channel_reverts_status() {
        let f = fixture();
        put_pod(&f.state);
        put_machine(&f.state, 5, "vm-5");

        let err = f.composer.run_delete(1, true).await.unwrap_err();
        assert!(matches!(err, EngineError::PodUnreachable(1)));
        assert_eq!(f.state.require_pod(1).unwrap().status, PodStatus::Ready);
    }

    #[tokio::test]
    async fn acknowledging_unflagged_machine_is_rejected() {
        let f = fixture();
        put_pod(&f.state);
        put_machine(&f.state, 5, "vm-5");

        let err = f.composer.acknowledge_cleanup(1, 5).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFlagged { .. }));
    }
}
