//! Scripted rack client for tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use vmhost_state::{
    BlockDevice, InstanceRef, Interface, PodCapacity, PodHints, PodId, PodType, StoragePool,
};

use crate::client::{RackClient, RpcFuture};
use crate::error::RpcError;
use crate::payload::{
    ClusterMember, ComposedMachine, DiscoveredCluster, DiscoveredMachine, DiscoveredPod,
    Discovery, DriverFacts, PodContext, RequestedMachine,
};

/// Canned answer for one RPC.
#[derive(Debug, Clone)]
pub enum Reply<T> {
    Ok(T),
    Err(RpcError),
    /// Never resolves; the caller's timeout has to fire.
    Hang,
}

impl<T> Reply<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        match self {
            Reply::Ok(value) => Reply::Ok(f(value)),
            Reply::Err(e) => Reply::Err(e),
            Reply::Hang => Reply::Hang,
        }
    }
}

/// A call observed by [`ScriptedRackClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Discover(PodId),
    Compose(PodId, RequestedMachine),
    Decompose(PodId, InstanceRef),
}

/// Rack client replaying scripted replies.
///
/// Compose replies are consumed in order; the last one repeats. Decompose
/// replies can be set per instance, with a fallback for the rest.
pub struct ScriptedRackClient {
    discover: Mutex<Reply<Discovery>>,
    compose: Mutex<VecDeque<Reply<ComposedMachine>>>,
    decompose: Mutex<HashMap<InstanceRef, Reply<PodHints>>>,
    decompose_fallback: Mutex<Reply<PodHints>>,
    latency: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedRackClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRackClient {
    /// A client that fails every call as not implemented.
    pub fn new() -> Self {
        Self {
            discover: Mutex::new(Reply::Err(not_implemented("discover"))),
            compose: Mutex::new(VecDeque::from([Reply::Err(not_implemented("compose"))])),
            decompose: Mutex::new(HashMap::new()),
            decompose_fallback: Mutex::new(Reply::Err(not_implemented("decompose"))),
            latency: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_discover(self, reply: Reply<DiscoveredPod>) -> Self {
        *lock(&self.discover) = reply.map(Discovery::Host);
        self
    }

    /// Answer discovery as a member of `cluster`.
    pub fn with_cluster(self, cluster: DiscoveredCluster) -> Self {
        *lock(&self.discover) = Reply::Ok(Discovery::Cluster(cluster));
        self
    }

    /// Queue compose replies, replacing the current script.
    pub fn with_compose(self, replies: impl IntoIterator<Item = Reply<ComposedMachine>>) -> Self {
        *lock(&self.compose) = replies.into_iter().collect();
        self
    }

    pub fn with_decompose(self, reply: Reply<PodHints>) -> Self {
        *lock(&self.decompose_fallback) = reply;
        self
    }

    pub fn with_decompose_for(self, instance: InstanceRef, reply: Reply<PodHints>) -> Self {
        lock(&self.decompose).insert(instance, reply);
        self
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn compose_calls(&self) -> Vec<RequestedMachine> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                RecordedCall::Compose(_, req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_compose(&self) -> Reply<ComposedMachine> {
        let mut queue = lock(&self.compose);
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(Reply::Hang)
        } else {
            queue.front().cloned().unwrap_or(Reply::Hang)
        }
    }

    fn decompose_reply(&self, instance: &InstanceRef) -> Reply<PodHints> {
        match lock(&self.decompose).get(instance) {
            Some(reply) => reply.clone(),
            None => lock(&self.decompose_fallback).clone(),
        }
    }

    async fn answer<T>(&self, call: RecordedCall, reply: Reply<T>) -> Result<T, RpcError> {
        lock(&self.calls).push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match reply {
            Reply::Ok(value) => Ok(value),
            Reply::Err(e) => Err(e),
            Reply::Hang => std::future::pending().await,
        }
    }
}

impl RackClient for ScriptedRackClient {
    fn discover_pod<'a>(&'a self, pod: &'a PodContext) -> RpcFuture<'a, Discovery> {
        let reply = lock(&self.discover).clone();
        Box::pin(self.answer(RecordedCall::Discover(pod.pod_id), reply))
    }

    fn compose_machine<'a>(
        &'a self,
        pod: &'a PodContext,
        request: &'a RequestedMachine,
    ) -> RpcFuture<'a, ComposedMachine> {
        let reply = self.next_compose();
        Box::pin(self.answer(RecordedCall::Compose(pod.pod_id, request.clone()), reply))
    }

    fn decompose_machine<'a>(
        &'a self,
        pod: &'a PodContext,
        instance: &'a InstanceRef,
    ) -> RpcFuture<'a, PodHints> {
        let reply = self.decompose_reply(instance);
        Box::pin(self.answer(RecordedCall::Decompose(pod.pod_id, instance.clone()), reply))
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_implemented(method: &str) -> RpcError {
    RpcError::NotImplemented {
        pod_type: PodType::Virsh.to_string(),
        method: method.to_string(),
    }
}

// ── Fixtures ──────────────────────────────────────────────────────

/// A virsh discovery answer with hints equal to capacity.
pub fn discovered_pod(cores: u64, memory: u64, local_storage: u64) -> DiscoveredPod {
    DiscoveredPod {
        architectures: vec!["amd64/generic".to_string()],
        capacity: PodCapacity {
            cores,
            memory,
            local_storage,
            cpu_speed: 2400,
        },
        hints: PodHints {
            cores,
            memory,
            local_storage,
            cpu_speed: 2400,
        },
        storage_pools: vec![StoragePool {
            id: "pool-default".to_string(),
            name: "default".to_string(),
            kind: "dir".to_string(),
            path: "/var/lib/libvirt/images".to_string(),
            total: local_storage,
            used: 0,
            default: true,
        }],
        capabilities: BTreeSet::from([
            "composable".to_string(),
            "storage_pools".to_string(),
        ]),
        machines: Vec::new(),
        facts: DriverFacts::Virsh {
            libvirt_version: Some("8.0.0".to_string()),
        },
    }
}

/// A virsh VM named `domain`.
pub fn discovered_machine(domain: &str, cores: u64, memory: u64, disk: u64) -> DiscoveredMachine {
    DiscoveredMachine {
        hostname: domain.to_string(),
        architecture: "amd64/generic".to_string(),
        cores,
        memory,
        cpu_speed: None,
        block_devices: vec![BlockDevice::with_size(disk)],
        interfaces: vec![Interface::new("52:54:00:12:34:56")],
        instance: InstanceRef::Virsh {
            domain: domain.to_string(),
        },
    }
}

/// An LXD cluster whose members are reachable at `https://<name>:8443`.
pub fn lxd_cluster(name: &str, members: &[&str], cores: u64, memory: u64) -> DiscoveredCluster {
    let members = members
        .iter()
        .map(|member| {
            let mut pod = discovered_pod(cores, memory, 1 << 40);
            pod.facts = DriverFacts::Lxd {
                project: "default".to_string(),
                server_version: Some("5.21".to_string()),
            };
            ClusterMember {
                name: member.to_string(),
                address: format!("https://{member}:8443"),
                pod,
            }
        })
        .collect();
    DiscoveredCluster {
        name: name.to_string(),
        project: "default".to_string(),
        members,
    }
}

pub fn hints(cores: u64, memory: u64, local_storage: u64) -> PodHints {
    PodHints {
        cores,
        memory,
        local_storage,
        cpu_speed: 2400,
    }
}
