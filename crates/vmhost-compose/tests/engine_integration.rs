//! End-to-end tests of the pod service against scripted rack controllers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use vmhost_capacity::ComposeRequest;
use vmhost_compose::{
    CleanupOutcome, DeleteOutcome, EngineConfig, EngineError, LogNotifier, NewPod, PodService,
};
use vmhost_rack::testing::{
    RecordedCall, Reply, ScriptedRackClient, discovered_machine, discovered_pod, hints, lxd_cluster,
};
use vmhost_rack::{ComposedMachine, RackClient, RpcError};
use vmhost_state::{InstanceRef, MachineStatus, PodParameters, PodStatus, StateStore};

const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;

fn service(config: EngineConfig) -> PodService {
    PodService::new(
        StateStore::open_in_memory().unwrap(),
        vmhost_rack::RackConnectionPool::new(),
        Arc::new(LogNotifier),
        config,
    )
}

fn connect(svc: &PodService, rack_id: &str, client: ScriptedRackClient) -> Arc<ScriptedRackClient> {
    let client = Arc::new(client);
    svc.racks().connect(rack_id, client.clone() as Arc<dyn RackClient>);
    client
}

fn kvm(name: &str) -> NewPod {
    NewPod {
        name: Some(name.to_string()),
        pod_type: "virsh".to_string(),
        parameters: PodParameters::new()
            .with("power_address", &format!("qemu+ssh://{name}/system"))
            .with("power_pass", "secret"),
        ..NewPod::default()
    }
}

fn lxd(name: &str, address: &str) -> NewPod {
    NewPod {
        name: Some(name.to_string()),
        pod_type: "lxd".to_string(),
        parameters: PodParameters::new()
            .with("power_address", address)
            .with("password", "secret"),
        ..NewPod::default()
    }
}

fn composed(
    domain: &str,
    cores: u64,
    memory: u64,
    after: vmhost_state::PodHints,
) -> ComposedMachine {
    ComposedMachine {
        machine: discovered_machine(domain, cores, memory, 10 * GIB),
        hints: after,
    }
}

#[tokio::test]
async fn partial_discovery_success_merges_one_answer() {
    let svc = service(EngineConfig::default());
    connect(
        &svc,
        "rack-a",
        ScriptedRackClient::new().with_discover(Reply::Err(RpcError::Connection("refused".into()))),
    );
    connect(
        &svc,
        "rack-b",
        ScriptedRackClient::new().with_discover(Reply::Ok(discovered_pod(8, 8192, TIB))),
    );
    connect(
        &svc,
        "rack-c",
        ScriptedRackClient::new().with_discover(Reply::Err(RpcError::Remote("boom".into()))),
    );

    let pod = svc.create_pod(kvm("kvm-1")).await.unwrap();
    assert_eq!(pod.capacity.cores, 8);
    assert_eq!(pod.hints.memory, 8192);
    assert_eq!(pod.last_sync.as_ref().unwrap().rack_id, "rack-b");
    assert_eq!(pod.sync_error, None);

    // Only the rack that answered is used for compose.
    assert_eq!(
        svc.racks().any_channel_for(pod.id).unwrap().rack_id,
        "rack-b"
    );
}

#[tokio::test]
async fn total_discovery_failure_leaves_pod_untouched() {
    let svc = service(EngineConfig::default());
    connect(
        &svc,
        "rack-a",
        ScriptedRackClient::new().with_discover(Reply::Ok(discovered_pod(8, 8192, TIB))),
    );
    let before = svc.create_pod(kvm("kvm-1")).await.unwrap();

    svc.racks().disconnect("rack-a");
    connect(
        &svc,
        "rack-b",
        ScriptedRackClient::new().with_discover(Reply::Err(RpcError::Auth("expired".into()))),
    );
    connect(
        &svc,
        "rack-c",
        ScriptedRackClient::new()
            .with_discover(Reply::Err(RpcError::Timeout(Duration::from_secs(1)))),
    );

    let err = svc.refresh_pod(before.id).await.unwrap_err();
    match err {
        EngineError::ClusterUnavailable { message, failures } => {
            assert_eq!(message, "Could not authenticate to pod: expired");
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected ClusterUnavailable, got {other:?}"),
    }

    let after = svc.get_pod(before.id).unwrap();
    assert_eq!(after.capacity, before.capacity);
    assert_eq!(after.hints, before.hints);
    assert_eq!(after.last_sync, before.last_sync);
}

#[tokio::test]
async fn compose_then_capacity_gate() {
    let svc = service(EngineConfig::default());
    let rack = connect(
        &svc,
        "rack-a",
        ScriptedRackClient::new()
            .with_discover(Reply::Ok(discovered_pod(8, 8192, TIB)))
            .with_compose([Reply::Ok(composed(
                "vm-1",
                4,
                4096,
                hints(4, 4096, TIB - 10 * GIB),
            ))]),
    );
    let pod = svc.create_pod(kvm("kvm-1")).await.unwrap();

    let machine = svc
        .compose(pod.id, ComposeRequest::new().with_cores(4).with_memory(4096))
        .await
        .unwrap();
    assert_eq!(machine.cores, 4);
    assert_eq!(machine.status, MachineStatus::Commissioning);

    // Hints are exactly what the driver reported.
    let pod = svc.get_pod(pod.id).unwrap();
    assert_eq!(pod.hints, hints(4, 4096, TIB - 10 * GIB));
    assert_eq!(svc.list_machines(pod.id).unwrap(), vec![machine]);

    let err = svc
        .compose(pod.id, ComposeRequest::new().with_cores(5).with_memory(1000))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded(_)), "{err:?}");
    assert!(err.to_string().starts_with("Unable to compose machine because:"));
    assert_eq!(rack.compose_calls().len(), 1);
    assert_eq!(svc.get_pod(pod.id).unwrap().hints, pod.hints);
}

#[tokio::test]
async fn over_sized_request_never_reaches_the_rack() {
    let svc = service(EngineConfig::default());
    let rack = connect(
        &svc,
        "rack-a",
        ScriptedRackClient::new().with_discover(Reply::Ok(discovered_pod(8, 8192, TIB))),
    );
    let pod = svc.create_pod(kvm("kvm-1")).await.unwrap();

    for request in [
        ComposeRequest::new().with_cores(9),
        ComposeRequest::new().with_memory(8193),
    ] {
        let err = svc.compose(pod.id, request).await.unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded(_)));
    }
    assert!(rack.compose_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_composes_never_overcommit() {
    let svc = Arc::new(service(EngineConfig::default()));
    let rack = connect(
        &svc,
        "rack-a",
        ScriptedRackClient::new()
            .with_latency(Duration::from_millis(200))
            .with_discover(Reply::Ok(discovered_pod(8, 8192, TIB)))
            .with_compose([Reply::Ok(composed(
                "vm-1",
                5,
                2048,
                hints(3, 6144, TIB - 10 * GIB),
            ))]),
    );
    let pod = svc.create_pod(kvm("kvm-1")).await.unwrap();

    let request = || ComposeRequest::new().with_cores(5).with_memory(2048);
    let (a, b) = tokio::join!(svc.compose(pod.id, request()), svc.compose(pod.id, request()));

    let results = [a, b];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    let failure = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(
        matches!(
            failure,
            EngineError::CapacityExceeded(_) | EngineError::ComposeFailed { .. }
        ),
        "{failure:?}"
    );
    assert_eq!(rack.compose_calls().len(), 1);
    assert_eq!(svc.get_pod(pod.id).unwrap().hints.cores, 3);
    assert_eq!(svc.list_machines(pod.id).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn compose_and_refresh_of_one_pod_are_serialized() {
    let svc = service(EngineConfig::default());
    let rack = connect(
        &svc,
        "rack-a",
        ScriptedRackClient::new()
            .with_latency(Duration::from_secs(2))
            .with_discover(Reply::Ok(discovered_pod(8, 8192, TIB)))
            .with_compose([Reply::Ok(composed(
                "vm-1",
                4,
                4096,
                hints(4, 4096, TIB - 10 * GIB),
            ))]),
    );
    let pod = svc.create_pod(kvm("kvm-1")).await.unwrap();

    let start = Instant::now();
    let request = ComposeRequest::new().with_cores(4).with_memory(4096);
    let (machine, refreshed) = tokio::join!(svc.compose(pod.id, request), svc.refresh_pod(pod.id));
    let machine = machine.unwrap();
    let refreshed = refreshed.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(4), "{:?}", start.elapsed());
    assert_eq!(rack.max_in_flight(), 1);
    // The refresh waited for the compose commit and merged over it.
    let calls = rack.calls();
    assert!(matches!(calls[1], RecordedCall::Compose(..)), "{calls:?}");
    assert!(matches!(calls[2], RecordedCall::Discover(_)), "{calls:?}");
    assert_eq!(refreshed.hints, hints(8, 8192, TIB));
    assert_eq!(svc.list_machines(pod.id).unwrap(), vec![machine]);
    assert!(svc.locks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn compose_cancelled_while_waiting_for_the_lock_changes_nothing() {
    let svc = service(EngineConfig::default());
    let rack = connect(
        &svc,
        "rack-a",
        ScriptedRackClient::new()
            .with_latency(Duration::from_millis(200))
            .with_discover(Reply::Ok(discovered_pod(8, 8192, TIB)))
            .with_compose([Reply::Ok(composed("vm-1", 2, 2048, hints(6, 6144, TIB)))]),
    );
    let pod = svc.create_pod(kvm("kvm-1")).await.unwrap();

    let held = svc.locks().acquire(pod.id).await;
    let attempt = tokio::time::timeout(
        Duration::from_secs(5),
        svc.compose(pod.id, ComposeRequest::new().with_cores(2)),
    )
    .await;
    assert!(attempt.is_err());
    drop(held);

    assert!(svc.locks().is_empty());
    assert!(rack.compose_calls().is_empty());
    let after = svc.get_pod(pod.id).unwrap();
    assert_eq!(after.hints, pod.hints);
    assert_eq!(after.capacity, pod.capacity);
    assert!(svc.list_machines(pod.id).unwrap().is_empty());
}

#[tokio::test]
async fn cluster_members_are_registered_once() {
    let svc = service(EngineConfig::default());
    connect(
        &svc,
        "rack-a",
        ScriptedRackClient::new().with_cluster(lxd_cluster(
            "lab",
            &["lxd-0", "lxd-1", "lxd-2"],
            4,
            4096,
        )),
    );

    let pod = svc
        .create_pod(lxd("lab-entry", "https://lxd-1:8443"))
        .await
        .unwrap();
    assert_eq!(pod.name, "lxd-1");
    assert_eq!(pod.cluster.as_ref().unwrap().name, "lab");

    svc.refresh_pod(pod.id).await.unwrap();
    let pods = svc.list_pods().unwrap();
    assert_eq!(pods.len(), 3);
    assert!(pods.iter().all(|p| p.cluster == pod.cluster));

    // A member synced from the cluster cannot be registered again.
    let err = svc
        .create_pod(lxd("again", "https://lxd-2:8443"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateHost { .. }), "{err:?}");
    assert_eq!(svc.list_pods().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn delete_wait_scales_with_decompose() {
    let config = EngineConfig::default().with_delete_timeout(Duration::from_secs(10));
    let svc = service(config);
    connect(
        &svc,
        "rack-a",
        ScriptedRackClient::new().with_discover(Reply::Ok(discovered_pod(8, 8192, TIB))),
    );
    let pod = svc.create_pod(kvm("kvm-1")).await.unwrap();

    // Holding the pod's lock keeps the background delete from finishing.
    let held = svc.locks().acquire(pod.id).await;

    let start = Instant::now();
    let outcome = svc.delete_pod(pod.id, false).await.unwrap();
    let plain = start.elapsed();
    assert_eq!(outcome, DeleteOutcome::Pending);
    assert!(plain >= Duration::from_secs(10) && plain < Duration::from_secs(11), "{plain:?}");

    let start = Instant::now();
    let outcome = svc.delete_pod(pod.id, true).await.unwrap();
    let decompose = start.elapsed();
    assert_eq!(outcome, DeleteOutcome::Pending);
    assert!(
        decompose >= Duration::from_secs(40) && decompose < Duration::from_secs(41),
        "{decompose:?}"
    );

    drop(held);
    // The first background delete now runs to completion.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(matches!(svc.get_pod(pod.id), Err(EngineError::PodNotFound(_))));
}

#[tokio::test]
async fn partial_decompose_failure_keeps_pod_until_acknowledged() {
    let svc = service(EngineConfig::default());
    let mut answer = discovered_pod(8, 8192, TIB);
    answer.machines = vec![
        discovered_machine("vm-a", 2, 2048, 10 * GIB),
        discovered_machine("vm-b", 2, 2048, 10 * GIB),
    ];
    answer.hints = hints(4, 4096, TIB - 20 * GIB);
    let rack = connect(
        &svc,
        "rack-a",
        ScriptedRackClient::new()
            .with_discover(Reply::Ok(answer))
            .with_decompose(Reply::Ok(hints(6, 6144, TIB - 10 * GIB)))
            .with_decompose_for(
                InstanceRef::Virsh {
                    domain: "vm-b".into(),
                },
                Reply::Err(RpcError::ActionFailed("domain is locked".into())),
            ),
    );
    let pod = svc.create_pod(kvm("kvm-1")).await.unwrap();
    let machines = svc.list_machines(pod.id).unwrap();
    assert_eq!(machines.len(), 2);
    let id_of = |domain: &str| {
        machines
            .iter()
            .find(|m| m.hostname == domain)
            .map(|m| m.id)
            .unwrap()
    };
    let (a, b) = (id_of("vm-a"), id_of("vm-b"));

    let report = match svc.delete_pod(pod.id, true).await.unwrap() {
        DeleteOutcome::Finished(report) => report,
        DeleteOutcome::Pending => panic!("delete should finish within the wait"),
    };
    assert_eq!(report.decomposed, vec![a]);
    assert_eq!(report.flagged, vec![b]);
    assert!(!report.pod_removed);
    assert_eq!(rack.calls().len(), 3);

    // A is gone; B is flagged; the pod is still registered and refuses work.
    let remaining = svc.list_machines(pod.id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, b);
    assert!(remaining[0].needs_cleanup());
    let stored = svc.get_pod(pod.id).unwrap();
    assert_eq!(stored.status, PodStatus::Deleting);
    assert!(matches!(
        svc.compose(pod.id, ComposeRequest::new()).await,
        Err(EngineError::PodDeleting(_))
    ));

    // A later plain delete still refuses to drop the flagged machine.
    let report = match svc.delete_pod(pod.id, false).await.unwrap() {
        DeleteOutcome::Finished(report) => report,
        DeleteOutcome::Pending => panic!("delete should finish within the wait"),
    };
    assert_eq!(report.flagged, vec![b]);
    assert!(report.released.is_empty());
    assert!(!report.pod_removed);
    assert_eq!(svc.get_pod(pod.id).unwrap().status, PodStatus::Deleting);
    assert_eq!(svc.list_machines(pod.id).unwrap()[0].id, b);

    let outcome = svc.acknowledge_cleanup(pod.id, b).await.unwrap();
    assert_eq!(outcome, CleanupOutcome::PodRemoved);
    assert!(matches!(svc.get_pod(pod.id), Err(EngineError::PodNotFound(_))));
}
