//! Values exchanged with drivers over the rack RPC boundary.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use vmhost_state::{
    BlockDevice, InstanceRef, Interface, Pod, PodCapacity, PodHints, PodId, PodParameters,
    PodType, StoragePool,
};

/// What a driver needs to address a pod: its type and opaque credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodContext {
    pub pod_id: PodId,
    pub name: String,
    pub pod_type: PodType,
    pub parameters: PodParameters,
}

impl PodContext {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            pod_id: pod.id,
            name: pod.name.clone(),
            pod_type: pod.pod_type,
            parameters: pod.parameters.clone(),
        }
    }
}

/// Driver-specific extras reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum DriverFacts {
    Virsh {
        libvirt_version: Option<String>,
    },
    Lxd {
        project: String,
        server_version: Option<String>,
    },
    Rsd {
        api_version: Option<String>,
    },
}

impl DriverFacts {
    pub fn pod_type(&self) -> PodType {
        match self {
            DriverFacts::Virsh { .. } => PodType::Virsh,
            DriverFacts::Lxd { .. } => PodType::Lxd,
            DriverFacts::Rsd { .. } => PodType::Rsd,
        }
    }

    /// Version string of the hypervisor API, if the driver reported one.
    pub fn version(&self) -> Option<&str> {
        match self {
            DriverFacts::Virsh { libvirt_version } => libvirt_version.as_deref(),
            DriverFacts::Lxd { server_version, .. } => server_version.as_deref(),
            DriverFacts::Rsd { api_version } => api_version.as_deref(),
        }
    }
}

/// One rack's view of a pod, as returned by a successful discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPod {
    pub architectures: Vec<String>,
    pub capacity: PodCapacity,
    pub hints: PodHints,
    #[serde(default)]
    pub storage_pools: Vec<StoragePool>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Machines already running on the hypervisor.
    #[serde(default)]
    pub machines: Vec<DiscoveredMachine>,
    pub facts: DriverFacts,
}

/// One host of a discovered cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Name the cluster knows the host by.
    pub name: String,
    /// Power address reaching this host directly.
    pub address: String,
    pub pod: DiscoveredPod,
}

/// A cluster reported in place of a single host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredCluster {
    pub name: String,
    pub project: String,
    pub members: Vec<ClusterMember>,
}

impl DiscoveredCluster {
    /// The member a pod at `address` stands for: the one reachable at that
    /// address, or the first member when none is.
    pub fn member_for(&self, address: Option<&str>) -> Option<usize> {
        address
            .and_then(|addr| self.members.iter().position(|m| m.address == addr))
            .or_else(|| (!self.members.is_empty()).then_some(0))
    }
}

/// A driver's answer to discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discovery {
    Host(DiscoveredPod),
    Cluster(DiscoveredCluster),
}

impl Discovery {
    /// Every per-host answer carried, members in cluster order.
    pub fn hosts(&self) -> Vec<&DiscoveredPod> {
        match self {
            Discovery::Host(pod) => vec![pod],
            Discovery::Cluster(cluster) => cluster.members.iter().map(|m| &m.pod).collect(),
        }
    }
}

impl From<DiscoveredPod> for Discovery {
    fn from(pod: DiscoveredPod) -> Self {
        Discovery::Host(pod)
    }
}

impl From<DiscoveredCluster> for Discovery {
    fn from(cluster: DiscoveredCluster) -> Self {
        Discovery::Cluster(cluster)
    }
}

/// A VM as described by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredMachine {
    pub hostname: String,
    pub architecture: String,
    pub cores: u64,
    /// Memory in MiB.
    pub memory: u64,
    #[serde(default)]
    pub cpu_speed: Option<u64>,
    #[serde(default)]
    pub block_devices: Vec<BlockDevice>,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    pub instance: InstanceRef,
}

impl DiscoveredMachine {
    pub fn local_storage(&self) -> u64 {
        self.block_devices.iter().map(|d| d.size).fold(0, u64::saturating_add)
    }
}

/// A disk to carve out for a new machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedDisk {
    /// Size in bytes.
    pub size: u64,
    pub storage_pool: Option<String>,
}

/// A fully resolved compose request as sent to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedMachine {
    pub hostname: Option<String>,
    pub architecture: String,
    pub cores: u64,
    /// Memory in MiB.
    pub memory: u64,
    pub cpu_speed: Option<u64>,
    pub disks: Vec<RequestedDisk>,
    /// Number of network interfaces to attach.
    pub interfaces: u32,
}

impl RequestedMachine {
    /// Total bytes across all requested disks, saturating at `u64::MAX`.
    pub fn local_storage(&self) -> u64 {
        self.disks.iter().map(|d| d.size).fold(0, u64::saturating_add)
    }
}

/// Result of a successful compose: the new VM and the driver's fresh hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedMachine {
    pub machine: DiscoveredMachine,
    pub hints: PodHints,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_facts_version() {
        let facts = DriverFacts::Lxd {
            project: "default".into(),
            server_version: Some("5.21".into()),
        };
        assert_eq!(facts.pod_type(), PodType::Lxd);
        assert_eq!(facts.version(), Some("5.21"));
        assert_eq!(DriverFacts::Rsd { api_version: None }.version(), None);
    }

    #[test]
    fn cluster_member_matches_address_or_falls_back_to_first() {
        let member = |name: &str| ClusterMember {
            name: name.into(),
            address: format!("https://{name}:8443"),
            pod: DiscoveredPod {
                architectures: Vec::new(),
                capacity: PodCapacity::default(),
                hints: PodHints::default(),
                storage_pools: Vec::new(),
                capabilities: BTreeSet::new(),
                machines: Vec::new(),
                facts: DriverFacts::Lxd {
                    project: "default".into(),
                    server_version: None,
                },
            },
        };
        let cluster = DiscoveredCluster {
            name: "lab".into(),
            project: "default".into(),
            members: vec![member("lxd-0"), member("lxd-1")],
        };
        assert_eq!(cluster.member_for(Some("https://lxd-1:8443")), Some(1));
        assert_eq!(cluster.member_for(Some("https://10.0.0.9:8443")), Some(0));
        assert_eq!(cluster.member_for(None), Some(0));

        let answer = Discovery::from(cluster);
        assert_eq!(answer.hosts().len(), 2);
        let wire = serde_json::to_value(&answer).unwrap();
        assert_eq!(wire["kind"], "cluster");

        let empty = DiscoveredCluster {
            name: "lab".into(),
            project: "default".into(),
            members: Vec::new(),
        };
        assert_eq!(empty.member_for(Some("https://lxd-0:8443")), None);
    }

    #[test]
    fn discovered_machine_defaults_from_wire() {
        let json = r#"{
            "hostname": "vm-1",
            "architecture": "amd64/generic",
            "cores": 2,
            "memory": 2048,
            "block_devices": [{"model": null, "serial": null, "size": 1024}],
            "interfaces": [{"mac_address": "52:54:00:aa:bb:cc"}],
            "instance": {"driver": "virsh", "domain": "vm-1"}
        }"#;
        let m: DiscoveredMachine = serde_json::from_str(json).unwrap();
        assert_eq!(m.interfaces[0].vid, -1);
        assert!(!m.interfaces[0].boot);
        assert_eq!(m.block_devices[0].block_size, 512);
        assert_eq!(m.cpu_speed, None);
        assert_eq!(m.local_storage(), 1024);
    }

    #[test]
    fn requested_storage_sums_disks() {
        let req = RequestedMachine {
            hostname: None,
            architecture: "amd64/generic".into(),
            cores: 1,
            memory: 1024,
            cpu_speed: None,
            disks: vec![
                RequestedDisk {
                    size: 10,
                    storage_pool: None,
                },
                RequestedDisk {
                    size: 32,
                    storage_pool: Some("default".into()),
                },
            ],
            interfaces: 1,
        };
        assert_eq!(req.local_storage(), 42);
    }

    #[test]
    fn requested_storage_saturates() {
        let disk = |size| RequestedDisk {
            size,
            storage_pool: None,
        };
        let req = RequestedMachine {
            hostname: None,
            architecture: "amd64/generic".into(),
            cores: 1,
            memory: 1024,
            cpu_speed: None,
            disks: vec![disk(u64::MAX), disk(2)],
            interfaces: 1,
        };
        assert_eq!(req.local_storage(), u64::MAX);
    }
}
