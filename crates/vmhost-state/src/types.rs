//! Domain types for the pod registry.
//!
//! These types represent the persisted state of pods and the machines
//! composed on them. All types are serializable to/from JSON for storage in
//! redb tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a pod.
pub type PodId = u64;

/// Unique identifier for a machine.
pub type MachineId = u64;

/// Identifier of a rack controller (its system id).
pub type RackId = String;

// ── Pod type ──────────────────────────────────────────────────────

/// Hypervisor protocol family a pod is driven through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodType {
    Virsh,
    Lxd,
    Rsd,
}

impl PodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodType::Virsh => "virsh",
            PodType::Lxd => "lxd",
            PodType::Rsd => "rsd",
        }
    }
}

impl fmt::Display for PodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a driver tag does not name a known pod type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is an unknown pod type")]
pub struct UnknownPodType(pub String);

impl FromStr for PodType {
    type Err = UnknownPodType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "virsh" => Ok(PodType::Virsh),
            "lxd" => Ok(PodType::Lxd),
            "rsd" => Ok(PodType::Rsd),
            _ => Err(UnknownPodType(s.to_string())),
        }
    }
}

// ── Connection parameters ─────────────────────────────────────────

/// Opaque connection parameters (credentials, addresses) for a pod.
///
/// Never interpreted by this crate. `Debug` prints only the keys so
/// credentials do not leak into logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodParameters(BTreeMap<String, String>);

impl PodParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for PodParameters {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl fmt::Debug for PodParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

// ── Resources ─────────────────────────────────────────────────────

/// Physical totals of a pod as of the last successful discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodCapacity {
    pub cores: u64,
    /// Memory in MiB.
    pub memory: u64,
    /// Local storage in bytes.
    pub local_storage: u64,
    /// CPU speed in MHz.
    pub cpu_speed: u64,
}

/// Spare (uncommitted) capacity of a pod, in the same units as [`PodCapacity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodHints {
    pub cores: u64,
    pub memory: u64,
    pub local_storage: u64,
    pub cpu_speed: u64,
}

/// CPU and memory over-commit multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverCommit {
    #[serde(default = "default_ratio")]
    pub cpu: f64,
    #[serde(default = "default_ratio")]
    pub memory: f64,
}

fn default_ratio() -> f64 {
    1.0
}

impl Default for OverCommit {
    fn default() -> Self {
        Self {
            cpu: default_ratio(),
            memory: default_ratio(),
        }
    }
}

/// A storage pool on the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    /// Backend kind reported by the driver ("dir", "lvm", "zfs", ...).
    pub kind: String,
    pub path: String,
    /// Total size in bytes.
    pub total: u64,
    /// Bytes already allocated.
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub default: bool,
}

impl StoragePool {
    /// Unallocated bytes in this pool.
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

// ── Pod ───────────────────────────────────────────────────────────

/// Lifecycle status of a pod record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    #[default]
    Ready,
    /// Deletion started; composes are refused until the record is removed.
    Deleting,
}

/// A hypervisor cluster a pod belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmCluster {
    pub name: String,
    pub project: String,
}

/// Marker of the last successful discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarker {
    /// Unix timestamp (seconds) of the merge.
    pub synced_at: u64,
    /// Rack controller whose answer was merged.
    pub rack_id: RackId,
    /// Driver/hypervisor version string, when the driver reports one.
    pub driver_version: Option<String>,
}

/// A registered hypervisor host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub id: PodId,
    pub name: String,
    pub pod_type: PodType,
    pub parameters: PodParameters,
    /// Capabilities reported by the driver ("composable", "storage_pools", ...).
    pub capabilities: BTreeSet<String>,
    pub architectures: Vec<String>,
    pub capacity: PodCapacity,
    pub hints: PodHints,
    pub over_commit: OverCommit,
    pub tags: BTreeSet<String>,
    pub resource_pool: String,
    pub zone: String,
    pub storage_pools: Vec<StoragePool>,
    pub default_macvlan_mode: Option<String>,
    /// Set when discovery reports the host as a member of a cluster.
    #[serde(default)]
    pub cluster: Option<VmCluster>,
    pub status: PodStatus,
    pub last_sync: Option<SyncMarker>,
    /// Message of the most recent discovery failure recorded at create/update time.
    pub sync_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Pod {
    /// The pool flagged as default by the driver, if any.
    pub fn default_storage_pool(&self) -> Option<&StoragePool> {
        self.storage_pools.iter().find(|p| p.default)
    }

    /// Look up a storage pool by id or name.
    pub fn storage_pool(&self, id_or_name: &str) -> Option<&StoragePool> {
        self.storage_pools
            .iter()
            .find(|p| p.id == id_or_name || p.name == id_or_name)
    }

    pub fn power_address(&self) -> Option<&str> {
        self.parameters.get("power_address")
    }

    pub fn supports_architecture(&self, architecture: &str) -> bool {
        self.architectures.iter().any(|a| a == architecture)
    }
}

// ── Machine ───────────────────────────────────────────────────────

/// Driver-specific handle to a VM on the hypervisor, used for decompose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum InstanceRef {
    Virsh { domain: String },
    Lxd { project: String, name: String },
    Rsd { node_path: String },
}

impl InstanceRef {
    /// Which pod type produced this handle.
    pub fn pod_type(&self) -> PodType {
        match self {
            InstanceRef::Virsh { .. } => PodType::Virsh,
            InstanceRef::Lxd { .. } => PodType::Lxd,
            InstanceRef::Rsd { .. } => PodType::Rsd,
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRef::Virsh { domain } => write!(f, "virsh:{domain}"),
            InstanceRef::Lxd { project, name } => write!(f, "lxd:{project}/{name}"),
            InstanceRef::Rsd { node_path } => write!(f, "rsd:{node_path}"),
        }
    }
}

fn default_vid() -> i32 {
    -1
}

fn default_block_size() -> u64 {
    512
}

/// A network interface of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub mac_address: String,
    /// VLAN id, `-1` when untagged.
    #[serde(default = "default_vid")]
    pub vid: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub boot: bool,
}

impl Interface {
    pub fn new(mac_address: &str) -> Self {
        Self {
            mac_address: mac_address.to_string(),
            vid: default_vid(),
            tags: Vec::new(),
            boot: false,
        }
    }
}

/// A block device of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub model: Option<String>,
    pub serial: Option<String>,
    /// Size in bytes.
    pub size: u64,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default)]
    pub id_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Storage pool the device was carved from.
    #[serde(default)]
    pub storage_pool: Option<String>,
}

impl BlockDevice {
    pub fn with_size(size: u64) -> Self {
        Self {
            model: None,
            serial: None,
            size,
            block_size: default_block_size(),
            id_path: None,
            tags: Vec::new(),
            storage_pool: None,
        }
    }
}

/// How a machine came to be known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineOrigin {
    /// Created by a compose request.
    Composed,
    /// Already running on the hypervisor when the pod was discovered.
    Discovered,
}

/// Registry-side status of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MachineStatus {
    /// Handed to the commissioning pipeline.
    Commissioning,
    Ready,
    /// A decompose failed; the VM may still exist on the hypervisor.
    CleanupRequired { reason: String },
}

/// A virtual machine hosted by a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub pod_id: PodId,
    pub hostname: String,
    pub architecture: String,
    pub cores: u64,
    /// Memory in MiB.
    pub memory: u64,
    pub cpu_speed: Option<u64>,
    pub block_devices: Vec<BlockDevice>,
    pub interfaces: Vec<Interface>,
    pub instance: InstanceRef,
    pub resource_pool: String,
    pub zone: String,
    pub origin: MachineOrigin,
    pub status: MachineStatus,
    pub created_at: u64,
}

impl Machine {
    /// Build the composite key for the machines table.
    pub fn table_key(&self) -> String {
        machine_key(self.pod_id, self.id)
    }

    /// Total bytes across all block devices.
    pub fn local_storage(&self) -> u64 {
        self.block_devices.iter().map(|d| d.size).fold(0, u64::saturating_add)
    }

    pub fn needs_cleanup(&self) -> bool {
        matches!(self.status, MachineStatus::CleanupRequired { .. })
    }
}

/// Composite key for a machine record.
pub fn machine_key(pod_id: PodId, machine_id: MachineId) -> String {
    format!("{pod_id:016}:{machine_id:016}")
}

/// Prefix shared by every machine key of one pod.
pub fn machine_prefix(pod_id: PodId) -> String {
    format!("{pod_id:016}:")
}
