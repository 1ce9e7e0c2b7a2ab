//! redb table definitions for the pod registry.

use redb::TableDefinition;

/// Pod records keyed by pod id.
pub const PODS: TableDefinition<u64, &[u8]> = TableDefinition::new("pods");

/// Machine records keyed by `{pod_id:016}:{machine_id:016}`.
pub const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("machines");

/// Monotonic id counters keyed by entity kind (`pod`, `machine`).
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
