//! StateStore: redb-backed pod registry.
//!
//! Provides typed CRUD operations over pods and machines, id allocation, and
//! multi-record commits that land in a single write transaction. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe pod registry backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "pod registry opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory pod registry opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PODS).map_err(map_err!(Table))?;
        txn.open_table(MACHINES).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Ids ────────────────────────────────────────────────────────

    /// Allocate the next id for an entity kind. Ids start at 1.
    pub fn allocate_id(&self, kind: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let current = table
                .get(kind)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            next = current + 1;
            table.insert(kind, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    // ── Pods ───────────────────────────────────────────────────────

    /// Insert or update a pod.
    pub fn put_pod(&self, pod: &Pod) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        write_pod(&txn, pod)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pod_id = pod.id, name = %pod.name, "pod stored");
        Ok(())
    }

    /// Get a pod by id.
    pub fn get_pod(&self, pod_id: PodId) -> StateResult<Option<Pod>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PODS).map_err(map_err!(Table))?;
        match table.get(pod_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let pod: Pod =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(pod))
            }
            None => Ok(None),
        }
    }

    /// Get a pod by id, failing with `PodNotFound` when absent.
    pub fn require_pod(&self, pod_id: PodId) -> StateResult<Pod> {
        self.get_pod(pod_id)?.ok_or(StateError::PodNotFound(pod_id))
    }

    /// List all pods ordered by id.
    pub fn list_pods(&self) -> StateResult<Vec<Pod>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PODS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let pod: Pod = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(pod);
        }
        Ok(results)
    }

    /// Find a pod by its (unique) name.
    pub fn find_pod_by_name(&self, name: &str) -> StateResult<Option<Pod>> {
        Ok(self.list_pods()?.into_iter().find(|p| p.name == name))
    }

    /// Delete a pod and every machine record it hosts, in one transaction.
    ///
    /// Returns the number of machine records removed, or `None` if the pod
    /// did not exist.
    pub fn remove_pod(&self, pod_id: PodId) -> StateResult<Option<u32>> {
        let prefix = machine_prefix(pod_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let mut keys = Vec::new();
        {
            let mut pods = txn.open_table(PODS).map_err(map_err!(Table))?;
            existed = pods.remove(pod_id).map_err(map_err!(Write))?.is_some();
            let mut machines = txn.open_table(MACHINES).map_err(map_err!(Table))?;
            for entry in machines.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let key = key.value().to_string();
                if !key.starts_with(&prefix) {
                    break;
                }
                keys.push(key);
            }
            for key in &keys {
                machines.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pod_id, existed, machines = keys.len(), "pod removed");
        Ok(existed.then_some(keys.len() as u32))
    }

    // ── Machines ───────────────────────────────────────────────────

    /// Insert or update a machine.
    pub fn put_machine(&self, machine: &Machine) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        write_machine(&txn, machine)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a machine hosted by a pod.
    pub fn get_machine(
        &self,
        pod_id: PodId,
        machine_id: MachineId,
    ) -> StateResult<Option<Machine>> {
        let key = machine_key(pod_id, machine_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let machine: Machine =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(machine))
            }
            None => Ok(None),
        }
    }

    /// Get a machine, failing with `MachineNotFound` when absent.
    pub fn require_machine(&self, pod_id: PodId, machine_id: MachineId) -> StateResult<Machine> {
        self.get_machine(pod_id, machine_id)?
            .ok_or(StateError::MachineNotFound { pod_id, machine_id })
    }

    /// List every machine hosted by a pod, ordered by machine id.
    pub fn list_machines_for_pod(&self, pod_id: PodId) -> StateResult<Vec<Machine>> {
        let prefix = machine_prefix(pod_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let machine: Machine =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(machine);
        }
        Ok(results)
    }

    /// Delete a machine. Returns true if it existed.
    pub fn delete_machine(&self, pod_id: PodId, machine_id: MachineId) -> StateResult<bool> {
        let key = machine_key(pod_id, machine_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Atomic commits ─────────────────────────────────────────────

    /// Write a pod together with machine upserts and removals in one
    /// transaction. Either every change lands or none does.
    pub fn commit_pod(
        &self,
        pod: &Pod,
        upserts: &[Machine],
        removals: &[MachineId],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        write_pod(&txn, pod)?;
        for machine in upserts {
            write_machine(&txn, machine)?;
        }
        {
            let mut table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
            for machine_id in removals {
                let key = machine_key(pod.id, *machine_id);
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            pod_id = pod.id,
            upserts = upserts.len(),
            removals = removals.len(),
            "pod committed"
        );
        Ok(())
    }
}

fn write_pod(txn: &WriteTransaction, pod: &Pod) -> StateResult<()> {
    let value = serde_json::to_vec(pod).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(PODS).map_err(map_err!(Table))?;
    table
        .insert(pod.id, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn write_machine(txn: &WriteTransaction, machine: &Machine) -> StateResult<()> {
    let key = machine.table_key();
    let value = serde_json::to_vec(machine).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
    table
        .insert(key.as_str(), value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}
