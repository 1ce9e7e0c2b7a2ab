//! Lifecycle of a single compose or decompose operation.
//!
//! ```text
//! Idle → Validating → Requesting → Committing → Done
//!            └────────────┴────────────┴──────→ Failed
//! ```

use std::fmt;

use tracing::{debug, warn};
use vmhost_state::{MachineId, PodId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Compose,
    Decompose,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Compose => f.write_str("compose"),
            OperationKind::Decompose => f.write_str("decompose"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Validating,
    Requesting,
    Committing,
    Done,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Done | OperationState::Failed)
    }

    fn can_advance_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Requesting)
                | (Requesting, Committing)
                | (Committing, Done)
                | (Validating | Requesting | Committing, Failed)
        )
    }
}

/// Tracks one operation through its states and logs every transition.
#[derive(Debug)]
pub struct Operation {
    kind: OperationKind,
    pod_id: PodId,
    machine_id: Option<MachineId>,
    state: OperationState,
}

impl Operation {
    pub fn new(kind: OperationKind, pod_id: PodId) -> Self {
        Self {
            kind,
            pod_id,
            machine_id: None,
            state: OperationState::Idle,
        }
    }

    pub fn for_machine(kind: OperationKind, pod_id: PodId, machine_id: MachineId) -> Self {
        Self {
            machine_id: Some(machine_id),
            ..Self::new(kind, pod_id)
        }
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn set_machine(&mut self, machine_id: MachineId) {
        self.machine_id = Some(machine_id);
    }

    /// Move to `next`.
    ///
    /// # Panics
    ///
    /// On a transition outside the lifecycle graph.
    pub fn advance(&mut self, next: OperationState) {
        assert!(
            self.state.can_advance_to(next),
            "illegal {} transition {:?} -> {:?} on pod {}",
            self.kind,
            self.state,
            next,
            self.pod_id
        );
        debug!(
            op = %self.kind,
            pod_id = self.pod_id,
            machine_id = ?self.machine_id,
            from = ?self.state,
            to = ?next,
            "operation transition"
        );
        self.state = next;
    }

    /// Move to `Failed`, logging the reason.
    pub fn fail(&mut self, reason: &dyn fmt::Display) {
        self.advance(OperationState::Failed);
        warn!(
            op = %self.kind,
            pod_id = self.pod_id,
            machine_id = ?self.machine_id,
            %reason,
            "operation failed"
        );
    }
}
