//! Per-rack results of one discovery round.

use std::collections::BTreeMap;

use vmhost_rack::{Discovery, RpcError};
use vmhost_state::RackId;

/// Message surfaced when no rack controller was available to ask.
pub const NO_RACKS_MESSAGE: &str = "No rack controllers connected to discover a pod.";

/// Successes and failures of one fan-out, keyed by rack id.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    pub successes: BTreeMap<RackId, Discovery>,
    pub failures: BTreeMap<RackId, RpcError>,
}

impl DiscoveryOutcome {
    /// True when no rack was asked at all.
    pub fn is_empty(&self) -> bool {
        self.successes.is_empty() && self.failures.is_empty()
    }

    /// The answer to merge: the success from the lowest rack id.
    pub fn authoritative(&self) -> Option<(&RackId, &Discovery)> {
        self.successes.iter().next()
    }

    /// The failure to surface when nothing succeeded.
    ///
    /// Highest [`RpcError::severity`] wins; ties go to the lowest rack id.
    pub fn worst_failure(&self) -> Option<(&RackId, &RpcError)> {
        let mut worst: Option<(&RackId, &RpcError)> = None;
        for (rack_id, err) in &self.failures {
            match worst {
                Some((_, w)) if w.severity() >= err.severity() => {}
                _ => worst = Some((rack_id, err)),
            }
        }
        worst
    }

    /// Operator-facing message for a failed round.
    pub fn failure_message(&self) -> String {
        match self.worst_failure() {
            Some((_, err)) => err.to_string(),
            None => NO_RACKS_MESSAGE.to_string(),
        }
    }
}
