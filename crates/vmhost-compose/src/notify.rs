//! Hand-off to the commissioning pipeline.

use tracing::info;
use vmhost_state::Machine;

/// Receives newly composed machines once they are committed.
pub trait MachineNotifier: Send + Sync {
    fn machine_created(&self, machine: &Machine);
}

/// Notifier that only logs. Used when no commissioning pipeline is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl MachineNotifier for LogNotifier {
    fn machine_created(&self, machine: &Machine) {
        info!(
            pod_id = machine.pod_id,
            machine_id = machine.id,
            hostname = %machine.hostname,
            "machine ready for commissioning"
        );
    }
}
