//! vmhost-discovery — discovering pods through every rack that may reach them.
//!
//! One discovery RPC is issued per live rack controller, concurrently and
//! each under its own timeout. Results are gathered without short-circuiting
//! into an [`DiscoveryOutcome`]. When at least one rack succeeded, the answer
//! from the lowest rack id is merged into the pod record under the pod's
//! composition lock. Divergent answers from different racks are not
//! cross-checked; all racks are assumed to observe the same hypervisor.

pub mod coordinator;
pub mod error;
pub mod outcome;

pub use coordinator::DiscoveryCoordinator;
pub use error::{DiscoveryError, DiscoveryResult};
pub use outcome::{DiscoveryOutcome, NO_RACKS_MESSAGE};
