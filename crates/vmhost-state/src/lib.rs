//! vmhost-state — the pod registry.
//!
//! Backed by [redb](https://docs.rs/redb), this crate is the single source of
//! truth for pods (hypervisor hosts), their capacity and hints, and the
//! machines composed on them.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Machines use the composite key `{pod_id}:{machine_id}` (zero padded) so a
//! prefix scan returns every machine hosted by one pod.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Writers are expected to hold the
//! pod's composition lock from [`lock::PodLocks`] while they read-modify-write
//! a pod record.

pub mod error;
pub mod lock;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use lock::{PodLockGuard, PodLocks};
pub use store::StateStore;
pub use types::*;
