//! vmhost-compose — the composition engine and pod service.
//!
//! Sits on top of the registry ([`vmhost_state`]), the rack boundary
//! ([`vmhost_rack`]), capacity bookkeeping ([`vmhost_capacity`]) and
//! discovery ([`vmhost_discovery`]).
//!
//! # Components
//!
//! - **`service`** — [`PodService`], the entry point for pod lifecycle,
//!   tags, compose, decompose and delete
//! - **`orchestrator`** — [`Composer`], which runs compose and decompose
//!   operations under a pod's composition lock
//! - **`operation`** — the per-operation state machine
//! - **`config`** — TOML engine configuration
//! - **`telemetry`** — tracing subscriber setup
//!
//! Once a remote compose or decompose call has been dispatched, the rest of
//! the operation runs to completion even if the caller goes away, so the
//! registry never misses a machine the hypervisor created.

pub mod config;
pub mod error;
pub mod notify;
pub mod operation;
pub mod orchestrator;
pub mod service;
pub mod telemetry;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use notify::{LogNotifier, MachineNotifier};
pub use operation::{Operation, OperationKind, OperationState};
pub use orchestrator::{CleanupOutcome, Composer, DeleteReport};
pub use service::{DeleteOutcome, NewPod, PodService, PodUpdate};
pub use telemetry::init_tracing;
