//! vmhost-capacity — the capacity accountant.
//!
//! Pure bookkeeping over a pod's capacity and hints. Nothing here talks to a
//! rack or to the registry; callers load a pod, hold its composition lock and
//! pass the guard to every mutating function.
//!
//! # Components
//!
//! - **`request`** — caller-facing compose requests and their defaults
//! - **`accountant`** — effective capacity, validation, debit, credit, replace

pub mod accountant;
pub mod error;
pub mod request;

pub use accountant::{ResourceAmount, credit, debit, effective_capacity, replace, validate};
pub use error::{CapacityError, CapacityResult, Resource};
pub use request::{ComposeDefaults, ComposeRequest, resolve};
