//! armada-scheduler: runtime-instance allocation.
//!
//! Reserves node capacity for a new placement of a meta instance and
//! records the placement on the aggregate. The scheduler:
//!
//! - Derives placement requirements from the owning deployment plan
//! - Picks the first fitting node (via `armada-placement`)
//! - Reserves capacity with a version-checked update of the node
//! - Retries against a fresh node list when another writer wins the race
//! - Releases reservations idempotently
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── StateStore (read plan + nodes, CAS node, CAS meta instance)
//!   └── armada-placement (first_fit over the fresh snapshot)
//! ```

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{Allocation, Scheduler, SchedulerConfig};
