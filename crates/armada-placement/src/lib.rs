//! armada-placement: node selection for Armada runtime instances.
//!
//! This crate decides WHERE a placement goes. It does not reserve anything
//! (that's `armada-scheduler`, which commits the choice with a
//! compare-and-swap against the node record).
//!
//! # Components
//!
//! - **`requirements`**: Constraints derived from a plan and meta instance
//! - **`filter`**: Candidate filtering with rejection reasons
//! - **`placer`**: First-fit selection

pub mod filter;
pub mod placer;
pub mod requirements;

pub use filter::{Rejection, candidates, check_node};
pub use placer::{explain, first_fit};
pub use requirements::PlacementRequirements;
