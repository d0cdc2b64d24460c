//! Token-bucket resource management.
//!
//! Admission control for named resources shared across agents. Shortage is
//! a first-class denial, never an `Err`: [`ResourceManager::request`] returns
//! an [`AllocationOutcome`] and the caller decides whether to retry.

mod bucket;
mod manager;

pub use bucket::{BucketStats, ResourceConfig, TokenBucket};
pub use manager::{
    Allocation, AllocationOutcome, DenialReason, ResourceManager, ResourceRequest,
};
