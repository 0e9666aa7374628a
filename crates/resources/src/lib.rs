//! Resource management - host sampling, admission control and leases.

#![warn(missing_docs)]

pub mod sampler;
pub mod lease;
pub mod manager;

pub use sampler::{FixedSampler, ResourceSampler, SampleError, SystemSampler};
pub use lease::{ActiveLease, LeaseExpiry, LeaseOutcome, LeasePolicy, LeaseRecord};
pub use manager::{
    Admission, DenyReason, LeaseGuard, LimitChecks, ReclaimedLease, ResourceManager,
    ResourceReport,
};
