//! Secret rotation
//!
//! A rotation moves through
//! `IDLE → VALIDATING → BACKING_UP → ROTATING → TESTING → VERIFYING`
//! and ends in `COMMITTED` or `ROLLED_BACK`. At most one rotation per secret
//! runs at a time; rotations of different secrets run in parallel.

pub mod coordinator;
mod machine;
pub mod generator;
pub mod probes;
pub mod scheduler;

pub use coordinator::{RotationCoordinator, RotationRequest};
pub use generator::generate_credential;
pub use probes::{ApiKeyProbe, ConnectivityProbe, DatabaseProbe, OAuthProbe, ProbeOutcome, ProbeSet};
pub use scheduler::{RotationScheduler, SchedulerSummary};
