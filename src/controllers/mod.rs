//! Controllers for the restore operator
//!
//! Each controller watches its resource and drives the actual state of the
//! cluster toward the intent it declares: restores, and claims populated
//! from a restore.

mod restore;
mod volume_populator;

pub use restore::{is_workload_ready, RestoreController, WORKLOAD_READY_ANNOTATION};
pub use volume_populator::VolumePopulatorController;
