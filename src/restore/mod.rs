//! Restore engine
//!
//! - `resolver`: backup lineage resolution and validation
//! - `builder`: task and claim construction
//! - `tracker`: per-task action records in the restore status
//! - `manager`: the phase machine driving a restore
//! - `populator`: filling claims that name a restore as their data source
//! - `platform`: the cluster operations the engine needs

pub mod builder;
pub mod manager;
pub mod platform;
pub mod populator;
pub mod resolver;
pub mod tracker;

#[cfg(test)]
pub mod testing;

pub use manager::{cleanup_tasks, format_duration, RestoreManager, RestoreProgress};
pub use platform::{KubePlatform, RestorePlatform, TaskPhase};
pub use populator::{PopulateProgress, VolumePopulator};
pub use resolver::{BackupActionSet, ResolvedBackupSets};
pub use tracker::ActionProgress;
