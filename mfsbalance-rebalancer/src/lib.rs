//! mfsbalance Rebalancer Library
//!
//! Consolidates "hot" directories of a mergerfs pool: directories whose
//! files are spread over several branches get all of their files moved onto
//! the branch with the most free space.
//!
//! The rebalancer performs:
//! - Directory scanning and eligibility filtering
//! - Target branch selection against a speculative capacity ledger
//! - Move planning with optional hardlink preservation
//! - Command rendering and (optionally) execution

pub mod config;
pub mod executor;
pub mod filter;
pub mod hardlinks;
pub mod ledger;
pub mod planner;
pub mod scanner;

// Re-export main types
pub use config::{ConfigError, ConsolidateConfig};
pub use executor::{
    setup_command_for, ActionEmitter, ActionOutcome, ActionSink, EmitError, TransferCommand,
};
pub use filter::{DirectoryFilter, Eligibility};
pub use hardlinks::{find_mount_point, HardlinkIndex, IndexError};
pub use ledger::{CapacityLedger, LedgerError};
pub use planner::{ConsolidationPlanner, FileEntry, PlanAction, PlanSummary, PlannerError};
pub use scanner::{scan_directory, DirectoryBatch, FileStat};
