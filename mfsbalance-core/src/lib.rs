//! mfsbalance Core Library
//!
//! Core abstractions shared by the mfsbalance tools.
//! This crate provides:
//! - The `AttributeProvider` capability for querying a mergerfs pool
//! - Native extended-attribute reads (`lgetxattr`)
//! - Control file discovery for merged mounts
//! - Per-branch free space measurement
//! - Size parsing with binary suffixes
//! - Common error handling

pub mod attributes;
pub mod capacity;
pub mod error;
pub mod size;
pub mod xattr;

pub use attributes::{
    locate_control_file, parse_branch_list, AttributeProvider, MergedMount, XattrProvider,
};
pub use capacity::available_bytes;
pub use error::{MfsError, Result};
pub use size::{format_size, parse_size};

/// Name of the per-mount control file exposed by mergerfs
pub const CONTROL_FILE_NAME: &str = ".mergerfs";

/// Extended attribute names exposed by mergerfs
pub const XATTR_VERSION: &str = "user.mergerfs.version";
pub const XATTR_RELPATH: &str = "user.mergerfs.relpath";
pub const XATTR_BASEPATH: &str = "user.mergerfs.basepath";
pub const XATTR_SRCMOUNTS: &str = "user.mergerfs.srcmounts";
