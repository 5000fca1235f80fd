//! Merged mount attributes
//!
//! mergerfs publishes pool metadata through extended attributes:
//! - `user.mergerfs.version` on any member path marks a merged mount
//! - `user.mergerfs.relpath` gives a file's path relative to its branch
//! - `user.mergerfs.basepath` gives the root of the branch storing a file
//! - `user.mergerfs.srcmounts` on the control file lists all branch roots
//!
//! `AttributeProvider` is the seam the planner talks to. `XattrProvider`
//! is the native implementation; tests substitute an in-memory fake.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{MfsError, Result};
use crate::{xattr, CONTROL_FILE_NAME, XATTR_BASEPATH, XATTR_RELPATH, XATTR_SRCMOUNTS, XATTR_VERSION};

/// Capability for querying a merged filesystem.
///
/// Lookups return `Ok(None)` when the attribute is absent; any other
/// failure is an error.
pub trait AttributeProvider {
    /// Whether `path` belongs to a merged mount.
    fn is_merged_mount(&self, path: &Path) -> Result<bool>;

    /// Path of `path` relative to the branch that stores it.
    fn relative_path(&self, path: &Path) -> Result<Option<PathBuf>>;

    /// Root of the branch that physically stores `path`.
    fn owning_branch(&self, path: &Path) -> Result<Option<PathBuf>>;

    /// Branch roots of the pool that owns `control_file`.
    fn branch_roots(&self, control_file: &Path) -> Result<Vec<PathBuf>>;
}

/// Native provider backed by `lgetxattr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct XattrProvider;

impl XattrProvider {
    pub fn new() -> Self {
        Self
    }

    fn read(&self, path: &Path, name: &str) -> Result<Option<String>> {
        xattr::get_string(path, name).map_err(|source| MfsError::AttributeRead {
            path: path.to_path_buf(),
            name: name.to_string(),
            source,
        })
    }
}

impl AttributeProvider for XattrProvider {
    fn is_merged_mount(&self, path: &Path) -> Result<bool> {
        Ok(self.read(path, XATTR_VERSION)?.is_some())
    }

    fn relative_path(&self, path: &Path) -> Result<Option<PathBuf>> {
        Ok(self
            .read(path, XATTR_RELPATH)?
            .map(|rel| PathBuf::from(rel.trim_start_matches('/'))))
    }

    fn owning_branch(&self, path: &Path) -> Result<Option<PathBuf>> {
        Ok(self.read(path, XATTR_BASEPATH)?.map(PathBuf::from))
    }

    fn branch_roots(&self, control_file: &Path) -> Result<Vec<PathBuf>> {
        let raw = self
            .read(control_file, XATTR_SRCMOUNTS)?
            .ok_or_else(|| MfsError::MissingAttribute {
                path: control_file.to_path_buf(),
                name: XATTR_SRCMOUNTS.to_string(),
            })?;
        Ok(parse_branch_list(&raw))
    }
}

/// Split a colon separated branch list.
///
/// Empty entries are dropped, `=MODE` suffixes (`=RW`, `=NC`, ...) are
/// stripped and the result is sorted and deduplicated.
pub fn parse_branch_list(raw: &str) -> Vec<PathBuf> {
    raw.trim_end_matches(['\0', '\n'])
        .split(':')
        .map(|entry| entry.split_once('=').map_or(entry, |(path, _)| path))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(PathBuf::from)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Find the nearest control file at or above `start`.
///
/// The filesystem root itself is never considered part of a pool.
pub fn locate_control_file(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        if dir.parent().is_none() {
            break;
        }
        let candidate = dir.join(CONTROL_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// A resolved merged mount: its control file and branch roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedMount {
    pub control_file: PathBuf,
    pub branches: Vec<PathBuf>,
}

impl MergedMount {
    /// Resolve the pool containing `start`.
    ///
    /// Fails with `NotAMergedMount` when no control file is found or the one
    /// found does not carry the mergerfs marker.
    pub fn resolve<P: AttributeProvider + ?Sized>(provider: &P, start: &Path) -> Result<Self> {
        let control_file = locate_control_file(start)
            .ok_or_else(|| MfsError::NotAMergedMount(start.to_path_buf()))?;

        if !provider.is_merged_mount(&control_file)? {
            return Err(MfsError::NotAMergedMount(start.to_path_buf()));
        }

        let branches = provider.branch_roots(&control_file)?;
        debug!(
            control_file = %control_file.display(),
            branches = branches.len(),
            "Resolved merged mount"
        );

        Ok(Self {
            control_file,
            branches,
        })
    }

    /// Directory holding the control file, i.e. the merged mount point.
    pub fn mount_point(&self) -> &Path {
        self.control_file.parent().unwrap_or(Path::new("/"))
    }
}
