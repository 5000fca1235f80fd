//! Hardlink Index
//!
//! One-time scan of the physical filesystems behind the pool's branches,
//! grouping every multiply-linked regular file by `(device, inode)`.
//!
//! The scan covers whole mounts rather than just the directories selected
//! for consolidation: a sibling of an in-scope file may live anywhere on the
//! same filesystem. It only runs when hardlink preservation is requested.
//!
//! Mount roots are canonical, so indexed paths are rewritten back onto the
//! branch roots as mergerfs reports them before the planner sees them.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Physical identity of a file
pub type InodeKey = (u64, u64);

/// Index build errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to locate the mount holding {path}: {source}")]
    MountPoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Hardlink scan interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Inode groups across one or more scanned mounts
#[derive(Debug, Default)]
pub struct HardlinkIndex {
    groups: HashMap<InodeKey, Vec<PathBuf>>,
    scanned: Vec<PathBuf>,
}

impl HardlinkIndex {
    /// Index the mounts holding `branches`, scanning each mount once.
    ///
    /// Stops with `IndexError::Interrupted` as soon as `interrupt` is raised.
    pub fn build(branches: &[PathBuf], interrupt: &AtomicBool) -> Result<Self> {
        let mut mounts = BTreeSet::new();
        for branch in branches {
            let mount = find_mount_point(branch).map_err(|source| IndexError::MountPoint {
                path: branch.clone(),
                source,
            })?;
            mounts.insert(mount);
        }
        let mounts: Vec<PathBuf> = mounts.into_iter().collect();
        Ok(Self::scan_roots(&mounts, interrupt)?.with_branch_roots(branches))
    }

    /// Index everything below the given roots without leaving their filesystems.
    pub fn scan_roots(roots: &[PathBuf], interrupt: &AtomicBool) -> Result<Self> {
        let mut index = Self::default();
        for root in roots {
            index.scan(root, interrupt)?;
        }
        info!(
            mounts = index.scanned.len(),
            groups = index.groups.len(),
            "Hardlink index built"
        );
        Ok(index)
    }

    /// Rewrite indexed paths found under a branch's canonical location onto
    /// the branch root itself.
    pub fn with_branch_roots(mut self, branches: &[PathBuf]) -> Self {
        let mut aliases: Vec<(PathBuf, &Path)> = branches
            .iter()
            .filter_map(|branch| match branch.canonicalize() {
                Ok(canonical) if canonical != *branch => Some((canonical, branch.as_path())),
                Ok(_) => None,
                Err(e) => {
                    warn!(branch = %branch.display(), error = %e, "Cannot resolve branch root");
                    None
                }
            })
            .collect();
        if aliases.is_empty() {
            return self;
        }
        aliases.sort_by_key(|(canonical, _)| Reverse(canonical.as_os_str().len()));

        for path in self.groups.values_mut().flatten() {
            let rebased = aliases.iter().find_map(|(canonical, branch)| {
                path.strip_prefix(canonical).ok().map(|rel| branch.join(rel))
            });
            if let Some(rebased) = rebased {
                *path = rebased;
            }
        }
        self
    }

    fn scan(&mut self, root: &Path, interrupt: &AtomicBool) -> Result<()> {
        debug!(root = %root.display(), "Scanning for hardlinks");
        let walker = WalkDir::new(root)
            .follow_links(false)
            .same_file_system(true)
            .sort_by_file_name();

        for entry in walker {
            if interrupt.load(Ordering::SeqCst) {
                return Err(IndexError::Interrupted);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable path during hardlink scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Stat failed");
                    continue;
                }
            };
            if meta.nlink() > 1 {
                self.groups
                    .entry((meta.dev(), meta.ino()))
                    .or_default()
                    .push(entry.into_path());
            }
        }
        self.scanned.push(root.to_path_buf());
        Ok(())
    }

    /// Every indexed path sharing `key`, the queried file included.
    pub fn group(&self, key: InodeKey) -> &[PathBuf] {
        self.groups.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of inode groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn scanned_roots(&self) -> &[PathBuf] {
        &self.scanned
    }
}

/// `(device, inode)` of `path` without following symlinks.
pub fn inode_key(path: &Path) -> io::Result<InodeKey> {
    let meta = fs::symlink_metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

/// Walk up from `path` to the top directory still on the same device.
pub fn find_mount_point(path: &Path) -> io::Result<PathBuf> {
    let path = path.canonicalize()?;
    let dev = fs::metadata(&path)?.dev();

    let mut mount = path.as_path();
    while let Some(parent) = mount.parent() {
        if fs::metadata(parent)?.dev() != dev {
            break;
        }
        mount = parent;
    }
    Ok(mount.to_path_buf())
}

/// Split a physical path into its branch root and branch-relative path.
///
/// The longest matching branch root wins, so nested branches resolve to the
/// innermost one.
pub fn split_branch_path<'a, I>(path: &Path, branches: I) -> Option<(PathBuf, PathBuf)>
where
    I: IntoIterator<Item = &'a Path>,
{
    branches
        .into_iter()
        .filter_map(|branch| {
            path.strip_prefix(branch)
                .ok()
                .map(|rel| (branch, rel.to_path_buf()))
        })
        .filter(|(_, rel)| !rel.as_os_str().is_empty())
        .max_by_key(|(branch, _)| branch.as_os_str().len())
        .map(|(branch, rel)| (branch.to_path_buf(), rel))
}
