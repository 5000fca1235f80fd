//! Directory Scanner
//!
//! Reads one merged-tree directory into a `DirectoryBatch`: the stat data of
//! its direct, non-directory children. Subdirectories are left to the walk.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use mfsbalance_core::CONTROL_FILE_NAME;

/// Stat data for one regular file in the merged tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: PathBuf,
    pub size: u64,
    pub inode: u64,
    pub nlink: u64,
}

/// Direct children of one directory
#[derive(Debug, Clone, Default)]
pub struct DirectoryBatch {
    pub path: PathBuf,
    /// Regular files, sorted by path
    pub files: Vec<FileStat>,
    /// Symlinks, devices, sockets and other non-regular entries
    pub other_entries: usize,
}

impl DirectoryBatch {
    /// Number of non-directory entries, regular or not
    pub fn file_count(&self) -> usize {
        self.files.len() + self.other_entries
    }

    /// Combined size of the regular files
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Scan the direct children of `dir`.
///
/// Entries that disappear between listing and stat are ignored. The mergerfs
/// control file is never part of a batch.
pub fn scan_directory(dir: &Path) -> io::Result<DirectoryBatch> {
    let mut batch = DirectoryBatch {
        path: dir.to_path_buf(),
        ..Default::default()
    };

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == CONTROL_FILE_NAME {
            continue;
        }

        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Entry vanished during scan");
                continue;
            }
            Err(e) => return Err(e),
        };

        let file_type = meta.file_type();
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_file() {
            batch.files.push(FileStat {
                path,
                size: meta.len(),
                inode: meta.ino(),
                nlink: meta.nlink(),
            });
        } else {
            batch.other_entries += 1;
        }
    }

    batch.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(batch)
}
