//! Capacity Ledger
//!
//! Speculative record of free space per branch while a plan is built.
//! Measured once at startup, then only shifted by planned moves:
//! - The source branch is credited with the moved size
//! - The target branch is debited with the same size
//!
//! The total across branches never changes. Values may go negative when a
//! plan oversubscribes a branch, so they are kept as `i128`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use mfsbalance_core::available_bytes;

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Unknown branch: {0}")]
    UnknownBranch(PathBuf),

    #[error("Failed to measure free space of {path}: {source}")]
    Measure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Free bytes per branch root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapacityLedger {
    available: BTreeMap<PathBuf, i128>,
}

impl CapacityLedger {
    /// Create a ledger from known values
    pub fn new<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, u64)>,
        P: Into<PathBuf>,
    {
        Self {
            available: entries
                .into_iter()
                .map(|(path, bytes)| (path.into(), i128::from(bytes)))
                .collect(),
        }
    }

    /// Measure every branch with one `statvfs` call each
    pub fn measure(branches: &[PathBuf]) -> Result<Self> {
        let mut entries = Vec::with_capacity(branches.len());
        for branch in branches {
            let bytes = available_bytes(branch).map_err(|source| LedgerError::Measure {
                path: branch.clone(),
                source,
            })?;
            debug!(branch = %branch.display(), bytes, "Measured branch");
            entries.push((branch.clone(), bytes));
        }
        Ok(Self::new(entries))
    }

    pub fn available_bytes(&self, branch: &Path) -> Option<i128> {
        self.available.get(branch).copied()
    }

    pub fn contains(&self, branch: &Path) -> bool {
        self.available.contains_key(branch)
    }

    /// Branch roots in sorted order
    pub fn branches(&self) -> impl Iterator<Item = &Path> {
        self.available.keys().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    /// Sum of free bytes across all branches
    pub fn total(&self) -> i128 {
        self.available.values().sum()
    }

    /// Record `size` bytes leaving `source` for `target`.
    ///
    /// Both branches are checked before either entry changes.
    pub fn apply_move(&mut self, source: &Path, target: &Path, size: u64) -> Result<()> {
        for branch in [source, target] {
            if !self.contains(branch) {
                return Err(LedgerError::UnknownBranch(branch.to_path_buf()));
            }
        }

        let size = i128::from(size);
        if let Some(bytes) = self.available.get_mut(source) {
            *bytes += size;
        }
        if let Some(bytes) = self.available.get_mut(target) {
            *bytes -= size;
        }
        Ok(())
    }

    /// Branch with the most free bytes.
    ///
    /// Ties go to the lexicographically smallest root so output is stable.
    pub fn select_target(&self) -> Option<&Path> {
        self.available
            .iter()
            .max_by(|(path_a, bytes_a), (path_b, bytes_b)| {
                bytes_a.cmp(bytes_b).then_with(|| path_b.cmp(path_a))
            })
            .map(|(path, _)| path.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn two_branches(b1: u64, b2: u64) -> CapacityLedger {
        CapacityLedger::new([("/b1", b1), ("/b2", b2)])
    }

    #[test]
    fn test_select_target_most_free() {
        let ledger = two_branches(10 * GIB, 2 * GIB);
        assert_eq!(ledger.select_target(), Some(Path::new("/b1")));

        let ledger = two_branches(2 * GIB, 10 * GIB);
        assert_eq!(ledger.select_target(), Some(Path::new("/b2")));
    }

    #[test]
    fn test_select_target_tie_is_lexicographic() {
        let ledger = CapacityLedger::new([("/mnt/c", 5), ("/mnt/a", 5), ("/mnt/b", 5)]);
        assert_eq!(ledger.select_target(), Some(Path::new("/mnt/a")));
    }

    #[test]
    fn test_select_target_empty() {
        assert!(CapacityLedger::default().select_target().is_none());
    }

    #[test]
    fn test_apply_move_shifts_bytes() {
        let mut ledger = two_branches(2 * GIB, 10 * GIB);
        ledger
            .apply_move(Path::new("/b1"), Path::new("/b2"), GIB)
            .unwrap();

        assert_eq!(ledger.available_bytes(Path::new("/b1")), Some(3 * GIB as i128));
        assert_eq!(ledger.available_bytes(Path::new("/b2")), Some(9 * GIB as i128));
    }

    #[test]
    fn test_apply_move_can_oversubscribe() {
        let mut ledger = two_branches(100, 10);
        ledger
            .apply_move(Path::new("/b1"), Path::new("/b2"), 50)
            .unwrap();
        assert_eq!(ledger.available_bytes(Path::new("/b2")), Some(-40));
        assert_eq!(ledger.total(), 110);
    }

    #[test]
    fn test_apply_move_unknown_branch_leaves_ledger_untouched() {
        let mut ledger = two_branches(100, 10);
        let before = ledger.clone();

        let err = ledger
            .apply_move(Path::new("/b1"), Path::new("/b9"), 5)
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownBranch(_)));
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_target_changes_as_ledger_shifts() {
        let mut ledger = two_branches(100, 90);
        assert_eq!(ledger.select_target(), Some(Path::new("/b1")));

        ledger
            .apply_move(Path::new("/b2"), Path::new("/b1"), 20)
            .unwrap();
        assert_eq!(ledger.select_target(), Some(Path::new("/b2")));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_moves_conserve_total(
                initial in proptest::collection::vec(0u64..(1u64 << 50), 1..6),
                moves in proptest::collection::vec((0usize..6, 0usize..6, 0u64..(1u64 << 40)), 0..64)
            ) {
                let branches: Vec<PathBuf> = (0..initial.len())
                    .map(|i| PathBuf::from(format!("/branch{}", i)))
                    .collect();
                let mut ledger = CapacityLedger::new(
                    branches.iter().cloned().zip(initial.iter().copied()),
                );
                let before = ledger.total();

                for (src, tgt, size) in moves {
                    let src = &branches[src % branches.len()];
                    let tgt = &branches[tgt % branches.len()];
                    ledger.apply_move(src, tgt, size).unwrap();
                    prop_assert_eq!(ledger.total(), before);
                }
            }
        }
    }
}
