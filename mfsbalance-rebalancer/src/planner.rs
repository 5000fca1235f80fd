//! Consolidation Planner
//!
//! Walks the merged tree top-down and, for every eligible directory, moves
//! its files onto the branch with the most free space:
//! - Target chosen per directory from the live ledger
//! - Files handled in path order so reruns produce identical output
//! - Ledger updated before the next file is considered
//! - Hardlink siblings recreated next to a moved file when requested

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use mfsbalance_core::{format_size, AttributeProvider, MfsError};

use crate::executor::{ActionOutcome, ActionSink, EmitError};
use crate::filter::{DirectoryFilter, Eligibility};
use crate::hardlinks::{inode_key, split_branch_path, HardlinkIndex, InodeKey};
use crate::ledger::{CapacityLedger, LedgerError};
use crate::scanner::{scan_directory, DirectoryBatch, FileStat};

/// Planner errors
#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("No branches to consolidate onto")]
    NoBranches,

    #[error(transparent)]
    Attribute(#[from] MfsError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Output(EmitError),

    #[error("Interrupted")]
    Interrupted,
}

impl From<EmitError> for PlannerError {
    fn from(err: EmitError) -> Self {
        match err {
            EmitError::BrokenPipe => PlannerError::Interrupted,
            other => PlannerError::Output(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlannerError>;

/// A single planned step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    /// Transfer `relative` from branch `source` to branch `target`
    Move {
        source: PathBuf,
        target: PathBuf,
        relative: PathBuf,
    },
    /// Create `link` under `target` as a hardlink of the moved `relative`
    Relink {
        target: PathBuf,
        relative: PathBuf,
        link: PathBuf,
    },
    /// Remove `relative` from `branch`
    Delete { branch: PathBuf, relative: PathBuf },
}

/// A regular file resolved against its branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub branch: PathBuf,
    pub relative: PathBuf,
    pub size: u64,
    pub inode: u64,
    pub nlink: u64,
}

/// Counters for one run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub directories_scanned: usize,
    pub directories_eligible: usize,
    pub files_in_place: usize,
    pub moves: usize,
    pub bytes_moved: u64,
    pub relinks: usize,
    pub deletes: usize,
    pub failures: usize,
}

impl PlanSummary {
    pub fn summary(&self) -> String {
        format!(
            "{} directories scanned, {} eligible, {} moves ({}), {} relinks, {} deletes, {} already in place, {} failed",
            self.directories_scanned,
            self.directories_eligible,
            self.moves,
            format_size(self.bytes_moved),
            self.relinks,
            self.deletes,
            self.files_in_place,
            self.failures
        )
    }
}

/// Greedy single-pass consolidation planner
pub struct ConsolidationPlanner<'a, P: AttributeProvider + ?Sized> {
    provider: &'a P,
    filter: DirectoryFilter,
    /// Owned here and mutated only by this pass
    ledger: CapacityLedger,
    hardlinks: Option<HardlinkIndex>,
    /// Relative paths recreated by a relink during this run
    relinked: HashSet<PathBuf>,
    interrupt: Option<Arc<AtomicBool>>,
    summary: PlanSummary,
}

impl<'a, P: AttributeProvider + ?Sized> ConsolidationPlanner<'a, P> {
    /// Create a planner over a measured ledger
    pub fn new(provider: &'a P, filter: DirectoryFilter, ledger: CapacityLedger) -> Result<Self> {
        if ledger.is_empty() {
            return Err(PlannerError::NoBranches);
        }
        Ok(Self {
            provider,
            filter,
            ledger,
            hardlinks: None,
            relinked: HashSet::new(),
            interrupt: None,
            summary: PlanSummary::default(),
        })
    }

    /// Preserve hardlinks using a prebuilt index
    pub fn with_hardlinks(mut self, index: HardlinkIndex) -> Self {
        self.hardlinks = Some(index);
        self
    }

    /// Stop cleanly once `flag` is raised
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    pub fn summary(&self) -> &PlanSummary {
        &self.summary
    }

    /// Walk `root` pre-order and emit every planned action to `sink`
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn run<S: ActionSink + ?Sized>(&mut self, root: &Path, sink: &mut S) -> Result<PlanSummary> {
        info!(
            branches = self.ledger.len(),
            hardlinks = self.hardlinks.is_some(),
            "Starting consolidation walk"
        );

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.file_type().is_dir());

        for entry in walker {
            self.check_interrupt()?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable directory");
                    continue;
                }
            };

            // Directories can vanish or lock up under a live pool
            let batch = match scan_directory(entry.path()) {
                Ok(batch) => batch,
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
                {
                    warn!(dir = %entry.path().display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
                Err(source) => {
                    return Err(PlannerError::Scan {
                        path: entry.path().to_path_buf(),
                        source,
                    })
                }
            };
            self.plan_directory(&batch, sink)?;
        }

        info!(summary = %self.summary.summary(), "Consolidation walk complete");
        Ok(self.summary.clone())
    }

    /// Plan one directory batch
    pub fn plan_directory<S: ActionSink + ?Sized>(
        &mut self,
        batch: &DirectoryBatch,
        sink: &mut S,
    ) -> Result<()> {
        self.summary.directories_scanned += 1;

        let eligibility = self.filter.evaluate(batch);
        if eligibility != Eligibility::Eligible {
            debug!(dir = %batch.path.display(), reason = %eligibility, "Skipping directory");
            return Ok(());
        }
        self.summary.directories_eligible += 1;

        let target = self
            .ledger
            .select_target()
            .ok_or(PlannerError::NoBranches)?
            .to_path_buf();
        debug!(
            dir = %batch.path.display(),
            target = %target.display(),
            files = batch.files.len(),
            bytes = batch.total_size(),
            "Consolidating directory"
        );

        for file in &batch.files {
            self.check_interrupt()?;
            self.plan_file(file, &target, sink)?;
        }
        Ok(())
    }

    fn plan_file<S: ActionSink + ?Sized>(
        &mut self,
        file: &FileStat,
        target: &Path,
        sink: &mut S,
    ) -> Result<()> {
        let Some(entry) = self.resolve(file)? else {
            return Ok(());
        };

        if entry.branch == target {
            self.summary.files_in_place += 1;
            return Ok(());
        }
        if self.relinked.contains(&entry.relative) {
            debug!(path = %entry.path.display(), "Already relinked onto target");
            return Ok(());
        }
        if !self.ledger.contains(&entry.branch) {
            warn!(
                path = %entry.path.display(),
                branch = %entry.branch.display(),
                "File lives on a branch outside the pool, skipping"
            );
            return Ok(());
        }

        // Read the physical identity now: the move may remove the source
        let link_key = if entry.nlink > 1 && self.hardlinks.is_some() {
            let physical = entry.branch.join(&entry.relative);
            match inode_key(&physical) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(path = %physical.display(), error = %e, "Cannot stat file, links left alone");
                    None
                }
            }
        } else {
            None
        };

        let action = PlanAction::Move {
            source: entry.branch.clone(),
            target: target.to_path_buf(),
            relative: entry.relative.clone(),
        };
        if let ActionOutcome::Failed(reason) = sink.emit(&action)? {
            warn!(path = %entry.path.display(), reason = %reason, "Move failed, ledger unchanged");
            self.summary.failures += 1;
            return Ok(());
        }

        self.ledger.apply_move(&entry.branch, target, entry.size)?;
        self.summary.moves += 1;
        self.summary.bytes_moved += entry.size;

        if let Some(key) = link_key {
            self.relink_siblings(&entry, key, target, sink)?;
        }
        Ok(())
    }

    /// Look up a file's branch and relative path
    fn resolve(&self, file: &FileStat) -> Result<Option<FileEntry>> {
        let branch = self.provider.owning_branch(&file.path)?;
        let relative = self.provider.relative_path(&file.path)?;

        match (branch, relative) {
            (Some(branch), Some(relative)) => Ok(Some(FileEntry {
                path: file.path.clone(),
                branch,
                relative,
                size: file.size,
                inode: file.inode,
                nlink: file.nlink,
            })),
            _ => {
                warn!(path = %file.path.display(), "No branch attributes, skipping");
                Ok(None)
            }
        }
    }

    /// Recreate every other link of `entry`'s inode under `target`
    fn relink_siblings<S: ActionSink + ?Sized>(
        &mut self,
        entry: &FileEntry,
        key: InodeKey,
        target: &Path,
        sink: &mut S,
    ) -> Result<()> {
        let Some(index) = self.hardlinks.as_ref() else {
            return Ok(());
        };

        let mut siblings = Vec::new();
        for path in index.group(key) {
            let Some((branch, relative)) = split_branch_path(path, self.ledger.branches()) else {
                warn!(path = %path.display(), "Hardlink outside every branch, left in place");
                continue;
            };
            if relative == entry.relative || branch == target {
                continue;
            }
            siblings.push((branch, relative));
        }

        for (branch, relative) in siblings {
            let relink = PlanAction::Relink {
                target: target.to_path_buf(),
                relative: entry.relative.clone(),
                link: relative.clone(),
            };
            if let ActionOutcome::Failed(reason) = sink.emit(&relink)? {
                warn!(link = %relative.display(), reason = %reason, "Relink failed, keeping old link");
                self.summary.failures += 1;
                continue;
            }
            self.summary.relinks += 1;
            self.relinked.insert(relative.clone());

            let delete = PlanAction::Delete { branch, relative };
            match sink.emit(&delete)? {
                ActionOutcome::Completed => self.summary.deletes += 1,
                ActionOutcome::Failed(_) => self.summary.failures += 1,
            }
        }
        Ok(())
    }

    fn check_interrupt(&self) -> Result<()> {
        match &self.interrupt {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(PlannerError::Interrupted),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Provider answering from a fixed path table
    #[derive(Default)]
    struct TableProvider {
        files: HashMap<PathBuf, (PathBuf, PathBuf)>,
        /// Path whose attribute reads fail
        unreadable: Option<PathBuf>,
    }

    impl TableProvider {
        fn place(&mut self, merged: &str, branch: &str, relative: &str) {
            self.files.insert(
                PathBuf::from(merged),
                (PathBuf::from(branch), PathBuf::from(relative)),
            );
        }

        fn check(&self, path: &Path) -> mfsbalance_core::Result<()> {
            match &self.unreadable {
                Some(bad) if bad == path => Err(MfsError::AttributeRead {
                    path: path.to_path_buf(),
                    name: "user.mergerfs.basepath".to_string(),
                    source: io::Error::new(io::ErrorKind::Other, "input/output error"),
                }),
                _ => Ok(()),
            }
        }
    }

    impl AttributeProvider for TableProvider {
        fn is_merged_mount(&self, _path: &Path) -> mfsbalance_core::Result<bool> {
            Ok(true)
        }

        fn relative_path(&self, path: &Path) -> mfsbalance_core::Result<Option<PathBuf>> {
            self.check(path)?;
            Ok(self.files.get(path).map(|(_, rel)| rel.clone()))
        }

        fn owning_branch(&self, path: &Path) -> mfsbalance_core::Result<Option<PathBuf>> {
            self.check(path)?;
            Ok(self.files.get(path).map(|(branch, _)| branch.clone()))
        }

        fn branch_roots(&self, _control_file: &Path) -> mfsbalance_core::Result<Vec<PathBuf>> {
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct Recorder {
        actions: Vec<PlanAction>,
        fail_moves: bool,
    }

    impl ActionSink for Recorder {
        fn emit(&mut self, action: &PlanAction) -> std::result::Result<ActionOutcome, EmitError> {
            self.actions.push(action.clone());
            match action {
                PlanAction::Move { .. } if self.fail_moves => {
                    Ok(ActionOutcome::Failed("exit 23".to_string()))
                }
                _ => Ok(ActionOutcome::Completed),
            }
        }
    }

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    fn photos_batch() -> DirectoryBatch {
        DirectoryBatch {
            path: PathBuf::from("/merged/photos"),
            files: ["a.jpg", "b.jpg", "c.jpg"]
                .iter()
                .enumerate()
                .map(|(i, name)| FileStat {
                    path: PathBuf::from(format!("/merged/photos/{}", name)),
                    size: [100 * MIB, 150 * MIB, 250 * MIB][i],
                    inode: i as u64 + 10,
                    nlink: 1,
                })
                .collect(),
            other_entries: 0,
        }
    }

    fn photos_provider() -> TableProvider {
        let mut provider = TableProvider::default();
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            provider.place(
                &format!("/merged/photos/{}", name),
                "/b1",
                &format!("photos/{}", name),
            );
        }
        provider
    }

    fn default_filter() -> DirectoryFilter {
        DirectoryFilter::new::<&str>(256, 16 * GIB, &["*"], &[]).unwrap()
    }

    #[test]
    fn test_files_already_on_target() {
        let provider = photos_provider();
        let ledger = CapacityLedger::new([("/b1", 10 * GIB), ("/b2", 2 * GIB)]);
        let mut planner = ConsolidationPlanner::new(&provider, default_filter(), ledger).unwrap();
        let mut sink = Recorder::default();

        planner.plan_directory(&photos_batch(), &mut sink).unwrap();

        assert!(sink.actions.is_empty());
        assert_eq!(planner.summary().files_in_place, 3);
        assert_eq!(
            planner.ledger().available_bytes(Path::new("/b1")),
            Some(i128::from(10 * GIB))
        );
    }

    #[test]
    fn test_moves_to_emptiest_branch() {
        let provider = photos_provider();
        let ledger = CapacityLedger::new([("/b1", 2 * GIB), ("/b2", 10 * GIB)]);
        let mut planner = ConsolidationPlanner::new(&provider, default_filter(), ledger).unwrap();
        let mut sink = Recorder::default();

        planner.plan_directory(&photos_batch(), &mut sink).unwrap();

        assert_eq!(sink.actions.len(), 3);
        assert_eq!(
            sink.actions[0],
            PlanAction::Move {
                source: PathBuf::from("/b1"),
                target: PathBuf::from("/b2"),
                relative: PathBuf::from("photos/a.jpg"),
            }
        );
        assert_eq!(
            planner.ledger().available_bytes(Path::new("/b2")),
            Some(i128::from(10 * GIB - 500 * MIB))
        );
        assert_eq!(
            planner.ledger().available_bytes(Path::new("/b1")),
            Some(i128::from(2 * GIB + 500 * MIB))
        );
        assert_eq!(planner.summary().bytes_moved, 500 * MIB);
    }

    #[test]
    fn test_ineligible_directory_untouched() {
        let provider = photos_provider();
        let ledger = CapacityLedger::new([("/b1", 2 * GIB), ("/b2", 10 * GIB)]);
        let filter = DirectoryFilter::new::<&str>(2, 16 * GIB, &["*"], &[]).unwrap();
        let mut planner = ConsolidationPlanner::new(&provider, filter, ledger.clone()).unwrap();
        let mut sink = Recorder::default();

        planner.plan_directory(&photos_batch(), &mut sink).unwrap();

        assert!(sink.actions.is_empty());
        assert_eq!(planner.ledger(), &ledger);
        assert_eq!(planner.summary().directories_eligible, 0);
    }

    #[test]
    fn test_failed_move_keeps_ledger() {
        let provider = photos_provider();
        let ledger = CapacityLedger::new([("/b1", 2 * GIB), ("/b2", 10 * GIB)]);
        let mut planner = ConsolidationPlanner::new(&provider, default_filter(), ledger.clone()).unwrap();
        let mut sink = Recorder {
            fail_moves: true,
            ..Default::default()
        };

        planner.plan_directory(&photos_batch(), &mut sink).unwrap();

        assert_eq!(sink.actions.len(), 3);
        assert_eq!(planner.ledger(), &ledger);
        assert_eq!(planner.summary().failures, 3);
        assert_eq!(planner.summary().moves, 0);
    }

    #[test]
    fn test_unresolved_file_skipped() {
        let mut provider = photos_provider();
        provider.files.remove(Path::new("/merged/photos/b.jpg"));
        let ledger = CapacityLedger::new([("/b1", 2 * GIB), ("/b2", 10 * GIB)]);
        let mut planner = ConsolidationPlanner::new(&provider, default_filter(), ledger).unwrap();
        let mut sink = Recorder::default();

        planner.plan_directory(&photos_batch(), &mut sink).unwrap();
        assert_eq!(sink.actions.len(), 2);
    }

    #[test]
    fn test_attribute_read_error_aborts() {
        let mut provider = photos_provider();
        provider.unreadable = Some(PathBuf::from("/merged/photos/b.jpg"));
        let ledger = CapacityLedger::new([("/b1", 2 * GIB), ("/b2", 10 * GIB)]);
        let mut planner = ConsolidationPlanner::new(&provider, default_filter(), ledger).unwrap();
        let mut sink = Recorder::default();

        let err = planner.plan_directory(&photos_batch(), &mut sink).unwrap_err();

        assert!(matches!(
            err,
            PlannerError::Attribute(MfsError::AttributeRead { ref path, .. })
                if path == Path::new("/merged/photos/b.jpg")
        ));
        // a.jpg went out before the failure, c.jpg never did
        assert_eq!(sink.actions.len(), 1);
        assert!(matches!(
            &sink.actions[0],
            PlanAction::Move { relative, .. } if relative == Path::new("photos/a.jpg")
        ));
        assert_eq!(planner.summary().moves, 1);
    }

    #[test]
    fn test_interrupt_stops_planning() {
        let provider = photos_provider();
        let ledger = CapacityLedger::new([("/b1", 2 * GIB), ("/b2", 10 * GIB)]);
        let flag = Arc::new(AtomicBool::new(true));
        let mut planner = ConsolidationPlanner::new(&provider, default_filter(), ledger)
            .unwrap()
            .with_interrupt(flag);
        let mut sink = Recorder::default();

        let err = planner.plan_directory(&photos_batch(), &mut sink).unwrap_err();
        assert!(matches!(err, PlannerError::Interrupted));
        assert!(sink.actions.is_empty());
    }

    #[test]
    fn test_empty_ledger_rejected() {
        let provider = TableProvider::default();
        let result = ConsolidationPlanner::new(&provider, default_filter(), CapacityLedger::default());
        assert!(matches!(result, Err(PlannerError::NoBranches)));
    }

    #[test]
    fn test_summary_string() {
        let summary = PlanSummary {
            directories_scanned: 4,
            directories_eligible: 2,
            moves: 3,
            bytes_moved: 1536,
            ..Default::default()
        };
        let text = summary.summary();
        assert!(text.contains("4 directories scanned"));
        assert!(text.contains("3 moves (1.5K)"));
    }
}
