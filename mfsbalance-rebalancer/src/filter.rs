//! Directory eligibility rules.

use glob::{Pattern, PatternError};
use std::fmt;
use std::path::Path;

use crate::scanner::DirectoryBatch;

/// Why a directory was or was not selected for consolidation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// One file or none: nothing to gather
    TooFewFiles(usize),
    TooManyFiles(usize),
    Excluded,
    NotIncluded,
    TooLarge(u64),
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eligibility::Eligible => write!(f, "eligible"),
            Eligibility::TooFewFiles(n) => write!(f, "too few files ({})", n),
            Eligibility::TooManyFiles(n) => write!(f, "too many files ({})", n),
            Eligibility::Excluded => write!(f, "matches an exclude pattern"),
            Eligibility::NotIncluded => write!(f, "matches no include pattern"),
            Eligibility::TooLarge(bytes) => write!(f, "too large ({} bytes)", bytes),
        }
    }
}

/// Decides which directories get consolidated
#[derive(Debug, Clone)]
pub struct DirectoryFilter {
    max_files: usize,
    max_size: u64,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl DirectoryFilter {
    /// Build a filter. An empty include list matches every directory.
    pub fn new<S: AsRef<str>>(
        max_files: usize,
        max_size: u64,
        include: &[S],
        exclude: &[S],
    ) -> Result<Self, PatternError> {
        Ok(Self {
            max_files,
            max_size,
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn evaluate(&self, batch: &DirectoryBatch) -> Eligibility {
        let count = batch.file_count();
        if count <= 1 {
            return Eligibility::TooFewFiles(count);
        }
        if count > self.max_files {
            return Eligibility::TooManyFiles(count);
        }
        if self.is_excluded(&batch.path) {
            return Eligibility::Excluded;
        }
        if !self.is_included(&batch.path) {
            return Eligibility::NotIncluded;
        }
        let size = batch.total_size();
        if size >= self.max_size {
            return Eligibility::TooLarge(size);
        }
        Eligibility::Eligible
    }

    pub fn is_eligible(&self, batch: &DirectoryBatch) -> bool {
        self.evaluate(batch) == Eligibility::Eligible
    }

    fn is_excluded(&self, dir: &Path) -> bool {
        let dir = dir.to_string_lossy();
        self.exclude.iter().any(|p| p.matches(&dir))
    }

    fn is_included(&self, dir: &Path) -> bool {
        if self.include.is_empty() {
            return true;
        }
        let dir = dir.to_string_lossy();
        self.include.iter().any(|p| p.matches(&dir))
    }
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Pattern>, PatternError> {
    patterns.iter().map(|p| Pattern::new(p.as_ref())).collect()
}
