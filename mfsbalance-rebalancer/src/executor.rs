//! Action Emitter
//!
//! Turns planned actions into external commands:
//! - Always prints the shell-quoted command line to the output
//! - In execute mode also runs it and reports the outcome
//!
//! Moves go through the configured transfer program (rsync by default).
//! Relinks and deletes are rendered as `ln` / `rm` and performed natively.
//! A relink into a subdirectory is preceded by a `mkdir -p` line so the
//! printed plan runs as a script.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, error};

use crate::planner::PlanAction;

/// Default transfer program
pub const DEFAULT_TRANSFER_PROGRAM: &str = "rsync";

/// Archive, hardlink and xattr preserving copy that removes the source.
/// `--relative` together with the `/./` anchor recreates the path under the target.
pub const DEFAULT_TRANSFER_ARGS: &[&str] = &[
    "-avlHAXWE",
    "--relative",
    "--progress",
    "--remove-source-files",
];

/// Emitter errors
#[derive(Error, Debug)]
pub enum EmitError {
    #[error("Output closed")]
    BrokenPipe,

    #[error("Failed to write plan output: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, EmitError>;

/// What happened to an emitted action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Printed only (dry run) or executed successfully
    Completed,
    /// Execution failed; dependent actions must not run
    Failed(String),
}

impl ActionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ActionOutcome::Completed)
    }
}

/// Receives every action the planner produces, in order
pub trait ActionSink {
    fn emit(&mut self, action: &PlanAction) -> Result<ActionOutcome>;
}

/// External transfer command used for moves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TransferCommand {
    fn default() -> Self {
        Self {
            program: DEFAULT_TRANSFER_PROGRAM.to_string(),
            args: DEFAULT_TRANSFER_ARGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TransferCommand {
    /// Full argument vector moving `relative` from `source` to `target`
    pub fn argv(&self, source: &Path, target: &Path, relative: &Path) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::with_capacity(self.args.len() + 3);
        argv.push(self.program.clone().into());
        argv.extend(self.args.iter().map(OsString::from));
        argv.push(source.join(".").join(relative).into_os_string());

        let mut target_dir = target.as_os_str().to_owned();
        if !target_dir.to_string_lossy().ends_with('/') {
            target_dir.push("/");
        }
        argv.push(target_dir);
        argv
    }
}

/// Argument vector an action corresponds to
pub fn command_for(action: &PlanAction, transfer: &TransferCommand) -> Vec<OsString> {
    match action {
        PlanAction::Move {
            source,
            target,
            relative,
        } => transfer.argv(source, target, relative),
        PlanAction::Relink {
            target,
            relative,
            link,
        } => vec![
            "ln".into(),
            target.join(relative).into_os_string(),
            target.join(link).into_os_string(),
        ],
        PlanAction::Delete { branch, relative } => {
            vec!["rm".into(), branch.join(relative).into_os_string()]
        }
    }
}

/// Command that must run before `action`, if any
pub fn setup_command_for(action: &PlanAction) -> Option<Vec<OsString>> {
    match action {
        PlanAction::Relink { target, link, .. } => {
            let parent = link.parent().filter(|p| !p.as_os_str().is_empty())?;
            Some(vec![
                "mkdir".into(),
                "-p".into(),
                target.join(parent).into_os_string(),
            ])
        }
        _ => None,
    }
}

/// Join arguments into one shell-safe line
pub fn render(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(arg: &OsStr) -> String {
    let lossy = arg.to_string_lossy();
    match shlex::try_quote(&lossy) {
        Ok(quoted) => quoted.into_owned(),
        // Interior NUL: no shell can express it, show it escaped instead
        Err(_) => format!("{:?}", lossy),
    }
}

/// Prints every action and optionally runs it
pub struct ActionEmitter<W: Write> {
    out: W,
    execute: bool,
    transfer: TransferCommand,
}

impl ActionEmitter<io::Stdout> {
    /// Emitter writing to standard output
    pub fn stdout(execute: bool, transfer: TransferCommand) -> Self {
        Self::new(io::stdout(), execute, transfer)
    }
}

impl<W: Write> ActionEmitter<W> {
    pub fn new(out: W, execute: bool, transfer: TransferCommand) -> Self {
        Self {
            out,
            execute,
            transfer,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn print(&mut self, line: &str) -> Result<()> {
        writeln!(self.out, "{}", line)
            .and_then(|_| self.out.flush())
            .map_err(|e| match e.kind() {
                io::ErrorKind::BrokenPipe => EmitError::BrokenPipe,
                _ => EmitError::Io(e),
            })
    }

    fn run(&self, action: &PlanAction, argv: &[OsString]) -> ActionOutcome {
        let result = match action {
            PlanAction::Move { .. } => run_command(argv),
            PlanAction::Relink {
                target,
                relative,
                link,
            } => relink(&target.join(relative), &target.join(link)),
            PlanAction::Delete { branch, relative } => fs::remove_file(branch.join(relative))
                .map_err(|e| format!("remove failed: {}", e)),
        };

        match result {
            Ok(()) => ActionOutcome::Completed,
            Err(reason) => {
                error!(command = %render(argv), reason = %reason, "Action failed");
                ActionOutcome::Failed(reason)
            }
        }
    }
}

impl<W: Write> ActionSink for ActionEmitter<W> {
    fn emit(&mut self, action: &PlanAction) -> Result<ActionOutcome> {
        if let Some(setup) = setup_command_for(action) {
            self.print(&render(&setup))?;
        }
        let argv = command_for(action, &self.transfer);
        self.print(&render(&argv))?;

        if !self.execute {
            return Ok(ActionOutcome::Completed);
        }
        Ok(self.run(action, &argv))
    }
}

fn run_command(argv: &[OsString]) -> std::result::Result<(), String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "empty command".to_string())?;

    debug!(program = ?program, "Spawning transfer");
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|e| format!("failed to spawn {}: {}", program.to_string_lossy(), e))?;

    if status.success() {
        Ok(())
    } else {
        Err(format!("{} exited with {}", program.to_string_lossy(), status))
    }
}

fn relink(original: &Path, link: &Path) -> std::result::Result<(), String> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("mkdir {} failed: {}", parent.display(), e))?;
    }
    fs::hard_link(original, link).map_err(|e| format!("link failed: {}", e))
}
