use crate::{find_offset, locate, patch, Error, Reporter, Result};
use log::Level;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One in-place edit: the first occurrence of `target` is overwritten by `replacement`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchDirective {
    pub target: Vec<u8>,
    pub replacement: Vec<u8>,
    /// Allow `replacement` to be longer than `target`, overwriting the bytes
    /// that follow the match.
    pub allow_overrun: bool,
}

impl PatchDirective {
    pub fn new(target: impl Into<Vec<u8>>, replacement: impl Into<Vec<u8>>) -> Self {
        Self {
            target: target.into(),
            replacement: replacement.into(),
            allow_overrun: false,
        }
    }

    pub fn allow_overrun(mut self) -> Self {
        self.allow_overrun = true;
        self
    }

    fn check_length(&self) -> Result<()> {
        if !self.allow_overrun && self.replacement.len() > self.target.len() {
            return Err(Error::Overrun {
                target: self.target.len(),
                replacement: self.replacement.len(),
            });
        }
        Ok(())
    }
}

/// What to look for and what to change.
///
/// Files named `binary` that contain `trigger` are patched with `directives`,
/// in order. The first directive doubles as the "already patched" marker: once
/// its target is gone, the file is left alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchPlan {
    pub binary: String,
    pub trigger: Vec<u8>,
    pub directives: Vec<PatchDirective>,
}

/// The fate of one candidate file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    /// The trigger is absent or the file could not be read.
    NotTarget,
    /// The target of the first directive is gone.
    AlreadyPatched,
    /// The first directive was applied. `skipped` counts the following
    /// directives that could not be applied.
    Patched { applied: usize, skipped: usize },
    /// The first directive could not be applied.
    Failed,
}

/// Result of one pass over a snapshot tree.
#[derive(Debug, Default)]
pub struct PatchReport {
    /// Set when the tree could not be walked; no file was inspected.
    pub traversal_failed: bool,
    pub files: Vec<(PathBuf, FileOutcome)>,
}

impl PatchReport {
    /// Number of files modified during this pass.
    pub fn patched(&self) -> usize {
        self.files
            .iter()
            .filter(|(_, outcome)| matches!(outcome, FileOutcome::Patched { .. }))
            .count()
    }
}

/// `PatchOrchestrator` runs a `PatchPlan` against every candidate binary of a tree.
///
/// It is best effort: nothing it does can fail its caller. Problems are handed to
/// the `Reporter` and the pass moves on to the next directive or file.
pub struct PatchOrchestrator {
    plan: PatchPlan,
    reporter: Arc<dyn Reporter>,
}

impl PatchOrchestrator {
    pub fn new(plan: PatchPlan, reporter: Arc<dyn Reporter>) -> Self {
        Self { plan, reporter }
    }

    /// Inspect every file named after the plan binary under `root`, patching the
    /// ones carrying the trigger.
    pub fn run(&self, root: &Path) -> PatchReport {
        let mut report = PatchReport::default();
        if self.plan.directives.is_empty() {
            return report;
        }

        let candidates = match locate(root, &self.plan.binary) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.reporter.report(
                    Level::Warn,
                    format_args!("error locating binaries: {}", e),
                );
                report.traversal_failed = true;
                return report;
            }
        };

        for path in candidates {
            self.reporter.report(
                Level::Debug,
                format_args!("checking binary {}", path.display()),
            );
            let outcome = self.inspect(&path);
            report.files.push((path, outcome));
        }

        report
    }

    fn inspect(&self, path: &Path) -> FileOutcome {
        match find_offset(&self.plan.trigger, path) {
            Ok(Some(_)) => self.reporter.report(
                Level::Info,
                format_args!("found target binary {}", path.display()),
            ),
            Ok(None) => return FileOutcome::NotTarget,
            Err(e) => {
                self.reporter.report(Level::Warn, format_args!("{}", e));
                return FileOutcome::NotTarget;
            }
        }

        let (first, rest) = match self.plan.directives.split_first() {
            Some(directives) => directives,
            None => return FileOutcome::AlreadyPatched,
        };

        match find_offset(&first.target, path) {
            Ok(Some(offset)) => {
                if let Err(e) = self.apply(first, path, offset) {
                    self.reporter
                        .report(Level::Warn, format_args!("error patching: {}", e));
                    return FileOutcome::Failed;
                }
            }
            Ok(None) => {
                self.reporter.report(
                    Level::Info,
                    format_args!("{} is already patched", path.display()),
                );
                return FileOutcome::AlreadyPatched;
            }
            Err(e) => {
                self.reporter.report(Level::Warn, format_args!("{}", e));
                return FileOutcome::Failed;
            }
        }

        let mut applied = 1;
        let mut skipped = 0;
        for (index, directive) in rest.iter().enumerate() {
            match find_offset(&directive.target, path) {
                Ok(Some(offset)) => match self.apply(directive, path, offset) {
                    Ok(()) => applied += 1,
                    Err(e) => {
                        self.reporter.report(
                            Level::Warn,
                            format_args!("error applying directive {}: {}", index + 1, e),
                        );
                        skipped += 1;
                    }
                },
                Ok(None) => {
                    self.reporter.report(
                        Level::Info,
                        format_args!(
                            "directive {} target not found in {}",
                            index + 1,
                            path.display()
                        ),
                    );
                    skipped += 1;
                }
                Err(e) => {
                    // The file cannot be trusted anymore, leave the remaining directives.
                    self.reporter.report(Level::Warn, format_args!("{}", e));
                    skipped += rest.len() - index;
                    break;
                }
            }
        }

        FileOutcome::Patched { applied, skipped }
    }

    fn apply(&self, directive: &PatchDirective, path: &Path, offset: u64) -> Result<()> {
        directive.check_length()?;
        self.reporter.report(
            Level::Info,
            format_args!("patching {} at offset {}", path.display(), offset),
        );
        patch(path, offset, &directive.replacement)
    }
}
