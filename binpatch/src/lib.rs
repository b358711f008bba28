use std::path::PathBuf;

pub use config::{ByteSpec, DirectiveConfig, PatchConfig};
pub use locate::locate;
pub use orchestrator::{FileOutcome, PatchDirective, PatchOrchestrator, PatchPlan, PatchReport};
pub use patch::patch;
pub use report::{LogReporter, Reporter, Silent};
pub use scan::find_offset;

mod config;
mod locate;
mod orchestrator;
mod patch;
mod report;
mod scan;

/// Binary patching related errors
#[derive(Debug)]
pub enum Error {
    /// The snapshot tree could not be walked. The whole pass is aborted.
    Traversal(walkdir::Error),
    /// A candidate file could not be opened or read while scanning
    Read(PathBuf, std::io::Error),
    /// A candidate file could not be opened or written while patching
    Write(PathBuf, std::io::Error),
    /// The replacement is longer than the target it overwrites and the directive did not opt in
    Overrun { target: usize, replacement: usize },
    /// The patch configuration file could not be opened
    OpenConfig(std::io::Error),
    /// The patch configuration file is not valid JSON for a `PatchConfig`
    ParseConfig(serde_json::Error),
    /// The patch configuration is well-formed but unusable
    InvalidConfig(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Traversal(e) => write!(f, "failed to walk snapshot tree: {}", e),
            Error::Read(path, e) => write!(f, "failed to read {}: {}", path.display(), e),
            Error::Write(path, e) => write!(f, "failed to write {}: {}", path.display(), e),
            Error::Overrun {
                target,
                replacement,
            } => write!(
                f,
                "replacement of {} bytes overruns a {} bytes target",
                replacement, target
            ),
            Error::OpenConfig(e) => write!(f, "failed to open patch configuration: {}", e),
            Error::ParseConfig(e) => write!(f, "failed to parse patch configuration: {}", e),
            Error::InvalidConfig(msg) => write!(f, "invalid patch configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// A common result type for our crate.
pub type Result<T> = std::result::Result<T, Error>;
