use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

mod filters;
pub mod native;
mod state;
mod utils;

/// Snapshot related errors
#[derive(Debug)]
pub enum Error {
    /// The requested snapshot does not exist
    NotFound(String),
    /// A snapshot with the same key or name already exists
    AlreadyExists(String),
    /// The snapshot is not in a state allowing the operation
    FailedPrecondition(String),
    /// The request itself is malformed, such as an unknown update field or filter
    InvalidArgument(String),
    /// An error occurred during the creation of a snapshot directory
    CreateDirectory(String),
    /// An error occurred when copying the parent content into a new snapshot
    CopyDirectory(String),
    /// An error occurred when removing a snapshot directory
    RemoveDirectory(String),
    /// An error occurred when computing the disk usage of a snapshot
    DiskUsage(String),
    /// A filesystem task run off the async runtime panicked or was cancelled
    Task(String),
    /// An error occurred when trying to open the metadata file
    OpenStateFile(String),
    /// The metadata file exists but does not hold a valid state
    ParseStateFile(String),
    /// An error occurred when trying to serialize the metadata
    SerializeState(String),
    /// An error occurred when trying to write the metadata into the file
    WriteStateFile(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::AlreadyExists(msg) => write!(f, "already exists: {}", msg),
            Error::FailedPrecondition(msg) => write!(f, "failed precondition: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::CreateDirectory(msg)
            | Error::CopyDirectory(msg)
            | Error::RemoveDirectory(msg)
            | Error::DiskUsage(msg)
            | Error::Task(msg)
            | Error::OpenStateFile(msg)
            | Error::ParseStateFile(msg)
            | Error::SerializeState(msg)
            | Error::WriteStateFile(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// A common result type for our crate.
pub type Result<T> = std::result::Result<T, Error>;

pub type Labels = HashMap<String, String>;

/// The kind of a snapshot.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum Kind {
    /// A read-only view on a committed snapshot
    View,
    /// A writable snapshot, which can be committed
    Active,
    /// An immutable snapshot, usable as a parent
    Committed,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::View => "View",
            Kind::Active => "Active",
            Kind::Committed => "Committed",
        }
    }
}

/// `Info` holds the public information of a snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Info {
    /// The key of an active or view snapshot, or the name of a committed one
    pub name: String,
    /// The name of the committed parent, if any
    pub parent: Option<String>,
    pub kind: Kind,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub labels: Labels,
}

/// Resources consumed by a snapshot.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Usage {
    /// Disk usage in bytes
    pub size: i64,
    /// Number of inodes
    pub inodes: i64,
}

/// `Mount` holds the information needed by the runtime to mount a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
    /// The FS type for the mount point
    pub typ: String,
    pub source: String,
    pub target: String,
    pub options: Vec<String>,
}

/// The `Snapshotter` trait defines the lifecycle of container filesystem snapshots.
///
/// Keys are chosen by the caller. `prepare` creates a writable snapshot on top of
/// an optional committed parent, `view` a read-only one, and `commit` freezes an
/// active snapshot under a new name so that it can become a parent.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn stat(&self, key: &str) -> Result<Info>;
    /// Update the labels of a snapshot. `fieldpaths` restricts the update to
    /// `labels` or `labels.<key>` entries, all labels are replaced when empty.
    async fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info>;
    async fn usage(&self, key: &str) -> Result<Usage>;
    /// Get the mounts of an active or view snapshot.
    async fn mounts(&self, key: &str) -> Result<Vec<Mount>>;
    async fn prepare(&self, key: &str, parent: Option<&str>, labels: Labels)
        -> Result<Vec<Mount>>;
    async fn view(&self, key: &str, parent: Option<&str>, labels: Labels) -> Result<Vec<Mount>>;
    async fn commit(&self, name: &str, key: &str, labels: Labels) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    /// Call `f` for every snapshot matching `filters`.
    async fn walk(
        &self,
        filters: &[String],
        f: &mut (dyn FnMut(Info) -> Result<()> + Send),
    ) -> Result<()>;
    async fn close(&self) -> Result<()>;
}
