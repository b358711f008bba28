use crate::filters::Filter;
use crate::state::{SnapshotMetadata, State};
use crate::utils::{copy_dir, disk_usage};
use crate::{Error, Info, Kind, Labels, Mount, Result, Snapshotter, Usage};
use async_trait::async_trait;
use std::fs::{create_dir_all, remove_dir_all, rename};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::Mutex;

/// The file where the snapshots metadata are stored, under the root directory.
pub const METADATA_FILE: &str = "metadata.json";
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// `NativeSnapshotter` keeps every snapshot as a plain directory.
///
/// Preparing a snapshot copies the whole content of its parent, and the runtime
/// receives a bind mount of the snapshot directory. It works on any filesystem,
/// at the price of disk space.
#[derive(Debug)]
pub struct NativeSnapshotter {
    /// The directory holding the snapshots and their metadata.
    root: PathBuf,
    state: Mutex<State>,
}

impl NativeSnapshotter {
    pub fn new(root: &Path) -> Result<Self> {
        let snapshots_dir = root.join(SNAPSHOTS_DIR);
        if !snapshots_dir.exists() {
            log::debug!(
                "creating snapshots directory = {}",
                snapshots_dir.display()
            );
            create_dir_all(&snapshots_dir).map_err(|e| Error::CreateDirectory(e.to_string()))?;
        }

        let state = State::try_from(&root.join(METADATA_FILE))?;

        Ok(Self {
            root: root.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    fn state_file(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(id)
    }

    /// A view on a committed parent is served straight from the parent directory.
    fn mounts_of(&self, state: &State, snapshot: &SnapshotMetadata) -> Vec<Mount> {
        let source = match (&snapshot.parent, snapshot.kind) {
            (Some(parent), Kind::View) => state
                .snapshot(parent)
                .map(|parent| self.snapshot_dir(&parent.id))
                .unwrap_or_else(|| self.snapshot_dir(&snapshot.id)),
            _ => self.snapshot_dir(&snapshot.id),
        };
        let flag = match snapshot.kind {
            Kind::View => "ro",
            _ => "rw",
        };

        vec![Mount {
            typ: "bind".to_string(),
            source: source.display().to_string(),
            target: String::new(),
            options: vec![flag.to_string(), "rbind".to_string()],
        }]
    }

    async fn create_snapshot(
        &self,
        kind: Kind,
        key: &str,
        parent: Option<&str>,
        labels: Labels,
    ) -> Result<Vec<Mount>> {
        let mut state = self.state.lock().await;

        if state.has_snapshot(key) {
            return Err(Error::AlreadyExists(format!("snapshot {}", key)));
        }

        let parent_id = match parent {
            Some(parent) => {
                let snapshot = state.snapshot(parent).ok_or_else(|| {
                    Error::NotFound(format!("parent snapshot {} does not exist", parent))
                })?;
                if snapshot.kind != Kind::Committed {
                    return Err(Error::FailedPrecondition(format!(
                        "parent snapshot {} is not committed",
                        parent
                    )));
                }
                Some(snapshot.id.clone())
            }
            None => None,
        };

        let id = state.snapshot_index().to_string();

        if kind == Kind::Active || parent_id.is_none() {
            // Fill a scratch directory first so that a failed copy leaves no snapshot behind.
            let scratch = self.root.join(SNAPSHOTS_DIR).join(format!("new-{}", id));
            let parent_dir = parent_id.as_deref().map(|parent| self.snapshot_dir(parent));
            let directory = self.snapshot_dir(&id);

            blocking(move || {
                create_dir_all(&scratch).map_err(|e| Error::CreateDirectory(e.to_string()))?;

                if let Some(parent_dir) = parent_dir {
                    log::debug!("copying {} into {}", parent_dir.display(), scratch.display());
                    if let Err(e) = copy_dir(&parent_dir, &scratch) {
                        if let Err(cleanup) = remove_dir_all(&scratch) {
                            log::warn!("failed to remove {}: {}", scratch.display(), cleanup);
                        }
                        return Err(e);
                    }
                }

                rename(&scratch, &directory).map_err(|e| Error::CreateDirectory(e.to_string()))
            })
            .await?;
        }

        let snapshot = SnapshotMetadata::new(id, kind, parent.map(str::to_string), labels);
        let mounts = self.mounts_of(&state, &snapshot);
        state.add_snapshot(key, snapshot).save(&self.state_file())?;

        log::debug!("created {} snapshot {}", kind.as_str(), key);

        Ok(mounts)
    }
}

/// Run filesystem work on the blocking thread pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Task(e.to_string()))?
}

#[async_trait]
impl Snapshotter for NativeSnapshotter {
    async fn stat(&self, key: &str) -> Result<Info> {
        let state = self.state.lock().await;

        state
            .snapshot(key)
            .map(|snapshot| snapshot.info(key))
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", key)))
    }

    async fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info> {
        let mut state = self.state.lock().await;
        let snapshot = state
            .snapshot_mut(&info.name)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", info.name)))?;

        let mut labels = snapshot.labels.clone();
        if fieldpaths.is_empty() {
            labels = info.labels.clone();
        }
        for path in fieldpaths {
            if path == "labels" {
                labels = info.labels.clone();
            } else if let Some(key) = path.strip_prefix("labels.") {
                match info.labels.get(key) {
                    Some(value) => labels.insert(key.to_string(), value.clone()),
                    None => labels.remove(key),
                };
            } else {
                return Err(Error::InvalidArgument(format!(
                    "cannot update {:?} field on snapshot {}",
                    path, info.name
                )));
            }
        }

        snapshot.labels = labels;
        snapshot.updated_at = SystemTime::now();
        let updated = snapshot.info(&info.name);
        state.save(&self.state_file())?;

        Ok(updated)
    }

    async fn usage(&self, key: &str) -> Result<Usage> {
        let directory = {
            let state = self.state.lock().await;
            let snapshot = state
                .snapshot(key)
                .ok_or_else(|| Error::NotFound(format!("snapshot {}", key)))?;

            match snapshot.kind {
                Kind::Active => self.snapshot_dir(&snapshot.id),
                Kind::Committed => {
                    return Ok(Usage {
                        size: snapshot.size,
                        inodes: snapshot.inodes,
                    })
                }
                Kind::View => return Ok(Usage::default()),
            }
        };

        blocking(move || disk_usage(&directory)).await
    }

    async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let state = self.state.lock().await;
        let snapshot = state
            .snapshot(key)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", key)))?;

        if snapshot.kind == Kind::Committed {
            return Err(Error::FailedPrecondition(format!(
                "requested snapshot {} not active or view",
                key
            )));
        }

        Ok(self.mounts_of(&state, snapshot))
    }

    async fn prepare(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: Labels,
    ) -> Result<Vec<Mount>> {
        self.create_snapshot(Kind::Active, key, parent, labels).await
    }

    async fn view(&self, key: &str, parent: Option<&str>, labels: Labels) -> Result<Vec<Mount>> {
        self.create_snapshot(Kind::View, key, parent, labels).await
    }

    async fn commit(&self, name: &str, key: &str, labels: Labels) -> Result<()> {
        let mut state = self.state.lock().await;

        let kind = state
            .snapshot(key)
            .map(|snapshot| snapshot.kind)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", key)))?;
        if kind != Kind::Active {
            return Err(Error::FailedPrecondition(format!(
                "snapshot {} is not active",
                key
            )));
        }
        if state.has_snapshot(name) {
            return Err(Error::AlreadyExists(format!("snapshot {}", name)));
        }

        let mut snapshot = match state.remove_snapshot(key) {
            Some(snapshot) => snapshot,
            None => return Err(Error::NotFound(format!("snapshot {}", key))),
        };
        let directory = self.snapshot_dir(&snapshot.id);
        let usage = match blocking(move || disk_usage(&directory)).await {
            Ok(usage) => usage,
            Err(e) => {
                state.add_snapshot(key, snapshot);
                return Err(e);
            }
        };

        snapshot.kind = Kind::Committed;
        snapshot.labels = labels;
        snapshot.updated_at = SystemTime::now();
        snapshot.size = usage.size;
        snapshot.inodes = usage.inodes;
        state.add_snapshot(name, snapshot).save(&self.state_file())?;

        log::debug!("committed snapshot {} as {}", key, name);

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let id = state
            .snapshot(key)
            .map(|snapshot| snapshot.id.clone())
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", key)))?;
        if state.has_children(key) {
            return Err(Error::FailedPrecondition(format!(
                "cannot remove snapshot {} with child",
                key
            )));
        }

        // Move the directory out of the way before forgetting the snapshot, the
        // actual deletion can then fail without leaving a dangling entry.
        let directory = self.snapshot_dir(&id);
        let trash = self.root.join(SNAPSHOTS_DIR).join(format!("rm-{}", id));
        let moved = if directory.exists() {
            rename(&directory, &trash).map_err(|e| Error::RemoveDirectory(e.to_string()))?;
            true
        } else {
            false
        };

        state.remove_snapshot(key);
        state.save(&self.state_file())?;
        drop(state);

        log::debug!("removed snapshot {}", key);

        if moved {
            blocking(move || {
                if let Err(e) = remove_dir_all(&trash) {
                    log::warn!("failed to remove {}: {}", trash.display(), e);
                }
                Ok(())
            })
            .await?;
        }

        Ok(())
    }

    async fn walk(
        &self,
        filters: &[String],
        f: &mut (dyn FnMut(Info) -> Result<()> + Send),
    ) -> Result<()> {
        let filter = Filter::parse(filters)?;

        let infos = self
            .state
            .lock()
            .await
            .snapshots()
            .into_iter()
            .map(|(key, snapshot)| snapshot.info(key))
            .filter(|info| filter.matches(info))
            .collect::<Vec<Info>>();

        for info in infos {
            f(info)?;
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().await.save(&self.state_file())
    }
}

#[cfg(test)]
mod tests {
    use super::{blocking, NativeSnapshotter, METADATA_FILE};
    use crate::{Error, Kind, Labels, Snapshotter};
    use std::fs::{create_dir_all, read, read_to_string, write};
    use std::path::PathBuf;
    use tempdir::TempDir;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_prepare_commit_and_prepare_child() {
        let root = TempDir::new("snapshots_native").unwrap();
        let sn = NativeSnapshotter::new(root.path()).unwrap();

        let mounts = sn.prepare("extract-1", None, Labels::new()).await.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].typ, "bind");
        assert_eq!(mounts[0].options, vec!["rw", "rbind"]);
        write(PathBuf::from(&mounts[0].source).join("hello"), "world").unwrap();

        sn.commit("layer-1", "extract-1", labels(&[("a", "b")]))
            .await
            .unwrap();
        assert!(matches!(sn.stat("extract-1").await, Err(Error::NotFound(_))));
        let info = sn.stat("layer-1").await.unwrap();
        assert_eq!(info.kind, Kind::Committed);
        assert_eq!(info.labels, labels(&[("a", "b")]));
        assert_eq!(sn.usage("layer-1").await.unwrap().size, 5);

        let mounts = sn
            .prepare("container", Some("layer-1"), Labels::new())
            .await
            .unwrap();
        assert_eq!(
            read_to_string(PathBuf::from(&mounts[0].source).join("hello")).unwrap(),
            "world"
        );
        assert_eq!(sn.mounts("container").await.unwrap(), mounts);
        assert_eq!(
            sn.stat("container").await.unwrap().parent.as_deref(),
            Some("layer-1")
        );
    }

    #[tokio::test]
    async fn test_view_is_read_only_on_parent() {
        let root = TempDir::new("snapshots_native").unwrap();
        let sn = NativeSnapshotter::new(root.path()).unwrap();
        let active = sn.prepare("extract", None, Labels::new()).await.unwrap();
        sn.commit("layer", "extract", Labels::new()).await.unwrap();

        let view = sn.view("view", Some("layer"), Labels::new()).await.unwrap();

        assert_eq!(view[0].source, active[0].source);
        assert_eq!(view[0].options, vec!["ro", "rbind"]);
        assert_eq!(sn.usage("view").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let root = TempDir::new("snapshots_native").unwrap();
        let sn = NativeSnapshotter::new(root.path()).unwrap();
        sn.prepare("a", None, Labels::new()).await.unwrap();

        assert!(matches!(
            sn.prepare("a", None, Labels::new()).await,
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            sn.prepare("b", Some("missing"), Labels::new()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            sn.prepare("b", Some("a"), Labels::new()).await,
            Err(Error::FailedPrecondition(_))
        ));

        sn.commit("base", "a", Labels::new()).await.unwrap();
        assert!(matches!(
            sn.mounts("base").await,
            Err(Error::FailedPrecondition(_))
        ));
        sn.prepare("child", Some("base"), Labels::new())
            .await
            .unwrap();
        assert!(matches!(
            sn.remove("base").await,
            Err(Error::FailedPrecondition(_))
        ));

        sn.remove("child").await.unwrap();
        sn.remove("base").await.unwrap();
        assert!(matches!(sn.remove("base").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_deletes_directory() {
        let root = TempDir::new("snapshots_native").unwrap();
        let sn = NativeSnapshotter::new(root.path()).unwrap();
        let mounts = sn.prepare("a", None, Labels::new()).await.unwrap();
        let directory = PathBuf::from(&mounts[0].source);
        assert!(directory.exists());

        sn.remove("a").await.unwrap();

        assert!(!directory.exists());
    }

    #[tokio::test]
    async fn test_update_labels() {
        let root = TempDir::new("snapshots_native").unwrap();
        let sn = NativeSnapshotter::new(root.path()).unwrap();
        sn.prepare("a", None, labels(&[("keep", "1"), ("drop", "2")]))
            .await
            .unwrap();

        let mut info = sn.stat("a").await.unwrap();
        info.labels = labels(&[("new", "3")]);
        let updated = sn
            .update(info.clone(), &["labels.new".to_string(), "labels.drop".to_string()])
            .await
            .unwrap();
        assert_eq!(updated.labels, labels(&[("keep", "1"), ("new", "3")]));
        assert!(updated.updated_at >= updated.created_at);

        let replaced = sn.update(info.clone(), &[]).await.unwrap();
        assert_eq!(replaced.labels, labels(&[("new", "3")]));

        assert!(matches!(
            sn.update(info, &["kind".to_string()]).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_walk_with_filters() {
        let root = TempDir::new("snapshots_native").unwrap();
        let sn = NativeSnapshotter::new(root.path()).unwrap();
        sn.prepare("a", None, Labels::new()).await.unwrap();
        sn.commit("base", "a", Labels::new()).await.unwrap();
        sn.prepare("work", Some("base"), Labels::new())
            .await
            .unwrap();

        let mut names = Vec::new();
        sn.walk(&[], &mut |info: crate::Info| {
            names.push(info.name);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(names, vec!["base", "work"]);

        let mut names = Vec::new();
        sn.walk(&["kind==active".to_string()], &mut |info: crate::Info| {
            names.push(info.name);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(names, vec!["work"]);
    }

    #[tokio::test]
    async fn test_filesystem_work_leaves_the_runtime_thread() {
        let runtime_thread = std::thread::current().id();

        let worker_thread = blocking(|| Ok(std::thread::current().id())).await.unwrap();

        assert_ne!(worker_thread, runtime_thread);
    }

    #[tokio::test]
    async fn test_prepare_copies_nested_parent() {
        let root = TempDir::new("snapshots_native").unwrap();
        let sn = NativeSnapshotter::new(root.path()).unwrap();
        let mounts = sn.prepare("extract", None, Labels::new()).await.unwrap();
        let source = PathBuf::from(&mounts[0].source);
        create_dir_all(source.join("usr/sbin")).unwrap();
        write(source.join("usr/sbin/httpd"), "binary").unwrap();
        sn.commit("layer", "extract", Labels::new()).await.unwrap();

        let mounts = sn.prepare("web", Some("layer"), Labels::new()).await.unwrap();

        assert_eq!(
            read_to_string(PathBuf::from(&mounts[0].source).join("usr/sbin/httpd")).unwrap(),
            "binary"
        );
        let usage = sn.usage("web").await.unwrap();
        assert_eq!(usage.size, 6);
        assert_eq!(usage.inodes, 4);
        assert_eq!(sn.usage("layer").await.unwrap(), usage);
    }

    #[tokio::test]
    async fn test_damaged_metadata_refuses_to_open() {
        let root = TempDir::new("snapshots_native").unwrap();
        let directory = {
            let sn = NativeSnapshotter::new(root.path()).unwrap();
            let mounts = sn.prepare("a", None, Labels::new()).await.unwrap();
            sn.close().await.unwrap();
            PathBuf::from(&mounts[0].source)
        };
        let metadata = root.path().join(METADATA_FILE);
        let content = read(&metadata).unwrap();
        write(&metadata, &content[..content.len() / 2]).unwrap();

        assert!(matches!(NativeSnapshotter::new(root.path()), Err(Error::ParseStateFile(_))));
        assert!(directory.exists());
        assert_eq!(read(&metadata).unwrap().len(), content.len() / 2);
    }

    #[tokio::test]
    async fn test_metadata_survives_restart() {
        let root = TempDir::new("snapshots_native").unwrap();
        {
            let sn = NativeSnapshotter::new(root.path()).unwrap();
            sn.prepare("a", None, Labels::new()).await.unwrap();
            sn.close().await.unwrap();
        }

        let sn = NativeSnapshotter::new(root.path()).unwrap();

        assert_eq!(sn.stat("a").await.unwrap().kind, Kind::Active);
        sn.prepare("b", None, Labels::new()).await.unwrap();
        assert_ne!(
            sn.mounts("a").await.unwrap()[0].source,
            sn.mounts("b").await.unwrap()[0].source
        );
    }
}
