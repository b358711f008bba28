use async_trait::async_trait;
use binpatch::PatchOrchestrator;
use snapshots::{Info, Labels, Mount, Result, Snapshotter, Usage};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `Snapper` wraps a snapshotter and forwards every call to it.
///
/// Mount requests are intercepted: before the wrapped snapshotter computes the
/// mounts, the orchestrator (if any) inspects the binaries of the snapshot tree
/// and patches the ones it targets. Patching is best effort and never changes
/// the outcome of the request.
pub struct Snapper<S> {
    snapshotter: S,
    /// The root directory of the snapshot store, inspected on every mount request.
    directory: PathBuf,
    orchestrator: Option<Arc<PatchOrchestrator>>,
}

impl<S: Snapshotter> Snapper<S> {
    pub fn new(directory: &Path, snapshotter: S) -> Self {
        Self {
            snapshotter,
            directory: directory.to_path_buf(),
            orchestrator: None,
        }
    }

    /// Enable binary patching on mount requests.
    pub fn with_orchestrator(mut self, orchestrator: PatchOrchestrator) -> Self {
        self.orchestrator = Some(Arc::new(orchestrator));
        self
    }

    /// Run one patch pass over the snapshot store.
    ///
    /// Scanning is blocking file I/O, it runs on the blocking thread pool.
    async fn inspect(&self, orchestrator: Arc<PatchOrchestrator>) {
        let directory = self.directory.clone();

        match tokio::task::spawn_blocking(move || orchestrator.run(&directory)).await {
            Ok(report) => log::debug!(
                "inspected {} binaries, patched {}",
                report.files.len(),
                report.patched()
            ),
            Err(e) => log::warn!("patch pass aborted: {}", e),
        }
    }
}

#[async_trait]
impl<S: Snapshotter> Snapshotter for Snapper<S> {
    async fn stat(&self, key: &str) -> Result<Info> {
        log::debug!("stat {}", key);
        self.snapshotter.stat(key).await
    }

    async fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info> {
        log::debug!("update {}", info.name);
        self.snapshotter.update(info, fieldpaths).await
    }

    async fn usage(&self, key: &str) -> Result<Usage> {
        log::debug!("usage {}", key);
        self.snapshotter.usage(key).await
    }

    async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        log::debug!("mounts {}", key);
        if let Some(orchestrator) = &self.orchestrator {
            self.inspect(orchestrator.clone()).await;
        }
        self.snapshotter.mounts(key).await
    }

    async fn prepare(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: Labels,
    ) -> Result<Vec<Mount>> {
        log::debug!("prepare {}", key);
        self.snapshotter.prepare(key, parent, labels).await
    }

    async fn view(&self, key: &str, parent: Option<&str>, labels: Labels) -> Result<Vec<Mount>> {
        log::debug!("view {}", key);
        self.snapshotter.view(key, parent, labels).await
    }

    async fn commit(&self, name: &str, key: &str, labels: Labels) -> Result<()> {
        log::debug!("commit {} as {}", key, name);
        self.snapshotter.commit(name, key, labels).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        log::debug!("remove {}", key);
        self.snapshotter.remove(key).await
    }

    async fn walk(
        &self,
        filters: &[String],
        f: &mut (dyn FnMut(Info) -> Result<()> + Send),
    ) -> Result<()> {
        log::debug!("walk {:?}", filters);
        self.snapshotter.walk(filters, f).await
    }

    async fn close(&self) -> Result<()> {
        log::debug!("close");
        self.snapshotter.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::Snapper;
    use binpatch::{PatchDirective, PatchOrchestrator, PatchPlan, Silent};
    use snapshots::native::NativeSnapshotter;
    use snapshots::{Labels, Snapshotter};
    use std::fs::{create_dir_all, read, write};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempdir::TempDir;

    fn orchestrator() -> PatchOrchestrator {
        PatchOrchestrator::new(
            PatchPlan {
                binary: "httpd".to_string(),
                trigger: b"Klustered".to_vec(),
                directives: vec![PatchDirective::new("postgresql123", "postgresqll23")],
            },
            Arc::new(Silent),
        )
    }

    #[tokio::test]
    async fn test_mounts_patches_binaries_then_forwards() {
        let root = TempDir::new("snapper").unwrap();
        let native = NativeSnapshotter::new(root.path()).unwrap();
        let snapper = Snapper::new(root.path(), native).with_orchestrator(orchestrator());

        let prepared = snapper.prepare("web", None, Labels::new()).await.unwrap();
        let binary = PathBuf::from(&prepared[0].source).join("usr/sbin/httpd");
        create_dir_all(binary.parent().unwrap()).unwrap();
        write(&binary, b"Klustered\0postgresql123\0").unwrap();

        let mounts = snapper.mounts("web").await.unwrap();

        assert_eq!(mounts, prepared);
        assert_eq!(read(&binary).unwrap(), b"Klustered\0postgresqll23\0");
    }

    #[tokio::test]
    async fn test_mounts_errors_come_from_the_snapshotter_only() {
        let root = TempDir::new("snapper").unwrap();
        let native = NativeSnapshotter::new(&root.path().join("store")).unwrap();
        // The inspected directory does not exist, so every patch pass fails.
        let snapper =
            Snapper::new(&root.path().join("missing"), native).with_orchestrator(orchestrator());

        let prepared = snapper.prepare("web", None, Labels::new()).await.unwrap();

        assert_eq!(snapper.mounts("web").await.unwrap(), prepared);
        assert!(matches!(
            snapper.mounts("unknown").await,
            Err(snapshots::Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_other_operations_are_forwarded() {
        let root = TempDir::new("snapper").unwrap();
        let native = NativeSnapshotter::new(root.path()).unwrap();
        let snapper = Snapper::new(root.path(), native);

        snapper.prepare("a", None, Labels::new()).await.unwrap();
        snapper.commit("base", "a", Labels::new()).await.unwrap();
        snapper.view("v", Some("base"), Labels::new()).await.unwrap();

        assert_eq!(snapper.stat("v").await.unwrap().parent.as_deref(), Some("base"));
        assert_eq!(snapper.usage("base").await.unwrap().inodes, 1);

        let mut seen = Vec::new();
        snapper
            .walk(&[], &mut |info: snapshots::Info| {
                seen.push(info.name);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["base", "v"]);

        snapper.remove("v").await.unwrap();
        snapper.remove("base").await.unwrap();
        snapper.close().await.unwrap();
    }
}
