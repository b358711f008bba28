//! gRPC server exposing a `Snapshotter` as a containerd snapshots service.
//!
//! Listens on a Unix domain socket, containerd connects to it as a proxy plugin.

use crate::api::services::snapshots::v1 as proto;
use crate::api::types;
use anyhow::Context;
use futures_util::Stream;
use proto::snapshots_server::{Snapshots, SnapshotsServer};
use snapshots::{Info, Kind, Mount, Snapshotter, Usage};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// Number of snapshots sent in each `List` response message.
const LIST_BATCH_SIZE: usize = 100;

/// Convert a snapshotter error to a gRPC status.
pub fn to_status(err: snapshots::Error) -> Status {
    match err {
        snapshots::Error::NotFound(msg) => Status::not_found(msg),
        snapshots::Error::AlreadyExists(msg) => Status::already_exists(msg),
        snapshots::Error::FailedPrecondition(msg) => Status::failed_precondition(msg),
        snapshots::Error::InvalidArgument(msg) => Status::invalid_argument(msg),
        other => Status::internal(other.to_string()),
    }
}

impl From<Mount> for types::Mount {
    fn from(mount: Mount) -> Self {
        types::Mount {
            r#type: mount.typ,
            source: mount.source,
            target: mount.target,
            options: mount.options,
        }
    }
}

impl From<Info> for proto::Info {
    fn from(info: Info) -> Self {
        let kind = match info.kind {
            Kind::View => proto::Kind::View,
            Kind::Active => proto::Kind::Active,
            Kind::Committed => proto::Kind::Committed,
        };

        proto::Info {
            name: info.name,
            parent: info.parent.unwrap_or_default(),
            kind: kind as i32,
            created_at: Some(info.created_at.into()),
            updated_at: Some(info.updated_at.into()),
            labels: info.labels,
        }
    }
}

impl From<Usage> for proto::UsageResponse {
    fn from(usage: Usage) -> Self {
        proto::UsageResponse {
            size: usage.size,
            inodes: usage.inodes,
        }
    }
}

fn from_proto_info(info: proto::Info) -> Info {
    let kind = match proto::Kind::try_from(info.kind) {
        Ok(proto::Kind::View) => Kind::View,
        Ok(proto::Kind::Committed) => Kind::Committed,
        _ => Kind::Active,
    };
    let time = |timestamp: Option<prost_types::Timestamp>| {
        timestamp
            .and_then(|t| SystemTime::try_from(t).ok())
            .unwrap_or(UNIX_EPOCH)
    };

    Info {
        name: info.name,
        parent: parent(info.parent),
        kind,
        created_at: time(info.created_at),
        updated_at: time(info.updated_at),
        labels: info.labels,
    }
}

/// An empty parent means no parent.
fn parent(parent: String) -> Option<String> {
    if parent.is_empty() {
        None
    } else {
        Some(parent)
    }
}

fn mounts(mounts: Vec<Mount>) -> Vec<types::Mount> {
    mounts.into_iter().map(types::Mount::from).collect()
}

/// Snapshots service implementation, the `snapshotter` field of requests is ignored.
pub struct SnapshotsService<S> {
    snapshotter: Arc<S>,
}

impl<S: Snapshotter> SnapshotsService<S> {
    pub fn new(snapshotter: Arc<S>) -> Self {
        Self { snapshotter }
    }
}

#[tonic::async_trait]
impl<S: Snapshotter + 'static> Snapshots for SnapshotsService<S> {
    async fn prepare(
        &self,
        request: Request<proto::PrepareSnapshotRequest>,
    ) -> Result<Response<proto::PrepareSnapshotResponse>, Status> {
        let req = request.into_inner();
        let parent = parent(req.parent);
        let prepared = self
            .snapshotter
            .prepare(&req.key, parent.as_deref(), req.labels)
            .await
            .map_err(to_status)?;

        Ok(Response::new(proto::PrepareSnapshotResponse {
            mounts: mounts(prepared),
        }))
    }

    async fn view(
        &self,
        request: Request<proto::ViewSnapshotRequest>,
    ) -> Result<Response<proto::ViewSnapshotResponse>, Status> {
        let req = request.into_inner();
        let parent = parent(req.parent);
        let viewed = self
            .snapshotter
            .view(&req.key, parent.as_deref(), req.labels)
            .await
            .map_err(to_status)?;

        Ok(Response::new(proto::ViewSnapshotResponse {
            mounts: mounts(viewed),
        }))
    }

    async fn mounts(
        &self,
        request: Request<proto::MountsRequest>,
    ) -> Result<Response<proto::MountsResponse>, Status> {
        let req = request.into_inner();
        let resolved = self
            .snapshotter
            .mounts(&req.key)
            .await
            .map_err(to_status)?;

        Ok(Response::new(proto::MountsResponse {
            mounts: mounts(resolved),
        }))
    }

    async fn commit(
        &self,
        request: Request<proto::CommitSnapshotRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.snapshotter
            .commit(&req.name, &req.key, req.labels)
            .await
            .map_err(to_status)?;

        Ok(Response::new(()))
    }

    async fn remove(
        &self,
        request: Request<proto::RemoveSnapshotRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.snapshotter.remove(&req.key).await.map_err(to_status)?;

        Ok(Response::new(()))
    }

    async fn stat(
        &self,
        request: Request<proto::StatSnapshotRequest>,
    ) -> Result<Response<proto::StatSnapshotResponse>, Status> {
        let req = request.into_inner();
        let info = self.snapshotter.stat(&req.key).await.map_err(to_status)?;

        Ok(Response::new(proto::StatSnapshotResponse {
            info: Some(info.into()),
        }))
    }

    async fn update(
        &self,
        request: Request<proto::UpdateSnapshotRequest>,
    ) -> Result<Response<proto::UpdateSnapshotResponse>, Status> {
        let req = request.into_inner();
        let info = req
            .info
            .ok_or_else(|| Status::invalid_argument("missing snapshot info"))?;
        let fieldpaths = req.update_mask.map(|mask| mask.paths).unwrap_or_default();

        let updated = self
            .snapshotter
            .update(from_proto_info(info), &fieldpaths)
            .await
            .map_err(to_status)?;

        Ok(Response::new(proto::UpdateSnapshotResponse {
            info: Some(updated.into()),
        }))
    }

    type ListStream =
        Pin<Box<dyn Stream<Item = Result<proto::ListSnapshotsResponse, Status>> + Send + 'static>>;

    async fn list(
        &self,
        request: Request<proto::ListSnapshotsRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        let req = request.into_inner();
        let mut infos = Vec::new();
        self.snapshotter
            .walk(&req.filters, &mut |info: Info| {
                infos.push(proto::Info::from(info));
                Ok(())
            })
            .await
            .map_err(to_status)?;

        let batches = infos
            .chunks(LIST_BATCH_SIZE)
            .map(|batch| {
                Ok(proto::ListSnapshotsResponse {
                    info: batch.to_vec(),
                })
            })
            .collect::<Vec<_>>();

        Ok(Response::new(Box::pin(futures_util::stream::iter(batches))))
    }

    async fn usage(
        &self,
        request: Request<proto::UsageRequest>,
    ) -> Result<Response<proto::UsageResponse>, Status> {
        let req = request.into_inner();
        let usage = self.snapshotter.usage(&req.key).await.map_err(to_status)?;

        Ok(Response::new(usage.into()))
    }

    async fn cleanup(
        &self,
        _request: Request<proto::CleanupRequest>,
    ) -> Result<Response<()>, Status> {
        Err(Status::unimplemented("cleanup is not supported"))
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("shutting down");
}

/// Remove the socket file at `socket`, a missing one is not an error.
fn remove_socket(socket: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(socket) {
        Ok(()) => {
            log::debug!("removed socket {}", socket.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Serve the snapshots service on the Unix socket `socket` until interrupted.
///
/// A leftover socket file from a previous run is removed first. The snapshotter
/// is closed once the server stopped.
pub async fn serve<S: Snapshotter + 'static>(
    socket: &Path,
    snapshotter: Arc<S>,
) -> anyhow::Result<()> {
    remove_socket(socket).with_context(|| format!("removing stale socket {}", socket.display()))?;

    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {}", parent.display()))?;
    }

    let uds = UnixListener::bind(socket)
        .with_context(|| format!("binding socket {}", socket.display()))?;
    let incoming = UnixListenerStream::new(uds);

    log::info!("snapshots service listening on {}", socket.display());

    Server::builder()
        .add_service(SnapshotsServer::new(SnapshotsService::new(
            snapshotter.clone(),
        )))
        .serve_with_incoming_shutdown(incoming, shutdown_signal())
        .await
        .context("serving snapshots service")?;

    snapshotter.close().await.context("closing snapshotter")?;
    if let Err(e) = remove_socket(socket) {
        log::warn!("failed to remove socket {}: {}", socket.display(), e);
    }

    Ok(())
}
