use std::path::PathBuf;
use std::sync::Arc;

use merope_consensus::{NodeHost, ReplicaStatus, SnapshotOptions, Transport};
use merope_proto::server::{
    raft_event::Kind as EventKind, raft_host_server::RaftHost, CompactRequest, CompactResponse,
    GetHostConfigRequest, GetHostConfigResponse, GetHostInfoRequest, GetHostInfoResponse,
    IndexState, RaftEvent, ReadIndexRequest, SnapshotOption, SnapshotRequest, SnapshotResponse,
    StopRequest, StopResponse, WatchEventsRequest,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::config::ServerConfig;
use crate::convert::{
    db_to_status, host_config_to_proto, read_index_code, request_timeout, shard_info_to_proto,
};
use crate::Shutdown;

pub struct RaftHostImpl<T> {
    host: Arc<NodeHost<T>>,
    config: ServerConfig,
    shutdown: Shutdown,
}

impl<T: Transport> RaftHostImpl<T> {
    pub fn new(host: Arc<NodeHost<T>>, config: ServerConfig, shutdown: Shutdown) -> Self {
        RaftHostImpl { host, config, shutdown }
    }
}

fn snapshot_options(option: Option<SnapshotOption>) -> Result<SnapshotOptions, Status> {
    let Some(option) = option else { return Ok(SnapshotOptions::default()) };
    if option.exported && option.export_path.is_empty() {
        return Err(Status::invalid_argument("export_path is required for exported snapshots"));
    }
    Ok(SnapshotOptions {
        compaction_overhead: option
            .override_compaction_overhead
            .then_some(option.compaction_overhead),
        export_path: option.exported.then(|| PathBuf::from(option.export_path)),
    })
}

const EVENT_BUFFER: usize = 16;

fn raft_event(kind: EventKind, status: &ReplicaStatus) -> RaftEvent {
    RaftEvent {
        kind: kind as i32,
        shard_id: status.shard_id,
        replica_id: status.replica_id,
        leader_id: status.leader_id.unwrap_or(0),
        term: status.term,
        config_change_id: status.membership.config_change_id,
    }
}

/// Events between two published statuses of the same replica.
fn status_events(prev: &ReplicaStatus, next: &ReplicaStatus) -> Vec<RaftEvent> {
    let mut events = Vec::new();
    if prev.leader_id != next.leader_id || prev.term != next.term {
        events.push(raft_event(EventKind::LeaderUpdated, next));
    }
    if prev.membership.config_change_id != next.membership.config_change_id {
        events.push(raft_event(EventKind::MembershipChanged, next));
    }
    if prev.running && !next.running {
        events.push(raft_event(EventKind::ReplicaStopped, next));
    }
    events
}

#[tonic::async_trait]
impl<T: Transport> RaftHost for RaftHostImpl<T> {
    type WatchEventsStream = ReceiverStream<Result<RaftEvent, Status>>;

    /// Streams leader and membership changes of one shard, starting with
    /// its current leader. The stream ends once the local replica stops.
    async fn watch_events(
        &self,
        request: Request<WatchEventsRequest>,
    ) -> Result<Response<Self::WatchEventsStream>, Status> {
        let shard_id = request.into_inner().shard_id;
        let mut status = self.host.watch_status(shard_id).await.map_err(db_to_status)?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            let mut last = status.borrow_and_update().clone();
            if tx.send(Ok(raft_event(EventKind::LeaderUpdated, &last))).await.is_err() {
                return;
            }
            loop {
                let closed = status.changed().await.is_err();
                let mut next = status.borrow_and_update().clone();
                if closed {
                    next.running = false;
                }
                for event in status_events(&last, &next) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                if !next.running {
                    break;
                }
                last = next;
            }
            tracing::debug!(shard = shard_id, "event stream finished");
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn compact(
        &self,
        request: Request<CompactRequest>,
    ) -> Result<Response<CompactResponse>, Status> {
        let req = request.into_inner();
        self.host
            .compact(req.shard_id, req.replica_id, self.config.default_timeout())
            .await
            .map_err(db_to_status)?;
        Ok(Response::new(CompactResponse {}))
    }

    async fn snapshot(
        &self,
        request: Request<SnapshotRequest>,
    ) -> Result<Response<SnapshotResponse>, Status> {
        let req = request.into_inner();
        let options = snapshot_options(req.options)?;
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let snapshot_index = self
            .host
            .snapshot(req.shard_id, options, timeout)
            .await
            .map_err(db_to_status)?;
        tracing::info!(shard = req.shard_id, snapshot_index, "snapshot requested");
        Ok(Response::new(SnapshotResponse { snapshot_index }))
    }

    async fn stop(&self, _request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        tracing::info!("stop requested");
        self.host.stop().await;
        self.shutdown.trigger();
        Ok(Response::new(StopResponse {}))
    }

    async fn get_host_config(
        &self,
        _request: Request<GetHostConfigRequest>,
    ) -> Result<Response<GetHostConfigResponse>, Status> {
        Ok(Response::new(GetHostConfigResponse {
            config: Some(host_config_to_proto(self.host.config())),
        }))
    }

    async fn get_host_info(
        &self,
        _request: Request<GetHostInfoRequest>,
    ) -> Result<Response<GetHostInfoResponse>, Status> {
        let shards = self.host.host_info().await;
        Ok(Response::new(GetHostInfoResponse {
            raft_address: self.host.raft_address().to_owned(),
            shards: shards.into_iter().map(shard_info_to_proto).collect(),
        }))
    }

    async fn read_index(
        &self,
        request: Request<ReadIndexRequest>,
    ) -> Result<Response<IndexState>, Status> {
        let req = request.into_inner();
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let result = self.host.read_index(req.shard_id, timeout).await;
        let status = read_index_code(&result);
        if let Err(e) = &result {
            tracing::debug!(shard = req.shard_id, error = %e, "read index failed");
        }
        Ok(Response::new(IndexState {
            status: status as i32,
            snapshot_index: result.unwrap_or(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use merope_proto::server::index_state::ResultCode;
    use merope_types::ConfigChangeKind;
    use tokio_stream::StreamExt;
    use tonic::Code;

    use super::*;
    use crate::test_support::*;

    #[tokio::test]
    async fn host_reports_config_and_shards() {
        let node = TestNode::start().await;
        let svc = node.host_service();

        let config = svc
            .get_host_config(Request::new(GetHostConfigRequest {}))
            .await
            .unwrap()
            .into_inner()
            .config
            .unwrap();
        assert_eq!(config.raft_address, TEST_ADDRESS);
        assert_eq!(config.rtt_ms, 5);

        let info =
            svc.get_host_info(Request::new(GetHostInfoRequest {})).await.unwrap().into_inner();
        assert_eq!(info.raft_address, TEST_ADDRESS);
        assert_eq!(info.shards.len(), 1);
        let shard = &info.shards[0];
        assert!(shard.is_leader);
        assert_eq!(shard.leader_id, 1);
        assert!(shard.applied_index >= 1);
    }

    #[tokio::test]
    async fn read_index_reports_outcome() {
        let node = TestNode::start().await;
        let svc = node.host_service();
        let ok = svc
            .read_index(Request::new(ReadIndexRequest { shard_id: 1, timeout_ms: 0 }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(ok.status, ResultCode::Completed as i32);
        assert!(ok.snapshot_index >= 1);

        let missing = svc
            .read_index(Request::new(ReadIndexRequest { shard_id: 7, timeout_ms: 0 }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(missing.status, ResultCode::Terminated as i32);
    }

    #[tokio::test]
    async fn snapshot_and_compact() {
        let node = TestNode::start().await;
        node.bucket().await;
        let svc = node.host_service();
        let index = svc
            .snapshot(Request::new(SnapshotRequest { shard_id: 1, options: None, timeout_ms: 0 }))
            .await
            .unwrap()
            .into_inner()
            .snapshot_index;
        assert!(index >= 2);
        svc.compact(Request::new(CompactRequest { shard_id: 1, replica_id: 1 })).await.unwrap();

        let err = svc
            .snapshot(Request::new(SnapshotRequest {
                shard_id: 1,
                options: Some(SnapshotOption { exported: true, ..Default::default() }),
                timeout_ms: 0,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let dir = tempfile::tempdir().unwrap();
        let exported = svc
            .snapshot(Request::new(SnapshotRequest {
                shard_id: 1,
                options: Some(SnapshotOption {
                    exported: true,
                    export_path: dir.path().display().to_string(),
                    ..Default::default()
                }),
                timeout_ms: 0,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(dir.path().join(format!("snapshot-1-{}.bin", exported.snapshot_index)).exists());
    }

    #[tokio::test]
    async fn stop_triggers_shutdown() {
        let node = TestNode::start().await;
        let svc = node.host_service();
        svc.stop(Request::new(StopRequest {})).await.unwrap();
        tokio::time::timeout(WAIT, node.shutdown.wait()).await.unwrap();
        assert!(node.host.host_info().await.is_empty());
    }

    async fn next_event(events: &mut ReceiverStream<Result<RaftEvent, Status>>) -> RaftEvent {
        tokio::time::timeout(WAIT, events.next()).await.unwrap().unwrap().unwrap()
    }

    #[tokio::test]
    async fn events_follow_leader_and_membership() {
        let node = TestNode::start().await;
        let svc = node.host_service();
        let mut events = svc
            .watch_events(Request::new(WatchEventsRequest { shard_id: 1 }))
            .await
            .unwrap()
            .into_inner();
        let current = next_event(&mut events).await;
        assert_eq!(current.kind, EventKind::LeaderUpdated as i32);
        assert_eq!(current.leader_id, 1);

        let ccid = node
            .host
            .request_membership_change(
                1,
                ConfigChangeKind::AddObserver,
                2,
                "10.0.0.2:7000",
                None,
                WAIT,
            )
            .await
            .unwrap();
        let changed = loop {
            let event = next_event(&mut events).await;
            if event.kind == EventKind::MembershipChanged as i32 {
                break event;
            }
        };
        assert!(changed.config_change_id >= ccid);

        node.host.stop().await;
        let stopped = loop {
            let event = next_event(&mut events).await;
            if event.kind == EventKind::ReplicaStopped as i32 {
                break event;
            }
        };
        assert_eq!(stopped.shard_id, 1);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn watching_an_unknown_shard_fails() {
        let node = TestNode::start().await;
        let err = node
            .host_service()
            .watch_events(Request::new(WatchEventsRequest { shard_id: 9 }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }
}
