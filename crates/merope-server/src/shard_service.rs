use std::sync::Arc;

use merope_consensus::{NodeHost, Transport};
use merope_proto::server::{
    shard_manager_server::ShardManager, AddReplicaRequest, GetLeaderIdRequest,
    GetLeaderIdResponse, GetShardMembersRequest, GetShardMembersResponse,
    MembershipChangeResponse, NewShardRequest, NewShardResponse, RemoveDataRequest,
    RemoveDataResponse, RemoveReplicaRequest, StartReplicaRequest, StartReplicaResponse,
    StopReplicaRequest, StopReplicaResponse,
};
use merope_types::ConfigChangeKind;
use tonic::{Request, Response, Status};

use crate::config::ServerConfig;
use crate::convert::{db_to_status, membership_to_proto, proto_state_machine, request_timeout};

pub struct ShardManagerImpl<T> {
    host: Arc<NodeHost<T>>,
    config: ServerConfig,
}

impl<T: Transport> ShardManagerImpl<T> {
    pub fn new(host: Arc<NodeHost<T>>, config: ServerConfig) -> Self {
        ShardManagerImpl { host, config }
    }

    async fn start(&self, req: StartReplicaRequest, observer: bool) -> Result<(), Status> {
        let kind = proto_state_machine(req.r#type)?;
        self.host
            .start_replica(req.shard_id, req.replica_id, kind, req.restart, observer)
            .await
            .map_err(db_to_status)?;
        tracing::info!(
            shard = req.shard_id,
            replica = req.replica_id,
            restart = req.restart,
            observer,
            "replica started"
        );
        Ok(())
    }

    async fn add(
        &self,
        req: AddReplicaRequest,
        kind: ConfigChangeKind,
    ) -> Result<Response<MembershipChangeResponse>, Status> {
        if req.hostname.is_empty() {
            return Err(Status::invalid_argument("hostname is required"));
        }
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let config_change_id = self
            .host
            .request_membership_change(
                req.shard_id,
                kind,
                req.replica_id,
                &req.hostname,
                req.config_change_id,
                timeout,
            )
            .await
            .map_err(db_to_status)?;
        tracing::info!(
            shard = req.shard_id,
            replica = req.replica_id,
            ?kind,
            config_change_id,
            "membership changed"
        );
        Ok(Response::new(MembershipChangeResponse { config_change_id }))
    }
}

#[tonic::async_trait]
impl<T: Transport> ShardManager for ShardManagerImpl<T> {
    async fn new_shard(
        &self,
        request: Request<NewShardRequest>,
    ) -> Result<Response<NewShardResponse>, Status> {
        let req = request.into_inner();
        let kind = proto_state_machine(req.r#type)?;
        let address = (!req.hostname.is_empty()).then_some(req.hostname.as_str());
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        self.host
            .new_shard(req.shard_id, req.replica_id, kind, address, timeout)
            .await
            .map_err(db_to_status)?;
        tracing::info!(shard = req.shard_id, replica = req.replica_id, ?kind, "shard created");
        Ok(Response::new(NewShardResponse {}))
    }

    async fn start_replica(
        &self,
        request: Request<StartReplicaRequest>,
    ) -> Result<Response<StartReplicaResponse>, Status> {
        self.start(request.into_inner(), false).await?;
        Ok(Response::new(StartReplicaResponse {}))
    }

    async fn start_replica_observer(
        &self,
        request: Request<StartReplicaRequest>,
    ) -> Result<Response<StartReplicaResponse>, Status> {
        self.start(request.into_inner(), true).await?;
        Ok(Response::new(StartReplicaResponse {}))
    }

    async fn stop_replica(
        &self,
        request: Request<StopReplicaRequest>,
    ) -> Result<Response<StopReplicaResponse>, Status> {
        let req = request.into_inner();
        self.host.stop_replica(req.shard_id).await.map_err(db_to_status)?;
        tracing::info!(shard = req.shard_id, "replica stopped");
        Ok(Response::new(StopReplicaResponse {}))
    }

    async fn add_replica(
        &self,
        request: Request<AddReplicaRequest>,
    ) -> Result<Response<MembershipChangeResponse>, Status> {
        self.add(request.into_inner(), ConfigChangeKind::AddReplica).await
    }

    async fn add_replica_observer(
        &self,
        request: Request<AddReplicaRequest>,
    ) -> Result<Response<MembershipChangeResponse>, Status> {
        self.add(request.into_inner(), ConfigChangeKind::AddObserver).await
    }

    async fn add_replica_witness(
        &self,
        request: Request<AddReplicaRequest>,
    ) -> Result<Response<MembershipChangeResponse>, Status> {
        self.add(request.into_inner(), ConfigChangeKind::AddWitness).await
    }

    async fn remove_replica(
        &self,
        request: Request<RemoveReplicaRequest>,
    ) -> Result<Response<MembershipChangeResponse>, Status> {
        let req = request.into_inner();
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let config_change_id = self
            .host
            .request_membership_change(
                req.shard_id,
                ConfigChangeKind::Remove,
                req.replica_id,
                "",
                req.config_change_id,
                timeout,
            )
            .await
            .map_err(db_to_status)?;
        tracing::info!(
            shard = req.shard_id,
            replica = req.replica_id,
            config_change_id,
            "replica removed"
        );
        Ok(Response::new(MembershipChangeResponse { config_change_id }))
    }

    async fn remove_data(
        &self,
        request: Request<RemoveDataRequest>,
    ) -> Result<Response<RemoveDataResponse>, Status> {
        let req = request.into_inner();
        self.host.remove_data(req.shard_id, req.replica_id).await.map_err(db_to_status)?;
        tracing::info!(shard = req.shard_id, replica = req.replica_id, "replica data removed");
        Ok(Response::new(RemoveDataResponse {}))
    }

    async fn get_leader_id(
        &self,
        request: Request<GetLeaderIdRequest>,
    ) -> Result<Response<GetLeaderIdResponse>, Status> {
        let req = request.into_inner();
        let (leader, available) = self.host.leader_id(req.shard_id).await.map_err(db_to_status)?;
        Ok(Response::new(GetLeaderIdResponse { leader: leader.unwrap_or(0), available }))
    }

    async fn get_shard_members(
        &self,
        request: Request<GetShardMembersRequest>,
    ) -> Result<Response<GetShardMembersResponse>, Status> {
        let req = request.into_inner();
        let membership = self.host.shard_members(req.shard_id).await.map_err(db_to_status)?;
        Ok(Response::new(membership_to_proto(membership)))
    }
}
