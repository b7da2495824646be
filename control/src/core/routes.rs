use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use common::api_error::ApiError;
use common::constants::ADMIN_KEY_HEADER;
use common::schemas::{
    CommitPlacementRequest, CreateNodeRequest, DeleteNodeParams, HeartbeatRequest,
    PlaceChunkRequest, StartNodeRequest, SubstituteReplicaRequest,
};
use common::trace_middleware::trace_context_middleware;

use crate::core::capacity::{self, CapacityMetrics};
use crate::core::heartbeat::on_heartbeat;
use crate::core::lifecycle::{self, AdminContext};
use crate::core::node::{NodeRecord, NodeRuntime, NodeStatus};
use crate::core::placement;
use crate::core::state::ControlState;
use crate::core::store::ChunkRecord;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeView {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub storage_capacity: u64,
    pub storage_used: u64,
    pub chunk_count: u64,
    pub health_score: u8,
    pub last_heartbeat: Option<i128>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodesResponse {
    pub nodes: Vec<NodeView>,
    pub capacity_metrics: CapacityMetrics,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusResponse {
    pub capacity_metrics: CapacityMetrics,
    pub global_health: u8,
    pub total_nodes: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlacementResponse {
    pub placement_id: String,
    pub nodes: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubstituteResponse {
    pub node_id: String,
}

fn admin_ctx(headers: &HeaderMap) -> AdminContext {
    AdminContext {
        admin_key: headers
            .get(ADMIN_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
    }
}

fn view_of(rt: &NodeRuntime, now: Instant, state: &ControlState) -> NodeView {
    NodeView {
        node_id: rt.record.node_id.clone(),
        host: rt.record.host.clone(),
        port: rt.record.port,
        status: rt.record.status,
        storage_capacity: rt.record.capacity_bytes,
        // Reported usage plus in-flight placement holds.
        storage_used: rt.effective_used(),
        chunk_count: rt.record.chunk_count,
        health_score: capacity::health_score(rt, now, state.config.heartbeat_timeout),
        last_heartbeat: rt.record.last_heartbeat_ms,
    }
}

fn view_of_record(record: NodeRecord) -> NodeView {
    NodeView {
        health_score: 0,
        node_id: record.node_id,
        host: record.host,
        port: record.port,
        status: record.status,
        storage_capacity: record.capacity_bytes,
        storage_used: record.used_bytes,
        chunk_count: record.chunk_count,
        last_heartbeat: record.last_heartbeat_ms,
    }
}

// GET /nodes
pub async fn list_nodes(
    State(state): State<ControlState>,
    headers: HeaderMap,
) -> Result<Json<NodesResponse>, ApiError> {
    lifecycle::authorize(&state, &admin_ctx(&headers))?;

    // Views and metrics come from the same snapshot so they cannot disagree.
    let runtimes = state.registry.snapshot()?;
    let now = Instant::now();
    let records: Vec<_> = runtimes.iter().map(|rt| rt.record.clone()).collect();

    Ok(Json(NodesResponse {
        nodes: runtimes.iter().map(|rt| view_of(rt, now, &state)).collect(),
        capacity_metrics: capacity::recompute(&records),
    }))
}

// POST /nodes
pub async fn create_node(
    State(state): State<ControlState>,
    headers: HeaderMap,
    Json(req): Json<CreateNodeRequest>,
) -> Result<(StatusCode, Json<NodeView>), ApiError> {
    let record = lifecycle::create_node(&state, &admin_ctx(&headers), &req)?;
    Ok((StatusCode::CREATED, Json(view_of_record(record))))
}

// POST /nodes/{id}/start
pub async fn start_node(
    State(state): State<ControlState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<StartNodeRequest>,
) -> Result<Json<NodeView>, ApiError> {
    let record = lifecycle::start_node(&state, &admin_ctx(&headers), &node_id, &req).await?;
    Ok(Json(view_of_record(record)))
}

// POST /nodes/{id}/stop
pub async fn stop_node(
    State(state): State<ControlState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NodeView>, ApiError> {
    let record = lifecycle::stop_node(&state, &admin_ctx(&headers), &node_id)?;
    Ok(Json(view_of_record(record)))
}

// DELETE /nodes/{id}?force=<bool>
pub async fn delete_node(
    State(state): State<ControlState>,
    Path(node_id): Path<String>,
    Query(params): Query<DeleteNodeParams>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    lifecycle::delete_node(&state, &admin_ctx(&headers), &node_id, params.force)?;
    Ok(StatusCode::NO_CONTENT)
}

// POST /heartbeat
pub async fn heartbeat(
    State(state): State<ControlState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<StatusCode, ApiError> {
    on_heartbeat(&state, &req)?;
    Ok(StatusCode::OK)
}

// GET /status
pub async fn cluster_status(
    State(state): State<ControlState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    lifecycle::authorize(&state, &admin_ctx(&headers))?;

    let runtimes = state.registry.snapshot()?;
    let now = Instant::now();
    let records: Vec<_> = runtimes.iter().map(|rt| rt.record.clone()).collect();

    Ok(Json(StatusResponse {
        capacity_metrics: capacity::recompute(&records),
        global_health: capacity::global_health(&runtimes, now, state.config.heartbeat_timeout),
        total_nodes: runtimes.len(),
    }))
}

// POST /placements
pub async fn place_chunk(
    State(state): State<ControlState>,
    Json(req): Json<PlaceChunkRequest>,
) -> Result<(StatusCode, Json<PlacementResponse>), ApiError> {
    let factor = req
        .replication_factor
        .unwrap_or(state.config.default_replication);
    let attempt = placement::place_chunk(&state, req.size_bytes, factor)?;
    Ok((
        StatusCode::CREATED,
        Json(PlacementResponse {
            placement_id: attempt.placement_id,
            nodes: attempt.replicas,
        }),
    ))
}

// POST /placements/{id}/substitute
pub async fn substitute_replica(
    State(state): State<ControlState>,
    Path(placement_id): Path<String>,
    Json(req): Json<SubstituteReplicaRequest>,
) -> Result<Json<SubstituteResponse>, ApiError> {
    let node_id = placement::substitute_replica(&state, &placement_id, &req.failed_node)?;
    Ok(Json(SubstituteResponse { node_id }))
}

// POST /placements/{id}/commit
pub async fn commit_placement(
    State(state): State<ControlState>,
    Path(placement_id): Path<String>,
    Json(req): Json<CommitPlacementRequest>,
) -> Result<Json<ChunkRecord>, ApiError> {
    let record = placement::commit_placement(&state, &placement_id, &req.chunk_id, &req.file_id)?;
    Ok(Json(record))
}

// DELETE /placements/{id}
pub async fn abort_placement(
    State(state): State<ControlState>,
    Path(placement_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    placement::abort_placement(&state, &placement_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/nodes", get(list_nodes).post(create_node))
        .route("/nodes/{id}/start", post(start_node))
        .route("/nodes/{id}/stop", post(stop_node))
        .route("/nodes/{id}", delete(delete_node))
        .route("/heartbeat", post(heartbeat))
        .route("/status", get(cluster_status))
        .route("/placements", post(place_chunk))
        .route("/placements/{id}/substitute", post(substitute_replica))
        .route("/placements/{id}/commit", post(commit_placement))
        .route("/placements/{id}", delete(abort_placement))
        .layer(middleware::from_fn(trace_context_middleware))
        .with_state(state)
}
