use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use common::api_error::ApiError;
use common::constants::MAX_NODE_ID_LEN;
use common::schemas::{CreateNodeRequest, StartNodeRequest};
use common::time_utils::utc_now_ms;
use common::trace_middleware::inject_trace_context;
use common::url_utils::{node_base_url, validate_host};

use crate::core::node::{NodeRecord, NodeStatus};
use crate::core::state::ControlState;
use crate::core::store::{chunk_key, ChunkRecord};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Explicit authorization context for every lifecycle operation; there is no
/// ambient admin session.
#[derive(Clone, Debug, Default)]
pub struct AdminContext {
    pub admin_key: Option<String>,
}

pub fn authorize(state: &ControlState, ctx: &AdminContext) -> Result<(), ApiError> {
    match &state.config.admin_key {
        None => Ok(()),
        Some(expected) => match &ctx.admin_key {
            Some(given) if given == expected => Ok(()),
            _ => Err(ApiError::Unauthorized),
        },
    }
}

fn validate_node_id(node_id: &str) -> Result<(), ApiError> {
    if node_id.is_empty() || node_id.len() > MAX_NODE_ID_LEN {
        return Err(ApiError::InvalidArgument(format!(
            "node_id must be 1..={MAX_NODE_ID_LEN} characters"
        )));
    }
    if !node_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ApiError::InvalidArgument(
            "node_id may only contain alphanumerics, '-', '_' and '.'".to_string(),
        ));
    }
    Ok(())
}

fn validate_request_host(host: &str) -> Result<String, ApiError> {
    validate_host(host).map_err(|e| ApiError::InvalidArgument(e.to_string()))
}

/// Register a new node in `created` status. It contributes to total
/// capacity immediately but stays unusable until its first heartbeat.
pub fn create_node(
    state: &ControlState,
    ctx: &AdminContext,
    req: &CreateNodeRequest,
) -> Result<NodeRecord, ApiError> {
    authorize(state, ctx)?;
    validate_node_id(&req.node_id)?;
    let host = validate_request_host(&req.host)?;

    let record = NodeRecord {
        node_id: req.node_id.clone(),
        host,
        port: req.port,
        status: NodeStatus::Created,
        capacity_bytes: req.storage_bytes,
        used_bytes: 0,
        chunk_count: 0,
        last_heartbeat_ms: None,
        created_ms: utc_now_ms(),
    };
    state.registry.create(record.clone())?;
    state.publish_metrics()?;

    info!(node_id = %record.node_id, capacity_bytes = record.capacity_bytes, "node created");

    Ok(record)
}

/// Confirm (or re-confirm) a node's connection parameters. Idempotent and
/// status-neutral: the node only becomes online once a heartbeat arrives.
pub async fn start_node(
    state: &ControlState,
    ctx: &AdminContext,
    node_id: &str,
    req: &StartNodeRequest,
) -> Result<NodeRecord, ApiError> {
    authorize(state, ctx)?;
    let host = validate_request_host(&req.host)?;

    // Existence first so a missing node reports 404, not a probe failure.
    state.registry.get(node_id)?;

    if state.config.probe_on_start {
        probe_node(state, &host, req.port).await?;
    }

    let record = state.registry.update(node_id, |rt| {
        if rt.record.used_bytes > req.storage_bytes {
            return Err(ApiError::UsageExceedsCapacity {
                used: rt.record.used_bytes,
                capacity: req.storage_bytes,
            });
        }
        rt.record.host = host.clone();
        rt.record.port = req.port;
        rt.record.capacity_bytes = req.storage_bytes;
        Ok(rt.record.clone())
    })?;

    // Capacity may have been re-declared.
    state.publish_metrics()?;

    info!(node_id, host = %record.host, port = record.port, "node start confirmed");

    Ok(record)
}

async fn probe_node(state: &ControlState, host: &str, port: u16) -> Result<(), ApiError> {
    let url = node_base_url(host, port);

    let mut trace_headers = HashMap::new();
    inject_trace_context(&mut trace_headers);

    let mut req = state.http_client.get(&url).timeout(PROBE_TIMEOUT);
    for (k, v) in &trace_headers {
        req = req.header(k, v);
    }

    req.send()
        .await
        .map_err(|e| ApiError::StartFailure(format!("node unreachable at {url}: {e}")))?;

    Ok(())
}

/// Admin override taking a node out of service regardless of heartbeat
/// state. Usable capacity drops immediately; node and chunk metadata stay.
/// Idempotent on already-offline nodes.
pub fn stop_node(
    state: &ControlState,
    ctx: &AdminContext,
    node_id: &str,
) -> Result<NodeRecord, ApiError> {
    authorize(state, ctx)?;

    let changed = state.registry.update_status(node_id, NodeStatus::Offline)?;
    let record = state.registry.get(node_id)?;
    if changed {
        state.publish_metrics()?;
        info!(node_id, "node stopped");
        notify_shutdown_best_effort(state, &record);
    }

    Ok(record)
}

/// Fire-and-forget request telling the node process to wind down. Reported,
/// never required: the state transition already happened.
fn notify_shutdown_best_effort(state: &ControlState, record: &NodeRecord) {
    let client = state.http_client.clone();
    let url = format!("{}/shutdown", node_base_url(&record.host, record.port));

    let mut trace_headers = HashMap::new();
    inject_trace_context(&mut trace_headers);

    tokio::spawn(async move {
        let mut req = client.post(&url).timeout(PROBE_TIMEOUT);
        for (k, v) in &trace_headers {
            req = req.header(k, v);
        }
        if let Err(e) = req.send().await {
            let e = ApiError::StopFailure(e.to_string());
            warn!(url = %url, "shutdown notification failed: {e}");
        }
    });
}

/// Remove a node from the fleet.
///
/// Without `force`, a node still holding chunks is refused and nothing
/// changes. With `force`, the node is dropped from every chunk record it
/// appears in; records left with no surviving replica are purged, which is
/// permanent data loss for those files. An online node is stopped
/// implicitly before deletion.
pub fn delete_node(
    state: &ControlState,
    ctx: &AdminContext,
    node_id: &str,
    force: bool,
) -> Result<(), ApiError> {
    authorize(state, ctx)?;

    // Precondition check, implicit stop and removal happen in one registry
    // critical section, so a concurrent commit or heartbeat cannot land
    // between the chunk-count check and the delete.
    let mut was_online = false;
    let removed = state.registry.delete_if(node_id, |rt| {
        if rt.record.chunk_count > 0 && !force {
            return Err(ApiError::NodeNotEmpty {
                node_id: node_id.to_string(),
                chunk_count: rt.record.chunk_count,
            });
        }
        if rt.record.status == NodeStatus::Online {
            was_online = true;
            rt.record.status = NodeStatus::Offline;
        }
        if force && rt.record.chunk_count > 0 {
            // Touches only the chunk column of the db, never the registry.
            purge_chunks_for_node(state, node_id)?;
        }
        Ok(())
    })?;

    if was_online {
        info!(node_id, "node stopped implicitly before delete");
        notify_shutdown_best_effort(state, &removed);
    }
    state.publish_metrics()?;

    info!(
        node_id,
        capacity_bytes = removed.capacity_bytes,
        force,
        "node deleted"
    );

    Ok(())
}

/// Drop `node_id` from every chunk record. A record whose replica list ends
/// up empty is deleted outright; the file it belonged to has lost data.
fn purge_chunks_for_node(state: &ControlState, node_id: &str) -> Result<(), ApiError> {
    let prefix = format!("{}:", common::constants::CHUNK_KEY_PREFIX);
    let mut affected: Vec<ChunkRecord> = Vec::new();

    for kv in state.db().iter() {
        let (k, v) = kv.map_err(|e| ApiError::Any(e.into()))?;
        if !k.starts_with(prefix.as_bytes()) {
            continue;
        }
        let record: ChunkRecord = serde_json::from_slice(&v).map_err(|e| ApiError::Any(e.into()))?;
        if record.replicas.iter().any(|r| r == node_id) {
            affected.push(record);
        }
    }

    for mut record in affected {
        record.replicas.retain(|r| r != node_id);
        if record.replicas.is_empty() {
            warn!(
                chunk_id = %record.chunk_id,
                file_id = %record.file_id,
                "last replica force-deleted, chunk data permanently lost"
            );
            state.db().delete(&chunk_key(&record.chunk_id))?;
        } else {
            state.db().put(&chunk_key(&record.chunk_id), &record)?;
        }
    }

    Ok(())
}
