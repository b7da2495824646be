use anyhow::anyhow;
use serde::Serialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use common::api_error::ApiError;

use crate::core::capacity::health_score;
use crate::core::node::{NodeRuntime, NodeStatus};
use crate::core::state::ControlState;
use crate::core::store::{chunk_key, ChunkRecord};

/// An in-flight chunk placement. Capacity is reserved on every selected node
/// at selection time; the attempt is resolved by `commit` (record the chunk)
/// or `abort` (roll the reservations back). `substitute` swaps out one node
/// the caller failed to transfer to, without re-running the whole selection.
#[derive(Clone, Debug, Serialize)]
pub struct PlacementAttempt {
    pub placement_id: String,
    pub size_bytes: u64,
    pub replication_factor: usize,
    pub replicas: Vec<String>,
    /// Nodes reported failed during this attempt; never re-picked.
    pub failed: Vec<String>,
}

/// Rank placement candidates: online, enough free room, not excluded;
/// ordered by health then free-capacity fraction, both descending, with
/// ascending node id as the deterministic tie-break.
///
/// Integer scoring (health and free-permille both scale to 0..=1000) keeps
/// the order exact and reproducible across runs.
pub fn rank_candidates(
    runtimes: &[NodeRuntime],
    size_bytes: u64,
    now: Instant,
    timeout: Duration,
    exclude: &HashSet<String>,
) -> Vec<String> {
    let mut scored: Vec<(u64, &str)> = runtimes
        .iter()
        .filter(|rt| {
            rt.record.status == NodeStatus::Online
                && rt.available_bytes() >= size_bytes
                && !exclude.contains(&rt.record.node_id)
        })
        .map(|rt| {
            let health = health_score(rt, now, timeout) as u64;
            let free_permille = if rt.record.capacity_bytes == 0 {
                0
            } else {
                rt.available_bytes() * 1000 / rt.record.capacity_bytes
            };
            (health * 10 + free_permille, rt.record.node_id.as_str())
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored.into_iter().map(|(_, id)| id.to_string()).collect()
}

fn reserve_first(
    state: &ControlState,
    candidates: &[String],
    size_bytes: u64,
    taken: &mut Vec<String>,
    want: usize,
) -> Result<(), ApiError> {
    for node_id in candidates {
        if taken.len() == want {
            break;
        }
        if state.registry.try_reserve(node_id, size_bytes)? {
            taken.push(node_id.clone());
        }
    }
    Ok(())
}

fn rollback(state: &ControlState, node_ids: &[String], size_bytes: u64) {
    for node_id in node_ids {
        if let Err(e) = state.registry.release(node_id, size_bytes) {
            warn!(node_id = %node_id, "failed to release reservation: {e}");
        }
    }
}

/// Choose `replication_factor` distinct online nodes for a chunk of
/// `size_bytes`, reserving the bytes on each. All-or-nothing: on failure no
/// reservation is left behind.
pub fn place_chunk(
    state: &ControlState,
    size_bytes: u64,
    replication_factor: usize,
) -> Result<PlacementAttempt, ApiError> {
    let runtimes = state.registry.snapshot()?;
    let candidates = rank_candidates(
        &runtimes,
        size_bytes,
        Instant::now(),
        state.config.heartbeat_timeout,
        &HashSet::new(),
    );

    let mut replicas = Vec::with_capacity(replication_factor);
    reserve_first(state, &candidates, size_bytes, &mut replicas, replication_factor)?;

    if replicas.len() < replication_factor {
        let available = replicas.len();
        rollback(state, &replicas, size_bytes);
        return Err(ApiError::InsufficientCapacity {
            requested: replication_factor,
            available,
        });
    }

    let attempt = PlacementAttempt {
        placement_id: Uuid::new_v4().to_string(),
        size_bytes,
        replication_factor,
        replicas,
        failed: Vec::new(),
    };

    info!(
        placement_id = %attempt.placement_id,
        size_bytes,
        replicas = ?attempt.replicas,
        "chunk placement reserved"
    );

    state
        .placements
        .write()
        .map_err(|e| ApiError::Any(anyhow!("placements lock poisoned: {e}")))?
        .insert(attempt.placement_id.clone(), attempt.clone());

    Ok(attempt)
}

/// Replace one node of a pending placement after the caller reports the
/// transfer to it failed. The failed node's reservation is released and it
/// is never re-picked within this attempt. Returns the replacement node id.
pub fn substitute_replica(
    state: &ControlState,
    placement_id: &str,
    failed_node: &str,
) -> Result<String, ApiError> {
    let mut placements = state
        .placements
        .write()
        .map_err(|e| ApiError::Any(anyhow!("placements lock poisoned: {e}")))?;
    let attempt = placements
        .get_mut(placement_id)
        .ok_or_else(|| ApiError::PlacementNotFound(placement_id.to_string()))?;

    let pos = attempt
        .replicas
        .iter()
        .position(|id| id == failed_node)
        .ok_or_else(|| ApiError::NodeNotFound(failed_node.to_string()))?;
    attempt.replicas.remove(pos);
    attempt.failed.push(failed_node.to_string());

    if let Err(e) = state.registry.release(failed_node, attempt.size_bytes) {
        // The node may have been force-deleted since selection.
        warn!(node_id = %failed_node, "could not release failed replica: {e}");
    }

    let exclude: HashSet<String> = attempt
        .replicas
        .iter()
        .chain(attempt.failed.iter())
        .cloned()
        .collect();
    let runtimes = state.registry.snapshot()?;
    let candidates = rank_candidates(
        &runtimes,
        attempt.size_bytes,
        Instant::now(),
        state.config.heartbeat_timeout,
        &exclude,
    );

    reserve_first(
        state,
        &candidates,
        attempt.size_bytes,
        &mut attempt.replicas,
        attempt.replication_factor,
    )?;

    if attempt.replicas.len() < attempt.replication_factor {
        // Attempt stays pending with one replica short; the caller decides
        // whether to retry substitution later or abort.
        return Err(ApiError::InsufficientCapacity {
            requested: attempt.replication_factor,
            available: attempt.replicas.len(),
        });
    }

    let replacement = attempt
        .replicas
        .last()
        .cloned()
        .ok_or_else(|| ApiError::Any(anyhow!("placement has no replicas after substitution")))?;

    info!(
        placement_id = %placement_id,
        failed_node,
        replacement = %replacement,
        "replica substituted"
    );

    Ok(replacement)
}

/// Resolve a placement after a successful transfer: persist the chunk record
/// and, on each replica, convert the hold into recorded usage and bump the
/// chunk count.
pub fn commit_placement(
    state: &ControlState,
    placement_id: &str,
    chunk_id: &str,
    file_id: &str,
) -> Result<ChunkRecord, ApiError> {
    let attempt = state
        .placements
        .write()
        .map_err(|e| ApiError::Any(anyhow!("placements lock poisoned: {e}")))?
        .remove(placement_id)
        .ok_or_else(|| ApiError::PlacementNotFound(placement_id.to_string()))?;

    let record = ChunkRecord::new(
        chunk_id.to_string(),
        file_id.to_string(),
        attempt.size_bytes,
        attempt.replicas.clone(),
    );
    state.db().put(&chunk_key(chunk_id), &record)?;

    for node_id in &attempt.replicas {
        let bumped = state.registry.update(node_id, |rt| {
            rt.reserved_bytes = rt.reserved_bytes.saturating_sub(attempt.size_bytes);
            rt.record.used_bytes = rt.record.used_bytes.saturating_add(attempt.size_bytes);
            rt.record.chunk_count += 1;
            Ok(())
        });
        if let Err(e) = bumped {
            warn!(node_id = %node_id, chunk_id, "could not bump chunk count: {e}");
        }
    }

    info!(chunk_id, file_id, replicas = ?record.replicas, "chunk placement committed");

    Ok(record)
}

/// Resolve a placement after a failed transfer: release every reservation.
pub fn abort_placement(state: &ControlState, placement_id: &str) -> Result<(), ApiError> {
    let attempt = state
        .placements
        .write()
        .map_err(|e| ApiError::Any(anyhow!("placements lock poisoned: {e}")))?
        .remove(placement_id)
        .ok_or_else(|| ApiError::PlacementNotFound(placement_id.to_string()))?;

    rollback(state, &attempt.replicas, attempt.size_bytes);

    info!(placement_id = %placement_id, "chunk placement aborted");

    Ok(())
}
