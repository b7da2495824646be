use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use common::api_error::ApiError;
use common::schemas::HeartbeatRequest;
use common::time_utils::utc_now_ms;

use crate::core::node::NodeStatus;
use crate::core::state::ControlState;

/// Liveness ingress. Unknown nodes are rejected so the caller re-registers;
/// known nodes get their clocks stamped and, if not already online, flip
/// online. A reported used-bytes figure above capacity is clamped rather
/// than rejected, liveness must never be lost to a bad gauge. The report
/// only moves the gauge; placement holds are tracked beside it and stay
/// untouched.
pub fn on_heartbeat(state: &ControlState, req: &HeartbeatRequest) -> Result<(), ApiError> {
    let status_changed = state.registry.update(&req.node_id, |rt| {
        rt.last_seen = Some(Instant::now());
        rt.record.last_heartbeat_ms = Some(utc_now_ms());

        if let Some(used) = req.used_bytes {
            if used > rt.record.capacity_bytes {
                warn!(
                    node_id = %rt.record.node_id,
                    used,
                    capacity = rt.record.capacity_bytes,
                    "heartbeat reported usage above capacity, clamping"
                );
            }
            rt.record.used_bytes = used.min(rt.record.capacity_bytes);
        }

        let from = rt.record.status;
        if from != NodeStatus::Online {
            rt.record.status = NodeStatus::Online;
            Ok(Some(from))
        } else {
            Ok(None)
        }
    })?;

    if let Some(from) = status_changed {
        info!(node_id = %req.node_id, from = %from, "node online after heartbeat");
        state.publish_metrics()?;
    }

    Ok(())
}

/// Background sweep flipping online nodes past the heartbeat timeout to
/// offline. Runs until the shutdown signal; independent of any request's
/// lifetime.
pub async fn heartbeat_sweeper(
    state: ControlState,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(interval);
    let timeout = state.config.heartbeat_timeout;

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
        }

        match state.registry.expire_stale(timeout) {
            Ok(flipped) => {
                if !flipped.is_empty() {
                    for node_id in &flipped {
                        warn!(node_id = %node_id, timeout_secs = timeout.as_secs(), "node offline after heartbeat timeout");
                    }
                    if let Err(e) = state.publish_metrics() {
                        warn!("failed to publish capacity metrics: {e}");
                    }
                }
            }
            Err(e) => {
                warn!("heartbeat sweep failed: {e}");
            }
        }
    }

    info!("heartbeat sweeper stopped");

    Ok(())
}
