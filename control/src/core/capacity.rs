use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::core::node::{NodeRecord, NodeRuntime, NodeStatus};

/// Derived capacity view of the fleet. Never persisted: every read is
/// recomputed from a registry snapshot so the numbers cannot drift from the
/// authoritative records.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityMetrics {
    /// Sum over every registered node, whatever its status.
    pub total_capacity: u64,
    /// Sum over online nodes only.
    pub usable_capacity: u64,
    pub online_nodes: usize,
    /// Every registered node that is not online, created ones included.
    pub offline_nodes: usize,
}

pub fn recompute(records: &[NodeRecord]) -> CapacityMetrics {
    let mut metrics = CapacityMetrics::default();
    for record in records {
        metrics.total_capacity += record.capacity_bytes;
        if record.status == NodeStatus::Online {
            metrics.usable_capacity += record.capacity_bytes;
            metrics.online_nodes += 1;
        } else {
            metrics.offline_nodes += 1;
        }
    }
    metrics
}

/// Per-node liveness score in [0, 100].
///
/// 100 with a fresh heartbeat, decaying linearly to 0 at `timeout` staleness.
/// A node that is not online, or has never heartbeated, scores 0. Scoring at
/// 0 and being offline coincide: a node stale past `timeout` is flipped
/// offline by the same sweep that would score it 0.
pub fn health_score(rt: &NodeRuntime, now: Instant, timeout: Duration) -> u8 {
    if rt.record.status != NodeStatus::Online {
        return 0;
    }
    let seen = match rt.last_seen {
        Some(seen) => seen,
        None => return 0,
    };
    let staleness = now.saturating_duration_since(seen);
    if staleness >= timeout {
        return 0;
    }
    let fraction = staleness.as_secs_f64() / timeout.as_secs_f64();
    (100.0 * (1.0 - fraction)).round() as u8
}

/// Mean of online nodes' health scores; 100 when nothing is online (an empty
/// fleet is not an unhealthy one).
pub fn global_health(runtimes: &[NodeRuntime], now: Instant, timeout: Duration) -> u8 {
    let online: Vec<_> = runtimes
        .iter()
        .filter(|rt| rt.record.status == NodeStatus::Online)
        .collect();
    if online.is_empty() {
        return 100;
    }
    let sum: u64 = online
        .iter()
        .map(|rt| health_score(rt, now, timeout) as u64)
        .sum();
    (sum / online.len() as u64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: NodeStatus, capacity: u64) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            host: "localhost".into(),
            port: 9000,
            status,
            capacity_bytes: capacity,
            used_bytes: 0,
            chunk_count: 0,
            last_heartbeat_ms: None,
            created_ms: 0,
        }
    }

    #[test]
    fn test_recompute_partitions_by_status() {
        let records = vec![
            record("a", NodeStatus::Created, 2 << 30),
            record("b", NodeStatus::Online, 3 << 30),
            record("c", NodeStatus::Offline, 1 << 30),
        ];
        let m = recompute(&records);
        assert_eq!(m.total_capacity, 6 << 30);
        assert_eq!(m.usable_capacity, 3 << 30);
        assert_eq!(m.online_nodes, 1);
        assert_eq!(m.offline_nodes, 2);
        assert!(m.usable_capacity <= m.total_capacity);
    }

    #[test]
    fn test_recompute_empty_fleet() {
        assert_eq!(recompute(&[]), CapacityMetrics::default());
    }

    #[test]
    fn test_health_decays_monotonically() {
        let timeout = Duration::from_secs(60);
        let now = Instant::now();
        let mut rt = NodeRuntime::new(record("a", NodeStatus::Online, 1024));

        rt.last_seen = Some(now);
        assert_eq!(health_score(&rt, now, timeout), 100);

        let mut prev = 100;
        for secs in [10, 30, 45, 59] {
            rt.last_seen = Some(now - Duration::from_secs(secs));
            let score = health_score(&rt, now, timeout);
            assert!(score <= prev, "score must not increase with staleness");
            assert!(score > 0);
            prev = score;
        }

        rt.last_seen = Some(now - Duration::from_secs(60));
        assert_eq!(health_score(&rt, now, timeout), 0);
    }

    #[test]
    fn test_non_online_scores_zero() {
        let timeout = Duration::from_secs(60);
        let now = Instant::now();

        let mut rt = NodeRuntime::new(record("a", NodeStatus::Created, 1024));
        assert_eq!(health_score(&rt, now, timeout), 0);

        rt.record.status = NodeStatus::Offline;
        rt.last_seen = Some(now);
        assert_eq!(health_score(&rt, now, timeout), 0);

        // Online but never heartbeated (e.g. reloaded from disk).
        rt.record.status = NodeStatus::Online;
        rt.last_seen = None;
        assert_eq!(health_score(&rt, now, timeout), 0);
    }

    #[test]
    fn test_global_health() {
        let timeout = Duration::from_secs(60);
        let now = Instant::now();

        assert_eq!(global_health(&[], now, timeout), 100);

        let mut fresh = NodeRuntime::new(record("a", NodeStatus::Online, 1024));
        fresh.last_seen = Some(now);
        let mut stale = NodeRuntime::new(record("b", NodeStatus::Online, 1024));
        stale.last_seen = Some(now - Duration::from_secs(30));
        let offline = NodeRuntime::new(record("c", NodeStatus::Offline, 1024));

        let g = global_health(&[fresh, stale, offline], now, timeout);
        // Mean of 100 and ~50; the offline node does not drag it down.
        assert!((70..=80).contains(&g), "unexpected global health {g}");
    }
}
