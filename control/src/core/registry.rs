use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::info;

use common::api_error::ApiError;

use crate::core::node::{NodeRecord, NodeRuntime, NodeStatus};
use crate::core::store::{node_key, KvDb};

/// Authoritative store of node descriptors.
///
/// All mutations go through the single write lock, which serializes
/// concurrent admin operations and heartbeat-driven flips on the same node.
/// Readers clone snapshots out and never observe a half-updated node.
/// Records are persisted to RocksDB before the in-memory map changes, so a
/// failed write never leaves the two views disagreeing.
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, NodeRuntime>>>,
    db: KvDb,
}

impl NodeRegistry {
    /// Open the registry, reloading persisted node records. Reloaded nodes
    /// have no heartbeat on the monotonic clock yet; online ones that fail to
    /// call in again are demoted by the next sweep.
    pub fn open(db: KvDb) -> anyhow::Result<Self> {
        let mut nodes = HashMap::new();
        let prefix = format!("{}:", common::constants::NODE_KEY_PREFIX);
        for kv in db.iter() {
            let (k, v) = kv?;
            if !k.starts_with(prefix.as_bytes()) {
                continue;
            }
            let record: NodeRecord = serde_json::from_slice(&v)?;
            info!(node_id = %record.node_id, status = %record.status, "reloaded node");
            nodes.insert(record.node_id.clone(), NodeRuntime::new(record));
        }
        Ok(Self {
            nodes: Arc::new(RwLock::new(nodes)),
            db,
        })
    }

    pub fn db(&self) -> &KvDb {
        &self.db
    }

    fn read_nodes(&self) -> Result<RwLockReadGuard<'_, HashMap<String, NodeRuntime>>, ApiError> {
        self.nodes
            .read()
            .map_err(|e| ApiError::Any(anyhow!("nodes lock poisoned: {e}")))
    }

    fn write_nodes(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, NodeRuntime>>, ApiError> {
        self.nodes
            .write()
            .map_err(|e| ApiError::Any(anyhow!("nodes lock poisoned: {e}")))
    }

    /// Register a new node. Fails without mutating anything if the id is
    /// already taken.
    pub fn create(&self, record: NodeRecord) -> Result<(), ApiError> {
        let mut nodes = self.write_nodes()?;
        if nodes.contains_key(&record.node_id) {
            return Err(ApiError::DuplicateNode(record.node_id));
        }
        self.db.put(&node_key(&record.node_id), &record)?;
        nodes.insert(record.node_id.clone(), NodeRuntime::new(record));
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Result<NodeRecord, ApiError> {
        let nodes = self.read_nodes()?;
        nodes
            .get(node_id)
            .map(|rt| rt.record.clone())
            .ok_or_else(|| ApiError::NodeNotFound(node_id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<NodeRecord>, ApiError> {
        let nodes = self.read_nodes()?;
        let mut records: Vec<_> = nodes.values().map(|rt| rt.record.clone()).collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(records)
    }

    /// Snapshot including the monotonic heartbeat clock, for health scoring
    /// and placement ranking.
    pub fn snapshot(&self) -> Result<Vec<NodeRuntime>, ApiError> {
        let nodes = self.read_nodes()?;
        let mut runtimes: Vec<_> = nodes.values().cloned().collect();
        runtimes.sort_by(|a, b| a.record.node_id.cmp(&b.record.node_id));
        Ok(runtimes)
    }

    /// Apply `f` to one node under the write lock and persist the result.
    /// `f` runs against a staged copy that only replaces the live node after
    /// the record is persisted, so neither a rejection by `f` nor a failed
    /// write leaves the in-memory map ahead of disk.
    pub fn update<R>(
        &self,
        node_id: &str,
        f: impl FnOnce(&mut NodeRuntime) -> Result<R, ApiError>,
    ) -> Result<R, ApiError> {
        let mut nodes = self.write_nodes()?;
        let rt = nodes
            .get_mut(node_id)
            .ok_or_else(|| ApiError::NodeNotFound(node_id.to_string()))?;
        let mut staged = rt.clone();
        let out = f(&mut staged)?;
        self.db.put(&node_key(node_id), &staged.record)?;
        *rt = staged;
        Ok(out)
    }

    /// Transition-table-checked status change. Returns whether the status
    /// actually changed; a same-state update is a no-op, not an error.
    pub fn update_status(&self, node_id: &str, to: NodeStatus) -> Result<bool, ApiError> {
        self.update(node_id, |rt| {
            let from = rt.record.status;
            if from == to {
                return Ok(false);
            }
            if !from.can_transition(to) {
                return Err(ApiError::InvalidTransition {
                    from: from.name(),
                    to: to.name(),
                });
            }
            rt.record.status = to;
            Ok(true)
        })
    }

    /// Absolute used-bytes plus a chunk-count delta, as reported by chunk
    /// bookkeeping. Rejects usage above capacity outright.
    pub fn update_usage(
        &self,
        node_id: &str,
        used_bytes: u64,
        chunk_count_delta: i64,
    ) -> Result<(), ApiError> {
        self.update(node_id, |rt| {
            if used_bytes > rt.record.capacity_bytes {
                return Err(ApiError::UsageExceedsCapacity {
                    used: used_bytes,
                    capacity: rt.record.capacity_bytes,
                });
            }
            rt.record.used_bytes = used_bytes;
            rt.record.chunk_count = if chunk_count_delta.is_negative() {
                rt.record.chunk_count.saturating_sub(chunk_count_delta.unsigned_abs())
            } else {
                rt.record.chunk_count.saturating_add(chunk_count_delta as u64)
            };
            Ok(())
        })
    }

    /// Reserve `bytes` on an online node if they fit over reported usage
    /// plus existing holds. Check-and-set under the write lock: two
    /// concurrent placements cannot both claim the same final bytes. Holds
    /// live next to the `used_bytes` gauge, not inside it, so a heartbeat
    /// usage report cannot release them.
    pub fn try_reserve(&self, node_id: &str, bytes: u64) -> Result<bool, ApiError> {
        self.update(node_id, |rt| {
            if rt.record.status != NodeStatus::Online || rt.available_bytes() < bytes {
                return Ok(false);
            }
            rt.reserved_bytes += bytes;
            Ok(true)
        })
    }

    /// Drop a hold taken with `try_reserve`.
    pub fn release(&self, node_id: &str, bytes: u64) -> Result<(), ApiError> {
        self.update(node_id, |rt| {
            rt.reserved_bytes = rt.reserved_bytes.saturating_sub(bytes);
            Ok(())
        })
    }

    /// Flip online nodes whose last heartbeat is older than `timeout` to
    /// offline. Returns the ids that changed. Nodes reloaded from disk with
    /// no heartbeat yet count as infinitely stale.
    pub fn expire_stale(&self, timeout: Duration) -> Result<Vec<String>, ApiError> {
        let mut flipped = Vec::new();
        let mut nodes = self.write_nodes()?;
        let now = Instant::now();

        for rt in nodes.values_mut() {
            if rt.record.status != NodeStatus::Online {
                continue;
            }
            let stale = match rt.last_seen {
                Some(seen) => now.saturating_duration_since(seen) > timeout,
                None => true,
            };
            if stale {
                let mut staged = rt.record.clone();
                staged.status = NodeStatus::Offline;
                self.db.put(&node_key(&staged.node_id), &staged)?;
                rt.record = staged;
                flipped.push(rt.record.node_id.clone());
            }
        }

        Ok(flipped)
    }

    /// Check a precondition and remove the node in one critical section.
    /// `f` sees the current node under the write lock; if it accepts, the
    /// node is removed before the lock drops, so no concurrent mutation (a
    /// commit bumping `chunk_count`, a heartbeat flipping status) can slip
    /// between the check and the removal. `f` may adjust the node (e.g. an
    /// implicit stop) before removal.
    pub fn delete_if(
        &self,
        node_id: &str,
        f: impl FnOnce(&mut NodeRuntime) -> Result<(), ApiError>,
    ) -> Result<NodeRecord, ApiError> {
        let mut nodes = self.write_nodes()?;
        let rt = nodes
            .get_mut(node_id)
            .ok_or_else(|| ApiError::NodeNotFound(node_id.to_string()))?;
        f(rt)?;
        self.db.delete(&node_key(node_id))?;
        let rt = nodes
            .remove(node_id)
            .ok_or_else(|| ApiError::NodeNotFound(node_id.to_string()))?;
        Ok(rt.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, capacity: u64) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            host: "localhost".into(),
            port: 9000,
            status: NodeStatus::Created,
            capacity_bytes: capacity,
            used_bytes: 0,
            chunk_count: 0,
            last_heartbeat_ms: None,
            created_ms: 0,
        }
    }

    fn open_registry(dir: &TempDir) -> NodeRegistry {
        let db = KvDb::open(&dir.path().join("index")).unwrap();
        NodeRegistry::open(db).unwrap()
    }

    #[test]
    fn test_create_rejects_duplicate_without_mutation() {
        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir);

        registry.create(record("n1", 100)).unwrap();
        let err = registry.create(record("n1", 999)).unwrap_err();
        assert!(matches!(err, ApiError::DuplicateNode(_)));

        assert_eq!(registry.get("n1").unwrap().capacity_bytes, 100);
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_update_usage_rejects_over_capacity() {
        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir);
        registry.create(record("n1", 100)).unwrap();

        let err = registry.update_usage("n1", 150, 0).unwrap_err();
        assert!(matches!(err, ApiError::UsageExceedsCapacity { .. }));
        assert_eq!(registry.get("n1").unwrap().used_bytes, 0);

        registry.update_usage("n1", 80, 2).unwrap();
        let rec = registry.get("n1").unwrap();
        assert_eq!(rec.used_bytes, 80);
        assert_eq!(rec.chunk_count, 2);

        registry.update_usage("n1", 60, -1).unwrap();
        let rec = registry.get("n1").unwrap();
        assert_eq!(rec.used_bytes, 60);
        assert_eq!(rec.chunk_count, 1);
    }

    #[test]
    fn test_reserve_only_on_online_nodes_with_room() {
        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir);
        registry.create(record("n1", 100)).unwrap();

        // Created, not online: no reservation.
        assert!(!registry.try_reserve("n1", 10).unwrap());

        registry.update_status("n1", NodeStatus::Online).unwrap();
        assert!(registry.try_reserve("n1", 60).unwrap());
        assert!(!registry.try_reserve("n1", 60).unwrap());
        assert!(registry.try_reserve("n1", 40).unwrap());
        registry.release("n1", 40).unwrap();

        // Holds live beside the usage gauge, not inside it.
        assert_eq!(registry.get("n1").unwrap().used_bytes, 0);
        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot[0].reserved_bytes, 60);
        assert_eq!(snapshot[0].available_bytes(), 40);
    }

    #[test]
    fn test_hold_survives_usage_report() {
        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir);
        registry.create(record("n1", 100)).unwrap();
        registry.update_status("n1", NodeStatus::Online).unwrap();

        assert!(registry.try_reserve("n1", 60).unwrap());
        registry.update_usage("n1", 0, 0).unwrap();

        // The zeroed gauge does not free the held bytes.
        assert!(!registry.try_reserve("n1", 60).unwrap());
        assert!(registry.try_reserve("n1", 40).unwrap());
    }

    #[test]
    fn test_delete_if_checks_and_removes_atomically() {
        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir);
        registry.create(record("n1", 100)).unwrap();
        registry.update_usage("n1", 10, 1).unwrap();

        let err = registry
            .delete_if("n1", |rt| {
                if rt.record.chunk_count > 0 {
                    return Err(ApiError::NodeNotEmpty {
                        node_id: rt.record.node_id.clone(),
                        chunk_count: rt.record.chunk_count,
                    });
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, ApiError::NodeNotEmpty { .. }));
        assert!(registry.get("n1").is_ok());

        registry.update_usage("n1", 0, -1).unwrap();
        let removed = registry.delete_if("n1", |_| Ok(())).unwrap();
        assert_eq!(removed.node_id, "n1");
        assert!(matches!(
            registry.get("n1").unwrap_err(),
            ApiError::NodeNotFound(_)
        ));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir);
        registry.create(record("n1", 100)).unwrap();
        registry.update_status("n1", NodeStatus::Online).unwrap();
        registry.update_status("n1", NodeStatus::Offline).unwrap();

        let err = registry
            .update_status("n1", NodeStatus::Created)
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidTransition { .. }));

        // Same-state update is a no-op, not an error.
        assert!(!registry.update_status("n1", NodeStatus::Offline).unwrap());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let registry = open_registry(&dir);
            registry.create(record("n1", 100)).unwrap();
            registry.update_status("n1", NodeStatus::Online).unwrap();
        }

        let registry = open_registry(&dir);
        let rec = registry.get("n1").unwrap();
        assert_eq!(rec.capacity_bytes, 100);
        assert_eq!(rec.status, NodeStatus::Online);

        // The monotonic heartbeat clock does not survive a restart, so the
        // reloaded node is immediately stale.
        let flipped = registry.expire_stale(Duration::from_secs(60)).unwrap();
        assert_eq!(flipped, vec!["n1".to_string()]);
        assert_eq!(registry.get("n1").unwrap().status, NodeStatus::Offline);
    }
}
