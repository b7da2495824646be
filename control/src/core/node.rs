use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Instant;

/// Lifecycle status of a storage node.
///
/// `Created` nodes count toward total capacity but are not usable until the
/// first heartbeat arrives. Only a heartbeat makes a node `Online`; an admin
/// stop or a heartbeat timeout makes it `Offline`. Deletion removes the node
/// entirely, so there is no `Deleted` variant.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Created,
    Online,
    Offline,
}

impl NodeStatus {
    pub fn name(self) -> &'static str {
        match self {
            NodeStatus::Created => "created",
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
        }
    }

    /// Legal transitions. `Created` never comes back once left.
    pub fn can_transition(self, to: NodeStatus) -> bool {
        matches!(
            (self, to),
            (NodeStatus::Created, NodeStatus::Online)
                | (NodeStatus::Created, NodeStatus::Offline)
                | (NodeStatus::Online, NodeStatus::Offline)
                | (NodeStatus::Offline, NodeStatus::Online)
        )
    }

}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Persisted node descriptor. This is the authoritative record; everything
/// derived (capacity metrics, health scores) is recomputed from snapshots of
/// these.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub chunk_count: u64,
    pub last_heartbeat_ms: Option<i128>, // persisted wall-clock (UTC ms)
    pub created_ms: i128,
}

/// In-memory view of a node: the persisted record plus the monotonic clock
/// reading of its last heartbeat (wall clock is for display only, never for
/// timeout decisions).
#[derive(Clone, Debug)]
pub struct NodeRuntime {
    pub record: NodeRecord,
    pub last_seen: Option<Instant>,
    /// Bytes held by in-flight placements. Kept apart from the reported
    /// `used_bytes` gauge so a heartbeat usage report can never release a
    /// hold. Never persisted: pending placements do not survive a restart,
    /// so neither do their holds.
    pub reserved_bytes: u64,
}

impl NodeRuntime {
    pub fn new(record: NodeRecord) -> Self {
        Self {
            record,
            last_seen: None,
            reserved_bytes: 0,
        }
    }

    /// Reported usage plus in-flight placement holds.
    pub fn effective_used(&self) -> u64 {
        self.record.used_bytes.saturating_add(self.reserved_bytes)
    }

    pub fn available_bytes(&self) -> u64 {
        self.record
            .capacity_bytes
            .saturating_sub(self.effective_used())
    }
}
