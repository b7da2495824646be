use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateNodeRequest {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub storage_bytes: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartNodeRequest {
    pub host: String,
    pub port: u16,
    pub storage_bytes: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub used_bytes: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub struct DeleteNodeParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlaceChunkRequest {
    pub size_bytes: u64,
    pub replication_factor: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubstituteReplicaRequest {
    pub failed_node: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommitPlacementRequest {
    pub chunk_id: String,
    pub file_id: String,
}
