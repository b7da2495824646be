#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use reqwest::Client;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::schemas::{
    CommitPlacementRequest, CreateNodeRequest, HeartbeatRequest, PlaceChunkRequest,
    StartNodeRequest, SubstituteReplicaRequest,
};
use control::core::heartbeat::heartbeat_sweeper;
use control::core::registry::NodeRegistry;
use control::core::routes::{router, NodeView, NodesResponse, StatusResponse};
use control::core::state::{ControlConfig, ControlState};
use control::core::store::KvDb;

pub const GIB: u64 = 1 << 30;

pub struct TestControl {
    pub state: ControlState,
    pub url: String,
    pub addr: SocketAddr,
    pub data_dir: TempDir,
    pub shutdown_tx: watch::Sender<bool>,
    pub server_handle: JoinHandle<std::io::Result<()>>,
    pub sweeper_handle: JoinHandle<anyhow::Result<()>>,
}

impl TestControl {
    /// Fast timeouts so sweeps and expirations land within test patience.
    pub fn fast_config() -> ControlConfig {
        ControlConfig {
            heartbeat_interval: Duration::from_millis(500),
            heartbeat_timeout: Duration::from_millis(1500),
            sweep_interval: Duration::from_millis(200),
            default_replication: 1,
            admin_key: None,
            probe_on_start: false,
        }
    }

    /// Generous timeouts: a heartbeated node stays online at full health for
    /// the whole test, so assertions never race the sweeper.
    pub fn steady_config() -> ControlConfig {
        ControlConfig {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            default_replication: 1,
            admin_key: None,
            probe_on_start: false,
        }
    }

    pub async fn new() -> Result<Self> {
        Self::with_config(Self::steady_config()).await
    }

    pub async fn with_config(config: ControlConfig) -> Result<Self> {
        let data_dir = TempDir::new()?;
        let db = KvDb::open(&data_dir.path().join("index"))?;
        let registry = NodeRegistry::open(db)?;
        let state = ControlState::new(registry, config)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper_handle = tokio::spawn(heartbeat_sweeper(
            state.clone(),
            state.config.sweep_interval,
            shutdown_rx,
        ));

        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let app = router(state.clone());
        let server_handle =
            tokio::spawn(axum_server::from_tcp(listener).serve(app.into_make_service()));

        Ok(Self {
            state,
            url: format!("http://{addr}"),
            addr,
            data_dir,
            shutdown_tx,
            server_handle,
            sweeper_handle,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let _ = self.sweeper_handle.await;
        self.server_handle.abort();
        let _ = self.server_handle.await;
        Ok(())
    }
}

pub fn create_request(node_id: &str, storage_bytes: u64) -> CreateNodeRequest {
    CreateNodeRequest {
        node_id: node_id.to_string(),
        host: "localhost".to_string(),
        port: 9000,
        storage_bytes,
    }
}

pub async fn create_node(
    client: &Client,
    url: &str,
    node_id: &str,
    storage_bytes: u64,
) -> Result<reqwest::Response> {
    Ok(client
        .post(format!("{url}/nodes"))
        .json(&CreateNodeRequest {
            node_id: node_id.to_string(),
            host: "localhost".to_string(),
            port: 9000,
            storage_bytes,
        })
        .send()
        .await?)
}

pub async fn start_node(
    client: &Client,
    url: &str,
    node_id: &str,
    storage_bytes: u64,
) -> Result<reqwest::Response> {
    Ok(client
        .post(format!("{url}/nodes/{node_id}/start"))
        .json(&StartNodeRequest {
            host: "localhost".to_string(),
            port: 9000,
            storage_bytes,
        })
        .send()
        .await?)
}

pub async fn stop_node(client: &Client, url: &str, node_id: &str) -> Result<reqwest::Response> {
    Ok(client
        .post(format!("{url}/nodes/{node_id}/stop"))
        .send()
        .await?)
}

pub async fn delete_node(
    client: &Client,
    url: &str,
    node_id: &str,
    force: bool,
) -> Result<reqwest::Response> {
    Ok(client
        .delete(format!("{url}/nodes/{node_id}?force={force}"))
        .send()
        .await?)
}

pub async fn heartbeat(
    client: &Client,
    url: &str,
    node_id: &str,
    used_bytes: Option<u64>,
) -> Result<reqwest::Response> {
    Ok(client
        .post(format!("{url}/heartbeat"))
        .json(&HeartbeatRequest {
            node_id: node_id.to_string(),
            used_bytes,
        })
        .send()
        .await?)
}

pub async fn list_nodes(client: &Client, url: &str) -> Result<NodesResponse> {
    let resp = client.get(format!("{url}/nodes")).send().await?;
    if !resp.status().is_success() {
        bail!("GET /nodes failed: {}", resp.status());
    }
    Ok(resp.json().await?)
}

pub async fn cluster_status(client: &Client, url: &str) -> Result<StatusResponse> {
    let resp = client.get(format!("{url}/status")).send().await?;
    if !resp.status().is_success() {
        bail!("GET /status failed: {}", resp.status());
    }
    Ok(resp.json().await?)
}

pub async fn place_chunk(
    client: &Client,
    url: &str,
    size_bytes: u64,
    replication_factor: usize,
) -> Result<reqwest::Response> {
    Ok(client
        .post(format!("{url}/placements"))
        .json(&PlaceChunkRequest {
            size_bytes,
            replication_factor: Some(replication_factor),
        })
        .send()
        .await?)
}

pub async fn substitute_replica(
    client: &Client,
    url: &str,
    placement_id: &str,
    failed_node: &str,
) -> Result<reqwest::Response> {
    Ok(client
        .post(format!("{url}/placements/{placement_id}/substitute"))
        .json(&SubstituteReplicaRequest {
            failed_node: failed_node.to_string(),
        })
        .send()
        .await?)
}

pub async fn commit_placement(
    client: &Client,
    url: &str,
    placement_id: &str,
    chunk_id: &str,
    file_id: &str,
) -> Result<reqwest::Response> {
    Ok(client
        .post(format!("{url}/placements/{placement_id}/commit"))
        .json(&CommitPlacementRequest {
            chunk_id: chunk_id.to_string(),
            file_id: file_id.to_string(),
        })
        .send()
        .await?)
}

pub async fn abort_placement(
    client: &Client,
    url: &str,
    placement_id: &str,
) -> Result<reqwest::Response> {
    Ok(client
        .delete(format!("{url}/placements/{placement_id}"))
        .send()
        .await?)
}

pub fn find_node<'a>(resp: &'a NodesResponse, node_id: &str) -> Option<&'a NodeView> {
    resp.nodes.iter().find(|n| n.node_id == node_id)
}

pub async fn wait_until<F, Fut>(timeout_ms: u64, mut cond: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if cond().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout_ms}ms");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
