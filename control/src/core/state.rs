use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

use common::api_error::ApiError;

use crate::core::capacity::{self, CapacityMetrics};
use crate::core::placement::PlacementAttempt;
use crate::core::registry::NodeRegistry;
use crate::core::store::KvDb;

#[derive(Clone, Debug)]
pub struct ControlConfig {
    /// Expected node call-in interval; informational, echoed to operators.
    pub heartbeat_interval: Duration,
    /// Staleness after which an online node is considered dead.
    pub heartbeat_timeout: Duration,
    /// Sweep tick for the timeout check.
    pub sweep_interval: Duration,
    /// Replication factor applied when a placement request leaves it unset.
    pub default_replication: usize,
    /// Admin key required on lifecycle and fleet-view calls; `None` disables
    /// the check.
    pub admin_key: Option<String>,
    /// Probe node reachability on `start` before confirming parameters.
    pub probe_on_start: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            default_replication: 3,
            admin_key: None,
            probe_on_start: false,
        }
    }
}

#[derive(Clone)]
pub struct ControlState {
    pub http_client: Client,
    pub registry: NodeRegistry,
    pub placements: Arc<RwLock<HashMap<String, PlacementAttempt>>>,
    pub config: ControlConfig,

    metrics_tx: Arc<watch::Sender<CapacityMetrics>>,
}

impl ControlState {
    pub fn new(registry: NodeRegistry, config: ControlConfig) -> anyhow::Result<Self> {
        let initial = capacity::recompute(&registry.list().map_err(anyhow::Error::new)?);
        let (metrics_tx, _metrics_rx) = watch::channel(initial);
        Ok(Self {
            http_client: Client::new(),
            registry,
            placements: Arc::new(RwLock::new(HashMap::new())),
            config,
            metrics_tx: Arc::new(metrics_tx),
        })
    }

    pub fn db(&self) -> &KvDb {
        self.registry.db()
    }

    /// Recompute capacity from the current registry snapshot and push the
    /// result to subscribers. Called after any status or membership change.
    pub fn publish_metrics(&self) -> Result<CapacityMetrics, ApiError> {
        let metrics = capacity::recompute(&self.registry.list()?);
        self.metrics_tx.send_replace(metrics);
        Ok(metrics)
    }

    /// Push-capable capacity feed; external callers pick their own cadence
    /// instead of polling on a fixed loop.
    pub fn subscribe_metrics(&self) -> watch::Receiver<CapacityMetrics> {
        self.metrics_tx.subscribe()
    }

    pub fn current_metrics(&self) -> CapacityMetrics {
        *self.metrics_tx.borrow()
    }
}
