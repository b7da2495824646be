use axum_server::Server;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use common::url_utils::parse_socket_addr;

use crate::core::heartbeat::heartbeat_sweeper;
use crate::core::registry::NodeRegistry;
use crate::core::routes::router;
use crate::core::state::{ControlConfig, ControlState};
use crate::core::store::KvDb;

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// RocksDB directory for node and chunk records
    #[arg(long, default_value = "./data/index")]
    index: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Expected heartbeat interval (seconds)
    #[arg(long, default_value_t = 30)]
    hb_interval_secs: u64,

    /// Heartbeat timeout before an online node is marked offline (seconds)
    #[arg(long, default_value_t = 60)]
    hb_timeout_secs: u64,

    /// Timeout sweep interval (seconds)
    #[arg(long, default_value_t = 10)]
    sweep_secs: u64,

    /// Replication factor used when a placement request does not set one
    #[arg(long, default_value_t = 3)]
    default_replication: usize,

    /// Admin key required on lifecycle and fleet-view endpoints
    #[arg(long)]
    admin_key: Option<String>,

    /// Probe node reachability before confirming a start request
    #[arg(long, default_value_t = false)]
    probe_on_start: bool,
}

pub async fn serve(serve_args: ServeArgs) -> anyhow::Result<()> {
    let db = KvDb::open(&serve_args.index)?;
    let registry = NodeRegistry::open(db)?;

    let config = ControlConfig {
        heartbeat_interval: Duration::from_secs(serve_args.hb_interval_secs),
        heartbeat_timeout: Duration::from_secs(serve_args.hb_timeout_secs),
        sweep_interval: Duration::from_secs(serve_args.sweep_secs),
        default_replication: serve_args.default_replication,
        admin_key: serve_args.admin_key.clone(),
        probe_on_start: serve_args.probe_on_start,
    };
    let state = ControlState::new(registry, config)?;

    // Spawn the heartbeat timeout sweeper
    let (shutdown_tx, shutdown_rx) = watch::channel::<bool>(false);
    let sweeper_handle = tokio::spawn(heartbeat_sweeper(
        state.clone(),
        state.config.sweep_interval,
        shutdown_rx,
    ));

    let app = router(state);

    let socket_addr = parse_socket_addr(&serve_args.listen)?;
    let server = Server::bind(socket_addr).serve(app.into_make_service());

    info!("listening on {}", serve_args.listen);

    // Graceful shutdown: ctrl+c
    tokio::select! {
        res = server => { res?; }
        _ = tokio::signal::ctrl_c() => {}
    }

    // Stop sweeper
    let _ = shutdown_tx.send(true);
    let _ = sweeper_handle.await;

    Ok(())
}
