use clap::Parser;
use reqwest::Client;

use common::constants::ADMIN_KEY_HEADER;
use common::time_utils::ms_to_rfc3339;

use crate::core::routes::{NodesResponse, StatusResponse};

#[derive(Parser, Debug, Clone)]
pub struct StatusArgs {
    /// Control-plane base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Admin key, if the server requires one
    #[arg(long)]
    admin_key: Option<String>,
}

pub async fn status(args: StatusArgs) -> anyhow::Result<()> {
    let client = Client::new();

    let status: StatusResponse = get_json(&client, &args, "/status").await?;
    let nodes: NodesResponse = get_json(&client, &args, "/nodes").await?;

    let m = &status.capacity_metrics;
    println!("Cluster status");
    println!("  Total capacity:   {}", format_bytes(m.total_capacity));
    println!("  Usable capacity:  {}", format_bytes(m.usable_capacity));
    println!(
        "  Nodes:            {} total, {} online, {} offline",
        status.total_nodes, m.online_nodes, m.offline_nodes
    );
    println!("  Global health:    {}/100", status.global_health);
    println!();

    println!(
        "{:<20} {:<22} {:<8} {:>12} {:>12} {:>7} {:>7}  {}",
        "NODE", "ADDRESS", "STATUS", "CAPACITY", "USED", "CHUNKS", "HEALTH", "LAST HEARTBEAT"
    );
    for n in &nodes.nodes {
        println!(
            "{:<20} {:<22} {:<8} {:>12} {:>12} {:>7} {:>7}  {}",
            n.node_id,
            format!("{}:{}", n.host, n.port),
            n.status.to_string(),
            format_bytes(n.storage_capacity),
            format_bytes(n.storage_used),
            n.chunk_count,
            n.health_score,
            n.last_heartbeat
                .map(ms_to_rfc3339)
                .unwrap_or_else(|| "never".to_string()),
        );
    }

    Ok(())
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &Client,
    args: &StatusArgs,
    path: &str,
) -> anyhow::Result<T> {
    let mut req = client.get(format!("{}{}", args.url.trim_end_matches('/'), path));
    if let Some(key) = &args.admin_key {
        req = req.header(ADMIN_KEY_HEADER, key);
    }
    let resp = req.send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("{} returned {}: {}", path, resp.status(), resp.text().await?);
    }
    Ok(resp.json::<T>().await?)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::format_bytes;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(5 << 30), "5.00 GiB");
    }
}
