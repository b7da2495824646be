use anyhow::anyhow;
use std::net::SocketAddr;
use url::Url;

/// Validate a node host as it arrives from an admin request.
///
/// Hosts are stored and later interpolated into node base URLs, so anything
/// that is not a plain hostname or IP literal is rejected up front.
pub fn validate_host(host: &str) -> anyhow::Result<String> {
    let host = host.trim();
    if host.is_empty() {
        return Err(anyhow!("host cannot be empty"));
    }
    if host
        .chars()
        .any(|c| c.is_control() || c.is_whitespace() || c == '/')
    {
        return Err(anyhow!("host contains invalid characters"));
    }

    // Round-trip through the url crate to catch anything else malformed.
    Url::parse(&format!("http://{host}"))
        .map_err(|e| anyhow!("invalid host: {e}"))?
        .host_str()
        .map(|h| h.to_string())
        .ok_or_else(|| anyhow!("invalid host: {host}"))
}

/// Base URL used for best-effort calls out to a node process.
pub fn node_base_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}")
}

pub fn parse_socket_addr(listen: &str) -> anyhow::Result<SocketAddr> {
    let url = if listen.starts_with("http://") || listen.starts_with("https://") {
        Url::parse(listen)?
    } else {
        Url::parse(&format!("http://{listen}"))?
    };

    let host = url.host_str().ok_or(anyhow!("missing host in listen address"))?;
    let port = url.port().unwrap_or(80);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    Ok(addr)
}
