//! HTTP/WebSocket server (`cutover serve`).

use anyhow::Result;
use std::sync::Arc;

use cutover::config::CutoverConfig;
use cutover::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config: &CutoverConfig,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
) -> Result<()> {
    let engine = super::open_engine(config)?;
    let server = ServerConfig {
        host: host.unwrap_or_else(|| config.toml.server.host.clone()),
        port: port.unwrap_or(config.toml.server.port),
        dev_mode: dev,
    };
    start_server(Arc::new(engine), server).await
}
