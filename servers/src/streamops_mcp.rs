//! # StreamOps MCP Proxy
//!
//! Exposes a fixed set of StreamOps REST calls as MCP tools over stdio.
//! Requests arrive as line-delimited JSON-RPC 2.0 on stdin and responses are
//! written to stdout. Logs go to stderr (and the log directory, if set).
//!
//! The process exits when stdin closes. Configuration errors exit non-zero
//! before any request is read.

use anyhow::{Context, Result};
use clap::Parser;
use lib_streamops::configs::{load_config, load_dotenv, ClientConfig};
use lib_streamops::loggers::{init_tracing, LogOptions};
use lib_streamops::retrieve::StreamOpsApi;
use tokio::io::BufReader;

mod mcp_logic;
use mcp_logic::stdio::McpServer;

#[derive(Parser, Debug)]
#[command(about = "StreamOps MCP stdio tool proxy", version)]
struct Cli {
    #[command(flatten)]
    config: ClientConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let cli = Cli::parse();
    let settings = load_config(cli.config).context("invalid configuration")?;

    let _guard = init_tracing(&LogOptions {
        app_name: "streamops_mcp".to_string(),
        level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
    })?;

    let api = StreamOpsApi::from_settings(&settings).context("could not create API client")?;
    tracing::info!("MCP proxy ready for {}", settings.api_url);

    let server = McpServer::new(api);
    server
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("stdio transport failed")?;
    Ok(())
}
